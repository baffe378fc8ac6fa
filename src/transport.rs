//! External collaborators (§6): the RPC transport stub, connection factory,
//! clock source and EPICS importer. These are trait seams the core depends
//! on; none are implemented here — the core's job starts once a concrete
//! transport hands it messages.

use std::pin::Pin;
use std::time::Duration;

use futures_util::Stream;

use crate::error::DpError;
use crate::frame::IngestionFrame;
use crate::raw_block::MessageTime;
use crate::request::DataRequest;
use crate::time::TimeInstant;

/// One `QueryDataResponse` projected to the fields the core consumes.
#[derive(Debug, Clone)]
pub enum RawQueryMessage {
    Data {
        time: MessageTime,
        columns: Vec<crate::frame::DataColumn>,
        payload_bytes: u64,
    },
    Exceptional { status: String, message: String },
}

pub type QueryMessageStream = Pin<Box<dyn Stream<Item = Result<RawQueryMessage, DpError>> + Send>>;

/// The Query Service's RPC surface, as consumed by the multi-stream
/// recoverer. Implementations speak whatever wire protocol the transport
/// stub uses; that stub is out of scope for this crate.
#[async_trait::async_trait]
pub trait QueryTransport: Send + Sync {
    /// Server-streaming: one outbound request, many inbound messages.
    async fn open_backward(&self, subrequest: &DataRequest) -> Result<QueryMessageStream, DpError>;

    /// Paired forward/backward streams; the recoverer reads the backward half.
    async fn open_bidirectional(&self, subrequest: &DataRequest) -> Result<QueryMessageStream, DpError>;
}

/// One `IngestDataResponse` projected to the fields the core consumes.
#[derive(Debug, Clone)]
pub enum IngestAck {
    Ack,
    Exceptional { status: String, message: String },
}

pub type IngestAckStream = Pin<Box<dyn Stream<Item = Result<IngestAck, DpError>> + Send>>;

/// The Ingestion Service's bidirectional RPC surface, as consumed by the
/// streaming ingest processor (§4.6).
#[async_trait::async_trait]
pub trait IngestionTransport: Send + Sync {
    /// Opens the paired forward/backward streams and returns a sink for
    /// outbound request messages plus a stream of inbound acknowledgements.
    async fn open_bidirectional(
        &self,
    ) -> Result<(Box<dyn IngestRequestSink>, IngestAckStream), DpError>;
}

/// Outbound half of the ingest bidirectional stream.
#[async_trait::async_trait]
pub trait IngestRequestSink: Send {
    async fn send(&mut self, frame: &IngestionFrame) -> Result<(), DpError>;
    async fn complete(&mut self) -> Result<(), DpError>;
}

/// `open`/`shutdown` lifecycle for an RPC connection, out of scope to
/// implement but depended on by callers that wire a transport together.
#[async_trait::async_trait]
pub trait ConnectionFactory: Send + Sync {
    type Connection: Send;

    async fn open(&self, target: &str) -> Result<Self::Connection, DpError>;
    async fn await_termination(&self, connection: &Self::Connection, timeout: Duration) -> Result<(), DpError>;
    async fn shutdown_soft(&self, connection: &Self::Connection) -> Result<(), DpError>;
    async fn shutdown_now(&self, connection: &Self::Connection) -> Result<(), DpError>;
}

/// Monotonic timing and wall-clock timestamps, injected so tests can supply
/// a deterministic clock instead of reading the system clock directly.
pub trait ClockSource: Send + Sync {
    fn now_wall_clock(&self) -> TimeInstant;
    fn now_monotonic(&self) -> Duration;
}

/// Wall-clock-backed [`ClockSource`] for production use.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl ClockSource for SystemClock {
    fn now_wall_clock(&self) -> TimeInstant {
        let now = chrono::Utc::now();
        TimeInstant::new(now.timestamp(), now.timestamp_subsec_nanos())
    }

    fn now_monotonic(&self) -> Duration {
        // `Instant` has no fixed epoch; callers only ever diff two readings.
        // Stored as a duration since process start via `std::time::Instant`
        // is not `Copy`-free to expose here, so monotonic readings are taken
        // by the caller with `std::time::Instant::now()` directly; this
        // method exists to satisfy the trait seam for injected fakes.
        Duration::ZERO
    }
}

/// `fromTable` — validates a structure's timestamp column and emits an
/// [`IngestionFrame`]. Out of scope: no implementation is provided.
pub trait EpicsImporter {
    fn from_table(&self, pv_structure: &dyn std::any::Any) -> Result<IngestionFrame, DpError>;
}
