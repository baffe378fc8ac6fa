//! End-to-end scenarios from the testable-properties list: decomposition,
//! recovery, correlation, assembly and binning wired together the way a real
//! caller would use them, against an in-memory mock transport.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use dp_core::assembler::{assemble, AssemblerConfig};
use dp_core::cancel::Deadline;
use dp_core::correlator::CorrelatorConfig;
use dp_core::decompose::{decompose, DecomposerConfig};
use dp_core::error::ErrorKind;
use dp_core::frame::DataColumn;
use dp_core::ingest::{bin_frame, IngestConfig};
use dp_core::raw_block::MessageTime;
use dp_core::recoverer::{MultiStreamRecoverer, RecovererConfig};
use dp_core::request::{DataRequest, StreamType};
use dp_core::sampled_block::SampledBlock;
use dp_core::table::{build, ResultTable, TableBuilderConfig, TableKind};
use dp_core::time::{SamplingClock, TimeInstant, TimeInterval, TimeUnit};
use dp_core::transport::{QueryMessageStream, QueryTransport, RawQueryMessage};
use dp_core::uid::UidGenerator;
use dp_core::value::{ElementType, Value};

fn pvs(names: &[&str]) -> std::collections::BTreeSet<String> {
    names.iter().map(|s| s.to_string()).collect()
}

fn interval(begin: i64, end: i64) -> TimeInterval {
    TimeInterval::new(TimeInstant::from_seconds(begin), TimeInstant::from_seconds(end)).unwrap()
}

fn clocked_message(start: i64, count: u64, pv: &str) -> RawQueryMessage {
    let clock = SamplingClock::new(TimeInstant::from_seconds(start), 1, count, TimeUnit::Seconds).unwrap();
    let values = (0..count).map(|i| Value::Float64(start as f64 + i as f64)).collect();
    RawQueryMessage::Data {
        time: MessageTime::Clock(clock),
        columns: vec![DataColumn::new(pv, ElementType::Float64, values)],
        payload_bytes: count * 8,
    }
}

/// Replays, per subrequest (in call order), a fixed script of messages or an
/// `Exceptional` rejection.
struct MockTransport {
    scripts: Mutex<VecDeque<Vec<RawQueryMessage>>>,
    opened: AtomicU64,
}

impl MockTransport {
    fn new(scripts: Vec<Vec<RawQueryMessage>>) -> Self {
        MockTransport {
            scripts: Mutex::new(scripts.into_iter().collect()),
            opened: AtomicU64::new(0),
        }
    }

    async fn open(&self) -> Result<QueryMessageStream, dp_core::DpError> {
        self.opened.fetch_add(1, Ordering::SeqCst);
        let messages = self.scripts.lock().unwrap().pop_front().unwrap_or_default();
        let (tx, rx) = mpsc::channel(messages.len().max(1));
        for message in messages {
            tx.send(Ok(message)).await.ok();
        }
        Ok(Box::pin(ReceiverStream::new(rx)))
    }
}

#[async_trait]
impl QueryTransport for MockTransport {
    async fn open_backward(&self, _subrequest: &DataRequest) -> Result<QueryMessageStream, dp_core::DpError> {
        self.open().await
    }

    async fn open_bidirectional(&self, _subrequest: &DataRequest) -> Result<QueryMessageStream, dp_core::DpError> {
        self.open().await
    }
}

/// Scenario 1: decomposition by PVs — a 5-PV request with a cap of 2 splits
/// into 3 ordered subrequests whose PV sets partition the original.
#[tokio::test]
async fn scenario_decomposition_by_pvs() {
    let config = DecomposerConfig {
        max_pvs_per_subrequest: 2,
        ..Default::default()
    };
    let req = DataRequest::new("r1", pvs(&["A", "B", "C", "D", "E"]), interval(0, 10), StreamType::Backward).unwrap();
    let subs = decompose(&config, &req).unwrap();

    assert_eq!(subs.len(), 3);
    let mut union = std::collections::BTreeSet::new();
    for s in &subs {
        union.extend(s.pv_names().iter().cloned());
    }
    assert_eq!(union, req.pv_names().clone());
}

/// Scenario 2: decomposition by time — a 10s window with a 4s cap splits
/// into contiguous, gap-free windows covering the original span.
#[tokio::test]
async fn scenario_decomposition_by_time() {
    let config = DecomposerConfig {
        max_duration_per_subrequest_secs: 4.0,
        ..Default::default()
    };
    let req = DataRequest::new("r1", pvs(&["A"]), interval(0, 10), StreamType::Backward).unwrap();
    let subs = decompose(&config, &req).unwrap();

    let windows: Vec<(i64, i64)> = subs
        .iter()
        .map(|s| (s.time_range().begin().seconds, s.time_range().end().seconds))
        .collect();
    assert_eq!(windows, vec![(0, 4), (4, 8), (8, 10)]);
}

/// Scenario 3: super-domain merge — two streams report overlapping windows
/// for the same PV; recovery, correlation and assembly together produce one
/// merged block covering the union, with the later stream winning conflicts.
#[tokio::test]
async fn scenario_super_domain_merge() {
    let _ = env_logger::builder().filter_level(log::LevelFilter::Debug).is_test(true).try_init();
    let transport = Arc::new(MockTransport::new(vec![
        vec![clocked_message(0, 8, "A")],
        vec![clocked_message(5, 8, "A")],
    ]));
    let recoverer = MultiStreamRecoverer::new(transport, RecovererConfig::default());
    let original = DataRequest::new("r1", pvs(&["A"]), interval(0, 13), StreamType::Backward).unwrap();
    let subs = vec![
        DataRequest::new("r1a", pvs(&["A"]), interval(0, 8), StreamType::Backward).unwrap(),
        DataRequest::new("r1b", pvs(&["A"]), interval(5, 13), StreamType::Backward).unwrap(),
    ];

    let report = recoverer
        .process_requests(&CorrelatorConfig::default(), true, &original, subs, &Deadline::none())
        .await
        .unwrap();

    let aggregate = assemble(&AssemblerConfig::default(), report.correlation.blocks).unwrap();
    assert_eq!(aggregate.blocks.len(), 1);
    assert!(matches!(aggregate.blocks[0], SampledBlock::SuperDomain { .. }));
    assert_eq!(aggregate.blocks[0].row_count(), 13);
}

/// Scenario 4: ordering — messages that arrive out of time order are still
/// assembled into a block sequence sorted by start time.
#[tokio::test]
async fn scenario_ordering_recovers_from_out_of_order_arrival() {
    let transport = Arc::new(MockTransport::new(vec![vec![
        clocked_message(20, 3, "A"),
        clocked_message(0, 3, "A"),
        clocked_message(10, 3, "A"),
    ]]));
    let recoverer = MultiStreamRecoverer::new(transport, RecovererConfig::default());
    let original = DataRequest::new("r1", pvs(&["A"]), interval(0, 30), StreamType::Backward).unwrap();
    let subs = vec![DataRequest::new("r1", pvs(&["A"]), interval(0, 30), StreamType::Backward).unwrap()];

    let report = recoverer
        .process_requests(&CorrelatorConfig::default(), false, &original, subs, &Deadline::none())
        .await
        .unwrap();
    assert!(report.correlation.status.ordering_ok);

    let aggregate = assemble(&AssemblerConfig::default(), report.correlation.blocks).unwrap();
    let starts: Vec<_> = aggregate.blocks.iter().map(|b| b.start_time()).collect();
    assert_eq!(
        starts,
        vec![
            TimeInstant::from_seconds(0),
            TimeInstant::from_seconds(10),
            TimeInstant::from_seconds(20),
        ]
    );
}

/// Scenario 5: request rejection — a bidirectional stream's first message is
/// an exceptional result; recovery aborts with `RequestRejected` and only
/// that one message was processed.
#[tokio::test]
async fn scenario_request_rejection() {
    let transport = Arc::new(MockTransport::new(vec![vec![RawQueryMessage::Exceptional {
        status: "PERMISSION_DENIED".into(),
        message: "PV A is restricted".into(),
    }]]));
    let recoverer = MultiStreamRecoverer::new(transport.clone(), RecovererConfig::default());
    let original = DataRequest::new("r1", pvs(&["A"]), interval(0, 10), StreamType::Bidirectional).unwrap();
    let subs = vec![DataRequest::new("r1", pvs(&["A"]), interval(0, 10), StreamType::Bidirectional).unwrap()];

    let err = recoverer
        .process_requests(&CorrelatorConfig::default(), false, &original, subs, &Deadline::none())
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::RequestRejected);
    assert_eq!(transport.opened.load(Ordering::SeqCst), 1);
}

/// Scenario 6: frame binning — a 1000-row frame split under a small transport
/// cap yields multiple composite frames whose row counts sum back to the
/// original and whose columns match row-for-row once reassembled.
#[tokio::test]
async fn scenario_frame_binning_covers_every_row() {
    use dp_core::frame::{FrameMetadata, FrameTime, IngestionFrame};

    let clock = SamplingClock::new(TimeInstant::from_seconds(0), 1, 1000, TimeUnit::Seconds).unwrap();
    let mut frame = IngestionFrame::new(
        FrameTime::Clock(clock),
        FrameMetadata {
            client_request_uid: "original".into(),
            ..Default::default()
        },
    )
    .unwrap();
    let values: Vec<Value> = (0..1000).map(|i| Value::Float64(i as f64)).collect();
    frame.add_column(DataColumn::new("A", ElementType::Float64, values.clone())).unwrap();

    let config = IngestConfig {
        transport_message_cap_bytes: 4 * 1024,
        ..Default::default()
    };
    let uids = UidGenerator::new();
    let pieces = bin_frame(&config, &uids, &frame).unwrap();

    assert!(pieces.len() >= 3);
    assert_eq!(pieces.iter().map(|p| p.row_count()).sum::<usize>(), 1000);
    for piece in &pieces {
        assert_ne!(piece.metadata().client_request_uid, "original");
    }

    let mut reassembled: Vec<Value> = Vec::new();
    for piece in &pieces {
        reassembled.extend(piece.column("A").unwrap().values().iter().cloned());
    }
    assert_eq!(reassembled, values);
}

/// A dynamic table over an assembled aggregate resolves rows across blocks
/// without materializing the whole thing, exercising the table builder
/// alongside the rest of the pipeline.
#[tokio::test]
async fn pipeline_feeds_into_dynamic_table() {
    let transport = Arc::new(MockTransport::new(vec![vec![clocked_message(0, 5, "A")]]));
    let recoverer = MultiStreamRecoverer::new(transport, RecovererConfig::default());
    let original = DataRequest::new("r1", pvs(&["A"]), interval(0, 5), StreamType::Backward).unwrap();
    let subs = vec![DataRequest::new("r1", pvs(&["A"]), interval(0, 5), StreamType::Backward).unwrap()];

    let report = recoverer
        .process_requests(&CorrelatorConfig::default(), false, &original, subs, &Deadline::none())
        .await
        .unwrap();
    let aggregate = assemble(&AssemblerConfig::default(), report.correlation.blocks).unwrap();
    let table = build(
        &aggregate,
        &TableBuilderConfig {
            kind: TableKind::Dynamic,
            ..Default::default()
        },
    )
    .unwrap();

    assert_eq!(table.row_count(), 5);
    match table {
        ResultTable::Dynamic(t) => assert_eq!(*t.value("A", 4).unwrap(), Value::Float64(4.0)),
        _ => panic!("expected dynamic table"),
    }
}
