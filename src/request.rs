//! [`DataRequest`]: a query request for a set of PVs over a time range.

use std::collections::BTreeSet;

use crate::error::{DpError, Subsystem};
use crate::time::TimeInterval;

/// How a query's response messages are delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamType {
    /// Server-streaming: one outbound request, many inbound messages.
    Backward,
    /// Paired forward/backward streams.
    Bidirectional,
}

#[derive(Debug, Clone)]
pub struct DataRequest {
    pub request_id: String,
    pv_names: BTreeSet<String>,
    time_range: TimeInterval,
    stream_type: StreamType,
}

impl DataRequest {
    pub fn new(
        request_id: impl Into<String>,
        pv_names: BTreeSet<String>,
        time_range: TimeInterval,
        stream_type: StreamType,
    ) -> Result<Self, DpError> {
        if pv_names.is_empty() {
            return Err(DpError::ConfigInvalid {
                subsystem: Subsystem::Decomposer,
                message: "pvNames must not be empty".into(),
            });
        }
        Ok(DataRequest {
            request_id: request_id.into(),
            pv_names,
            time_range,
            stream_type,
        })
    }

    pub fn pv_names(&self) -> &BTreeSet<String> {
        &self.pv_names
    }

    pub fn time_range(&self) -> TimeInterval {
        self.time_range
    }

    pub fn stream_type(&self) -> StreamType {
        self.stream_type
    }

    pub fn with_pv_names(&self, pv_names: BTreeSet<String>) -> DataRequest {
        DataRequest {
            request_id: self.request_id.clone(),
            pv_names,
            time_range: self.time_range,
            stream_type: self.stream_type,
        }
    }

    pub fn with_time_range(&self, time_range: TimeInterval) -> DataRequest {
        DataRequest {
            request_id: self.request_id.clone(),
            pv_names: self.pv_names.clone(),
            time_range,
            stream_type: self.stream_type,
        }
    }

    /// `|PVs| * durationSeconds`, used to decide whether the recoverer should
    /// engage multiple streams (§4.2).
    pub fn estimated_domain_size(&self) -> f64 {
        self.pv_names.len() as f64 * self.time_range.duration_seconds()
    }
}
