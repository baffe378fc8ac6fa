//! [`RawCorrelatedBlock`]: a set of columns sharing one time specification,
//! as emitted by the raw correlator (§4.3).

use crate::error::{DpError, Subsystem};
use crate::frame::DataColumn;
use crate::time::{SamplingClock, TimeInstant, TimestampList};

/// One inbound response message, as handed to the correlator by the
/// multi-stream recoverer.
#[derive(Debug, Clone)]
pub struct DataMessage {
    pub stream_id: u64,
    pub time: MessageTime,
    pub columns: Vec<DataColumn>,
    pub payload_bytes: u64,
}

/// A message's time specification: either a clock or an explicit list.
#[derive(Debug, Clone, PartialEq)]
pub enum MessageTime {
    Clock(SamplingClock),
    TmsList(TimestampList),
}

/// Canonical identity of a time specification, used to group messages into
/// blocks. Clocks hash their 4-tuple directly; lists hash a cheap digest and
/// fall back to full element-wise comparison on collision (see
/// [`TimeKey::same_domain`]).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TimeKey {
    Clock {
        start_seconds: i64,
        start_nanos: u32,
        period: u64,
        period_units: u8,
        count: u64,
    },
    TmsList {
        first: Option<(i64, u32)>,
        len: usize,
        last: Option<(i64, u32)>,
    },
}

impl TimeKey {
    pub fn for_clock(clock: &SamplingClock) -> Self {
        TimeKey::Clock {
            start_seconds: clock.start.seconds,
            start_nanos: clock.start.nanos,
            period: clock.period,
            period_units: clock.period_units as u8,
            count: clock.count,
        }
    }

    pub fn for_tms_list(list: &TimestampList) -> Self {
        let (first, len, last) = list.identity_digest();
        TimeKey::TmsList {
            first: first.map(|t| (t.seconds, t.nanos)),
            len,
            last: last.map(|t| (t.seconds, t.nanos)),
        }
    }

    pub fn for_message_time(time: &MessageTime) -> Self {
        match time {
            MessageTime::Clock(clock) => TimeKey::for_clock(clock),
            MessageTime::TmsList(list) => TimeKey::for_tms_list(list),
        }
    }
}

/// A sealed group of columns sharing one time specification. Immutable once
/// built by the correlator.
#[derive(Debug, Clone)]
pub enum RawCorrelatedBlock {
    RawClockedBlock {
        clock: SamplingClock,
        columns: Vec<DataColumn>,
        source_stream_id: u64,
    },
    RawTmsListBlock {
        tms_list: TimestampList,
        columns: Vec<DataColumn>,
        source_stream_id: u64,
    },
}

impl RawCorrelatedBlock {
    pub fn time_key(&self) -> TimeKey {
        match self {
            RawCorrelatedBlock::RawClockedBlock { clock, .. } => TimeKey::for_clock(clock),
            RawCorrelatedBlock::RawTmsListBlock { tms_list, .. } => TimeKey::for_tms_list(tms_list),
        }
    }

    pub fn start_time(&self) -> TimeInstant {
        match self {
            RawCorrelatedBlock::RawClockedBlock { clock, .. } => clock.start,
            RawCorrelatedBlock::RawTmsListBlock { tms_list, .. } => {
                tms_list.first().unwrap_or(TimeInstant::from_seconds(0))
            }
        }
    }

    /// Last instant covered by this block, used to detect overlap between
    /// blocks during aggregate assembly (§4.4).
    pub fn end_time(&self) -> TimeInstant {
        match self {
            RawCorrelatedBlock::RawClockedBlock { clock, .. } => clock.end(),
            RawCorrelatedBlock::RawTmsListBlock { tms_list, .. } => {
                tms_list.last().unwrap_or_else(|| self.start_time())
            }
        }
    }

    pub fn row_count(&self) -> usize {
        match self {
            RawCorrelatedBlock::RawClockedBlock { clock, .. } => clock.count as usize,
            RawCorrelatedBlock::RawTmsListBlock { tms_list, .. } => tms_list.len(),
        }
    }

    pub fn columns(&self) -> &[DataColumn] {
        match self {
            RawCorrelatedBlock::RawClockedBlock { columns, .. } => columns,
            RawCorrelatedBlock::RawTmsListBlock { columns, .. } => columns,
        }
    }

    pub fn source_stream_id(&self) -> u64 {
        match self {
            RawCorrelatedBlock::RawClockedBlock { source_stream_id, .. } => *source_stream_id,
            RawCorrelatedBlock::RawTmsListBlock { source_stream_id, .. } => *source_stream_id,
        }
    }

    pub fn materialized_timestamps(&self) -> Vec<TimeInstant> {
        match self {
            RawCorrelatedBlock::RawClockedBlock { clock, .. } => clock.materialize(),
            RawCorrelatedBlock::RawTmsListBlock { tms_list, .. } => tms_list.as_slice().to_vec(),
        }
    }

    /// Validates that every column has the block's row count, and (for
    /// clocked blocks) that the clock's count matches — the `CorruptMessage`
    /// check from §4.3.
    pub fn validate(&self) -> Result<(), DpError> {
        let expected = self.row_count();
        for column in self.columns() {
            if column.len() != expected {
                return Err(DpError::CorruptMessage {
                    subsystem: Subsystem::Correlator,
                    message: format!(
                        "column '{}' has {} rows, block time key implies {}",
                        column.name(),
                        column.len(),
                        expected
                    ),
                });
            }
        }
        Ok(())
    }
}

/// Groups messages that share a [`TimeKey`] into a single sealed block.
/// Assumes `messages` is non-empty and every message shares the same key
/// (the caller, i.e. the correlator, is responsible for grouping).
pub fn seal_block(messages: Vec<DataMessage>) -> Result<RawCorrelatedBlock, DpError> {
    let first = messages.first().ok_or_else(|| DpError::CorruptMessage {
        subsystem: Subsystem::Correlator,
        message: "cannot seal an empty message group".into(),
    })?;
    let time = first.time.clone();
    // Later messages in arrival order may contribute more columns for the
    // same time key; the most recent arrival for a given column wins.
    let mut source_stream_id = first.stream_id;
    let mut columns_by_name = indexmap::IndexMap::new();
    for message in messages {
        source_stream_id = message.stream_id;
        for column in message.columns {
            columns_by_name.insert(column.name().to_string(), column);
        }
    }
    let columns: Vec<DataColumn> = columns_by_name.into_values().collect();

    let block = match time {
        MessageTime::Clock(clock) => RawCorrelatedBlock::RawClockedBlock {
            clock,
            columns,
            source_stream_id,
        },
        MessageTime::TmsList(tms_list) => RawCorrelatedBlock::RawTmsListBlock {
            tms_list,
            columns,
            source_stream_id,
        },
    };
    block.validate()?;
    Ok(block)
}
