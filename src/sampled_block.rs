//! [`SampledBlock`]: the typed, post-assembly counterpart to a
//! [`RawCorrelatedBlock`](crate::raw_block::RawCorrelatedBlock). A `Clocked`
//! or `TmsList` block passes through the assembler unchanged; a
//! `SuperDomain` block is the product of merging two or more overlapping
//! blocks (§4.4).

use indexmap::IndexMap;

use crate::frame::DataColumn;
use crate::raw_block::RawCorrelatedBlock;
use crate::time::{SamplingClock, TimeInstant, TimestampList};

#[derive(Debug, Clone)]
pub enum SampledBlock {
    Clocked {
        clock: SamplingClock,
        columns: Vec<DataColumn>,
    },
    TmsList {
        tms_list: TimestampList,
        columns: Vec<DataColumn>,
    },
    /// A merged time domain: the sorted union of every contributing block's
    /// timestamps, with a per-column presence bitmap marking which rows a
    /// contributing block actually supplied a value for (absent rows hold
    /// the column's `ElementType::default_value()`).
    SuperDomain {
        timestamps: Vec<TimeInstant>,
        columns: Vec<DataColumn>,
        presence: IndexMap<String, Vec<bool>>,
    },
}

impl SampledBlock {
    pub(crate) fn from_raw(block: RawCorrelatedBlock) -> SampledBlock {
        match block {
            RawCorrelatedBlock::RawClockedBlock { clock, columns, .. } => {
                SampledBlock::Clocked { clock, columns }
            }
            RawCorrelatedBlock::RawTmsListBlock { tms_list, columns, .. } => {
                SampledBlock::TmsList { tms_list, columns }
            }
        }
    }

    pub fn start_time(&self) -> TimeInstant {
        match self {
            SampledBlock::Clocked { clock, .. } => clock.start,
            SampledBlock::TmsList { tms_list, .. } => {
                tms_list.first().unwrap_or(TimeInstant::from_seconds(0))
            }
            SampledBlock::SuperDomain { timestamps, .. } => {
                timestamps.first().copied().unwrap_or(TimeInstant::from_seconds(0))
            }
        }
    }

    pub fn row_count(&self) -> usize {
        match self {
            SampledBlock::Clocked { clock, .. } => clock.count as usize,
            SampledBlock::TmsList { tms_list, .. } => tms_list.len(),
            SampledBlock::SuperDomain { timestamps, .. } => timestamps.len(),
        }
    }

    pub fn columns(&self) -> &[DataColumn] {
        match self {
            SampledBlock::Clocked { columns, .. } => columns,
            SampledBlock::TmsList { columns, .. } => columns,
            SampledBlock::SuperDomain { columns, .. } => columns,
        }
    }

    pub fn column(&self, name: &str) -> Option<&DataColumn> {
        self.columns().iter().find(|c| c.name() == name)
    }

    pub fn materialized_timestamps(&self) -> Vec<TimeInstant> {
        match self {
            SampledBlock::Clocked { clock, .. } => clock.materialize(),
            SampledBlock::TmsList { tms_list, .. } => tms_list.as_slice().to_vec(),
            SampledBlock::SuperDomain { timestamps, .. } => timestamps.clone(),
        }
    }

    pub fn presence(&self, column: &str) -> Option<&[bool]> {
        match self {
            SampledBlock::SuperDomain { presence, .. } => presence.get(column).map(|v| v.as_slice()),
            _ => None,
        }
    }
}
