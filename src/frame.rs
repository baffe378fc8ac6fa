//! [`IngestionFrame`]: the tabular ingest unit, and its [`DataColumn`]s.

use indexmap::IndexMap;

use crate::error::{DpError, Subsystem};
use crate::time::{SamplingClock, TimeInstant, TimeInterval, TimestampList};
use crate::value::{ElementType, Value};

/// A single named, typed column. `values.len()` must always equal the
/// owning frame's row count.
#[derive(Debug, Clone, PartialEq)]
pub struct DataColumn {
    name: String,
    element_type: ElementType,
    values: Vec<Value>,
}

impl DataColumn {
    pub fn new(name: impl Into<String>, element_type: ElementType, values: Vec<Value>) -> Self {
        DataColumn {
            name: name.into(),
            element_type,
            values,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn element_type(&self) -> &ElementType {
        &self.element_type
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Every element assignable to `element_type`.
    pub fn is_consistent(&self) -> bool {
        self.values.iter().all(|v| v.is_assignable_to(&self.element_type))
    }
}

/// Exactly one of a [`SamplingClock`] or a [`TimestampList`] describes a
/// frame's row timing, never both, never neither, once populated.
#[derive(Debug, Clone, PartialEq)]
pub enum FrameTime {
    Clock(SamplingClock),
    TmsList(TimestampList),
}

impl FrameTime {
    pub fn row_count(&self) -> usize {
        match self {
            FrameTime::Clock(clock) => clock.count as usize,
            FrameTime::TmsList(list) => list.len(),
        }
    }

    fn remove_head(&self, n: usize) -> FrameTime {
        match self {
            FrameTime::Clock(clock) => {
                let new_start = if n == 0 {
                    clock.start
                } else {
                    clock.start.advance(n as i64, clock.period, clock.period_units)
                };
                FrameTime::Clock(SamplingClock {
                    start: new_start,
                    period: clock.period,
                    count: clock.count.saturating_sub(n as u64),
                    period_units: clock.period_units,
                })
            }
            FrameTime::TmsList(list) => {
                let remaining: Vec<TimeInstant> = list.as_slice()[n.min(list.len())..].to_vec();
                FrameTime::TmsList(
                    TimestampList::new(remaining, list.is_ordered())
                        .expect("suffix of a monotone list is monotone"),
                )
            }
        }
    }

    fn remove_tail(&self, n: usize) -> FrameTime {
        match self {
            FrameTime::Clock(clock) => FrameTime::Clock(SamplingClock {
                start: clock.start,
                period: clock.period,
                count: clock.count.saturating_sub(n as u64),
                period_units: clock.period_units,
            }),
            FrameTime::TmsList(list) => {
                let keep = list.len().saturating_sub(n);
                let remaining: Vec<TimeInstant> = list.as_slice()[..keep].to_vec();
                FrameTime::TmsList(
                    TimestampList::new(remaining, list.is_ordered())
                        .expect("prefix of a monotone list is monotone"),
                )
            }
        }
    }
}

/// Optional per-frame metadata. `client_request_uid` is required and
/// non-empty once the frame is populated.
#[derive(Debug, Clone, Default)]
pub struct FrameMetadata {
    pub provider_uid: Option<String>,
    pub client_request_uid: String,
    pub frame_label: Option<String>,
    pub frame_timestamp: Option<TimeInstant>,
    pub attributes: IndexMap<String, String>,
    pub snapshot_id: Option<String>,
    pub snapshot_interval: Option<TimeInterval>,
}

/// A column-major table: one time specification shared by every column.
#[derive(Debug, Clone)]
pub struct IngestionFrame {
    time: FrameTime,
    columns: IndexMap<String, DataColumn>,
    metadata: FrameMetadata,
}

impl IngestionFrame {
    pub fn new(time: FrameTime, metadata: FrameMetadata) -> Result<Self, DpError> {
        if metadata.client_request_uid.is_empty() {
            return Err(DpError::ConfigInvalid {
                subsystem: Subsystem::Ingest,
                message: "clientRequestUid must be non-empty".into(),
            });
        }
        let frame = IngestionFrame {
            time,
            columns: IndexMap::new(),
            metadata,
        };
        frame.check_consistency()?;
        Ok(frame)
    }

    pub fn row_count(&self) -> usize {
        self.time.row_count()
    }

    pub fn column_count(&self) -> usize {
        self.columns.len()
    }

    pub fn time(&self) -> &FrameTime {
        &self.time
    }

    pub fn metadata(&self) -> &FrameMetadata {
        &self.metadata
    }

    pub fn columns(&self) -> impl Iterator<Item = &DataColumn> {
        self.columns.values()
    }

    pub fn column(&self, name: &str) -> Option<&DataColumn> {
        self.columns.get(name)
    }

    /// Appends one column, rejecting a duplicate name or a row-count mismatch.
    pub fn add_column(&mut self, column: DataColumn) -> Result<(), DpError> {
        if self.columns.contains_key(column.name()) {
            return Err(DpError::ConfigInvalid {
                subsystem: Subsystem::Ingest,
                message: format!("duplicate column name '{}'", column.name()),
            });
        }
        if column.len() != self.row_count() {
            return Err(DpError::ConfigInvalid {
                subsystem: Subsystem::Ingest,
                message: format!(
                    "column '{}' has {} rows, frame has {}",
                    column.name(),
                    column.len(),
                    self.row_count()
                ),
            });
        }
        self.columns.insert(column.name().to_string(), column);
        Ok(())
    }

    pub fn add_columns(&mut self, columns: Vec<DataColumn>) -> Result<(), DpError> {
        for column in columns {
            self.add_column(column)?;
        }
        Ok(())
    }

    /// Removes columns by index. Per the source's "remove-all" edge case:
    /// removing every column (or more indices than exist) leaves an empty
    /// frame and still returns successfully.
    pub fn remove_columns_by_index(&mut self, mut indices: Vec<usize>) {
        indices.sort_unstable();
        indices.dedup();
        for idx in indices.into_iter().rev() {
            if idx < self.columns.len() {
                self.columns.shift_remove_index(idx);
            }
        }
    }

    pub fn remove_columns_by_name(&mut self, names: &[&str]) {
        for name in names {
            self.columns.shift_remove(*name);
        }
    }

    /// Drops the first `n` rows from every column and advances the time spec.
    pub fn remove_rows_at_head(&mut self, n: usize) {
        let n = n.min(self.row_count());
        self.time = self.time.remove_head(n);
        for column in self.columns.values_mut() {
            column.values.drain(0..n.min(column.values.len()));
        }
    }

    /// Drops the last `n` rows from every column and truncates the time spec.
    pub fn remove_rows_at_tail(&mut self, n: usize) {
        let n = n.min(self.row_count());
        self.time = self.time.remove_tail(n);
        for column in self.columns.values_mut() {
            let keep = column.values.len().saturating_sub(n);
            column.values.truncate(keep);
        }
    }

    /// A cheap clone sharing no mutable state with the original (all fields
    /// here are already owned, so this is a plain structural copy, kept as
    /// its own method to mirror the source's explicit shallow-copy contract).
    pub fn copy_shallow(&self) -> IngestionFrame {
        self.clone()
    }

    pub fn check_consistency(&self) -> Result<(), DpError> {
        if self.metadata.client_request_uid.is_empty() {
            return Err(DpError::ConfigInvalid {
                subsystem: Subsystem::Ingest,
                message: "clientRequestUid must be non-empty".into(),
            });
        }
        let row_count = self.row_count();
        for column in self.columns.values() {
            if column.len() != row_count {
                return Err(DpError::ConfigInvalid {
                    subsystem: Subsystem::Ingest,
                    message: format!(
                        "column '{}' has {} rows, frame has {}",
                        column.name(),
                        column.len(),
                        row_count
                    ),
                });
            }
            if !column.is_consistent() {
                return Err(DpError::ConfigInvalid {
                    subsystem: Subsystem::Ingest,
                    message: format!("column '{}' has a value not assignable to its type", column.name()),
                });
            }
        }
        Ok(())
    }

    /// Rough serialized size estimate used to decide whether a frame needs
    /// binning (§4.6). Not a wire size, just a monotonic proxy: sum of each
    /// cell's approximate footprint plus a per-row time overhead.
    pub fn estimated_size_bytes(&self) -> u64 {
        let per_row_time = 16u64;
        let mut total = per_row_time * self.row_count() as u64;
        for column in self.columns.values() {
            for value in column.values() {
                total += estimate_value_bytes(value);
            }
        }
        total
    }
}

fn estimate_value_bytes(value: &Value) -> u64 {
    match value {
        Value::Bool(_) => 1,
        Value::Int32(_) | Value::Float32(_) => 4,
        Value::Int64(_) | Value::Float64(_) => 8,
        Value::String(s) => s.len() as u64,
        Value::Bytes(b) => b.len() as u64,
        Value::Structured(map) => map
            .iter()
            .map(|(k, v)| k.len() as u64 + estimate_value_bytes(v))
            .sum(),
        Value::Array(items) => items.iter().map(estimate_value_bytes).sum(),
    }
}
