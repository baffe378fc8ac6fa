//! Table Builder (§4.5): turns an assembled [`Aggregate`] into a
//! [`ResultTable`] — either fully materialized (`Static`) or a thin index
//! over the underlying blocks (`Dynamic`).

use crate::assembler::Aggregate;
use crate::error::{DpError, Subsystem};
use crate::sampled_block::SampledBlock;
use crate::time::TimeInstant;
use crate::value::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Deserialize)]
pub enum TableKind {
    Static,
    Dynamic,
    /// Picks `Static` when the materialized size would stay under
    /// `static_max_size_bytes`, `Dynamic` otherwise.
    Auto,
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct TableBuilderConfig {
    pub kind: TableKind,
    /// Which table `Auto` builds when under the size cap.
    pub static_default_in_auto: bool,
    /// When `false`, the static size cap is not enforced: `Auto` always
    /// builds static (when `static_default_in_auto`) and an explicit
    /// `Static` request never fails with `StaticSizeExceeded`.
    pub static_max_size_enabled: bool,
    pub static_max_size_bytes: u64,
}

impl Default for TableBuilderConfig {
    fn default() -> Self {
        TableBuilderConfig {
            kind: TableKind::Auto,
            static_default_in_auto: true,
            static_max_size_enabled: true,
            static_max_size_bytes: 64 * 1024 * 1024,
        }
    }
}

/// Fully materialized table: one flat timestamp vector plus one value vector
/// per column, aligned by row index.
pub struct StaticTable {
    timestamps: Vec<TimeInstant>,
    column_names: Vec<String>,
    columns: Vec<Vec<Value>>,
}

impl StaticTable {
    pub fn row_count(&self) -> usize {
        self.timestamps.len()
    }

    pub fn timestamps(&self) -> &[TimeInstant] {
        &self.timestamps
    }

    pub fn column_names(&self) -> &[String] {
        &self.column_names
    }

    pub fn value(&self, column: &str, row: usize) -> Result<&Value, DpError> {
        let idx = self
            .column_names
            .iter()
            .position(|c| c == column)
            .ok_or_else(|| DpError::UnknownColumn {
                subsystem: Subsystem::TableBuilder,
                column: column.to_string(),
            })?;
        self.columns[idx].get(row).ok_or_else(|| DpError::RowOutOfRange {
            subsystem: Subsystem::TableBuilder,
            row,
            len: self.timestamps.len(),
        })
    }
}

/// A thin view over the aggregate's blocks: row lookup binary-searches the
/// block whose domain contains the row, then indexes within it. O(log B + 1)
/// per lookup instead of O(1) after an O(N) materialization.
pub struct DynamicTable<'a> {
    blocks: &'a [SampledBlock],
    /// Row index of each block's first row, for the binary search.
    block_row_offsets: Vec<usize>,
    total_rows: usize,
}

impl<'a> DynamicTable<'a> {
    fn new(blocks: &'a [SampledBlock]) -> Self {
        let mut block_row_offsets = Vec::with_capacity(blocks.len());
        let mut total_rows = 0usize;
        for block in blocks {
            block_row_offsets.push(total_rows);
            total_rows += block.row_count();
        }
        DynamicTable {
            blocks,
            block_row_offsets,
            total_rows,
        }
    }

    pub fn row_count(&self) -> usize {
        self.total_rows
    }

    fn locate(&self, row: usize) -> Result<(usize, usize), DpError> {
        if row >= self.total_rows {
            return Err(DpError::RowOutOfRange {
                subsystem: Subsystem::TableBuilder,
                row,
                len: self.total_rows,
            });
        }
        let block_idx = match self.block_row_offsets.binary_search(&row) {
            Ok(exact) => exact,
            Err(insert_at) => insert_at - 1,
        };
        let offset = row - self.block_row_offsets[block_idx];
        Ok((block_idx, offset))
    }

    pub fn timestamp(&self, row: usize) -> Result<TimeInstant, DpError> {
        let (block_idx, offset) = self.locate(row)?;
        Ok(self.blocks[block_idx].materialized_timestamps()[offset])
    }

    pub fn value(&self, column: &str, row: usize) -> Result<&Value, DpError> {
        let (block_idx, offset) = self.locate(row)?;
        let block = &self.blocks[block_idx];
        let col = block.column(column).ok_or_else(|| DpError::UnknownColumn {
            subsystem: Subsystem::TableBuilder,
            column: column.to_string(),
        })?;
        col.values().get(offset).ok_or_else(|| DpError::RowOutOfRange {
            subsystem: Subsystem::TableBuilder,
            row,
            len: self.total_rows,
        })
    }
}

pub enum ResultTable<'a> {
    Static(StaticTable),
    Dynamic(DynamicTable<'a>),
}

impl<'a> ResultTable<'a> {
    pub fn row_count(&self) -> usize {
        match self {
            ResultTable::Static(t) => t.row_count(),
            ResultTable::Dynamic(t) => t.row_count(),
        }
    }
}

/// Rough byte estimate for the static materialization of `aggregate`,
/// mirroring `IngestionFrame::estimated_size_bytes`'s per-cell approximation.
fn estimated_static_size(aggregate: &Aggregate) -> u64 {
    let per_row_time = 16u64;
    let mut total = 0u64;
    for block in &aggregate.blocks {
        total += per_row_time * block.row_count() as u64;
        for column in block.columns() {
            total += column.values().len() as u64 * 8; // coarse per-cell estimate
        }
    }
    total
}

fn materialize_static(aggregate: &Aggregate, config: &TableBuilderConfig) -> Result<StaticTable, DpError> {
    let estimated = estimated_static_size(aggregate);
    if config.static_max_size_enabled && estimated > config.static_max_size_bytes {
        return Err(DpError::StaticSizeExceeded {
            subsystem: Subsystem::TableBuilder,
            actual: estimated,
            cap: config.static_max_size_bytes,
        });
    }

    let mut timestamps = Vec::new();
    for block in &aggregate.blocks {
        timestamps.extend(block.materialized_timestamps());
    }

    let mut column_names: Vec<String> = Vec::new();
    let mut column_types: Vec<crate::value::ElementType> = Vec::new();
    for block in &aggregate.blocks {
        for column in block.columns() {
            if !column_names.iter().any(|n| n == column.name()) {
                column_names.push(column.name().to_string());
                column_types.push(column.element_type().clone());
            }
        }
    }

    let mut columns: Vec<Vec<Value>> = vec![Vec::with_capacity(timestamps.len()); column_names.len()];
    for block in &aggregate.blocks {
        for (col_idx, name) in column_names.iter().enumerate() {
            match block.column(name) {
                Some(column) => columns[col_idx].extend(column.values().iter().cloned()),
                None => {
                    let fill = column_types[col_idx].default_value();
                    columns[col_idx].extend(std::iter::repeat(fill).take(block.row_count()));
                }
            }
        }
    }

    Ok(StaticTable {
        timestamps,
        column_names,
        columns,
    })
}

/// Builds a [`ResultTable`] from `aggregate` per `config`. The returned
/// dynamic view borrows `aggregate`'s blocks; a static table owns its data.
pub fn build<'a>(aggregate: &'a Aggregate, config: &TableBuilderConfig) -> Result<ResultTable<'a>, DpError> {
    let want_static = match config.kind {
        TableKind::Static => true,
        TableKind::Dynamic => false,
        TableKind::Auto => {
            if config.static_default_in_auto {
                !config.static_max_size_enabled || estimated_static_size(aggregate) <= config.static_max_size_bytes
            } else {
                false
            }
        }
    };

    if want_static {
        Ok(ResultTable::Static(materialize_static(aggregate, config)?))
    } else {
        Ok(ResultTable::Dynamic(DynamicTable::new(&aggregate.blocks)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assembler::AggregateStatus;
    use crate::frame::DataColumn;
    use crate::time::{SamplingClock, TimeUnit};
    use crate::value::ElementType;

    fn aggregate_with_two_blocks() -> Aggregate {
        let clock_a = SamplingClock::new(TimeInstant::from_seconds(0), 1, 3, TimeUnit::Seconds).unwrap();
        let block_a = SampledBlock::Clocked {
            clock: clock_a,
            columns: vec![DataColumn::new(
                "A",
                ElementType::Int32,
                vec![Value::Int32(0), Value::Int32(1), Value::Int32(2)],
            )],
        };
        let clock_b = SamplingClock::new(TimeInstant::from_seconds(10), 1, 2, TimeUnit::Seconds).unwrap();
        let block_b = SampledBlock::Clocked {
            clock: clock_b,
            columns: vec![DataColumn::new(
                "A",
                ElementType::Int32,
                vec![Value::Int32(10), Value::Int32(11)],
            )],
        };
        Aggregate {
            blocks: vec![block_a, block_b],
            status: AggregateStatus {
                ordered_ok: true,
                disjoint_ok: true,
            },
        }
    }

    #[test]
    fn static_table_materializes_all_rows() {
        let aggregate = aggregate_with_two_blocks();
        let config = TableBuilderConfig {
            kind: TableKind::Static,
            ..Default::default()
        };
        let table = build(&aggregate, &config).unwrap();
        assert_eq!(table.row_count(), 5);
        match table {
            ResultTable::Static(t) => {
                assert_eq!(*t.value("A", 4).unwrap(), Value::Int32(11));
                assert!(t.value("missing", 0).is_err());
                assert!(t.value("A", 5).is_err());
            }
            _ => panic!("expected static table"),
        }
    }

    #[test]
    fn dynamic_table_locates_rows_across_blocks() {
        let aggregate = aggregate_with_two_blocks();
        let config = TableBuilderConfig {
            kind: TableKind::Dynamic,
            ..Default::default()
        };
        let table = build(&aggregate, &config).unwrap();
        assert_eq!(table.row_count(), 5);
        match table {
            ResultTable::Dynamic(t) => {
                assert_eq!(t.timestamp(0).unwrap(), TimeInstant::from_seconds(0));
                assert_eq!(t.timestamp(3).unwrap(), TimeInstant::from_seconds(10));
                assert_eq!(*t.value("A", 4).unwrap(), Value::Int32(11));
                assert!(t.value("A", 5).is_err());
            }
            _ => panic!("expected dynamic table"),
        }
    }

    #[test]
    fn static_size_cap_is_enforced() {
        let aggregate = aggregate_with_two_blocks();
        let config = TableBuilderConfig {
            kind: TableKind::Static,
            static_max_size_bytes: 1,
            ..Default::default()
        };
        let err = build(&aggregate, &config).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::StaticSizeExceeded);
    }

    #[test]
    fn auto_falls_back_to_dynamic_past_cap() {
        let aggregate = aggregate_with_two_blocks();
        let config = TableBuilderConfig {
            kind: TableKind::Auto,
            static_max_size_bytes: 1,
            ..Default::default()
        };
        let table = build(&aggregate, &config).unwrap();
        assert!(matches!(table, ResultTable::Dynamic(_)));
    }

    #[test]
    fn disabling_the_cap_keeps_auto_static_past_the_byte_limit() {
        let aggregate = aggregate_with_two_blocks();
        let config = TableBuilderConfig {
            kind: TableKind::Auto,
            static_max_size_bytes: 1,
            static_max_size_enabled: false,
            ..Default::default()
        };
        let table = build(&aggregate, &config).unwrap();
        assert!(matches!(table, ResultTable::Static(_)));
    }

    #[test]
    fn disabling_the_cap_exempts_an_explicit_static_request_too() {
        let aggregate = aggregate_with_two_blocks();
        let config = TableBuilderConfig {
            kind: TableKind::Static,
            static_max_size_bytes: 1,
            static_max_size_enabled: false,
            ..Default::default()
        };
        assert!(build(&aggregate, &config).is_ok());
    }
}
