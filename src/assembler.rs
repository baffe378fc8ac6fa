//! Aggregate Assembler (§4.4): coerces sealed [`RawCorrelatedBlock`]s into
//! typed [`SampledBlock`]s, detecting and resolving overlapping time domains
//! into merged super-domain blocks.

use std::collections::HashMap;

use indexmap::IndexMap;
use log::*;

use crate::error::{DpError, Subsystem};
use crate::frame::DataColumn;
use crate::raw_block::RawCorrelatedBlock;
use crate::sampled_block::SampledBlock;
use crate::time::TimeInstant;
use crate::value::{ElementType, Value};

#[derive(Debug, Clone, serde::Deserialize)]
pub struct AssemblerConfig {
    /// Verifies cross-block column type consistency before assembly.
    pub advanced_error_checking: bool,
    /// When two blocks' time domains overlap: `true` merges them into a
    /// [`SampledBlock::SuperDomain`]; `false` rejects with `OverlappingDomain`.
    pub time_domain_collisions_enabled: bool,
    pub concurrency_enabled: bool,
    pub concurrency_pivot_size: usize,
    pub max_threads: usize,
}

impl Default for AssemblerConfig {
    fn default() -> Self {
        AssemblerConfig {
            advanced_error_checking: true,
            time_domain_collisions_enabled: true,
            concurrency_enabled: true,
            concurrency_pivot_size: 16,
            max_threads: 4,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct AggregateStatus {
    pub ordered_ok: bool,
    pub disjoint_ok: bool,
}

pub struct Aggregate {
    pub blocks: Vec<SampledBlock>,
    pub status: AggregateStatus,
}

/// Assembles `raw_blocks` (in any arrival order) into a time-ordered
/// aggregate. Fails with `EmptyAggregate` on an empty input.
pub fn assemble(config: &AssemblerConfig, mut raw_blocks: Vec<RawCorrelatedBlock>) -> Result<Aggregate, DpError> {
    if raw_blocks.is_empty() {
        return Err(DpError::EmptyAggregate {
            subsystem: Subsystem::Assembler,
        });
    }

    raw_blocks.sort_by_key(|b| b.start_time());

    if config.advanced_error_checking {
        check_type_consistency(&raw_blocks)?;
    }

    let clusters = cluster_overlapping(raw_blocks);

    // Singleton clusters (the common case) need only type coercion, no
    // cross-block merge, so they're collected separately and coerced in
    // parallel once there are enough of them to be worth it; multi-member
    // clusters always merge sequentially since `merge_super_domain` itself
    // has no useful unit of parallel work.
    let mut slots: Vec<Option<SampledBlock>> = Vec::with_capacity(clusters.len());
    let mut singleton_indices = Vec::new();
    let mut singleton_raw = Vec::new();

    for cluster in clusters {
        let slot_index = slots.len();
        slots.push(None);
        if cluster.len() == 1 {
            singleton_indices.push(slot_index);
            singleton_raw.push(cluster.into_iter().next().expect("len checked"));
        } else if config.time_domain_collisions_enabled {
            debug!("assembler merging {} overlapping blocks into a super-domain", cluster.len());
            slots[slot_index] = Some(merge_super_domain(cluster)?);
        } else {
            let a = &cluster[0];
            let b = &cluster[1];
            warn!("overlapping time domains at {} and {} with collisions disabled", a.start_time(), b.start_time());
            return Err(DpError::OverlappingDomain {
                subsystem: Subsystem::Assembler,
                a_start: a.start_time().to_string(),
                b_start: b.start_time().to_string(),
            });
        }
    }

    if config.concurrency_enabled && singleton_raw.len() > config.concurrency_pivot_size {
        debug!(
            "assembler coercing {} singleton block(s) across up to {} worker threads",
            singleton_raw.len(),
            config.max_threads
        );
        for (slot_index, block) in singleton_indices
            .into_iter()
            .zip(coerce_parallel(singleton_raw, config.max_threads.max(1)))
        {
            slots[slot_index] = Some(block);
        }
    } else {
        for (slot_index, raw) in singleton_indices.into_iter().zip(singleton_raw) {
            slots[slot_index] = Some(SampledBlock::from_raw(raw));
        }
    }

    let blocks: Vec<SampledBlock> = slots
        .into_iter()
        .map(|slot| slot.expect("every cluster produced exactly one block"))
        .collect();

    let ordered_ok = blocks.windows(2).all(|w| w[0].start_time() < w[1].start_time());
    let disjoint_ok = blocks.windows(2).all(|w| {
        let a_end = w[0]
            .materialized_timestamps()
            .last()
            .copied()
            .unwrap_or(w[0].start_time());
        a_end < w[1].start_time()
    });

    Ok(Aggregate {
        blocks,
        status: AggregateStatus { ordered_ok, disjoint_ok },
    })
}

/// Coerces `raw_blocks` (independent, singleton clusters) into `SampledBlock`s
/// across up to `workers` OS threads via `std::thread::scope`. The coercion
/// itself is synchronous CPU work (no I/O), so scoped threads fit better
/// than async tasks. Preserves `raw_blocks`' order in the returned vector.
fn coerce_parallel(raw_blocks: Vec<RawCorrelatedBlock>, workers: usize) -> Vec<SampledBlock> {
    let chunk_size = (raw_blocks.len() + workers - 1) / workers.max(1);
    let chunks: Vec<Vec<RawCorrelatedBlock>> = raw_blocks
        .chunks(chunk_size.max(1))
        .map(|chunk| chunk.to_vec())
        .collect();

    let chunked_results: Vec<Vec<SampledBlock>> = std::thread::scope(|scope| {
        let handles: Vec<_> = chunks
            .into_iter()
            .map(|chunk| scope.spawn(move || chunk.into_iter().map(SampledBlock::from_raw).collect::<Vec<_>>()))
            .collect();
        handles
            .into_iter()
            .map(|handle| handle.join().expect("coercion worker thread panicked"))
            .collect()
    });

    chunked_results.into_iter().flatten().collect()
}

/// Every column name appearing anywhere in `blocks` must carry the same
/// declared type across every block it appears in.
fn check_type_consistency(blocks: &[RawCorrelatedBlock]) -> Result<(), DpError> {
    let mut seen: HashMap<&str, &ElementType> = HashMap::new();
    for block in blocks {
        for column in block.columns() {
            match seen.get(column.name()) {
                Some(existing) if *existing != column.element_type() => {
                    return Err(DpError::TypeConflict {
                        subsystem: Subsystem::Assembler,
                        column: column.name().to_string(),
                        expected: existing.to_string(),
                        found: column.element_type().to_string(),
                    });
                }
                Some(_) => {}
                None => {
                    seen.insert(column.name(), column.element_type());
                }
            }
        }
    }
    Ok(())
}

/// Groups blocks (sorted by start time) into clusters of mutually
/// overlapping (or touching) time domains. Each cluster becomes one output
/// block — a singleton cluster passes through unchanged, a multi-member
/// cluster is merged into a super-domain block.
fn cluster_overlapping(blocks: Vec<RawCorrelatedBlock>) -> Vec<Vec<RawCorrelatedBlock>> {
    let mut clusters: Vec<Vec<RawCorrelatedBlock>> = Vec::new();
    let mut current_end: Option<TimeInstant> = None;

    for block in blocks {
        let overlaps = current_end.map(|end| block.start_time() <= end).unwrap_or(false);
        if overlaps {
            let end = current_end.expect("checked above");
            current_end = Some(end.max(block.end_time()));
            clusters.last_mut().expect("overlap implies a prior cluster").push(block);
        } else {
            current_end = Some(block.end_time());
            clusters.push(vec![block]);
        }
    }

    clusters
}

/// Merges a cluster of overlapping blocks into one [`SampledBlock::SuperDomain`]:
/// the sorted union of every member's timestamps, with later-arriving members
/// (ordered by `(source_stream_id, start_time)`) overwriting earlier ones
/// where both supply a value for the same column at the same instant.
fn merge_super_domain(cluster: Vec<RawCorrelatedBlock>) -> Result<SampledBlock, DpError> {
    let mut ordered = cluster;
    ordered.sort_by(|a, b| {
        a.source_stream_id()
            .cmp(&b.source_stream_id())
            .then(a.start_time().cmp(&b.start_time()))
    });

    let mut union_times: Vec<TimeInstant> = Vec::new();
    for block in &ordered {
        union_times.extend(block.materialized_timestamps());
    }
    union_times.sort();
    union_times.dedup();

    let mut index_of: HashMap<TimeInstant, usize> = HashMap::with_capacity(union_times.len());
    for (i, t) in union_times.iter().enumerate() {
        index_of.insert(*t, i);
    }

    let mut column_types: IndexMap<String, ElementType> = IndexMap::new();
    let mut column_slots: IndexMap<String, Vec<Option<Value>>> = IndexMap::new();

    for block in &ordered {
        let times = block.materialized_timestamps();
        for column in block.columns() {
            let declared = column_types
                .entry(column.name().to_string())
                .or_insert_with(|| column.element_type().clone());
            if *declared != *column.element_type() {
                return Err(DpError::TypeConflict {
                    subsystem: Subsystem::Assembler,
                    column: column.name().to_string(),
                    expected: declared.to_string(),
                    found: column.element_type().to_string(),
                });
            }
            let slots = column_slots
                .entry(column.name().to_string())
                .or_insert_with(|| vec![None; union_times.len()]);
            for (row, value) in column.values().iter().enumerate() {
                if let Some(instant) = times.get(row) {
                    if let Some(&idx) = index_of.get(instant) {
                        slots[idx] = Some(value.clone());
                    }
                }
            }
        }
    }

    let mut columns = Vec::with_capacity(column_types.len());
    let mut presence = IndexMap::with_capacity(column_types.len());
    for (name, element_type) in &column_types {
        let slots = &column_slots[name];
        let mut present = Vec::with_capacity(slots.len());
        let mut values = Vec::with_capacity(slots.len());
        for slot in slots {
            match slot {
                Some(v) => {
                    present.push(true);
                    values.push(v.clone());
                }
                None => {
                    present.push(false);
                    values.push(element_type.default_value());
                }
            }
        }
        columns.push(DataColumn::new(name.clone(), element_type.clone(), values));
        presence.insert(name.clone(), present);
    }

    Ok(SampledBlock::SuperDomain {
        timestamps: union_times,
        columns,
        presence,
    })
}
