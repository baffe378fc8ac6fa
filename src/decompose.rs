//! Request Decomposer (§4.1): splits a query into subqueries fit for
//! parallel streaming.

use std::collections::BTreeSet;

use log::*;

use crate::error::{DpError, Subsystem};
use crate::request::{DataRequest, StreamType};
use crate::time::TimeInterval;

/// Axis used by explicit decomposition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Deserialize)]
pub enum DecomposeAxis {
    /// PV-sharded.
    Horizontal,
    /// Time-sharded.
    Vertical,
    /// Both axes, Cartesian product.
    Grid,
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct DecomposerConfig {
    pub enabled: bool,
    /// `true` selects automatic (cap-driven) decomposition; `false` selects
    /// explicit (axis + target count) decomposition.
    pub auto: bool,
    pub strategy: DecomposeAxis,
    pub max_pvs_per_subrequest: usize,
    pub max_duration_per_subrequest_secs: f64,
    /// Target subrequest count for explicit decomposition.
    pub stream_count: usize,
}

impl Default for DecomposerConfig {
    fn default() -> Self {
        DecomposerConfig {
            enabled: true,
            auto: true,
            strategy: DecomposeAxis::Grid,
            max_pvs_per_subrequest: 64,
            max_duration_per_subrequest_secs: 3600.0,
            stream_count: 4,
        }
    }
}

fn chunk_sorted_pvs(pv_names: &BTreeSet<String>, chunk_size: usize) -> Vec<BTreeSet<String>> {
    let sorted: Vec<&String> = pv_names.iter().collect();
    sorted
        .chunks(chunk_size.max(1))
        .map(|chunk| chunk.iter().map(|s| (*s).clone()).collect())
        .collect()
}

fn chunk_into_n_groups(pv_names: &BTreeSet<String>, groups: usize) -> Vec<BTreeSet<String>> {
    let groups = groups.max(1);
    let sorted: Vec<&String> = pv_names.iter().collect();
    let chunk_size = (sorted.len() + groups - 1) / groups.max(1);
    chunk_sorted_pvs(pv_names, chunk_size.max(1))
}

/// Splits `req` into an ordered sequence of subrequests, per the configured
/// strategy. Returns `req` unchanged (as a one-element sequence) when
/// decomposition is disabled or `req` already fits within the automatic caps.
pub fn decompose(config: &DecomposerConfig, req: &DataRequest) -> Result<Vec<DataRequest>, DpError> {
    validate(config, req)?;

    if !config.enabled {
        return Ok(vec![req.clone()]);
    }

    let subrequests = if config.auto {
        decompose_auto(config, req)?
    } else {
        decompose_explicit(config, req)?
    };
    debug!("decomposed request {} into {} subrequest(s)", req.request_id, subrequests.len());

    Ok(order_deterministically(subrequests))
}

fn validate(config: &DecomposerConfig, req: &DataRequest) -> Result<(), DpError> {
    if req.pv_names().is_empty() {
        return Err(DpError::ConfigInvalid {
            subsystem: Subsystem::Decomposer,
            message: "pvNames must not be empty".into(),
        });
    }
    if req.time_range().duration_seconds() < 0.0 {
        return Err(DpError::ConfigInvalid {
            subsystem: Subsystem::Decomposer,
            message: "timeRange must not be empty/negative".into(),
        });
    }
    if config.enabled && config.auto {
        if config.max_pvs_per_subrequest == 0 {
            return Err(DpError::ConfigInvalid {
                subsystem: Subsystem::Decomposer,
                message: "maxPvsPerSubrequest must be positive".into(),
            });
        }
        if config.max_duration_per_subrequest_secs <= 0.0 {
            return Err(DpError::ConfigInvalid {
                subsystem: Subsystem::Decomposer,
                message: "maxDurationPerSubrequest must be positive".into(),
            });
        }
    }
    Ok(())
}

fn decompose_auto(config: &DecomposerConfig, req: &DataRequest) -> Result<Vec<DataRequest>, DpError> {
    let pv_exceeds = req.pv_names().len() > config.max_pvs_per_subrequest;
    let duration_exceeds = req.time_range().duration_seconds() > config.max_duration_per_subrequest_secs;

    if !pv_exceeds && !duration_exceeds {
        return Ok(vec![req.clone()]);
    }

    let pv_groups: Vec<BTreeSet<String>> = if pv_exceeds {
        chunk_sorted_pvs(req.pv_names(), config.max_pvs_per_subrequest)
    } else {
        vec![req.pv_names().clone()]
    };

    let time_windows: Vec<TimeInterval> = if duration_exceeds {
        req.time_range()
            .split_by_duration(config.max_duration_per_subrequest_secs)
    } else {
        vec![req.time_range()]
    };

    Ok(cartesian(req, pv_groups, time_windows))
}

fn decompose_explicit(config: &DecomposerConfig, req: &DataRequest) -> Result<Vec<DataRequest>, DpError> {
    let target = config.stream_count.max(1);
    match config.strategy {
        DecomposeAxis::Horizontal => {
            let pv_groups = chunk_into_n_groups(req.pv_names(), target);
            Ok(cartesian(req, pv_groups, vec![req.time_range()]))
        }
        DecomposeAxis::Vertical => {
            let step = req.time_range().duration_seconds() / target as f64;
            let time_windows = req.time_range().split_by_duration(step.max(f64::MIN_POSITIVE));
            Ok(cartesian(req, vec![req.pv_names().clone()], time_windows))
        }
        DecomposeAxis::Grid => {
            let side = (target as f64).sqrt().ceil() as usize;
            let pv_groups = chunk_into_n_groups(req.pv_names(), side.max(1));
            let step = req.time_range().duration_seconds() / side.max(1) as f64;
            let time_windows = req.time_range().split_by_duration(step.max(f64::MIN_POSITIVE));
            Ok(cartesian(req, pv_groups, time_windows))
        }
    }
}

fn cartesian(
    req: &DataRequest,
    pv_groups: Vec<BTreeSet<String>>,
    time_windows: Vec<TimeInterval>,
) -> Vec<DataRequest> {
    let mut out = Vec::with_capacity(pv_groups.len() * time_windows.len());
    for window in &time_windows {
        for group in &pv_groups {
            out.push(
                req.with_pv_names(group.clone())
                    .with_time_range(*window),
            );
        }
    }
    out
}

/// Orders subrequests by time then by lexicographically-smallest PV name,
/// per the decomposer's determinism guarantee.
fn order_deterministically(mut subrequests: Vec<DataRequest>) -> Vec<DataRequest> {
    subrequests.sort_by(|a, b| {
        a.time_range()
            .begin()
            .cmp(&b.time_range().begin())
            .then_with(|| a.pv_names().iter().next().cmp(&b.pv_names().iter().next()))
    });
    subrequests
}
