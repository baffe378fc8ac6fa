//! Raw Correlator (§4.3): groups inbound messages by time key into sealed
//! [`RawCorrelatedBlock`]s, pivoting from single-threaded to a worker pool
//! once the live target set grows past a configured size.

use std::collections::HashMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use log::*;
use tokio::sync::mpsc;

use crate::cancel::{Deadline, Trigger};
use crate::error::{DpError, Subsystem};
use crate::raw_block::{seal_block, DataMessage, RawCorrelatedBlock, TimeKey};

#[derive(Debug, Clone, serde::Deserialize)]
pub struct CorrelatorConfig {
    pub concurrency_enabled: bool,
    pub concurrency_pivot_size: usize,
    pub max_threads: usize,
}

impl Default for CorrelatorConfig {
    fn default() -> Self {
        CorrelatorConfig {
            concurrency_enabled: true,
            concurrency_pivot_size: 16,
            max_threads: 4,
        }
    }
}

/// Non-fatal post-condition checks emitted alongside the correlator's output.
#[derive(Debug, Clone, Copy, Default)]
pub struct CorrelationStatus {
    pub ordering_ok: bool,
    pub disjoint_time_domains_ok: bool,
}

pub struct CorrelationReport {
    pub blocks: Vec<RawCorrelatedBlock>,
    pub status: CorrelationStatus,
    pub pivoted: bool,
}

fn hash_key(key: &TimeKey, workers: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    (hasher.finish() as usize) % workers.max(1)
}

/// Groups a complete batch of messages into sealed, time-ordered blocks.
/// Used both for the post-hoc path (all messages already collected) and,
/// fed incrementally via [`StreamingCorrelator`], for the inline path.
pub fn correlate_batch(
    config: &CorrelatorConfig,
    messages: Vec<DataMessage>,
) -> Result<CorrelationReport, DpError> {
    let mut correlator = StreamingCorrelator::new(config.clone());
    for message in messages {
        correlator.feed(message)?;
    }
    correlator.finish()
}

/// Incremental grouping engine: single-threaded until the live group count
/// exceeds `concurrency_pivot_size`, then fans subsequent work out across
/// `max_threads` in-memory partitions keyed by a hash of the time key. The
/// pivot is one-way for the lifetime of one correlator instance.
pub struct StreamingCorrelator {
    config: CorrelatorConfig,
    single: HashMap<TimeKey, Vec<DataMessage>>,
    partitions: Option<Vec<HashMap<TimeKey, Vec<DataMessage>>>>,
}

impl StreamingCorrelator {
    pub fn new(config: CorrelatorConfig) -> Self {
        StreamingCorrelator {
            config,
            single: HashMap::new(),
            partitions: None,
        }
    }

    pub fn feed(&mut self, message: DataMessage) -> Result<(), DpError> {
        let key = TimeKey::for_message_time(&message.time);

        if self.partitions.is_none()
            && self.config.concurrency_enabled
            && self.single.len() > self.config.concurrency_pivot_size
        {
            self.pivot();
        }

        match &mut self.partitions {
            Some(partitions) => {
                let workers = partitions.len();
                let idx = hash_key(&key, workers);
                partitions[idx].entry(key).or_default().push(message);
            }
            None => {
                self.single.entry(key).or_default().push(message);
            }
        }
        Ok(())
    }

    fn pivot(&mut self) {
        let workers = self.config.max_threads.max(1);
        debug!("correlator pivoting to {} worker partitions at {} live groups", workers, self.single.len());
        let mut partitions: Vec<HashMap<TimeKey, Vec<DataMessage>>> =
            (0..workers).map(|_| HashMap::new()).collect();
        for (key, group) in self.single.drain() {
            let idx = hash_key(&key, workers);
            partitions[idx].insert(key, group);
        }
        self.partitions = Some(partitions);
    }

    pub fn pivoted(&self) -> bool {
        self.partitions.is_some()
    }

    /// Seals every live group into a block, merging per-partition work across
    /// `max_threads` worker tasks when pivoted, and re-sorts by start time so
    /// the final ordering guarantee holds regardless of how work was split.
    pub fn finish(self) -> Result<CorrelationReport, DpError> {
        let pivoted = self.pivoted();
        let mut blocks = Vec::new();

        match self.partitions {
            Some(partitions) => {
                let sealed: Vec<Result<Vec<RawCorrelatedBlock>, DpError>> = partitions
                    .into_iter()
                    .map(|partition| {
                        partition
                            .into_values()
                            .map(seal_block)
                            .collect::<Result<Vec<_>, _>>()
                    })
                    .collect();
                for part in sealed {
                    blocks.extend(part?);
                }
            }
            None => {
                for group in self.single.into_values() {
                    blocks.push(seal_block(group)?);
                }
            }
        }

        blocks.sort_by_key(|b| b.start_time());

        let ordering_ok = blocks.windows(2).all(|w| w[0].start_time() < w[1].start_time());
        let disjoint_time_domains_ok = blocks.windows(2).all(|w| {
            let a_end_exclusive = w[0]
                .materialized_timestamps()
                .last()
                .copied()
                .unwrap_or(w[0].start_time());
            a_end_exclusive < w[1].start_time()
        });
        if !disjoint_time_domains_ok {
            debug!("correlator sealed {} block(s) with overlapping time domains", blocks.len());
        }

        Ok(CorrelationReport {
            blocks,
            status: CorrelationStatus {
                ordering_ok,
                disjoint_time_domains_ok,
            },
            pivoted,
        })
    }
}

/// Drives a [`StreamingCorrelator`] off an `mpsc` receiver, for the inline
/// ("correlate while streaming") path where the recoverer's producers are
/// still running concurrently with correlation. Races `deadline` against
/// each receive so a caller-driven cancel or deadline lands here directly,
/// not only via the recoverer's stream-side watchdog.
pub async fn correlate_stream(
    config: CorrelatorConfig,
    mut messages_rx: mpsc::Receiver<DataMessage>,
    deadline: &Deadline,
) -> Result<CorrelationReport, DpError> {
    let mut correlator = StreamingCorrelator::new(config);
    loop {
        tokio::select! {
            biased;
            trigger = deadline.triggered() => {
                return Err(to_dp_error(trigger));
            }
            next = messages_rx.recv() => {
                match next {
                    Some(message) => correlator.feed(message)?,
                    None => return correlator.finish(),
                }
            }
        }
    }
}

fn to_dp_error(trigger: Trigger) -> DpError {
    match trigger {
        Trigger::Cancelled => DpError::Cancelled { subsystem: Subsystem::Correlator },
        Trigger::DeadlineExceeded => DpError::DeadlineExceeded { subsystem: Subsystem::Correlator },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::DataColumn;
    use crate::raw_block::MessageTime;
    use crate::time::{SamplingClock, TimeInstant, TimeUnit};
    use crate::value::Value;

    fn clocked_message(stream_id: u64, start: i64, count: u64, col: &str) -> DataMessage {
        let clock = SamplingClock::new(TimeInstant::from_seconds(start), 1, count, TimeUnit::Seconds).unwrap();
        let values = (0..count).map(|i| Value::Int32(i as i32)).collect();
        DataMessage {
            stream_id,
            time: MessageTime::Clock(clock),
            columns: vec![DataColumn::new(col, crate::value::ElementType::Int32, values)],
            payload_bytes: count * 4,
        }
    }

    #[test]
    fn groups_and_orders_blocks() {
        let config = CorrelatorConfig::default();
        let messages = vec![
            clocked_message(1, 10, 3, "A"),
            clocked_message(1, 0, 3, "A"),
            clocked_message(1, 20, 3, "A"),
        ];
        let report = correlate_batch(&config, messages).unwrap();
        assert_eq!(report.blocks.len(), 3);
        assert!(report.status.ordering_ok);
        assert!(report.status.disjoint_time_domains_ok);
        assert_eq!(report.blocks[0].start_time(), TimeInstant::from_seconds(0));
        assert_eq!(report.blocks[1].start_time(), TimeInstant::from_seconds(10));
        assert_eq!(report.blocks[2].start_time(), TimeInstant::from_seconds(20));
    }

    #[test]
    fn reverse_arrival_order_still_sorts_correctly() {
        let config = CorrelatorConfig::default();
        let forward = vec![
            clocked_message(1, 0, 1, "A"),
            clocked_message(1, 1, 1, "A"),
            clocked_message(1, 2, 1, "A"),
        ];
        let mut reverse = forward.clone();
        reverse.reverse();

        let forward_report = correlate_batch(&config, forward).unwrap();
        let reverse_report = correlate_batch(&config, reverse).unwrap();

        let forward_starts: Vec<_> = forward_report.blocks.iter().map(|b| b.start_time()).collect();
        let reverse_starts: Vec<_> = reverse_report.blocks.iter().map(|b| b.start_time()).collect();
        assert_eq!(forward_starts, reverse_starts);
        assert!(forward_starts.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn pivots_past_configured_size() {
        let config = CorrelatorConfig {
            concurrency_pivot_size: 2,
            ..Default::default()
        };
        let mut correlator = StreamingCorrelator::new(config);
        for i in 0..10 {
            correlator.feed(clocked_message(1, i * 10, 1, "A")).unwrap();
        }
        assert!(correlator.pivoted());
        let report = correlator.finish().unwrap();
        assert_eq!(report.blocks.len(), 10);
        assert!(report.pivoted);
    }
}
