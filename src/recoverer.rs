//! Multi-Stream Recoverer (§4.2): opens concurrent inbound streams, pumps
//! messages into a bounded FIFO, and hands them to the raw correlator either
//! inline or after all streams complete.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures_util::StreamExt;
use log::*;
use tokio::sync::{mpsc, watch, Semaphore};

use crate::cancel::{Deadline, Trigger};
use crate::correlator::{correlate_batch, correlate_stream, CorrelationReport, CorrelatorConfig};
use crate::error::{DpError, Subsystem};
use crate::raw_block::{DataMessage, MessageTime};
use crate::request::{DataRequest, StreamType};
use crate::time::TimeInterval;
use crate::transport::{QueryMessageStream, QueryTransport, RawQueryMessage};

#[derive(Debug, Clone, serde::Deserialize)]
pub struct RecovererConfig {
    pub max_streams: usize,
    pub fifo_capacity: usize,
    pub correlate_while_streaming: bool,
    pub multi_stream_domain_size_threshold: f64,
}

impl Default for RecovererConfig {
    fn default() -> Self {
        RecovererConfig {
            max_streams: 8,
            fifo_capacity: 256,
            correlate_while_streaming: true,
            multi_stream_domain_size_threshold: 3600.0,
        }
    }
}

#[derive(Debug, Clone)]
pub enum StreamOutcome {
    Completed,
    Cancelled,
    Failed(DpError),
}

#[derive(Debug, Clone)]
pub struct StreamStatus {
    pub subrequest_index: usize,
    pub messages: u64,
    pub bytes: u64,
    pub outcome: StreamOutcome,
}

pub struct RecoveryReport {
    pub correlation: CorrelationReport,
    pub processed_message_count: u64,
    pub processed_byte_count: u64,
    pub stream_statuses: Vec<StreamStatus>,
}

/// `decompositionEnabled ∧ estimatedDomainSize(req) ≥ threshold` (§4.2).
pub fn should_engage_multistream(
    config: &RecovererConfig,
    decomposition_enabled: bool,
    original_request: &DataRequest,
) -> bool {
    decomposition_enabled
        && original_request.estimated_domain_size() >= config.multi_stream_domain_size_threshold
}

pub struct MultiStreamRecoverer<T: QueryTransport + 'static> {
    transport: Arc<T>,
    config: RecovererConfig,
}

impl<T: QueryTransport + 'static> MultiStreamRecoverer<T> {
    pub fn new(transport: Arc<T>, config: RecovererConfig) -> Self {
        MultiStreamRecoverer { transport, config }
    }

    /// Recovers and correlates `subrequests`, opening at most
    /// `max(1, config.max_streams)` concurrent streams when multi-streaming
    /// is engaged, or a single stream otherwise.
    ///
    /// `deadline` is observed at every suspension point via a watchdog task
    /// that re-signals the same internal cancel channel a stream's own fatal
    /// error would trigger: caller-driven cancel/deadline and a peer stream's
    /// failure both stop every other stream the same way. On cancel or
    /// deadline, partial results are discarded and `Cancelled` /
    /// `DeadlineExceeded` is returned in preference to any stream's own error.
    pub async fn process_requests(
        &self,
        correlator_config: &CorrelatorConfig,
        decomposition_enabled: bool,
        original_request: &DataRequest,
        subrequests: Vec<DataRequest>,
        deadline: &Deadline,
    ) -> Result<RecoveryReport, DpError> {
        let engaged = should_engage_multistream(&self.config, decomposition_enabled, original_request);
        let concurrency = if engaged {
            self.config.max_streams.max(1).min(subrequests.len().max(1))
        } else {
            1
        };
        debug!(
            "recovering {} subrequest(s) for {} with concurrency {}",
            subrequests.len(),
            original_request.request_id,
            concurrency
        );

        let (cancel_tx, cancel_rx) = watch::channel(false);
        let (fifo_tx, fifo_rx) = mpsc::channel::<DataMessage>(self.config.fifo_capacity.max(1));
        let semaphore = Arc::new(Semaphore::new(concurrency));
        let message_count = Arc::new(AtomicU64::new(0));
        let byte_count = Arc::new(AtomicU64::new(0));

        // Watchdog: re-signals the same cancel channel a stream's own fatal
        // error would, so caller-driven cancellation and a peer's failure
        // both stop the rest of the pool through one code path.
        let fired = Arc::new(std::sync::Mutex::new(None::<Trigger>));
        let watchdog = {
            let deadline = deadline.clone();
            let cancel_tx = cancel_tx.clone();
            let fired = fired.clone();
            tokio::spawn(async move {
                let trigger = deadline.triggered().await;
                *fired.lock().expect("watchdog mutex poisoned") = Some(trigger);
                let _ = cancel_tx.send(true);
            })
        };

        // The correlator consumer always runs concurrently with the stream
        // producers, regardless of `correlate_while_streaming` — otherwise a
        // full FIFO would deadlock against producers nobody is draining.
        // What the flag actually controls is whether grouping happens
        // incrementally as messages arrive (inline) or only once every
        // producer has finished and the FIFO has closed (post-hoc).
        let inline = self.config.correlate_while_streaming;
        let corr_config = correlator_config.clone();
        let corr_deadline = deadline.clone();
        let correlation_task = tokio::spawn(async move {
            if inline {
                correlate_stream(corr_config, fifo_rx, &corr_deadline).await
            } else {
                let mut buffered = Vec::new();
                let mut rx = fifo_rx;
                loop {
                    tokio::select! {
                        biased;
                        trigger = corr_deadline.triggered() => {
                            return Err(match trigger {
                                Trigger::Cancelled => DpError::Cancelled { subsystem: Subsystem::Correlator },
                                Trigger::DeadlineExceeded => DpError::DeadlineExceeded { subsystem: Subsystem::Correlator },
                            });
                        }
                        next = rx.recv() => {
                            match next {
                                Some(message) => buffered.push(message),
                                None => break,
                            }
                        }
                    }
                }
                correlate_batch(&corr_config, buffered)
            }
        });

        let mut stream_tasks = Vec::with_capacity(subrequests.len());
        for (index, subrequest) in subrequests.into_iter().enumerate() {
            let transport = self.transport.clone();
            let semaphore = semaphore.clone();
            let fifo_tx = fifo_tx.clone();
            let mut cancel_rx = cancel_rx.clone();
            let cancel_tx = cancel_tx.clone();
            let message_count = message_count.clone();
            let byte_count = byte_count.clone();

            stream_tasks.push(tokio::spawn(async move {
                let _permit = semaphore.acquire_owned().await.expect("semaphore not closed");
                run_one_stream(
                    index,
                    transport.as_ref(),
                    subrequest,
                    fifo_tx,
                    &mut cancel_rx,
                    cancel_tx,
                    message_count,
                    byte_count,
                )
                .await
            }));
        }

        drop(fifo_tx);
        drop(cancel_rx);

        let mut stream_statuses = Vec::with_capacity(stream_tasks.len());
        for task in stream_tasks {
            let status = task.await.expect("stream task panicked");
            if let StreamOutcome::Failed(e) = &status.outcome {
                warn!("stream {} failed: {:#?}", status.subrequest_index, e);
            }
            stream_statuses.push(status);
        }

        // Every producer has returned by now (whether completed, cancelled or
        // failed), so its `fifo_tx` clone has dropped; the correlator task
        // will observe channel closure and finish on its own.
        watchdog.abort();
        let correlation_result = correlation_task.await.expect("correlator task panicked");

        // Caller-driven cancel/deadline takes priority over any individual
        // stream's own failure: it's a more authoritative signal and the
        // results it interrupted are necessarily partial.
        if let Some(trigger) = *fired.lock().expect("watchdog mutex poisoned") {
            return Err(match trigger {
                Trigger::Cancelled => DpError::Cancelled { subsystem: Subsystem::Recoverer },
                Trigger::DeadlineExceeded => DpError::DeadlineExceeded { subsystem: Subsystem::Recoverer },
            });
        }

        let correlation = correlation_result?;

        // Surface the first stream failure, in subrequest order, as the
        // overall result (§4.2 cancellation: "surfaces the first error").
        if let Some(StreamOutcome::Failed(e)) =
            stream_statuses.iter().map(|s| s.outcome.clone()).find(|o| matches!(o, StreamOutcome::Failed(_)))
        {
            return Err(e);
        }

        Ok(RecoveryReport {
            correlation,
            processed_message_count: message_count.load(Ordering::SeqCst),
            processed_byte_count: byte_count.load(Ordering::SeqCst),
            stream_statuses,
        })
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_one_stream<T: QueryTransport>(
    index: usize,
    transport: &T,
    subrequest: DataRequest,
    fifo_tx: mpsc::Sender<DataMessage>,
    cancel_rx: &mut watch::Receiver<bool>,
    cancel_tx: watch::Sender<bool>,
    message_count: Arc<AtomicU64>,
    byte_count: Arc<AtomicU64>,
) -> StreamStatus {
    let opened = match subrequest.stream_type() {
        StreamType::Backward => transport.open_backward(&subrequest).await,
        StreamType::Bidirectional => transport.open_bidirectional(&subrequest).await,
    };

    let mut stream = match opened {
        Ok(stream) => stream,
        Err(e) => {
            let _ = cancel_tx.send(true);
            return StreamStatus {
                subrequest_index: index,
                messages: 0,
                bytes: 0,
                outcome: StreamOutcome::Failed(e),
            };
        }
    };

    let mut messages = 0u64;
    let mut bytes = 0u64;

    loop {
        tokio::select! {
            biased;
            _ = cancel_rx.changed() => {
                if *cancel_rx.borrow() {
                    return StreamStatus { subrequest_index: index, messages, bytes, outcome: StreamOutcome::Cancelled };
                }
            }
            next = stream.next() => {
                match next {
                    None => {
                        return StreamStatus { subrequest_index: index, messages, bytes, outcome: StreamOutcome::Completed };
                    }
                    Some(Err(e)) => {
                        let _ = cancel_tx.send(true);
                        return StreamStatus { subrequest_index: index, messages, bytes, outcome: StreamOutcome::Failed(e) };
                    }
                    Some(Ok(RawQueryMessage::Exceptional { status, message })) => {
                        let _ = cancel_tx.send(true);
                        return StreamStatus {
                            subrequest_index: index,
                            messages,
                            bytes,
                            outcome: StreamOutcome::Failed(DpError::RequestRejected {
                                subsystem: Subsystem::Recoverer,
                                message: format!("{status}: {message}"),
                            }),
                        };
                    }
                    Some(Ok(RawQueryMessage::Data { time, columns, payload_bytes })) => {
                        messages += 1;
                        bytes += payload_bytes;
                        message_count.fetch_add(1, Ordering::SeqCst);
                        byte_count.fetch_add(payload_bytes, Ordering::SeqCst);
                        let data_message = DataMessage {
                            stream_id: index as u64,
                            time: match time {
                                MessageTime::Clock(c) => MessageTime::Clock(c),
                                MessageTime::TmsList(l) => MessageTime::TmsList(l),
                            },
                            columns,
                            payload_bytes,
                        };
                        if fifo_tx.send(data_message).await.is_err() {
                            return StreamStatus { subrequest_index: index, messages, bytes, outcome: StreamOutcome::Cancelled };
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use tokio_stream::wrappers::ReceiverStream;

    use crate::frame::DataColumn;
    use crate::time::{SamplingClock, TimeInstant, TimeUnit};
    use crate::value::{ElementType, Value};

    fn req(id: &str, pv: &str) -> DataRequest {
        DataRequest::new(
            id,
            [pv.to_string()].into_iter().collect(),
            TimeInterval::new(TimeInstant::from_seconds(0), TimeInstant::from_seconds(10)).unwrap(),
            StreamType::Backward,
        )
        .unwrap()
    }

    fn data_message(start: i64, pv: &str) -> RawQueryMessage {
        let clock = SamplingClock::new(TimeInstant::from_seconds(start), 1, 1, TimeUnit::Seconds).unwrap();
        RawQueryMessage::Data {
            time: MessageTime::Clock(clock),
            columns: vec![DataColumn::new(pv, ElementType::Int32, vec![Value::Int32(1)])],
            payload_bytes: 4,
        }
    }

    /// Replays a fixed, per-subrequest-index script of outcomes. Each script
    /// entry is either a vector of messages to emit (stream ends after) or an
    /// error to fail the `open_*` call with immediately.
    struct ScriptedTransport {
        scripts: Mutex<Vec<VecDeque<RawQueryMessage>>>,
        open_errors: Mutex<Vec<Option<DpError>>>,
        opened: Arc<AtomicU64>,
    }

    impl ScriptedTransport {
        fn new(scripts: Vec<Vec<RawQueryMessage>>) -> Self {
            ScriptedTransport {
                scripts: Mutex::new(scripts.into_iter().map(VecDeque::from).collect()),
                open_errors: Mutex::new(Vec::new()),
                opened: Arc::new(AtomicU64::new(0)),
            }
        }

        async fn open(&self) -> Result<QueryMessageStream, DpError> {
            let idx = self.opened.fetch_add(1, Ordering::SeqCst) as usize;
            let messages = self
                .scripts
                .lock()
                .unwrap()
                .get(idx)
                .cloned()
                .unwrap_or_default();
            let (tx, rx) = mpsc::channel(messages.len().max(1));
            for message in messages {
                tx.send(Ok(message)).await.ok();
            }
            Ok(Box::pin(ReceiverStream::new(rx)))
        }
    }

    #[async_trait::async_trait]
    impl QueryTransport for ScriptedTransport {
        async fn open_backward(&self, _subrequest: &DataRequest) -> Result<QueryMessageStream, DpError> {
            self.open().await
        }

        async fn open_bidirectional(&self, _subrequest: &DataRequest) -> Result<QueryMessageStream, DpError> {
            self.open().await
        }
    }

    #[tokio::test]
    async fn recovers_and_correlates_across_streams() {
        let transport = Arc::new(ScriptedTransport::new(vec![
            vec![data_message(0, "A")],
            vec![data_message(1, "B")],
        ]));
        let recoverer = MultiStreamRecoverer::new(transport, RecovererConfig::default());
        let original = req("r1", "A");
        let subs = vec![req("r1", "A"), req("r1", "B")];

        let report = recoverer
            .process_requests(&CorrelatorConfig::default(), true, &original, subs, &Deadline::none())
            .await
            .unwrap();

        assert_eq!(report.processed_message_count, 2);
        assert_eq!(report.correlation.blocks.len(), 2);
        assert!(report
            .stream_statuses
            .iter()
            .all(|s| matches!(s.outcome, StreamOutcome::Completed)));
    }

    #[tokio::test]
    async fn exceptional_first_message_surfaces_as_request_rejected() {
        let transport = Arc::new(ScriptedTransport::new(vec![vec![RawQueryMessage::Exceptional {
            status: "PERMISSION_DENIED".into(),
            message: "no access to PV A".into(),
        }]]));
        let recoverer = MultiStreamRecoverer::new(transport, RecovererConfig::default());
        let original = req("r1", "A");
        let subs = vec![req("r1", "A")];

        let err = recoverer
            .process_requests(&CorrelatorConfig::default(), false, &original, subs, &Deadline::none())
            .await
            .unwrap_err();

        assert_eq!(err.kind(), crate::error::ErrorKind::RequestRejected);
    }

    #[tokio::test]
    async fn one_stream_failure_cancels_the_rest_and_surfaces_first_error() {
        let transport = Arc::new(ScriptedTransport::new(vec![
            vec![RawQueryMessage::Exceptional {
                status: "UNAVAILABLE".into(),
                message: "archive offline".into(),
            }],
            vec![data_message(0, "B"), data_message(1, "B")],
        ]));
        let recoverer = MultiStreamRecoverer::new(transport, RecovererConfig::default());
        let original = req("r1", "A");
        let subs = vec![req("r1", "A"), req("r1", "B")];

        let err = recoverer
            .process_requests(&CorrelatorConfig::default(), true, &original, subs, &Deadline::none())
            .await
            .unwrap_err();

        assert_eq!(err.kind(), crate::error::ErrorKind::RequestRejected);
    }

    #[tokio::test]
    async fn caller_cancellation_surfaces_as_cancelled() {
        let transport = Arc::new(ScriptedTransport::new(vec![vec![data_message(0, "A")]]));
        let recoverer = MultiStreamRecoverer::new(transport, RecovererConfig::default());
        let original = req("r1", "A");
        let subs = vec![req("r1", "A")];

        let token = crate::cancel::CancellationToken::new();
        token.cancel();
        let deadline = Deadline::with_token(token);

        let err = recoverer
            .process_requests(&CorrelatorConfig::default(), false, &original, subs, &deadline)
            .await
            .unwrap_err();

        assert_eq!(err.kind(), crate::error::ErrorKind::Cancelled);
    }
}
