//! IngestionFrame binning and the Streaming Ingest Processor (§4.6).
//!
//! Binning splits an oversize frame into transport-sized composite frames;
//! the processor drives a bidirectional ingest RPC through an explicit
//! `Idle -> Streaming -> {Completed|Failed}` state machine.

use std::time::Duration;

use futures_util::StreamExt;
use log::*;
use tokio::sync::mpsc;

use crate::cancel::{CancellationToken, Deadline, Trigger};
use crate::error::{DpError, Subsystem};
use crate::frame::{DataColumn, FrameMetadata, FrameTime, IngestionFrame};
use crate::transport::{IngestAck, IngestionTransport};
use crate::uid::UidGenerator;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Deserialize)]
pub enum BinningAxis {
    /// Split by rows: each composite keeps every column but fewer rows.
    Row,
    /// Split by columns: each composite keeps every row but fewer columns.
    Column,
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct IngestConfig {
    pub transport_message_cap_bytes: u64,
    pub binning_axis: BinningAxis,
    /// Capacity of the bounded supplier queue feeding the producer task.
    pub queue_capacity: usize,
    /// How long the producer waits for the next frame before the session
    /// fails with `SupplierEmptyPoll`.
    pub poll_timeout_ms: u64,
}

impl Default for IngestConfig {
    fn default() -> Self {
        IngestConfig {
            transport_message_cap_bytes: 4 * 1024 * 1024,
            binning_axis: BinningAxis::Row,
            queue_capacity: 64,
            poll_timeout_ms: 30_000,
        }
    }
}

/// Splits `frame` into one or more composite frames, each under
/// `config.transport_message_cap_bytes`. Each composite inherits the
/// parent's metadata except for a freshly derived `clientRequestUid`.
/// Returns `frame` unchanged (as a single-element vector) if it already
/// fits.
pub fn bin_frame(
    config: &IngestConfig,
    uids: &UidGenerator,
    frame: &IngestionFrame,
) -> Result<Vec<IngestionFrame>, DpError> {
    if frame.estimated_size_bytes() <= config.transport_message_cap_bytes || frame.row_count() == 0 {
        return Ok(vec![frame.copy_shallow()]);
    }

    match config.binning_axis {
        BinningAxis::Row => bin_by_rows(config, uids, frame),
        BinningAxis::Column => bin_by_columns(config, uids, frame),
    }
}

fn derived_metadata(uids: &UidGenerator, parent: &FrameMetadata) -> FrameMetadata {
    FrameMetadata {
        client_request_uid: uids.derive(&parent.client_request_uid),
        ..parent.clone()
    }
}

fn bin_by_rows(
    config: &IngestConfig,
    uids: &UidGenerator,
    frame: &IngestionFrame,
) -> Result<Vec<IngestionFrame>, DpError> {
    let total_rows = frame.row_count();
    let per_row_bytes = (frame.estimated_size_bytes().max(1)) / (total_rows.max(1) as u64);
    let rows_per_piece = (config.transport_message_cap_bytes / per_row_bytes.max(1)).max(1) as usize;

    let mut pieces = Vec::new();
    let mut start = 0usize;
    while start < total_rows {
        let end = (start + rows_per_piece).min(total_rows);
        let piece_time = slice_time(frame.time(), start, end)?;
        let mut piece = IngestionFrame::new(piece_time, derived_metadata(uids, frame.metadata()))?;
        for column in frame.columns() {
            piece.add_column(DataColumn::new(
                column.name(),
                column.element_type().clone(),
                column.values()[start..end].to_vec(),
            ))?;
        }
        pieces.push(piece);
        start = end;
    }
    Ok(pieces)
}

fn bin_by_columns(
    config: &IngestConfig,
    uids: &UidGenerator,
    frame: &IngestionFrame,
) -> Result<Vec<IngestionFrame>, DpError> {
    let columns: Vec<&DataColumn> = frame.columns().collect();
    if columns.is_empty() {
        return Ok(vec![frame.copy_shallow()]);
    }

    let per_column_bytes: Vec<u64> = columns
        .iter()
        .map(|c| frame.estimated_size_bytes() / (columns.len().max(1) as u64))
        .collect();

    let mut pieces = Vec::new();
    let mut current_columns: Vec<&DataColumn> = Vec::new();
    let mut current_bytes = 0u64;

    let flush = |cols: &[&DataColumn], uids: &UidGenerator, frame: &IngestionFrame| -> Result<IngestionFrame, DpError> {
        let mut piece = IngestionFrame::new(frame.time().clone(), derived_metadata(uids, frame.metadata()))?;
        for column in cols {
            piece.add_column((**column).clone())?;
        }
        Ok(piece)
    };

    for (column, bytes) in columns.iter().zip(per_column_bytes) {
        if !current_columns.is_empty() && current_bytes + bytes > config.transport_message_cap_bytes {
            pieces.push(flush(&current_columns, uids, frame)?);
            current_columns.clear();
            current_bytes = 0;
        }
        current_columns.push(column);
        current_bytes += bytes;
    }
    if !current_columns.is_empty() {
        pieces.push(flush(&current_columns, uids, frame)?);
    }
    Ok(pieces)
}

fn slice_time(time: &FrameTime, start: usize, end: usize) -> Result<FrameTime, DpError> {
    match time {
        FrameTime::Clock(clock) => {
            let new_start = if start == 0 {
                clock.start
            } else {
                clock.start.advance(start as i64, clock.period, clock.period_units)
            };
            Ok(FrameTime::Clock(crate::time::SamplingClock {
                start: new_start,
                period: clock.period,
                count: (end - start) as u64,
                period_units: clock.period_units,
            }))
        }
        FrameTime::TmsList(list) => {
            let slice = list.as_slice()[start..end].to_vec();
            crate::time::TimestampList::new(slice, list.is_ordered())
                .map(FrameTime::TmsList)
                .map_err(|message| DpError::ConfigInvalid {
                    subsystem: Subsystem::Ingest,
                    message: message.to_string(),
                })
        }
    }
}

/// State of one ingest session, per §4.6's explicit state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestState {
    Idle,
    Streaming,
    Completed,
    Failed,
}

pub struct IngestReport {
    pub frames_sent: u64,
    pub acks_received: u64,
    pub final_state: IngestState,
}

/// Drives `frames` through one bidirectional ingest session: a producer task
/// pulls frames off a bounded supplier queue and sends them on the forward
/// half while a consumer task concurrently drains the backward half for
/// acknowledgements (§4.6). Completion requires the supplier drained, the
/// forward half closed, and the backward half observed to completion.
///
/// Any acknowledgement with `exceptionalResult` cancels the forward half
/// immediately. The producer fails the session with `SupplierEmptyPoll` if
/// the supplier queue yields nothing within `config.poll_timeout_ms`, and
/// observes `deadline` at every suspension point.
pub async fn run_ingest_session<T: IngestionTransport>(
    transport: &T,
    config: &IngestConfig,
    frames: Vec<IngestionFrame>,
    deadline: &Deadline,
) -> Result<IngestReport, DpError> {
    let (mut sink, mut acks) = transport.open_bidirectional().await?;

    let (supply_tx, mut supply_rx) = mpsc::channel::<IngestionFrame>(config.queue_capacity.max(1));
    tokio::spawn(async move {
        for frame in frames {
            if supply_tx.send(frame).await.is_err() {
                break;
            }
        }
    });

    let cancel_forward = CancellationToken::new();
    let poll_timeout = Duration::from_millis(config.poll_timeout_ms.max(1));

    let consumer_cancel = cancel_forward.clone();
    let consumer = tokio::spawn(async move {
        let mut acks_received = 0u64;
        let mut failed = false;
        while let Some(ack) = acks.next().await {
            match ack {
                Ok(IngestAck::Ack) => acks_received += 1,
                Ok(IngestAck::Exceptional { status, message }) => {
                    warn!("ingest acknowledgement rejected: {status}: {message}");
                    failed = true;
                    consumer_cancel.cancel();
                    break;
                }
                Err(e) => {
                    error!("failed to receive ingest acknowledgement: {:#?}", e);
                    failed = true;
                    consumer_cancel.cancel();
                    break;
                }
            }
        }
        (acks_received, failed)
    });

    let mut frames_sent = 0u64;
    let mut producer_error: Option<DpError> = None;

    'producer: loop {
        tokio::select! {
            biased;
            _ = cancel_forward.cancelled() => {
                break 'producer;
            }
            trigger = deadline.triggered() => {
                producer_error = Some(match trigger {
                    Trigger::Cancelled => DpError::Cancelled { subsystem: Subsystem::Ingest },
                    Trigger::DeadlineExceeded => DpError::DeadlineExceeded { subsystem: Subsystem::Ingest },
                });
                break 'producer;
            }
            polled = tokio::time::timeout(poll_timeout, supply_rx.recv()) => {
                match polled {
                    Ok(Some(frame)) => {
                        if let Err(e) = sink.send(&frame).await {
                            error!("failed to send ingestion frame: {:#?}", e);
                            producer_error = Some(e);
                            break 'producer;
                        }
                        frames_sent += 1;
                    }
                    Ok(None) => {
                        if let Err(e) = sink.complete().await {
                            error!("failed to close ingest sink: {:#?}", e);
                            producer_error = Some(e);
                        }
                        break 'producer;
                    }
                    Err(_elapsed) => {
                        warn!("ingest supplier produced nothing within {:?}", poll_timeout);
                        producer_error = Some(DpError::SupplierEmptyPoll { subsystem: Subsystem::Ingest });
                        break 'producer;
                    }
                }
            }
        }
    }

    let (acks_received, consumer_failed) = consumer.await.expect("ingest consumer task panicked");

    if let Some(e) = producer_error {
        return Err(e);
    }

    let state = if cancel_forward.is_cancelled() || consumer_failed {
        IngestState::Failed
    } else {
        IngestState::Completed
    };

    Ok(IngestReport {
        frames_sent,
        acks_received,
        final_state: state,
    })
}
