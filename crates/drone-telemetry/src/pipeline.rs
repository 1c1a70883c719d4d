// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Per-device generation pipeline
//!
//! Two stages connected by a bounded FIFO buffer:
//!
//! ```text
//! producer ──> [ buffer (bounded) ] ──> consumer ──> send tasks (<= max_concurrent_sends)
//!    │                                       │
//!    └── generator                           └── pool.acquire()
//! ```
//!
//! - The producer suspends when the buffer is full. Once cancelled it still
//!   enqueues the record it already generated, then stops.
//! - The consumer takes a send permit, pulls the next record and checks out a
//!   pooled handle, in that order, before spawning the send. Sends therefore
//!   start in buffer order. With the default of one concurrent send a record
//!   is only sent after the previous one completed, so a device's records
//!   arrive in generation order. Higher values trade that for throughput:
//!   sends still start in order but may complete out of order.
//! - The producer closes its side of the buffer when it stops (limit reached
//!   or cancelled). The consumer then drains what is left and stops.
//! - A send failure cancels the shared token. Records not yet sent at that
//!   point are counted as dropped, so `generated == sent + failed + dropped`.

use crate::codec::{self, CodecError};
use crate::generator::TelemetryGenerator;
use crate::model::DeviceStateRecord;
use crate::pool::ConnectionPool;
use crate::transport::{Transport, TransportError};
use std::ops::AddAssign;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// Pipeline errors.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Invalid pipeline configuration: {0}")]
    InvalidConfig(String),

    #[error("Send failed for {device_id} #{sequence}: {source}")]
    Transport {
        device_id: String,
        sequence: u64,
        #[source]
        source: TransportError,
    },

    #[error("Encode failed for {device_id} #{sequence}: {source}")]
    Codec {
        device_id: String,
        sequence: u64,
        #[source]
        source: CodecError,
    },

    #[error("Send task for {device_id} aborted: {reason}")]
    Task { device_id: String, reason: String },
}

/// Runtime parameters of one device pipeline.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
    /// Every Nth record is a forced keyframe (0 disables).
    pub key_frame_interval: u64,
    /// Lower bound of the random keyframe interval.
    pub random_key_frame_min: u64,
    /// Upper bound (exclusive) of the random keyframe interval.
    pub random_key_frame_max: u64,
    /// Pause after each record.
    pub message_delay: Duration,
    /// Buffer capacity between producer and consumer.
    pub buffer_capacity: usize,
    /// Concurrent sends per device. Above 1, completion order within the
    /// device is no longer guaranteed.
    pub max_concurrent_sends: usize,
    /// Delay before the first record.
    pub start_delay: Duration,
    /// Extra random delay, uniform in `[0, start_jitter)`, added to the start.
    pub start_jitter: Duration,
    /// Stop after this many records.
    pub max_messages: Option<u64>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            key_frame_interval: 100,
            random_key_frame_min: 10,
            random_key_frame_max: 100,
            message_delay: Duration::from_millis(1000),
            buffer_capacity: 100_000,
            max_concurrent_sends: 1,
            start_delay: Duration::from_millis(1000),
            start_jitter: Duration::ZERO,
            max_messages: None,
        }
    }
}

impl PipelineConfig {
    /// Check bounds.
    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.buffer_capacity == 0 {
            return Err(PipelineError::InvalidConfig(
                "buffer_capacity must be > 0".into(),
            ));
        }
        if self.max_concurrent_sends == 0 {
            return Err(PipelineError::InvalidConfig(
                "max_concurrent_sends must be > 0".into(),
            ));
        }
        if self.random_key_frame_min > self.random_key_frame_max {
            return Err(PipelineError::InvalidConfig(format!(
                "random keyframe range {}..{} is inverted",
                self.random_key_frame_min, self.random_key_frame_max
            )));
        }
        Ok(())
    }
}

/// Live counters of one pipeline.
#[derive(Debug, Default)]
pub struct PipelineStats {
    pub generated: AtomicU64,
    pub key_frames: AtomicU64,
    pub enqueued: AtomicU64,
    pub sent: AtomicU64,
    pub failed: AtomicU64,
    pub dropped: AtomicU64,
}

impl PipelineStats {
    pub fn snapshot(&self) -> PipelineStatsSnapshot {
        PipelineStatsSnapshot {
            generated: self.generated.load(Ordering::Relaxed),
            key_frames: self.key_frames.load(Ordering::Relaxed),
            enqueued: self.enqueued.load(Ordering::Relaxed),
            sent: self.sent.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`PipelineStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineStatsSnapshot {
    pub generated: u64,
    pub key_frames: u64,
    pub enqueued: u64,
    pub sent: u64,
    pub failed: u64,
    pub dropped: u64,
}

impl AddAssign for PipelineStatsSnapshot {
    fn add_assign(&mut self, other: Self) {
        self.generated += other.generated;
        self.key_frames += other.key_frames;
        self.enqueued += other.enqueued;
        self.sent += other.sent;
        self.failed += other.failed;
        self.dropped += other.dropped;
    }
}

struct Queued {
    sequence: u64,
    record: DeviceStateRecord,
}

/// Generation pipeline for one device.
pub struct DevicePipeline<T> {
    device_id: String,
    config: PipelineConfig,
    generator: Arc<TelemetryGenerator>,
    pool: ConnectionPool<T>,
    stats: Arc<PipelineStats>,
}

impl<T> DevicePipeline<T>
where
    T: Transport + 'static,
{
    pub fn new(
        device_id: impl Into<String>,
        config: PipelineConfig,
        generator: Arc<TelemetryGenerator>,
        pool: ConnectionPool<T>,
    ) -> Result<Self, PipelineError> {
        config.validate()?;
        Ok(Self {
            device_id: device_id.into(),
            config,
            generator,
            pool,
            stats: Arc::new(PipelineStats::default()),
        })
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Shared counters, readable while the pipeline runs.
    pub fn stats(&self) -> Arc<PipelineStats> {
        Arc::clone(&self.stats)
    }

    /// Run until the message limit is reached or `token` is cancelled, then
    /// drain the buffer.
    ///
    /// A send failure cancels `token` and is returned once the pipeline has
    /// wound down.
    pub async fn run(self, token: CancellationToken) -> Result<PipelineStatsSnapshot, PipelineError> {
        let (tx, rx) = mpsc::channel(self.config.buffer_capacity);
        tracing::debug!(
            "Pipeline {} starting (buffer={}, concurrency={})",
            self.device_id,
            self.config.buffer_capacity,
            self.config.max_concurrent_sends
        );

        let ((), consumed) = tokio::join!(self.produce(tx, &token), self.consume(rx, &token));
        let snapshot = self.stats.snapshot();

        tracing::debug!(
            "Pipeline {} finished: generated={} sent={} failed={} dropped={}",
            self.device_id,
            snapshot.generated,
            snapshot.sent,
            snapshot.failed,
            snapshot.dropped
        );
        consumed.map(|()| snapshot)
    }

    async fn produce(&self, tx: mpsc::Sender<Queued>, token: &CancellationToken) {
        let mut start = self.config.start_delay;
        let jitter_ms = self.config.start_jitter.as_millis() as u64;
        if jitter_ms > 0 {
            start += Duration::from_millis(self.generator.random_in(0, jitter_ms));
        }
        if !start.is_zero() {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = tokio::time::sleep(start) => {}
            }
        }

        let mut last_key_frame: Option<DeviceStateRecord> = None;
        let mut sequence: u64 = 0;

        loop {
            if token.is_cancelled() {
                break;
            }
            if self.config.max_messages.is_some_and(|max| sequence >= max) {
                break;
            }
            sequence += 1;

            let record = self.generator.next_state(
                last_key_frame.as_ref(),
                &self.device_id,
                self.key_frame_due(sequence),
            );
            self.stats.generated.fetch_add(1, Ordering::Relaxed);
            if record.is_key_frame {
                self.stats.key_frames.fetch_add(1, Ordering::Relaxed);
                last_key_frame = Some(record.clone());
            }
            tracing::trace!("{} #{} generated: {}", self.device_id, sequence, record);

            // Not raced against the token: a generated record is always
            // handed over, and the consumer keeps draining until the buffer
            // closes.
            if tx.send(Queued { sequence, record }).await.is_err() {
                // Consumer stopped after a failure.
                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                break;
            }
            self.stats.enqueued.fetch_add(1, Ordering::Relaxed);

            if !self.config.message_delay.is_zero() {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(self.config.message_delay) => {}
                }
            }
        }

        tracing::debug!("{} producer stopped after #{}", self.device_id, sequence);
        // Dropping `tx` closes the buffer.
    }

    fn key_frame_due(&self, sequence: u64) -> bool {
        let interval = self.config.key_frame_interval;
        if interval > 0 && sequence % interval == 0 {
            return true;
        }
        let random = self
            .generator
            .random_in(self.config.random_key_frame_min, self.config.random_key_frame_max);
        random > 0 && sequence % random == 0
    }

    async fn consume(
        &self,
        mut rx: mpsc::Receiver<Queued>,
        token: &CancellationToken,
    ) -> Result<(), PipelineError> {
        let permits = Arc::new(Semaphore::new(self.config.max_concurrent_sends));
        let transport_failed = Arc::new(AtomicBool::new(false));
        let mut in_flight: JoinSet<Result<(), (u64, TransportError)>> = JoinSet::new();
        let mut first_error: Option<PipelineError> = None;

        loop {
            while let Some(done) = in_flight.try_join_next() {
                self.record_outcome(done, &mut first_error);
            }
            if first_error.is_some() || transport_failed.load(Ordering::Acquire) {
                break;
            }

            let permit = match Arc::clone(&permits).acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => break,
            };
            let Some(Queued { sequence, record }) = rx.recv().await else {
                break;
            };
            if transport_failed.load(Ordering::Acquire) {
                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                break;
            }

            let payload = match codec::encode(&record) {
                Ok(payload) => payload,
                Err(source) => {
                    tracing::error!("{} #{} encode failed: {}", self.device_id, sequence, source);
                    self.stats.failed.fetch_add(1, Ordering::Relaxed);
                    token.cancel();
                    first_error.get_or_insert(PipelineError::Codec {
                        device_id: self.device_id.clone(),
                        sequence,
                        source,
                    });
                    break;
                }
            };

            let mut handle = match self.pool.acquire().await {
                Ok(handle) => handle,
                Err(e) => {
                    tracing::error!("{} #{} no connection: {}", self.device_id, sequence, e);
                    self.stats.failed.fetch_add(1, Ordering::Relaxed);
                    transport_failed.store(true, Ordering::Release);
                    token.cancel();
                    first_error.get_or_insert(PipelineError::Transport {
                        device_id: self.device_id.clone(),
                        sequence,
                        source: TransportError::Pool(e),
                    });
                    break;
                }
            };

            let stats = Arc::clone(&self.stats);
            let failed = Arc::clone(&transport_failed);
            let token = token.clone();
            let device_id = self.device_id.clone();
            in_flight.spawn(async move {
                let _permit = permit;
                match handle.send(&payload).await {
                    Ok(()) => {
                        stats.sent.fetch_add(1, Ordering::Relaxed);
                        tracing::trace!("{} #{} sent ({} bytes)", device_id, sequence, payload.len());
                        Ok(())
                    }
                    Err(e) => {
                        stats.failed.fetch_add(1, Ordering::Relaxed);
                        tracing::error!("{} #{} send failed: {}", device_id, sequence, e);
                        failed.store(true, Ordering::Release);
                        token.cancel();
                        Err((sequence, e))
                    }
                }
            });
        }

        // Stop the producer if we bailed out early, then count what is left.
        rx.close();
        while rx.recv().await.is_some() {
            self.stats.dropped.fetch_add(1, Ordering::Relaxed);
        }

        while let Some(done) = in_flight.join_next().await {
            self.record_outcome(done, &mut first_error);
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn record_outcome(
        &self,
        done: Result<Result<(), (u64, TransportError)>, tokio::task::JoinError>,
        first_error: &mut Option<PipelineError>,
    ) {
        let error = match done {
            Ok(Ok(())) => return,
            Ok(Err((sequence, source))) => PipelineError::Transport {
                device_id: self.device_id.clone(),
                sequence,
                source,
            },
            Err(join_error) => PipelineError::Task {
                device_id: self.device_id.clone(),
                reason: join_error.to_string(),
            },
        };
        if first_error.is_none() {
            *first_error = Some(error);
        }
    }
}
