// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Fleet runner
//!
//! Runs one [`DevicePipeline`] per simulated device over a shared
//! [`ConnectionPool`] and [`TelemetryGenerator`]. All pipelines observe one
//! cancellation token, so a transport failure in any device, the run timer,
//! or the caller's own token stops the whole fleet.

use crate::generator::TelemetryGenerator;
use crate::pipeline::{
    DevicePipeline, PipelineConfig, PipelineError, PipelineStats, PipelineStatsSnapshot,
};
use crate::pool::ConnectionPool;
use crate::transport::Transport;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// Default device id prefix.
pub const DEFAULT_DEVICE_PREFIX: &str = "drone-";

/// Outcome of a fleet run.
#[derive(Debug)]
pub struct FleetReport {
    pub devices: usize,
    pub totals: PipelineStatsSnapshot,
    pub elapsed: Duration,
    /// First pipeline failure, if the run was stopped by one.
    pub failure: Option<PipelineError>,
}

impl FleetReport {
    /// Records sent per second over the whole run.
    pub fn messages_per_second(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            self.totals.sent as f64 / secs
        } else {
            0.0
        }
    }

    pub fn is_success(&self) -> bool {
        self.failure.is_none()
    }
}

/// A fleet of simulated devices.
pub struct Fleet<T> {
    device_count: usize,
    device_prefix: String,
    pipeline: PipelineConfig,
    run_for: Option<Duration>,
    report_interval: Option<Duration>,
    generator: Arc<TelemetryGenerator>,
    pool: ConnectionPool<T>,
}

impl<T> Fleet<T>
where
    T: Transport + 'static,
{
    pub fn new(device_count: usize, pipeline: PipelineConfig, pool: ConnectionPool<T>) -> Self {
        Self {
            device_count,
            device_prefix: DEFAULT_DEVICE_PREFIX.to_string(),
            pipeline,
            run_for: None,
            report_interval: None,
            generator: Arc::new(TelemetryGenerator::new()),
            pool,
        }
    }

    /// Stop the fleet after `duration`.
    pub fn with_run_duration(mut self, duration: Option<Duration>) -> Self {
        self.run_for = duration;
        self
    }

    /// Log aggregate counters every `interval`.
    pub fn with_report_interval(mut self, interval: Option<Duration>) -> Self {
        self.report_interval = interval;
        self
    }

    pub fn with_generator(mut self, generator: Arc<TelemetryGenerator>) -> Self {
        self.generator = generator;
        self
    }

    pub fn with_device_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.device_prefix = prefix.into();
        self
    }

    /// Device ids in start order.
    pub fn device_ids(&self) -> Vec<String> {
        (0..self.device_count)
            .map(|i| format!("{}{}", self.device_prefix, i))
            .collect()
    }

    /// Run every device until all pipelines finish.
    ///
    /// Cancelling `token` stops the fleet gracefully. The fleet itself runs on
    /// a child of `token`, so a device failure does not cancel the caller.
    pub async fn run(self, token: CancellationToken) -> Result<FleetReport, PipelineError> {
        self.pipeline.validate()?;
        let fleet_token = token.child_token();
        let started = Instant::now();

        let mut pipelines = JoinSet::new();
        let mut stats: Vec<Arc<PipelineStats>> = Vec::with_capacity(self.device_count);
        for device_id in self.device_ids() {
            let pipeline = DevicePipeline::new(
                device_id,
                self.pipeline.clone(),
                Arc::clone(&self.generator),
                self.pool.clone(),
            )?;
            stats.push(pipeline.stats());
            pipelines.spawn(pipeline.run(fleet_token.clone()));
        }
        tracing::info!(
            "Fleet started: {} devices, pool size {}",
            self.device_count,
            self.pool.capacity()
        );

        let done = CancellationToken::new();
        if let Some(run_for) = self.run_for {
            let fleet_token = fleet_token.clone();
            let done = done.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = done.cancelled() => {}
                    _ = tokio::time::sleep(run_for) => {
                        tracing::info!("Run duration of {:?} reached, stopping fleet", run_for);
                        fleet_token.cancel();
                    }
                }
            });
        }
        if let Some(interval) = self.report_interval.filter(|i| !i.is_zero()) {
            let stats = stats.clone();
            let done = done.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.tick().await;
                loop {
                    tokio::select! {
                        _ = done.cancelled() => break,
                        _ = ticker.tick() => {
                            let t = sum(&stats);
                            tracing::info!(
                                "Fleet progress: generated={} sent={} failed={} buffered={}",
                                t.generated,
                                t.sent,
                                t.failed,
                                t.enqueued.saturating_sub(t.sent + t.failed + t.dropped)
                            );
                        }
                    }
                }
            });
        }

        let mut failure: Option<PipelineError> = None;
        while let Some(joined) = pipelines.join_next().await {
            let err = match joined {
                Ok(Ok(_)) => continue,
                Ok(Err(e)) => e,
                Err(join_error) => PipelineError::Task {
                    device_id: "<fleet>".into(),
                    reason: join_error.to_string(),
                },
            };
            // Any failure stops every device.
            fleet_token.cancel();
            if failure.is_none() {
                tracing::error!("Fleet stopping: {}", err);
                failure = Some(err);
            }
        }
        done.cancel();

        let report = FleetReport {
            devices: self.device_count,
            totals: sum(&stats),
            elapsed: started.elapsed(),
            failure,
        };
        tracing::info!(
            "Fleet finished in {:.1}s: sent={} ({:.1} msg/s), failed={}, dropped={}",
            report.elapsed.as_secs_f64(),
            report.totals.sent,
            report.messages_per_second(),
            report.totals.failed,
            report.totals.dropped
        );
        Ok(report)
    }
}

fn sum(stats: &[Arc<PipelineStats>]) -> PipelineStatsSnapshot {
    let mut total = PipelineStatsSnapshot::default();
    for s in stats {
        total += s.snapshot();
    }
    total
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec;
    use crate::transport::{ChannelTransport, TransportError};
    use std::collections::HashMap;

    fn quick_pipeline(max_messages: Option<u64>) -> PipelineConfig {
        PipelineConfig {
            message_delay: Duration::ZERO,
            start_delay: Duration::ZERO,
            max_messages,
            ..Default::default()
        }
    }

    #[test]
    fn test_device_ids() {
        let (transport, _rx) = ChannelTransport::channel(1);
        let pool = ConnectionPool::new(1, |_| Ok::<_, TransportError>(transport.clone())).unwrap();
        let fleet = Fleet::new(3, PipelineConfig::default(), pool);
        assert_eq!(fleet.device_ids(), vec!["drone-0", "drone-1", "drone-2"]);
    }

    #[tokio::test]
    async fn test_bounded_fleet_delivers_every_record() {
        let (transport, mut rx) = ChannelTransport::channel(1024);
        let pool = ConnectionPool::new(4, |_| Ok::<_, TransportError>(transport.clone())).unwrap();
        let fleet = Fleet::new(3, quick_pipeline(Some(5)), pool)
            .with_generator(Arc::new(TelemetryGenerator::with_seed(11)));

        let report = fleet.run(CancellationToken::new()).await.unwrap();
        assert!(report.is_success());
        assert_eq!(report.devices, 3);
        assert_eq!(report.totals.sent, 15);
        assert_eq!(report.totals.dropped, 0);

        let mut per_device: HashMap<String, usize> = HashMap::new();
        while let Ok(payload) = rx.try_recv() {
            let record = codec::decode(&payload).unwrap();
            *per_device.entry(record.device_id).or_default() += 1;
        }
        assert_eq!(per_device.len(), 3);
        assert!(per_device.values().all(|&n| n == 5));
    }

    #[tokio::test]
    async fn test_run_duration_stops_fleet() {
        let (transport, mut rx) = ChannelTransport::channel(16);
        tokio::spawn(async move { while rx.recv().await.is_some() {} });
        let pool = ConnectionPool::new(2, |_| Ok::<_, TransportError>(transport.clone())).unwrap();
        let config = PipelineConfig {
            message_delay: Duration::from_millis(5),
            ..quick_pipeline(None)
        };
        let fleet = Fleet::new(2, config, pool)
            .with_run_duration(Some(Duration::from_millis(100)))
            .with_report_interval(Some(Duration::from_millis(20)));

        let parent = CancellationToken::new();
        let report = tokio::time::timeout(Duration::from_secs(5), fleet.run(parent.clone()))
            .await
            .unwrap()
            .unwrap();
        assert!(report.is_success());
        assert!(report.totals.sent > 0);
        assert_eq!(report.totals.sent, report.totals.enqueued);
        assert!(!parent.is_cancelled());
    }

    #[tokio::test]
    async fn test_closed_transport_stops_whole_fleet() {
        let (transport, rx) = ChannelTransport::channel(4);
        drop(rx);
        let pool = ConnectionPool::new(2, |_| Ok::<_, TransportError>(transport.clone())).unwrap();
        let fleet = Fleet::new(5, quick_pipeline(None), pool);

        let report = tokio::time::timeout(Duration::from_secs(5), fleet.run(CancellationToken::new()))
            .await
            .unwrap()
            .unwrap();
        assert!(!report.is_success());
        assert!(matches!(
            report.failure,
            Some(PipelineError::Transport {
                source: TransportError::ChannelClosed,
                ..
            })
        ));
        assert_eq!(report.totals.sent, 0);
    }
}
