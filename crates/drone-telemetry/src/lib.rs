// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Drone Telemetry Pipeline
//!
//! Simulates a fleet of drones streaming state to an ingestion service, and
//! implements that service.
//!
//! # Features
//!
//! - **Compact Codec** -- Versioned binary records, full keyframes and sparse deltas
//! - **Bounded Pipelines** -- Per-device producer/consumer with backpressure and cancellation
//! - **Connection Pool** -- Fixed set of reusable transport handles with scoped checkout
//! - **State Merge** -- Field-level coalescing of partial updates into durable state
//! - **Dead Letters** -- Failed payloads captured with their cause for replay
//!
//! # Architecture
//!
//! ```text
//! Fleet
//! +-- DevicePipeline (one per device)
//! |   +-- TelemetryGenerator   (next record from last keyframe)
//! |   +-- buffer               (bounded FIFO)
//! |   +-- ConnectionPool       (shared, TcpTransport or ChannelTransport)
//! |
//! IngestServer
//! +-- IngestionProcessor
//!     +-- StateStore           (SQLite or in-memory)
//!     +-- DeadLetterSink       (JSON lines or in-memory)
//! ```
//!
//! # Example
//!
//! ```ignore
//! use drone_telemetry::{ConnectionPool, Fleet, FleetConfig, TcpTransport};
//!
//! let config = FleetConfig::builder().devices(10).run_seconds(60).build();
//! let pool = ConnectionPool::connect(config.pool_size, |_| {
//!     TcpTransport::connect(config.endpoint.clone(), config.max_frame_size)
//! })
//! .await?;
//! let report = Fleet::new(config.devices, config.pipeline_config(), pool)
//!     .run(CancellationToken::new())
//!     .await?;
//! ```

pub mod codec;
pub mod config;
pub mod dead_letter;
pub mod fleet;
pub mod frame;
pub mod generator;
pub mod ingest;
pub mod model;
pub mod pipeline;
pub mod pool;
pub mod server;
pub mod sqlite;
pub mod store;
pub mod transport;

pub use codec::{decode, encode, CodecError};
pub use config::{ConfigError, FleetConfig, IngestConfig};
pub use dead_letter::{
    DeadLetterEnvelope, DeadLetterKind, DeadLetterSink, JsonlDeadLetterSink, MemoryDeadLetterSink,
    PayloadSource,
};
pub use fleet::{Fleet, FleetReport};
pub use generator::TelemetryGenerator;
pub use ingest::{
    BatchReport, IngestOutcome, IngestStatsSnapshot, IngestionProcessor, SourcedPayload,
};
pub use model::{DeviceStateRecord, FlightMode, Health, PersistedDeviceState, Position};
pub use pipeline::{DevicePipeline, PipelineConfig, PipelineError, PipelineStatsSnapshot};
pub use pool::{ConnectionPool, PoolError, PooledHandle};
pub use server::{IngestServer, ServerError, ServerSettings};
pub use sqlite::SqliteStore;
pub use store::{MemoryStore, StateStore, StoreError};
pub use transport::{ChannelTransport, TcpTransport, Transport, TransportError};

pub use tokio_util::sync::CancellationToken;

/// Current time as Unix nanoseconds (0 if the clock is before the epoch).
pub fn unix_now_ns() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}
