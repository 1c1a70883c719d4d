// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! TCP ingestion endpoint.
//!
//! Accepts any number of connections carrying length-prefixed payloads. Every
//! connection feeds one bounded channel; a single worker groups whatever is
//! immediately available (up to `batch_size`) and hands the batch to the
//! [`IngestionProcessor`] on the blocking pool. Each payload is tagged with
//! its peer address and frame number on that connection.
//!
//! On cancellation the listener stops accepting, connections stop reading,
//! and the worker drains the frames already queued before returning.

use crate::frame::{self, DEFAULT_MAX_FRAME_SIZE};
use crate::dead_letter::PayloadSource;
use crate::ingest::{IngestStatsSnapshot, IngestionProcessor, SourcedPayload};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// Server errors.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Batch worker failed: {0}")]
    Worker(String),
}

/// Tuning knobs of the ingestion endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerSettings {
    pub max_frame_size: usize,
    pub channel_capacity: usize,
    pub batch_size: usize,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            channel_capacity: 10_000,
            batch_size: 256,
        }
    }
}

/// TCP ingestion server.
pub struct IngestServer {
    listener: TcpListener,
    processor: Arc<IngestionProcessor>,
    settings: ServerSettings,
    connections: Arc<AtomicU64>,
}

impl IngestServer {
    /// Bind the listening socket.
    pub async fn bind<A>(
        addr: A,
        processor: Arc<IngestionProcessor>,
        settings: ServerSettings,
    ) -> Result<Self, ServerError>
    where
        A: ToSocketAddrs + std::fmt::Display,
    {
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|source| ServerError::Bind {
                addr: addr.to_string(),
                source,
            })?;
        Ok(Self {
            listener,
            processor,
            settings,
            connections: Arc::new(AtomicU64::new(0)),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        Ok(self.listener.local_addr()?)
    }

    /// Serve until `token` is cancelled.
    pub async fn run(self, token: CancellationToken) -> Result<IngestStatsSnapshot, ServerError> {
        let addr = self.local_addr()?;
        tracing::info!("Ingestion server listening on {}", addr);

        let (tx, rx) = mpsc::channel::<SourcedPayload>(self.settings.channel_capacity.max(1));
        let worker = tokio::spawn(batch_worker(
            rx,
            Arc::clone(&self.processor),
            self.settings.batch_size.max(1),
        ));
        let tracker = TaskTracker::new();

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let n = self.connections.fetch_add(1, Ordering::Relaxed) + 1;
                        tracing::debug!("Connection #{} from {}", n, peer);
                        tracker.spawn(read_connection(
                            stream,
                            peer,
                            tx.clone(),
                            token.clone(),
                            self.settings.max_frame_size,
                        ));
                    }
                    Err(e) => tracing::warn!("Accept failed: {}", e),
                },
            }
        }

        drop(tx);
        tracker.close();
        tracker.wait().await;
        worker
            .await
            .map_err(|e| ServerError::Worker(e.to_string()))?;

        let stats = self.processor.stats();
        tracing::info!(
            "Ingestion server stopped: received={} stored={} dead-lettered={}",
            stats.received,
            stats.stored,
            stats.dead_lettered()
        );
        Ok(stats)
    }
}

async fn read_connection(
    mut stream: TcpStream,
    peer: SocketAddr,
    tx: mpsc::Sender<SourcedPayload>,
    token: CancellationToken,
    max_frame_size: usize,
) {
    let origin = peer.to_string();
    let mut buf = Vec::new();
    let mut frames: u64 = 0;
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            read = frame::read_frame(&mut stream, &mut buf, max_frame_size) => match read {
                Ok(true) => {
                    frames += 1;
                    let item = SourcedPayload {
                        source: PayloadSource::new(origin.as_str(), frames),
                        payload: std::mem::take(&mut buf),
                    };
                    if tx.send(item).await.is_err() {
                        break;
                    }
                }
                Ok(false) => break,
                Err(e) => {
                    tracing::warn!("Dropping connection from {} after {} frames: {}", peer, frames, e);
                    break;
                }
            },
        }
    }
    tracing::debug!("Connection from {} closed after {} frames", peer, frames);
}

async fn batch_worker(
    mut rx: mpsc::Receiver<SourcedPayload>,
    processor: Arc<IngestionProcessor>,
    batch_size: usize,
) {
    while let Some(first) = rx.recv().await {
        let mut batch = Vec::with_capacity(batch_size);
        batch.push(first);
        while batch.len() < batch_size {
            match rx.try_recv() {
                Ok(payload) => batch.push(payload),
                Err(_) => break,
            }
        }

        let processor = Arc::clone(&processor);
        let size = batch.len();
        match tokio::task::spawn_blocking(move || processor.process_sourced_batch(&batch)).await {
            Ok(report) => tracing::trace!(
                "Batch of {}: {} stored, {} dead-lettered",
                size,
                report.stored,
                report.dead_lettered
            ),
            Err(e) => tracing::error!("Batch of {} payloads aborted: {}", size, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec;
    use crate::dead_letter::MemoryDeadLetterSink;
    use crate::model::DeviceStateRecord;
    use crate::store::{MemoryStore, StateStore};
    use std::time::Duration;
    use tokio::io::AsyncWriteExt;

    async fn start() -> (
        SocketAddr,
        Arc<IngestionProcessor>,
        Arc<MemoryStore>,
        Arc<MemoryDeadLetterSink>,
        CancellationToken,
        tokio::task::JoinHandle<Result<IngestStatsSnapshot, ServerError>>,
    ) {
        let store = Arc::new(MemoryStore::new());
        let sink = Arc::new(MemoryDeadLetterSink::new());
        let processor = Arc::new(IngestionProcessor::new(store.clone(), sink.clone()));
        let server = IngestServer::bind(
            "127.0.0.1:0",
            Arc::clone(&processor),
            ServerSettings {
                batch_size: 4,
                ..Default::default()
            },
        )
        .await
        .unwrap();
        let addr = server.local_addr().unwrap();
        let token = CancellationToken::new();
        let handle = tokio::spawn(server.run(token.clone()));
        (addr, processor, store, sink, token, handle)
    }

    async fn wait_for_received(processor: &IngestionProcessor, n: u64) {
        for _ in 0..400 {
            if processor.stats().received >= n {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("server did not receive {} payloads", n);
    }

    #[tokio::test]
    async fn test_frames_from_many_connections_are_stored() {
        let (addr, processor, store, _sink, token, handle) = start().await;

        let mut clients = Vec::new();
        for c in 0..3 {
            clients.push(tokio::spawn(async move {
                let mut stream = TcpStream::connect(addr).await.unwrap();
                for _ in 0..10 {
                    let record = DeviceStateRecord::delta(format!("drone-{}", c));
                    let payload = codec::encode(&record).unwrap();
                    frame::write_frame(&mut stream, &payload, 1024).await.unwrap();
                }
            }));
        }
        for client in clients {
            client.await.unwrap();
        }

        wait_for_received(&processor, 30).await;
        token.cancel();
        let stats = handle.await.unwrap().unwrap();

        assert_eq!(stats.received, 30);
        assert_eq!(stats.stored, 30);
        assert_eq!(stats.created, 3);
        assert_eq!(store.count().unwrap(), 3);
    }

    #[tokio::test]
    async fn test_bad_frame_is_dead_lettered() {
        let (addr, processor, _store, sink, token, handle) = start().await;

        let mut stream = TcpStream::connect(addr).await.unwrap();
        frame::write_frame(&mut stream, b"junk", 1024).await.unwrap();
        wait_for_received(&processor, 1).await;

        token.cancel();
        let stats = handle.await.unwrap().unwrap();
        assert_eq!(stats.decode_failures, 1);
        assert_eq!(sink.envelopes()[0].raw_payload, b"junk");
    }

    #[tokio::test]
    async fn test_dead_letters_name_peer_and_frame() {
        let (addr, processor, _store, sink, token, handle) = start().await;

        let mut stream = TcpStream::connect(addr).await.unwrap();
        let local = stream.local_addr().unwrap();
        let good = codec::encode(&DeviceStateRecord::delta("drone-1")).unwrap();
        frame::write_frame(&mut stream, &good, 1024).await.unwrap();
        frame::write_frame(&mut stream, b"bad1", 1024).await.unwrap();
        frame::write_frame(&mut stream, b"bad2", 1024).await.unwrap();
        wait_for_received(&processor, 3).await;

        token.cancel();
        handle.await.unwrap().unwrap();
        let envelopes = sink.envelopes();
        assert_eq!(envelopes.len(), 2);
        assert_eq!(envelopes[0].source, PayloadSource::new(local.to_string(), 2));
        assert_eq!(envelopes[1].source, PayloadSource::new(local.to_string(), 3));
    }

    #[tokio::test]
    async fn test_oversized_frame_drops_connection() {
        let (addr, processor, _store, _sink, token, handle) = start().await;

        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(&(DEFAULT_MAX_FRAME_SIZE as u32 + 1).to_be_bytes())
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        token.cancel();
        handle.await.unwrap().unwrap();
        assert_eq!(processor.stats().received, 0);
    }

    #[tokio::test]
    async fn test_bind_error() {
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = taken.local_addr().unwrap();
        let processor = Arc::new(IngestionProcessor::new(
            Arc::new(MemoryStore::new()),
            Arc::new(MemoryDeadLetterSink::new()),
        ));
        let result = IngestServer::bind(addr, processor, ServerSettings::default()).await;
        assert!(matches!(result, Err(ServerError::Bind { .. })));
    }
}
