// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Outbound transport handles.
//!
//! A [`Transport`] sends one opaque payload per call. The pipeline only relies
//! on "send may fail"; what a failure means for the run is decided upstream.

use crate::frame::{self, FrameError};
use crate::pool::PoolError;
use std::future::Future;
use std::net::SocketAddr;
use thiserror::Error;
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::sync::mpsc;

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Failed to connect to {endpoint}: {source}")]
    Connect {
        endpoint: String,
        #[source]
        source: std::io::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Frame error: {0}")]
    Frame(#[from] FrameError),

    #[error("Receiving side of the channel is closed")]
    ChannelClosed,

    #[error("Pool error: {0}")]
    Pool(#[from] PoolError),
}

/// A handle able to send payloads to the ingestion side.
pub trait Transport: Send {
    /// Send one payload.
    fn send(&mut self, payload: &[u8]) -> impl Future<Output = Result<(), TransportError>> + Send;
}

/// One TCP connection carrying length-prefixed payloads.
#[derive(Debug)]
pub struct TcpTransport {
    stream: TcpStream,
    peer: SocketAddr,
    max_frame_size: usize,
    frames_sent: u64,
}

impl TcpTransport {
    /// Connect to `endpoint`.
    pub async fn connect<A>(endpoint: A, max_frame_size: usize) -> Result<Self, TransportError>
    where
        A: ToSocketAddrs + std::fmt::Display,
    {
        let stream = TcpStream::connect(&endpoint)
            .await
            .map_err(|source| TransportError::Connect {
                endpoint: endpoint.to_string(),
                source,
            })?;
        stream.set_nodelay(true)?;
        let peer = stream.peer_addr()?;
        tracing::debug!("Connected to {}", peer);

        Ok(Self {
            stream,
            peer,
            max_frame_size,
            frames_sent: 0,
        })
    }

    /// Remote address.
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// Frames written on this connection.
    pub fn frames_sent(&self) -> u64 {
        self.frames_sent
    }
}

impl Transport for TcpTransport {
    async fn send(&mut self, payload: &[u8]) -> Result<(), TransportError> {
        frame::write_frame(&mut self.stream, payload, self.max_frame_size).await?;
        self.frames_sent += 1;
        Ok(())
    }
}

/// In-process transport over a bounded channel.
#[derive(Debug, Clone)]
pub struct ChannelTransport {
    tx: mpsc::Sender<Vec<u8>>,
}

impl ChannelTransport {
    /// Create a transport and the receiver its payloads arrive on.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Vec<u8>>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }

    /// Wrap an existing sender.
    pub fn new(tx: mpsc::Sender<Vec<u8>>) -> Self {
        Self { tx }
    }
}

impl Transport for ChannelTransport {
    async fn send(&mut self, payload: &[u8]) -> Result<(), TransportError> {
        self.tx
            .send(payload.to_vec())
            .await
            .map_err(|_| TransportError::ChannelClosed)
    }
}
