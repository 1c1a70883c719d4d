// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Dead-letter envelopes and sinks
//!
//! A payload that cannot be stored is wrapped with its cause and whatever
//! state was recovered, then appended to a sink for out-of-band inspection or
//! replay. Sinks are append-only; nothing here reads envelopes back except
//! operator tooling.

use crate::model::PersistedDeviceState;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use thiserror::Error;

/// Stage at which a payload failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeadLetterKind {
    /// Payload could not be decoded. Never retryable.
    DecodeFailed,
    /// Payload decoded but the store read or write failed.
    MergeFailed,
}

/// Where a payload came from: the connection (or other origin) and its
/// 1-based position on it. Printed as `origin#sequence` in log lines so a
/// warning can be matched to its dead-letter entry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PayloadSource {
    pub origin: String,
    pub sequence: u64,
}

impl PayloadSource {
    pub fn new(origin: impl Into<String>, sequence: u64) -> Self {
        Self {
            origin: origin.into(),
            sequence,
        }
    }
}

impl fmt::Display for PayloadSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.origin, self.sequence)
    }
}

/// A failed payload with its cause.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterEnvelope {
    pub kind: DeadLetterKind,
    pub retryable: bool,
    pub cause: String,
    #[serde(default)]
    pub source: PayloadSource,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    pub raw_payload: Vec<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partial_state: Option<PersistedDeviceState>,
    pub failed_at_ns: u64,
}

impl DeadLetterEnvelope {
    /// Envelope for an undecodable payload.
    pub fn decode_failed(raw_payload: &[u8], source: PayloadSource, cause: impl ToString) -> Self {
        Self {
            kind: DeadLetterKind::DecodeFailed,
            retryable: false,
            cause: cause.to_string(),
            source,
            device_id: None,
            raw_payload: raw_payload.to_vec(),
            partial_state: None,
            failed_at_ns: crate::unix_now_ns(),
        }
    }

    /// Envelope for a payload whose merge into the store failed.
    pub fn merge_failed(
        raw_payload: &[u8],
        source: PayloadSource,
        state: PersistedDeviceState,
        cause: impl ToString,
    ) -> Self {
        Self {
            kind: DeadLetterKind::MergeFailed,
            retryable: true,
            cause: cause.to_string(),
            source,
            device_id: Some(state.device_id.clone()),
            raw_payload: raw_payload.to_vec(),
            partial_state: Some(state),
            failed_at_ns: crate::unix_now_ns(),
        }
    }
}

/// Dead-letter sink errors.
#[derive(Debug, Error)]
pub enum DeadLetterError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Dead-letter sink unavailable: {0}")]
    Unavailable(String),
}

/// Append-only destination for failed payloads.
pub trait DeadLetterSink: Send + Sync {
    fn enqueue(&self, envelope: &DeadLetterEnvelope) -> Result<(), DeadLetterError>;
}

impl<S: DeadLetterSink + ?Sized> DeadLetterSink for std::sync::Arc<S> {
    fn enqueue(&self, envelope: &DeadLetterEnvelope) -> Result<(), DeadLetterError> {
        (**self).enqueue(envelope)
    }
}

/// Sink keeping envelopes in memory.
#[derive(Debug, Default)]
pub struct MemoryDeadLetterSink {
    envelopes: Mutex<Vec<DeadLetterEnvelope>>,
}

impl MemoryDeadLetterSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of everything enqueued so far.
    pub fn envelopes(&self) -> Vec<DeadLetterEnvelope> {
        self.envelopes
            .lock()
            .map(|e| e.clone())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.envelopes.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl DeadLetterSink for MemoryDeadLetterSink {
    fn enqueue(&self, envelope: &DeadLetterEnvelope) -> Result<(), DeadLetterError> {
        self.envelopes
            .lock()
            .map_err(|_| DeadLetterError::Unavailable("lock poisoned".into()))?
            .push(envelope.clone());
        Ok(())
    }
}

/// Sink appending one JSON document per line to a file.
pub struct JsonlDeadLetterSink {
    path: PathBuf,
    file: Mutex<File>,
}

impl JsonlDeadLetterSink {
    /// Open `path` for appending, creating it if needed.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, DeadLetterError> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        tracing::debug!("Dead-letter file: {}", path.display());
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read every envelope from a dead-letter file.
    pub fn read_all(path: impl AsRef<Path>) -> Result<Vec<DeadLetterEnvelope>, DeadLetterError> {
        let reader = BufReader::new(File::open(path)?);
        let mut envelopes = Vec::new();
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            envelopes.push(serde_json::from_str(&line)?);
        }
        Ok(envelopes)
    }
}

impl DeadLetterSink for JsonlDeadLetterSink {
    fn enqueue(&self, envelope: &DeadLetterEnvelope) -> Result<(), DeadLetterError> {
        let mut line = serde_json::to_vec(envelope)?;
        line.push(b'\n');

        let mut file = self
            .file
            .lock()
            .map_err(|_| DeadLetterError::Unavailable("lock poisoned".into()))?;
        file.write_all(&line)?;
        file.flush()?;
        Ok(())
    }
}
