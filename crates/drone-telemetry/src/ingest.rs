// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Ingestion processor
//!
//! Turns received payloads into persisted device state:
//!
//! ```text
//! Received -> Decoding -> DecodeFailed (dead-lettered, terminal)
//!                      -> Decoded -> Merging -> MergeFailed (dead-lettered, terminal)
//!                                            -> Stored (terminal)
//! ```
//!
//! Every payload is handled on its own: a failure is converted into a
//! dead-letter envelope and never affects the other payloads of a batch.
//!
//! The merge is read-then-write against the store with no version check, so
//! two concurrent merges for the same device can lose one side's fields.

use crate::codec;
use crate::dead_letter::{DeadLetterEnvelope, DeadLetterKind, DeadLetterSink, PayloadSource};
use crate::model::PersistedDeviceState;
use crate::store::{StateStore, StoreError};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Origin given to payloads processed without one.
pub const LOCAL_ORIGIN: &str = "local";

/// A received payload and where it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourcedPayload {
    pub source: PayloadSource,
    pub payload: Vec<u8>,
}

/// Result of processing one payload.
#[derive(Debug, Clone, PartialEq)]
pub enum IngestOutcome {
    /// State merged and written.
    Stored {
        device_id: String,
        /// True when this was the first record seen for the device.
        created: bool,
    },
    /// Payload routed to the dead-letter sink.
    DeadLettered {
        kind: DeadLetterKind,
        device_id: Option<String>,
        cause: String,
    },
}

impl IngestOutcome {
    pub fn is_stored(&self) -> bool {
        matches!(self, Self::Stored { .. })
    }
}

/// Result of processing a batch.
#[derive(Debug, Clone, Default)]
pub struct BatchReport {
    pub stored: usize,
    pub dead_lettered: usize,
    pub outcomes: Vec<IngestOutcome>,
}

/// Ingestion counters.
#[derive(Debug, Default)]
pub struct IngestStats {
    pub received: AtomicU64,
    pub stored: AtomicU64,
    pub created: AtomicU64,
    pub decode_failures: AtomicU64,
    pub merge_failures: AtomicU64,
    pub dead_letter_failures: AtomicU64,
}

impl IngestStats {
    pub fn snapshot(&self) -> IngestStatsSnapshot {
        IngestStatsSnapshot {
            received: self.received.load(Ordering::Relaxed),
            stored: self.stored.load(Ordering::Relaxed),
            created: self.created.load(Ordering::Relaxed),
            decode_failures: self.decode_failures.load(Ordering::Relaxed),
            merge_failures: self.merge_failures.load(Ordering::Relaxed),
            dead_letter_failures: self.dead_letter_failures.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`IngestStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestStatsSnapshot {
    pub received: u64,
    pub stored: u64,
    pub created: u64,
    pub decode_failures: u64,
    pub merge_failures: u64,
    pub dead_letter_failures: u64,
}

impl IngestStatsSnapshot {
    pub fn dead_lettered(&self) -> u64 {
        self.decode_failures + self.merge_failures
    }
}

/// Decodes payloads and merges them into the state store.
pub struct IngestionProcessor {
    store: Arc<dyn StateStore>,
    dead_letters: Arc<dyn DeadLetterSink>,
    stats: IngestStats,
}

impl IngestionProcessor {
    pub fn new(store: Arc<dyn StateStore>, dead_letters: Arc<dyn DeadLetterSink>) -> Self {
        Self {
            store,
            dead_letters,
            stats: IngestStats::default(),
        }
    }

    pub fn store(&self) -> &Arc<dyn StateStore> {
        &self.store
    }

    pub fn stats(&self) -> IngestStatsSnapshot {
        self.stats.snapshot()
    }

    /// Process one payload that has no transport origin. It is tagged
    /// `local#<n>`, `n` being its position among everything received.
    pub fn process(&self, raw: &[u8]) -> IngestOutcome {
        self.ingest(None, raw)
    }

    /// Process one payload received from `source`.
    pub fn process_from(&self, source: &PayloadSource, raw: &[u8]) -> IngestOutcome {
        self.ingest(Some(source), raw)
    }

    /// Process every payload of a batch independently.
    pub fn process_batch<I, P>(&self, payloads: I) -> BatchReport
    where
        I: IntoIterator<Item = P>,
        P: AsRef<[u8]>,
    {
        self.tally(
            payloads
                .into_iter()
                .map(|payload| self.ingest(None, payload.as_ref())),
        )
    }

    /// Process every payload of a batch of received frames independently.
    pub fn process_sourced_batch(&self, batch: &[SourcedPayload]) -> BatchReport {
        self.tally(
            batch
                .iter()
                .map(|item| self.ingest(Some(&item.source), &item.payload)),
        )
    }

    fn ingest(&self, source: Option<&PayloadSource>, raw: &[u8]) -> IngestOutcome {
        let n = self.stats.received.fetch_add(1, Ordering::Relaxed) + 1;
        let source = source
            .cloned()
            .unwrap_or_else(|| PayloadSource::new(LOCAL_ORIGIN, n));

        let record = match codec::decode(raw) {
            Ok(record) => record,
            Err(e) => {
                self.stats.decode_failures.fetch_add(1, Ordering::Relaxed);
                let envelope = DeadLetterEnvelope::decode_failed(raw, source, &e);
                tracing::warn!(
                    "Dropping undecodable payload {} ({} bytes, failed_at_ns={}): {}",
                    envelope.source,
                    raw.len(),
                    envelope.failed_at_ns,
                    e
                );
                return self.dead_letter(envelope);
            }
        };

        let incoming = PersistedDeviceState::from(&record);
        match self.merge(&incoming) {
            Ok(created) => {
                self.stats.stored.fetch_add(1, Ordering::Relaxed);
                if created {
                    self.stats.created.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!("New device {} from {}", incoming.device_id, source);
                }
                tracing::trace!("Stored {} from {}", record, source);
                IngestOutcome::Stored {
                    device_id: incoming.device_id,
                    created,
                }
            }
            Err(e) => {
                self.stats.merge_failures.fetch_add(1, Ordering::Relaxed);
                let envelope = DeadLetterEnvelope::merge_failed(raw, source, incoming, &e);
                tracing::warn!(
                    "Merge failed for {} from {} ({} bytes, failed_at_ns={}): {}",
                    envelope.device_id.as_deref().unwrap_or("<unknown>"),
                    envelope.source,
                    raw.len(),
                    envelope.failed_at_ns,
                    e
                );
                self.dead_letter(envelope)
            }
        }
    }

    fn tally(&self, outcomes: impl Iterator<Item = IngestOutcome>) -> BatchReport {
        let mut report = BatchReport::default();
        for outcome in outcomes {
            if outcome.is_stored() {
                report.stored += 1;
            } else {
                report.dead_lettered += 1;
            }
            report.outcomes.push(outcome);
        }
        if report.dead_lettered > 0 {
            tracing::info!(
                "Batch of {}: {} stored, {} dead-lettered",
                report.outcomes.len(),
                report.stored,
                report.dead_lettered
            );
        }
        report
    }

    /// Merge `incoming` into the stored aggregate. Returns true when the
    /// device had no prior state.
    fn merge(&self, incoming: &PersistedDeviceState) -> Result<bool, StoreError> {
        let (target, created) = match self.store.get(&incoming.device_id)? {
            None => (incoming.clone(), true),
            Some(mut existing) => {
                existing.merge(incoming);
                (existing, false)
            }
        };
        self.store.upsert(&target)?;
        Ok(created)
    }

    fn dead_letter(&self, envelope: DeadLetterEnvelope) -> IngestOutcome {
        if let Err(e) = self.dead_letters.enqueue(&envelope) {
            self.stats.dead_letter_failures.fetch_add(1, Ordering::Relaxed);
            tracing::error!(
                "Dead-letter sink rejected envelope for {} from {} ({} bytes): {}",
                envelope.device_id.as_deref().unwrap_or("<unknown>"),
                envelope.source,
                envelope.raw_payload.len(),
                e
            );
        }
        IngestOutcome::DeadLettered {
            kind: envelope.kind,
            device_id: envelope.device_id,
            cause: envelope.cause,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dead_letter::{DeadLetterError, MemoryDeadLetterSink};
    use crate::model::{DeviceStateRecord, FlightMode, Health, Position};
    use crate::store::MemoryStore;
    use std::sync::atomic::AtomicBool;

    /// Store whose writes fail while `broken` is set.
    #[derive(Default)]
    struct FlakyStore {
        inner: MemoryStore,
        broken: AtomicBool,
    }

    impl StateStore for FlakyStore {
        fn get(&self, device_id: &str) -> Result<Option<PersistedDeviceState>, StoreError> {
            self.inner.get(device_id)
        }

        fn upsert(&self, state: &PersistedDeviceState) -> Result<(), StoreError> {
            if self.broken.load(Ordering::SeqCst) {
                return Err(StoreError::Backend("write timeout".into()));
            }
            self.inner.upsert(state)
        }

        fn list_device_ids(&self) -> Result<Vec<String>, StoreError> {
            self.inner.list_device_ids()
        }

        fn count(&self) -> Result<usize, StoreError> {
            self.inner.count()
        }
    }

    struct RejectingSink;

    impl DeadLetterSink for RejectingSink {
        fn enqueue(&self, _: &DeadLetterEnvelope) -> Result<(), DeadLetterError> {
            Err(DeadLetterError::Unavailable("queue offline".into()))
        }
    }

    fn setup() -> (IngestionProcessor, Arc<MemoryStore>, Arc<MemoryDeadLetterSink>) {
        let store = Arc::new(MemoryStore::new());
        let sink = Arc::new(MemoryDeadLetterSink::new());
        let processor = IngestionProcessor::new(store.clone(), sink.clone());
        (processor, store, sink)
    }

    fn key_frame(id: &str) -> DeviceStateRecord {
        DeviceStateRecord::key_frame(
            id,
            0.9,
            FlightMode::Takeoff,
            Position {
                latitude: 1.0,
                longitude: 2.0,
                altitude: 3.0,
            },
            Health::ALL_OK,
        )
    }

    #[test]
    fn test_missing_device_takes_incoming_record() {
        let (processor, store, _) = setup();
        let mut record = DeviceStateRecord::delta("X");
        record.battery = Some(1.0);

        let outcome = processor.process(&codec::encode(&record).unwrap());
        assert_eq!(
            outcome,
            IngestOutcome::Stored {
                device_id: "X".into(),
                created: true
            }
        );
        assert_eq!(
            store.get("X").unwrap(),
            Some(PersistedDeviceState::from(&record))
        );
    }

    #[test]
    fn test_delta_merges_into_existing_state() {
        let (processor, store, _) = setup();
        let mut existing = PersistedDeviceState::new("device001");
        existing.battery = Some(0.5);
        store.upsert(&existing).unwrap();

        let mut delta = DeviceStateRecord::delta("device001");
        delta.position = Some(Position {
            latitude: 10.0,
            longitude: 20.0,
            altitude: 30.0,
        });
        let outcome = processor.process(&codec::encode(&delta).unwrap());
        assert!(outcome.is_stored());

        let merged = store.get("device001").unwrap().unwrap();
        assert_eq!(merged.battery, Some(0.5));
        assert_eq!(merged.latitude, Some(10.0));
        assert_eq!(merged.longitude, Some(20.0));
        assert_eq!(merged.altitude, Some(30.0));
    }

    #[test]
    fn test_heartbeat_leaves_state_unchanged() {
        let (processor, store, _) = setup();
        processor.process(&codec::encode(&key_frame("d")).unwrap());
        let before = store.get("d").unwrap();

        let outcome = processor.process(&codec::encode(&DeviceStateRecord::delta("d")).unwrap());
        assert_eq!(
            outcome,
            IngestOutcome::Stored {
                device_id: "d".into(),
                created: false
            }
        );
        assert_eq!(store.get("d").unwrap(), before);
    }

    #[test]
    fn test_bad_payload_is_dead_lettered() {
        let (processor, store, sink) = setup();
        let garbage = vec![0x00, 0x01, 0x02, 0x03];

        let outcome = processor.process(&garbage);
        assert!(matches!(
            outcome,
            IngestOutcome::DeadLettered {
                kind: DeadLetterKind::DecodeFailed,
                device_id: None,
                ..
            }
        ));

        let envelopes = sink.envelopes();
        assert_eq!(envelopes.len(), 1);
        assert_eq!(envelopes[0].raw_payload, garbage);
        assert!(envelopes[0].partial_state.is_none());
        assert!(!envelopes[0].retryable);
        assert_eq!(envelopes[0].source, PayloadSource::new(LOCAL_ORIGIN, 1));
        assert_eq!(store.count().unwrap(), 0);
        assert_eq!(processor.stats().decode_failures, 1);
    }

    #[test]
    fn test_store_failure_is_dead_lettered_with_state() {
        let store = Arc::new(FlakyStore::default());
        let sink = Arc::new(MemoryDeadLetterSink::new());
        let processor = IngestionProcessor::new(store.clone(), sink.clone());
        store.broken.store(true, Ordering::SeqCst);

        let payload = codec::encode(&key_frame("drone-9")).unwrap();
        let outcome = processor.process(&payload);
        assert!(matches!(
            outcome,
            IngestOutcome::DeadLettered {
                kind: DeadLetterKind::MergeFailed,
                ..
            }
        ));

        let env = &sink.envelopes()[0];
        assert!(env.retryable);
        assert_eq!(env.raw_payload, payload);
        assert_eq!(env.device_id.as_deref(), Some("drone-9"));
        assert_eq!(
            env.partial_state,
            Some(PersistedDeviceState::from(&key_frame("drone-9")))
        );
        assert!(env.cause.contains("write timeout"));
    }

    #[test]
    fn test_batch_isolates_failures() {
        let (processor, store, sink) = setup();
        let payloads = vec![
            codec::encode(&key_frame("a")).unwrap(),
            vec![0xde, 0xad],
            codec::encode(&key_frame("b")).unwrap(),
            Vec::new(),
            codec::encode(&DeviceStateRecord::delta("a")).unwrap(),
        ];

        let report = processor.process_batch(&payloads);
        assert_eq!(report.stored, 3);
        assert_eq!(report.dead_lettered, 2);
        assert_eq!(report.outcomes.len(), 5);
        assert_eq!(sink.len(), 2);
        assert_eq!(store.list_device_ids().unwrap(), vec!["a", "b"]);

        let stats = processor.stats();
        assert_eq!(stats.received, 5);
        assert_eq!(stats.stored, 3);
        assert_eq!(stats.created, 2);
        assert_eq!(stats.dead_lettered(), 2);
    }

    #[test]
    fn test_dead_letters_carry_payload_source() {
        let store = Arc::new(FlakyStore::default());
        let sink = Arc::new(MemoryDeadLetterSink::new());
        let processor = IngestionProcessor::new(store.clone(), sink.clone());

        // Two bad payloads of the same size stay distinguishable.
        let batch = vec![
            SourcedPayload {
                source: PayloadSource::new("10.1.0.4:40100", 7),
                payload: vec![0xaa, 0xbb],
            },
            SourcedPayload {
                source: PayloadSource::new("10.1.0.5:40222", 7),
                payload: vec![0xaa, 0xbb],
            },
            SourcedPayload {
                source: PayloadSource::new("10.1.0.4:40100", 8),
                payload: codec::encode(&key_frame("drone-4")).unwrap(),
            },
        ];
        let report = processor.process_sourced_batch(&batch[..2]);
        assert_eq!(report.dead_lettered, 2);

        store.broken.store(true, Ordering::SeqCst);
        processor.process_sourced_batch(&batch[2..]);

        let envelopes = sink.envelopes();
        assert_eq!(envelopes.len(), 3);
        for (env, item) in envelopes.iter().zip(&batch) {
            assert_eq!(env.source, item.source);
            assert!(env.failed_at_ns > 0);
        }
        assert_ne!(envelopes[0].source, envelopes[1].source);
        assert_eq!(envelopes[2].kind, DeadLetterKind::MergeFailed);
        assert_eq!(envelopes[2].source.to_string(), "10.1.0.4:40100#8");
    }

    #[test]
    fn test_local_payloads_are_numbered_in_arrival_order() {
        let (processor, _store, sink) = setup();
        processor.process(&codec::encode(&key_frame("a")).unwrap());
        processor.process(b"bad");
        processor.process_batch([b"worse".to_vec()]);

        let sequences: Vec<u64> = sink.envelopes().iter().map(|e| e.source.sequence).collect();
        assert_eq!(sequences, vec![2, 3]);
    }

    #[test]
    fn test_sink_failure_is_counted_not_raised() {
        let store = Arc::new(MemoryStore::new());
        let processor = IngestionProcessor::new(store, Arc::new(RejectingSink));

        let outcome = processor.process(b"not a payload");
        assert!(!outcome.is_stored());
        assert_eq!(processor.stats().dead_letter_failures, 1);
    }
}
