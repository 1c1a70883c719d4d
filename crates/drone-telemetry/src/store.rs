// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Device state store abstraction
//!
//! Keyed get / insert-or-update of one [`PersistedDeviceState`] per device.
//! "Not found" is an ordinary outcome (`Ok(None)`), never an error.
//!
//! # Implementations
//!
//! - `MemoryStore` -- process-local map, for tests and dry runs
//! - `SqliteStore` -- durable, one row per device

use crate::model::PersistedDeviceState;
use std::collections::BTreeMap;
use std::sync::RwLock;
use thiserror::Error;

/// Store errors. "Record not found" is not one of them.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Store backend error: {0}")]
    Backend(String),
}

/// Durable per-device state storage.
pub trait StateStore: Send + Sync {
    /// Read the state of a device. `Ok(None)` when the device is unknown.
    fn get(&self, device_id: &str) -> Result<Option<PersistedDeviceState>, StoreError>;

    /// Insert or replace the state of `state.device_id`.
    fn upsert(&self, state: &PersistedDeviceState) -> Result<(), StoreError>;

    /// All known device ids, sorted.
    fn list_device_ids(&self) -> Result<Vec<String>, StoreError>;

    /// Number of devices stored.
    fn count(&self) -> Result<usize, StoreError>;
}

impl<S: StateStore + ?Sized> StateStore for std::sync::Arc<S> {
    fn get(&self, device_id: &str) -> Result<Option<PersistedDeviceState>, StoreError> {
        (**self).get(device_id)
    }

    fn upsert(&self, state: &PersistedDeviceState) -> Result<(), StoreError> {
        (**self).upsert(state)
    }

    fn list_device_ids(&self) -> Result<Vec<String>, StoreError> {
        (**self).list_device_ids()
    }

    fn count(&self) -> Result<usize, StoreError> {
        (**self).count()
    }
}

/// In-memory store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    states: RwLock<BTreeMap<String, PersistedDeviceState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn poisoned<T>(_: T) -> StoreError {
    StoreError::Backend("memory store lock poisoned".into())
}

impl StateStore for MemoryStore {
    fn get(&self, device_id: &str) -> Result<Option<PersistedDeviceState>, StoreError> {
        let states = self.states.read().map_err(poisoned)?;
        Ok(states.get(device_id).cloned())
    }

    fn upsert(&self, state: &PersistedDeviceState) -> Result<(), StoreError> {
        let mut states = self.states.write().map_err(poisoned)?;
        states.insert(state.device_id.clone(), state.clone());
        Ok(())
    }

    fn list_device_ids(&self) -> Result<Vec<String>, StoreError> {
        let states = self.states.read().map_err(poisoned)?;
        Ok(states.keys().cloned().collect())
    }

    fn count(&self) -> Result<usize, StoreError> {
        let states = self.states.read().map_err(poisoned)?;
        Ok(states.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_store_roundtrip() {
        let store = MemoryStore::new();
        assert!(store.get("drone-1").unwrap().is_none());

        let mut state = PersistedDeviceState::new("drone-1");
        state.battery = Some(0.9);
        store.upsert(&state).unwrap();
        assert_eq!(store.get("drone-1").unwrap(), Some(state.clone()));

        state.battery = Some(0.8);
        store.upsert(&state).unwrap();
        assert_eq!(store.get("drone-1").unwrap().unwrap().battery, Some(0.8));
        assert_eq!(store.count().unwrap(), 1);
    }

    #[test]
    fn test_list_device_ids_sorted() {
        let store = MemoryStore::new();
        for id in ["drone-2", "drone-0", "drone-1"] {
            store.upsert(&PersistedDeviceState::new(id)).unwrap();
        }
        assert_eq!(
            store.list_device_ids().unwrap(),
            vec!["drone-0", "drone-1", "drone-2"]
        );
    }
}
