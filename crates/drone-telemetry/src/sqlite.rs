// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! SQLite device state backend
//!
//! One row per device, one nullable column per measured field, so a partial
//! state stays partial on disk.

use crate::model::PersistedDeviceState;
use crate::store::{StateStore, StoreError};
use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

/// SQLite state store
///
/// Thread-safe via internal Mutex (SQLite Connection is not Sync).
///
/// # Schema
///
/// ```sql
/// CREATE TABLE device_state (
///     device_id TEXT PRIMARY KEY,
///     battery REAL,
///     flight_mode INTEGER,
///     latitude REAL,
///     longitude REAL,
///     altitude REAL,
///     gyrometer_ok INTEGER,
///     accelerometer_ok INTEGER,
///     magnetometer_ok INTEGER,
///     updated_at_ns INTEGER NOT NULL
/// );
/// ```
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (or create) a file-based database.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let conn = Connection::open(path.as_ref())?;
        Self::with_connection(conn)
    }

    /// Open an existing database for queries only. Fails instead of
    /// creating an empty database when `path` does not exist.
    pub fn open_read_only(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let conn = Connection::open_with_flags(path.as_ref(), OpenFlags::SQLITE_OPEN_READ_ONLY)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// In-memory database (for testing).
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, StoreError> {
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<(), StoreError> {
        let conn = self.lock()?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS device_state (
                device_id TEXT PRIMARY KEY,
                battery REAL,
                flight_mode INTEGER,
                latitude REAL,
                longitude REAL,
                altitude REAL,
                gyrometer_ok INTEGER,
                accelerometer_ok INTEGER,
                magnetometer_ok INTEGER,
                updated_at_ns INTEGER NOT NULL
            )",
            [],
        )?;
        Ok(())
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn
            .lock()
            .map_err(|_| StoreError::Backend("SQLite connection lock poisoned".into()))
    }

    fn row_to_state(row: &rusqlite::Row) -> rusqlite::Result<PersistedDeviceState> {
        Ok(PersistedDeviceState {
            device_id: row.get(0)?,
            battery: row.get(1)?,
            flight_mode: row.get(2)?,
            latitude: row.get(3)?,
            longitude: row.get(4)?,
            altitude: row.get(5)?,
            gyrometer_ok: row.get(6)?,
            accelerometer_ok: row.get(7)?,
            magnetometer_ok: row.get(8)?,
        })
    }
}

impl StateStore for SqliteStore {
    fn get(&self, device_id: &str) -> Result<Option<PersistedDeviceState>, StoreError> {
        let conn = self.lock()?;
        let state = conn
            .query_row(
                "SELECT device_id, battery, flight_mode, latitude, longitude, altitude,
                        gyrometer_ok, accelerometer_ok, magnetometer_ok
                 FROM device_state
                 WHERE device_id = ?1",
                [device_id],
                Self::row_to_state,
            )
            .optional()?;
        Ok(state)
    }

    fn upsert(&self, state: &PersistedDeviceState) -> Result<(), StoreError> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO device_state (device_id, battery, flight_mode, latitude, longitude,
                                       altitude, gyrometer_ok, accelerometer_ok,
                                       magnetometer_ok, updated_at_ns)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
             ON CONFLICT(device_id) DO UPDATE SET
                battery = excluded.battery,
                flight_mode = excluded.flight_mode,
                latitude = excluded.latitude,
                longitude = excluded.longitude,
                altitude = excluded.altitude,
                gyrometer_ok = excluded.gyrometer_ok,
                accelerometer_ok = excluded.accelerometer_ok,
                magnetometer_ok = excluded.magnetometer_ok,
                updated_at_ns = excluded.updated_at_ns",
            params![
                state.device_id,
                state.battery,
                state.flight_mode,
                state.latitude,
                state.longitude,
                state.altitude,
                state.gyrometer_ok,
                state.accelerometer_ok,
                state.magnetometer_ok,
                crate::unix_now_ns() as i64,
            ],
        )?;
        Ok(())
    }

    fn list_device_ids(&self) -> Result<Vec<String>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare("SELECT device_id FROM device_state ORDER BY device_id")?;
        let ids = stmt
            .query_map([], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        Ok(ids)
    }

    fn count(&self) -> Result<usize, StoreError> {
        let conn = self.lock()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM device_state", [], |row| row.get(0))?;
        Ok(count as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn full_state(id: &str) -> PersistedDeviceState {
        PersistedDeviceState {
            device_id: id.to_string(),
            battery: Some(0.75),
            flight_mode: Some(3),
            latitude: Some(47.5),
            longitude: Some(-122.2),
            altitude: Some(500.0),
            gyrometer_ok: Some(true),
            accelerometer_ok: Some(false),
            magnetometer_ok: Some(true),
        }
    }

    #[test]
    fn test_missing_device_is_none() {
        let store = SqliteStore::open_in_memory().unwrap();
        assert!(store.get("nope").unwrap().is_none());
        assert_eq!(store.count().unwrap(), 0);
    }

    #[test]
    fn test_partial_state_stays_partial() {
        let store = SqliteStore::open_in_memory().unwrap();
        let mut state = PersistedDeviceState::new("drone-1");
        state.battery = Some(1.0);
        store.upsert(&state).unwrap();

        let loaded = store.get("drone-1").unwrap().unwrap();
        assert_eq!(loaded, state);
        assert!(loaded.latitude.is_none());
    }

    #[test]
    fn test_upsert_replaces_row() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.upsert(&full_state("drone-1")).unwrap();

        let mut updated = full_state("drone-1");
        updated.battery = Some(0.5);
        updated.flight_mode = Some(4);
        store.upsert(&updated).unwrap();

        assert_eq!(store.get("drone-1").unwrap(), Some(updated));
        assert_eq!(store.count().unwrap(), 1);
    }

    #[test]
    fn test_file_store_persists_across_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.db");

        {
            let store = SqliteStore::open(&path).unwrap();
            store.upsert(&full_state("drone-1")).unwrap();
            store.upsert(&full_state("drone-0")).unwrap();
        }

        let store = SqliteStore::open(&path).unwrap();
        assert_eq!(store.list_device_ids().unwrap(), vec!["drone-0", "drone-1"]);
        assert_eq!(store.get("drone-1").unwrap(), Some(full_state("drone-1")));
    }

    #[test]
    fn test_read_only_never_creates_a_database() {
        let dir = TempDir::new().unwrap();
        let missing = dir.path().join("typo.db");
        assert!(matches!(
            SqliteStore::open_read_only(&missing),
            Err(StoreError::Sqlite(_))
        ));
        assert!(!missing.exists());

        let path = dir.path().join("state.db");
        SqliteStore::open(&path)
            .unwrap()
            .upsert(&full_state("drone-2"))
            .unwrap();

        let store = SqliteStore::open_read_only(&path).unwrap();
        assert_eq!(store.get("drone-2").unwrap(), Some(full_state("drone-2")));
        assert!(store.upsert(&full_state("drone-3")).is_err());
    }
}
