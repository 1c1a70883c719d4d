// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Device state data model
//!
//! Two shapes of the same information:
//!
//! - [`DeviceStateRecord`] -- the wire entity produced by the generator, one
//!   per simulated tick. Immutable once built.
//! - [`PersistedDeviceState`] -- the durable per-device aggregate that the
//!   ingestion side merges records into.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Flight mode reported by a drone.
///
/// The numeric values are part of the wire format and the persisted form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum FlightMode {
    Unknown = 0,
    Ready = 1,
    Takeoff = 2,
    Inflight = 3,
    Landing = 4,
    Offline = 5,
}

impl FlightMode {
    /// All modes, in wire order.
    pub const ALL: [FlightMode; 6] = [
        Self::Unknown,
        Self::Ready,
        Self::Takeoff,
        Self::Inflight,
        Self::Landing,
        Self::Offline,
    ];

    /// Wire value.
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Parse a wire value. Returns `None` outside the enumeration.
    pub fn from_u8(value: u8) -> Option<Self> {
        Self::ALL.get(value as usize).copied()
    }

    /// Next mode in the simulated flight cycle:
    /// Ready -> Takeoff -> Inflight -> Landing -> Offline -> Ready.
    pub fn next_in_cycle(self) -> Self {
        match self {
            Self::Ready => Self::Takeoff,
            Self::Takeoff => Self::Inflight,
            Self::Inflight => Self::Landing,
            Self::Landing => Self::Offline,
            Self::Offline | Self::Unknown => Self::Ready,
        }
    }
}

impl fmt::Display for FlightMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Unknown => "unknown",
            Self::Ready => "ready",
            Self::Takeoff => "takeoff",
            Self::Inflight => "inflight",
            Self::Landing => "landing",
            Self::Offline => "offline",
        };
        f.write_str(name)
    }
}

/// 3-D position (degrees, degrees, metres).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub latitude: f64,
    pub longitude: f64,
    pub altitude: f64,
}

/// Sensor health flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Health {
    pub gyrometer_ok: bool,
    pub accelerometer_ok: bool,
    pub magnetometer_ok: bool,
}

impl Health {
    /// All sensors healthy.
    pub const ALL_OK: Health = Health {
        gyrometer_ok: true,
        accelerometer_ok: true,
        magnetometer_ok: true,
    };
}

/// Reasons a record violates the keyframe/delta invariants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RecordViolation {
    #[error("Device id is empty")]
    EmptyDeviceId,

    #[error("Keyframe is missing at least one measured field")]
    IncompleteKeyFrame,
}

/// One telemetry record for one device.
///
/// A keyframe carries every measured field. A delta carries the device id and
/// any subset of the measured fields; an absent field means "unchanged".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceStateRecord {
    pub device_id: String,
    pub battery: Option<f64>,
    pub flight_mode: Option<FlightMode>,
    pub position: Option<Position>,
    pub health: Option<Health>,
    pub is_key_frame: bool,
}

impl DeviceStateRecord {
    /// Build a delta record with no measured fields (a heartbeat).
    pub fn delta(device_id: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            battery: None,
            flight_mode: None,
            position: None,
            health: None,
            is_key_frame: false,
        }
    }

    /// Build a complete keyframe.
    pub fn key_frame(
        device_id: impl Into<String>,
        battery: f64,
        flight_mode: FlightMode,
        position: Position,
        health: Health,
    ) -> Self {
        Self {
            device_id: device_id.into(),
            battery: Some(battery),
            flight_mode: Some(flight_mode),
            position: Some(position),
            health: Some(health),
            is_key_frame: true,
        }
    }

    /// True when every measured field is present.
    pub fn is_complete(&self) -> bool {
        self.battery.is_some()
            && self.flight_mode.is_some()
            && self.position.is_some()
            && self.health.is_some()
    }

    /// True when no measured field is present.
    pub fn is_heartbeat(&self) -> bool {
        self.battery.is_none()
            && self.flight_mode.is_none()
            && self.position.is_none()
            && self.health.is_none()
    }

    /// Check the keyframe/delta invariants.
    pub fn validate(&self) -> Result<(), RecordViolation> {
        if self.device_id.is_empty() {
            return Err(RecordViolation::EmptyDeviceId);
        }
        if self.is_key_frame && !self.is_complete() {
            return Err(RecordViolation::IncompleteKeyFrame);
        }
        Ok(())
    }
}

impl fmt::Display for DeviceStateRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.device_id)?;
        if let Some(battery) = self.battery {
            write!(f, " battery={:.2}", battery)?;
        }
        if let Some(mode) = self.flight_mode {
            write!(f, " mode={}", mode)?;
        }
        if let Some(pos) = self.position {
            write!(
                f,
                " pos=({:.6}, {:.6}, {:.2})",
                pos.latitude, pos.longitude, pos.altitude
            )?;
        }
        if let Some(health) = self.health {
            write!(
                f,
                " gyro={} accel={} magnet={}",
                health.gyrometer_ok, health.accelerometer_ok, health.magnetometer_ok
            )?;
        }
        write!(f, " keyframe={}", self.is_key_frame)
    }
}

/// Durable per-device aggregate.
///
/// Every field holds the most recently supplied value across the device's
/// history. `flight_mode` is stored as its wire value so the persisted form
/// stays readable even if the enumeration grows.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PersistedDeviceState {
    pub device_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub battery: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flight_mode: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latitude: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub longitude: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub altitude: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gyrometer_ok: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accelerometer_ok: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub magnetometer_ok: Option<bool>,
}

impl PersistedDeviceState {
    /// Empty aggregate for a device.
    pub fn new(device_id: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            ..Default::default()
        }
    }

    /// Overwrite every field `update` supplies, leaving the rest untouched.
    ///
    /// The device id is never changed by a merge.
    pub fn merge(&mut self, update: &PersistedDeviceState) {
        coalesce(&mut self.battery, update.battery);
        coalesce(&mut self.flight_mode, update.flight_mode);
        coalesce(&mut self.latitude, update.latitude);
        coalesce(&mut self.longitude, update.longitude);
        coalesce(&mut self.altitude, update.altitude);
        coalesce(&mut self.gyrometer_ok, update.gyrometer_ok);
        coalesce(&mut self.accelerometer_ok, update.accelerometer_ok);
        coalesce(&mut self.magnetometer_ok, update.magnetometer_ok);
    }

    /// Decoded flight mode, if the stored value is a known one.
    pub fn flight_mode(&self) -> Option<FlightMode> {
        self.flight_mode.and_then(FlightMode::from_u8)
    }
}

fn coalesce<T: Copy>(target: &mut Option<T>, incoming: Option<T>) {
    if let Some(value) = incoming {
        *target = Some(value);
    }
}

impl From<&DeviceStateRecord> for PersistedDeviceState {
    fn from(record: &DeviceStateRecord) -> Self {
        let mut state = PersistedDeviceState::new(record.device_id.clone());
        state.battery = record.battery;
        state.flight_mode = record.flight_mode.map(FlightMode::as_u8);
        if let Some(pos) = record.position {
            state.latitude = Some(pos.latitude);
            state.longitude = Some(pos.longitude);
            state.altitude = Some(pos.altitude);
        }
        if let Some(health) = record.health {
            state.gyrometer_ok = Some(health.gyrometer_ok);
            state.accelerometer_ok = Some(health.accelerometer_ok);
            state.magnetometer_ok = Some(health.magnetometer_ok);
        }
        state
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_key_frame() -> DeviceStateRecord {
        DeviceStateRecord::key_frame(
            "device001",
            1.0,
            FlightMode::Landing,
            Position {
                latitude: 10.0,
                longitude: 20.0,
                altitude: 30.0,
            },
            Health {
                gyrometer_ok: true,
                accelerometer_ok: false,
                magnetometer_ok: true,
            },
        )
    }

    #[test]
    fn test_flight_mode_cycle() {
        let mut mode = FlightMode::Ready;
        let mut seen = Vec::new();
        for _ in 0..6 {
            seen.push(mode);
            mode = mode.next_in_cycle();
        }
        assert_eq!(
            seen,
            vec![
                FlightMode::Ready,
                FlightMode::Takeoff,
                FlightMode::Inflight,
                FlightMode::Landing,
                FlightMode::Offline,
                FlightMode::Ready,
            ]
        );
        assert_eq!(FlightMode::Unknown.next_in_cycle(), FlightMode::Ready);
    }

    #[test]
    fn test_flight_mode_wire_values() {
        for mode in FlightMode::ALL {
            assert_eq!(FlightMode::from_u8(mode.as_u8()), Some(mode));
        }
        assert_eq!(FlightMode::from_u8(6), None);
        assert_eq!(FlightMode::from_u8(255), None);
    }

    #[test]
    fn test_validate() {
        assert!(sample_key_frame().validate().is_ok());
        assert!(DeviceStateRecord::delta("d").validate().is_ok());

        let mut incomplete = sample_key_frame();
        incomplete.health = None;
        assert_eq!(
            incomplete.validate(),
            Err(RecordViolation::IncompleteKeyFrame)
        );

        assert_eq!(
            DeviceStateRecord::delta("").validate(),
            Err(RecordViolation::EmptyDeviceId)
        );
    }

    #[test]
    fn test_violation_is_an_error() {
        let err: Box<dyn std::error::Error> = Box::new(RecordViolation::IncompleteKeyFrame);
        assert_eq!(
            err.to_string(),
            "Keyframe is missing at least one measured field"
        );
        assert_eq!(RecordViolation::EmptyDeviceId.to_string(), "Device id is empty");
    }

    #[test]
    fn test_key_frame_flattens_into_state() {
        let state = PersistedDeviceState::from(&sample_key_frame());

        assert_eq!(state.device_id, "device001");
        assert_eq!(state.battery, Some(1.0));
        assert_eq!(state.flight_mode(), Some(FlightMode::Landing));
        assert_eq!(state.latitude, Some(10.0));
        assert_eq!(state.longitude, Some(20.0));
        assert_eq!(state.altitude, Some(30.0));
        assert_eq!(state.gyrometer_ok, Some(true));
        assert_eq!(state.accelerometer_ok, Some(false));
        assert_eq!(state.magnetometer_ok, Some(true));
    }

    #[test]
    fn test_heartbeat_flattens_to_empty_state() {
        let state = PersistedDeviceState::from(&DeviceStateRecord::delta("device001"));
        assert_eq!(state, PersistedDeviceState::new("device001"));
    }

    #[test]
    fn test_merge_unions_fields() {
        let mut stored = PersistedDeviceState::new("device001");
        stored.battery = Some(0.5);

        let mut update = PersistedDeviceState::new("device001");
        update.latitude = Some(10.0);
        update.longitude = Some(20.0);
        update.altitude = Some(30.0);

        stored.merge(&update);

        assert_eq!(stored.battery, Some(0.5));
        assert_eq!(stored.latitude, Some(10.0));
        assert_eq!(stored.longitude, Some(20.0));
        assert_eq!(stored.altitude, Some(30.0));
        assert_eq!(stored.flight_mode, None);
    }

    #[test]
    fn test_merge_overwrites_supplied_fields_only() {
        let mut stored = PersistedDeviceState::from(&sample_key_frame());

        let mut update = PersistedDeviceState::new("device001");
        update.battery = Some(0.42);
        update.gyrometer_ok = Some(false);

        stored.merge(&update);

        assert_eq!(stored.battery, Some(0.42));
        assert_eq!(stored.gyrometer_ok, Some(false));
        assert_eq!(stored.flight_mode(), Some(FlightMode::Landing));
        assert_eq!(stored.accelerometer_ok, Some(false));
    }

    #[test]
    fn test_state_json_omits_absent_fields() {
        let mut state = PersistedDeviceState::new("device001");
        state.battery = Some(1.0);

        let json = serde_json::to_string(&state).unwrap();
        assert_eq!(json, r#"{"device_id":"device001","battery":1.0}"#);

        let back: PersistedDeviceState = serde_json::from_str(&json).unwrap();
        assert_eq!(back, state);
    }
}
