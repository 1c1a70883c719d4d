// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Telemetry generator
//!
//! Produces the next [`DeviceStateRecord`] for a device from its last
//! keyframe. Each call is independent; the only shared state is the
//! pseudo-random source, which can be seeded for reproducible runs.

use crate::model::{DeviceStateRecord, FlightMode, Health, Position};
use std::sync::Mutex;

/// Starting latitude of every device.
pub const DEFAULT_LATITUDE: f64 = 47.476075;
/// Starting longitude of every device.
pub const DEFAULT_LONGITUDE: f64 = -122.192026;
/// Starting altitude of every device.
pub const DEFAULT_ALTITUDE: f64 = 0.0;

/// Battery never drops below this level.
pub const MIN_BATTERY: f64 = 0.1;
/// Full battery.
pub const MAX_BATTERY: f64 = 1.0;
/// Battery random walk, percent of the previous level.
pub const BATTERY_VARIATION_PCT: f64 = 2.0;

/// Bounds of the per-keyframe displacement, in miles.
pub const MAX_DISPLACEMENT: f64 = 1.5;
const DISPLACEMENT_AVERAGE: f64 = 0.05;
const DISPLACEMENT_VARIATION_PCT: f64 = 2500.0;

const CRUISE_ALTITUDE: f64 = 499.99;
const ALTITUDE_VARIATION_PCT: f64 = 5.0;
const MIN_ALTITUDE: f64 = 494.99;
const MAX_ALTITUDE: f64 = 504.99;

const METERS_PER_MILE: f64 = 1609.344;
const EARTH_RADIUS_M: f64 = 6_378_137.0;

/// Generates device telemetry records.
#[derive(Debug)]
pub struct TelemetryGenerator {
    rng: Mutex<fastrand::Rng>,
}

impl Default for TelemetryGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl TelemetryGenerator {
    /// Generator with an entropy-seeded random source.
    pub fn new() -> Self {
        Self {
            rng: Mutex::new(fastrand::Rng::new()),
        }
    }

    /// Generator with a fixed seed.
    pub fn with_seed(seed: u64) -> Self {
        Self {
            rng: Mutex::new(fastrand::Rng::with_seed(seed)),
        }
    }

    /// Build the next record for `device_id`.
    ///
    /// - no previous keyframe: the canonical first frame
    /// - `force_key_frame`: a full record evolved from `previous`
    /// - otherwise: a heartbeat delta with no measured fields
    pub fn next_state(
        &self,
        previous: Option<&DeviceStateRecord>,
        device_id: &str,
        force_key_frame: bool,
    ) -> DeviceStateRecord {
        let previous = match previous {
            None => return Self::first_frame(device_id),
            Some(previous) => previous,
        };
        if !force_key_frame {
            return DeviceStateRecord::delta(device_id);
        }

        let mut rng = self.rng.lock().unwrap_or_else(|e| e.into_inner());

        let last_battery = previous.battery.unwrap_or(MAX_BATTERY);
        let battery = round_to(
            vary_condition(
                &mut rng,
                last_battery,
                BATTERY_VARIATION_PCT,
                MIN_BATTERY,
                last_battery.max(MIN_BATTERY),
            ),
            2,
        );

        let flight_mode = previous
            .flight_mode
            .unwrap_or(FlightMode::Offline)
            .next_in_cycle();

        let last_position = previous.position.unwrap_or(Position {
            latitude: DEFAULT_LATITUDE,
            longitude: DEFAULT_LONGITUDE,
            altitude: DEFAULT_ALTITUDE,
        });
        let position = vary_position(&mut rng, last_position);

        let health = Health {
            gyrometer_ok: rng.bool(),
            accelerometer_ok: rng.bool(),
            magnetometer_ok: rng.bool(),
        };

        DeviceStateRecord::key_frame(device_id, battery, flight_mode, position, health)
    }

    /// Canonical first record of every device.
    pub fn first_frame(device_id: &str) -> DeviceStateRecord {
        DeviceStateRecord::key_frame(
            device_id,
            MAX_BATTERY,
            FlightMode::Offline,
            Position {
                latitude: DEFAULT_LATITUDE,
                longitude: DEFAULT_LONGITUDE,
                altitude: DEFAULT_ALTITUDE,
            },
            Health::ALL_OK,
        )
    }

    /// Uniform integer in `[low, high)`, from the shared random source.
    ///
    /// Returns `low` for an empty range.
    pub fn random_in(&self, low: u64, high: u64) -> u64 {
        if high <= low {
            return low;
        }
        let mut rng = self.rng.lock().unwrap_or_else(|e| e.into_inner());
        rng.u64(low..high)
    }
}

/// `average` varied by up to `pct` percent either way, clamped to `[min, max]`.
fn vary_condition(rng: &mut fastrand::Rng, average: f64, pct: f64, min: f64, max: f64) -> f64 {
    let factor = 1.0 + (pct / 100.0) * (2.0 * rng.f64() - 1.0);
    (average * factor).clamp(min, max)
}

fn vary_position(rng: &mut fastrand::Rng, from: Position) -> Position {
    let distance = round_to(
        vary_condition(
            rng,
            DISPLACEMENT_AVERAGE,
            DISPLACEMENT_VARIATION_PCT,
            -MAX_DISPLACEMENT,
            MAX_DISPLACEMENT,
        ),
        2,
    );
    // Spherical approximation: arc length over the equatorial radius.
    let degrees = (distance * METERS_PER_MILE / EARTH_RADIUS_M).to_degrees();
    let latitude = round_to(from.latitude + degrees, 6);
    let longitude = round_to(
        from.longitude + degrees / from.latitude.to_radians().cos(),
        6,
    );
    let altitude = round_to(
        vary_condition(
            rng,
            CRUISE_ALTITUDE,
            ALTITUDE_VARIATION_PCT,
            MIN_ALTITUDE,
            MAX_ALTITUDE,
        ),
        2,
    );
    Position {
        latitude,
        longitude,
        altitude,
    }
}

fn round_to(value: f64, places: i32) -> f64 {
    let scale = 10f64.powi(places);
    (value * scale).round() / scale
}
