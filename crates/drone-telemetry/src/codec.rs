// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Binary state codec
//!
//! # Payload Format
//!
//! ```text
//! +-----------------------------------------------------------+
//! | magic (1) = 0xD7 | version (1) | flags (1)                |
//! | device_id_len (2) | device_id (utf-8, var)                |
//! +-----------------------------------------------------------+
//! | Field[] : tag (1) | len (2) | value (len)                 |
//! |   tag 1  battery       f64                                |
//! |   tag 2  flight_mode   u8                                 |
//! |   tag 3  position      lat f64 | lon f64 | alt f64        |
//! |   tag 4  health        u8 (bit0 gyro, bit1 accel, bit2 mag)|
//! +-----------------------------------------------------------+
//! ```
//!
//! All integers and floats are little-endian. Flag bit 0 marks a keyframe,
//! the remaining flag bits are reserved and must be zero.
//!
//! Optional fields are written only when present, so absence (not a sentinel
//! value) means "no new value". Readers skip tags they do not know, which keeps
//! payloads from newer writers decodable as long as new fields are additive.

use crate::model::{DeviceStateRecord, FlightMode, Health, Position, RecordViolation};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{self, Cursor, Read};
use thiserror::Error;

/// First byte of every payload.
pub const MAGIC: u8 = 0xD7;

/// Current payload version.
pub const FORMAT_VERSION: u8 = 1;

/// Longest accepted device id, in bytes.
pub const MAX_DEVICE_ID_LEN: usize = 256;

const FLAG_KEY_FRAME: u8 = 0x01;

const TAG_BATTERY: u8 = 1;
const TAG_FLIGHT_MODE: u8 = 2;
const TAG_POSITION: u8 = 3;
const TAG_HEALTH: u8 = 4;

const HEALTH_GYRO: u8 = 0x01;
const HEALTH_ACCEL: u8 = 0x02;
const HEALTH_MAGNET: u8 = 0x04;
const HEALTH_MASK: u8 = HEALTH_GYRO | HEALTH_ACCEL | HEALTH_MAGNET;

const HEADER_SIZE: usize = 5;

/// Codec errors. Every variant is terminal: retrying the same bytes can never
/// succeed.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Payload truncated")]
    Truncated,

    #[error("Invalid magic byte: 0x{0:02x}")]
    BadMagic(u8),

    #[error("Unsupported payload version: {0}")]
    UnsupportedVersion(u8),

    #[error("Reserved flag bits set: 0x{0:02x}")]
    ReservedFlags(u8),

    #[error("Device id is empty")]
    EmptyDeviceId,

    #[error("Device id too long: {0} bytes (max {MAX_DEVICE_ID_LEN})")]
    DeviceIdTooLong(usize),

    #[error("Device id is not valid UTF-8")]
    InvalidDeviceId,

    #[error("Invalid flight mode value: {0}")]
    InvalidFlightMode(u8),

    #[error("Invalid health bits: 0x{0:02x}")]
    InvalidHealth(u8),

    #[error("Duplicate field tag {0}")]
    DuplicateField(u8),

    #[error("Field tag {tag} has length {actual}, expected {expected}")]
    FieldLength { tag: u8, expected: usize, actual: usize },

    #[error("Keyframe is missing measured fields")]
    IncompleteKeyFrame,

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl From<RecordViolation> for CodecError {
    fn from(violation: RecordViolation) -> Self {
        match violation {
            RecordViolation::EmptyDeviceId => CodecError::EmptyDeviceId,
            RecordViolation::IncompleteKeyFrame => CodecError::IncompleteKeyFrame,
        }
    }
}

/// Encode a record into a payload.
///
/// Rejects records that break the keyframe/delta invariants, so every payload
/// this returns decodes back to an equal record.
pub fn encode(record: &DeviceStateRecord) -> Result<Vec<u8>, CodecError> {
    record.validate()?;

    let id = record.device_id.as_bytes();
    if id.len() > MAX_DEVICE_ID_LEN {
        return Err(CodecError::DeviceIdTooLong(id.len()));
    }

    let mut buf = Vec::with_capacity(HEADER_SIZE + id.len() + 48);
    buf.write_u8(MAGIC)?;
    buf.write_u8(FORMAT_VERSION)?;
    buf.write_u8(if record.is_key_frame { FLAG_KEY_FRAME } else { 0 })?;
    buf.write_u16::<LittleEndian>(id.len() as u16)?;
    buf.extend_from_slice(id);

    if let Some(battery) = record.battery {
        write_field_header(&mut buf, TAG_BATTERY, 8)?;
        buf.write_f64::<LittleEndian>(battery)?;
    }
    if let Some(mode) = record.flight_mode {
        write_field_header(&mut buf, TAG_FLIGHT_MODE, 1)?;
        buf.write_u8(mode.as_u8())?;
    }
    if let Some(pos) = record.position {
        write_field_header(&mut buf, TAG_POSITION, 24)?;
        buf.write_f64::<LittleEndian>(pos.latitude)?;
        buf.write_f64::<LittleEndian>(pos.longitude)?;
        buf.write_f64::<LittleEndian>(pos.altitude)?;
    }
    if let Some(health) = record.health {
        write_field_header(&mut buf, TAG_HEALTH, 1)?;
        buf.write_u8(health_to_bits(health))?;
    }

    Ok(buf)
}

/// Decode a payload into a record.
pub fn decode(bytes: &[u8]) -> Result<DeviceStateRecord, CodecError> {
    let mut r = Cursor::new(bytes);

    let magic = r.read_u8().map_err(eof)?;
    if magic != MAGIC {
        return Err(CodecError::BadMagic(magic));
    }
    let version = r.read_u8().map_err(eof)?;
    if version != FORMAT_VERSION {
        return Err(CodecError::UnsupportedVersion(version));
    }
    let flags = r.read_u8().map_err(eof)?;
    if flags & !FLAG_KEY_FRAME != 0 {
        return Err(CodecError::ReservedFlags(flags));
    }

    let id_len = r.read_u16::<LittleEndian>().map_err(eof)? as usize;
    if id_len == 0 {
        return Err(CodecError::EmptyDeviceId);
    }
    if id_len > MAX_DEVICE_ID_LEN {
        return Err(CodecError::DeviceIdTooLong(id_len));
    }
    let id_bytes = read_exact_vec(&mut r, id_len)?;
    let device_id = String::from_utf8(id_bytes).map_err(|_| CodecError::InvalidDeviceId)?;

    let mut record = DeviceStateRecord::delta(device_id);
    record.is_key_frame = flags & FLAG_KEY_FRAME != 0;

    while (r.position() as usize) < bytes.len() {
        let tag = r.read_u8().map_err(eof)?;
        let len = r.read_u16::<LittleEndian>().map_err(eof)? as usize;
        let value = read_exact_vec(&mut r, len)?;
        decode_field(&mut record, tag, &value)?;
    }

    if record.is_key_frame && !record.is_complete() {
        return Err(CodecError::IncompleteKeyFrame);
    }

    Ok(record)
}

fn decode_field(record: &mut DeviceStateRecord, tag: u8, value: &[u8]) -> Result<(), CodecError> {
    let mut v = Cursor::new(value);
    match tag {
        TAG_BATTERY => {
            check_len(tag, 8, value.len())?;
            reject_duplicate(tag, record.battery.is_some())?;
            record.battery = Some(v.read_f64::<LittleEndian>()?);
        }
        TAG_FLIGHT_MODE => {
            check_len(tag, 1, value.len())?;
            reject_duplicate(tag, record.flight_mode.is_some())?;
            let raw = v.read_u8()?;
            let mode = FlightMode::from_u8(raw).ok_or(CodecError::InvalidFlightMode(raw))?;
            record.flight_mode = Some(mode);
        }
        TAG_POSITION => {
            check_len(tag, 24, value.len())?;
            reject_duplicate(tag, record.position.is_some())?;
            record.position = Some(Position {
                latitude: v.read_f64::<LittleEndian>()?,
                longitude: v.read_f64::<LittleEndian>()?,
                altitude: v.read_f64::<LittleEndian>()?,
            });
        }
        TAG_HEALTH => {
            check_len(tag, 1, value.len())?;
            reject_duplicate(tag, record.health.is_some())?;
            let bits = v.read_u8()?;
            if bits & !HEALTH_MASK != 0 {
                return Err(CodecError::InvalidHealth(bits));
            }
            record.health = Some(health_from_bits(bits));
        }
        _ => {
            tracing::trace!("Skipping unknown field tag {} ({} bytes)", tag, value.len());
        }
    }
    Ok(())
}

fn write_field_header(buf: &mut Vec<u8>, tag: u8, len: u16) -> io::Result<()> {
    buf.write_u8(tag)?;
    buf.write_u16::<LittleEndian>(len)
}

fn read_exact_vec(r: &mut Cursor<&[u8]>, len: usize) -> Result<Vec<u8>, CodecError> {
    let remaining = r.get_ref().len().saturating_sub(r.position() as usize);
    if len > remaining {
        return Err(CodecError::Truncated);
    }
    let mut out = vec![0u8; len];
    r.read_exact(&mut out).map_err(eof)?;
    Ok(out)
}

fn check_len(tag: u8, expected: usize, actual: usize) -> Result<(), CodecError> {
    if expected != actual {
        return Err(CodecError::FieldLength {
            tag,
            expected,
            actual,
        });
    }
    Ok(())
}

fn reject_duplicate(tag: u8, already_set: bool) -> Result<(), CodecError> {
    if already_set {
        return Err(CodecError::DuplicateField(tag));
    }
    Ok(())
}

fn eof(err: io::Error) -> CodecError {
    if err.kind() == io::ErrorKind::UnexpectedEof {
        CodecError::Truncated
    } else {
        CodecError::Io(err)
    }
}

fn health_to_bits(health: Health) -> u8 {
    let mut bits = 0;
    if health.gyrometer_ok {
        bits |= HEALTH_GYRO;
    }
    if health.accelerometer_ok {
        bits |= HEALTH_ACCEL;
    }
    if health.magnetometer_ok {
        bits |= HEALTH_MAGNET;
    }
    bits
}

fn health_from_bits(bits: u8) -> Health {
    Health {
        gyrometer_ok: bits & HEALTH_GYRO != 0,
        accelerometer_ok: bits & HEALTH_ACCEL != 0,
        magnetometer_ok: bits & HEALTH_MAGNET != 0,
    }
}
