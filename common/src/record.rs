//! Fixed-layout settings record as written to the configuration store.
//!
//! ```text
//! offset  size  field
//! 0       4     marker (0xA1B2C3D4, little-endian)
//! 4       7     actuator 1: on_time u32 LE, hour u8, minute u8, enabled u8
//! 11      7     actuator 2
//! 18      7     actuator 3
//! ```

use crate::{
    config::{ActuatorSettings, PersistedSettings},
    types::ACTUATOR_COUNT,
};

pub const RECORD_MAGIC: u32 = 0xA1B2_C3D4;
const MARKER_LEN: usize = 4;
const SLOT_LEN: usize = 7;
pub const RECORD_LEN: usize = MARKER_LEN + SLOT_LEN * ACTUATOR_COUNT;

pub fn encode(settings: &PersistedSettings) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(RECORD_LEN);
    bytes.extend_from_slice(&RECORD_MAGIC.to_le_bytes());
    for slot in &settings.actuators {
        bytes.extend_from_slice(&slot.on_duration_minutes.to_le_bytes());
        bytes.push(slot.schedule_hour);
        bytes.push(slot.schedule_minute);
        bytes.push(u8::from(slot.schedule_enabled));
    }
    bytes
}

/// Returns `None` when the bytes do not carry a valid record, which callers
/// treat as an uninitialized store. Decoded values are sanitized.
pub fn decode(bytes: &[u8]) -> Option<PersistedSettings> {
    if bytes.len() != RECORD_LEN {
        return None;
    }

    let (marker, body) = bytes.split_at(MARKER_LEN);
    if u32::from_le_bytes(marker.try_into().ok()?) != RECORD_MAGIC {
        return None;
    }

    let mut settings = PersistedSettings::default();
    for (slot, chunk) in settings.actuators.iter_mut().zip(body.chunks_exact(SLOT_LEN)) {
        *slot = ActuatorSettings {
            on_duration_minutes: u32::from_le_bytes(chunk[..4].try_into().ok()?),
            schedule_hour: chunk[4],
            schedule_minute: chunk[5],
            schedule_enabled: chunk[6] != 0,
        };
    }
    settings.sanitize();
    Some(settings)
}
