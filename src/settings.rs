//! Player preferences persisted with dconf
//!
//! Stored under `/com/voxpost/player/`. Volume is kept as a string since
//! dconf_rs has no double accessor.

use log::{debug, error};

const DCONF_PATH: &str = "/com/voxpost/player/";

/// Keys for dconf settings
mod keys {
    pub const VOLUME: &str = "volume";
    pub const MUTED: &str = "muted";
}

fn key(name: &str) -> String {
    format!("{}{}", DCONF_PATH, name)
}

/// Last player volume, or `default` if unset or unreadable
pub fn get_volume(default: f32) -> f32 {
    match dconf_rs::get_string(&key(keys::VOLUME)) {
        Ok(raw) => parse_volume(&raw).unwrap_or_else(|| {
            debug!("Ignoring stored volume {:?}", raw);
            default
        }),
        Err(_) => default,
    }
}

pub fn set_volume(volume: f32) {
    if let Err(e) = dconf_rs::set_string(&key(keys::VOLUME), &format!("{:.2}", volume)) {
        error!("Failed to save volume to dconf: {}", e);
    }
}

/// Whether the player was muted last time (defaults to false)
pub fn get_muted() -> bool {
    dconf_rs::get_boolean(&key(keys::MUTED)).unwrap_or(false)
}

pub fn set_muted(muted: bool) {
    if let Err(e) = dconf_rs::set_boolean(&key(keys::MUTED), muted) {
        error!("Failed to save mute setting to dconf: {}", e);
    }
}

fn parse_volume(raw: &str) -> Option<f32> {
    let value: f32 = raw.trim().trim_matches('\'').parse().ok()?;
    (value.is_finite() && (0.0..=1.0).contains(&value)).then_some(value)
}
