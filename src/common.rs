//! These modules are shared by the peer, midi and client layers.
use std::time::{SystemTime, UNIX_EPOCH};

pub mod box_error;
pub mod config;
pub mod emitter;
pub mod micro_timer;
pub mod settings;

/// microseconds since the epoch.  This is the clock every timer in the crate runs on.
pub fn get_micro_time() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros())
        .unwrap_or(0)
}
