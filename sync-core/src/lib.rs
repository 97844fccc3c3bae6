#![no_std]

#[cfg(test)]
extern crate std;

// Real-time physiological event detection and stimulus scheduling.
//
// This crate stays portable across embedded trigger boxes and host tooling by
// avoiding the Rust standard library. Clocks, entropy and stimulus outputs are
// injected by the caller; everything here is bounded and allocation-free.

pub mod config;
pub mod delays;
pub mod detector;
pub mod dispatch;
pub mod heartrate;
pub mod scheduler;
pub mod sequence;
pub mod settings;
pub mod telemetry;
pub mod wait;

/// Timestamps shared with the streaming source, in seconds on its clock.
pub type Timestamp = f64;

/// Absolute difference between two timestamps without relying on `std`.
#[must_use]
pub(crate) fn distance(a: f64, b: f64) -> f64 {
    if a >= b { a - b } else { b - a }
}
