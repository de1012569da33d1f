//! Traffic accounting for the strand overlay runtime.
//!
//! The transport layer reports every byte sent or received; this crate
//! aggregates the volume globally and per protocol/peer, and estimates
//! recent rates over a sixty-second sliding window.

mod counter;
mod meter;

pub use counter::{BandwidthCounter, Stats};
pub use meter::RateMeter;
