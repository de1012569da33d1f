//! AutoRelay: keeps a floor of live relay reservations and publishes the
//! resulting circuit addresses.
//!
//! Candidates arrive from discovery, from configuration and from live
//! connections ("inferred" candidates, the least trusted tier). Reservation
//! failures feed a TTL blacklist instead of surfacing as errors; refresh
//! keeps reservations alive under churn and fails relays over after three
//! consecutive refresh errors.

mod candidates;
mod config;
mod events;
mod manager;

pub use candidates::{Candidate, INFERRED_PRIORITY, PREFERRED_PRIORITY};
pub use config::AutoRelayConfig;
pub use events::RelayEvent;
pub use manager::{AutoRelay, HOP_PROTOCOL, RelayStatus};
