//! AutoRelay tuning knobs.

use std::time::Duration;

use strand_api::PeerInfo;

#[derive(Debug, Clone)]
pub struct AutoRelayConfig {
    /// Floor of active reservations the manager maintains while enabled.
    pub min_relays: usize,
    /// Ceiling on simultaneously active reservations.
    pub max_relays: usize,
    /// Spacing of top-up and blacklist-sweep passes.
    pub maintenance_interval: Duration,
    /// Spacing of reservation refresh passes.
    pub refresh_interval: Duration,
    /// Spacing of relay discovery passes.
    pub discovery_interval: Duration,
    /// Relays configured ahead of time; seeded as preferred candidates.
    pub static_relays: Vec<PeerInfo>,
    /// Whether failed relays are blacklisted before reuse.
    pub enable_backoff: bool,
    /// Blacklist lifetime for ordinary relays.
    pub max_backoff: Duration,
    /// Blacklist lifetime for inferred candidates, the most likely false
    /// positives.
    pub inferred_backoff: Duration,
    /// Refresh a reservation once it is this close to expiry.
    pub reservation_refresh_before: Duration,
    /// Budget for reserve, refresh and discovery calls.
    pub request_timeout: Duration,
}

impl Default for AutoRelayConfig {
    fn default() -> Self {
        Self {
            min_relays: 2,
            max_relays: 4,
            maintenance_interval: Duration::from_secs(5),
            refresh_interval: Duration::from_secs(300),
            discovery_interval: Duration::from_secs(3),
            static_relays: Vec::new(),
            enable_backoff: true,
            max_backoff: Duration::from_secs(300),
            inferred_backoff: Duration::from_secs(3600),
            reservation_refresh_before: Duration::from_secs(600),
            request_timeout: Duration::from_secs(30),
        }
    }
}
