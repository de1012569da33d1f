//! Upgrade tuning knobs.

use std::time::Duration;

#[derive(Debug, Clone)]
pub struct UpgradeConfig {
    /// Budget for the hole-punch attempt itself.
    pub hole_punch_timeout: Duration,
    /// Budget for the address exchange over the relay circuit.
    pub addr_exchange_timeout: Duration,
    /// Spacing between retries of a failed upgrade.
    pub retry_interval: Duration,
    /// Retries after the initial failed attempt.
    pub max_retries: u32,
    /// Whether failed upgrades are retried in the background.
    pub enable_auto_upgrade: bool,
    /// Upper bound on addresses accepted from the remote.
    pub max_address_count: usize,
}

impl Default for UpgradeConfig {
    fn default() -> Self {
        Self {
            hole_punch_timeout: Duration::from_secs(10),
            addr_exchange_timeout: Duration::from_secs(5),
            retry_interval: Duration::from_secs(300),
            max_retries: 3,
            enable_auto_upgrade: true,
            max_address_count: 100,
        }
    }
}
