//! Circuit tuning knobs.

use std::time::Duration;

/// Configuration for a relay circuit.
#[derive(Debug, Clone)]
pub struct CircuitConfig {
    /// Interval between keep-alive pings and health checks.
    pub keep_alive_interval: Duration,
    /// Quiet period after which an `Active` circuit becomes `Stale`.
    pub idle_timeout: Duration,
    /// Maximum age of the last pong before the circuit is declared dead.
    pub pong_timeout: Duration,
    /// Byte budget for the circuit; `0` means unbounded.
    pub max_bytes: u64,
    /// Hard lifetime for the circuit, measured from creation.
    pub deadline: Option<Duration>,
    /// Whether the ping/pong control channel is negotiated.
    pub control_enabled: bool,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            keep_alive_interval: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(120),
            pong_timeout: Duration::from_secs(60),
            max_bytes: 0,
            deadline: None,
            control_enabled: true,
        }
    }
}
