//! Scripted hole puncher.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use libp2p::{Multiaddr, PeerId};
use parking_lot::{Mutex, RwLock};
use strand_api::{HolePuncher, PunchError};

/// Hole puncher with per-peer scripted outcomes. Tracks the number of
/// concurrently running punches so tests can assert at-most-one semantics.
#[derive(Default)]
pub struct MockHolePuncher {
    outcomes: RwLock<HashMap<PeerId, Result<Multiaddr, PunchError>>>,
    delay: RwLock<Option<Duration>>,
    calls: Mutex<Vec<(PeerId, Vec<Multiaddr>)>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl MockHolePuncher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn succeed_with(&self, remote: PeerId, addr: Multiaddr) {
        self.outcomes.write().insert(remote, Ok(addr));
    }

    pub fn fail_with(&self, remote: PeerId, error: PunchError) {
        self.outcomes.write().insert(remote, Err(error));
    }

    /// Hold every punch for `delay` before resolving.
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.write() = Some(delay);
    }

    pub fn calls(&self) -> Vec<(PeerId, Vec<Multiaddr>)> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    /// Highest number of punches that were ever in flight at once.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl HolePuncher for MockHolePuncher {
    async fn punch(
        &self,
        remote: PeerId,
        remote_addrs: Vec<Multiaddr>,
    ) -> Result<Multiaddr, PunchError> {
        self.calls.lock().push((remote, remote_addrs));

        let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(running, Ordering::SeqCst);

        let delay = *self.delay.read();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        self.outcomes
            .read()
            .get(&remote)
            .cloned()
            .unwrap_or(Err(PunchError::Unreachable(remote)))
    }
}
