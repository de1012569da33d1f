//! Scripted relay client and reservations.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use async_trait::async_trait;
use libp2p::{Multiaddr, PeerId};
use parking_lot::{Mutex, RwLock};
use strand_api::{RelayClient, Reservation, ReserveError, unix_secs};

const DEFAULT_RESERVATION_TTL_SECS: u64 = 3600;

/// Reservation handed out by [`MockRelayClient`].
pub struct MockReservation {
    relay: PeerId,
    expiry: AtomicU64,
    addrs: Vec<Multiaddr>,
    ttl: u64,
    cancelled: AtomicBool,
    fail_refresh: Arc<AtomicBool>,
    refresh_calls: AtomicU32,
}

impl MockReservation {
    pub fn relay(&self) -> PeerId {
        self.relay
    }

    pub fn refresh_calls(&self) -> u32 {
        self.refresh_calls.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl Reservation for MockReservation {
    fn expiry(&self) -> u64 {
        self.expiry.load(Ordering::Relaxed)
    }

    fn addrs(&self) -> Vec<Multiaddr> {
        self.addrs.clone()
    }

    async fn refresh(&self) -> Result<(), ReserveError> {
        self.refresh_calls.fetch_add(1, Ordering::Relaxed);
        if self.cancelled.load(Ordering::Relaxed) {
            return Err(ReserveError::Cancelled);
        }
        if self.fail_refresh.load(Ordering::Relaxed) {
            return Err(ReserveError::Transport("scripted refresh failure".into()));
        }
        self.expiry.store(unix_secs() + self.ttl, Ordering::Relaxed);
        Ok(())
    }

    async fn cancel(&self) -> Result<(), ReserveError> {
        self.cancelled.store(true, Ordering::Relaxed);
        Ok(())
    }
}

/// Relay client with scripted reservation outcomes and discovery results.
#[derive(Default)]
pub struct MockRelayClient {
    fail_reserve: RwLock<HashSet<PeerId>>,
    fail_refresh: RwLock<HashMap<PeerId, Arc<AtomicBool>>>,
    relay_addrs: RwLock<HashMap<PeerId, Vec<Multiaddr>>>,
    discoverable: RwLock<Vec<PeerId>>,
    reserve_calls: Mutex<Vec<PeerId>>,
    reservation_ttl: AtomicU64,
}

impl MockRelayClient {
    pub fn new() -> Self {
        let client = Self::default();
        client
            .reservation_ttl
            .store(DEFAULT_RESERVATION_TTL_SECS, Ordering::Relaxed);
        client
    }

    pub fn set_reservation_ttl(&self, secs: u64) {
        self.reservation_ttl.store(secs, Ordering::Relaxed);
    }

    /// Make every future `reserve(relay)` fail.
    pub fn fail_reservations_for(&self, relay: PeerId) {
        self.fail_reserve.write().insert(relay);
    }

    pub fn allow_reservations_for(&self, relay: &PeerId) {
        self.fail_reserve.write().remove(relay);
    }

    /// Make every future refresh of reservations on `relay` fail.
    pub fn fail_refreshes_for(&self, relay: PeerId) {
        self.refresh_flag(relay).store(true, Ordering::Relaxed);
    }

    pub fn set_relay_addrs(&self, relay: PeerId, addrs: Vec<Multiaddr>) {
        self.relay_addrs.write().insert(relay, addrs);
    }

    /// Script the result of `find_relays`.
    pub fn set_discoverable(&self, relays: Vec<PeerId>) {
        *self.discoverable.write() = relays;
    }

    /// Every reserve call so far, in order.
    pub fn reserve_calls(&self) -> Vec<PeerId> {
        self.reserve_calls.lock().clone()
    }

    fn refresh_flag(&self, relay: PeerId) -> Arc<AtomicBool> {
        Arc::clone(
            self.fail_refresh
                .write()
                .entry(relay)
                .or_insert_with(|| Arc::new(AtomicBool::new(false))),
        )
    }
}

#[async_trait]
impl RelayClient for MockRelayClient {
    async fn reserve(&self, relay: PeerId) -> Result<Arc<dyn Reservation>, ReserveError> {
        self.reserve_calls.lock().push(relay);

        if self.fail_reserve.read().contains(&relay) {
            return Err(ReserveError::Refused(relay));
        }

        let addrs = self
            .relay_addrs
            .read()
            .get(&relay)
            .cloned()
            .unwrap_or_else(|| {
                vec![
                    "/ip4/127.0.0.1/tcp/4001"
                        .parse()
                        .unwrap_or_else(|_| Multiaddr::empty()),
                ]
            });

        let ttl = self.reservation_ttl.load(Ordering::Relaxed);
        Ok(Arc::new(MockReservation {
            relay,
            expiry: AtomicU64::new(unix_secs() + ttl),
            addrs,
            ttl,
            cancelled: AtomicBool::new(false),
            fail_refresh: self.refresh_flag(relay),
            refresh_calls: AtomicU32::new(0),
        }))
    }

    async fn find_relays(&self) -> Result<Vec<PeerId>, ReserveError> {
        Ok(self.discoverable.read().clone())
    }
}
