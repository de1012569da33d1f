//! The AutoRelay manager: candidate selection, reservation upkeep,
//! blacklist and advertised-address publication.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use libp2p::multiaddr::Protocol;
use libp2p::{Multiaddr, PeerId};
use parking_lot::{Mutex, RwLock};
use strand_api::{
    ConnectionEventKind, CoreEvent, CoreEventBus, Endpoint, Host, RelayClient, Reservation,
    unix_millis, unix_secs,
};
use tokio::sync::{broadcast, watch};
use tracing::{debug, trace, warn};

use crate::candidates::{Candidate, sort_for_selection};
use crate::config::AutoRelayConfig;
use crate::events::{RelayEvent, RelayEventEmitter};

/// Protocol a peer must advertise to act as a circuit relay.
pub const HOP_PROTOCOL: &str = "/libp2p/circuit/relay/0.2.0/hop";

/// Consecutive refresh failures after which a relay is dropped.
const MAX_REFRESH_FAILURES: u32 = 3;

/// Inspection snapshot of the manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayStatus {
    pub enabled: bool,
    pub running: bool,
    pub active: usize,
    pub candidates: usize,
    pub blacklisted: usize,
}

type AddrsChangedCallback = Arc<dyn Fn(Vec<Multiaddr>) + Send + Sync>;

struct ActiveRelay {
    reservation: Arc<dyn Reservation>,
    /// Circuit-form addresses published for this relay.
    addrs: Vec<Multiaddr>,
    last_refresh: u64,
    fail_count: u32,
    /// Candidate priority at reservation time; drives the blacklist TTL.
    priority: i32,
}

struct AutoRelayInner {
    config: AutoRelayConfig,
    host: Arc<dyn Host>,
    client: Arc<dyn RelayClient>,
    endpoint: Arc<dyn Endpoint>,
    bus: Option<CoreEventBus>,

    enabled: AtomicBool,
    running: AtomicBool,

    active: Mutex<HashMap<PeerId, ActiveRelay>>,
    candidates: Mutex<HashMap<PeerId, Candidate>>,
    /// Relay → blacklist expiry, Unix millis. Swept lazily.
    blacklist: Mutex<HashMap<PeerId, u64>>,
    preferred: Mutex<HashSet<PeerId>>,

    on_addrs_changed: RwLock<Option<AddrsChangedCallback>>,
    events: RelayEventEmitter,
    shutdown: Mutex<Option<watch::Sender<bool>>>,
    /// Serializes top-up passes; the maintenance, discovery and enable
    /// paths may otherwise race into duplicate reservations.
    maintain_lock: tokio::sync::Mutex<()>,
}

/// Maintains at least `min_relays` reservations from the candidate pool
/// while enabled, and publishes each reservation's circuit address.
#[derive(Clone)]
pub struct AutoRelay {
    inner: Arc<AutoRelayInner>,
}

impl AutoRelay {
    pub fn new(
        host: Arc<dyn Host>,
        client: Arc<dyn RelayClient>,
        endpoint: Arc<dyn Endpoint>,
        config: AutoRelayConfig,
    ) -> Self {
        Self {
            inner: Arc::new(AutoRelayInner {
                config,
                host,
                client,
                endpoint,
                bus: None,
                enabled: AtomicBool::new(false),
                running: AtomicBool::new(false),
                active: Mutex::new(HashMap::new()),
                candidates: Mutex::new(HashMap::new()),
                blacklist: Mutex::new(HashMap::new()),
                preferred: Mutex::new(HashSet::new()),
                on_addrs_changed: RwLock::new(None),
                events: RelayEventEmitter::default(),
                shutdown: Mutex::new(None),
                maintain_lock: tokio::sync::Mutex::new(()),
            }),
        }
    }

    /// Attach an event bus for registration-failure emissions.
    pub fn with_event_bus(mut self, bus: CoreEventBus) -> Self {
        if let Some(inner) = Arc::get_mut(&mut self.inner) {
            inner.bus = Some(bus);
        }
        self
    }

    /// Start the background loops. Idempotent. The manager stays passive
    /// until [`AutoRelay::enable`] is called.
    pub fn start(&self) {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            return;
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        *self.inner.shutdown.lock() = Some(shutdown_tx);

        // Static relays enter the pool as preferred candidates.
        {
            let mut candidates = self.inner.candidates.lock();
            let mut preferred = self.inner.preferred.lock();
            for info in &self.inner.config.static_relays {
                candidates.insert(
                    info.peer_id,
                    Candidate::new(info.peer_id, info.addrs.clone(), 0),
                );
                preferred.insert(info.peer_id);
            }
        }

        self.spawn_maintenance_loop(shutdown_rx.clone());
        self.spawn_refresh_loop(shutdown_rx.clone());
        self.spawn_discovery_loop(shutdown_rx.clone());
        self.spawn_connection_watcher(shutdown_rx);
    }

    /// Stop every loop. Reservations are left to expire on their own.
    pub fn stop(&self) {
        if !self.inner.running.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(tx) = self.inner.shutdown.lock().take() {
            let _ = tx.send(true);
        }
    }

    /// Turn the manager on and trigger an immediate top-up pass.
    pub fn enable(&self) {
        self.inner.enabled.store(true, Ordering::SeqCst);
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            inner.maintain().await;
        });
    }

    pub fn disable(&self) {
        self.inner.enabled.store(false, Ordering::SeqCst);
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.enabled.load(Ordering::SeqCst)
    }

    /// Peers we currently hold reservations on.
    pub fn relays(&self) -> Vec<PeerId> {
        self.inner.active.lock().keys().copied().collect()
    }

    /// Every published circuit-form address.
    pub fn relay_addrs(&self) -> Vec<Multiaddr> {
        self.inner.relay_addrs()
    }

    /// Unix seconds of the last successful reservation or refresh for an
    /// active relay.
    pub fn last_refresh(&self, relay: &PeerId) -> Option<u64> {
        self.inner
            .active
            .lock()
            .get(relay)
            .map(|active| active.last_refresh)
    }

    pub fn status(&self) -> RelayStatus {
        let now = unix_millis();
        RelayStatus {
            enabled: self.inner.enabled.load(Ordering::SeqCst),
            running: self.inner.running.load(Ordering::SeqCst),
            active: self.inner.active.lock().len(),
            candidates: self.inner.candidates.lock().len(),
            blacklisted: self
                .inner
                .blacklist
                .lock()
                .values()
                .filter(|expiry| **expiry > now)
                .count(),
        }
    }

    /// Add or update a candidate in the pool.
    pub fn add_candidate(&self, peer: PeerId, addrs: Vec<Multiaddr>, priority: i32) {
        self.inner
            .candidates
            .lock()
            .insert(peer, Candidate::new(peer, addrs, priority));
    }

    pub fn remove_candidate(&self, peer: &PeerId) {
        self.inner.candidates.lock().remove(peer);
    }

    /// Relays whose priority is boosted to the preferred sentinel during
    /// selection.
    pub fn set_preferred_relays(&self, relays: Vec<PeerId>) {
        *self.inner.preferred.lock() = relays.into_iter().collect();
    }

    /// Install the published-address observer. It is invoked asynchronously
    /// with a copy of the full set whenever the set changes.
    pub fn on_addrs_changed<F>(&self, cb: F)
    where
        F: Fn(Vec<Multiaddr>) + Send + Sync + 'static,
    {
        *self.inner.on_addrs_changed.write() = Some(Arc::new(cb));
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RelayEvent> {
        self.inner.events.subscribe()
    }

    fn spawn_maintenance_loop(&self, mut shutdown: watch::Receiver<bool>) {
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(inner.config.maintenance_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = ticker.tick() => {
                        inner.sweep_blacklist();
                        inner.maintain().await;
                    }
                }
            }
        });
    }

    fn spawn_refresh_loop(&self, mut shutdown: watch::Receiver<bool>) {
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(inner.config.refresh_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = ticker.tick() => inner.refresh_all().await,
                }
            }
        });
    }

    fn spawn_discovery_loop(&self, mut shutdown: watch::Receiver<bool>) {
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(inner.config.discovery_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = ticker.tick() => {
                        inner.discover().await;
                        // New candidates should not wait for the next
                        // maintenance tick.
                        inner.maintain().await;
                    }
                }
            }
        });
    }

    fn spawn_connection_watcher(&self, mut shutdown: watch::Receiver<bool>) {
        let inner = Arc::clone(&self.inner);
        let mut events = self.inner.endpoint.subscribe();
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = shutdown.changed() => break,
                    event = events.recv() => event,
                };
                match event {
                    Ok(event) => {
                        if event.kind != ConnectionEventKind::Closed || !event.is_relay_conn {
                            continue;
                        }
                        let Some(relay) = event.relay_id else { continue };
                        if inner.remove_active(&relay) {
                            debug!(%relay, reason = ?event.reason, "relay connection closed");
                            inner.maintain().await;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        trace!(skipped, "connection event stream lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }
}

impl AutoRelayInner {
    fn relay_addrs(&self) -> Vec<Multiaddr> {
        self.active
            .lock()
            .values()
            .flat_map(|relay| relay.addrs.iter().cloned())
            .collect()
    }

    /// Top up the active set to the configured floor.
    async fn maintain(self: &Arc<Self>) {
        if !self.enabled.load(Ordering::SeqCst) || !self.running.load(Ordering::SeqCst) {
            return;
        }
        let _guard = self.maintain_lock.lock().await;

        let active_count = self.active.lock().len();
        if active_count >= self.config.min_relays {
            return;
        }
        let need = self.config.min_relays - active_count;

        let mut satisfied = 0;
        for candidate in self.select_candidates(2 * need) {
            if satisfied >= need {
                break;
            }
            if self.try_relay(&candidate).await {
                satisfied += 1;
            }
        }
    }

    /// Pick up to `limit` candidates, best first, skipping blacklisted and
    /// already-active relays. Sets are copied under their locks and acted
    /// on after release.
    fn select_candidates(&self, limit: usize) -> Vec<Candidate> {
        let now = unix_millis();
        let blacklisted: HashSet<PeerId> = self
            .blacklist
            .lock()
            .iter()
            .filter(|(_, expiry)| **expiry > now)
            .map(|(peer, _)| *peer)
            .collect();
        let active: HashSet<PeerId> = self.active.lock().keys().copied().collect();
        let preferred = self.preferred.lock().clone();

        let mut selection: Vec<Candidate> = self
            .candidates
            .lock()
            .values()
            .filter(|c| !blacklisted.contains(&c.peer) && !active.contains(&c.peer))
            .cloned()
            .collect();
        sort_for_selection(&mut selection, &preferred);
        selection.truncate(limit);
        selection
    }

    /// Attempt one reservation. Failures blacklist the relay; success
    /// records it and publishes its circuit addresses.
    async fn try_relay(self: &Arc<Self>, candidate: &Candidate) -> bool {
        if !self.running.load(Ordering::SeqCst) {
            return false;
        }
        {
            let active = self.active.lock();
            if active.contains_key(&candidate.peer) || active.len() >= self.config.max_relays {
                return false;
            }
        }

        // A peer with a known protocol list that lacks HOP can never serve
        // as a relay; skip the network round-trip.
        let known = self.host.peerstore().protocols(&candidate.peer);
        if !known.is_empty() && !known.iter().any(|p| p == HOP_PROTOCOL) {
            debug!(relay = %candidate.peer, "candidate does not advertise relay hop");
            self.blacklist_relay(candidate.peer, candidate.priority);
            return false;
        }

        let reserve = self.client.reserve(candidate.peer);
        let reservation = match tokio::time::timeout(self.config.request_timeout, reserve).await {
            Ok(Ok(reservation)) => reservation,
            Ok(Err(error)) => {
                warn!(relay = %candidate.peer, %error, "reservation failed");
                self.registration_failed(candidate, error.to_string());
                return false;
            }
            Err(_) => {
                warn!(relay = %candidate.peer, "reservation timed out");
                self.registration_failed(candidate, "timeout".to_string());
                return false;
            }
        };

        let circuit_addrs: Vec<Multiaddr> = reservation
            .addrs()
            .iter()
            .map(|addr| circuit_addr(addr, candidate.peer, self.host.local_peer()))
            .collect();

        self.active.lock().insert(
            candidate.peer,
            ActiveRelay {
                reservation,
                addrs: circuit_addrs.clone(),
                last_refresh: unix_secs(),
                fail_count: 0,
                priority: candidate.priority,
            },
        );

        for addr in &circuit_addrs {
            self.endpoint.add_advertised_addr(addr.clone());
        }
        debug!(relay = %candidate.peer, addrs = circuit_addrs.len(), "relay reserved");
        self.events.emit(RelayEvent::Reserved {
            relay: candidate.peer,
        });
        self.notify_addrs_changed();
        true
    }

    fn registration_failed(self: &Arc<Self>, candidate: &Candidate, error: String) {
        self.blacklist_relay(candidate.peer, candidate.priority);
        if let Some(bus) = &self.bus {
            bus.emit(CoreEvent::RelayRegistrationFailed {
                relay: candidate.peer,
                error: error.clone(),
            });
        }
        self.events.emit(RelayEvent::RegistrationFailed {
            relay: candidate.peer,
            error,
        });
    }

    /// Refresh reservations nearing expiry; drop relays after three
    /// consecutive failures (blacklist first, then remove, so the next
    /// selection pass cannot race the removal).
    async fn refresh_all(self: &Arc<Self>) {
        if !self.enabled.load(Ordering::SeqCst) {
            return;
        }

        let snapshot: Vec<(PeerId, Arc<dyn Reservation>, i32)> = self
            .active
            .lock()
            .iter()
            .map(|(peer, relay)| (*peer, Arc::clone(&relay.reservation), relay.priority))
            .collect();

        let now = unix_secs();
        for (peer, reservation, priority) in snapshot {
            let remaining = reservation.expiry().saturating_sub(now);
            if remaining > self.config.reservation_refresh_before.as_secs() {
                continue;
            }

            let refreshed =
                tokio::time::timeout(self.config.request_timeout, reservation.refresh()).await;
            match refreshed {
                Ok(Ok(())) => {
                    if let Some(relay) = self.active.lock().get_mut(&peer) {
                        relay.fail_count = 0;
                        relay.last_refresh = unix_secs();
                    }
                    trace!(relay = %peer, "reservation refreshed");
                }
                _ => {
                    let failures = {
                        let mut active = self.active.lock();
                        match active.get_mut(&peer) {
                            Some(relay) => {
                                relay.fail_count += 1;
                                relay.fail_count
                            }
                            None => continue,
                        }
                    };
                    warn!(relay = %peer, failures, "reservation refresh failed");
                    if failures >= MAX_REFRESH_FAILURES {
                        self.blacklist_relay(peer, priority);
                        self.remove_active(&peer);
                    }
                }
            }
        }
    }

    /// Pull candidates from the relay client and infer more from live
    /// connections.
    async fn discover(self: &Arc<Self>) {
        if !self.enabled.load(Ordering::SeqCst) {
            return;
        }

        let found = tokio::time::timeout(self.config.request_timeout, self.client.find_relays())
            .await
            .unwrap_or_else(|_| Err(strand_api::ReserveError::Timeout));
        match found {
            Ok(relays) => {
                let store = self.host.peerstore();
                let mut candidates = self.candidates.lock();
                for peer in relays {
                    let addrs = store.addrs(&peer);
                    candidates
                        .entry(peer)
                        .and_modify(|c| {
                            c.last_seen = unix_secs();
                            if !addrs.is_empty() {
                                c.addrs = addrs.clone();
                            }
                        })
                        .or_insert_with(|| Candidate::new(peer, addrs, 0));
                }
            }
            Err(error) => debug!(%error, "relay discovery failed"),
        }

        // Connected peers become candidates of last resort. Never replace
        // an existing candidate: a real discovery result outranks inference.
        let local = self.host.local_peer();
        let connected = self.endpoint.connections();
        let mut candidates = self.candidates.lock();
        for peer in connected {
            if peer == local {
                continue;
            }
            candidates.entry(peer).or_insert_with(|| {
                Candidate::new(peer, Vec::new(), crate::candidates::INFERRED_PRIORITY)
            });
        }
    }

    fn blacklist_relay(&self, peer: PeerId, priority: i32) {
        if !self.config.enable_backoff {
            return;
        }
        let ttl = if priority <= crate::candidates::INFERRED_PRIORITY {
            self.config.inferred_backoff
        } else {
            self.config.max_backoff
        };
        self.blacklist
            .lock()
            .insert(peer, unix_millis() + ttl.as_millis() as u64);
        trace!(relay = %peer, ttl_secs = ttl.as_secs(), "relay blacklisted");
    }

    /// Drop an active relay and unpublish its addresses.
    fn remove_active(&self, peer: &PeerId) -> bool {
        let removed = self.active.lock().remove(peer);
        let Some(relay) = removed else {
            return false;
        };
        for addr in &relay.addrs {
            self.endpoint.remove_advertised_addr(addr);
        }
        self.events.emit(RelayEvent::Removed { relay: *peer });
        self.notify_addrs_changed();
        true
    }

    fn sweep_blacklist(&self) {
        let now = unix_millis();
        self.blacklist.lock().retain(|_, expiry| *expiry > now);
    }

    /// Copy the address set under the lock, then deliver it from a fresh
    /// task so subscribers cannot re-enter the manager's locks.
    fn notify_addrs_changed(&self) {
        let addrs = self.relay_addrs();
        self.events.emit(RelayEvent::AddrsChanged {
            addrs: addrs.clone(),
        });
        let cb = self.on_addrs_changed.read().clone();
        if let Some(cb) = cb {
            tokio::spawn(async move {
                cb(addrs);
            });
        }
    }
}

/// `<relay-transport-addr>/p2p/<relay>/p2p-circuit/p2p/<local>`: the form
/// other nodes dial to reach us through the relay.
fn circuit_addr(relay_addr: &Multiaddr, relay: PeerId, local: PeerId) -> Multiaddr {
    let mut addr = relay_addr.clone();
    let ends_with_relay = matches!(addr.iter().last(), Some(Protocol::P2p(p)) if p == relay);
    if !ends_with_relay {
        addr.push(Protocol::P2p(relay));
    }
    addr.push(Protocol::P2pCircuit);
    addr.push(Protocol::P2p(local));
    addr
}
