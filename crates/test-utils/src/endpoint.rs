//! Scripted endpoint with manually driven connection events.

use std::collections::HashSet;

use libp2p::{Multiaddr, PeerId};
use parking_lot::RwLock;
use strand_api::{ConnectionEvent, ConnectionEventKind, Endpoint};
use tokio::sync::broadcast;

/// Endpoint double: tests drive the connection set and the event stream.
pub struct MemoryEndpoint {
    connections: RwLock<HashSet<PeerId>>,
    advertised: RwLock<Vec<Multiaddr>>,
    tx: broadcast::Sender<ConnectionEvent>,
}

impl Default for MemoryEndpoint {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryEndpoint {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(64);
        Self {
            connections: RwLock::new(HashSet::new()),
            advertised: RwLock::new(Vec::new()),
            tx,
        }
    }

    /// Mark `peer` as connected.
    pub fn add_connection(&self, peer: PeerId) {
        self.connections.write().insert(peer);
    }

    pub fn remove_connection(&self, peer: &PeerId) {
        self.connections.write().remove(peer);
    }

    /// Current advertised-address set, as mutated by the code under test.
    pub fn advertised(&self) -> Vec<Multiaddr> {
        self.advertised.read().clone()
    }

    /// Emit a closed event for a relayed connection through `relay`.
    pub fn emit_relay_closed(&self, peer: PeerId, relay: PeerId, reason: &str) {
        self.connections.write().remove(&peer);
        let _ = self.tx.send(ConnectionEvent {
            peer,
            kind: ConnectionEventKind::Closed,
            is_relay_conn: true,
            relay_id: Some(relay),
            reason: Some(reason.to_string()),
        });
    }

    pub fn emit(&self, event: ConnectionEvent) {
        let _ = self.tx.send(event);
    }
}

impl Endpoint for MemoryEndpoint {
    fn connections(&self) -> Vec<PeerId> {
        self.connections.read().iter().copied().collect()
    }

    fn add_advertised_addr(&self, addr: Multiaddr) {
        let mut advertised = self.advertised.write();
        if !advertised.contains(&addr) {
            advertised.push(addr);
        }
    }

    fn remove_advertised_addr(&self, addr: &Multiaddr) {
        self.advertised.write().retain(|a| a != addr);
    }

    fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.tx.subscribe()
    }
}
