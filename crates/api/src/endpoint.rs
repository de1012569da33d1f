//! Endpoint interface: connection tracking and advertised addresses.

use libp2p::{Multiaddr, PeerId};
use tokio::sync::broadcast;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEventKind {
    Established,
    Closed,
}

/// Connection lifecycle notification delivered to subscribers.
#[derive(Debug, Clone)]
pub struct ConnectionEvent {
    pub peer: PeerId,
    pub kind: ConnectionEventKind,
    /// True when the connection runs through a relay circuit.
    pub is_relay_conn: bool,
    /// The relay carrying the connection, when `is_relay_conn`.
    pub relay_id: Option<PeerId>,
    pub reason: Option<String>,
}

/// Connection set and advertised-address set of the local node.
pub trait Endpoint: Send + Sync {
    /// Peers with at least one live connection.
    fn connections(&self) -> Vec<PeerId>;

    fn add_advertised_addr(&self, addr: Multiaddr);

    fn remove_advertised_addr(&self, addr: &Multiaddr);

    /// Subscribe to connection lifecycle events. Slow subscribers drop
    /// events independently.
    fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent>;
}
