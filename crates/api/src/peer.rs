//! Peer identity plus dialable addresses.

use libp2p::{Multiaddr, PeerId};

/// A peer together with the addresses it can be reached at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerInfo {
    pub peer_id: PeerId,
    pub addrs: Vec<Multiaddr>,
}

impl PeerInfo {
    pub fn new(peer_id: PeerId, addrs: Vec<Multiaddr>) -> Self {
        Self { peer_id, addrs }
    }

    /// A peer without any address cannot be dialed and is rejected by the
    /// discovery services.
    pub fn is_dialable(&self) -> bool {
        !self.addrs.is_empty()
    }
}

impl std::fmt::Display for PeerInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({} addrs)", self.peer_id, self.addrs.len())
    }
}
