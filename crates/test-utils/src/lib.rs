//! Test doubles for the strand core: an in-memory stream multiplexer and
//! scripted implementations of every collaborator interface.

mod endpoint;
mod host;
mod muxer;
mod punch;
mod relay;

pub use endpoint::MemoryEndpoint;
pub use host::{MemoryHost, MemoryPeerstore};
pub use muxer::MemoryMuxer;
pub use punch::MockHolePuncher;
pub use relay::{MockRelayClient, MockReservation};

use libp2p::PeerId;

/// Deterministic peer id derived from a single seed byte.
pub fn test_peer_id(n: u8) -> PeerId {
    let bytes = [n; 32];
    let key = libp2p::identity::ed25519::SecretKey::try_from_bytes(bytes)
        .unwrap_or_else(|_| unreachable!("32 bytes is a valid ed25519 secret key"));
    let keypair = libp2p::identity::Keypair::from(libp2p::identity::ed25519::Keypair::from(key));
    keypair.public().to_peer_id()
}
