//! Hole-punch collaborator interface.

use async_trait::async_trait;
use libp2p::{Multiaddr, PeerId};

/// Errors from a hole-punch attempt.
#[derive(Debug, Clone, thiserror::Error)]
pub enum PunchError {
    #[error("no reachable address for {0}")]
    Unreachable(PeerId),

    #[error("hole punch timed out")]
    Timeout,

    #[error("transport: {0}")]
    Transport(String),
}

/// Coordinated simultaneous-connect across NATs.
#[async_trait]
pub trait HolePuncher: Send + Sync {
    /// Attempt to establish a direct connection to `remote` using the
    /// candidate addresses it advertised. Returns the address that worked.
    async fn punch(
        &self,
        remote: PeerId,
        remote_addrs: Vec<Multiaddr>,
    ) -> Result<Multiaddr, PunchError>;
}
