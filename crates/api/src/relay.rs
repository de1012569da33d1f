//! Relay reservation client interface.

use std::sync::Arc;

use async_trait::async_trait;
use libp2p::{Multiaddr, PeerId};

/// Errors from reservation and relay discovery calls.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ReserveError {
    #[error("reservation refused by {0}")]
    Refused(PeerId),

    #[error("reservation was cancelled")]
    Cancelled,

    #[error("relay lookup failed: {0}")]
    Lookup(String),

    #[error("transport: {0}")]
    Transport(String),

    #[error("operation timed out")]
    Timeout,
}

/// A live reservation on a remote relay.
///
/// After [`Reservation::cancel`] completes, [`Reservation::refresh`] must
/// fail with [`ReserveError::Cancelled`].
#[async_trait]
pub trait Reservation: Send + Sync {
    /// Expiry as Unix seconds.
    fn expiry(&self) -> u64;

    /// Relay transport addresses traffic will be forwarded through.
    fn addrs(&self) -> Vec<Multiaddr>;

    /// Extend the reservation lifetime.
    async fn refresh(&self) -> Result<(), ReserveError>;

    /// Give the slot back to the relay.
    async fn cancel(&self) -> Result<(), ReserveError>;
}

/// Issues reservations and discovers relay-capable peers.
#[async_trait]
pub trait RelayClient: Send + Sync {
    async fn reserve(&self, relay: PeerId) -> Result<Arc<dyn Reservation>, ReserveError>;

    async fn find_relays(&self) -> Result<Vec<PeerId>, ReserveError>;
}
