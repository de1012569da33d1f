//! Host and peerstore interfaces.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use libp2p::{Multiaddr, PeerId};

use crate::stream::DynStream;

/// Application-level label attached to a logical stream.
pub type ProtocolId = String;

/// Handler invoked for every inbound stream negotiated for a protocol.
pub type StreamHandler = Arc<dyn Fn(PeerId, DynStream) + Send + Sync>;

/// Errors surfaced by the host.
#[derive(Debug, Clone, thiserror::Error)]
pub enum HostError {
    #[error("dial to {peer} failed: {reason}")]
    DialFailed { peer: PeerId, reason: String },

    #[error("no known addresses for {0}")]
    NoAddresses(PeerId),

    #[error("stream to {peer} failed: {reason}")]
    StreamFailed { peer: PeerId, reason: String },

    #[error("operation timed out")]
    Timeout,
}

/// The local node as seen by the core subsystems.
#[async_trait]
pub trait Host: Send + Sync {
    fn local_peer(&self) -> PeerId;

    /// Addresses the transport layer is listening on.
    fn listen_addrs(&self) -> Vec<Multiaddr>;

    /// Addresses advertised to other peers (may include relayed forms).
    fn advertised_addrs(&self) -> Vec<Multiaddr>;

    /// Establish a connection to `peer` via any of `addrs`.
    async fn connect(&self, peer: PeerId, addrs: Vec<Multiaddr>) -> Result<(), HostError>;

    /// Open a logical stream to a connected peer for `protocol`.
    async fn open_stream(&self, peer: PeerId, protocol: &str) -> Result<DynStream, HostError>;

    /// Register a handler for inbound streams negotiated for `protocol`.
    fn set_stream_handler(&self, protocol: &str, handler: StreamHandler);

    fn peerstore(&self) -> Arc<dyn Peerstore>;
}

/// Address and protocol book for known peers.
pub trait Peerstore: Send + Sync {
    /// Record addresses for a peer with a bounded lifetime.
    fn add_addrs(&self, peer: &PeerId, addrs: &[Multiaddr], ttl: Duration);

    fn addrs(&self, peer: &PeerId) -> Vec<Multiaddr>;

    /// Subset of `protocols` the peer is known to speak. An empty result for
    /// a peer with a known protocol list means "does not support any".
    fn supports_protocols(&self, peer: &PeerId, protocols: &[ProtocolId]) -> Vec<ProtocolId>;

    /// All protocols the peer is known to speak; empty when unknown.
    fn protocols(&self, peer: &PeerId) -> Vec<ProtocolId>;
}
