//! AutoRelay events and non-blocking broadcast emitter.

use libp2p::{Multiaddr, PeerId};
use tokio::sync::broadcast;

/// Lifecycle events of the managed relay set.
#[derive(Debug, Clone)]
pub enum RelayEvent {
    /// A reservation was obtained and its addresses published.
    Reserved { relay: PeerId },
    /// An active relay was dropped (refresh failures or connection loss).
    Removed { relay: PeerId },
    /// A reservation attempt failed; the relay was blacklisted.
    RegistrationFailed { relay: PeerId, error: String },
    /// The published relay-address set changed.
    AddrsChanged { addrs: Vec<Multiaddr> },
}

const DEFAULT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
pub(crate) struct RelayEventEmitter {
    tx: broadcast::Sender<RelayEvent>,
}

impl Default for RelayEventEmitter {
    fn default() -> Self {
        let (tx, _) = broadcast::channel(DEFAULT_CHANNEL_CAPACITY);
        Self { tx }
    }
}

impl RelayEventEmitter {
    pub(crate) fn emit(&self, event: RelayEvent) {
        let _ = self.tx.send(event);
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<RelayEvent> {
        self.tx.subscribe()
    }
}
