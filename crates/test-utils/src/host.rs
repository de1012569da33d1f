//! Scripted host and peerstore.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use libp2p::{Multiaddr, PeerId};
use parking_lot::{Mutex, RwLock};
use strand_api::{DynStream, Host, HostError, Peerstore, ProtocolId, StreamHandler};

/// In-memory peerstore with scripted protocol support.
#[derive(Default)]
pub struct MemoryPeerstore {
    addrs: RwLock<HashMap<PeerId, Vec<Multiaddr>>>,
    protocols: RwLock<HashMap<PeerId, Vec<ProtocolId>>>,
}

impl MemoryPeerstore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Script the protocol list a peer is known to speak.
    pub fn set_protocols(&self, peer: &PeerId, protocols: Vec<ProtocolId>) {
        self.protocols.write().insert(*peer, protocols);
    }
}

impl Peerstore for MemoryPeerstore {
    fn add_addrs(&self, peer: &PeerId, addrs: &[Multiaddr], _ttl: Duration) {
        let mut book = self.addrs.write();
        let entry = book.entry(*peer).or_default();
        for addr in addrs {
            if !entry.contains(addr) {
                entry.push(addr.clone());
            }
        }
    }

    fn addrs(&self, peer: &PeerId) -> Vec<Multiaddr> {
        self.addrs.read().get(peer).cloned().unwrap_or_default()
    }

    fn supports_protocols(&self, peer: &PeerId, protocols: &[ProtocolId]) -> Vec<ProtocolId> {
        let known = self.protocols.read();
        let Some(spoken) = known.get(peer) else {
            return Vec::new();
        };
        protocols
            .iter()
            .filter(|p| spoken.contains(p))
            .cloned()
            .collect()
    }

    fn protocols(&self, peer: &PeerId) -> Vec<ProtocolId> {
        self.protocols.read().get(peer).cloned().unwrap_or_default()
    }
}

/// Scripted host: dial outcomes are configured per peer, streams are
/// in-memory pipes dispatched to registered handlers.
pub struct MemoryHost {
    local: PeerId,
    listen: Vec<Multiaddr>,
    advertised: RwLock<Vec<Multiaddr>>,
    peerstore: Arc<MemoryPeerstore>,
    fail_dials: RwLock<HashSet<PeerId>>,
    dial_delay: RwLock<Option<Duration>>,
    dialed: Mutex<Vec<PeerId>>,
    connected: RwLock<HashSet<PeerId>>,
    handlers: RwLock<HashMap<ProtocolId, StreamHandler>>,
}

impl MemoryHost {
    pub fn new(local: PeerId) -> Self {
        Self {
            local,
            listen: Vec::new(),
            advertised: RwLock::new(Vec::new()),
            peerstore: Arc::new(MemoryPeerstore::new()),
            fail_dials: RwLock::new(HashSet::new()),
            dial_delay: RwLock::new(None),
            dialed: Mutex::new(Vec::new()),
            connected: RwLock::new(HashSet::new()),
            handlers: RwLock::new(HashMap::new()),
        }
    }

    pub fn with_listen_addrs(local: PeerId, listen: Vec<Multiaddr>) -> Self {
        Self {
            listen,
            ..Self::new(local)
        }
    }

    /// Make every future dial of `peer` fail.
    pub fn fail_dials_to(&self, peer: PeerId) {
        self.fail_dials.write().insert(peer);
    }

    /// Delay every dial by `delay` before resolving.
    pub fn set_dial_delay(&self, delay: Duration) {
        *self.dial_delay.write() = Some(delay);
    }

    pub fn set_advertised_addrs(&self, addrs: Vec<Multiaddr>) {
        *self.advertised.write() = addrs;
    }

    /// Every dial attempted so far, in order.
    pub fn dialed(&self) -> Vec<PeerId> {
        self.dialed.lock().clone()
    }

    pub fn is_connected(&self, peer: &PeerId) -> bool {
        self.connected.read().contains(peer)
    }

    pub fn memory_peerstore(&self) -> Arc<MemoryPeerstore> {
        Arc::clone(&self.peerstore)
    }
}

#[async_trait]
impl Host for MemoryHost {
    fn local_peer(&self) -> PeerId {
        self.local
    }

    fn listen_addrs(&self) -> Vec<Multiaddr> {
        self.listen.clone()
    }

    fn advertised_addrs(&self) -> Vec<Multiaddr> {
        self.advertised.read().clone()
    }

    async fn connect(&self, peer: PeerId, _addrs: Vec<Multiaddr>) -> Result<(), HostError> {
        self.dialed.lock().push(peer);

        let delay = *self.dial_delay.read();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if self.fail_dials.read().contains(&peer) {
            return Err(HostError::DialFailed {
                peer,
                reason: "scripted failure".to_string(),
            });
        }

        self.connected.write().insert(peer);
        Ok(())
    }

    async fn open_stream(&self, peer: PeerId, protocol: &str) -> Result<DynStream, HostError> {
        let handler = self.handlers.read().get(protocol).cloned();
        let Some(handler) = handler else {
            return Err(HostError::StreamFailed {
                peer,
                reason: format!("no handler for {protocol}"),
            });
        };

        let (local, remote) = tokio::io::duplex(64 * 1024);
        handler(self.local, Box::new(remote));
        Ok(Box::new(local))
    }

    fn set_stream_handler(&self, protocol: &str, handler: StreamHandler) {
        self.handlers.write().insert(protocol.to_string(), handler);
    }

    fn peerstore(&self) -> Arc<dyn Peerstore> {
        Arc::clone(&self.peerstore) as Arc<dyn Peerstore>
    }
}
