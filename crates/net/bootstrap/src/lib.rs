//! Network entry via configured seed peers.
//!
//! Every seed is dialed concurrently with an independent deadline; the run
//! as a whole succeeds once a minimum number of dials land. The threshold
//! is clamped to the seed count so misconfiguration cannot wedge startup.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use strand_api::{Host, PeerInfo};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tracing::{debug, warn};

/// Bootstrap configuration.
#[derive(Debug, Clone)]
pub struct BootstrapConfig {
    /// Seed peers dialed on every bootstrap pass.
    pub peers: Vec<PeerInfo>,
    /// Deadline for each individual dial.
    pub timeout: Duration,
    /// Successful dials required for the pass to count as a success.
    /// Clamped to the seed count.
    pub min_peers: usize,
    /// Spacing of periodic re-bootstrap passes.
    pub interval: Duration,
    pub enabled: bool,
    /// Lifetime of seed addresses installed into the peerstore.
    pub peerstore_ttl: Duration,
}

impl Default for BootstrapConfig {
    fn default() -> Self {
        Self {
            peers: Vec::new(),
            timeout: Duration::from_secs(30),
            min_peers: 4,
            interval: Duration::from_secs(300),
            enabled: true,
            peerstore_ttl: Duration::from_secs(1800),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BootstrapError {
    #[error("no bootstrap peers configured")]
    NoBootstrapPeers,

    #[error("all bootstrap connections failed")]
    AllConnectionsFailed,

    #[error("connected to {connected} of {required} required bootstrap peers")]
    MinPeersNotMet { connected: usize, required: usize },

    #[error("bootstrap does not support advertising")]
    AdvertiseUnsupported,

    #[error("invalid bootstrap peer {0}: empty address list")]
    InvalidPeer(String),
}

struct BootstrapInner {
    host: Arc<dyn Host>,
    config: BootstrapConfig,
    running: AtomicBool,
    shutdown: Mutex<Option<watch::Sender<bool>>>,
}

/// Dials the configured seeds and reports how well network entry went.
#[derive(Clone)]
pub struct Bootstrap {
    inner: Arc<BootstrapInner>,
}

impl Bootstrap {
    /// Validate and install the configuration. A non-empty seed list with
    /// an oversized `min_peers` is clamped; an empty list silently turns
    /// the periodic bootstrap off.
    pub fn new(host: Arc<dyn Host>, mut config: BootstrapConfig) -> Result<Self, BootstrapError> {
        for peer in &config.peers {
            if !peer.is_dialable() {
                return Err(BootstrapError::InvalidPeer(peer.peer_id.to_string()));
            }
        }
        if config.peers.is_empty() {
            config.enabled = false;
        }
        if config.min_peers > config.peers.len() {
            config.min_peers = config.peers.len();
        }

        Ok(Self {
            inner: Arc::new(BootstrapInner {
                host,
                config,
                running: AtomicBool::new(false),
                shutdown: Mutex::new(None),
            }),
        })
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.config.enabled
    }

    /// Dial every seed concurrently. Returns the number of successful
    /// connections, or the most specific failure.
    pub async fn bootstrap(&self) -> Result<usize, BootstrapError> {
        let seeds = &self.inner.config.peers;
        if seeds.is_empty() {
            return Err(BootstrapError::NoBootstrapPeers);
        }
        let required = self.inner.config.min_peers.clamp(1, seeds.len());

        let mut attempts = JoinSet::new();
        for seed in seeds.clone() {
            let host = Arc::clone(&self.inner.host);
            let ttl = self.inner.config.peerstore_ttl;
            let timeout = self.inner.config.timeout;
            attempts.spawn(async move {
                let dial = async {
                    host.peerstore().add_addrs(&seed.peer_id, &seed.addrs, ttl);
                    host.connect(seed.peer_id, seed.addrs.clone()).await
                };
                match tokio::time::timeout(timeout, dial).await {
                    Ok(Ok(())) => {
                        debug!(peer = %seed.peer_id, "bootstrap dial succeeded");
                        true
                    }
                    Ok(Err(error)) => {
                        warn!(peer = %seed.peer_id, %error, "bootstrap dial failed");
                        false
                    }
                    Err(_) => {
                        warn!(peer = %seed.peer_id, "bootstrap dial timed out");
                        false
                    }
                }
            });
        }

        let mut connected = 0usize;
        while let Some(outcome) = attempts.join_next().await {
            if outcome.unwrap_or(false) {
                connected += 1;
            }
        }

        if connected == 0 {
            return Err(BootstrapError::AllConnectionsFailed);
        }
        if connected < required {
            return Err(BootstrapError::MinPeersNotMet {
                connected,
                required,
            });
        }
        debug!(connected, required, "bootstrap complete");
        Ok(connected)
    }

    /// Start periodic re-bootstrap passes. Does nothing while disabled.
    pub fn start(&self) {
        if !self.inner.config.enabled {
            return;
        }
        if self.inner.running.swap(true, Ordering::SeqCst) {
            return;
        }

        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        *self.inner.shutdown.lock() = Some(shutdown_tx);

        let bootstrap = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(bootstrap.inner.config.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    _ = ticker.tick() => {
                        if let Err(error) = bootstrap.bootstrap().await {
                            warn!(%error, "periodic bootstrap pass failed");
                        }
                    }
                }
            }
        });
    }

    pub fn stop(&self) {
        if !self.inner.running.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(tx) = self.inner.shutdown.lock().take() {
            let _ = tx.send(true);
        }
    }

    /// Emit every configured seed on a channel, then close it. Dropping
    /// the receiver cancels the emission.
    pub fn find_peers(&self, _namespace: &str) -> mpsc::Receiver<PeerInfo> {
        let (tx, rx) = mpsc::channel(self.inner.config.peers.len().max(1));
        let seeds = self.inner.config.peers.clone();
        tokio::spawn(async move {
            for seed in seeds {
                if tx.send(seed).await.is_err() {
                    break;
                }
            }
        });
        rx
    }

    /// Bootstrap is a discovery source, not a rendezvous point.
    pub fn advertise(&self, _namespace: &str) -> Result<(), BootstrapError> {
        Err(BootstrapError::AdvertiseUnsupported)
    }
}
