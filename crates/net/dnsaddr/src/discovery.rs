//! The discovery service: cached, recursive dnsaddr resolution plus a
//! periodic refresh loop.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use libp2p::PeerId;
use parking_lot::{Mutex, RwLock};
use strand_api::{PeerInfo, unix_secs};
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

use crate::error::DnsDiscoveryError;
use crate::parse::{DnsAddrEntry, RECORD_PREFIX, normalize_domain, parse_dnsaddr, validate_domain};
use crate::resolver::{HickoryTxtResolver, TxtResolver};

/// Hard ceiling on the configurable recursion depth.
pub const MAX_DEPTH_HARD_CAP: usize = 10;

/// Namespace strings that select "all configured domains".
const NAMESPACE_ALL: &str = "dns";

#[derive(Debug, Clone)]
pub struct DnsDiscoveryConfig {
    /// Domains re-resolved by the refresh loop and served by `find_peers`.
    pub domains: Vec<String>,
    /// Budget for one TXT lookup.
    pub timeout: Duration,
    /// Nested `/dnsaddr/` references followed before giving up.
    pub max_depth: usize,
    pub cache_ttl: Duration,
    pub refresh_interval: Duration,
    /// Optional `host:port` of a custom name server.
    pub custom_resolver: Option<String>,
}

impl Default for DnsDiscoveryConfig {
    fn default() -> Self {
        Self {
            domains: Vec::new(),
            timeout: Duration::from_secs(10),
            max_depth: 3,
            cache_ttl: Duration::from_secs(300),
            refresh_interval: Duration::from_secs(300),
            custom_resolver: None,
        }
    }
}

struct CacheEntry {
    peers: Vec<PeerInfo>,
    expires_at: u64,
}

struct DiscoveryInner {
    config: DnsDiscoveryConfig,
    resolver: Arc<dyn TxtResolver>,
    /// Keyed by normalized domain. Peer lists are copied in and out so
    /// callers can never mutate a cached list.
    cache: RwLock<HashMap<String, CacheEntry>>,
    running: AtomicBool,
    shutdown: Mutex<Option<watch::Sender<bool>>>,
}

/// Resolves peers from dnsaddr TXT records.
#[derive(Clone)]
pub struct DnsDiscovery {
    inner: Arc<DiscoveryInner>,
}

impl DnsDiscovery {
    /// Build the service with the production resolver.
    pub fn new(config: DnsDiscoveryConfig) -> Result<Self, DnsDiscoveryError> {
        let resolver: Arc<dyn TxtResolver> = match &config.custom_resolver {
            Some(addr) => {
                let addr = addr
                    .parse()
                    .map_err(|_| DnsDiscoveryError::InvalidResolver(addr.clone()))?;
                Arc::new(HickoryTxtResolver::custom(addr))
            }
            None => Arc::new(HickoryTxtResolver::system()),
        };
        Self::with_resolver(config, resolver)
    }

    /// Build the service with an injected resolver.
    pub fn with_resolver(
        config: DnsDiscoveryConfig,
        resolver: Arc<dyn TxtResolver>,
    ) -> Result<Self, DnsDiscoveryError> {
        if config.max_depth > MAX_DEPTH_HARD_CAP {
            return Err(DnsDiscoveryError::MaxDepthOutOfRange(MAX_DEPTH_HARD_CAP));
        }
        for domain in &config.domains {
            if !validate_domain(domain) {
                return Err(DnsDiscoveryError::InvalidDomain(domain.clone()));
            }
        }

        Ok(Self {
            inner: Arc::new(DiscoveryInner {
                config,
                resolver,
                cache: RwLock::new(HashMap::new()),
                running: AtomicBool::new(false),
                shutdown: Mutex::new(None),
            }),
        })
    }

    /// Resolve one domain, serving unexpired cache entries without a
    /// lookup.
    pub async fn resolve(&self, domain: &str) -> Result<Vec<PeerInfo>, DnsDiscoveryError> {
        let name = normalize_domain(domain);
        if let Some(peers) = self.inner.cached(&name) {
            return Ok(peers);
        }
        self.inner.resolve_and_cache(&name).await
    }

    /// Drop every cached result, ours and the resolver's.
    pub fn reset(&self) {
        self.inner.cache.write().clear();
        self.inner.resolver.clear_cache();
        debug!("dnsaddr caches purged");
    }

    /// Start the periodic refresh of every configured domain.
    pub fn start(&self) {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        *self.inner.shutdown.lock() = Some(shutdown_tx);

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(inner.config.refresh_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    _ = ticker.tick() => {
                        for domain in inner.config.domains.clone() {
                            let name = normalize_domain(&domain);
                            if let Err(error) = inner.resolve_and_cache(&name).await {
                                warn!(%domain, %error, "dnsaddr refresh failed");
                            }
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

    /// Emit discovered peers on a channel. An empty namespace, the literal
    /// `dns`, or anything that is not a domain selects every configured
    /// domain; otherwise the namespace itself is resolved as a domain.
    pub fn find_peers(&self, namespace: &str) -> mpsc::Receiver<PeerInfo> {
        let domains = if namespace.is_empty()
            || namespace == NAMESPACE_ALL
            || !validate_domain(namespace)
        {
            self.inner.config.domains.clone()
        } else {
            vec![namespace.to_string()]
        };

        let (tx, rx) = mpsc::channel(16);
        let discovery = self.clone();
        tokio::spawn(async move {
            let mut seen: HashSet<PeerId> = HashSet::new();
            for domain in domains {
                match discovery.resolve(&domain).await {
                    Ok(peers) => {
                        for peer in peers {
                            if !seen.insert(peer.peer_id) {
                                continue;
                            }
                            if tx.send(peer).await.is_err() {
                                return;
                            }
                        }
                    }
                    Err(error) => warn!(%domain, %error, "dnsaddr discovery failed"),
                }
            }
        });
        rx
    }
}

impl DiscoveryInner {
    fn cached(&self, name: &str) -> Option<Vec<PeerInfo>> {
        let cache = self.cache.read();
        let entry = cache.get(name)?;
        if unix_secs() >= entry.expires_at {
            return None;
        }
        Some(entry.peers.clone())
    }

    async fn resolve_and_cache(
        self: &Arc<Self>,
        name: &str,
    ) -> Result<Vec<PeerInfo>, DnsDiscoveryError> {
        let peers = self.resolve_recursive(name.to_string(), 0).await?;
        self.cache.write().insert(
            name.to_string(),
            CacheEntry {
                peers: peers.clone(),
                expires_at: unix_secs() + self.config.cache_ttl.as_secs(),
            },
        );
        Ok(peers)
    }

    /// Recursive resolution with a depth cap. Boxed because async fns
    /// cannot recurse directly.
    fn resolve_recursive(
        self: &Arc<Self>,
        name: String,
        depth: usize,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<PeerInfo>, DnsDiscoveryError>> + Send + '_>> {
        Box::pin(async move {
            if depth > self.config.max_depth {
                return Err(DnsDiscoveryError::MaxDepthExceeded);
            }

            let lookup = self.resolver.lookup_txt(&name);
            let records = tokio::time::timeout(self.config.timeout, lookup)
                .await
                .map_err(|_| DnsDiscoveryError::Timeout)??;

            let dnsaddr_records: Vec<&String> = records
                .iter()
                .filter(|r| r.starts_with(RECORD_PREFIX))
                .collect();
            if dnsaddr_records.is_empty() {
                return Err(DnsDiscoveryError::NoRecordsFound(name));
            }

            let mut peers: Vec<PeerInfo> = Vec::new();
            for record in dnsaddr_records {
                match parse_dnsaddr(record) {
                    Ok(DnsAddrEntry::Peer(info)) => merge_peer(&mut peers, info),
                    Ok(DnsAddrEntry::Nested(domain)) => {
                        let nested = normalize_domain(&domain);
                        let found = self.resolve_recursive(nested, depth + 1).await?;
                        for info in found {
                            merge_peer(&mut peers, info);
                        }
                    }
                    Err(error) => {
                        warn!(%record, %error, "skipping malformed dnsaddr record");
                    }
                }
            }
            Ok(peers)
        })
    }
}

/// Merge a peer into the result set, deduplicating by id and unioning
/// addresses.
fn merge_peer(peers: &mut Vec<PeerInfo>, info: PeerInfo) {
    if let Some(existing) = peers.iter_mut().find(|p| p.peer_id == info.peer_id) {
        for addr in info.addrs {
            if !existing.addrs.contains(&addr) {
                existing.addrs.push(addr);
            }
        }
    } else {
        peers.push(info);
    }
}
