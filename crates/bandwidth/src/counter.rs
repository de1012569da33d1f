//! Lock-free byte counters attributed globally, per protocol and per peer.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use libp2p::PeerId;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use strand_api::ProtocolId;
use tracing::debug;

use crate::meter::RateMeter;

/// Point-in-time traffic snapshot.
///
/// Totals are monotonically non-decreasing over the life of a counter
/// (until [`BandwidthCounter::reset`]); rates cover the last sixty seconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Stats {
    pub total_in: u64,
    pub total_out: u64,
    pub rate_in: f64,
    pub rate_out: f64,
}

/// One accounted entity: cumulative totals plus one rate meter per direction.
#[derive(Debug, Default)]
struct Entry {
    total_in: AtomicU64,
    total_out: AtomicU64,
    rate_in: RateMeter,
    rate_out: RateMeter,
}

impl Entry {
    fn log_sent(&self, size: u64) {
        self.total_out.fetch_add(size, Ordering::Relaxed);
        self.rate_out.add(size);
    }

    fn log_recv(&self, size: u64) {
        self.total_in.fetch_add(size, Ordering::Relaxed);
        self.rate_in.add(size);
    }

    fn stats(&self) -> Stats {
        Stats {
            total_in: self.total_in.load(Ordering::Relaxed),
            total_out: self.total_out.load(Ordering::Relaxed),
            rate_in: self.rate_in.rate(),
            rate_out: self.rate_out.rate(),
        }
    }

    fn reset(&self) {
        self.total_in.store(0, Ordering::Relaxed);
        self.total_out.store(0, Ordering::Relaxed);
        self.rate_in.reset();
        self.rate_out.reset();
    }

    /// Second of the most recent traffic in either direction.
    fn last_update(&self) -> u64 {
        self.rate_in.last_update().max(self.rate_out.last_update())
    }
}

/// Records every byte entering or leaving the node.
///
/// Totals are plain atomic adds; the per-key maps take their write lock only
/// when a key is first seen, and the atomic add never happens under the map
/// lock. Sizes are `u64`, so negative adjustments are unrepresentable.
#[derive(Debug, Default)]
pub struct BandwidthCounter {
    global: Entry,
    by_protocol: RwLock<HashMap<ProtocolId, Arc<Entry>>>,
    by_peer: RwLock<HashMap<PeerId, Arc<Entry>>>,
}

impl BandwidthCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Account `size` sent bytes against the global totals.
    pub fn log_sent(&self, size: u64) {
        self.global.log_sent(size);
    }

    /// Account `size` received bytes against the global totals.
    pub fn log_recv(&self, size: u64) {
        self.global.log_recv(size);
    }

    /// Account sent bytes against the protocol and peer that carried them,
    /// creating entries on first use.
    pub fn log_sent_stream(&self, size: u64, protocol: &str, peer: &PeerId) {
        self.protocol_entry(protocol).log_sent(size);
        self.peer_entry(peer).log_sent(size);
    }

    /// Account received bytes against the protocol and peer that carried them.
    pub fn log_recv_stream(&self, size: u64, protocol: &str, peer: &PeerId) {
        self.protocol_entry(protocol).log_recv(size);
        self.peer_entry(peer).log_recv(size);
    }

    /// Snapshot of the global totals and current rates.
    pub fn totals(&self) -> Stats {
        self.global.stats()
    }

    /// Stats for one protocol; zero when the protocol was never accounted.
    pub fn for_protocol(&self, protocol: &str) -> Stats {
        self.by_protocol
            .read()
            .get(protocol)
            .map(|entry| entry.stats())
            .unwrap_or_default()
    }

    /// Stats for one peer; zero when the peer was never accounted.
    pub fn for_peer(&self, peer: &PeerId) -> Stats {
        self.by_peer
            .read()
            .get(peer)
            .map(|entry| entry.stats())
            .unwrap_or_default()
    }

    /// Caller-owned snapshot of every accounted protocol.
    pub fn by_protocol(&self) -> HashMap<ProtocolId, Stats> {
        self.by_protocol
            .read()
            .iter()
            .map(|(proto, entry)| (proto.clone(), entry.stats()))
            .collect()
    }

    /// Caller-owned snapshot of every accounted peer.
    pub fn by_peer(&self) -> HashMap<PeerId, Stats> {
        self.by_peer
            .read()
            .iter()
            .map(|(peer, entry)| (*peer, entry.stats()))
            .collect()
    }

    /// Zero all counters and drop every per-key entry.
    pub fn reset(&self) {
        self.global.reset();
        self.by_protocol.write().clear();
        self.by_peer.write().clear();
        debug!("bandwidth counters reset");
    }

    /// Drop every protocol or peer entry with no traffic at or after `since`
    /// (Unix seconds).
    pub fn trim_idle(&self, since: u64) {
        let mut trimmed = 0usize;
        {
            let mut protocols = self.by_protocol.write();
            let before = protocols.len();
            protocols.retain(|_, entry| entry.last_update() >= since);
            trimmed += before - protocols.len();
        }
        {
            let mut peers = self.by_peer.write();
            let before = peers.len();
            peers.retain(|_, entry| entry.last_update() >= since);
            trimmed += before - peers.len();
        }
        if trimmed > 0 {
            debug!(trimmed, "trimmed idle bandwidth entries");
        }
    }

    fn protocol_entry(&self, protocol: &str) -> Arc<Entry> {
        // Fast path: read lock
        {
            let protocols = self.by_protocol.read();
            if let Some(entry) = protocols.get(protocol) {
                return Arc::clone(entry);
            }
        }

        let mut protocols = self.by_protocol.write();
        // Double-check after acquiring write lock
        if let Some(entry) = protocols.get(protocol) {
            return Arc::clone(entry);
        }
        let entry = Arc::new(Entry::default());
        protocols.insert(protocol.to_string(), Arc::clone(&entry));
        entry
    }

    fn peer_entry(&self, peer: &PeerId) -> Arc<Entry> {
        {
            let peers = self.by_peer.read();
            if let Some(entry) = peers.get(peer) {
                return Arc::clone(entry);
            }
        }

        let mut peers = self.by_peer.write();
        if let Some(entry) = peers.get(peer) {
            return Arc::clone(entry);
        }
        let entry = Arc::new(Entry::default());
        peers.insert(*peer, Arc::clone(&entry));
        entry
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_aggregate_counting() {
        let counter = BandwidthCounter::new();
        counter.log_sent(100);
        counter.log_sent(200);
        counter.log_recv(50);

        let stats = counter.totals();
        assert_eq!(stats.total_out, 300);
        assert_eq!(stats.total_in, 50);
    }

    #[test]
    fn test_stream_logging_splits_per_protocol_and_peer() {
        let counter = BandwidthCounter::new();
        let (p1, p2) = (PeerId::random(), PeerId::random());

        counter.log_sent_stream(100, "/strand/a", &p1);
        counter.log_sent_stream(200, "/strand/a", &p1);
        counter.log_sent_stream(1000, "/strand/b", &p2);

        assert_eq!(counter.for_protocol("/strand/a").total_out, 300);
        assert_eq!(counter.for_peer(&p2).total_out, 1000);
        // Stream variants never touch the global totals.
        assert_eq!(counter.totals().total_out, 0);
    }

    #[test]
    fn test_per_key_isolation() {
        let counter = BandwidthCounter::new();
        let (p1, p2) = (PeerId::random(), PeerId::random());

        counter.log_sent_stream(500, "/strand/a", &p1);

        assert_eq!(counter.for_protocol("/strand/b"), Stats::default());
        assert_eq!(counter.for_peer(&p2), Stats::default());
        assert_eq!(counter.for_peer(&p1).total_out, 500);
    }

    #[test]
    fn test_absent_keys_report_zero_stats() {
        let counter = BandwidthCounter::new();
        assert_eq!(counter.for_protocol("/nope"), Stats::default());
        assert_eq!(counter.for_peer(&PeerId::random()), Stats::default());
    }

    #[test]
    fn test_concurrent_sends_sum_exactly() {
        use std::thread;

        let counter = Arc::new(BandwidthCounter::new());
        let mut handles = vec![];

        for _ in 0..8 {
            let counter = Arc::clone(&counter);
            handles.push(thread::spawn(move || {
                for _ in 0..1000 {
                    counter.log_sent(7);
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(counter.totals().total_out, 8 * 1000 * 7);
    }

    #[test]
    fn test_concurrent_stream_entry_creation() {
        use std::thread;

        let counter = Arc::new(BandwidthCounter::new());
        let peer = PeerId::random();
        let mut handles = vec![];

        for _ in 0..8 {
            let counter = Arc::clone(&counter);
            handles.push(thread::spawn(move || {
                for _ in 0..100 {
                    counter.log_recv_stream(3, "/strand/hot", &peer);
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(counter.for_protocol("/strand/hot").total_in, 8 * 100 * 3);
        assert_eq!(counter.for_peer(&peer).total_in, 8 * 100 * 3);
    }

    #[test]
    fn test_totals_monotone_between_snapshots() {
        let counter = BandwidthCounter::new();
        let mut last = 0u64;
        for i in 0..100 {
            counter.log_sent(i);
            let out = counter.totals().total_out;
            assert!(out >= last);
            last = out;
        }
    }

    #[test]
    fn test_rates_are_non_negative() {
        let counter = BandwidthCounter::new();
        counter.log_sent(10);
        counter.log_recv(10);
        let stats = counter.totals();
        assert!(stats.rate_in >= 0.0);
        assert!(stats.rate_out >= 0.0);
    }

    #[test]
    fn test_reset_drops_everything() {
        let counter = BandwidthCounter::new();
        let peer = PeerId::random();
        counter.log_sent(100);
        counter.log_sent_stream(100, "/strand/a", &peer);

        counter.reset();

        assert_eq!(counter.totals(), Stats::default());
        assert!(counter.by_protocol().is_empty());
        assert!(counter.by_peer().is_empty());
    }

    #[test]
    fn test_snapshots_are_caller_owned() {
        let counter = BandwidthCounter::new();
        counter.log_sent_stream(100, "/strand/a", &PeerId::random());

        let mut snapshot = counter.by_protocol();
        snapshot.clear();

        assert_eq!(counter.by_protocol().len(), 1);
    }

    #[test]
    fn test_trim_idle_removes_cold_entries() {
        let counter = BandwidthCounter::new();
        let peer = PeerId::random();
        counter.log_sent_stream(100, "/strand/a", &peer);

        let now = strand_api::unix_secs();

        // Entries were just written, so a cutoff in the past keeps them.
        counter.trim_idle(now.saturating_sub(5));
        assert_eq!(counter.by_protocol().len(), 1);
        assert_eq!(counter.by_peer().len(), 1);

        // A cutoff beyond the last update drops them.
        counter.trim_idle(now + 5);
        assert!(counter.by_protocol().is_empty());
        assert!(counter.by_peer().is_empty());
    }
}
