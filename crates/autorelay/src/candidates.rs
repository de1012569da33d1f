//! Relay candidates and selection order.

use std::collections::HashSet;
use std::time::Duration;

use libp2p::{Multiaddr, PeerId};
use rand::seq::SliceRandom;

/// Priority of candidates observed only via an existing connection rather
/// than an explicit discovery result. Sorts after every real result.
pub const INFERRED_PRIORITY: i32 = -100;

/// Priority override applied to preferred relays during selection.
pub const PREFERRED_PRIORITY: i32 = 100;

/// A relay we could try to reserve on.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub peer: PeerId,
    pub addrs: Vec<Multiaddr>,
    pub priority: i32,
    /// Unix seconds of the most recent sighting.
    pub last_seen: u64,
    pub latency: Option<Duration>,
}

impl Candidate {
    pub fn new(peer: PeerId, addrs: Vec<Multiaddr>, priority: i32) -> Self {
        Self {
            peer,
            addrs,
            priority,
            last_seen: strand_api::unix_secs(),
            latency: None,
        }
    }

    pub fn is_inferred(&self) -> bool {
        self.priority <= INFERRED_PRIORITY
    }

    fn effective_priority(&self, preferred: &HashSet<PeerId>) -> i32 {
        if preferred.contains(&self.peer) {
            PREFERRED_PRIORITY
        } else {
            self.priority
        }
    }
}

/// Order candidates for selection: higher priority first, lower latency
/// within a priority, unmeasured latency last. The preferred override only
/// lives for the duration of the sort.
///
/// Candidates are shuffled before the (stable) sort, so residual ties
/// resolve randomly rather than in map-iteration order.
pub(crate) fn sort_for_selection(candidates: &mut [Candidate], preferred: &HashSet<PeerId>) {
    let mut rng = rand::rng();
    candidates.shuffle(&mut rng);
    candidates.sort_by(|a, b| {
        b.effective_priority(preferred)
            .cmp(&a.effective_priority(preferred))
            .then_with(|| match (a.latency, b.latency) {
                (Some(x), Some(y)) => x.cmp(&y),
                (Some(_), None) => std::cmp::Ordering::Less,
                (None, Some(_)) => std::cmp::Ordering::Greater,
                (None, None) => std::cmp::Ordering::Equal,
            })
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(n: u8) -> PeerId {
        strand_test_utils::test_peer_id(n)
    }

    #[test]
    fn test_priority_orders_descending() {
        let mut candidates = vec![
            Candidate::new(peer(1), vec![], 0),
            Candidate::new(peer(2), vec![], 10),
            Candidate::new(peer(3), vec![], INFERRED_PRIORITY),
        ];
        sort_for_selection(&mut candidates, &HashSet::new());

        let priorities: Vec<i32> = candidates.iter().map(|c| c.priority).collect();
        assert_eq!(priorities, vec![10, 0, INFERRED_PRIORITY]);
    }

    #[test]
    fn test_latency_breaks_priority_ties() {
        let mut slow = Candidate::new(peer(1), vec![], 5);
        slow.latency = Some(Duration::from_millis(200));
        let mut fast = Candidate::new(peer(2), vec![], 5);
        fast.latency = Some(Duration::from_millis(20));
        let unmeasured = Candidate::new(peer(3), vec![], 5);

        let mut candidates = vec![slow, unmeasured, fast];
        sort_for_selection(&mut candidates, &HashSet::new());

        let order: Vec<PeerId> = candidates.iter().map(|c| c.peer).collect();
        assert_eq!(order, vec![peer(2), peer(1), peer(3)]);
    }

    #[test]
    fn test_preferred_overrides_priority_only_during_sort() {
        let high = Candidate::new(peer(1), vec![], 50);
        let low = Candidate::new(peer(2), vec![], 0);

        let preferred: HashSet<PeerId> = [peer(2)].into_iter().collect();
        let mut candidates = vec![high, low];
        sort_for_selection(&mut candidates, &preferred);

        assert_eq!(candidates[0].peer, peer(2));
        // The stored priority is untouched.
        assert_eq!(candidates[0].priority, 0);
    }

    #[test]
    fn test_residual_ties_are_shuffled() {
        // Same priority, no latency on either: over repeated sorts both
        // orders must show up.
        let mut seen_first: HashSet<PeerId> = HashSet::new();
        for _ in 0..64 {
            let mut candidates = vec![
                Candidate::new(peer(1), vec![], 5),
                Candidate::new(peer(2), vec![], 5),
            ];
            sort_for_selection(&mut candidates, &HashSet::new());
            seen_first.insert(candidates[0].peer);
        }
        assert_eq!(seen_first.len(), 2);
    }

    #[test]
    fn test_inferred_detection() {
        assert!(Candidate::new(peer(1), vec![], INFERRED_PRIORITY).is_inferred());
        assert!(Candidate::new(peer(1), vec![], -200).is_inferred());
        assert!(!Candidate::new(peer(1), vec![], 0).is_inferred());
    }
}
