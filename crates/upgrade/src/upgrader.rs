//! Upgrade sessions: shared per-remote coordination and retry scheduling.

use std::collections::HashMap;
use std::sync::Arc;

use libp2p::multiaddr::Protocol;
use libp2p::{Multiaddr, PeerId};
use parking_lot::{Mutex, RwLock};
use strand_api::{HolePuncher, Host};
use strand_relay::{CircuitStream, RelayCircuit};
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::config::UpgradeConfig;
use crate::error::UpgradeError;
use crate::exchange::{recv_addrs, send_addrs};

/// Drain budget granted to a circuit replaced by a direct connection.
const REPLACED_CIRCUIT_DRAIN: std::time::Duration = std::time::Duration::from_secs(30);

/// Phases of an upgrade session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Pending,
    Exchanged,
    Punching,
    Success,
    Failed,
}

type UpgradeOutcome = Result<Multiaddr, UpgradeError>;
type UpgradedCallback = Arc<dyn Fn(PeerId, Multiaddr) + Send + Sync>;

struct Session {
    state: Mutex<SessionState>,
    outcome: Mutex<Option<UpgradeOutcome>>,
    done_tx: watch::Sender<bool>,
    done_rx: watch::Receiver<bool>,
}

impl Session {
    fn new() -> Self {
        let (done_tx, done_rx) = watch::channel(false);
        Self {
            state: Mutex::new(SessionState::Pending),
            outcome: Mutex::new(None),
            done_tx,
            done_rx,
        }
    }

    fn set_state(&self, state: SessionState) {
        *self.state.lock() = state;
    }

    /// Publish the terminal outcome exactly once and release waiters.
    fn finish(&self, outcome: UpgradeOutcome) {
        self.set_state(if outcome.is_ok() {
            SessionState::Success
        } else {
            SessionState::Failed
        });
        self.outcome.lock().get_or_insert(outcome);
        let _ = self.done_tx.send(true);
    }

    async fn wait(&self) -> UpgradeOutcome {
        let mut done = self.done_rx.clone();
        while !*done.borrow() {
            if done.changed().await.is_err() {
                break;
            }
        }
        self.outcome
            .lock()
            .clone()
            .unwrap_or(Err(UpgradeError::Circuit("session aborted".to_string())))
    }
}

#[derive(Default)]
struct RetryState {
    attempts: u32,
}

struct UpgraderInner {
    config: UpgradeConfig,
    host: Arc<dyn Host>,
    puncher: Option<Arc<dyn HolePuncher>>,
    sessions: Mutex<HashMap<PeerId, Arc<Session>>>,
    retries: Mutex<HashMap<PeerId, RetryState>>,
    on_upgraded: RwLock<Option<UpgradedCallback>>,
}

/// Coordinates relay-to-direct upgrades, one in-flight session per remote.
#[derive(Clone)]
pub struct Upgrader {
    inner: Arc<UpgraderInner>,
}

impl Upgrader {
    pub fn new(
        host: Arc<dyn Host>,
        puncher: Option<Arc<dyn HolePuncher>>,
        config: UpgradeConfig,
    ) -> Self {
        Self {
            inner: Arc::new(UpgraderInner {
                config,
                host,
                puncher,
                sessions: Mutex::new(HashMap::new()),
                retries: Mutex::new(HashMap::new()),
                on_upgraded: RwLock::new(None),
            }),
        }
    }

    /// Install the success observer, invoked once per successful upgrade
    /// with the remote and the direct address.
    pub fn on_upgraded<F>(&self, cb: F)
    where
        F: Fn(PeerId, Multiaddr) + Send + Sync + 'static,
    {
        *self.inner.on_upgraded.write() = Some(Arc::new(cb));
    }

    /// Attempt to replace `circuit` with a direct connection to `remote`.
    ///
    /// Concurrent callers for the same remote join the in-flight session and
    /// receive its outcome; at most one hole punch runs per remote at any
    /// time. A failed attempt is retried in the background, spaced by the
    /// configured interval, after which the circuit keeps being used as-is.
    pub async fn try_upgrade(
        &self,
        remote: PeerId,
        circuit: &RelayCircuit,
    ) -> Result<Multiaddr, UpgradeError> {
        let (session, leader) = {
            let mut sessions = self.inner.sessions.lock();
            match sessions.get(&remote) {
                Some(session) => (Arc::clone(session), false),
                None => {
                    let session = Arc::new(Session::new());
                    sessions.insert(remote, Arc::clone(&session));
                    (session, true)
                }
            }
        };

        if !leader {
            return session.wait().await;
        }

        let outcome = self.inner.run_session(&session, remote, circuit).await;
        session.finish(outcome.clone());
        self.inner.sessions.lock().remove(&remote);

        match &outcome {
            Ok(addr) => {
                debug!(%remote, %addr, "upgraded relayed connection to direct");
                self.inner.retries.lock().remove(&remote);
                let cb = self.inner.on_upgraded.read().clone();
                if let Some(cb) = cb {
                    cb(remote, addr.clone());
                }
                // The relayed path is now redundant; let it drain out.
                let circuit = circuit.clone();
                tokio::spawn(async move {
                    let _ = circuit.graceful_close(REPLACED_CIRCUIT_DRAIN).await;
                });
            }
            Err(error) => {
                warn!(%remote, %error, "upgrade attempt failed");
                self.schedule_retry(remote, circuit.clone());
            }
        }

        outcome
    }

    /// Phase of the in-flight session for `remote`, if any.
    pub fn session_state(&self, remote: &PeerId) -> Option<SessionState> {
        self.inner
            .sessions
            .lock()
            .get(remote)
            .map(|session| *session.state.lock())
    }

    /// Serve the responder side of an address exchange arriving on a
    /// circuit stream: read the remote candidates, answer with ours.
    pub async fn respond_exchange(
        &self,
        mut stream: CircuitStream,
    ) -> Result<Vec<Multiaddr>, UpgradeError> {
        let remote_addrs = recv_addrs(&mut stream, self.inner.config.max_address_count).await?;
        let local_addrs = self.inner.local_candidates();
        send_addrs(&mut stream, &local_addrs).await?;
        Ok(remote_addrs)
    }

    fn schedule_retry(&self, remote: PeerId, circuit: RelayCircuit) {
        if !self.inner.config.enable_auto_upgrade {
            return;
        }

        let attempts = {
            let mut retries = self.inner.retries.lock();
            let state = retries.entry(remote).or_default();
            state.attempts += 1;
            state.attempts
        };
        if attempts > self.inner.config.max_retries {
            debug!(%remote, attempts, "upgrade retries exhausted, keeping relayed path");
            self.inner.retries.lock().remove(&remote);
            return;
        }

        let upgrader = self.clone();
        let interval = self.inner.config.retry_interval;
        tokio::spawn(async move {
            tokio::time::sleep(interval).await;
            if circuit.is_closed() {
                return;
            }
            let _ = upgrader.try_upgrade(remote, &circuit).await;
        });
    }
}

impl UpgraderInner {
    async fn run_session(
        &self,
        session: &Session,
        remote: PeerId,
        circuit: &RelayCircuit,
    ) -> UpgradeOutcome {
        let Some(puncher) = self.puncher.clone() else {
            return Err(UpgradeError::NoPuncher);
        };

        let local_addrs = self.local_candidates();
        if local_addrs.is_empty() {
            return Err(UpgradeError::NoAddresses);
        }

        let mut stream = circuit
            .new_stream()
            .await
            .map_err(|e| UpgradeError::Circuit(e.to_string()))?;

        let exchange = async {
            send_addrs(&mut stream, &local_addrs).await?;
            recv_addrs(&mut stream, self.config.max_address_count).await
        };
        let remote_addrs = tokio::time::timeout(self.config.addr_exchange_timeout, exchange)
            .await
            .map_err(|_| UpgradeError::ExchangeTimeout)??;
        session.set_state(SessionState::Exchanged);

        if remote_addrs.is_empty() {
            return Err(UpgradeError::NoAddresses);
        }

        session.set_state(SessionState::Punching);
        let direct = tokio::time::timeout(
            self.config.hole_punch_timeout,
            puncher.punch(remote, remote_addrs),
        )
        .await
        .map_err(|_| UpgradeError::PunchTimeout)??;

        Ok(direct)
    }

    /// Local candidates for a direct connection. Relayed forms are useless
    /// to a hole punch and are filtered out.
    fn local_candidates(&self) -> Vec<Multiaddr> {
        let mut addrs = self.host.advertised_addrs();
        for addr in self.host.listen_addrs() {
            if !addrs.contains(&addr) {
                addrs.push(addr);
            }
        }
        addrs.retain(|addr| !addr.iter().any(|p| matches!(p, Protocol::P2pCircuit)));
        addrs
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use strand_api::PunchError;
    use strand_relay::{CircuitConfig, Direction};
    use strand_test_utils::{MemoryHost, MemoryMuxer, MockHolePuncher, test_peer_id};

    use super::*;

    fn fast_upgrade_config() -> UpgradeConfig {
        UpgradeConfig {
            hole_punch_timeout: Duration::from_secs(2),
            addr_exchange_timeout: Duration::from_secs(2),
            retry_interval: Duration::from_millis(40),
            max_retries: 2,
            enable_auto_upgrade: true,
            max_address_count: 100,
        }
    }

    fn circuit_pair() -> (RelayCircuit, RelayCircuit) {
        let (a, b) = MemoryMuxer::pair();
        let config = CircuitConfig {
            keep_alive_interval: Duration::from_millis(50),
            idle_timeout: Duration::from_secs(30),
            pong_timeout: Duration::from_secs(30),
            ..CircuitConfig::default()
        };
        let initiator = test_peer_id(1);
        let responder = test_peer_id(2);
        let relay = test_peer_id(9);
        (
            RelayCircuit::new(
                Box::new(a),
                initiator,
                responder,
                relay,
                Direction::Outbound,
                config.clone(),
            ),
            RelayCircuit::new(
                Box::new(b),
                responder,
                initiator,
                relay,
                Direction::Inbound,
                config,
            ),
        )
    }

    fn host_with_addrs(seed: u8, addr: &str) -> Arc<MemoryHost> {
        let host = Arc::new(MemoryHost::new(test_peer_id(seed)));
        host.set_advertised_addrs(vec![addr.parse().unwrap()]);
        host
    }

    /// Wire a responder upgrader to answer exchanges arriving on `circuit`.
    fn serve_exchanges(circuit: &RelayCircuit, upgrader: Upgrader) {
        circuit.accept_stream_loop(move |stream| {
            let upgrader = upgrader.clone();
            tokio::spawn(async move {
                let _ = upgrader.respond_exchange(stream).await;
            });
        });
    }

    #[tokio::test]
    async fn test_successful_upgrade_returns_direct_address() {
        let (outbound, inbound) = circuit_pair();
        let remote = test_peer_id(2);
        let direct: Multiaddr = "/ip4/203.0.113.7/tcp/4100".parse().unwrap();

        let puncher = Arc::new(MockHolePuncher::new());
        puncher.succeed_with(remote, direct.clone());

        let initiator = Upgrader::new(
            host_with_addrs(1, "/ip4/10.0.0.1/tcp/4001"),
            Some(puncher.clone()),
            fast_upgrade_config(),
        );
        let responder = Upgrader::new(
            host_with_addrs(2, "/ip4/10.0.0.2/tcp/4002"),
            None,
            fast_upgrade_config(),
        );

        serve_exchanges(&inbound, responder);
        outbound.accept_stream_loop(|_| {});

        let upgraded = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&upgraded);
        initiator.on_upgraded(move |peer, addr| sink.lock().push((peer, addr)));

        let got = initiator.try_upgrade(remote, &outbound).await.unwrap();
        assert_eq!(got, direct);

        // Callback fired exactly once with the winning address.
        let fired = upgraded.lock().clone();
        assert_eq!(fired, vec![(remote, direct)]);

        // The puncher saw the responder's candidates.
        let calls = puncher.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(
            calls[0].1,
            vec!["/ip4/10.0.0.2/tcp/4002".parse::<Multiaddr>().unwrap()]
        );
    }

    #[tokio::test]
    async fn test_concurrent_callers_share_one_session() {
        let (outbound, inbound) = circuit_pair();
        let remote = test_peer_id(2);
        let direct: Multiaddr = "/ip4/203.0.113.7/tcp/4100".parse().unwrap();

        let puncher = Arc::new(MockHolePuncher::new());
        puncher.succeed_with(remote, direct.clone());
        puncher.set_delay(Duration::from_millis(100));

        let initiator = Upgrader::new(
            host_with_addrs(1, "/ip4/10.0.0.1/tcp/4001"),
            Some(puncher.clone()),
            fast_upgrade_config(),
        );
        let responder = Upgrader::new(
            host_with_addrs(2, "/ip4/10.0.0.2/tcp/4002"),
            None,
            fast_upgrade_config(),
        );
        serve_exchanges(&inbound, responder);
        outbound.accept_stream_loop(|_| {});

        let mut tasks = Vec::new();
        for _ in 0..5 {
            let upgrader = initiator.clone();
            let circuit = outbound.clone();
            tasks.push(tokio::spawn(async move {
                upgrader.try_upgrade(remote, &circuit).await
            }));
        }

        // While the punch is held open, the shared session is observable.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(initiator.session_state(&remote), Some(SessionState::Punching));

        for task in tasks {
            assert_eq!(task.await.unwrap().unwrap(), direct);
        }
        assert_eq!(puncher.call_count(), 1);
        assert_eq!(puncher.max_in_flight(), 1);
    }

    #[tokio::test]
    async fn test_missing_puncher_is_an_error() {
        let (outbound, _inbound) = circuit_pair();
        let upgrader = Upgrader::new(
            host_with_addrs(1, "/ip4/10.0.0.1/tcp/4001"),
            None,
            fast_upgrade_config(),
        );

        assert!(matches!(
            upgrader.try_upgrade(test_peer_id(2), &outbound).await,
            Err(UpgradeError::NoPuncher)
        ));
    }

    #[tokio::test]
    async fn test_no_local_candidates_is_an_error() {
        let (outbound, _inbound) = circuit_pair();
        let host = Arc::new(MemoryHost::new(test_peer_id(1)));
        let upgrader = Upgrader::new(
            host,
            Some(Arc::new(MockHolePuncher::new())),
            fast_upgrade_config(),
        );

        assert!(matches!(
            upgrader.try_upgrade(test_peer_id(2), &outbound).await,
            Err(UpgradeError::NoAddresses)
        ));
    }

    #[tokio::test]
    async fn test_empty_remote_candidates_is_an_error() {
        let (outbound, inbound) = circuit_pair();
        let remote = test_peer_id(2);

        let initiator = Upgrader::new(
            host_with_addrs(1, "/ip4/10.0.0.1/tcp/4001"),
            Some(Arc::new(MockHolePuncher::new())),
            UpgradeConfig {
                enable_auto_upgrade: false,
                ..fast_upgrade_config()
            },
        );
        // Responder host advertises nothing.
        let responder = Upgrader::new(
            Arc::new(MemoryHost::new(test_peer_id(2))),
            None,
            fast_upgrade_config(),
        );
        serve_exchanges(&inbound, responder);
        outbound.accept_stream_loop(|_| {});

        assert!(matches!(
            initiator.try_upgrade(remote, &outbound).await,
            Err(UpgradeError::NoAddresses)
        ));
    }

    #[tokio::test]
    async fn test_failed_upgrade_retries_then_gives_up() {
        let (outbound, inbound) = circuit_pair();
        let remote = test_peer_id(2);

        let puncher = Arc::new(MockHolePuncher::new());
        puncher.fail_with(remote, PunchError::Unreachable(remote));

        let initiator = Upgrader::new(
            host_with_addrs(1, "/ip4/10.0.0.1/tcp/4001"),
            Some(puncher.clone()),
            fast_upgrade_config(),
        );
        let responder = Upgrader::new(
            host_with_addrs(2, "/ip4/10.0.0.2/tcp/4002"),
            None,
            fast_upgrade_config(),
        );
        serve_exchanges(&inbound, responder);
        outbound.accept_stream_loop(|_| {});

        let outcome = initiator.try_upgrade(remote, &outbound).await;
        assert!(matches!(outcome, Err(UpgradeError::Punch(_))));

        // Initial attempt plus max_retries background attempts.
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(puncher.call_count(), 3);

        // The circuit is still usable as-is.
        assert!(!outbound.is_closed());
    }

    #[tokio::test]
    async fn test_relayed_addrs_are_not_offered_for_punching() {
        let (outbound, inbound) = circuit_pair();
        let remote = test_peer_id(2);
        let direct: Multiaddr = "/ip4/203.0.113.7/tcp/4100".parse().unwrap();

        let puncher = Arc::new(MockHolePuncher::new());
        puncher.succeed_with(remote, direct);

        let host = Arc::new(MemoryHost::new(test_peer_id(1)));
        host.set_advertised_addrs(vec![
            "/ip4/10.0.0.1/tcp/4001".parse().unwrap(),
            "/ip4/9.9.9.9/tcp/4001/p2p-circuit".parse().unwrap(),
        ]);
        let initiator = Upgrader::new(host, Some(puncher), fast_upgrade_config());

        let responder_host = host_with_addrs(2, "/ip4/10.0.0.2/tcp/4002");
        let responder = Upgrader::new(responder_host, None, fast_upgrade_config());

        // Capture what the responder receives from the initiator.
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_sink = Arc::clone(&seen);
        let responder_for_loop = responder.clone();
        inbound.accept_stream_loop(move |stream| {
            let upgrader = responder_for_loop.clone();
            let sink = Arc::clone(&seen_sink);
            tokio::spawn(async move {
                if let Ok(addrs) = upgrader.respond_exchange(stream).await {
                    sink.lock().extend(addrs);
                }
            });
        });
        outbound.accept_stream_loop(|_| {});

        initiator.try_upgrade(remote, &outbound).await.unwrap();

        let seen = seen.lock().clone();
        assert_eq!(
            seen,
            vec!["/ip4/10.0.0.1/tcp/4001".parse::<Multiaddr>().unwrap()]
        );
    }

}
