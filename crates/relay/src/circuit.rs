//! Circuit connection state and lifecycle.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering};
use std::time::Duration;

use libp2p::PeerId;
use parking_lot::{Mutex, RwLock};
use strand_api::{CircuitState, CoreEvent, CoreEventBus, DynStream, StreamMuxer, unix_millis};
use tokio::io::WriteHalf;
use tokio::sync::watch;
use tracing::{debug, trace};

use crate::config::CircuitConfig;
use crate::error::CircuitError;
use crate::stream::CircuitStream;

pub(crate) const REASON_ACTIVITY_RESUMED: &str = "activity_resumed";
pub(crate) const REASON_IDLE_TIMEOUT: &str = "idle_timeout";
pub(crate) const REASON_STALE_TIMEOUT: &str = "stale_timeout";
pub(crate) const REASON_HEARTBEAT_TIMEOUT: &str = "heartbeat_timeout";
pub(crate) const REASON_QUOTA_EXHAUSTED: &str = "quota_exhausted";
pub(crate) const REASON_DEADLINE_EXCEEDED: &str = "deadline_exceeded";
pub(crate) const REASON_CLOSED: &str = "closed";
pub(crate) const REASON_TRANSPORT_FAILED: &str = "transport_failed";

/// Which side initiated the circuit. The initiator opens the control
/// channel; the responder adopts the first inbound stream as control.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Outbound,
    Inbound,
}

/// Synchronous observer of circuit state transitions. Carries the
/// authoritative ordering; event-bus emission is fire-and-forget.
pub type StateChangeCallback = Box<dyn Fn(CircuitState, CircuitState, &str) + Send + Sync>;

pub(crate) struct CircuitInner {
    pub(crate) local_peer: PeerId,
    pub(crate) remote_peer: PeerId,
    pub(crate) relay_peer: PeerId,
    pub(crate) direction: Direction,
    pub(crate) config: CircuitConfig,
    pub(crate) muxer: Box<dyn StreamMuxer>,

    state: AtomicU8,
    draining: AtomicBool,
    pub(crate) bytes_used: AtomicU64,
    /// Unix millis of the last logical-stream byte in either direction.
    last_activity: AtomicU64,
    pub(crate) last_pong: AtomicU64,
    pub(crate) created_at: u64,

    streams: Mutex<HashSet<u64>>,
    next_stream_id: AtomicU64,

    pub(crate) control_writer: tokio::sync::Mutex<Option<WriteHalf<DynStream>>>,
    control_ready_tx: watch::Sender<bool>,
    control_ready_rx: watch::Receiver<bool>,

    on_state_change: RwLock<Option<StateChangeCallback>>,
    bus: Option<CoreEventBus>,

    done_tx: watch::Sender<bool>,
    done_rx: watch::Receiver<bool>,

    accept_started: AtomicBool,
    pub(crate) keepalive_started: AtomicBool,
    close_started: AtomicBool,
}

impl CircuitInner {
    pub(crate) fn state(&self) -> CircuitState {
        CircuitState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// Move to `new` unless already `Closed` (terminal) or unchanged.
    /// The callback runs synchronously inside the transition.
    pub(crate) fn transition(&self, new: CircuitState, reason: &str) -> bool {
        loop {
            let current = self.state.load(Ordering::SeqCst);
            let old = CircuitState::from_u8(current);
            if old.is_closed() || old == new {
                return false;
            }
            if self
                .state
                .compare_exchange(current, new as u8, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                trace!(remote = %self.remote_peer, ?old, state = ?new, reason, "circuit state change");
                if let Some(cb) = self.on_state_change.read().as_ref() {
                    cb(old, new, reason);
                }
                if let Some(bus) = &self.bus {
                    bus.emit(CoreEvent::CircuitStateChanged {
                        remote: self.remote_peer,
                        relay: self.relay_peer,
                        old_state: old,
                        new_state: new,
                        reason: reason.to_string(),
                    });
                }
                return true;
            }
        }
    }

    /// Record logical-stream traffic: bump the quota counter, refresh the
    /// activity clock, and pull a `Stale` circuit back to `Active`.
    pub(crate) fn record_activity(&self, bytes: u64) {
        if bytes > 0 {
            self.bytes_used.fetch_add(bytes, Ordering::Relaxed);
        }
        self.last_activity.store(unix_millis(), Ordering::Relaxed);
        if self.state() == CircuitState::Stale {
            self.transition(CircuitState::Active, REASON_ACTIVITY_RESUMED);
        }
    }

    pub(crate) fn last_activity(&self) -> u64 {
        self.last_activity.load(Ordering::Relaxed)
    }

    pub(crate) fn register_stream(self: &Arc<Self>, io: DynStream) -> CircuitStream {
        let id = self.next_stream_id.fetch_add(1, Ordering::Relaxed);
        self.streams.lock().insert(id);
        self.record_activity(0);
        CircuitStream::new(id, io, Arc::clone(self))
    }

    pub(crate) fn deregister_stream(&self, id: u64) {
        self.streams.lock().remove(&id);
    }

    pub(crate) fn stream_ids(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self.streams.lock().iter().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub(crate) fn done_rx(&self) -> watch::Receiver<bool> {
        self.done_rx.clone()
    }

    pub(crate) fn control_ready_rx(&self) -> watch::Receiver<bool> {
        self.control_ready_rx.clone()
    }

    pub(crate) fn mark_control_ready(&self) {
        self.last_pong.store(unix_millis(), Ordering::Relaxed);
        let _ = self.control_ready_tx.send(true);
    }

    /// Tear the circuit down exactly once. Later calls are no-ops.
    pub(crate) async fn close_with_reason(&self, reason: &str) {
        if self.close_started.swap(true, Ordering::SeqCst) {
            return;
        }

        self.transition(CircuitState::Closed, reason);
        let _ = self.done_tx.send(true);

        if let Some(mut writer) = self.control_writer.lock().await.take() {
            use tokio::io::AsyncWriteExt;
            let _ = writer.shutdown().await;
        }
        let _ = self.muxer.close().await;
        self.streams.lock().clear();

        debug!(remote = %self.remote_peer, relay = %self.relay_peer, reason, "circuit closed");
    }

    fn refuse_if_unusable(&self) -> Result<(), CircuitError> {
        if self.state().is_closed() {
            return Err(CircuitError::NotActive);
        }
        if self.draining.load(Ordering::SeqCst) {
            return Err(CircuitError::Draining);
        }
        Ok(())
    }
}

/// A multi-stream connection to a remote peer carried over a single
/// relayed stream. Cloning yields another handle to the same circuit.
#[derive(Clone)]
pub struct RelayCircuit {
    inner: Arc<CircuitInner>,
}

impl RelayCircuit {
    /// Build a circuit over an already negotiated multiplexer. The circuit
    /// starts `Active`; background maintenance begins with
    /// [`RelayCircuit::accept_stream_loop`].
    pub fn new(
        muxer: Box<dyn StreamMuxer>,
        local_peer: PeerId,
        remote_peer: PeerId,
        relay_peer: PeerId,
        direction: Direction,
        config: CircuitConfig,
    ) -> Self {
        let (done_tx, done_rx) = watch::channel(false);
        let (control_ready_tx, control_ready_rx) = watch::channel(false);
        let now = unix_millis();

        Self {
            inner: Arc::new(CircuitInner {
                local_peer,
                remote_peer,
                relay_peer,
                direction,
                config,
                muxer,
                state: AtomicU8::new(CircuitState::Active as u8),
                draining: AtomicBool::new(false),
                bytes_used: AtomicU64::new(0),
                last_activity: AtomicU64::new(now),
                last_pong: AtomicU64::new(now),
                created_at: now,
                streams: Mutex::new(HashSet::new()),
                next_stream_id: AtomicU64::new(1),
                control_writer: tokio::sync::Mutex::new(None),
                control_ready_tx,
                control_ready_rx,
                on_state_change: RwLock::new(None),
                bus: None,
                done_tx,
                done_rx,
                accept_started: AtomicBool::new(false),
                keepalive_started: AtomicBool::new(false),
                close_started: AtomicBool::new(false),
            }),
        }
    }

    /// Attach an event bus for fire-and-forget state-change emissions.
    pub fn with_event_bus(mut self, bus: CoreEventBus) -> Self {
        if let Some(inner) = Arc::get_mut(&mut self.inner) {
            inner.bus = Some(bus);
        }
        self
    }

    /// Install the synchronous state-change observer.
    pub fn on_state_change(&self, cb: StateChangeCallback) {
        *self.inner.on_state_change.write() = Some(cb);
    }

    /// Open a new logical stream. Waits for the control channel when the
    /// circuit runs with control enabled and maintenance has started.
    pub async fn new_stream(&self) -> Result<CircuitStream, CircuitError> {
        self.inner.refuse_if_unusable()?;

        if self.inner.config.control_enabled
            && self.inner.keepalive_started.load(Ordering::SeqCst)
        {
            self.wait_control_ready().await?;
        }

        let io = self.inner.muxer.open_stream().await?;
        Ok(self.inner.register_stream(io))
    }

    /// Wait for and wrap the next inbound logical stream.
    pub async fn accept_stream(&self) -> Result<CircuitStream, CircuitError> {
        self.inner.refuse_if_unusable()?;
        let io = self.inner.muxer.accept_stream().await?;
        Ok(self.inner.register_stream(io))
    }

    /// Start the accept loop and keep-alive maintenance. Only the first
    /// call has any effect; the handler runs for every inbound logical
    /// stream until the circuit closes.
    pub fn accept_stream_loop<F>(&self, handler: F)
    where
        F: Fn(CircuitStream) + Send + Sync + 'static,
    {
        if self.inner.accept_started.swap(true, Ordering::SeqCst) {
            return;
        }

        crate::keepalive::start(&self.inner);

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let mut done = inner.done_rx();
            let mut first = true;
            loop {
                let accepted = tokio::select! {
                    _ = done.changed() => break,
                    accepted = inner.muxer.accept_stream() => accepted,
                };
                match accepted {
                    Ok(io) => {
                        let adopt_control = first
                            && inner.config.control_enabled
                            && inner.direction == Direction::Inbound;
                        first = false;
                        if adopt_control {
                            crate::keepalive::adopt_control_stream(&inner, io).await;
                            continue;
                        }
                        let stream = inner.register_stream(io);
                        handler(stream);
                    }
                    Err(_) => {
                        inner.close_with_reason(REASON_TRANSPORT_FAILED).await;
                        break;
                    }
                }
            }
        });
    }

    /// Close everything exactly once: live streams, control channel,
    /// multiplexer, base stream. Safe to call repeatedly.
    pub async fn close(&self) -> Result<(), CircuitError> {
        self.inner.close_with_reason(REASON_CLOSED).await;
        Ok(())
    }

    /// Stop accepting new streams, wait up to `timeout` for the live ones
    /// to drain, then close.
    pub async fn graceful_close(&self, timeout: Duration) -> Result<(), CircuitError> {
        self.inner.draining.store(true, Ordering::SeqCst);

        let drained = async {
            loop {
                if self.inner.streams.lock().is_empty() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(25)).await;
            }
        };
        let _ = tokio::time::timeout(timeout, drained).await;

        self.close().await
    }

    /// Identifiers of the currently open logical streams.
    pub fn streams(&self) -> Vec<u64> {
        self.inner.stream_ids()
    }

    pub fn stream_count(&self) -> usize {
        self.inner.streams.lock().len()
    }

    pub fn state(&self) -> CircuitState {
        self.inner.state()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.state().is_closed()
    }

    /// Unix millis of the most recent logical-stream traffic.
    pub fn last_activity(&self) -> u64 {
        self.inner.last_activity()
    }

    pub fn bytes_used(&self) -> u64 {
        self.inner.bytes_used.load(Ordering::Relaxed)
    }

    /// Resolves to `true` when the circuit has closed.
    pub fn done(&self) -> watch::Receiver<bool> {
        self.inner.done_rx()
    }

    pub fn local_peer(&self) -> PeerId {
        self.inner.local_peer
    }

    pub fn remote_peer(&self) -> PeerId {
        self.inner.remote_peer
    }

    pub fn relay_peer(&self) -> PeerId {
        self.inner.relay_peer
    }

    pub fn direction(&self) -> Direction {
        self.inner.direction
    }

    async fn wait_control_ready(&self) -> Result<(), CircuitError> {
        let mut ready = self.inner.control_ready_rx();
        let mut done = self.inner.done_rx();
        loop {
            if *ready.borrow() {
                return Ok(());
            }
            if *done.borrow() {
                return Err(CircuitError::NotActive);
            }
            tokio::select! {
                changed = ready.changed() => {
                    if changed.is_err() {
                        return Err(CircuitError::ControlUnavailable);
                    }
                }
                _ = done.changed() => return Err(CircuitError::NotActive),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use strand_test_utils::{MemoryMuxer, test_peer_id};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::sync::mpsc;

    use super::*;

    type Transitions = Arc<Mutex<Vec<(CircuitState, CircuitState, String)>>>;

    fn fast_config() -> CircuitConfig {
        CircuitConfig {
            keep_alive_interval: Duration::from_millis(20),
            idle_timeout: Duration::from_millis(100),
            pong_timeout: Duration::from_secs(10),
            max_bytes: 0,
            deadline: None,
            control_enabled: true,
        }
    }

    fn circuit_pair(config: CircuitConfig) -> (RelayCircuit, RelayCircuit) {
        let (a, b) = MemoryMuxer::pair();
        let initiator = test_peer_id(1);
        let responder = test_peer_id(2);
        let relay = test_peer_id(9);
        let outbound = RelayCircuit::new(
            Box::new(a),
            initiator,
            responder,
            relay,
            Direction::Outbound,
            config.clone(),
        );
        let inbound = RelayCircuit::new(
            Box::new(b),
            responder,
            initiator,
            relay,
            Direction::Inbound,
            config,
        );
        (outbound, inbound)
    }

    fn record_transitions(circuit: &RelayCircuit) -> Transitions {
        let transitions: Transitions = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&transitions);
        circuit.on_state_change(Box::new(move |old, new, reason| {
            sink.lock().push((old, new, reason.to_string()));
        }));
        transitions
    }

    fn reasons(transitions: &Transitions) -> Vec<String> {
        transitions.lock().iter().map(|(_, _, r)| r.clone()).collect()
    }

    #[tokio::test]
    async fn test_streams_carry_data_between_circuits() {
        let (outbound, inbound) = circuit_pair(fast_config());

        let (tx, mut rx) = mpsc::unbounded_channel();
        inbound.accept_stream_loop(move |stream| {
            let _ = tx.send(stream);
        });
        outbound.accept_stream_loop(|_| {});

        let mut stream = outbound.new_stream().await.unwrap();
        stream.write_all(b"ping-data").await.unwrap();

        let mut accepted = rx.recv().await.unwrap();
        let mut buf = [0u8; 9];
        accepted.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping-data");

        assert!(outbound.bytes_used() >= 9);
        assert!(inbound.bytes_used() >= 9);
        assert_eq!(outbound.state(), CircuitState::Active);
    }

    #[tokio::test]
    async fn test_idle_circuit_goes_stale_and_recovers() {
        let (outbound, inbound) = circuit_pair(fast_config());
        let transitions = record_transitions(&inbound);

        let (tx, mut rx) = mpsc::unbounded_channel();
        inbound.accept_stream_loop(move |stream| {
            let _ = tx.send(stream);
        });
        outbound.accept_stream_loop(|_| {});

        tokio::time::sleep(Duration::from_millis(140)).await;
        assert_eq!(inbound.state(), CircuitState::Stale);
        assert!(reasons(&transitions).contains(&"idle_timeout".to_string()));

        // Any accepted stream revives the circuit.
        let _stream = outbound.new_stream().await.unwrap();
        let _accepted = rx.recv().await.unwrap();

        assert_eq!(inbound.state(), CircuitState::Active);
        assert!(reasons(&transitions).contains(&"activity_resumed".to_string()));
    }

    #[tokio::test]
    async fn test_stale_circuit_closes_on_second_idle_period() {
        // Only the inbound side runs maintenance, so the close reason we
        // observe is its own stale timeout rather than a peer teardown.
        let (_outbound, inbound) = circuit_pair(fast_config());
        let transitions = record_transitions(&inbound);
        inbound.accept_stream_loop(|_| {});

        tokio::time::sleep(Duration::from_millis(350)).await;

        assert_eq!(inbound.state(), CircuitState::Closed);
        assert!(reasons(&transitions).contains(&"stale_timeout".to_string()));
    }

    #[tokio::test]
    async fn test_closing_one_stream_leaves_others_alive() {
        let (outbound, inbound) = circuit_pair(fast_config());

        let (tx, mut rx) = mpsc::unbounded_channel();
        inbound.accept_stream_loop(move |stream| {
            let _ = tx.send(stream);
        });
        outbound.accept_stream_loop(|_| {});

        let first = outbound.new_stream().await.unwrap();
        let mut second = outbound.new_stream().await.unwrap();
        let _accepted_first = rx.recv().await.unwrap();
        let mut accepted_second = rx.recv().await.unwrap();
        assert_eq!(outbound.stream_count(), 2);

        drop(first);
        assert_eq!(outbound.stream_count(), 1);

        second.write_all(b"still-alive").await.unwrap();
        let mut buf = [0u8; 11];
        accepted_second.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"still-alive");
        assert_eq!(outbound.state(), CircuitState::Active);
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (outbound, _inbound) = circuit_pair(fast_config());
        let transitions = record_transitions(&outbound);

        assert!(outbound.close().await.is_ok());
        assert!(outbound.close().await.is_ok());
        assert!(outbound.close().await.is_ok());

        let closes = transitions
            .lock()
            .iter()
            .filter(|(_, new, _)| new.is_closed())
            .count();
        assert_eq!(closes, 1);

        assert!(matches!(
            outbound.new_stream().await,
            Err(CircuitError::NotActive)
        ));
    }

    #[tokio::test]
    async fn test_done_signal_fires_on_close() {
        let (outbound, _inbound) = circuit_pair(fast_config());
        let mut done = outbound.done();
        assert!(!*done.borrow());

        outbound.close().await.unwrap();

        done.changed().await.unwrap();
        assert!(*done.borrow());
    }

    #[tokio::test]
    async fn test_graceful_close_refuses_new_streams_while_draining() {
        let (outbound, inbound) = circuit_pair(fast_config());

        let (tx, mut rx) = mpsc::unbounded_channel();
        inbound.accept_stream_loop(move |stream| {
            let _ = tx.send(stream);
        });
        outbound.accept_stream_loop(|_| {});

        let held = outbound.new_stream().await.unwrap();
        let _accepted = rx.recv().await.unwrap();

        let closer = {
            let circuit = outbound.clone();
            tokio::spawn(async move { circuit.graceful_close(Duration::from_millis(500)).await })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(matches!(
            outbound.new_stream().await,
            Err(CircuitError::Draining)
        ));

        drop(held);
        closer.await.unwrap().unwrap();
        assert_eq!(outbound.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_quota_exhaustion_closes_circuit() {
        let config = CircuitConfig {
            max_bytes: 16,
            ..fast_config()
        };
        let (outbound, inbound) = circuit_pair(config);
        let transitions = record_transitions(&outbound);

        let (tx, mut rx) = mpsc::unbounded_channel();
        inbound.accept_stream_loop(move |stream| {
            let _ = tx.send(stream);
        });
        outbound.accept_stream_loop(|_| {});

        let mut stream = outbound.new_stream().await.unwrap();
        let _accepted = rx.recv().await.unwrap();
        stream.write_all(&[0u8; 32]).await.unwrap();

        tokio::time::sleep(Duration::from_millis(80)).await;

        assert_eq!(outbound.state(), CircuitState::Closed);
        assert!(reasons(&transitions).contains(&"quota_exhausted".to_string()));
    }

    #[tokio::test]
    async fn test_deadline_closes_circuit() {
        let config = CircuitConfig {
            deadline: Some(Duration::from_millis(60)),
            idle_timeout: Duration::from_secs(10),
            ..fast_config()
        };
        let (outbound, _inbound) = circuit_pair(config);
        let transitions = record_transitions(&outbound);
        outbound.accept_stream_loop(|_| {});

        tokio::time::sleep(Duration::from_millis(150)).await;

        assert_eq!(outbound.state(), CircuitState::Closed);
        assert!(reasons(&transitions).contains(&"deadline_exceeded".to_string()));
    }

    #[tokio::test]
    async fn test_missing_pongs_close_circuit() {
        let config = CircuitConfig {
            keep_alive_interval: Duration::from_millis(25),
            idle_timeout: Duration::from_secs(10),
            pong_timeout: Duration::from_millis(80),
            max_bytes: 0,
            deadline: None,
            control_enabled: true,
        };
        // No responder circuit: pings are queued but never answered.
        let (a, _b) = MemoryMuxer::pair();
        let outbound = RelayCircuit::new(
            Box::new(a),
            test_peer_id(1),
            test_peer_id(2),
            test_peer_id(9),
            Direction::Outbound,
            config,
        );
        let transitions = record_transitions(&outbound);
        outbound.accept_stream_loop(|_| {});

        tokio::time::sleep(Duration::from_millis(250)).await;

        assert_eq!(outbound.state(), CircuitState::Closed);
        assert!(reasons(&transitions).contains(&"heartbeat_timeout".to_string()));
    }

    #[tokio::test]
    async fn test_heartbeat_outranks_quota_when_both_expire() {
        let config = CircuitConfig {
            // One immediate tick, then a single tick at ~120ms by which
            // point the pong is stale and the quota is blown.
            keep_alive_interval: Duration::from_millis(120),
            idle_timeout: Duration::from_secs(10),
            pong_timeout: Duration::from_millis(60),
            max_bytes: 16,
            deadline: None,
            control_enabled: true,
        };
        let (a, _b) = MemoryMuxer::pair();
        let outbound = RelayCircuit::new(
            Box::new(a),
            test_peer_id(1),
            test_peer_id(2),
            test_peer_id(9),
            Direction::Outbound,
            config,
        );
        let transitions = record_transitions(&outbound);
        outbound.accept_stream_loop(|_| {});

        // Blow the quota after the immediate first tick; by the next tick
        // the pong is also stale.
        tokio::time::sleep(Duration::from_millis(30)).await;
        let mut stream = outbound.new_stream().await.unwrap();
        stream.write_all(&[0u8; 32]).await.unwrap();
        assert!(outbound.bytes_used() >= 32);

        tokio::time::sleep(Duration::from_millis(300)).await;

        assert_eq!(outbound.state(), CircuitState::Closed);
        let close_reason = transitions
            .lock()
            .iter()
            .find(|(_, new, _)| new.is_closed())
            .map(|(_, _, reason)| reason.clone());
        assert_eq!(close_reason.as_deref(), Some("heartbeat_timeout"));
    }

    #[tokio::test]
    async fn test_stream_ids_snapshot() {
        let (outbound, inbound) = circuit_pair(fast_config());
        let (tx, mut rx) = mpsc::unbounded_channel();
        inbound.accept_stream_loop(move |stream| {
            let _ = tx.send(stream);
        });
        outbound.accept_stream_loop(|_| {});

        let s1 = outbound.new_stream().await.unwrap();
        let s2 = outbound.new_stream().await.unwrap();
        let _a1 = rx.recv().await.unwrap();
        let _a2 = rx.recv().await.unwrap();

        let ids = outbound.streams();
        assert!(ids.contains(&s1.id()));
        assert!(ids.contains(&s2.id()));
        assert_eq!(ids.len(), 2);
    }
}
