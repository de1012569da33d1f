//! Keep-alive: one-byte ping/pong control channel plus periodic health
//! checks driving the circuit state machine.

use std::sync::Arc;
use std::sync::atomic::Ordering;

use strand_api::{CircuitState, DynStream, unix_millis};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{trace, warn};

use crate::circuit::{
    CircuitInner, Direction, REASON_DEADLINE_EXCEEDED, REASON_HEARTBEAT_TIMEOUT,
    REASON_IDLE_TIMEOUT, REASON_QUOTA_EXHAUSTED, REASON_STALE_TIMEOUT, REASON_TRANSPORT_FAILED,
};

const PING: u8 = 1;
const PONG: u8 = 2;

/// Start the keep-alive task once. The initiator opens the control stream;
/// the responder adopts the first inbound stream via the accept loop.
pub(crate) fn start(inner: &Arc<CircuitInner>) {
    if inner.keepalive_started.swap(true, Ordering::SeqCst) {
        return;
    }

    let inner = Arc::clone(inner);
    tokio::spawn(async move {
        if inner.config.control_enabled && inner.direction == Direction::Outbound {
            match inner.muxer.open_stream().await {
                Ok(io) => adopt_control_stream(&inner, io).await,
                Err(error) => {
                    warn!(remote = %inner.remote_peer, %error, "control stream open failed");
                    inner.close_with_reason(REASON_TRANSPORT_FAILED).await;
                    return;
                }
            }
        }

        let mut ticker = tokio::time::interval(inner.config.keep_alive_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut done = inner.done_rx();

        loop {
            tokio::select! {
                _ = done.changed() => break,
                _ = ticker.tick() => {
                    send_ping(&inner).await;
                    if check_health(&inner).await {
                        break;
                    }
                }
            }
        }
    });
}

/// Install `io` as the control channel and spawn its reader.
pub(crate) async fn adopt_control_stream(inner: &Arc<CircuitInner>, io: DynStream) {
    let (mut reader, writer) = tokio::io::split(io);
    inner.control_writer.lock().await.replace(writer);
    inner.mark_control_ready();
    trace!(remote = %inner.remote_peer, "control channel ready");

    let inner = Arc::clone(inner);
    tokio::spawn(async move {
        let mut done = inner.done_rx();
        loop {
            let mut byte = [0u8; 1];
            let read = tokio::select! {
                _ = done.changed() => break,
                read = reader.read_exact(&mut byte) => read,
            };
            if read.is_err() {
                break;
            }
            match byte[0] {
                PING => {
                    let mut writer = inner.control_writer.lock().await;
                    if let Some(writer) = writer.as_mut() {
                        let _ = writer.write_all(&[PONG]).await;
                    }
                }
                PONG => {
                    inner.last_pong.store(unix_millis(), Ordering::Relaxed);
                }
                other => {
                    trace!(byte = other, "ignoring unknown control message");
                }
            }
        }
    });
}

async fn send_ping(inner: &Arc<CircuitInner>) {
    if !inner.config.control_enabled {
        return;
    }
    let mut writer = inner.control_writer.lock().await;
    if let Some(writer) = writer.as_mut() {
        if let Err(error) = writer.write_all(&[PING]).await {
            warn!(remote = %inner.remote_peer, %error, "keep-alive ping failed");
        }
    }
}

/// Evaluate heartbeat, quota, deadline and idleness, in that order of
/// precedence. Returns `true` once the circuit has been closed.
async fn check_health(inner: &Arc<CircuitInner>) -> bool {
    let now = unix_millis();

    if inner.config.control_enabled {
        let last_pong = inner.last_pong.load(Ordering::Relaxed);
        if now.saturating_sub(last_pong) > inner.config.pong_timeout.as_millis() as u64 {
            inner.close_with_reason(REASON_HEARTBEAT_TIMEOUT).await;
            return true;
        }
    }

    if inner.config.max_bytes > 0
        && inner.bytes_used.load(Ordering::Relaxed) >= inner.config.max_bytes
    {
        inner.close_with_reason(REASON_QUOTA_EXHAUSTED).await;
        return true;
    }

    if let Some(deadline) = inner.config.deadline {
        if now.saturating_sub(inner.created_at) > deadline.as_millis() as u64 {
            inner.close_with_reason(REASON_DEADLINE_EXCEEDED).await;
            return true;
        }
    }

    let idle_millis = now.saturating_sub(inner.last_activity());
    let idle_timeout = inner.config.idle_timeout.as_millis() as u64;
    match inner.state() {
        CircuitState::Active if idle_millis > idle_timeout => {
            inner.transition(CircuitState::Stale, REASON_IDLE_TIMEOUT);
        }
        CircuitState::Stale if idle_millis > 2 * idle_timeout => {
            inner.close_with_reason(REASON_STALE_TIMEOUT).await;
            return true;
        }
        _ => {}
    }

    false
}
