//! Core event bus: non-blocking broadcast of subsystem events.

use libp2p::PeerId;
use tokio::sync::broadcast;

/// Relay circuit lifecycle state (stored as u8 for atomic operations).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CircuitState {
    Creating = 0,
    Active = 1,
    Stale = 2,
    Closed = 3,
}

impl CircuitState {
    pub fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Creating,
            1 => Self::Active,
            2 => Self::Stale,
            _ => Self::Closed,
        }
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, CircuitState::Closed)
    }
}

/// Events emitted by the core subsystems.
#[derive(Debug, Clone)]
pub enum CoreEvent {
    CircuitStateChanged {
        remote: PeerId,
        relay: PeerId,
        old_state: CircuitState,
        new_state: CircuitState,
        reason: String,
    },
    RelayRegistrationFailed {
        relay: PeerId,
        error: String,
    },
}

const DEFAULT_CHANNEL_CAPACITY: usize = 256;

/// Non-blocking broadcast bus. Emission never waits on subscribers.
#[derive(Debug, Clone)]
pub struct CoreEventBus {
    tx: broadcast::Sender<CoreEvent>,
}

impl Default for CoreEventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CHANNEL_CAPACITY)
    }
}

impl CoreEventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn emit(&self, event: CoreEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CoreEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}
