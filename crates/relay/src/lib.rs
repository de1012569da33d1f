//! Relay circuits: a multi-stream connection abstraction over a single
//! stream through a relay node.
//!
//! A circuit layers a stream multiplexer over the relayed base stream and
//! tracks liveness with a one-byte ping/pong control channel. Circuits that
//! go quiet become `Stale`, recover on any traffic, and are torn down when
//! provably dead or over quota.

mod circuit;
mod config;
mod error;
mod keepalive;
mod stream;

pub use circuit::{Direction, RelayCircuit, StateChangeCallback};
pub use config::CircuitConfig;
pub use error::CircuitError;
pub use stream::CircuitStream;

pub use strand_api::CircuitState;
