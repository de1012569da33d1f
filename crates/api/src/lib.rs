//! Collaborator interfaces consumed by the strand overlay-runtime core.
//!
//! The core subsystems (bandwidth accounting, autorelay, relay circuits,
//! connection upgrade, bootstrap, dnsaddr discovery) never talk to a concrete
//! transport or identity layer. Everything below them is reached through the
//! traits in this crate, which keeps the subsystems testable against
//! in-memory implementations.

mod endpoint;
mod events;
mod host;
mod peer;
mod punch;
mod relay;
mod stream;
mod time;

pub use endpoint::{ConnectionEvent, ConnectionEventKind, Endpoint};
pub use events::{CircuitState, CoreEvent, CoreEventBus};
pub use host::{Host, HostError, Peerstore, ProtocolId, StreamHandler};
pub use peer::PeerInfo;
pub use punch::{HolePuncher, PunchError};
pub use relay::{RelayClient, Reservation, ReserveError};
pub use stream::{CoreStream, DynStream, MuxerError, StreamMuxer};
pub use time::{unix_millis, unix_secs};
