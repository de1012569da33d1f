//! Circuit errors.

use strand_api::MuxerError;

#[derive(Debug, thiserror::Error)]
pub enum CircuitError {
    /// The circuit is closed; no streams can be opened or accepted.
    #[error("circuit is not active")]
    NotActive,

    /// The circuit is draining ahead of a graceful close.
    #[error("circuit is draining")]
    Draining,

    #[error("control channel unavailable")]
    ControlUnavailable,

    #[error("muxer: {0}")]
    Muxer(#[from] MuxerError),
}
