//! Upgrade errors.
//!
//! The error type is `Clone` so that every caller sharing an upgrade
//! session can receive the same outcome.

use strand_api::PunchError;

#[derive(Debug, Clone, thiserror::Error)]
pub enum UpgradeError {
    #[error("no hole puncher configured")]
    NoPuncher,

    /// One of the two sides produced zero candidate addresses.
    #[error("no candidate addresses")]
    NoAddresses,

    #[error("remote sent {0} addresses, over the cap")]
    TooManyAddresses(u16),

    #[error("unexpected message type {0}")]
    UnexpectedMessageType(u8),

    #[error("malformed address: {0}")]
    InvalidAddress(String),

    #[error("address exchange failed: {0}")]
    Exchange(String),

    #[error("address exchange timed out")]
    ExchangeTimeout,

    #[error("hole punch failed: {0}")]
    Punch(#[from] PunchError),

    #[error("hole punch timed out")]
    PunchTimeout,

    #[error("circuit unavailable: {0}")]
    Circuit(String),
}

impl From<std::io::Error> for UpgradeError {
    fn from(error: std::io::Error) -> Self {
        Self::Exchange(error.to_string())
    }
}
