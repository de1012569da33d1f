//! Stream and multiplexer abstractions.
//!
//! The relay circuit multiplexes logical streams over a single framed stream
//! through a relay node. Negotiating the multiplexer on the base stream is a
//! transport concern; the core only consumes the negotiated handle through
//! [`StreamMuxer`].

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

/// A bidirectional byte stream as produced by a transport or a multiplexer.
pub trait CoreStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> CoreStream for T {}

/// Boxed stream handed across subsystem boundaries.
pub type DynStream = Box<dyn CoreStream>;

/// Errors from a stream multiplexer.
#[derive(Debug, thiserror::Error)]
pub enum MuxerError {
    #[error("muxer is closed")]
    Closed,

    #[error("i/o: {0}")]
    Io(#[from] std::io::Error),
}

/// A negotiated stream multiplexer over a single base stream.
///
/// Open and accept are independent directions; both must fail with
/// [`MuxerError::Closed`] once [`StreamMuxer::close`] has completed.
#[async_trait]
pub trait StreamMuxer: Send + Sync {
    /// Open a new outbound logical stream.
    async fn open_stream(&self) -> Result<DynStream, MuxerError>;

    /// Wait for the next inbound logical stream.
    async fn accept_stream(&self) -> Result<DynStream, MuxerError>;

    /// Close the multiplexer and the base stream beneath it.
    async fn close(&self) -> Result<(), MuxerError>;

    fn is_closed(&self) -> bool;
}
