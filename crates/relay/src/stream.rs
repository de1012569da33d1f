//! Logical stream wrapper: byte accounting and activity tracking.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use strand_api::DynStream;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::circuit::CircuitInner;

/// One logical stream on a relay circuit.
///
/// Every byte read or written is added to the circuit's quota counter and
/// refreshes its activity clock before the call returns. Dropping the
/// stream removes it from the circuit's live set.
pub struct CircuitStream {
    id: u64,
    io: DynStream,
    circuit: Arc<CircuitInner>,
}

impl CircuitStream {
    pub(crate) fn new(id: u64, io: DynStream, circuit: Arc<CircuitInner>) -> Self {
        Self { id, io, circuit }
    }

    pub fn id(&self) -> u64 {
        self.id
    }
}

impl AsyncRead for CircuitStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let before = buf.filled().len();
        match Pin::new(&mut self.io).poll_read(cx, buf) {
            Poll::Ready(Ok(())) => {
                let read = buf.filled().len().saturating_sub(before);
                if read > 0 {
                    self.circuit.record_activity(read as u64);
                }
                Poll::Ready(Ok(()))
            }
            other => other,
        }
    }
}

impl AsyncWrite for CircuitStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match Pin::new(&mut self.io).poll_write(cx, data) {
            Poll::Ready(Ok(written)) => {
                if written > 0 {
                    self.circuit.record_activity(written as u64);
                }
                Poll::Ready(Ok(written))
            }
            other => other,
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.io).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.io).poll_shutdown(cx)
    }
}

impl Drop for CircuitStream {
    fn drop(&mut self) {
        self.circuit.deregister_stream(self.id);
    }
}
