//! In-memory stream multiplexer: a pair of connected endpoints where opening
//! a stream on one side yields an acceptable stream on the other.

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use strand_api::{DynStream, MuxerError, StreamMuxer};
use tokio::sync::mpsc;

const STREAM_BUFFER_BYTES: usize = 64 * 1024;

/// One side of an in-memory muxed connection.
pub struct MemoryMuxer {
    outbound: parking_lot::Mutex<Option<mpsc::UnboundedSender<DynStream>>>,
    inbound: tokio::sync::Mutex<mpsc::UnboundedReceiver<DynStream>>,
    closed: AtomicBool,
}

impl MemoryMuxer {
    /// Create both ends of a muxed connection.
    pub fn pair() -> (Self, Self) {
        let (tx_a, rx_a) = mpsc::unbounded_channel();
        let (tx_b, rx_b) = mpsc::unbounded_channel();
        (
            Self {
                outbound: parking_lot::Mutex::new(Some(tx_b)),
                inbound: tokio::sync::Mutex::new(rx_a),
                closed: AtomicBool::new(false),
            },
            Self {
                outbound: parking_lot::Mutex::new(Some(tx_a)),
                inbound: tokio::sync::Mutex::new(rx_b),
                closed: AtomicBool::new(false),
            },
        )
    }
}

#[async_trait]
impl StreamMuxer for MemoryMuxer {
    async fn open_stream(&self) -> Result<DynStream, MuxerError> {
        if self.is_closed() {
            return Err(MuxerError::Closed);
        }
        let (local, remote) = tokio::io::duplex(STREAM_BUFFER_BYTES);
        let sent = self
            .outbound
            .lock()
            .as_ref()
            .map(|tx| tx.send(Box::new(remote) as DynStream).is_ok())
            .unwrap_or(false);
        if !sent {
            return Err(MuxerError::Closed);
        }
        Ok(Box::new(local))
    }

    async fn accept_stream(&self) -> Result<DynStream, MuxerError> {
        if self.is_closed() {
            return Err(MuxerError::Closed);
        }
        let mut inbound = self.inbound.lock().await;
        inbound.recv().await.ok_or(MuxerError::Closed)
    }

    async fn close(&self) -> Result<(), MuxerError> {
        self.closed.store(true, Ordering::SeqCst);
        // Dropping the sender wakes the peer's accept loop with `Closed`.
        self.outbound.lock().take();
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;

    #[tokio::test]
    async fn test_open_and_accept_are_connected() {
        let (a, b) = MemoryMuxer::pair();

        let mut out = a.open_stream().await.unwrap();
        let mut inbound = b.accept_stream().await.unwrap();

        out.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        inbound.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");
    }

    #[tokio::test]
    async fn test_close_fails_both_sides() {
        let (a, b) = MemoryMuxer::pair();
        a.close().await.unwrap();

        assert!(matches!(a.open_stream().await, Err(MuxerError::Closed)));
        assert!(matches!(b.accept_stream().await, Err(MuxerError::Closed)));
    }

    #[tokio::test]
    async fn test_streams_are_independent() {
        let (a, b) = MemoryMuxer::pair();

        let mut s1 = a.open_stream().await.unwrap();
        let mut s2 = a.open_stream().await.unwrap();
        let mut r1 = b.accept_stream().await.unwrap();
        let mut r2 = b.accept_stream().await.unwrap();

        s1.write_all(b"one").await.unwrap();
        s2.write_all(b"two").await.unwrap();

        let mut buf = [0u8; 3];
        r1.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"one");
        r2.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"two");
    }
}
