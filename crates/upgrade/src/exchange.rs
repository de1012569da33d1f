//! Address-exchange wire format.
//!
//! Single message: `[type=1 u8][count u16 BE][(len u16 BE, addr bytes)…]`.
//! Any other message type is a protocol error, and the address count is
//! capped to bound allocation on the receiving side.

use bytes::{BufMut, BytesMut};
use libp2p::Multiaddr;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::UpgradeError;

const MSG_ADDR_EXCHANGE: u8 = 1;

/// Write the full candidate-address message to `writer`.
pub(crate) async fn send_addrs<W>(writer: &mut W, addrs: &[Multiaddr]) -> Result<(), UpgradeError>
where
    W: AsyncWrite + Unpin,
{
    let mut buf = BytesMut::new();
    buf.put_u8(MSG_ADDR_EXCHANGE);
    buf.put_u16(addrs.len() as u16);
    for addr in addrs {
        let bytes = addr.to_vec();
        buf.put_u16(bytes.len() as u16);
        buf.put_slice(&bytes);
    }
    writer.write_all(&buf).await?;
    writer.flush().await?;
    Ok(())
}

/// Read the symmetric message, rejecting counts over `max_addrs`.
pub(crate) async fn recv_addrs<R>(
    reader: &mut R,
    max_addrs: usize,
) -> Result<Vec<Multiaddr>, UpgradeError>
where
    R: AsyncRead + Unpin,
{
    let msg_type = reader.read_u8().await?;
    if msg_type != MSG_ADDR_EXCHANGE {
        return Err(UpgradeError::UnexpectedMessageType(msg_type));
    }

    let count = reader.read_u16().await?;
    if count as usize > max_addrs {
        return Err(UpgradeError::TooManyAddresses(count));
    }

    let mut addrs = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let len = reader.read_u16().await?;
        let mut bytes = vec![0u8; len as usize];
        reader.read_exact(&mut bytes).await?;
        let addr =
            Multiaddr::try_from(bytes).map_err(|e| UpgradeError::InvalidAddress(e.to_string()))?;
        addrs.push(addr);
    }
    Ok(addrs)
}
