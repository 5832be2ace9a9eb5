//! Control messages between the two halves of the builtin driver.
//!
//! Same framing as the handshake pipe (u32 LE length + bounded JSON), but
//! carried over the control socket, asynchronously. A `Begin` frame is
//! always accompanied by exactly one SCM_RIGHTS descriptor on the stream;
//! `Drain` carries none.

use crate::{errors::PortError, message::MAX_FRAME_LEN};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum CtrlMessage {
    /// Start forwarding one connection (or one UDP flow) to `(ip, port)`.
    /// The descriptor to shovel is attached to the frame.
    Begin {
        id: u64,
        proto: String,
        ip: String,
        port: u16,
    },
    /// No more `Begin` frames will follow; finish in-flight forwarders.
    Drain,
}

pub async fn send_ctrl<W: AsyncWrite + Unpin>(
    writer: &mut W,
    msg: &CtrlMessage,
) -> Result<(), PortError> {
    let body = serde_json::to_vec(msg)?;
    if body.is_empty() || body.len() > MAX_FRAME_LEN as usize {
        return Err(PortError::Helper(format!(
            "control frame length {} out of bounds",
            body.len()
        )));
    }
    writer.write_all(&(body.len() as u32).to_le_bytes()).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one control frame; `None` on a clean EOF at a frame boundary.
pub async fn recv_ctrl<R: AsyncRead + Unpin>(
    reader: &mut R,
) -> Result<Option<CtrlMessage>, PortError> {
    let mut header = [0u8; 4];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err.into()),
    }
    let len = u32::from_le_bytes(header);
    if len == 0 || len > MAX_FRAME_LEN {
        return Err(PortError::Helper(format!(
            "control frame length {} out of bounds",
            len
        )));
    }
    let mut body = vec![0u8; len as usize];
    reader.read_exact(&mut body).await?;
    Ok(Some(serde_json::from_slice(&body)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn ctrl_roundtrip() {
        tokio::runtime::Runtime::new().unwrap().block_on(async {
            let mut buf = Cursor::new(Vec::new());
            let begin = CtrlMessage::Begin {
                id: 7,
                proto: "tcp".to_string(),
                ip: "127.0.0.1".to_string(),
                port: 80,
            };
            send_ctrl(&mut buf, &begin).await.unwrap();
            send_ctrl(&mut buf, &CtrlMessage::Drain).await.unwrap();

            let mut cursor = Cursor::new(buf.into_inner());
            assert_eq!(recv_ctrl(&mut cursor).await.unwrap(), Some(begin));
            assert_eq!(
                recv_ctrl(&mut cursor).await.unwrap(),
                Some(CtrlMessage::Drain)
            );
            assert_eq!(recv_ctrl(&mut cursor).await.unwrap(), None);
        });
    }
}
