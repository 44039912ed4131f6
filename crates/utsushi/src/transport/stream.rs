//! Named continuous byte streams
//!
//! Each named stream is one QUIC unidirectional stream. The opener writes a
//! `[u16 BE length][UTF-8 name]` header; everything after it is raw bytes
//! with no framing.

use bytes::Bytes;
use iroh::endpoint::{RecvStream, SendStream};
use std::fmt;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;

use crate::peer::PeerId;
use crate::protocol::{MAX_STREAM_NAME_LEN, PREVIEW_READ_CHUNK};
use crate::{Error, Result};

pub(crate) async fn write_stream_name<W: AsyncWrite + Unpin>(
    writer: &mut W,
    name: &str,
) -> Result<()> {
    if name.is_empty() || name.len() > MAX_STREAM_NAME_LEN {
        return Err(Error::protocol(format!(
            "Invalid stream name length: {}",
            name.len()
        )));
    }
    writer.write_u16(name.len() as u16).await?;
    writer.write_all(name.as_bytes()).await?;
    Ok(())
}

pub(crate) async fn read_stream_name<R: AsyncRead + Unpin>(reader: &mut R) -> Result<String> {
    let len = reader.read_u16().await? as usize;
    if len == 0 || len > MAX_STREAM_NAME_LEN {
        return Err(Error::protocol(format!("Invalid stream name length: {}", len)));
    }
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;
    String::from_utf8(buf).map_err(|_| Error::protocol("Stream name is not UTF-8"))
}

/// Sending half of a named stream
pub struct OutboundStream {
    name: String,
    to: PeerId,
    send: Mutex<SendStream>,
}

impl OutboundStream {
    pub(crate) fn new(name: String, to: PeerId, send: SendStream) -> Self {
        Self {
            name,
            to,
            send: Mutex::new(send),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn peer(&self) -> PeerId {
        self.to
    }

    /// Write raw bytes; the receiver sees them without message boundaries
    pub async fn write(&self, bytes: &[u8]) -> Result<()> {
        let mut send = self.send.lock().await;
        send.write_all(bytes)
            .await
            .map_err(|e| Error::send_failed(format!("stream {:?}: {}", self.name, e)))
    }

    /// Finish the stream (no more bytes will be written)
    pub async fn finish(self) -> Result<()> {
        let mut send = self.send.into_inner();
        send.finish()
            .map_err(|e| Error::send_failed(format!("stream {:?}: {}", self.name, e)))
    }
}

/// Receiving half of a named stream
pub struct InboundStream {
    name: String,
    from: PeerId,
    recv: RecvStream,
    buf: Vec<u8>,
}

impl fmt::Debug for InboundStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InboundStream")
            .field("name", &self.name)
            .field("from", &self.from)
            .finish()
    }
}

impl InboundStream {
    pub(crate) fn new(name: String, from: PeerId, recv: RecvStream) -> Self {
        Self {
            name,
            from,
            recv,
            buf: vec![0u8; PREVIEW_READ_CHUNK],
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn peer(&self) -> PeerId {
        self.from
    }

    /// Read whatever is available, at most 32 KiB. `None` at end of stream.
    pub async fn read_chunk(&mut self) -> Result<Option<Bytes>> {
        let n = AsyncReadExt::read(&mut self.recv, &mut self.buf).await?;
        if n == 0 {
            return Ok(None);
        }
        Ok(Some(Bytes::copy_from_slice(&self.buf[..n])))
    }
}
