//! Session handshake
//!
//! The dialing side opens the first bidirectional stream and writes its
//! [`Hello`]; the accepting side checks it and answers with its own. The
//! same stream then carries control messages for the rest of the
//! connection.
//!
//! Wire format: `[u32 BE length][MessagePack Hello]`.

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::peer::Role;
use crate::protocol::MAX_HELLO_SIZE;
use crate::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hello {
    /// Service identifier; peers of another service are rejected
    pub service: String,
    pub display_name: String,
    pub role: Role,
}

impl Hello {
    /// Reject a remote hello announcing a different service
    pub fn check_service(&self, expected: &str) -> Result<()> {
        if self.service != expected {
            return Err(Error::protocol(format!(
                "service mismatch: expected {:?}, peer announced {:?}",
                expected, self.service
            )));
        }
        Ok(())
    }
}

pub async fn write_hello<W: AsyncWrite + Unpin>(writer: &mut W, hello: &Hello) -> Result<()> {
    let bytes = rmp_serde::to_vec_named(hello)?;
    if bytes.len() > MAX_HELLO_SIZE {
        return Err(Error::protocol(format!(
            "Hello too large: {} > {}",
            bytes.len(),
            MAX_HELLO_SIZE
        )));
    }
    writer.write_u32(bytes.len() as u32).await?;
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}

pub async fn read_hello<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Hello> {
    let len = reader.read_u32().await? as usize;
    if len > MAX_HELLO_SIZE {
        return Err(Error::protocol(format!(
            "Hello too large: {} > {}",
            len, MAX_HELLO_SIZE
        )));
    }
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;
    Ok(rmp_serde::from_slice(&buf)?)
}
