//! Reliable control channel messages
//!
//! Two kinds of payload share the reliable channel: recording-state tokens
//! and whole clips. On the wire each message is an envelope:
//!
//! ```text
//! ┌──────────┬──────────────────┬───────────────┐
//! │   tag    │  length (u32 BE) │    payload    │
//! │ (1 byte) │    (4 bytes)     │    (var)      │
//! └──────────┴──────────────────┴───────────────┘
//! ```
//!
//! State payloads are the UTF-8 state literal. Peers that cannot send a tag
//! use [`EnvelopeMode::Legacy`]: messages are only length-prefixed and the
//! type is inferred from content (a known state literal is a state, anything
//! else is a clip).

use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::peer::PeerId;
use crate::protocol::MAX_CONTROL_PAYLOAD_SIZE;
use crate::recording::RecordingState;
use crate::{Error, Result};

const TAG_STATE: u8 = 0x01;
const TAG_CLIP: u8 = 0x02;

/// How control messages are framed on the reliable channel
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum EnvelopeMode {
    /// Explicit type tag + length + payload
    #[default]
    Tagged,
    /// Length + payload, type inferred from content
    Legacy,
}

/// A message on the reliable control channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage {
    /// The sender's new recording state
    State(RecordingState),
    /// A complete finished recording
    Clip(Bytes),
}

impl ControlMessage {
    /// Content-shape rule: a payload that decodes as one of the three state
    /// literals is a state message, anything else is clip bytes.
    pub fn classify(payload: Bytes) -> Self {
        match RecordingState::from_wire(&payload) {
            Some(state) => ControlMessage::State(state),
            None => ControlMessage::Clip(payload),
        }
    }

    /// Message body without framing
    pub fn payload(&self) -> Bytes {
        match self {
            ControlMessage::State(state) => Bytes::from_static(state.as_str().as_bytes()),
            ControlMessage::Clip(bytes) => bytes.clone(),
        }
    }

    fn tag(&self) -> u8 {
        match self {
            ControlMessage::State(_) => TAG_STATE,
            ControlMessage::Clip(_) => TAG_CLIP,
        }
    }

    /// Encode with framing for `mode`
    pub fn encode(&self, mode: EnvelopeMode) -> Result<Bytes> {
        let payload = self.payload();
        if payload.len() > MAX_CONTROL_PAYLOAD_SIZE {
            return Err(Error::send_failed(format!(
                "Control message too large: {} > {}",
                payload.len(),
                MAX_CONTROL_PAYLOAD_SIZE
            )));
        }

        let mut buf = BytesMut::with_capacity(payload.len() + 5);
        if mode == EnvelopeMode::Tagged {
            buf.put_u8(self.tag());
        }
        buf.put_u32(payload.len() as u32);
        buf.put_slice(&payload);
        Ok(buf.freeze())
    }

    /// Decode a tagged body (tag already split off)
    fn from_tagged(tag: u8, payload: Bytes) -> Result<Self> {
        match tag {
            TAG_STATE => RecordingState::from_wire(&payload)
                .map(ControlMessage::State)
                .ok_or_else(|| {
                    Error::protocol(format!(
                        "Unknown state literal: {:?}",
                        String::from_utf8_lossy(&payload)
                    ))
                }),
            TAG_CLIP => Ok(ControlMessage::Clip(payload)),
            other => Err(Error::protocol(format!("Unknown control tag: {:#04x}", other))),
        }
    }
}

/// Write one control message to an async writer
pub async fn write_control<W: AsyncWrite + Unpin>(
    writer: &mut W,
    msg: &ControlMessage,
    mode: EnvelopeMode,
) -> Result<()> {
    let bytes = msg.encode(mode)?;
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one control message from an async reader.
///
/// Returns `Ok(None)` on a clean end of stream before a new message starts.
pub async fn read_control<R: AsyncRead + Unpin>(
    reader: &mut R,
    mode: EnvelopeMode,
) -> Result<Option<ControlMessage>> {
    let tag = match mode {
        EnvelopeMode::Tagged => match reader.read_u8().await {
            Ok(tag) => Some(tag),
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        },
        EnvelopeMode::Legacy => None,
    };

    let len = match reader.read_u32().await {
        Ok(len) => len as usize,
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof && tag.is_none() => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    if len > MAX_CONTROL_PAYLOAD_SIZE {
        return Err(Error::protocol(format!(
            "Control message too large: {} > {}",
            len, MAX_CONTROL_PAYLOAD_SIZE
        )));
    }

    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await.map_err(|e| {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            Error::transfer_incomplete(format!("stream ended inside a {} byte message", len))
        } else {
            e.into()
        }
    })?;
    let payload = Bytes::from(buf);

    match tag {
        Some(tag) => ControlMessage::from_tagged(tag, payload).map(Some),
        None => Ok(Some(ControlMessage::classify(payload))),
    }
}

/// Anything that can deliver control messages reliably to peers.
#[async_trait]
pub trait ControlSender: Send + Sync {
    /// Deliver `message` to every peer in `to`.
    ///
    /// Fails with [`Error::SendFailed`] if any peer cannot be reached or
    /// `to` is empty.
    async fn send_control(&self, message: &ControlMessage, to: &[PeerId]) -> Result<()>;

    /// Peers currently connected
    async fn connected_peers(&self) -> Vec<PeerId>;
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_known_literals_as_state() {
        assert_eq!(
            ControlMessage::classify(Bytes::from_static(b"finishedRecording")),
            ControlMessage::State(RecordingState::Finished)
        );
        assert_eq!(
            ControlMessage::classify(Bytes::from_static(b"notRecording")),
            ControlMessage::State(RecordingState::NotRecording)
        );
    }

    #[test]
    fn classify_everything_else_as_clip() {
        let bytes = Bytes::from(vec![0x42; 500]);
        assert_eq!(
            ControlMessage::classify(bytes.clone()),
            ControlMessage::Clip(bytes)
        );
        // Case matters
        assert!(matches!(
            ControlMessage::classify(Bytes::from_static(b"IsRecording")),
            ControlMessage::Clip(_)
        ));
    }

    #[test]
    fn tagged_encoding_layout() {
        let bytes = ControlMessage::State(RecordingState::Recording)
            .encode(EnvelopeMode::Tagged)
            .unwrap();
        assert_eq!(bytes[0], TAG_STATE);
        assert_eq!(&bytes[1..5], &11u32.to_be_bytes());
        assert_eq!(&bytes[5..], b"isRecording");
    }

    #[test]
    fn legacy_encoding_has_no_tag() {
        let bytes = ControlMessage::Clip(Bytes::from_static(b"abc"))
            .encode(EnvelopeMode::Legacy)
            .unwrap();
        assert_eq!(bytes.as_ref(), &[0, 0, 0, 3, b'a', b'b', b'c']);
    }

    #[tokio::test]
    async fn tagged_clip_that_looks_like_a_state_stays_a_clip() {
        // The envelope removes the content-shape ambiguity
        let msg = ControlMessage::Clip(Bytes::from_static(b"isRecording"));
        let mut buf = Vec::new();
        write_control(&mut buf, &msg, EnvelopeMode::Tagged).await.unwrap();

        let mut cursor = std::io::Cursor::new(buf);
        let decoded = read_control(&mut cursor, EnvelopeMode::Tagged)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(decoded, msg);
    }

    #[tokio::test]
    async fn legacy_stream_infers_type() {
        let mut buf = Vec::new();
        write_control(
            &mut buf,
            &ControlMessage::State(RecordingState::Finished),
            EnvelopeMode::Legacy,
        )
        .await
        .unwrap();
        write_control(
            &mut buf,
            &ControlMessage::Clip(Bytes::from_static(&[1, 2, 3])),
            EnvelopeMode::Legacy,
        )
        .await
        .unwrap();

        let mut cursor = std::io::Cursor::new(buf);
        let first = read_control(&mut cursor, EnvelopeMode::Legacy).await.unwrap();
        let second = read_control(&mut cursor, EnvelopeMode::Legacy).await.unwrap();
        let end = read_control(&mut cursor, EnvelopeMode::Legacy).await.unwrap();

        assert_eq!(first, Some(ControlMessage::State(RecordingState::Finished)));
        assert_eq!(
            second,
            Some(ControlMessage::Clip(Bytes::from_static(&[1, 2, 3])))
        );
        assert_eq!(end, None);
    }

    #[tokio::test]
    async fn unknown_tag_is_protocol_error() {
        let mut cursor = std::io::Cursor::new(vec![0x7f, 0, 0, 0, 0]);
        let err = read_control(&mut cursor, EnvelopeMode::Tagged)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }

    #[tokio::test]
    async fn truncated_clip_is_transfer_incomplete() {
        let mut bytes = ControlMessage::Clip(Bytes::from(vec![9u8; 64]))
            .encode(EnvelopeMode::Tagged)
            .unwrap()
            .to_vec();
        bytes.truncate(30);

        let mut cursor = std::io::Cursor::new(bytes);
        let err = read_control(&mut cursor, EnvelopeMode::Tagged)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::TransferIncomplete(_)));
    }

    #[tokio::test]
    async fn oversized_length_is_rejected_before_allocating() {
        let mut bytes = vec![TAG_CLIP];
        bytes.extend_from_slice(&u32::MAX.to_be_bytes());
        let mut cursor = std::io::Cursor::new(bytes);
        let err = read_control(&mut cursor, EnvelopeMode::Tagged)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }
}
