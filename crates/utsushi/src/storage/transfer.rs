//! Whole-clip transfer over the reliable channel
//!
//! A clip travels as one control message: no chunking, no resume. A failed
//! send means the whole clip has to be sent again.

use bytes::Bytes;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

use super::{ClipStore, PlaybackSink};
use crate::control::{ControlMessage, ControlSender};
use crate::peer::PeerId;
use crate::{Error, Result};

pub struct ClipTransferManager<S> {
    store: ClipStore,
    sender: Arc<S>,
    playback: Arc<dyn PlaybackSink>,
}

impl<S: ControlSender> ClipTransferManager<S> {
    pub fn new(store: ClipStore, sender: Arc<S>, playback: Arc<dyn PlaybackSink>) -> Self {
        Self {
            store,
            sender,
            playback,
        }
    }

    pub fn store(&self) -> &ClipStore {
        &self.store
    }

    /// Send `clip` to `to` in a single reliable message
    pub async fn send(&self, clip: Bytes, to: PeerId) -> Result<()> {
        let len = clip.len();
        info!(peer = %to.fmt_short(), bytes = len, "Sending clip");

        self.sender
            .send_control(&ControlMessage::Clip(clip), &[to])
            .await
            .map_err(|e| {
                warn!(peer = %to.fmt_short(), bytes = len, "Clip transfer failed: {}", e);
                match e {
                    Error::TransferIncomplete(_) => e,
                    other => Error::transfer_incomplete(other.to_string()),
                }
            })?;

        info!(peer = %to.fmt_short(), bytes = len, "Clip sent");
        Ok(())
    }

    /// Read the stored clip and send it; returns the clip size
    pub async fn send_stored(&self, to: PeerId) -> Result<usize> {
        let clip = self.store.read().await?;
        let len = clip.len();
        self.send(clip, to).await?;
        Ok(len)
    }

    /// Replace the stored clip with received bytes, then hand it to playback.
    ///
    /// A playback failure is logged; the clip stays stored.
    pub async fn on_receive(&self, bytes: Bytes) -> Result<PathBuf> {
        self.store.replace(&bytes).await?;
        let path = self.store.path().to_path_buf();

        if let Err(e) = self.playback.play(&path).await {
            warn!(path = %path.display(), "Playback failed: {}", e);
        }
        Ok(path)
    }
}
