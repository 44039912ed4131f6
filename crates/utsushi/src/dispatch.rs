//! Routing of inbound control messages
//!
//! A state token overwrites the local recording state. A clip is stored and
//! played on the host, which then advances its own state one step and
//! mirrors it back (normally `finishedRecording → notRecording`). A
//! streamer never expects clips and ignores them.

use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::control::{ControlMessage, ControlSender};
use crate::peer::{PeerId, Role};
use crate::recording::{RecordingSync, Transition};
use crate::storage::ClipTransferManager;
use crate::Result;

/// What a dispatched message caused
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dispatched {
    /// Remote state applied locally
    State(Transition),
    /// Clip stored and handed to playback. `transition` is the follow-up
    /// state advance, `None` if mirroring it failed.
    Clip {
        path: PathBuf,
        transition: Option<Transition>,
    },
    /// Message has no meaning for this role
    Ignored,
}

pub struct InboundDispatcher<S> {
    role: Role,
    sync: Arc<RecordingSync<S>>,
    transfer: Arc<ClipTransferManager<S>>,
}

impl<S: ControlSender> InboundDispatcher<S> {
    pub fn new(
        role: Role,
        sync: Arc<RecordingSync<S>>,
        transfer: Arc<ClipTransferManager<S>>,
    ) -> Self {
        Self {
            role,
            sync,
            transfer,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub async fn dispatch(&self, from: PeerId, message: ControlMessage) -> Result<Dispatched> {
        match message {
            ControlMessage::State(state) => {
                debug!(peer = %from.fmt_short(), %state, "State message");
                Ok(Dispatched::State(self.sync.apply_remote(state)))
            }
            ControlMessage::Clip(bytes) if self.role == Role::Host => {
                info!(peer = %from.fmt_short(), bytes = bytes.len(), "Clip received");
                let path = self.transfer.on_receive(bytes).await?;

                let transition = match self.sync.toggle().await {
                    Ok(t) => Some(t),
                    Err(e) => {
                        warn!("State advance after clip receipt not mirrored: {}", e);
                        None
                    }
                };
                Ok(Dispatched::Clip { path, transition })
            }
            ControlMessage::Clip(bytes) => {
                debug!(peer = %from.fmt_short(), bytes = bytes.len(), role = %self.role, "Ignoring clip");
                Ok(Dispatched::Ignored)
            }
        }
    }
}
