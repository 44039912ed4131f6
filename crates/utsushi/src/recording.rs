//! Shared recording-state machine
//!
//! Both peers keep a local copy of the state. A local toggle advances one
//! step and is mirrored to the remote peer; a received state overwrites the
//! local copy (last write wins). If mirroring fails the local state is
//! forced back to `NotRecording`, so the initiating side never believes a
//! recording is running that the remote never heard about.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};

use crate::control::{ControlMessage, ControlSender};
use crate::peer::Role;
use crate::Result;

/// Recording lifecycle, cyclic: `NotRecording → Recording → Finished → NotRecording`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RecordingState {
    #[default]
    NotRecording,
    Recording,
    Finished,
}

impl RecordingState {
    /// Wire literal for this state
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordingState::NotRecording => "notRecording",
            RecordingState::Recording => "isRecording",
            RecordingState::Finished => "finishedRecording",
        }
    }

    /// The state a local toggle moves to
    pub fn next(&self) -> Self {
        match self {
            RecordingState::NotRecording => RecordingState::Recording,
            RecordingState::Recording => RecordingState::Finished,
            RecordingState::Finished => RecordingState::NotRecording,
        }
    }

    /// Decode a wire literal. Anything that is not exactly one of the three
    /// literals (including invalid UTF-8) is `None`.
    pub fn from_wire(bytes: &[u8]) -> Option<Self> {
        std::str::from_utf8(bytes).ok()?.parse().ok()
    }
}

impl fmt::Display for RecordingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RecordingState {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "notRecording" => Ok(RecordingState::NotRecording),
            "isRecording" => Ok(RecordingState::Recording),
            "finishedRecording" => Ok(RecordingState::Finished),
            other => Err(format!("unknown recording state: {:?}", other)),
        }
    }
}

/// Work collaborators perform when a state is entered
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateEffect {
    /// Start capture-to-file
    StartCapture,
    /// Stop capture; `send_clip` is set on the side that produced the file
    StopCapture { send_clip: bool },
    /// Drop any transient per-recording state
    ClearTransient,
}

/// One applied state change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: RecordingState,
    pub to: RecordingState,
}

impl Transition {
    pub fn changed(&self) -> bool {
        self.from != self.to
    }

    /// Side effect of entering `to`, seen from a participant with `role`.
    ///
    /// Returns `None` when the state did not change.
    pub fn effect(&self, role: Role) -> Option<StateEffect> {
        if !self.changed() {
            return None;
        }
        Some(match self.to {
            RecordingState::Recording => StateEffect::StartCapture,
            RecordingState::Finished => StateEffect::StopCapture {
                send_clip: role == Role::Streamer,
            },
            RecordingState::NotRecording => StateEffect::ClearTransient,
        })
    }
}

/// Local copy of the recording state.
///
/// Backed by a `watch` channel: every write is published atomically and
/// observers never see a torn value.
#[derive(Debug)]
pub struct RecordingStateMachine {
    tx: watch::Sender<RecordingState>,
}

impl RecordingStateMachine {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(RecordingState::NotRecording);
        Self { tx }
    }

    pub fn state(&self) -> RecordingState {
        *self.tx.borrow()
    }

    /// Advance exactly one step
    pub fn toggle(&self) -> Transition {
        self.write(|current| current.next())
    }

    /// Overwrite with a state received from the remote peer
    pub fn apply_remote(&self, state: RecordingState) -> Transition {
        self.write(|_| state)
    }

    /// Force `NotRecording`
    pub fn reset(&self) -> Transition {
        self.write(|_| RecordingState::NotRecording)
    }

    pub fn subscribe(&self) -> watch::Receiver<RecordingState> {
        self.tx.subscribe()
    }

    fn write(&self, f: impl FnOnce(RecordingState) -> RecordingState) -> Transition {
        let mut transition = Transition {
            from: RecordingState::NotRecording,
            to: RecordingState::NotRecording,
        };
        self.tx.send_modify(|state| {
            transition.from = *state;
            *state = f(*state);
            transition.to = *state;
        });
        debug!(from = %transition.from, to = %transition.to, "Recording state written");
        transition
    }
}

impl Default for RecordingStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

/// Couples the local state machine with the control channel.
pub struct RecordingSync<S> {
    machine: Arc<RecordingStateMachine>,
    sender: Arc<S>,
    /// Serializes toggle + send so two toggles cannot interleave their sends
    toggle_lock: Mutex<()>,
}

impl<S: ControlSender> RecordingSync<S> {
    pub fn new(machine: Arc<RecordingStateMachine>, sender: Arc<S>) -> Self {
        Self {
            machine,
            sender,
            toggle_lock: Mutex::new(()),
        }
    }

    pub fn machine(&self) -> &Arc<RecordingStateMachine> {
        &self.machine
    }

    pub fn state(&self) -> RecordingState {
        self.machine.state()
    }

    /// Advance one step and mirror the new state to every connected peer.
    ///
    /// The new state is published locally only after the send succeeds. On
    /// a send failure the local state is forced to `NotRecording` and the
    /// `SendFailed` error is returned.
    pub async fn toggle(&self) -> Result<Transition> {
        let _guard = self.toggle_lock.lock().await;
        let next = self.machine.state().next();
        let peers = self.sender.connected_peers().await;

        match self
            .sender
            .send_control(&ControlMessage::State(next), &peers)
            .await
        {
            Ok(()) => {
                let transition = self.machine.write(|_| next);
                info!(from = %transition.from, to = %transition.to, peers = peers.len(), "Recording state synchronized");
                Ok(transition)
            }
            Err(e) => {
                warn!(
                    attempted = %next,
                    error = %e,
                    "State sync failed, reverting to notRecording"
                );
                self.machine.reset();
                Err(e)
            }
        }
    }

    /// Apply a state received from the remote peer
    pub fn apply_remote(&self, state: RecordingState) -> Transition {
        let transition = self.machine.apply_remote(state);
        info!(from = %transition.from, to = %transition.to, "Recording state set by peer");
        transition
    }
}
