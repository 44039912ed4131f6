//! Utsushi - peer-to-peer camera link
//!
//! A streamer compresses camera frames to H.264 and previews them to a host
//! over a direct peer-to-peer session. Both sides share a recording state;
//! when recording finishes the streamer sends the clip to the host, which
//! stores and plays it. Feature flags control which modules are compiled:
//!
//! - **Core** (always available): capture pipeline, H.264 demuxer, recording
//!   state machine, control envelope, clip storage and transfer
//! - **`transport`** (default): iroh endpoint, identity key files, [`transport::PeerSession`]
//! - **`test-source`**: synthetic compressor that runs without camera hardware

// Core modules (always compiled)
pub mod capture;
pub mod control;
pub mod dispatch;
mod error;
mod frame;
mod peer;
mod protocol;
pub mod recording;
pub mod storage;

pub use control::{ControlMessage, ControlSender, EnvelopeMode};
pub use dispatch::{Dispatched, InboundDispatcher};
pub use error::{Error, Result};
pub use frame::{NetworkUnit, Timestamp, UnitKind};
pub use peer::{ConnectionState, PeerConnection, PeerId, Role};
pub use protocol::*;
pub use recording::{RecordingState, RecordingStateMachine, RecordingSync, StateEffect, Transition};
pub use storage::{ClipInfo, ClipStore, ClipTransferManager, PlaybackSink};

// Transport: identity, iroh endpoint, peer session
#[cfg(feature = "transport")]
mod identity;
#[cfg(feature = "transport")]
pub mod transport;

#[cfg(feature = "transport")]
pub use identity::Identity;
#[cfg(feature = "transport")]
pub use transport::{PeerSession, SessionConfig, SessionEvent};
