//! Transport layer for the peer-to-peer session
//!
//! Provides:
//! - Iroh endpoint management and connection handling
//! - The hello handshake that promotes a peer to `connected`
//! - [`PeerSession`]: control, best-effort and named-stream channels
//!
//! Control delivery is ordered per sender. Nothing is ordered across
//! channels.

mod endpoint;
mod handshake;
mod session;
mod stream;

pub use endpoint::SessionEndpoint;
pub use handshake::{read_hello, write_hello, Hello};
pub use session::PeerSession;
pub use stream::{InboundStream, OutboundStream};

pub use iroh::endpoint::RelayMode;
pub use iroh::EndpointAddr;

use bytes::Bytes;
use std::path::PathBuf;
use std::time::Duration;

use crate::control::{ControlMessage, EnvelopeMode};
use crate::peer::{PeerConnection, PeerId, Role};
use crate::protocol::SERVICE_TYPE;

/// Session construction parameters
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Name announced to peers in the hello
    pub display_name: String,
    /// Fixed service identifier; peers announcing another one are rejected
    pub service_type: String,
    pub role: Role,
    /// Secret key file. `None` means an ephemeral identity.
    pub key_path: Option<PathBuf>,
    pub relay_mode: RelayMode,
    /// Further invitations are refused once this many peers are registered
    pub max_peers: usize,
    pub envelope: EnvelopeMode,
    /// Upper bound on one reliable send; a stalled peer yields `SendFailed`
    pub send_timeout: Duration,
    /// Buffered [`SessionEvent`]s before the session waits on the consumer
    pub event_capacity: usize,
}

impl SessionConfig {
    pub fn new(display_name: impl Into<String>, role: Role) -> Self {
        Self {
            display_name: display_name.into(),
            service_type: SERVICE_TYPE.to_string(),
            role,
            key_path: None,
            relay_mode: RelayMode::Default,
            max_peers: 1,
            envelope: EnvelopeMode::default(),
            send_timeout: Duration::from_secs(30),
            event_capacity: 256,
        }
    }

    pub fn streamer(display_name: impl Into<String>) -> Self {
        Self::new(display_name, Role::Streamer)
    }

    pub fn host(display_name: impl Into<String>) -> Self {
        Self::new(display_name, Role::Host)
    }
}

/// Something that happened on the session, in arrival order per channel
#[derive(Debug)]
pub enum SessionEvent {
    /// A peer finished the handshake
    PeerConnected(PeerConnection),
    /// A connected peer went away (closed, failed or disconnected locally)
    PeerDisconnected(PeerId),
    /// Reliable control payload
    Control { from: PeerId, message: ControlMessage },
    /// Best-effort datagram
    BestEffort { from: PeerId, payload: Bytes },
    /// The peer opened a named byte stream
    StreamOpened { from: PeerId, stream: InboundStream },
}
