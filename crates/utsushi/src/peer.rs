//! Peer identity and connection state

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Identifies a remote participant.
///
/// The 32 bytes of the peer's Ed25519 public key (iroh EndpointId).
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerId(pub [u8; 32]);

impl PeerId {
    pub fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Short hex prefix for log lines
    pub fn fmt_short(&self) -> String {
        hex::encode(&self.0[..5])
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({})", self.fmt_short())
    }
}

impl FromStr for PeerId {
    type Err = String;

    /// Parse the 64-character hex form produced by `Display`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut bytes = [0u8; 32];
        hex::decode_to_slice(s, &mut bytes).map_err(|e| format!("invalid peer id: {}", e))?;
        Ok(Self(bytes))
    }
}

#[cfg(feature = "transport")]
impl From<iroh::PublicKey> for PeerId {
    fn from(key: iroh::PublicKey) -> Self {
        Self(*key.as_bytes())
    }
}

#[cfg(feature = "transport")]
impl TryFrom<PeerId> for iroh::PublicKey {
    type Error = String;

    fn try_from(id: PeerId) -> Result<Self, Self::Error> {
        iroh::PublicKey::from_bytes(&id.0).map_err(|e| e.to_string())
    }
}

/// Which side of the link a participant plays
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    /// Captures, compresses and records; sends the finished clip
    Streamer,
    /// Drives the recording state, receives and plays the clip
    Host,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Streamer => write!(f, "streamer"),
            Role::Host => write!(f, "host"),
        }
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "streamer" => Ok(Role::Streamer),
            "host" => Ok(Role::Host),
            other => Err(format!("unknown role: {}", other)),
        }
    }
}

/// Connection lifecycle of a remote peer.
///
/// A peer that is not connected is not in the peers set at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Connecting,
    Connected,
}

/// A remote peer's session membership as published to observers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerConnection {
    pub id: PeerId,
    pub state: ConnectionState,
    /// Name announced in the handshake (empty until connected)
    pub display_name: String,
    /// Role announced in the handshake
    pub role: Option<Role>,
}

impl PeerConnection {
    pub fn connecting(id: PeerId) -> Self {
        Self {
            id,
            state: ConnectionState::Connecting,
            display_name: String::new(),
            role: None,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peer_id_display_parse_roundtrip() {
        let mut bytes = [0u8; 32];
        bytes[0] = 0xab;
        bytes[31] = 0x01;
        let id = PeerId::new(bytes);
        let text = id.to_string();
        assert_eq!(text.len(), 64);
        assert!(text.starts_with("ab00"));
        assert_eq!(text.parse::<PeerId>().unwrap(), id);
    }

    #[test]
    fn test_peer_id_parse_rejects_bad_input() {
        assert!("abc".parse::<PeerId>().is_err());
        assert!("zz".repeat(32).parse::<PeerId>().is_err());
        assert!("ab".repeat(33).parse::<PeerId>().is_err());
    }

    #[test]
    fn test_peer_id_parse_rejects_non_ascii() {
        // 64 bytes, with multibyte chars straddling every byte pair
        let text = format!("a{}b", "é".repeat(31));
        assert_eq!(text.len(), 64);
        assert!(text.parse::<PeerId>().is_err());
    }

    #[test]
    fn test_peer_id_short_form() {
        let id = PeerId::new([0x12; 32]);
        assert_eq!(id.fmt_short(), "1212121212");
        assert_eq!(format!("{:?}", id), "PeerId(1212121212)");
    }

    #[test]
    fn test_role_parse() {
        assert_eq!("Host".parse::<Role>(), Ok(Role::Host));
        assert_eq!("streamer".parse::<Role>(), Ok(Role::Streamer));
        assert!("camera".parse::<Role>().is_err());
    }

    #[test]
    fn test_connecting_peer_is_not_connected() {
        let peer = PeerConnection::connecting(PeerId::new([0; 32]));
        assert!(!peer.is_connected());
        assert!(peer.role.is_none());
    }
}
