use anyhow::{bail, Context, Result};
use iroh::{EndpointAddr, PublicKey};
use std::path::PathBuf;
use std::str::FromStr;

use utsushi::capture::EncoderConfig;
use utsushi::{EnvelopeMode, Role, SessionConfig, CLIP_FILE_NAME};

/// Configuration from environment/args
pub struct Config {
    pub role: Role,
    /// Name announced to the peer
    pub name: String,
    /// Secret key file; ephemeral identity when unset
    pub key_path: Option<PathBuf>,
    /// Streamer to invite (host only)
    pub peer: Option<EndpointAddr>,
    /// The one clip location, overwritten by each recording or receipt
    pub clip_path: PathBuf,
    pub encoder: EncoderConfig,
    /// Player command run on each received clip (host only)
    pub player: Option<String>,
    pub envelope: EnvelopeMode,
    /// Use the synthetic compressor instead of a camera
    pub test_source: bool,
    /// Also send preview on the named view-finder stream
    pub preview: bool,
    /// Send the clip as soon as recording finishes
    pub auto_send: bool,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let role = match std::env::var("UTSUSHI_ROLE") {
            Ok(s) => Role::from_str(&s)
                .map_err(anyhow::Error::msg)
                .context("Invalid UTSUSHI_ROLE")?,
            Err(_) => Role::Streamer,
        };

        let name = std::env::var("UTSUSHI_NAME").unwrap_or_else(|_| role.to_string());

        let key_path = std::env::var("UTSUSHI_KEY_PATH").map(PathBuf::from).ok();

        let peer = match std::env::var("UTSUSHI_PEER") {
            Ok(s) => {
                let key = PublicKey::from_str(s.trim()).context("Invalid UTSUSHI_PEER format")?;
                Some(EndpointAddr::from(key))
            }
            Err(_) => None,
        };

        let clip_path = std::env::var("UTSUSHI_CLIP_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(format!("./{}", CLIP_FILE_NAME)));

        let defaults = EncoderConfig::default();
        let width: i32 = std::env::var("UTSUSHI_WIDTH")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.width);

        let height: i32 = std::env::var("UTSUSHI_HEIGHT")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.height);

        let fps: i32 = std::env::var("UTSUSHI_FPS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.frame_rate);

        if width <= 0 || height <= 0 || fps <= 0 {
            bail!("Invalid video settings: {}x{} @ {}fps", width, height, fps);
        }

        let player = std::env::var("UTSUSHI_PLAYER")
            .ok()
            .filter(|s| !s.trim().is_empty());

        let envelope = match std::env::var("UTSUSHI_LEGACY_ENVELOPE") {
            Ok(v) if v == "1" || v.to_lowercase() == "true" => EnvelopeMode::Legacy,
            _ => EnvelopeMode::Tagged,
        };

        let args: Vec<String> = std::env::args().collect();
        let test_source = args.iter().any(|arg| arg == "--test-source");
        let preview = args.iter().any(|arg| arg == "--preview");
        let auto_send = !args.iter().any(|arg| arg == "--no-auto-send");

        Ok(Self {
            role,
            name,
            key_path,
            peer,
            clip_path,
            encoder: EncoderConfig {
                width,
                height,
                frame_rate: fps,
            },
            player,
            envelope,
            test_source,
            preview,
            auto_send,
        })
    }

    pub fn session(&self) -> SessionConfig {
        let mut session = SessionConfig::new(self.name.clone(), self.role);
        session.key_path = self.key_path.clone();
        session.envelope = self.envelope;
        session
    }
}
