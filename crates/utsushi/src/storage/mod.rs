//! Clip storage, playback and transfer
//!
//! - [`ClipStore`]: the single stored clip and its metadata
//! - [`PlaybackSink`]: what happens when a clip is ready to watch
//! - [`ClipTransferManager`]: moves a finished clip across the session

pub mod clip;
pub mod mp4;
pub mod transfer;

use async_trait::async_trait;
use std::path::Path;
use tracing::{info, warn};

use crate::Result;

pub use clip::{format_size, ClipInfo, ClipStore};
pub use transfer::ClipTransferManager;

/// Receives the path of a clip that is ready for playback
#[async_trait]
pub trait PlaybackSink: Send + Sync {
    async fn play(&self, path: &Path) -> Result<()>;
}

/// Only logs; for headless hosts
#[derive(Debug, Default)]
pub struct LogPlayback;

#[async_trait]
impl PlaybackSink for LogPlayback {
    async fn play(&self, path: &Path) -> Result<()> {
        info!(path = %path.display(), "Clip ready for playback");
        Ok(())
    }
}

/// Launches an external player with the clip path as its last argument
#[derive(Debug, Clone)]
pub struct CommandPlayback {
    program: String,
    args: Vec<String>,
}

impl CommandPlayback {
    /// Parse a command line such as `"mpv --loop"`
    pub fn from_command_line(command: &str) -> Option<Self> {
        let mut parts = command.split_whitespace().map(str::to_string);
        let program = parts.next()?;
        Some(Self {
            program,
            args: parts.collect(),
        })
    }
}

#[async_trait]
impl PlaybackSink for CommandPlayback {
    async fn play(&self, path: &Path) -> Result<()> {
        let mut child = tokio::process::Command::new(&self.program)
            .args(&self.args)
            .arg(path)
            .kill_on_drop(false)
            .spawn()?;
        info!(player = %self.program, path = %path.display(), "Player started");

        let program = self.program.clone();
        tokio::spawn(async move {
            match child.wait().await {
                Ok(status) if !status.success() => warn!(player = %program, %status, "Player exited"),
                Ok(_) => {}
                Err(e) => warn!(player = %program, "Failed to wait for player: {}", e),
            }
        });
        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_player_command() {
        let player = CommandPlayback::from_command_line("mpv --loop  --fs").unwrap();
        assert_eq!(player.program, "mpv");
        assert_eq!(player.args, vec!["--loop", "--fs"]);
        assert!(CommandPlayback::from_command_line("   ").is_none());
    }

    #[tokio::test]
    async fn missing_player_binary_is_an_error() {
        let player = CommandPlayback::from_command_line("utsushi-no-such-player").unwrap();
        assert!(player.play(Path::new("output.mov")).await.is_err());
    }
}
