//! Utsushi - camera link over a direct peer-to-peer session
//!
//! One binary, two roles. The streamer compresses frames, previews them to
//! the host and records clips; the host drives recording and receives the
//! finished clip.
//!
//! ## Usage
//!
//! ```bash
//! # Streamer with the synthetic camera; prints its id
//! UTSUSHI_ROLE=streamer utsushi --test-source
//!
//! # Host inviting that streamer, playing clips with mpv
//! UTSUSHI_ROLE=host UTSUSHI_PEER=<streamer-id> UTSUSHI_PLAYER=mpv utsushi
//!
//! # Streamer that waits for confirmation before sending a clip
//! utsushi --test-source --no-auto-send
//! ```
//!
//! Commands are read from stdin, one per line: `toggle` (or an empty line),
//! `info`, `send` (streamer), `disconnect` (host), `quit`.

mod config;
mod host;
mod streamer;

use anyhow::Result;
use std::io::BufRead;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use config::Config;
use utsushi::{ClipStore, Role};

#[tokio::main]
async fn main() -> Result<()> {
    init_logging()?;

    let config = Config::from_env()?;

    info!("Utsushi starting");
    info!("  Role: {}", config.role);
    info!("  Name: {}", config.name);
    info!("  Clip: {}", config.clip_path.display());
    info!("  Envelope: {:?}", config.envelope);

    match config.role {
        Role::Streamer => streamer::run(config).await,
        Role::Host => host::run(config).await,
    }
}

fn init_logging() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("utsushi=info".parse()?),
        )
        .init();
    Ok(())
}

/// Operator commands typed on stdin
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Toggle,
    Info,
    Send,
    Disconnect,
    Quit,
}

impl Command {
    fn parse(line: &str) -> Option<Self> {
        match line.trim().to_ascii_lowercase().as_str() {
            "" | "t" | "toggle" => Some(Command::Toggle),
            "i" | "info" => Some(Command::Info),
            "s" | "send" => Some(Command::Send),
            "d" | "disconnect" => Some(Command::Disconnect),
            "q" | "quit" | "exit" => Some(Command::Quit),
            _ => None,
        }
    }
}

/// Print the stored clip's metadata, or why there is none
pub async fn print_clip_info(store: &ClipStore) {
    match store.info().await {
        Ok(info) => println!("{}\n{}", store.path().display(), info),
        Err(e) => println!("{}", e),
    }
}

/// Forward stdin lines as commands until EOF or cancellation.
///
/// Reads on a plain thread; a pending tokio stdin read would hold up
/// runtime shutdown.
pub fn spawn_stdin(cancel: CancellationToken) -> mpsc::Receiver<Command> {
    let (tx, rx) = mpsc::channel(16);
    std::thread::spawn(move || {
        for line in std::io::stdin().lock().lines() {
            if cancel.is_cancelled() {
                break;
            }
            let line = match line {
                Ok(line) => line,
                Err(e) => {
                    debug!("stdin error: {}", e);
                    break;
                }
            };
            match Command::parse(&line) {
                Some(command) => {
                    if tx.blocking_send(command).is_err() {
                        break;
                    }
                }
                None => info!("Unknown command: {:?}", line.trim()),
            }
        }
        debug!("stdin closed");
    });
    rx
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_commands() {
        assert_eq!(Command::parse(""), Some(Command::Toggle));
        assert_eq!(Command::parse(" Toggle \n"), Some(Command::Toggle));
        assert_eq!(Command::parse("info"), Some(Command::Info));
        assert_eq!(Command::parse("s"), Some(Command::Send));
        assert_eq!(Command::parse("disconnect"), Some(Command::Disconnect));
        assert_eq!(Command::parse("exit"), Some(Command::Quit));
        assert_eq!(Command::parse("record please"), None);
    }
}
