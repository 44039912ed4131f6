//! Host role: invite a streamer, drive recording, receive and play clips

use anyhow::{Context, Result};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::time::{interval, Duration};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use utsushi::storage::{CommandPlayback, LogPlayback};
use utsushi::transport::InboundStream;
use utsushi::{
    ClipStore, ClipTransferManager, Dispatched, InboundDispatcher, PeerId, PeerSession,
    PlaybackSink, RecordingStateMachine, RecordingSync, Role, SessionEvent,
    VIEWFINDER_STREAM_NAME,
};

use crate::config::Config;
use crate::{print_clip_info, spawn_stdin, Command};

/// Preview traffic received from the streamer
#[derive(Default)]
struct PreviewStats {
    datagrams: AtomicU64,
    datagram_bytes: AtomicU64,
    stream_bytes: AtomicU64,
}

impl PreviewStats {
    fn snapshot(&self) -> (u64, u64, u64) {
        (
            self.datagrams.load(Ordering::Relaxed),
            self.datagram_bytes.load(Ordering::Relaxed),
            self.stream_bytes.load(Ordering::Relaxed),
        )
    }
}

pub async fn run(config: Config) -> Result<()> {
    let peer = config
        .peer
        .clone()
        .context("UTSUSHI_PEER must be set to the streamer's id for the host role")?;

    if let Some(parent) = config.clip_path.parent() {
        if !parent.exists() && !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let (session, mut events) = PeerSession::bind(config.session()).await?;
    info!("Host id: {}", session.peer_id());
    let session = Arc::new(session);

    let playback: Arc<dyn PlaybackSink> = match config
        .player
        .as_deref()
        .and_then(CommandPlayback::from_command_line)
    {
        Some(player) => Arc::new(player),
        None => Arc::new(LogPlayback),
    };

    let machine = Arc::new(RecordingStateMachine::new());
    let sync = Arc::new(RecordingSync::new(machine.clone(), session.clone()));
    let transfer = Arc::new(ClipTransferManager::new(
        ClipStore::new(&config.clip_path),
        session.clone(),
        playback,
    ));
    let dispatcher = InboundDispatcher::new(Role::Host, sync.clone(), transfer.clone());

    // Graceful shutdown
    let cancel = CancellationToken::new();
    let tracker = TaskTracker::new();

    info!("Inviting streamer {}", PeerId::from(peer.id).fmt_short());
    let streamer = session
        .connect(peer)
        .await
        .context("Failed to connect to streamer")?;
    info!(
        "Connected to {} ({})",
        streamer.display_name,
        streamer.id.fmt_short()
    );
    info!("Type `toggle` (or press enter) to start and stop recording");

    let preview = Arc::new(PreviewStats::default());
    let mut last_preview = preview.snapshot();
    let mut stats_interval = interval(Duration::from_secs(5));
    let mut commands = spawn_stdin(cancel.clone());

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received shutdown signal");
                break;
            }
            event = events.recv() => {
                let Some(event) = event else { break };
                match event {
                    SessionEvent::PeerConnected(peer) => {
                        info!(peer = %peer.id.fmt_short(), name = %peer.display_name, "Streamer connected");
                    }
                    SessionEvent::PeerDisconnected(id) => {
                        info!(peer = %id.fmt_short(), "Streamer disconnected");
                        machine.reset();
                    }
                    SessionEvent::Control { from, message } => {
                        match dispatcher.dispatch(from, message).await {
                            Ok(Dispatched::Clip { path, transition }) => {
                                info!("Clip received: {}", path.display());
                                print_clip_info(transfer.store()).await;
                                if let Some(t) = transition {
                                    info!("Recording state: {} -> {}", t.from, t.to);
                                }
                            }
                            Ok(Dispatched::State(t)) if t.changed() => {
                                info!("Recording state set by streamer: {} -> {}", t.from, t.to);
                            }
                            Ok(_) => {}
                            Err(e) => warn!(peer = %from.fmt_short(), "Failed to handle control message: {}", e),
                        }
                    }
                    SessionEvent::BestEffort { payload, .. } => {
                        preview.datagrams.fetch_add(1, Ordering::Relaxed);
                        preview.datagram_bytes.fetch_add(payload.len() as u64, Ordering::Relaxed);
                    }
                    SessionEvent::StreamOpened { from, stream } => {
                        if stream.name() == VIEWFINDER_STREAM_NAME {
                            info!(peer = %from.fmt_short(), "View-finder stream opened");
                            tracker.spawn(read_viewfinder(stream, preview.clone(), cancel.clone()));
                        } else {
                            debug!(peer = %from.fmt_short(), name = stream.name(), "Ignoring unknown stream");
                        }
                    }
                }
            }
            Some(command) = commands.recv() => match command {
                Command::Toggle => match sync.toggle().await {
                    Ok(t) => info!("Recording state: {} -> {}", t.from, t.to),
                    Err(e) => warn!("Toggle failed, recording state reset: {}", e),
                },
                Command::Info => print_clip_info(transfer.store()).await,
                Command::Send => info!("Only the streamer sends clips"),
                Command::Disconnect => {
                    session.disconnect().await;
                    machine.reset();
                    info!("Disconnected");
                }
                Command::Quit => break,
            },
            _ = stats_interval.tick() => {
                let current = preview.snapshot();
                if current != last_preview {
                    let (datagrams, datagram_bytes, stream_bytes) = current;
                    info!(
                        "Preview: {} datagrams ({} KB), {} KB on view-finder stream",
                        datagrams,
                        datagram_bytes / 1024,
                        stream_bytes / 1024
                    );
                    last_preview = current;
                }
            }
        }
    }

    cancel.cancel();
    tracker.close();
    if tokio::time::timeout(Duration::from_secs(5), tracker.wait())
        .await
        .is_err()
    {
        warn!("Shutdown timed out after 5s");
    }
    session.shutdown().await;
    Ok(())
}

/// Drain the legacy view-finder stream, counting bytes
async fn read_viewfinder(
    mut stream: InboundStream,
    stats: Arc<PreviewStats>,
    cancel: CancellationToken,
) {
    loop {
        let chunk = tokio::select! {
            _ = cancel.cancelled() => break,
            chunk = stream.read_chunk() => chunk,
        };
        match chunk {
            Ok(Some(bytes)) => {
                stats
                    .stream_bytes
                    .fetch_add(bytes.len() as u64, Ordering::Relaxed);
            }
            Ok(None) => {
                debug!("View-finder stream finished");
                break;
            }
            Err(e) => {
                debug!("View-finder stream error: {}", e);
                break;
            }
        }
    }
}
