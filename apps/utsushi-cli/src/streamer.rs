//! Streamer role: capture, preview, record, send the clip

use anyhow::{bail, Result};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use utsushi::capture::{
    AnnexBWriter, ChannelSink, Compressor, FanoutSink, FrameEncoderAdapter, RawImage,
};
use utsushi::storage::LogPlayback;
use utsushi::transport::OutboundStream;
use utsushi::{
    ClipStore, ClipTransferManager, ControlSender, Dispatched, InboundDispatcher, NetworkUnit,
    PeerId, PeerSession, RecordingState, RecordingStateMachine, RecordingSync, Role,
    SessionEvent, StateEffect, Transition, UnitKind, VIEWFINDER_STREAM_NAME,
};

use crate::config::Config;
use crate::{print_clip_info, spawn_stdin, Command};

/// Units queued between the compressor thread and the network
const PREVIEW_QUEUE: usize = 64;

/// Keeps synthetic slices inside one QUIC datagram
#[cfg(feature = "test-source")]
const PREVIEW_SLICE_SIZE: usize = 1000;

type FrameSource = fn(u32, u32, u64) -> RawImage;

type Transfer = ClipTransferManager<PeerSession>;

pub async fn run(config: Config) -> Result<()> {
    let (compressor, frames) = camera(&config)?;

    if let Some(parent) = config.clip_path.parent() {
        if !parent.exists() && !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let (session, mut events) = PeerSession::bind(config.session()).await?;
    info!("Streamer id: {}", session.peer_id());
    info!("Invite with UTSUSHI_PEER={}", session.peer_id());
    let session = Arc::new(session);

    let machine = Arc::new(RecordingStateMachine::new());
    let sync = Arc::new(RecordingSync::new(machine.clone(), session.clone()));
    let transfer = Arc::new(ClipTransferManager::new(
        ClipStore::new(&config.clip_path),
        session.clone(),
        Arc::new(LogPlayback),
    ));
    let dispatcher = InboundDispatcher::new(Role::Streamer, sync.clone(), transfer.clone());

    // Graceful shutdown
    let cancel = CancellationToken::new();
    let tracker = TaskTracker::new();

    let recorder = Arc::new(AnnexBWriter::new());
    let (preview, preview_rx) = ChannelSink::new(PREVIEW_QUEUE);
    let sink = FanoutSink::new()
        .with(Arc::new(preview))
        .with(recorder.clone());
    let encoder = Arc::new(FrameEncoderAdapter::new(
        config.encoder.clone(),
        compressor,
        Arc::new(sink),
    ));
    encoder.start()?;

    tracker.spawn(capture_loop(encoder.clone(), frames, cancel.clone()));
    tracker.spawn(preview_loop(
        session.clone(),
        preview_rx,
        config.preview,
        cancel.clone(),
    ));
    tracker.spawn(effects_loop(
        machine.subscribe(),
        recorder.clone(),
        transfer.clone(),
        session.clone(),
        config.clip_path.clone(),
        config.auto_send,
        cancel.clone(),
    ));

    let mut commands = spawn_stdin(cancel.clone());
    info!("Waiting for a host invitation...");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received shutdown signal");
                break;
            }
            event = events.recv() => {
                let Some(event) = event else { break };
                handle_event(event, &dispatcher, &sync).await;
            }
            Some(command) = commands.recv() => match command {
                Command::Toggle => match sync.toggle().await {
                    Ok(t) => info!("Recording state: {} -> {}", t.from, t.to),
                    Err(e) => warn!("Toggle failed: {}", e),
                },
                Command::Info => print_clip_info(transfer.store()).await,
                Command::Send => send_clip(&transfer, session.as_ref()).await,
                Command::Disconnect => {
                    session.disconnect().await;
                    machine.reset();
                }
                Command::Quit => break,
            },
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
    encoder.stop();
    if let Err(e) = recorder.finish() {
        warn!("Failed to finish recording: {}", e);
    }
    session.shutdown().await;
    Ok(())
}

/// Compressor and frame generator for the configured camera
#[cfg(feature = "test-source")]
fn camera(config: &Config) -> Result<(Arc<dyn Compressor>, FrameSource)> {
    use utsushi::capture::{test_pattern, SyntheticCompressor, SyntheticConfig};

    if !config.test_source {
        bail!("No camera backend on this platform, run with --test-source");
    }
    info!(
        "Using synthetic camera: {}x{} @ {}fps",
        config.encoder.width, config.encoder.height, config.encoder.frame_rate
    );
    let compressor: Arc<dyn Compressor> = Arc::new(SyntheticCompressor::new(SyntheticConfig {
        slice_size: PREVIEW_SLICE_SIZE,
        ..Default::default()
    }));
    let frames: FrameSource = test_pattern;
    Ok((compressor, frames))
}

#[cfg(not(feature = "test-source"))]
fn camera(_config: &Config) -> Result<(Arc<dyn Compressor>, FrameSource)> {
    bail!("Built without a camera backend, enable the test-source feature")
}

async fn handle_event(
    event: SessionEvent,
    dispatcher: &InboundDispatcher<PeerSession>,
    sync: &RecordingSync<PeerSession>,
) {
    match event {
        SessionEvent::PeerConnected(peer) => {
            info!(peer = %peer.id.fmt_short(), name = %peer.display_name, "Host connected");
        }
        SessionEvent::PeerDisconnected(id) => {
            info!(peer = %id.fmt_short(), "Host disconnected");
            if sync.state() != RecordingState::NotRecording {
                sync.machine().reset();
            }
        }
        SessionEvent::Control { from, message } => match dispatcher.dispatch(from, message).await {
            Ok(Dispatched::State(t)) if t.changed() => {
                info!("Recording state set by host: {} -> {}", t.from, t.to)
            }
            Ok(_) => {}
            Err(e) => warn!(peer = %from.fmt_short(), "Failed to handle control message: {}", e),
        },
        SessionEvent::BestEffort { from, payload } => {
            debug!(peer = %from.fmt_short(), bytes = payload.len(), "Ignoring datagram");
        }
        SessionEvent::StreamOpened { from, stream } => {
            debug!(peer = %from.fmt_short(), name = stream.name(), "Ignoring stream");
        }
    }
}

/// Submit frames at the configured rate
async fn capture_loop(
    encoder: Arc<FrameEncoderAdapter>,
    frames: FrameSource,
    cancel: CancellationToken,
) {
    let config = encoder.config().clone();
    let fps = config.frame_rate.max(1) as u64;
    let mut ticker = tokio::time::interval(Duration::from_micros(1_000_000 / fps));
    let (width, height) = (config.width as u32, config.height as u32);
    let mut frame_num = 0u64;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        if let Err(e) = encoder.submit(frames(width, height, frame_num)) {
            warn!("Frame submit failed: {}", e);
            break;
        }
        frame_num += 1;

        if frame_num % (fps * 30) == 0 {
            let stats = encoder.demuxer().stats();
            info!(
                "Capture: {} frames, {} key, {} delta, {} malformed",
                frame_num, stats.key_frames, stats.delta_frames, stats.malformed
            );
        }
    }
    debug!("Capture loop stopped after {} frames", frame_num);
}

/// Send preview units to every connected host
async fn preview_loop(
    session: Arc<PeerSession>,
    mut units: mpsc::Receiver<NetworkUnit>,
    named_stream: bool,
    cancel: CancellationToken,
) {
    let mut streams: HashMap<PeerId, OutboundStream> = HashMap::new();
    let mut failed = 0u64;

    loop {
        let unit = tokio::select! {
            _ = cancel.cancelled() => break,
            unit = units.recv() => match unit {
                Some(unit) => unit,
                None => break,
            },
        };

        let peers = session.connected_peers().await;
        if peers.is_empty() {
            continue;
        }
        streams.retain(|id, _| peers.contains(id));
        let payload = unit.to_annex_b();

        for peer in peers {
            if let Err(e) = session.send_best_effort(payload.clone(), peer).await {
                failed += 1;
                if failed == 1 || failed % 100 == 0 {
                    debug!(failed, "Preview datagram dropped: {}", e);
                }
            }

            if !named_stream {
                continue;
            }
            // A new stream starts at a parameter set so it decodes on its own
            if !streams.contains_key(&peer) && unit.kind() == UnitKind::ParameterSet {
                match session.open_stream(VIEWFINDER_STREAM_NAME, peer).await {
                    Ok(stream) => {
                        streams.insert(peer, stream);
                    }
                    Err(e) => warn!(peer = %peer.fmt_short(), "Failed to open view-finder stream: {}", e),
                }
            }
            let write_failed = match streams.get(&peer) {
                Some(stream) => stream.write(&payload).await.err(),
                None => None,
            };
            if let Some(e) = write_failed {
                warn!(peer = %peer.fmt_short(), "View-finder stream closed: {}", e);
                streams.remove(&peer);
            }
        }
    }

    for (peer, stream) in streams {
        if let Err(e) = stream.finish().await {
            debug!(peer = %peer.fmt_short(), "Failed to finish view-finder stream: {}", e);
        }
    }
}

/// Run recording side effects on every state change
async fn effects_loop(
    mut states: watch::Receiver<RecordingState>,
    recorder: Arc<AnnexBWriter>,
    transfer: Arc<Transfer>,
    session: Arc<PeerSession>,
    clip_path: PathBuf,
    auto_send: bool,
    cancel: CancellationToken,
) {
    let mut current = *states.borrow_and_update();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            changed = states.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
        let next = *states.borrow_and_update();
        let transition = Transition {
            from: current,
            to: next,
        };
        current = next;

        match transition.effect(Role::Streamer) {
            Some(StateEffect::StartCapture) => {
                if let Err(e) = recorder.start(&clip_path) {
                    warn!("Failed to start recording: {}", e);
                }
            }
            Some(StateEffect::StopCapture { send_clip: should_send }) => {
                if let Err(e) = recorder.finish() {
                    warn!("Failed to finish recording: {}", e);
                    continue;
                }
                if should_send && auto_send {
                    send_clip(&transfer, session.as_ref()).await;
                } else if should_send {
                    info!("Clip ready, type `send` to transfer it");
                }
            }
            Some(StateEffect::ClearTransient) => {
                if recorder.is_recording() {
                    if let Err(e) = recorder.finish() {
                        warn!("Failed to finish recording: {}", e);
                    }
                }
            }
            None => {}
        }
    }
}

/// Send the stored clip to every connected peer
async fn send_clip(transfer: &Transfer, session: &PeerSession) {
    let peers = session.connected_peers().await;
    if peers.is_empty() {
        warn!("No host connected, clip not sent");
        return;
    }
    for peer in peers {
        match transfer.send_stored(peer).await {
            Ok(bytes) => info!(peer = %peer.fmt_short(), bytes, "Clip delivered"),
            Err(e) => warn!(peer = %peer.fmt_short(), "Clip not delivered, send again: {}", e),
        }
    }
}
