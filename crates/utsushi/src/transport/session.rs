//! Peer session: connection lifecycle and the three logical channels
//!
//! Per connected peer:
//! - control: the handshake's bidirectional stream, reliable and ordered
//! - best effort: QUIC datagrams, loss is silent
//! - named streams: one unidirectional stream each, raw bytes
//!
//! The session is the only writer of the peers set. Every transition
//! (`connecting`, `connected`, removed) is republished on a watch channel.

use async_trait::async_trait;
use bytes::Bytes;
use iroh::endpoint::{Connection, RecvStream, SendStream};
use iroh::EndpointAddr;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use super::endpoint::SessionEndpoint;
use super::handshake::{read_hello, write_hello, Hello};
use super::stream::{read_stream_name, write_stream_name, InboundStream, OutboundStream};
use super::{SessionConfig, SessionEvent};
use crate::control::{read_control, ControlMessage, ControlSender};
use crate::identity::Identity;
use crate::peer::{ConnectionState, PeerConnection, PeerId};
use crate::{Error, Result};

/// Time allowed for the hello exchange after the QUIC handshake
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Control stream halves plus the remote hello
type Handshaken = (SendStream, (Hello, RecvStream));

const CLOSE_DISCONNECT: u32 = 0;
const CLOSE_SERVICE_MISMATCH: u32 = 1;
const CLOSE_SESSION_FULL: u32 = 2;
const CLOSE_PROTOCOL: u32 = 3;

/// Live channels of a connected peer
struct PeerLink {
    conn: Arc<Connection>,
    generation: u64,
    control: Arc<Mutex<SendStream>>,
    /// Cancelled when the connection goes away
    closed: CancellationToken,
}

impl PeerLink {
    /// Close the connection after the control stream lost its framing
    fn abort(&self, reason: &'static [u8]) {
        self.closed.cancel();
        self.conn.close(CLOSE_PROTOCOL.into(), reason);
    }
}

/// Aborts the link if a control write stops partway through an envelope.
///
/// The remote reader would otherwise take the next envelope's bytes as the
/// rest of the cut-off payload.
struct PartialWriteGuard<'a> {
    link: &'a PeerLink,
    armed: bool,
}

impl<'a> PartialWriteGuard<'a> {
    fn new(link: &'a PeerLink) -> Self {
        Self { link, armed: true }
    }

    fn complete(mut self) {
        self.armed = false;
    }
}

impl Drop for PartialWriteGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.link.abort(b"control write aborted");
        }
    }
}

struct PeerEntry {
    info: PeerConnection,
    generation: u64,
    link: Option<Arc<PeerLink>>,
}

struct SessionInner {
    config: SessionConfig,
    endpoint: SessionEndpoint,
    peers: RwLock<HashMap<PeerId, PeerEntry>>,
    generation: AtomicU64,
    peers_tx: watch::Sender<Vec<PeerConnection>>,
    events_tx: mpsc::Sender<SessionEvent>,
    cancel: CancellationToken,
    tracker: TaskTracker,
}

/// A participant's end of the peer-to-peer session
#[derive(Clone)]
pub struct PeerSession {
    inner: Arc<SessionInner>,
}

impl PeerSession {
    /// Bind an endpoint and start accepting peers.
    ///
    /// Returns the session and the receiver of inbound [`SessionEvent`]s.
    pub async fn bind(config: SessionConfig) -> Result<(Self, mpsc::Receiver<SessionEvent>)> {
        let identity = Identity::from_key_path(config.key_path.as_deref())
            .map_err(|e| Error::connection(format!("identity: {:#}", e)))?;
        let endpoint = SessionEndpoint::bind(&identity, config.relay_mode.clone())
            .await
            .map_err(|e| Error::connection(format!("bind: {:#}", e)))?;

        let (peers_tx, _) = watch::channel(Vec::new());
        let (events_tx, events_rx) = mpsc::channel(config.event_capacity);

        let session = Self {
            inner: Arc::new(SessionInner {
                config,
                endpoint,
                peers: RwLock::new(HashMap::new()),
                generation: AtomicU64::new(0),
                peers_tx,
                events_tx,
                cancel: CancellationToken::new(),
                tracker: TaskTracker::new(),
            }),
        };

        info!(
            id = %session.peer_id(),
            role = %session.inner.config.role,
            name = %session.inner.config.display_name,
            "Session ready"
        );

        let acceptor = session.clone();
        session.inner.tracker.spawn(async move { acceptor.accept_loop().await });

        Ok((session, events_rx))
    }

    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    pub fn peer_id(&self) -> PeerId {
        self.inner.endpoint.peer_id()
    }

    pub fn addr(&self) -> EndpointAddr {
        self.inner.endpoint.addr()
    }

    /// Current peers set (connecting and connected)
    pub fn peers(&self) -> Vec<PeerConnection> {
        self.inner.peers_tx.borrow().clone()
    }

    pub fn subscribe_peers(&self) -> watch::Receiver<Vec<PeerConnection>> {
        self.inner.peers_tx.subscribe()
    }

    /// Invite a remote peer: dial it and run the hello exchange.
    pub async fn connect(&self, addr: impl Into<EndpointAddr>) -> Result<PeerConnection> {
        let addr = addr.into();
        let id = PeerId::from(addr.id);
        let generation = self.register_connecting(id).await?;

        let result = async {
            let conn = self
                .inner
                .endpoint
                .connect(addr)
                .await
                .map_err(|e| Error::connection(format!("{:#}", e)))?;
            let conn = Arc::new(conn);
            let (send, hello) = self.dial_handshake(&conn).await?;
            Ok::<_, Error>((conn, send, hello))
        }
        .await;

        match result {
            Ok((conn, send, hello)) => self.promote(id, generation, conn, send, hello).await,
            Err(e) => {
                warn!(peer = %id.fmt_short(), "Connect failed: {}", e);
                self.unregister(id, generation).await;
                Err(e)
            }
        }
    }

    /// Close every peer connection and clear the peers set
    pub async fn disconnect(&self) {
        let removed: Vec<_> = {
            let mut peers = self.inner.peers.write().await;
            let removed = peers.drain().collect();
            self.publish(&peers);
            removed
        };

        for (id, entry) in removed {
            if let Some(link) = entry.link {
                link.closed.cancel();
                link.conn.close(CLOSE_DISCONNECT.into(), b"disconnect");
            }
            info!(peer = %id.fmt_short(), "Peer disconnected");
            self.emit(SessionEvent::PeerDisconnected(id)).await;
        }
    }

    /// Disconnect everything and close the endpoint
    pub async fn shutdown(&self) {
        self.disconnect().await;
        self.inner.cancel.cancel();
        self.inner.tracker.close();
        self.inner.endpoint.close().await;
        if tokio::time::timeout(Duration::from_secs(5), self.inner.tracker.wait())
            .await
            .is_err()
        {
            warn!("Session shutdown timed out after 5s");
        }
    }

    /// Reliable, ordered delivery to every peer in `to`
    pub async fn send_control(&self, message: &ControlMessage, to: &[PeerId]) -> Result<()> {
        if to.is_empty() {
            return Err(Error::send_failed("no peers to send to"));
        }
        let envelope = message
            .encode(self.inner.config.envelope)
            .map_err(|e| Error::send_failed(e.to_string()))?;
        for id in to {
            let link = self.link(id).await?;
            self.send_control_to(*id, &link, &envelope).await?;
        }
        Ok(())
    }

    /// Unreliable delivery. Loss in flight is silent; a payload the
    /// transport cannot take right now is `SendFailed`.
    pub async fn send_best_effort(&self, payload: Bytes, to: PeerId) -> Result<()> {
        let link = self.link(&to).await?;
        match link.conn.max_datagram_size() {
            None => return Err(Error::send_failed("peer does not accept datagrams")),
            Some(max) if payload.len() > max => {
                return Err(Error::send_failed(format!(
                    "datagram too large: {} > {}",
                    payload.len(),
                    max
                )))
            }
            Some(_) => {}
        }
        link.conn
            .send_datagram(payload)
            .map_err(|e| Error::send_failed(format!("datagram: {}", e)))
    }

    /// Open a named continuous byte stream to `to`
    pub async fn open_stream(&self, name: &str, to: PeerId) -> Result<OutboundStream> {
        let link = self.link(&to).await?;
        let mut send = link
            .conn
            .open_uni()
            .await
            .map_err(|e| Error::send_failed(format!("open stream: {}", e)))?;
        write_stream_name(&mut send, name).await.map_err(|e| match e {
            Error::Protocol(_) => e,
            other => Error::send_failed(other.to_string()),
        })?;
        debug!(peer = %to.fmt_short(), name, "Stream opened");
        Ok(OutboundStream::new(name.to_string(), to, send))
    }

    async fn link(&self, id: &PeerId) -> Result<Arc<PeerLink>> {
        let peers = self.inner.peers.read().await;
        peers
            .get(id)
            .and_then(|entry| entry.link.clone())
            .filter(|link| !link.closed.is_cancelled())
            .ok_or_else(|| Error::send_failed(format!("peer {} not connected", id.fmt_short())))
    }

    async fn send_control_to(
        &self,
        id: PeerId,
        link: &PeerLink,
        envelope: &Bytes,
    ) -> Result<()> {
        let write = async {
            let mut send = link.control.lock().await;
            let guard = PartialWriteGuard::new(link);
            AsyncWriteExt::write_all(&mut *send, envelope).await?;
            AsyncWriteExt::flush(&mut *send).await?;
            guard.complete();
            Ok::<_, std::io::Error>(())
        };

        let result = tokio::select! {
            biased;
            _ = link.closed.cancelled() => Err(Error::send_failed("peer disconnected")),
            r = tokio::time::timeout(self.inner.config.send_timeout, write) => match r {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(Error::send_failed(e.to_string())),
                Err(_) => Err(Error::send_failed("timed out")),
            },
        };

        if let Err(e) = &result {
            warn!(peer = %id.fmt_short(), "Control send failed: {}", e);
            if link.closed.is_cancelled() {
                self.unregister(id, link.generation).await;
            }
        }
        result
    }

    fn local_hello(&self) -> Hello {
        Hello {
            service: self.inner.config.service_type.clone(),
            display_name: self.inner.config.display_name.clone(),
            role: self.inner.config.role,
        }
    }

    /// Dialing side: open the control stream, send hello, read the answer
    async fn dial_handshake(&self, conn: &Connection) -> Result<Handshaken> {
        let exchange = async {
            let (mut send, mut recv) = conn
                .open_bi()
                .await
                .map_err(|e| Error::connection(format!("open control stream: {}", e)))?;
            write_hello(&mut send, &self.local_hello()).await?;
            let hello = read_hello(&mut recv).await?;
            Ok::<_, Error>((send, (hello, recv)))
        };

        let (send, (hello, recv)) = tokio::time::timeout(HANDSHAKE_TIMEOUT, exchange)
            .await
            .map_err(|_| Error::connection("handshake timed out"))??;

        if let Err(e) = hello.check_service(&self.inner.config.service_type) {
            conn.close(CLOSE_SERVICE_MISMATCH.into(), b"service mismatch");
            return Err(e);
        }
        Ok((send, (hello, recv)))
    }

    /// Accepting side: read the dialer's hello, check it, answer
    async fn accept_handshake(&self, conn: &Connection) -> Result<Handshaken> {
        let exchange = async {
            let (mut send, mut recv) = conn
                .accept_bi()
                .await
                .map_err(|e| Error::connection(format!("accept control stream: {}", e)))?;
            let hello = read_hello(&mut recv).await?;
            if let Err(e) = hello.check_service(&self.inner.config.service_type) {
                conn.close(CLOSE_SERVICE_MISMATCH.into(), b"service mismatch");
                return Err(e);
            }
            write_hello(&mut send, &self.local_hello()).await?;
            Ok::<_, Error>((send, (hello, recv)))
        };

        tokio::time::timeout(HANDSHAKE_TIMEOUT, exchange)
            .await
            .map_err(|_| Error::connection("handshake timed out"))?
    }

    async fn accept_loop(self) {
        loop {
            let conn = tokio::select! {
                _ = self.inner.cancel.cancelled() => break,
                conn = self.inner.endpoint.accept() => match conn {
                    Some(conn) => conn,
                    None => break,
                },
            };

            let session = self.clone();
            self.inner.tracker.spawn(async move {
                session.handle_incoming(Arc::new(conn)).await;
            });
        }
        debug!("Accept loop stopped");
    }

    /// Auto-accept an invitation, within the peer limit
    async fn handle_incoming(&self, conn: Arc<Connection>) {
        let id = PeerId::from(conn.remote_id());
        let generation = match self.register_connecting(id).await {
            Ok(generation) => generation,
            Err(e) => {
                info!(peer = %id.fmt_short(), "Rejecting peer: {}", e);
                conn.close(CLOSE_SESSION_FULL.into(), b"session full");
                return;
            }
        };

        match self.accept_handshake(&conn).await {
            Ok((send, hello)) => {
                if let Err(e) = self.promote(id, generation, conn, send, hello).await {
                    warn!(peer = %id.fmt_short(), "Failed to register peer: {}", e);
                }
            }
            Err(e) => {
                warn!(peer = %id.fmt_short(), "Handshake failed: {}", e);
                conn.close(CLOSE_PROTOCOL.into(), b"handshake failed");
                self.unregister(id, generation).await;
            }
        }
    }

    /// Add `id` as `connecting`.
    ///
    /// Returns a generation that must be passed to `unregister`, so a stale
    /// connection task cannot remove a newer registration of the same peer.
    async fn register_connecting(&self, id: PeerId) -> Result<u64> {
        let mut peers = self.inner.peers.write().await;
        if !peers.contains_key(&id) && peers.len() >= self.inner.config.max_peers {
            return Err(Error::connection(format!(
                "peer limit of {} reached",
                self.inner.config.max_peers
            )));
        }

        let generation = self.inner.generation.fetch_add(1, Ordering::Relaxed);
        if let Some(old) = peers.insert(
            id,
            PeerEntry {
                info: PeerConnection::connecting(id),
                generation,
                link: None,
            },
        ) {
            if let Some(link) = old.link {
                debug!(peer = %id.fmt_short(), "Replacing existing connection");
                link.closed.cancel();
                link.conn.close(CLOSE_DISCONNECT.into(), b"replaced");
            }
        }
        self.publish(&peers);
        debug!(peer = %id.fmt_short(), generation, "Peer connecting");
        Ok(generation)
    }

    /// Promote a handshaken peer to `connected` and start its channel tasks
    async fn promote(
        &self,
        id: PeerId,
        generation: u64,
        conn: Arc<Connection>,
        control: SendStream,
        (hello, control_recv): (Hello, RecvStream),
    ) -> Result<PeerConnection> {
        let link = Arc::new(PeerLink {
            conn,
            generation,
            control: Arc::new(Mutex::new(control)),
            closed: self.inner.cancel.child_token(),
        });

        let info = {
            let mut peers = self.inner.peers.write().await;
            let Some(entry) = peers.get_mut(&id).filter(|e| e.generation == generation) else {
                link.conn.close(CLOSE_DISCONNECT.into(), b"superseded");
                return Err(Error::connection("connection superseded"));
            };
            entry.info.state = ConnectionState::Connected;
            entry.info.display_name = hello.display_name.clone();
            entry.info.role = Some(hello.role);
            entry.link = Some(link.clone());
            let info = entry.info.clone();
            self.publish(&peers);
            info
        };

        info!(
            peer = %id.fmt_short(),
            name = %hello.display_name,
            role = %hello.role,
            generation,
            "Peer connected"
        );
        self.emit(SessionEvent::PeerConnected(info.clone())).await;

        self.spawn_control_reader(id, link.clone(), control_recv);
        self.spawn_datagram_reader(id, link.clone());
        self.spawn_stream_acceptor(id, link.clone());
        self.spawn_close_watcher(id, generation, link);

        Ok(info)
    }

    /// Remove `id` if `generation` still matches; publishes and emits on removal
    async fn unregister(&self, id: PeerId, generation: u64) {
        let removed = {
            let mut peers = self.inner.peers.write().await;
            match peers.get(&id) {
                Some(entry) if entry.generation == generation => {
                    let entry = peers.remove(&id);
                    self.publish(&peers);
                    entry
                }
                Some(entry) => {
                    debug!(
                        peer = %id.fmt_short(),
                        registered_generation = entry.generation,
                        stale_generation = generation,
                        "Skipping unregister: newer connection exists"
                    );
                    None
                }
                None => None,
            }
        };

        if let Some(entry) = removed {
            if let Some(link) = entry.link {
                link.closed.cancel();
            }
            if entry.info.is_connected() {
                info!(peer = %id.fmt_short(), generation, "Peer disconnected");
                self.emit(SessionEvent::PeerDisconnected(id)).await;
            }
        }
    }

    fn publish(&self, peers: &HashMap<PeerId, PeerEntry>) {
        let mut snapshot: Vec<_> = peers.values().map(|e| e.info.clone()).collect();
        snapshot.sort_by_key(|p| p.id);
        self.inner.peers_tx.send_replace(snapshot);
    }

    async fn emit(&self, event: SessionEvent) {
        if self.inner.events_tx.send(event).await.is_err() {
            debug!("Session event receiver dropped");
        }
    }

    fn spawn_control_reader(
        &self,
        id: PeerId,
        link: Arc<PeerLink>,
        mut recv: RecvStream,
    ) {
        let session = self.clone();
        let envelope = self.inner.config.envelope;
        self.inner.tracker.spawn(async move {
            loop {
                let next = tokio::select! {
                    _ = link.closed.cancelled() => break,
                    next = read_control(&mut recv, envelope) => next,
                };
                match next {
                    Ok(Some(message)) => {
                        session
                            .emit(SessionEvent::Control { from: id, message })
                            .await;
                    }
                    Ok(None) => {
                        debug!(peer = %id.fmt_short(), "Control stream finished");
                        break;
                    }
                    Err(e) => {
                        warn!(peer = %id.fmt_short(), "Control stream error: {}", e);
                        break;
                    }
                }
            }
            // The control channel is the session; without it the peer is gone
            link.conn.close(CLOSE_DISCONNECT.into(), b"control closed");
        });
    }

    fn spawn_datagram_reader(&self, id: PeerId, link: Arc<PeerLink>) {
        let session = self.clone();
        self.inner.tracker.spawn(async move {
            loop {
                let datagram = tokio::select! {
                    _ = link.closed.cancelled() => break,
                    d = link.conn.read_datagram() => d,
                };
                match datagram {
                    Ok(payload) => {
                        session
                            .emit(SessionEvent::BestEffort { from: id, payload })
                            .await;
                    }
                    Err(e) => {
                        debug!(peer = %id.fmt_short(), "Datagram reader stopped: {}", e);
                        break;
                    }
                }
            }
        });
    }

    fn spawn_stream_acceptor(&self, id: PeerId, link: Arc<PeerLink>) {
        let session = self.clone();
        self.inner.tracker.spawn(async move {
            loop {
                let accepted = tokio::select! {
                    _ = link.closed.cancelled() => break,
                    s = link.conn.accept_uni() => s,
                };
                let mut recv = match accepted {
                    Ok(recv) => recv,
                    Err(e) => {
                        debug!(peer = %id.fmt_short(), "Stream acceptor stopped: {}", e);
                        break;
                    }
                };
                match read_stream_name(&mut recv).await {
                    Ok(name) => {
                        debug!(peer = %id.fmt_short(), %name, "Inbound stream");
                        let stream = InboundStream::new(name, id, recv);
                        session
                            .emit(SessionEvent::StreamOpened { from: id, stream })
                            .await;
                    }
                    Err(e) => warn!(peer = %id.fmt_short(), "Bad stream header: {}", e),
                }
            }
        });
    }

    fn spawn_close_watcher(&self, id: PeerId, generation: u64, link: Arc<PeerLink>) {
        let session = self.clone();
        self.inner.tracker.spawn(async move {
            tokio::select! {
                _ = link.closed.cancelled() => {}
                reason = link.conn.closed() => {
                    debug!(peer = %id.fmt_short(), "Connection closed: {}", reason);
                }
            }
            link.closed.cancel();
            session.unregister(id, generation).await;
        });
    }
}

#[async_trait]
impl ControlSender for PeerSession {
    async fn send_control(&self, message: &ControlMessage, to: &[PeerId]) -> Result<()> {
        PeerSession::send_control(self, message, to).await
    }

    async fn connected_peers(&self) -> Vec<PeerId> {
        self.peers()
            .into_iter()
            .filter(PeerConnection::is_connected)
            .map(|p| p.id)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::EnvelopeMode;
    use crate::peer::Role;
    use crate::protocol::VIEWFINDER_STREAM_NAME;
    use crate::recording::RecordingState;

    async fn next_event(rx: &mut mpsc::Receiver<SessionEvent>) -> SessionEvent {
        tokio::time::timeout(Duration::from_secs(10), rx.recv())
            .await
            .expect("timed out waiting for session event")
            .expect("event channel closed")
    }

    /// Wait for the next event that is not a peer transition
    async fn next_payload_event(rx: &mut mpsc::Receiver<SessionEvent>) -> SessionEvent {
        loop {
            match next_event(rx).await {
                SessionEvent::PeerConnected(_) | SessionEvent::PeerDisconnected(_) => continue,
                other => return other,
            }
        }
    }

    struct Pair {
        host: PeerSession,
        host_rx: mpsc::Receiver<SessionEvent>,
        streamer: PeerSession,
        streamer_rx: mpsc::Receiver<SessionEvent>,
    }

    async fn connected_pair_with(envelope: EnvelopeMode) -> Pair {
        let mut streamer_config = SessionConfig::streamer("streamer");
        streamer_config.envelope = envelope;
        let mut host_config = SessionConfig::host("host");
        host_config.envelope = envelope;
        connected_pair_from(streamer_config, host_config).await
    }

    async fn connected_pair_from(streamer_config: SessionConfig, host_config: SessionConfig) -> Pair {
        let (streamer, streamer_rx) = PeerSession::bind(streamer_config).await.unwrap();
        let (host, host_rx) = PeerSession::bind(host_config).await.unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        let info = host.connect(streamer.addr()).await.unwrap();
        assert_eq!(info.id, streamer.peer_id());
        assert_eq!(info.role, Some(Role::Streamer));

        // Wait until the streamer side has promoted the host as well
        let mut watch = streamer.subscribe_peers();
        tokio::time::timeout(
            Duration::from_secs(10),
            watch.wait_for(|peers| peers.iter().any(PeerConnection::is_connected)),
        )
        .await
        .unwrap()
        .unwrap();

        Pair {
            host,
            host_rx,
            streamer,
            streamer_rx,
        }
    }

    async fn connected_pair() -> Pair {
        connected_pair_with(EnvelopeMode::Tagged).await
    }

    #[tokio::test]
    async fn test_session_bind_has_identity() {
        let (session, _rx) = PeerSession::bind(SessionConfig::host("h")).await.unwrap();
        assert_eq!(session.peer_id().as_bytes().len(), 32);
        assert!(session.peers().is_empty());
        session.shutdown().await;
    }

    #[tokio::test]
    async fn persistent_key_keeps_peer_id() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = SessionConfig::streamer("s");
        config.key_path = Some(dir.path().join("streamer.key"));

        let (first, _rx1) = PeerSession::bind(config.clone()).await.unwrap();
        let id = first.peer_id();
        first.shutdown().await;

        let (second, _rx2) = PeerSession::bind(config).await.unwrap();
        assert_eq!(second.peer_id(), id);
        second.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn handshake_publishes_connected_peers_on_both_sides() {
        let mut pair = connected_pair().await;

        match next_event(&mut pair.streamer_rx).await {
            SessionEvent::PeerConnected(peer) => {
                assert_eq!(peer.id, pair.host.peer_id());
                assert_eq!(peer.display_name, "host");
                assert_eq!(peer.role, Some(Role::Host));
            }
            other => panic!("expected PeerConnected, got {:?}", other),
        }
        assert!(matches!(
            next_event(&mut pair.host_rx).await,
            SessionEvent::PeerConnected(_)
        ));
        assert_eq!(
            pair.host.connected_peers().await,
            vec![pair.streamer.peer_id()]
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn control_messages_arrive_in_order() {
        let mut pair = connected_pair().await;
        let to = [pair.streamer.peer_id()];

        for state in [
            RecordingState::Recording,
            RecordingState::Finished,
            RecordingState::NotRecording,
        ] {
            pair.host
                .send_control(&ControlMessage::State(state), &to)
                .await
                .unwrap();
        }

        let mut received = Vec::new();
        while received.len() < 3 {
            if let SessionEvent::Control { from, message } =
                next_payload_event(&mut pair.streamer_rx).await
            {
                assert_eq!(from, pair.host.peer_id());
                received.push(message);
            }
        }
        assert_eq!(
            received,
            vec![
                ControlMessage::State(RecordingState::Recording),
                ControlMessage::State(RecordingState::Finished),
                ControlMessage::State(RecordingState::NotRecording),
            ]
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn clip_travels_on_legacy_envelope() {
        let mut pair = connected_pair_with(EnvelopeMode::Legacy).await;
        let clip = Bytes::from(vec![0x42; 200_000]);

        pair.streamer
            .send_control(&ControlMessage::Clip(clip.clone()), &[pair.host.peer_id()])
            .await
            .unwrap();

        match next_payload_event(&mut pair.host_rx).await {
            SessionEvent::Control { message, .. } => {
                assert_eq!(message, ControlMessage::Clip(clip))
            }
            other => panic!("expected clip, got {:?}", other),
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn best_effort_datagram_is_delivered() {
        let mut pair = connected_pair().await;
        let payload = Bytes::from_static(&[0, 0, 0, 1, 0x65, 0x88]);

        pair.streamer
            .send_best_effort(payload.clone(), pair.host.peer_id())
            .await
            .unwrap();

        match next_payload_event(&mut pair.host_rx).await {
            SessionEvent::BestEffort { payload: got, .. } => assert_eq!(got, payload),
            other => panic!("expected datagram, got {:?}", other),
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn oversized_datagram_is_send_failed() {
        let pair = connected_pair().await;
        let err = pair
            .streamer
            .send_best_effort(Bytes::from(vec![0; 64 * 1024]), pair.host.peer_id())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::SendFailed(_)));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn named_stream_carries_raw_bytes() {
        let mut pair = connected_pair().await;

        let stream = pair
            .streamer
            .open_stream(VIEWFINDER_STREAM_NAME, pair.host.peer_id())
            .await
            .unwrap();
        stream.write(b"preview-").await.unwrap();
        stream.write(b"bytes").await.unwrap();
        stream.finish().await.unwrap();

        let mut inbound = match next_payload_event(&mut pair.host_rx).await {
            SessionEvent::StreamOpened { stream, .. } => stream,
            other => panic!("expected stream, got {:?}", other),
        };
        assert_eq!(inbound.name(), VIEWFINDER_STREAM_NAME);

        let mut collected = Vec::new();
        while let Some(chunk) = inbound.read_chunk().await.unwrap() {
            collected.extend_from_slice(&chunk);
        }
        assert_eq!(collected, b"preview-bytes");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn send_to_unknown_peer_fails() {
        let pair = connected_pair().await;
        let stranger = PeerId::new([1; 32]);

        let err = pair
            .host
            .send_control(&ControlMessage::State(RecordingState::Recording), &[stranger])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::SendFailed(_)));
        assert!(matches!(
            pair.host
                .send_control(&ControlMessage::State(RecordingState::Recording), &[])
                .await,
            Err(Error::SendFailed(_))
        ));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn disconnect_clears_peers_and_fails_later_sends() {
        let mut pair = connected_pair().await;
        let streamer_id = pair.streamer.peer_id();

        pair.host.disconnect().await;
        assert!(pair.host.peers().is_empty());

        let err = pair
            .host
            .send_control(&ControlMessage::State(RecordingState::Recording), &[streamer_id])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::SendFailed(_)));

        // The streamer notices the close
        loop {
            if let SessionEvent::PeerDisconnected(id) = next_event(&mut pair.streamer_rx).await {
                assert_eq!(id, pair.host.peer_id());
                break;
            }
        }
        assert!(pair.streamer.peers().is_empty());
    }

    /// A pair whose streamer stops reading control messages after the first.
    ///
    /// The streamer's event queue holds one event and nobody drains it, so its
    /// control reader blocks on the first message and QUIC flow control
    /// stalls the host's next large write.
    async fn stalled_pair(send_timeout: Duration) -> Pair {
        let mut streamer_config = SessionConfig::streamer("streamer");
        streamer_config.event_capacity = 1;
        let mut host_config = SessionConfig::host("host");
        host_config.send_timeout = send_timeout;
        let pair = connected_pair_from(streamer_config, host_config).await;

        pair.host
            .send_control(
                &ControlMessage::State(RecordingState::Recording),
                &[pair.streamer.peer_id()],
            )
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        pair
    }

    fn large_clip() -> ControlMessage {
        ControlMessage::Clip(Bytes::from(vec![0x17; 32 * 1024 * 1024]))
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn timed_out_control_write_drops_the_peer() {
        let mut pair = stalled_pair(Duration::from_millis(300)).await;
        let streamer_id = pair.streamer.peer_id();

        let err = pair
            .host
            .send_control(&large_clip(), &[streamer_id])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::SendFailed(_)));
        assert!(pair.host.connected_peers().await.is_empty());

        // Nothing later may report success on the cut-off stream
        let err = pair
            .host
            .send_control(&ControlMessage::State(RecordingState::Finished), &[streamer_id])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::SendFailed(_)));

        loop {
            if let SessionEvent::PeerDisconnected(id) = next_event(&mut pair.host_rx).await {
                assert_eq!(id, streamer_id);
                break;
            }
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn disconnect_releases_blocked_control_send() {
        let pair = stalled_pair(Duration::from_secs(60)).await;
        let streamer_id = pair.streamer.peer_id();

        let sender = pair.host.clone();
        let blocked =
            tokio::spawn(async move { sender.send_control(&large_clip(), &[streamer_id]).await });
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(!blocked.is_finished());

        pair.host.disconnect().await;
        let result = tokio::time::timeout(Duration::from_secs(5), blocked)
            .await
            .expect("send still blocked after disconnect")
            .unwrap();
        assert!(matches!(result, Err(Error::SendFailed(_))));
        assert!(pair.host.peers().is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn second_host_is_rejected_by_full_streamer() {
        let pair = connected_pair().await;
        let (intruder, _rx) = PeerSession::bind(SessionConfig::host("other"))
            .await
            .unwrap();

        let result = intruder.connect(pair.streamer.addr()).await;
        assert!(result.is_err());
        assert_eq!(pair.streamer.peers().len(), 1);
        assert!(intruder.peers().is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn service_mismatch_rejects_peer() {
        let (streamer, _srx) = PeerSession::bind(SessionConfig::streamer("s")).await.unwrap();
        let mut config = SessionConfig::host("h");
        config.service_type = "photo-peer".to_string();
        let (host, _hrx) = PeerSession::bind(config).await.unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(host.connect(streamer.addr()).await.is_err());
        assert!(host.peers().is_empty());
    }
}
