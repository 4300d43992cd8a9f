//! WebSocket sync server with per-document actor routing.
//!
//! ```text
//! Client A ──┐
//!            ├── DocumentTopic (fan-out) ◄── DocumentActor (authoritative
//! Client B ──┘                                replica + snapshot flushes)
//!                                                  │
//!                                            SnapshotStore (RocksDB)
//! ```
//!
//! Every connection must open with a `Hello` frame carrying the identity the
//! host's auth layer produced; the server trusts it (credential verification
//! is the host's concern). Deltas go through the document's actor, which
//! merges into the authoritative replica and rebroadcasts; handshakes are
//! answered with the actor's catch-up diff; presence fans out with
//! `visible_to` filtering applied per receiving connection.
//!
//! Reference: Kleppmann — Designing Data-Intensive Applications, Chapters 3 & 8

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::RwLock;

use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::actor::{ActorConfig, ActorRegistry, DocumentHandle};
use crate::broadcast::{DocumentTopic, TopicRegistry};
use crate::presence::PresenceUpdate;
use crate::protocol::{FrameKind, Identity, SyncFrame};
use crate::storage::SnapshotStore;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Fan-out channel capacity per document
    pub broadcast_capacity: usize,
    /// Interval between server-initiated pings
    pub ping_interval: Duration,
    /// Persistence actor knobs
    pub actor: ActorConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            broadcast_capacity: 256,
            ping_interval: Duration::from_secs(30),
            actor: ActorConfig::default(),
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_frames: u64,
    pub total_bytes: u64,
    pub active_documents: usize,
}

/// The sync server.
pub struct SyncServer {
    config: ServerConfig,
    topics: Arc<TopicRegistry>,
    actors: Arc<ActorRegistry>,
    stats: Arc<RwLock<ServerStats>>,
}

impl SyncServer {
    pub fn new(config: ServerConfig, store: Arc<dyn SnapshotStore>) -> Self {
        let topics = Arc::new(TopicRegistry::new(config.broadcast_capacity));
        let actors = Arc::new(ActorRegistry::new(store, config.actor.clone()));
        Self {
            config,
            topics,
            actors,
            stats: Arc::new(RwLock::new(ServerStats::default())),
        }
    }

    /// Bind to the configured address and serve forever.
    pub async fn run(self: Arc<Self>) -> Result<(), Box<dyn std::error::Error>> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Sync server listening on {}", self.config.bind_addr);
        self.run_on(listener).await
    }

    /// Serve on an already-bound listener (lets tests bind port 0).
    pub async fn run_on(
        self: Arc<Self>,
        listener: TcpListener,
    ) -> Result<(), Box<dyn std::error::Error>> {
        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let server = self.clone();
            tokio::spawn(async move {
                if let Err(e) = server.handle_connection(stream, addr).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    /// Drive one WebSocket connection from accept to cleanup.
    async fn handle_connection(
        self: Arc<Self>,
        stream: TcpStream,
        addr: SocketAddr,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        log::info!("WebSocket connection established from {addr}");
        {
            let mut s = self.stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        let conn_id = Uuid::new_v4();
        let mut session: Option<ConnSession> = None;
        let mut ping = tokio::time::interval(self.config.ping_interval);
        ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ping.tick().await; // First tick fires immediately; skip it.

        loop {
            tokio::select! {
                msg = ws_receiver.next() => {
                    match msg {
                        Some(Ok(Message::Binary(data))) => {
                            let bytes: Vec<u8> = data.into();
                            {
                                let mut s = self.stats.write().await;
                                s.total_frames += 1;
                                s.total_bytes += bytes.len() as u64;
                            }
                            let frame = match SyncFrame::decode(&bytes) {
                                Ok(frame) => frame,
                                Err(e) => {
                                    // Malformed frames are dropped, never fatal.
                                    log::warn!("Failed to decode frame from {addr}: {e}");
                                    continue;
                                }
                            };

                            match (&mut session, frame.kind) {
                                (None, FrameKind::Hello) => {
                                    match self.open_document(conn_id, &frame).await {
                                        Ok(opened) => session = Some(opened),
                                        Err(reason) => {
                                            let reject = SyncFrame::reject(
                                                frame.doc_id,
                                                frame.user_id,
                                                &reason,
                                            );
                                            if let Ok(bytes) = reject.encode() {
                                                let _ = ws_sender
                                                    .send(Message::Binary(bytes.into()))
                                                    .await;
                                            }
                                            break;
                                        }
                                    }
                                }
                                (None, _) => {
                                    // Hello must come first.
                                    let reject = SyncFrame::reject(
                                        frame.doc_id,
                                        frame.user_id,
                                        "hello required before any other frame",
                                    );
                                    if let Ok(bytes) = reject.encode() {
                                        let _ = ws_sender.send(Message::Binary(bytes.into())).await;
                                    }
                                    break;
                                }
                                (Some(sess), FrameKind::Handshake) => {
                                    let client_sv = match frame.handshake_state_vector() {
                                        Ok(sv) => sv,
                                        Err(e) => {
                                            log::warn!("Malformed handshake from {addr}: {e}");
                                            continue;
                                        }
                                    };
                                    let (diff, server_sv) =
                                        match sess.actor.snapshot_for(client_sv).await {
                                            Ok(pair) => pair,
                                            Err(e) => {
                                                log::error!("Actor query failed: {e}");
                                                continue;
                                            }
                                        };
                                    // Diff first, then our state vector, so the
                                    // client merges before it replies.
                                    if !diff.is_empty() {
                                        if let Ok(frame) = SyncFrame::delta(
                                            sess.doc_id,
                                            Uuid::nil(),
                                            0,
                                            &diff,
                                        ) {
                                            if let Ok(bytes) = frame.encode() {
                                                ws_sender
                                                    .send(Message::Binary(bytes.into()))
                                                    .await?;
                                            }
                                        }
                                    }
                                    if let Ok(frame) = SyncFrame::handshake(
                                        sess.doc_id,
                                        Uuid::nil(),
                                        &server_sv,
                                    ) {
                                        if let Ok(bytes) = frame.encode() {
                                            ws_sender.send(Message::Binary(bytes.into())).await?;
                                        }
                                    }
                                }
                                (Some(sess), FrameKind::Delta) => {
                                    let delta = match frame.delta_payload() {
                                        Ok(delta) => delta,
                                        Err(e) => {
                                            log::warn!("Malformed delta from {addr}: {e}");
                                            continue;
                                        }
                                    };
                                    // The actor merges and rebroadcasts the
                                    // original frame bytes on success, tagged
                                    // with this connection so it skips the echo.
                                    if let Err(e) = sess
                                        .actor
                                        .ingest(delta, Some((conn_id, Arc::new(bytes))))
                                        .await
                                    {
                                        log::error!("Delta ingest failed: {e}");
                                    }
                                }
                                (Some(sess), FrameKind::Presence) => {
                                    // Fire-and-forget fan-out; receivers apply
                                    // visibility filtering.
                                    sess.topic.publish_raw(conn_id, Arc::new(bytes));
                                }
                                (Some(sess), FrameKind::Ping) => {
                                    let pong = SyncFrame::pong(sess.doc_id, Uuid::nil());
                                    if let Ok(bytes) = pong.encode() {
                                        ws_sender.send(Message::Binary(bytes.into())).await?;
                                    }
                                }
                                (Some(_), _) => {
                                    log::debug!("Unhandled frame kind {:?} from {addr}", frame.kind);
                                }
                            }
                        }
                        Some(Ok(Message::Ping(data))) => {
                            ws_sender.send(Message::Pong(data)).await?;
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            log::info!("Connection closed from {addr}");
                            break;
                        }
                        Some(Err(e)) => {
                            log::warn!("WebSocket error from {addr}: {e}");
                            break;
                        }
                        _ => {}
                    }
                }

                fanned = async {
                    match &mut session {
                        Some(sess) => sess.topic_rx.recv().await,
                        // Not joined yet: park this arm.
                        None => std::future::pending().await,
                    }
                } => {
                    let sess = match &session {
                        Some(sess) => sess,
                        None => continue,
                    };
                    match fanned {
                        Ok((origin, data)) => {
                            if let Some(bytes) = filter_outgoing(origin, conn_id, &data, sess) {
                                ws_sender.send(Message::Binary(bytes.into())).await?;
                            }
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                            // The client resynchronizes via its next handshake.
                            log::warn!("Connection {conn_id} lagged by {n} frames");
                        }
                        Err(_) => break,
                    }
                }

                _ = ping.tick() => {
                    if let Some(sess) = &session {
                        let frame = SyncFrame::ping(sess.doc_id, Uuid::nil());
                        if let Ok(bytes) = frame.encode() {
                            ws_sender.send(Message::Binary(bytes.into())).await?;
                        }
                    }
                }
            }
        }

        if let Some(sess) = session {
            self.cleanup(conn_id, sess).await;
        }
        {
            let mut s = self.stats.write().await;
            s.active_connections -= 1;
            s.active_documents = self.topics.topic_count().await;
        }

        Ok(())
    }

    /// Handle a `Hello`: join the topic and bring up the document actor.
    async fn open_document(
        &self,
        conn_id: Uuid,
        frame: &SyncFrame,
    ) -> Result<ConnSession, String> {
        let hello = frame
            .hello_payload()
            .map_err(|e| format!("malformed hello: {e}"))?;
        let doc_id = frame.doc_id;

        let topic = self.topics.get_or_create(doc_id).await;
        let topic_rx = topic.join(conn_id, hello.identity.clone()).await;
        let actor = self
            .actors
            .get_or_create(doc_id, topic.clone())
            .await
            .map_err(|e| {
                log::error!("Failed to start actor for document {doc_id}: {e}");
                "document unavailable".to_string()
            })?;

        {
            let mut s = self.stats.write().await;
            s.active_documents = self.topics.topic_count().await;
        }
        log::info!(
            "User {} ({}) joined document {doc_id}",
            hello.identity.display_name,
            hello.identity.user_id
        );

        Ok(ConnSession {
            doc_id,
            identity: hello.identity,
            topic,
            topic_rx,
            actor,
        })
    }

    /// Per-connection teardown: synthetic leave, topic exit, actor retire.
    async fn cleanup(&self, conn_id: Uuid, sess: ConnSession) {
        let leave = PresenceUpdate::Leave {
            user_id: sess.identity.user_id,
        };
        if let Ok(frame) = SyncFrame::presence(sess.doc_id, 0, &leave) {
            if let Ok(bytes) = frame.encode() {
                sess.topic.publish_raw(conn_id, Arc::new(bytes));
            }
        }

        sess.topic.leave(&conn_id).await;
        log::info!(
            "User {} left document {}",
            sess.identity.user_id,
            sess.doc_id
        );

        if self.actors.retire_if_idle(&sess.doc_id, &sess.topic).await {
            self.topics.remove_if_empty(&sess.doc_id).await;
        }
    }

    pub async fn stats(&self) -> ServerStats {
        self.stats.read().await.clone()
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn topics(&self) -> &Arc<TopicRegistry> {
        &self.topics
    }

    pub fn actors(&self) -> &Arc<ActorRegistry> {
        &self.actors
    }
}

/// Per-connection document state after a successful `Hello`.
struct ConnSession {
    doc_id: Uuid,
    identity: Identity,
    topic: Arc<DocumentTopic>,
    topic_rx: tokio::sync::broadcast::Receiver<(Uuid, Arc<Vec<u8>>)>,
    actor: DocumentHandle,
}

/// Decide whether a fanned-out frame goes to this connection.
///
/// Only the originating connection skips its echo; the same user's other
/// connections (another device, another tab) still receive the frame live.
/// Presence updates restricted with `visible_to` are withheld from users
/// outside the set.
fn filter_outgoing(
    origin: Uuid,
    conn_id: Uuid,
    data: &Arc<Vec<u8>>,
    sess: &ConnSession,
) -> Option<Vec<u8>> {
    if origin == conn_id {
        return None;
    }
    let frame = SyncFrame::decode(data).ok()?;
    if frame.kind == FrameKind::Presence {
        let visible = frame
            .presence_update()
            .map(|update| update.visible_to_user(&sess.identity.user_id))
            .unwrap_or(false);
        if !visible {
            return None;
        }
    }
    Some(data.to_vec())
}
