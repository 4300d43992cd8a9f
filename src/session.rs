//! Editing sessions: the surface the host application drives.
//!
//! One session owns one document replica, one presence publisher, and one
//! managed connection, all on a single task, so everything touching a
//! document's state is serialized without locks. The host edits and moves
//! the cursor through a [`SessionHandle`] and consumes a [`SessionEvent`]
//! stream for repaints.
//!
//! ```text
//! host ──edit/move_cursor──► session task ──frames──► SyncConnection
//!  ▲                            │
//!  └───── SessionEvent ◄────────┘ (content, presence, connection state)
//! ```

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use crate::client::{ConnectionState, ReconnectPolicy, SyncConnection, TransportEvent};
use crate::presence::{
    CursorAnchor, PresenceConfig, PresenceEvent, PresencePublisher, PresenceRoom, PresenceUpdate,
};
use crate::protocol::{FrameKind, Identity, ProtocolError, SyncFrame};
use crate::replica::{Applied, BlockView, DocumentReplica, Edit, StateVector};

/// Session configuration.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub reconnect: ReconnectPolicy,
    pub presence: PresenceConfig,
    /// How long `open_session` waits for the first connection before
    /// giving up. Rejection fails immediately regardless.
    pub open_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            reconnect: ReconnectPolicy::default(),
            presence: PresenceConfig::default(),
            open_timeout: Duration::from_secs(10),
        }
    }
}

/// Session errors.
#[derive(Debug, Clone)]
pub enum SessionError {
    /// Server refused the session (identity or authorization); not retried.
    Rejected(String),
    /// `open_session` ran out of time before the first connection.
    OpenTimeout,
    /// The session task is gone.
    Closed,
    Protocol(String),
}

impl std::fmt::Display for SessionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionError::Rejected(reason) => write!(f, "Session rejected: {reason}"),
            SessionError::OpenTimeout => write!(f, "Timed out opening session"),
            SessionError::Closed => write!(f, "Session closed"),
            SessionError::Protocol(e) => write!(f, "Protocol error: {e}"),
        }
    }
}

impl std::error::Error for SessionError {}

impl From<ProtocolError> for SessionError {
    fn from(e: ProtocolError) -> Self {
        SessionError::Protocol(e.to_string())
    }
}

/// Events delivered to the host.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// Document content changed (local edit or remote merge).
    ContentChanged(Vec<BlockView>),
    PresenceChanged(PresenceEvent),
    ConnectionStateChanged(ConnectionState),
}

enum SessionCmd {
    Edit(Edit),
    MoveCursor {
        cursor: Option<CursorAnchor>,
        visible_to: Option<BTreeSet<Uuid>>,
    },
    Close,
}

/// Handle to a running session.
pub struct SessionHandle {
    doc_id: Uuid,
    identity: Identity,
    cmd_tx: mpsc::Sender<SessionCmd>,
    events: Option<mpsc::Receiver<SessionEvent>>,
}

impl SessionHandle {
    /// Apply a local edit. Never blocks on connectivity.
    pub async fn edit(&self, edit: Edit) -> Result<(), SessionError> {
        self.cmd_tx
            .send(SessionCmd::Edit(edit))
            .await
            .map_err(|_| SessionError::Closed)
    }

    /// Move the local cursor, optionally restricting who may see it.
    pub async fn move_cursor(
        &self,
        cursor: Option<CursorAnchor>,
        visible_to: Option<BTreeSet<Uuid>>,
    ) -> Result<(), SessionError> {
        self.cmd_tx
            .send(SessionCmd::MoveCursor { cursor, visible_to })
            .await
            .map_err(|_| SessionError::Closed)
    }

    /// Announce departure and tear the connection down.
    pub async fn close(&self) -> Result<(), SessionError> {
        self.cmd_tx
            .send(SessionCmd::Close)
            .await
            .map_err(|_| SessionError::Closed)
    }

    /// Take the event stream (one consumer; subsequent calls return None).
    pub fn take_events(&mut self) -> Option<mpsc::Receiver<SessionEvent>> {
        self.events.take()
    }

    pub fn doc_id(&self) -> Uuid {
        self.doc_id
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }
}

/// Open a session with default configuration.
pub async fn open_session(
    url: impl Into<String>,
    doc_id: Uuid,
    identity: Identity,
) -> Result<SessionHandle, SessionError> {
    open_session_with(url, doc_id, identity, SessionConfig::default()).await
}

/// Open a session against a sync server.
///
/// Resolves once the first connection is up, fails immediately on a server
/// `Reject`, and fails with [`SessionError::OpenTimeout`] if the server
/// stays unreachable past `config.open_timeout`. Transport failures during
/// the open window are retried with backoff like any other outage.
pub async fn open_session_with(
    url: impl Into<String>,
    doc_id: Uuid,
    identity: Identity,
    config: SessionConfig,
) -> Result<SessionHandle, SessionError> {
    let url = url.into();
    let shared_sv = Arc::new(std::sync::RwLock::new(StateVector::new()));
    let (conn, transport_rx) = SyncConnection::spawn(
        url,
        doc_id,
        identity.clone(),
        shared_sv.clone(),
        config.reconnect.clone(),
    );

    let (cmd_tx, cmd_rx) = mpsc::channel(256);
    let (event_tx, event_rx) = mpsc::channel(256);
    let (opened_tx, opened_rx) = oneshot::channel();

    let task = SessionTask {
        replica: DocumentReplica::new(doc_id),
        shared_sv,
        publisher: PresencePublisher::new(identity.clone(), &config.presence),
        room: PresenceRoom::new(identity.user_id, &config.presence),
        conn,
        identity: identity.clone(),
        doc_id,
        sequence: 0,
        config,
        event_tx,
        opened: Some(opened_tx),
    };
    let open_timeout = task.config.open_timeout;
    tokio::spawn(task.run(cmd_rx, transport_rx));

    match tokio::time::timeout(open_timeout, opened_rx).await {
        Ok(Ok(Ok(()))) => Ok(SessionHandle {
            doc_id,
            identity,
            cmd_tx,
            events: Some(event_rx),
        }),
        Ok(Ok(Err(e))) => Err(e),
        Ok(Err(_)) => Err(SessionError::Closed),
        Err(_) => {
            // Leave the task to wind down; dropping cmd_tx closes it.
            Err(SessionError::OpenTimeout)
        }
    }
}

struct SessionTask {
    replica: DocumentReplica,
    shared_sv: Arc<std::sync::RwLock<StateVector>>,
    publisher: PresencePublisher,
    room: PresenceRoom,
    conn: SyncConnection,
    identity: Identity,
    doc_id: Uuid,
    sequence: u64,
    config: SessionConfig,
    event_tx: mpsc::Sender<SessionEvent>,
    opened: Option<oneshot::Sender<Result<(), SessionError>>>,
}

impl SessionTask {
    async fn run(
        mut self,
        mut cmd_rx: mpsc::Receiver<SessionCmd>,
        mut transport_rx: mpsc::Receiver<TransportEvent>,
    ) {
        let mut heartbeat = tokio::time::interval(self.config.presence.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                maybe = cmd_rx.recv() => {
                    match maybe {
                        Some(SessionCmd::Edit(edit)) => self.handle_edit(edit).await,
                        Some(SessionCmd::MoveCursor { cursor, visible_to }) => {
                            if let Some(update) = self.publisher.update_cursor(cursor, visible_to) {
                                self.send_presence(&update).await;
                            }
                        }
                        Some(SessionCmd::Close) | None => break,
                    }
                }
                maybe = transport_rx.recv() => {
                    match maybe {
                        Some(TransportEvent::StateChanged(state)) => {
                            if state == ConnectionState::Connected {
                                self.signal_opened(Ok(()));
                            }
                            let _ = self
                                .event_tx
                                .send(SessionEvent::ConnectionStateChanged(state))
                                .await;
                        }
                        Some(TransportEvent::Frame(frame)) => self.handle_frame(frame).await,
                        Some(TransportEvent::Rejected(reason)) => {
                            self.signal_opened(Err(SessionError::Rejected(reason)));
                            break;
                        }
                        None => break,
                    }
                }
                _ = heartbeat.tick() => {
                    let update = self.publisher.tick();
                    self.send_presence(&update).await;
                    for event in self.room.sweep() {
                        let _ = self.event_tx.send(SessionEvent::PresenceChanged(event)).await;
                    }
                }
            }
        }

        // Clean departure: best-effort leave, then drop the socket.
        let leave = self.publisher.leave();
        self.send_presence(&leave).await;
        self.conn.close();
    }

    fn signal_opened(&mut self, result: Result<(), SessionError>) {
        if let Some(tx) = self.opened.take() {
            let _ = tx.send(result);
        }
    }

    async fn handle_edit(&mut self, edit: Edit) {
        let delta = self.replica.apply_local(edit);
        self.publish_state_vector();
        if delta.is_empty() {
            return;
        }

        let _ = self
            .event_tx
            .send(SessionEvent::ContentChanged(self.replica.blocks()))
            .await;

        self.sequence += 1;
        match SyncFrame::delta(self.doc_id, self.identity.user_id, self.sequence, &delta) {
            // Send failure is fine: the ops sit in the replica's pending set
            // and the next handshake carries them.
            Ok(frame) => {
                let _ = self.conn.send(&frame).await;
            }
            Err(e) => log::error!("Failed to encode delta frame: {e}"),
        }
    }

    async fn handle_frame(&mut self, frame: SyncFrame) {
        match frame.kind {
            FrameKind::Delta => {
                let delta = match frame.delta_payload() {
                    Ok(delta) => delta,
                    Err(e) => {
                        log::warn!("Dropping malformed delta: {e}");
                        return;
                    }
                };
                // Own echoes and duplicates fall out as Noop.
                if let Applied::Changed(_) = self.replica.apply_remote(&delta) {
                    self.publish_state_vector();
                    let _ = self
                        .event_tx
                        .send(SessionEvent::ContentChanged(self.replica.blocks()))
                        .await;
                }
            }
            FrameKind::Handshake => {
                let server_sv = match frame.handshake_state_vector() {
                    Ok(sv) => sv,
                    Err(e) => {
                        log::warn!("Dropping malformed handshake: {e}");
                        return;
                    }
                };
                // Reply leg of the two-way diff: ship what the server lacks.
                let diff = self.replica.diff_since(&server_sv);
                if !diff.is_empty() {
                    self.sequence += 1;
                    match SyncFrame::delta(
                        self.doc_id,
                        self.identity.user_id,
                        self.sequence,
                        &diff,
                    ) {
                        Ok(frame) => {
                            let _ = self.conn.send(&frame).await;
                        }
                        Err(e) => log::error!("Failed to encode handshake diff: {e}"),
                    }
                }
                // The server's catch-up delta precedes its handshake frame on
                // the socket, so its ops are already merged here.
                self.replica.merge_state_vector(&server_sv);
                self.replica.ack_pending();
                self.publish_state_vector();
            }
            FrameKind::Presence => {
                let update = match frame.presence_update() {
                    Ok(update) => update,
                    Err(e) => {
                        log::warn!("Dropping malformed presence update: {e}");
                        return;
                    }
                };
                if let Some(event) = self.room.handle_update(&update) {
                    let _ = self.event_tx.send(SessionEvent::PresenceChanged(event)).await;
                }
            }
            // Hello/Reject/Ping/Pong are handled by the connection task.
            _ => {}
        }
    }

    async fn send_presence(&mut self, update: &PresenceUpdate) {
        self.sequence += 1;
        match SyncFrame::presence(self.doc_id, self.sequence, update) {
            // Presence is fire-and-forget; offline updates are dropped.
            Ok(frame) => {
                let _ = self.conn.send(&frame).await;
            }
            Err(e) => log::error!("Failed to encode presence frame: {e}"),
        }
    }

    fn publish_state_vector(&self) {
        if let Ok(mut sv) = self.shared_sv.write() {
            *sv = self.replica.state_vector().clone();
        }
    }
}
