//! WebSocket connection manager with automatic reconnection.
//!
//! Owns the transport lifecycle only: connect, detect failure, back off,
//! reconnect, and run the hello/handshake opening on every (re)connection.
//! Document state lives in the session's replica; while the link is down,
//! local edits simply accumulate in the replica's pending set and the next
//! handshake carries them over, so editing never blocks on connectivity.
//!
//! State machine:
//! ```text
//! Disconnected ─► Connecting ─► Connected ─► Reconnecting ─► Connected ...
//!                     │                            │
//!                     └────────── close() ─────────┴─► Disconnected
//! ```
//!
//! Reference: Kleppmann, Chapter 5 — Replication

use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, RwLock};
use uuid::Uuid;

use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::Message;

use crate::protocol::{FrameKind, Identity, ProtocolError, SyncFrame};
use crate::replica::StateVector;

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

/// Reconnect backoff: exponential with full jitter.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    /// First-retry ceiling.
    pub base: Duration,
    /// Backoff ceiling.
    pub cap: Duration,
    /// A connection whose handshake gets no reply within this window is
    /// torn down and counted as a failure.
    pub handshake_timeout: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            cap: Duration::from_secs(30),
            handshake_timeout: Duration::from_secs(10),
        }
    }
}

impl ReconnectPolicy {
    /// Delay before retry `attempt` (1-based): uniform in
    /// `[0, min(cap, base * 2^(attempt-1))]`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let ceiling = self.base.saturating_mul(1u32 << exp).min(self.cap);
        let millis = ceiling.as_millis() as u64;
        if millis == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::thread_rng().gen_range(0..=millis))
    }
}

/// Events the connection surfaces to its session.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    StateChanged(ConnectionState),
    /// A decoded frame from the server (the session filters its own echoes).
    Frame(SyncFrame),
    /// Server refused the session on open; terminal, no retry.
    Rejected(String),
}

/// How one connection attempt ended.
enum ConnOutcome {
    /// Was connected and synced, then dropped: reset backoff.
    Dropped,
    /// Never became healthy: count as a failure.
    Failed,
    /// Rejected or closed on purpose: stop the loop.
    Terminal,
}

/// Managed client connection for one document.
pub struct SyncConnection {
    doc_id: Uuid,
    identity: Identity,
    state: Arc<RwLock<ConnectionState>>,
    /// Writer for the currently live socket, if any.
    outgoing: Arc<RwLock<Option<mpsc::Sender<Vec<u8>>>>>,
    shutdown: watch::Sender<bool>,
}

impl SyncConnection {
    /// Spawn the connection task.
    ///
    /// `state_vector` is the session's live state vector; the opening
    /// hello/handshake on every (re)connection reads it, which is what
    /// flushes offline edits and pulls missed remote ops.
    pub fn spawn(
        url: String,
        doc_id: Uuid,
        identity: Identity,
        state_vector: Arc<std::sync::RwLock<StateVector>>,
        policy: ReconnectPolicy,
    ) -> (Self, mpsc::Receiver<TransportEvent>) {
        let (event_tx, event_rx) = mpsc::channel(256);
        let (shutdown, shutdown_rx) = watch::channel(false);
        let state = Arc::new(RwLock::new(ConnectionState::Disconnected));
        let outgoing = Arc::new(RwLock::new(None));

        let task = ConnectionTask {
            url,
            doc_id,
            identity: identity.clone(),
            state_vector,
            policy,
            state: state.clone(),
            outgoing: outgoing.clone(),
            event_tx,
            shutdown_rx,
        };
        tokio::spawn(task.run());

        (
            Self {
                doc_id,
                identity,
                state,
                outgoing,
                shutdown,
            },
            event_rx,
        )
    }

    /// Send a frame on the live socket.
    ///
    /// Fails with `ConnectionClosed` while the link is down; delta senders
    /// ignore that (pending ops ride the next handshake), presence senders
    /// drop the update.
    pub async fn send(&self, frame: &SyncFrame) -> Result<(), ProtocolError> {
        let encoded = frame.encode()?;
        let sender = {
            let outgoing = self.outgoing.read().await;
            outgoing.clone()
        };
        match sender {
            Some(tx) => tx
                .send(encoded)
                .await
                .map_err(|_| ProtocolError::ConnectionClosed),
            None => Err(ProtocolError::ConnectionClosed),
        }
    }

    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    pub fn doc_id(&self) -> Uuid {
        self.doc_id
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// Stop reconnecting and drop the socket.
    pub fn close(&self) {
        let _ = self.shutdown.send(true);
    }
}

struct ConnectionTask {
    url: String,
    doc_id: Uuid,
    identity: Identity,
    state_vector: Arc<std::sync::RwLock<StateVector>>,
    policy: ReconnectPolicy,
    state: Arc<RwLock<ConnectionState>>,
    outgoing: Arc<RwLock<Option<mpsc::Sender<Vec<u8>>>>>,
    event_tx: mpsc::Sender<TransportEvent>,
    shutdown_rx: watch::Receiver<bool>,
}

impl ConnectionTask {
    async fn run(mut self) {
        let mut attempt: u32 = 0;

        loop {
            if *self.shutdown_rx.borrow() {
                break;
            }

            let connecting = if attempt == 0 {
                ConnectionState::Connecting
            } else {
                ConnectionState::Reconnecting
            };
            self.set_state(connecting).await;

            let outcome = match tokio_tungstenite::connect_async(&self.url).await {
                Ok((ws, _)) => self.run_connection(ws).await,
                Err(e) => {
                    log::warn!("Connect to {} failed: {e}", self.url);
                    ConnOutcome::Failed
                }
            };

            *self.outgoing.write().await = None;

            match outcome {
                ConnOutcome::Terminal => break,
                ConnOutcome::Dropped => attempt = 1,
                ConnOutcome::Failed => attempt += 1,
            }

            let delay = self.policy.delay(attempt);
            log::info!(
                "Connection to document {} lost, retry {attempt} in {delay:?}",
                self.doc_id
            );
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.shutdown_rx.changed() => {
                    if *self.shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }

        self.set_state(ConnectionState::Disconnected).await;
    }

    /// Drive one live socket until it drops. Opens with hello + handshake.
    async fn run_connection(
        &mut self,
        ws: tokio_tungstenite::WebSocketStream<
            tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
        >,
    ) -> ConnOutcome {
        let (mut sink, mut stream) = ws.split();

        let sv = {
            match self.state_vector.read() {
                Ok(sv) => sv.clone(),
                Err(_) => StateVector::new(),
            }
        };

        let opening = SyncFrame::hello(self.doc_id, &self.identity, &sv)
            .and_then(|hello| {
                let handshake =
                    SyncFrame::handshake(self.doc_id, self.identity.user_id, &sv)?;
                Ok((hello.encode()?, handshake.encode()?))
            });
        let (hello_bytes, handshake_bytes) = match opening {
            Ok(pair) => pair,
            Err(e) => {
                log::error!("Failed to encode opening frames: {e}");
                return ConnOutcome::Failed;
            }
        };
        if sink.send(Message::Binary(hello_bytes.into())).await.is_err() {
            return ConnOutcome::Failed;
        }
        if sink
            .send(Message::Binary(handshake_bytes.into()))
            .await
            .is_err()
        {
            return ConnOutcome::Failed;
        }

        let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(256);
        *self.outgoing.write().await = Some(out_tx);
        self.set_state(ConnectionState::Connected).await;

        let mut synced = false;
        let handshake_deadline = tokio::time::Instant::now() + self.policy.handshake_timeout;

        loop {
            tokio::select! {
                maybe = out_rx.recv() => {
                    match maybe {
                        Some(bytes) => {
                            if sink.send(Message::Binary(bytes.into())).await.is_err() {
                                return if synced { ConnOutcome::Dropped } else { ConnOutcome::Failed };
                            }
                        }
                        None => return ConnOutcome::Terminal,
                    }
                }
                maybe = stream.next() => {
                    match maybe {
                        Some(Ok(Message::Binary(data))) => {
                            let bytes: Vec<u8> = data.into();
                            let frame = match SyncFrame::decode(&bytes) {
                                Ok(frame) => frame,
                                Err(e) => {
                                    // Malformed frames are dropped, never fatal.
                                    log::warn!("Dropping malformed frame: {e}");
                                    continue;
                                }
                            };
                            match frame.kind {
                                FrameKind::Reject => {
                                    let reason = frame
                                        .reject_reason()
                                        .unwrap_or_else(|_| "unknown".into());
                                    log::error!("Session rejected: {reason}");
                                    let _ = self
                                        .event_tx
                                        .send(TransportEvent::Rejected(reason))
                                        .await;
                                    return ConnOutcome::Terminal;
                                }
                                FrameKind::Ping => {
                                    let pong = SyncFrame::pong(
                                        self.doc_id,
                                        self.identity.user_id,
                                    );
                                    if let Ok(bytes) = pong.encode() {
                                        let _ = sink.send(Message::Binary(bytes.into())).await;
                                    }
                                }
                                _ => {
                                    if matches!(
                                        frame.kind,
                                        FrameKind::Handshake | FrameKind::Delta
                                    ) {
                                        synced = true;
                                    }
                                    if self
                                        .event_tx
                                        .send(TransportEvent::Frame(frame))
                                        .await
                                        .is_err()
                                    {
                                        return ConnOutcome::Terminal;
                                    }
                                }
                            }
                        }
                        Some(Ok(Message::Close(_))) | Some(Err(_)) | None => {
                            return if synced { ConnOutcome::Dropped } else { ConnOutcome::Failed };
                        }
                        Some(Ok(_)) => {}
                    }
                }
                _ = tokio::time::sleep_until(handshake_deadline), if !synced => {
                    log::warn!(
                        "Handshake for document {} stalled, reconnecting",
                        self.doc_id
                    );
                    return ConnOutcome::Failed;
                }
                _ = self.shutdown_rx.changed() => {
                    if *self.shutdown_rx.borrow() {
                        let _ = sink.send(Message::Close(None)).await;
                        return ConnOutcome::Terminal;
                    }
                }
            }
        }
    }

    async fn set_state(&self, new: ConnectionState) {
        {
            let mut state = self.state.write().await;
            if *state == new {
                return;
            }
            *state = new;
        }
        let _ = self
            .event_tx
            .send(TransportEvent::StateChanged(new))
            .await;
    }
}
