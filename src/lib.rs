//! Real-time collaborative document synchronization.
//!
//! `tandem` keeps a block-structured document converged across any number of
//! concurrently editing replicas, with ephemeral presence (cursors) and
//! durable server-side snapshots.
//!
//! ```text
//!  host UI ── SessionHandle ── session task ─────── WebSocket ─────┐
//!                 │                │                               │
//!            SessionEvent     DocumentReplica                 SyncServer
//!                                  │                               │
//!                            pending ops,                ┌─────────┼─────────┐
//!                            state vector                ▼         ▼         ▼
//!                                                  DocumentTopic  actor  presence
//!                                                   (fan-out)      │     fan-out
//!                                                                  ▼
//!                                                            SnapshotStore
//! ```
//!
//! Module map:
//! - [`replica`]   — the CRDT: id-addressed block arena, state vectors, deltas
//! - [`protocol`]  — binary frame envelope over the wire
//! - [`presence`]  — ephemeral cursor/viewer channel (LWW, never persisted)
//! - [`broadcast`] — per-document fan-out topics
//! - [`actor`]     — per-document persistence actors
//! - [`storage`]   — snapshot store contract, RocksDB and in-memory backends
//! - [`client`]    — managed connection with reconnect backoff
//! - [`session`]   — the host-facing editing surface
//! - [`server`]    — WebSocket sync server
//!
//! Convergence guarantee: replicas that have applied the same set of
//! operations, in any order and with any duplication, materialize
//! byte-identical content.

pub mod actor;
pub mod broadcast;
pub mod client;
pub mod presence;
pub mod protocol;
pub mod replica;
pub mod server;
pub mod session;
pub mod storage;

pub use actor::{ActorConfig, ActorRegistry, DocumentHandle};
pub use broadcast::{DocumentTopic, TopicRegistry};
pub use client::{ConnectionState, ReconnectPolicy, SyncConnection};
pub use presence::{
    CursorAnchor, PresenceConfig, PresenceEvent, PresenceRecord, PresenceUpdate,
};
pub use protocol::{FrameKind, Identity, ProtocolError, SyncFrame};
pub use replica::{
    Applied, BlockView, Delta, DocumentReplica, Edit, OpId, Operation, StateVector,
};
pub use server::{ServerConfig, ServerStats, SyncServer};
pub use session::{
    open_session, open_session_with, SessionConfig, SessionError, SessionEvent, SessionHandle,
};
pub use storage::{MemoryStore, RocksStore, SnapshotStore, StoreConfig, StoreError};
