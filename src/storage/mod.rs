//! Durable snapshot storage behind a narrow host-pluggable contract.
//!
//! The persistence actor is the only caller. The contract is deliberately
//! blocking: backends are free to do synchronous I/O, and the actor wraps
//! calls in `spawn_blocking`. A failed `save` is retried by the actor with
//! backoff; it never stalls live collaboration.

mod mem;
mod rocks;

pub use mem::MemoryStore;
pub use rocks::{RocksStore, SnapshotMetadata, StoreConfig};

use uuid::Uuid;

/// Storage contract the host may replace wholesale.
pub trait SnapshotStore: Send + Sync {
    /// Load the latest snapshot bytes for a document, if any exist.
    fn load(&self, doc_id: Uuid) -> Result<Option<Vec<u8>>, StoreError>;

    /// Durably persist a snapshot, replacing the previous one.
    fn save(&self, doc_id: Uuid, snapshot: &[u8]) -> Result<(), StoreError>;
}

/// Storage errors.
#[derive(Debug, Clone)]
pub enum StoreError {
    /// Backend-internal failure (database, disk).
    Backend(String),
    /// Snapshot bytes could not be encoded/compressed.
    Encode(String),
    /// Stored bytes could not be decoded/decompressed.
    Decode(String),
    /// Injected failure (test backends only).
    Unavailable,
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::Backend(e) => write!(f, "Storage backend error: {e}"),
            StoreError::Encode(e) => write!(f, "Snapshot encode error: {e}"),
            StoreError::Decode(e) => write!(f, "Snapshot decode error: {e}"),
            StoreError::Unavailable => write!(f, "Storage unavailable"),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::Backend(e.to_string())
    }
}
