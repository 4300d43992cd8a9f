//! In-memory snapshot store for tests.
//!
//! Implements the same contract as the RocksDB backend plus a failure
//! switch: `fail_next_saves(n)` makes the next `n` saves return
//! `StoreError::Unavailable`, which exercises the actor's retry path
//! without touching a real database.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Mutex;
use uuid::Uuid;

use super::{SnapshotStore, StoreError};

#[derive(Default)]
pub struct MemoryStore {
    snapshots: Mutex<HashMap<Uuid, Vec<u8>>>,
    failing_saves: AtomicU32,
    save_attempts: AtomicU64,
    save_successes: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` saves fail with `StoreError::Unavailable`.
    pub fn fail_next_saves(&self, n: u32) {
        self.failing_saves.store(n, Ordering::SeqCst);
    }

    /// Total saves attempted, including failed ones.
    pub fn save_attempts(&self) -> u64 {
        self.save_attempts.load(Ordering::SeqCst)
    }

    /// Saves that actually persisted.
    pub fn save_successes(&self) -> u64 {
        self.save_successes.load(Ordering::SeqCst)
    }

    pub fn document_count(&self) -> usize {
        self.snapshots.lock().map(|m| m.len()).unwrap_or(0)
    }
}

impl SnapshotStore for MemoryStore {
    fn load(&self, doc_id: Uuid) -> Result<Option<Vec<u8>>, StoreError> {
        let snapshots = self
            .snapshots
            .lock()
            .map_err(|_| StoreError::Backend("store mutex poisoned".into()))?;
        Ok(snapshots.get(&doc_id).cloned())
    }

    fn save(&self, doc_id: Uuid, snapshot: &[u8]) -> Result<(), StoreError> {
        self.save_attempts.fetch_add(1, Ordering::SeqCst);

        // Consume one failure token, if armed.
        let mut remaining = self.failing_saves.load(Ordering::SeqCst);
        while remaining > 0 {
            match self.failing_saves.compare_exchange(
                remaining,
                remaining - 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return Err(StoreError::Unavailable),
                Err(current) => remaining = current,
            }
        }

        let mut snapshots = self
            .snapshots
            .lock()
            .map_err(|_| StoreError::Backend("store mutex poisoned".into()))?;
        snapshots.insert(doc_id, snapshot.to_vec());
        self.save_successes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
