//! Per-document persistence actors.
//!
//! Each open document gets one tokio task owning the authoritative
//! [`DocumentReplica`] and a handle to the snapshot store. The actor's
//! mailbox totally orders ingestion for that document; distinct documents
//! run on distinct actors and never contend.
//!
//! ```text
//! connection ──┐
//! connection ──┼─► mpsc mailbox ─► DocumentActor ──► topic fan-out
//! connection ──┘                        │
//!                                 periodic flush
//!                                        │
//!                              spawn_blocking(store.save)
//! ```
//!
//! Storage failure never stalls the document: the in-memory replica keeps
//! merging and rebroadcasting while the flush retries with exponential
//! backoff.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, RwLock};
use tokio::time::Instant;
use uuid::Uuid;

use crate::broadcast::DocumentTopic;
use crate::replica::{Applied, BlockView, Delta, DocumentReplica, ReplicaError, StateVector};
use crate::storage::{SnapshotStore, StoreError};

/// Actor timing and retry knobs.
#[derive(Debug, Clone)]
pub struct ActorConfig {
    /// Interval between snapshot flushes while the document is dirty.
    pub flush_interval: Duration,
    /// First retry delay after a failed flush.
    pub retry_base: Duration,
    /// Retry delay ceiling.
    pub retry_cap: Duration,
    /// Mailbox depth before senders back off.
    pub mailbox_capacity: usize,
}

impl Default for ActorConfig {
    fn default() -> Self {
        Self {
            flush_interval: Duration::from_secs(2),
            retry_base: Duration::from_millis(500),
            retry_cap: Duration::from_secs(10),
            mailbox_capacity: 256,
        }
    }
}

/// Actor errors surfaced to callers.
#[derive(Debug)]
pub enum ActorError {
    /// The actor task is gone (shut down or panicked).
    Closed,
    Store(StoreError),
    Replica(ReplicaError),
}

impl std::fmt::Display for ActorError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ActorError::Closed => write!(f, "Document actor closed"),
            ActorError::Store(e) => write!(f, "Snapshot store error: {e}"),
            ActorError::Replica(e) => write!(f, "Replica error: {e}"),
        }
    }
}

impl std::error::Error for ActorError {}

impl From<StoreError> for ActorError {
    fn from(e: StoreError) -> Self {
        ActorError::Store(e)
    }
}

impl From<ReplicaError> for ActorError {
    fn from(e: ReplicaError) -> Self {
        ActorError::Replica(e)
    }
}

enum ActorMsg {
    /// Merge a delta and rebroadcast the pre-encoded frame it arrived in,
    /// tagged with the connection that sent it.
    Ingest {
        delta: Delta,
        frame: Option<(Uuid, Arc<Vec<u8>>)>,
        ack: oneshot::Sender<Applied>,
    },
    /// Catch-up diff plus the actor's own state vector for the reply leg.
    SnapshotFor {
        state_vector: StateVector,
        reply: oneshot::Sender<(Delta, StateVector)>,
    },
    /// Materialized block list (used by tests and admin surfaces).
    Content {
        reply: oneshot::Sender<Vec<BlockView>>,
    },
    /// Persist now; replies with the store's verdict.
    Flush {
        reply: oneshot::Sender<Result<(), StoreError>>,
    },
    /// Final flush attempt, then stop.
    Shutdown {
        reply: oneshot::Sender<Result<(), StoreError>>,
    },
}

/// Cloneable handle to one document's actor.
#[derive(Clone)]
pub struct DocumentHandle {
    doc_id: Uuid,
    tx: mpsc::Sender<ActorMsg>,
}

impl DocumentHandle {
    pub fn doc_id(&self) -> Uuid {
        self.doc_id
    }

    /// Handle with no actor behind it; every call returns `Closed`.
    #[cfg(test)]
    pub(crate) fn dangling_for_tests() -> Self {
        let (tx, _rx) = mpsc::channel(1);
        Self {
            doc_id: Uuid::nil(),
            tx,
        }
    }

    /// Merge a remote delta into the authoritative replica.
    ///
    /// `frame` is the pre-encoded wire frame the delta arrived in, paired
    /// with the originating connection id; when present it is rebroadcast to
    /// the document topic after the merge so the origin can skip its echo.
    pub async fn ingest(
        &self,
        delta: Delta,
        frame: Option<(Uuid, Arc<Vec<u8>>)>,
    ) -> Result<Applied, ActorError> {
        let (ack, rx) = oneshot::channel();
        self.tx
            .send(ActorMsg::Ingest { delta, frame, ack })
            .await
            .map_err(|_| ActorError::Closed)?;
        rx.await.map_err(|_| ActorError::Closed)
    }

    /// Diff for a joining client, with the actor's state vector.
    pub async fn snapshot_for(
        &self,
        state_vector: StateVector,
    ) -> Result<(Delta, StateVector), ActorError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(ActorMsg::SnapshotFor {
                state_vector,
                reply,
            })
            .await
            .map_err(|_| ActorError::Closed)?;
        rx.await.map_err(|_| ActorError::Closed)
    }

    /// Current materialized content.
    pub async fn content(&self) -> Result<Vec<BlockView>, ActorError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(ActorMsg::Content { reply })
            .await
            .map_err(|_| ActorError::Closed)?;
        rx.await.map_err(|_| ActorError::Closed)
    }

    /// Persist immediately.
    pub async fn flush(&self) -> Result<(), ActorError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(ActorMsg::Flush { reply })
            .await
            .map_err(|_| ActorError::Closed)?;
        rx.await.map_err(|_| ActorError::Closed)?.map_err(Into::into)
    }

    /// Final flush, then stop the actor task.
    pub async fn shutdown(&self) -> Result<(), ActorError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(ActorMsg::Shutdown { reply })
            .await
            .map_err(|_| ActorError::Closed)?;
        rx.await.map_err(|_| ActorError::Closed)?.map_err(Into::into)
    }
}

/// Spawn the actor for a document, recovering from the last snapshot.
pub async fn spawn_actor(
    doc_id: Uuid,
    store: Arc<dyn SnapshotStore>,
    topic: Arc<DocumentTopic>,
    config: ActorConfig,
) -> Result<DocumentHandle, ActorError> {
    let replica = recover(doc_id, store.clone()).await?;
    let (tx, rx) = mpsc::channel(config.mailbox_capacity);

    tokio::spawn(run_actor(replica, store, topic, config, rx));

    Ok(DocumentHandle { doc_id, tx })
}

/// Load and decode the last snapshot, or start fresh.
async fn recover(doc_id: Uuid, store: Arc<dyn SnapshotStore>) -> Result<DocumentReplica, ActorError> {
    let loaded = tokio::task::spawn_blocking(move || store.load(doc_id))
        .await
        .map_err(|e| StoreError::Backend(e.to_string()))??;

    match loaded {
        Some(bytes) => {
            let replica = DocumentReplica::decode(&bytes)?;
            log::info!(
                "Recovered document {doc_id} from snapshot ({} blocks)",
                replica.arena_len()
            );
            Ok(replica)
        }
        None => {
            log::info!("No snapshot for document {doc_id}, starting fresh");
            Ok(DocumentReplica::new(doc_id))
        }
    }
}

async fn run_actor(
    mut replica: DocumentReplica,
    store: Arc<dyn SnapshotStore>,
    topic: Arc<DocumentTopic>,
    config: ActorConfig,
    mut rx: mpsc::Receiver<ActorMsg>,
) {
    let doc_id = replica.doc_id();
    let mut dirty = false;
    let mut failures: u32 = 0;
    let mut next_flush = Instant::now() + config.flush_interval;

    loop {
        tokio::select! {
            maybe = rx.recv() => {
                let msg = match maybe {
                    Some(msg) => msg,
                    // All handles dropped.
                    None => break,
                };
                match msg {
                    ActorMsg::Ingest { delta, frame, ack } => {
                        let applied = replica.apply_remote(&delta);
                        if matches!(applied, Applied::Changed(_)) {
                            dirty = true;
                            if let Some((origin, frame)) = frame {
                                topic.publish_raw(origin, frame);
                            }
                        }
                        let _ = ack.send(applied);
                    }
                    ActorMsg::SnapshotFor { state_vector, reply } => {
                        let diff = replica.diff_since(&state_vector);
                        let _ = reply.send((diff, replica.state_vector().clone()));
                    }
                    ActorMsg::Content { reply } => {
                        let _ = reply.send(replica.blocks());
                    }
                    ActorMsg::Flush { reply } => {
                        let result = flush(&replica, &store).await;
                        match &result {
                            Ok(()) => {
                                dirty = false;
                                failures = 0;
                                next_flush = Instant::now() + config.flush_interval;
                            }
                            Err(e) => {
                                failures += 1;
                                log::warn!("Flush failed for document {doc_id}: {e}");
                            }
                        }
                        let _ = reply.send(result);
                    }
                    ActorMsg::Shutdown { reply } => {
                        let result = if dirty {
                            flush(&replica, &store).await
                        } else {
                            Ok(())
                        };
                        if let Err(e) = &result {
                            log::error!("Final flush failed for document {doc_id}: {e}");
                        }
                        let _ = reply.send(result);
                        break;
                    }
                }
            }
            _ = tokio::time::sleep_until(next_flush) => {
                if dirty {
                    match flush(&replica, &store).await {
                        Ok(()) => {
                            dirty = false;
                            failures = 0;
                            next_flush = Instant::now() + config.flush_interval;
                        }
                        Err(e) => {
                            failures += 1;
                            let delay = retry_delay(&config, failures);
                            log::warn!(
                                "Flush failed for document {doc_id} (attempt {failures}), \
                                 retrying in {delay:?}: {e}"
                            );
                            next_flush = Instant::now() + delay;
                        }
                    }
                } else {
                    next_flush = Instant::now() + config.flush_interval;
                }
            }
        }
    }

    log::debug!("Actor for document {doc_id} stopped");
}

/// Exponential backoff, capped.
fn retry_delay(config: &ActorConfig, failures: u32) -> Duration {
    let exp = failures.saturating_sub(1).min(16);
    let delay = config.retry_base.saturating_mul(1u32 << exp);
    delay.min(config.retry_cap)
}

/// Encode the replica and persist it off the async runtime.
async fn flush(replica: &DocumentReplica, store: &Arc<dyn SnapshotStore>) -> Result<(), StoreError> {
    let bytes = replica
        .encode()
        .map_err(|e| StoreError::Encode(e.to_string()))?;
    let doc_id = replica.doc_id();
    let store = store.clone();
    tokio::task::spawn_blocking(move || store.save(doc_id, &bytes))
        .await
        .map_err(|e| StoreError::Backend(e.to_string()))?
}

/// Per-document actor registry: create on first open, retire when idle.
pub struct ActorRegistry {
    actors: RwLock<HashMap<Uuid, DocumentHandle>>,
    store: Arc<dyn SnapshotStore>,
    config: ActorConfig,
}

impl ActorRegistry {
    pub fn new(store: Arc<dyn SnapshotStore>, config: ActorConfig) -> Self {
        Self {
            actors: RwLock::new(HashMap::new()),
            store,
            config,
        }
    }

    /// Get the actor for a document, spawning it on first open.
    pub async fn get_or_create(
        &self,
        doc_id: Uuid,
        topic: Arc<DocumentTopic>,
    ) -> Result<DocumentHandle, ActorError> {
        {
            let actors = self.actors.read().await;
            if let Some(handle) = actors.get(&doc_id) {
                return Ok(handle.clone());
            }
        }

        let mut actors = self.actors.write().await;
        if let Some(handle) = actors.get(&doc_id) {
            return Ok(handle.clone());
        }

        let handle = spawn_actor(doc_id, self.store.clone(), topic, self.config.clone()).await?;
        actors.insert(doc_id, handle.clone());
        Ok(handle)
    }

    pub async fn get(&self, doc_id: &Uuid) -> Option<DocumentHandle> {
        self.actors.read().await.get(doc_id).cloned()
    }

    /// Retire the actor once the last client has left its topic.
    ///
    /// Requires a clean final flush; a dirty actor that cannot persist
    /// stays resident and keeps retrying.
    pub async fn retire_if_idle(&self, doc_id: &Uuid, topic: &DocumentTopic) -> bool {
        if topic.member_count().await > 0 {
            return false;
        }

        let handle = {
            let actors = self.actors.read().await;
            match actors.get(doc_id) {
                Some(handle) => handle.clone(),
                None => return false,
            }
        };

        if handle.flush().await.is_err() {
            return false;
        }

        let mut actors = self.actors.write().await;
        if let Some(handle) = actors.remove(doc_id) {
            let _ = handle.shutdown().await;
            log::info!("Retired idle document actor {doc_id}");
            return true;
        }
        false
    }

    pub async fn actor_count(&self) -> usize {
        self.actors.read().await.len()
    }
}
