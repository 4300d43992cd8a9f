//! Per-document fan-out to N-1 peers with backpressure.
//!
//! Each open document gets one tokio broadcast channel carrying pre-encoded
//! frames as `Arc<Vec<u8>>`, so a delta is serialized once no matter how many
//! subscribers consume it. Every frame is tagged with the connection id it
//! was published for, so receivers can skip their own echoes without
//! suppressing frames from the same user's other connections. Subscribers
//! that lag past `capacity` buffered frames drop the oldest and
//! resynchronize via a handshake.
//!
//! Reference: Patterson & Hennessy, Section 6.4 — Interconnection Networks

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

use crate::protocol::{Identity, ProtocolError, SyncFrame};

/// Fan-out health counters.
#[derive(Debug, Clone, Default)]
pub struct TopicStats {
    pub frames_sent: u64,
    pub active_members: usize,
}

/// Lock-free counters so publish never takes a lock.
struct AtomicTopicStats {
    frames_sent: AtomicU64,
}

/// Fan-out channel for a single document.
///
/// Every connection subscribed to the document shares one broadcast sender;
/// a frame published by any member reaches all subscribers, and each
/// subscriber filters its own echoes (by origin connection id) and invisible
/// presence on receive.
pub struct DocumentTopic {
    sender: broadcast::Sender<(Uuid, Arc<Vec<u8>>)>,

    /// Subscribed connections, keyed by connection id.
    members: Arc<RwLock<HashMap<Uuid, Identity>>>,

    /// Frames buffered per receiver before lagging drops begin.
    capacity: usize,

    stats: Arc<AtomicTopicStats>,
}

impl DocumentTopic {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            members: Arc::new(RwLock::new(HashMap::new())),
            capacity,
            stats: Arc::new(AtomicTopicStats {
                frames_sent: AtomicU64::new(0),
            }),
        }
    }

    /// Register a connection and hand it a receiver.
    pub async fn join(
        &self,
        conn_id: Uuid,
        identity: Identity,
    ) -> broadcast::Receiver<(Uuid, Arc<Vec<u8>>)> {
        let mut members = self.members.write().await;
        members.insert(conn_id, identity);
        self.sender.subscribe()
    }

    /// Deregister a connection; returns its identity if it was a member.
    pub async fn leave(&self, conn_id: &Uuid) -> Option<Identity> {
        let mut members = self.members.write().await;
        members.remove(conn_id)
    }

    /// Encode a frame once and publish it to every subscriber.
    ///
    /// `origin` is the connection the frame came from; that receiver skips
    /// it, everyone else delivers it. Returns the number of receivers
    /// reached.
    pub fn publish(&self, origin: Uuid, frame: &SyncFrame) -> Result<usize, ProtocolError> {
        let encoded = Arc::new(frame.encode()?);
        Ok(self.publish_raw(origin, encoded))
    }

    /// Publish pre-encoded bytes (zero-copy fast path, lock-free).
    pub fn publish_raw(&self, origin: Uuid, encoded: Arc<Vec<u8>>) -> usize {
        let count = self.sender.send((origin, encoded)).unwrap_or(0);
        self.stats.frames_sent.fetch_add(1, Ordering::Relaxed);
        count
    }

    pub async fn member_count(&self) -> usize {
        self.members.read().await.len()
    }

    pub async fn members(&self) -> Vec<Identity> {
        self.members.read().await.values().cloned().collect()
    }

    pub async fn has_member(&self, conn_id: &Uuid) -> bool {
        self.members.read().await.contains_key(conn_id)
    }

    pub async fn stats(&self) -> TopicStats {
        let members = self.members.read().await;
        TopicStats {
            frames_sent: self.stats.frames_sent.load(Ordering::Relaxed),
            active_members: members.len(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Raw receiver without membership (used by document actors).
    pub fn subscribe(&self) -> broadcast::Receiver<(Uuid, Arc<Vec<u8>>)> {
        self.sender.subscribe()
    }
}

/// Maps document ids to their fan-out topics.
///
/// Topics are created on first open and removed once the last member leaves,
/// so an idle server holds no per-document state here.
pub struct TopicRegistry {
    topics: Arc<RwLock<HashMap<Uuid, Arc<DocumentTopic>>>>,
    default_capacity: usize,
}

impl TopicRegistry {
    pub fn new(default_capacity: usize) -> Self {
        Self {
            topics: Arc::new(RwLock::new(HashMap::new())),
            default_capacity,
        }
    }

    /// Get the topic for a document, creating it on first open.
    pub async fn get_or_create(&self, doc_id: Uuid) -> Arc<DocumentTopic> {
        // Fast path: read lock
        {
            let topics = self.topics.read().await;
            if let Some(topic) = topics.get(&doc_id) {
                return topic.clone();
            }
        }

        let mut topics = self.topics.write().await;
        // Double-check after acquiring write lock
        if let Some(topic) = topics.get(&doc_id) {
            return topic.clone();
        }

        let topic = Arc::new(DocumentTopic::new(self.default_capacity));
        topics.insert(doc_id, topic.clone());
        topic
    }

    pub async fn get(&self, doc_id: &Uuid) -> Option<Arc<DocumentTopic>> {
        self.topics.read().await.get(doc_id).cloned()
    }

    /// Drop the topic if no members remain.
    pub async fn remove_if_empty(&self, doc_id: &Uuid) -> bool {
        let mut topics = self.topics.write().await;
        if let Some(topic) = topics.get(doc_id) {
            if topic.member_count().await == 0 {
                topics.remove(doc_id);
                return true;
            }
        }
        false
    }

    pub async fn topic_count(&self) -> usize {
        self.topics.read().await.len()
    }

    pub async fn active_documents(&self) -> Vec<Uuid> {
        self.topics.read().await.keys().cloned().collect()
    }
}
