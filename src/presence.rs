//! Ephemeral presence: who is viewing a document and where their cursor is.
//!
//! Presence is advisory, last-write-wins per user, and never durable — it
//! flows on its own channel and never touches the persistence actor. Each
//! client republishes its own record on a fixed heartbeat even without cursor
//! movement; a record not refreshed within the liveness timeout is evicted
//! and a synthetic leave event fires exactly once.
//!
//! ```text
//! Local cursor move
//!       │
//!       ▼
//! PresencePublisher::update_cursor()   (debounced; anchor changes publish
//!       │                               immediately, small moves wait for
//!       ▼                               the heartbeat tick)
//! PresenceUpdate::Refresh { … }
//!       │        (fan-out, server filters on visible_to)
//!       ▼
//! Remote PresenceRoom::handle_update() ──► PresenceEvent stream to the UI
//! ```

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::time::{Duration, Instant};
use uuid::Uuid;

use crate::protocol::Identity;
use crate::replica::OpId;

/// A cursor location anchored to a block, stable across remote edits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CursorAnchor {
    pub block: OpId,
    pub offset: u32,
}

/// One user's ephemeral presence state.
///
/// At most one live record exists per `(document, user)`; newer `last_seen`
/// values win, no merge is needed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceRecord {
    pub user_id: Uuid,
    pub display_name: String,
    pub color: [f32; 4],
    pub cursor: Option<CursorAnchor>,
    /// Restrict who may see this cursor; `None` broadcasts to everyone.
    pub visible_to: Option<BTreeSet<Uuid>>,
    /// Sender-monotonic counter; receivers drop records older than the one
    /// they already hold.
    pub last_seen: u64,
}

impl PresenceRecord {
    /// Whether `viewer` is allowed to see this record.
    pub fn visible_to_user(&self, viewer: &Uuid) -> bool {
        if *viewer == self.user_id {
            return true;
        }
        match &self.visible_to {
            None => true,
            Some(set) => set.contains(viewer),
        }
    }
}

/// Presence channel payloads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PresenceUpdate {
    /// Join or refresh; carries the full record (LWW).
    Refresh(PresenceRecord),
    /// Clean departure.
    Leave { user_id: Uuid },
}

impl PresenceUpdate {
    pub fn user_id(&self) -> Uuid {
        match self {
            PresenceUpdate::Refresh(r) => r.user_id,
            PresenceUpdate::Leave { user_id } => *user_id,
        }
    }

    /// Whether this update may be forwarded to `viewer`.
    ///
    /// Leaves are always forwarded so every subscriber can drop the record.
    pub fn visible_to_user(&self, viewer: &Uuid) -> bool {
        match self {
            PresenceUpdate::Refresh(r) => r.visible_to_user(viewer),
            PresenceUpdate::Leave { .. } => true,
        }
    }
}

/// Events delivered to the host UI.
#[derive(Debug, Clone, PartialEq)]
pub enum PresenceEvent {
    Joined(PresenceRecord),
    Updated(PresenceRecord),
    /// Explicit leave or liveness eviction.
    Left(Uuid),
}

/// Presence timing knobs.
#[derive(Debug, Clone)]
pub struct PresenceConfig {
    /// Fixed republish interval, movement or not.
    pub heartbeat_interval: Duration,
    /// Minimum gap between cursor-move publishes (debounce).
    pub min_publish_interval: Duration,
    /// Evict records not refreshed within this window.
    pub liveness_timeout: Duration,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(5),
            min_publish_interval: Duration::from_millis(100),
            liveness_timeout: Duration::from_secs(30),
        }
    }
}

/// Tracks remote presence records for one document.
pub struct PresenceRoom {
    local_user: Uuid,
    peers: HashMap<Uuid, (PresenceRecord, Instant)>,
    liveness_timeout: Duration,
}

impl PresenceRoom {
    pub fn new(local_user: Uuid, config: &PresenceConfig) -> Self {
        Self {
            local_user,
            peers: HashMap::new(),
            liveness_timeout: config.liveness_timeout,
        }
    }

    /// Apply an incoming update; returns the event to surface, if any.
    ///
    /// Own echoes and stale records (older `last_seen` than what we hold)
    /// are dropped.
    pub fn handle_update(&mut self, update: &PresenceUpdate) -> Option<PresenceEvent> {
        if update.user_id() == self.local_user {
            return None;
        }
        match update {
            PresenceUpdate::Refresh(record) => {
                match self.peers.get(&record.user_id) {
                    Some((held, _)) if held.last_seen > record.last_seen => None,
                    Some(_) => {
                        self.peers
                            .insert(record.user_id, (record.clone(), Instant::now()));
                        Some(PresenceEvent::Updated(record.clone()))
                    }
                    None => {
                        self.peers
                            .insert(record.user_id, (record.clone(), Instant::now()));
                        Some(PresenceEvent::Joined(record.clone()))
                    }
                }
            }
            PresenceUpdate::Leave { user_id } => self
                .peers
                .remove(user_id)
                .map(|_| PresenceEvent::Left(*user_id)),
        }
    }

    /// Evict peers whose records have gone stale.
    ///
    /// Removal happens here, so a given peer produces at most one `Left`.
    pub fn sweep(&mut self) -> Vec<PresenceEvent> {
        let timeout = self.liveness_timeout;
        let stale: Vec<Uuid> = self
            .peers
            .iter()
            .filter(|(_, (_, seen))| seen.elapsed() > timeout)
            .map(|(id, _)| *id)
            .collect();
        stale
            .into_iter()
            .map(|id| {
                self.peers.remove(&id);
                PresenceEvent::Left(id)
            })
            .collect()
    }

    /// Live view of all remote records.
    pub fn records(&self) -> Vec<PresenceRecord> {
        self.peers.values().map(|(r, _)| r.clone()).collect()
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    pub fn peer(&self, user_id: &Uuid) -> Option<&PresenceRecord> {
        self.peers.get(user_id).map(|(r, _)| r)
    }
}

/// Builds and paces the local user's outgoing presence updates.
///
/// Publishing is timer-driven: [`tick`] fires on the heartbeat interval and
/// always republishes, while [`update_cursor`] publishes immediately only for
/// significant changes (a different block anchor) or when the debounce window
/// has passed. Small moves ride the next heartbeat.
///
/// [`tick`]: PresencePublisher::tick
/// [`update_cursor`]: PresencePublisher::update_cursor
pub struct PresencePublisher {
    identity: Identity,
    cursor: Option<CursorAnchor>,
    visible_to: Option<BTreeSet<Uuid>>,
    counter: u64,
    last_published: Instant,
    min_publish_interval: Duration,
}

impl PresencePublisher {
    pub fn new(identity: Identity, config: &PresenceConfig) -> Self {
        Self {
            identity,
            cursor: None,
            visible_to: None,
            counter: 0,
            // Allow an immediate first publish.
            last_published: Instant::now()
                .checked_sub(config.heartbeat_interval)
                .unwrap_or_else(Instant::now),
            min_publish_interval: config.min_publish_interval,
        }
    }

    /// Record a cursor move; returns an update if it should go out now.
    pub fn update_cursor(
        &mut self,
        cursor: Option<CursorAnchor>,
        visible_to: Option<BTreeSet<Uuid>>,
    ) -> Option<PresenceUpdate> {
        let significant = match (&self.cursor, &cursor) {
            (Some(a), Some(b)) => a.block != b.block,
            (a, b) => a.is_some() != b.is_some(),
        } || self.visible_to != visible_to;

        self.cursor = cursor;
        self.visible_to = visible_to;

        if significant || self.last_published.elapsed() >= self.min_publish_interval {
            Some(self.refresh())
        } else {
            None
        }
    }

    /// Heartbeat: always republish, movement or not.
    pub fn tick(&mut self) -> PresenceUpdate {
        self.refresh()
    }

    /// Clean departure announcement.
    pub fn leave(&self) -> PresenceUpdate {
        PresenceUpdate::Leave {
            user_id: self.identity.user_id,
        }
    }

    pub fn user_id(&self) -> Uuid {
        self.identity.user_id
    }

    fn refresh(&mut self) -> PresenceUpdate {
        self.counter += 1;
        self.last_published = Instant::now();
        PresenceUpdate::Refresh(PresenceRecord {
            user_id: self.identity.user_id,
            display_name: self.identity.display_name.clone(),
            color: self.identity.color,
            cursor: self.cursor,
            visible_to: self.visible_to.clone(),
            last_seen: self.counter,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn anchor(seq: u64) -> CursorAnchor {
        CursorAnchor {
            block: OpId::new(Uuid::from_u128(1), seq),
            offset: 0,
        }
    }

    fn record(user: u128, last_seen: u64) -> PresenceRecord {
        PresenceRecord {
            user_id: Uuid::from_u128(user),
            display_name: format!("user-{user}"),
            color: [0.5, 0.5, 0.5, 1.0],
            cursor: Some(anchor(1)),
            visible_to: None,
            last_seen,
        }
    }

    fn room(local: u128) -> PresenceRoom {
        PresenceRoom::new(Uuid::from_u128(local), &PresenceConfig::default())
    }

    #[test]
    fn test_join_then_update_events() {
        let mut room = room(1);
        let joined = room.handle_update(&PresenceUpdate::Refresh(record(2, 1)));
        assert!(matches!(joined, Some(PresenceEvent::Joined(_))));

        let updated = room.handle_update(&PresenceUpdate::Refresh(record(2, 2)));
        assert!(matches!(updated, Some(PresenceEvent::Updated(_))));
        assert_eq!(room.peer_count(), 1);
    }

    #[test]
    fn test_own_echo_ignored() {
        let mut room = room(7);
        assert!(room
            .handle_update(&PresenceUpdate::Refresh(record(7, 1)))
            .is_none());
        assert_eq!(room.peer_count(), 0);
    }

    #[test]
    fn test_stale_record_dropped() {
        let mut room = room(1);
        room.handle_update(&PresenceUpdate::Refresh(record(2, 5)));
        assert!(room
            .handle_update(&PresenceUpdate::Refresh(record(2, 3)))
            .is_none());
        assert_eq!(room.peer(&Uuid::from_u128(2)).unwrap().last_seen, 5);
    }

    #[test]
    fn test_explicit_leave_removes_record() {
        let mut room = room(1);
        room.handle_update(&PresenceUpdate::Refresh(record(2, 1)));
        let left = room.handle_update(&PresenceUpdate::Leave {
            user_id: Uuid::from_u128(2),
        });
        assert_eq!(left, Some(PresenceEvent::Left(Uuid::from_u128(2))));
        assert_eq!(room.peer_count(), 0);

        // Second leave for the same user emits nothing.
        assert!(room
            .handle_update(&PresenceUpdate::Leave {
                user_id: Uuid::from_u128(2),
            })
            .is_none());
    }

    #[test]
    fn test_liveness_eviction_fires_exactly_once() {
        let config = PresenceConfig {
            liveness_timeout: Duration::from_millis(0),
            ..PresenceConfig::default()
        };
        let mut room = PresenceRoom::new(Uuid::from_u128(1), &config);
        room.handle_update(&PresenceUpdate::Refresh(record(2, 1)));

        std::thread::sleep(Duration::from_millis(5));
        let evicted = room.sweep();
        assert_eq!(evicted, vec![PresenceEvent::Left(Uuid::from_u128(2))]);
        assert!(room.sweep().is_empty());
    }

    #[test]
    fn test_visibility_restricted_record() {
        let owner = Uuid::from_u128(10);
        let friend = Uuid::from_u128(11);
        let stranger = Uuid::from_u128(12);

        let mut rec = record(10, 1);
        rec.visible_to = Some(BTreeSet::from([friend]));

        assert!(rec.visible_to_user(&friend));
        assert!(rec.visible_to_user(&owner));
        assert!(!rec.visible_to_user(&stranger));

        let update = PresenceUpdate::Refresh(rec);
        assert!(!update.visible_to_user(&stranger));
        let leave = PresenceUpdate::Leave { user_id: owner };
        assert!(leave.visible_to_user(&stranger));
    }

    #[test]
    fn test_unrestricted_record_visible_to_all() {
        let rec = record(10, 1);
        assert!(rec.visible_to_user(&Uuid::from_u128(99)));
    }

    #[test]
    fn test_publisher_debounces_small_moves() {
        let identity = Identity::new(Uuid::from_u128(1), "Alice");
        let config = PresenceConfig {
            min_publish_interval: Duration::from_secs(60),
            ..PresenceConfig::default()
        };
        let mut publisher = PresencePublisher::new(identity, &config);

        // First move: anchor appears, significant.
        assert!(publisher.update_cursor(Some(anchor(1)), None).is_some());
        // Offset-only move within the same block: debounced.
        let mut moved = anchor(1);
        moved.offset = 9;
        assert!(publisher.update_cursor(Some(moved), None).is_none());
        // Different block: significant, publishes immediately.
        assert!(publisher.update_cursor(Some(anchor(2)), None).is_some());
    }

    #[test]
    fn test_publisher_visibility_change_is_significant() {
        let identity = Identity::new(Uuid::from_u128(1), "Alice");
        let config = PresenceConfig {
            min_publish_interval: Duration::from_secs(60),
            ..PresenceConfig::default()
        };
        let mut publisher = PresencePublisher::new(identity, &config);
        publisher.update_cursor(Some(anchor(1)), None);

        let restricted = Some(BTreeSet::from([Uuid::from_u128(2)]));
        let update = publisher.update_cursor(Some(anchor(1)), restricted.clone());
        match update {
            Some(PresenceUpdate::Refresh(rec)) => assert_eq!(rec.visible_to, restricted),
            other => panic!("expected refresh, got {other:?}"),
        }
    }

    #[test]
    fn test_heartbeat_always_publishes_and_counts_up() {
        let identity = Identity::new(Uuid::from_u128(1), "Alice");
        let mut publisher = PresencePublisher::new(identity, &PresenceConfig::default());

        let t1 = match publisher.tick() {
            PresenceUpdate::Refresh(r) => r.last_seen,
            other => panic!("expected refresh, got {other:?}"),
        };
        let t2 = match publisher.tick() {
            PresenceUpdate::Refresh(r) => r.last_seen,
            other => panic!("expected refresh, got {other:?}"),
        };
        assert!(t2 > t1);
    }

    #[test]
    fn test_leave_carries_user_id() {
        let identity = Identity::new(Uuid::from_u128(42), "Alice");
        let publisher = PresencePublisher::new(identity, &PresenceConfig::default());
        assert_eq!(
            publisher.leave(),
            PresenceUpdate::Leave {
                user_id: Uuid::from_u128(42)
            }
        );
    }
}
