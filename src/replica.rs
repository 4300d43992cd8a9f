//! Block-sequence CRDT replica store.
//!
//! Each document is a sequence of rich-text blocks replicated without a
//! central lock. Blocks live in an id-addressed arena (no pointers); document
//! order is the pre-order traversal of the origin tree with siblings ordered
//! by descending op id, so concurrent insertions at the same anchor tie-break
//! deterministically by origin id.
//!
//! Merge model:
//! - Inserts are set-union: an insert is integrated once, duplicates skipped.
//! - Deletes are tombstones, never removals.
//! - Text and attribute updates are last-writer-wins keyed by op id.
//!
//! Applying the same set of operations in any order, any number of times,
//! yields byte-identical content on every replica.
//!
//! Reference: Kleppmann, Chapter 5 — Replication

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use uuid::Uuid;

/// Globally unique operation identifier.
///
/// Totally ordered by `(seq, replica)`. The sequence component is a Lamport
/// timestamp (one past everything the issuing replica had observed), so a
/// causally-later operation always compares greater regardless of origin
/// replica; only concurrent operations fall back to the replica-id tie-break.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OpId {
    pub replica: Uuid,
    pub seq: u64,
}

impl OpId {
    pub fn new(replica: Uuid, seq: u64) -> Self {
        Self { replica, seq }
    }
}

impl Ord for OpId {
    fn cmp(&self, other: &Self) -> Ordering {
        self.seq
            .cmp(&other.seq)
            .then_with(|| self.replica.cmp(&other.replica))
    }
}

impl PartialOrd for OpId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Per-replica record of the highest applied operation sequence number.
///
/// Used to detect duplicates and to compute the minimal catch-up diff.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateVector {
    clocks: BTreeMap<Uuid, u64>,
}

impl StateVector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Highest sequence number seen from `replica` (0 = nothing seen).
    pub fn get(&self, replica: &Uuid) -> u64 {
        self.clocks.get(replica).copied().unwrap_or(0)
    }

    /// Whether `id` is already reflected in this vector.
    pub fn contains(&self, id: &OpId) -> bool {
        id.seq <= self.get(&id.replica)
    }

    /// Highest sequence number observed from any replica.
    pub fn max_seq(&self) -> u64 {
        self.clocks.values().copied().max().unwrap_or(0)
    }

    /// Record `id` as applied.
    pub fn observe(&mut self, id: &OpId) {
        let entry = self.clocks.entry(id.replica).or_insert(0);
        *entry = (*entry).max(id.seq);
    }

    /// Pointwise maximum with another vector.
    pub fn merge(&mut self, other: &StateVector) {
        for (replica, &seq) in &other.clocks {
            let entry = self.clocks.entry(*replica).or_insert(0);
            *entry = (*entry).max(seq);
        }
    }

    /// Whether this vector covers everything `other` covers.
    pub fn dominates(&self, other: &StateVector) -> bool {
        other
            .clocks
            .iter()
            .all(|(replica, &seq)| self.get(replica) >= seq)
    }

    pub fn is_empty(&self) -> bool {
        self.clocks.is_empty()
    }

    pub fn encode(&self) -> Result<Vec<u8>, ReplicaError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ReplicaError::Encode(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ReplicaError> {
        let (sv, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ReplicaError::Decode(e.to_string()))?;
        Ok(sv)
    }
}

/// A self-describing CRDT operation.
///
/// Operations carry their own addressing (`id`, anchor references) and can be
/// applied to any replica without external context. Never mutated once
/// created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Operation {
    /// Insert a new block after `origin` (`None` = document head).
    InsertBlock {
        id: OpId,
        origin: Option<OpId>,
        author: Uuid,
        text: String,
    },
    /// Tombstone `target`. The block is retained so concurrent operations
    /// referencing it still merge safely.
    DeleteBlock { id: OpId, target: OpId },
    /// Replace the text of `target`, last-writer-wins by op id.
    SetText {
        id: OpId,
        target: OpId,
        text: String,
    },
    /// Set one attribute of `target`, last-writer-wins per key by op id.
    SetAttr {
        id: OpId,
        target: OpId,
        key: String,
        value: String,
    },
}

impl Operation {
    pub fn id(&self) -> OpId {
        match self {
            Operation::InsertBlock { id, .. }
            | Operation::DeleteBlock { id, .. }
            | Operation::SetText { id, .. }
            | Operation::SetAttr { id, .. } => *id,
        }
    }

    /// The op this one must be integrated after, if any.
    fn dependency(&self) -> Option<OpId> {
        match self {
            Operation::InsertBlock { origin, .. } => *origin,
            Operation::DeleteBlock { target, .. }
            | Operation::SetText { target, .. }
            | Operation::SetAttr { target, .. } => Some(*target),
        }
    }
}

/// Wire format version for encoded deltas.
const DELTA_VERSION: u8 = 1;

/// A self-contained batch of operations transmitted between replicas.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Delta {
    pub ops: Vec<Operation>,
}

impl Delta {
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// Serialize with a leading format version byte.
    pub fn encode(&self) -> Result<Vec<u8>, ReplicaError> {
        let body = bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ReplicaError::Encode(e.to_string()))?;
        let mut out = Vec::with_capacity(body.len() + 1);
        out.push(DELTA_VERSION);
        out.extend_from_slice(&body);
        Ok(out)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ReplicaError> {
        match bytes.first() {
            Some(&DELTA_VERSION) => {}
            Some(&v) => return Err(ReplicaError::Decode(format!("unknown delta version {v}"))),
            None => return Err(ReplicaError::Decode("empty delta".into())),
        }
        let (delta, _) =
            bincode::serde::decode_from_slice(&bytes[1..], bincode::config::standard())
                .map_err(|e| ReplicaError::Decode(e.to_string()))?;
        Ok(delta)
    }
}

/// A local mutation intent from the editor.
///
/// Edits referencing unknown or deleted blocks are normalized, not rejected:
/// an unknown insert anchor falls back to the document head, a delete of an
/// already-deleted block is a no-op.
#[derive(Debug, Clone, PartialEq)]
pub enum Edit {
    InsertAfter { after: Option<OpId>, text: String },
    Delete { block: OpId },
    SetText { block: OpId, text: String },
    SetAttr { block: OpId, key: String, value: String },
}

/// Outcome of applying a remote delta.
#[derive(Debug, Clone, PartialEq)]
pub enum Applied {
    /// At least one operation integrated; the listed blocks changed.
    Changed(Vec<OpId>),
    /// Every operation was a duplicate (or deferred awaiting its anchor).
    Noop,
}

/// One block in the arena.
///
/// `insert_text` is the payload of the original insert and never changes; it
/// is what `diff_since` re-emits so reconstructed inserts are identical to
/// the originals. `text` and `attrs` carry the LWW tag of their last writer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Block {
    origin: Option<OpId>,
    author: Uuid,
    insert_text: String,
    text: (OpId, String),
    tombstone: Option<OpId>,
    attrs: BTreeMap<String, (OpId, String)>,
}

/// A visible block materialized for the host editor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockView {
    pub id: OpId,
    pub author: Uuid,
    pub text: String,
    pub attrs: BTreeMap<String, String>,
}

/// Replica errors (encode/decode only — merge itself is total).
#[derive(Debug, Clone)]
pub enum ReplicaError {
    Encode(String),
    Decode(String),
}

impl std::fmt::Display for ReplicaError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReplicaError::Encode(e) => write!(f, "Encode error: {e}"),
            ReplicaError::Decode(e) => write!(f, "Decode error: {e}"),
        }
    }
}

impl std::error::Error for ReplicaError {}

/// One CRDT-replicated document.
///
/// Created on first open of a document by a client, or by the persistence
/// actor on first write. All mutation goes through [`apply_local`] and
/// [`apply_remote`]; both are safe under duplicate and out-of-order delivery.
///
/// [`apply_local`]: DocumentReplica::apply_local
/// [`apply_remote`]: DocumentReplica::apply_remote
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentReplica {
    doc_id: Uuid,
    replica_id: Uuid,
    arena: BTreeMap<OpId, Block>,
    state_vector: StateVector,
    /// Locally generated ops not yet acknowledged by the persistence actor.
    #[serde(skip)]
    pending_local: Vec<Operation>,
    /// Remote ops waiting for their anchor to arrive.
    #[serde(skip)]
    deferred: Vec<Operation>,
    /// Sibling lists per origin, sorted descending by op id.
    #[serde(skip)]
    children: HashMap<Option<OpId>, Vec<OpId>>,
}

impl DocumentReplica {
    /// Create an empty replica with a fresh replica id.
    pub fn new(doc_id: Uuid) -> Self {
        Self::with_replica_id(doc_id, Uuid::new_v4())
    }

    /// Create with an explicit replica id (for tests and recovery).
    pub fn with_replica_id(doc_id: Uuid, replica_id: Uuid) -> Self {
        Self {
            doc_id,
            replica_id,
            arena: BTreeMap::new(),
            state_vector: StateVector::new(),
            pending_local: Vec::new(),
            deferred: Vec::new(),
            children: HashMap::new(),
        }
    }

    pub fn doc_id(&self) -> Uuid {
        self.doc_id
    }

    pub fn replica_id(&self) -> Uuid {
        self.replica_id
    }

    pub fn state_vector(&self) -> &StateVector {
        &self.state_vector
    }

    /// Apply a local edit, returning the delta to broadcast.
    ///
    /// Never fails: malformed edits are normalized per tombstone semantics
    /// and may yield an empty delta.
    pub fn apply_local(&mut self, edit: Edit) -> Delta {
        let ops = match edit {
            Edit::InsertAfter { after, text } => {
                // Unknown anchors normalize to the document head. Tombstoned
                // anchors are valid insert origins.
                let origin = after.filter(|a| self.arena.contains_key(a));
                let id = self.next_id();
                vec![Operation::InsertBlock {
                    id,
                    origin,
                    author: self.replica_id,
                    text,
                }]
            }
            Edit::Delete { block } => match self.arena.get(&block) {
                Some(b) if b.tombstone.is_none() => {
                    let id = self.next_id();
                    vec![Operation::DeleteBlock { id, target: block }]
                }
                _ => Vec::new(),
            },
            Edit::SetText { block, text } => match self.arena.get(&block) {
                Some(b) if b.tombstone.is_none() => {
                    let id = self.next_id();
                    vec![Operation::SetText {
                        id,
                        target: block,
                        text,
                    }]
                }
                _ => Vec::new(),
            },
            Edit::SetAttr { block, key, value } => match self.arena.get(&block) {
                Some(b) if b.tombstone.is_none() => {
                    let id = self.next_id();
                    vec![Operation::SetAttr {
                        id,
                        target: block,
                        key,
                        value,
                    }]
                }
                _ => Vec::new(),
            },
        };

        for op in &ops {
            self.integrate(op.clone());
            self.pending_local.push(op.clone());
        }
        Delta { ops }
    }

    /// Merge an incoming delta.
    ///
    /// Integration is idempotent per operation (inserts are set-union,
    /// tombstones and LWW writes compare op ids), so duplicate delivery is a
    /// no-op regardless of arrival order. Operations whose anchor has not
    /// arrived yet are deferred and re-driven once it does.
    pub fn apply_remote(&mut self, delta: &Delta) -> Applied {
        let mut work: Vec<Operation> = delta.ops.clone();
        work.append(&mut self.deferred);

        let mut changed = Vec::new();
        loop {
            let mut progressed = false;
            let mut blocked = Vec::new();
            for op in work.drain(..) {
                let dep_met = op
                    .dependency()
                    .map_or(true, |dep| self.arena.contains_key(&dep));
                if dep_met {
                    if self.integrate(op.clone()) {
                        changed.push(op.id());
                    }
                    progressed = true;
                } else {
                    blocked.push(op);
                }
            }
            work = blocked;
            if !progressed || work.is_empty() {
                break;
            }
        }
        self.deferred = work;

        if changed.is_empty() {
            Applied::Noop
        } else {
            Applied::Changed(changed)
        }
    }

    /// Merge a remote state vector after a handshake diff has been applied.
    ///
    /// The diff computed against our vector carries everything we lacked, so
    /// adopting the peer's coverage afterwards is safe.
    pub fn merge_state_vector(&mut self, other: &StateVector) {
        self.state_vector.merge(other);
    }

    /// Minimal set of operations the caller is missing.
    ///
    /// Derived from the arena, not an op log: every live effect is re-emitted
    /// as its original insert, its uncovered tombstone, and its winning LWW
    /// updates. The result size is proportional to divergence, independent of
    /// how many superseded updates the document has ever seen. Ops are sorted
    /// ascending by id; an op's anchor causally precedes it and therefore
    /// carries a smaller Lamport id, so the diff integrates without deferral.
    pub fn diff_since(&self, sv: &StateVector) -> Delta {
        let mut ops = Vec::new();
        for (&id, b) in &self.arena {
            if !sv.contains(&id) {
                ops.push(Operation::InsertBlock {
                    id,
                    origin: b.origin,
                    author: b.author,
                    text: b.insert_text.clone(),
                });
            }
            if let Some(del) = b.tombstone {
                if !sv.contains(&del) {
                    ops.push(Operation::DeleteBlock {
                        id: del,
                        target: id,
                    });
                }
            }
            if b.text.0 != id && !sv.contains(&b.text.0) {
                ops.push(Operation::SetText {
                    id: b.text.0,
                    target: id,
                    text: b.text.1.clone(),
                });
            }
            for (key, (tag, value)) in &b.attrs {
                if !sv.contains(tag) {
                    ops.push(Operation::SetAttr {
                        id: *tag,
                        target: id,
                        key: key.clone(),
                        value: value.clone(),
                    });
                }
            }
        }
        ops.sort_by_key(|op| op.id());
        Delta { ops }
    }

    /// Visible blocks in document order.
    pub fn blocks(&self) -> Vec<BlockView> {
        self.ordered_ids()
            .into_iter()
            .filter_map(|id| {
                let b = &self.arena[&id];
                if b.tombstone.is_some() {
                    return None;
                }
                Some(BlockView {
                    id,
                    author: b.author,
                    text: b.text.1.clone(),
                    attrs: b
                        .attrs
                        .iter()
                        .map(|(k, (_, v))| (k.clone(), v.clone()))
                        .collect(),
                })
            })
            .collect()
    }

    /// Canonical byte encoding of the visible content.
    ///
    /// Two replicas that have applied the same operation set produce
    /// identical bytes here — this is the convergence oracle the property
    /// tests check.
    pub fn encode_content(&self) -> Vec<u8> {
        bincode::serde::encode_to_vec(self.blocks(), bincode::config::standard())
            .unwrap_or_default()
    }

    /// Plain text of the visible blocks, newline separated.
    pub fn to_text(&self) -> String {
        self.blocks()
            .iter()
            .map(|b| b.text.as_str())
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Ops generated locally and not yet acknowledged.
    pub fn pending_local(&self) -> &[Operation] {
        &self.pending_local
    }

    /// Clear the pending buffer once the server has confirmed coverage.
    pub fn ack_pending(&mut self) {
        self.pending_local.clear();
    }

    /// Number of remote ops parked waiting for their anchor.
    pub fn deferred_len(&self) -> usize {
        self.deferred.len()
    }

    /// Total blocks in the arena, tombstones included.
    pub fn arena_len(&self) -> usize {
        self.arena.len()
    }

    /// Serialize the full replica state for snapshot persistence.
    pub fn encode(&self) -> Result<Vec<u8>, ReplicaError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ReplicaError::Encode(e.to_string()))
    }

    /// Restore a replica from a persisted snapshot.
    pub fn decode(bytes: &[u8]) -> Result<Self, ReplicaError> {
        let (mut replica, _): (DocumentReplica, _) =
            bincode::serde::decode_from_slice(bytes, bincode::config::standard())
                .map_err(|e| ReplicaError::Decode(e.to_string()))?;
        replica.rebuild_index();
        Ok(replica)
    }

    // ─── internals ───────────────────────────────────────────────────

    fn next_id(&self) -> OpId {
        // Lamport clock: one past the highest sequence applied from anyone,
        // not a private counter. A replica that just caught up on an old
        // document issues ids that order after the history it received, so
        // its writes win the LWW comparison against what they revise.
        OpId::new(self.replica_id, self.state_vector.max_seq() + 1)
    }

    /// Integrate one operation whose dependency is present.
    ///
    /// Returns true if the arena changed. Always observes the op id: the
    /// state vector drives both catch-up diffs and the Lamport clock.
    fn integrate(&mut self, op: Operation) -> bool {
        let op_id = op.id();
        let changed = match op {
            Operation::InsertBlock {
                id,
                origin,
                author,
                text,
            } => {
                if self.arena.contains_key(&id) {
                    false
                } else {
                    self.arena.insert(
                        id,
                        Block {
                            origin,
                            author,
                            insert_text: text.clone(),
                            text: (id, text),
                            tombstone: None,
                            attrs: BTreeMap::new(),
                        },
                    );
                    self.attach(origin, id);
                    true
                }
            }
            Operation::DeleteBlock { id, target } => match self.arena.get_mut(&target) {
                Some(block) => match block.tombstone {
                    // Concurrent deletes converge on the smallest delete id.
                    Some(existing) if existing <= id => false,
                    _ => {
                        block.tombstone = Some(id);
                        true
                    }
                },
                None => false,
            },
            Operation::SetText { id, target, text } => match self.arena.get_mut(&target) {
                Some(block) if id > block.text.0 => {
                    block.text = (id, text);
                    true
                }
                _ => false,
            },
            Operation::SetAttr {
                id,
                target,
                key,
                value,
            } => match self.arena.get_mut(&target) {
                Some(block) => match block.attrs.get(&key) {
                    Some((tag, _)) if *tag >= id => false,
                    _ => {
                        block.attrs.insert(key, (id, value));
                        true
                    }
                },
                None => false,
            },
        };
        self.state_vector.observe(&op_id);
        changed
    }

    /// Insert `id` into its sibling list, keeping descending order.
    fn attach(&mut self, origin: Option<OpId>, id: OpId) {
        let kids = self.children.entry(origin).or_default();
        let pos = kids.iter().position(|k| *k < id).unwrap_or(kids.len());
        kids.insert(pos, id);
    }

    /// Pre-order traversal of the origin tree.
    ///
    /// Iterative: origin chains grow linearly with document length and would
    /// overflow the stack if walked recursively.
    fn ordered_ids(&self) -> Vec<OpId> {
        let mut out = Vec::with_capacity(self.arena.len());
        let mut stack: Vec<OpId> = Vec::new();
        if let Some(roots) = self.children.get(&None) {
            stack.extend(roots.iter().rev());
        }
        while let Some(id) = stack.pop() {
            out.push(id);
            if let Some(kids) = self.children.get(&Some(id)) {
                stack.extend(kids.iter().rev());
            }
        }
        out
    }

    /// Rebuild the sibling index after deserialization.
    fn rebuild_index(&mut self) {
        self.children.clear();
        let ids: Vec<(Option<OpId>, OpId)> = self
            .arena
            .iter()
            .map(|(&id, b)| (b.origin, id))
            .collect();
        for (origin, id) in ids {
            self.attach(origin, id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn replica(n: u128) -> DocumentReplica {
        DocumentReplica::with_replica_id(Uuid::from_u128(1), Uuid::from_u128(n))
    }

    #[test]
    fn test_insert_and_read_back() {
        let mut doc = replica(10);
        doc.apply_local(Edit::InsertAfter {
            after: None,
            text: "hello".into(),
        });
        let blocks = doc.blocks();
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].text, "hello");
        assert_eq!(blocks[0].author, doc.replica_id());
    }

    #[test]
    fn test_sequential_inserts_keep_order() {
        let mut doc = replica(10);
        let d1 = doc.apply_local(Edit::InsertAfter {
            after: None,
            text: "a".into(),
        });
        let first = d1.ops[0].id();
        doc.apply_local(Edit::InsertAfter {
            after: Some(first),
            text: "b".into(),
        });
        assert_eq!(doc.to_text(), "a\nb");
    }

    #[test]
    fn test_concurrent_inserts_tie_break_deterministically() {
        let mut a = replica(10);
        let mut b = replica(20);

        let da = a.apply_local(Edit::InsertAfter {
            after: None,
            text: "A".into(),
        });
        let db = b.apply_local(Edit::InsertAfter {
            after: None,
            text: "B".into(),
        });

        a.apply_remote(&db);
        b.apply_remote(&da);

        assert_eq!(a.encode_content(), b.encode_content());
        // Same seq, higher replica id wins the head slot.
        assert_eq!(a.to_text(), "B\nA");
    }

    #[test]
    fn test_duplicate_delivery_is_noop() {
        let mut a = replica(10);
        let mut b = replica(20);

        let delta = a.apply_local(Edit::InsertAfter {
            after: None,
            text: "x".into(),
        });
        assert!(matches!(b.apply_remote(&delta), Applied::Changed(_)));
        let before = b.encode_content();
        assert_eq!(b.apply_remote(&delta), Applied::Noop);
        assert_eq!(b.encode_content(), before);
    }

    #[test]
    fn test_out_of_order_delivery_defers_then_integrates() {
        let mut a = replica(10);
        let mut b = replica(20);

        let d1 = a.apply_local(Edit::InsertAfter {
            after: None,
            text: "first".into(),
        });
        let first = d1.ops[0].id();
        let d2 = a.apply_local(Edit::InsertAfter {
            after: Some(first),
            text: "second".into(),
        });

        // Child arrives before its anchor.
        assert_eq!(b.apply_remote(&d2), Applied::Noop);
        assert_eq!(b.deferred_len(), 1);

        assert!(matches!(b.apply_remote(&d1), Applied::Changed(_)));
        assert_eq!(b.deferred_len(), 0);
        assert_eq!(b.to_text(), "first\nsecond");
    }

    #[test]
    fn test_delete_is_tombstone_not_removal() {
        let mut doc = replica(10);
        let d = doc.apply_local(Edit::InsertAfter {
            after: None,
            text: "gone".into(),
        });
        let id = d.ops[0].id();
        doc.apply_local(Edit::Delete { block: id });

        assert!(doc.blocks().is_empty());
        assert_eq!(doc.arena_len(), 1);
    }

    #[test]
    fn test_delete_unknown_block_normalizes_to_empty_delta() {
        let mut doc = replica(10);
        let ghost = OpId::new(Uuid::from_u128(99), 1);
        let delta = doc.apply_local(Edit::Delete { block: ghost });
        assert!(delta.is_empty());
    }

    #[test]
    fn test_insert_after_unknown_anchor_normalizes_to_head() {
        let mut doc = replica(10);
        doc.apply_local(Edit::InsertAfter {
            after: None,
            text: "a".into(),
        });
        let ghost = OpId::new(Uuid::from_u128(99), 7);
        let delta = doc.apply_local(Edit::InsertAfter {
            after: Some(ghost),
            text: "b".into(),
        });
        match &delta.ops[0] {
            Operation::InsertBlock { origin, .. } => assert_eq!(*origin, None),
            other => panic!("expected insert, got {other:?}"),
        }
        assert_eq!(doc.blocks().len(), 2);
    }

    #[test]
    fn test_concurrent_deletes_converge() {
        let mut a = replica(10);
        let mut b = replica(20);

        let d = a.apply_local(Edit::InsertAfter {
            after: None,
            text: "x".into(),
        });
        b.apply_remote(&d);
        let id = d.ops[0].id();

        let da = a.apply_local(Edit::Delete { block: id });
        let db = b.apply_local(Edit::Delete { block: id });

        a.apply_remote(&db);
        b.apply_remote(&da);

        assert_eq!(a.encode_content(), b.encode_content());
        assert_eq!(a.diff_since(&StateVector::new()), b.diff_since(&StateVector::new()));
    }

    #[test]
    fn test_set_text_lww() {
        let mut a = replica(10);
        let mut b = replica(20);

        let d = a.apply_local(Edit::InsertAfter {
            after: None,
            text: "v0".into(),
        });
        b.apply_remote(&d);
        let id = d.ops[0].id();

        // Concurrent: both at seq 2, replica 20 > replica 10.
        let da = a.apply_local(Edit::SetText {
            block: id,
            text: "from-a".into(),
        });
        let db = b.apply_local(Edit::SetText {
            block: id,
            text: "from-b".into(),
        });

        a.apply_remote(&db);
        b.apply_remote(&da);

        assert_eq!(a.to_text(), "from-b");
        assert_eq!(a.encode_content(), b.encode_content());
    }

    #[test]
    fn test_set_attr_lww_per_key() {
        let mut a = replica(10);
        let mut b = replica(20);

        let d = a.apply_local(Edit::InsertAfter {
            after: None,
            text: "t".into(),
        });
        b.apply_remote(&d);
        let id = d.ops[0].id();

        let da = a.apply_local(Edit::SetAttr {
            block: id,
            key: "align".into(),
            value: "left".into(),
        });
        let db = b.apply_local(Edit::SetAttr {
            block: id,
            key: "style".into(),
            value: "bold".into(),
        });

        a.apply_remote(&db);
        b.apply_remote(&da);

        let blocks = a.blocks();
        assert_eq!(blocks[0].attrs.get("align"), Some(&"left".to_string()));
        assert_eq!(blocks[0].attrs.get("style"), Some(&"bold".to_string()));
        assert_eq!(a.encode_content(), b.encode_content());
    }

    #[test]
    fn test_diff_since_empty_vector_reconstructs_document() {
        let mut a = replica(10);
        let d1 = a.apply_local(Edit::InsertAfter {
            after: None,
            text: "one".into(),
        });
        let first = d1.ops[0].id();
        a.apply_local(Edit::InsertAfter {
            after: Some(first),
            text: "two".into(),
        });
        a.apply_local(Edit::SetAttr {
            block: first,
            key: "kind".into(),
            value: "heading".into(),
        });

        let mut fresh = replica(20);
        fresh.apply_remote(&a.diff_since(&StateVector::new()));
        assert_eq!(fresh.encode_content(), a.encode_content());
    }

    #[test]
    fn test_diff_since_returns_only_missing_ops() {
        let mut a = replica(10);
        let mut b = replica(20);

        let d1 = a.apply_local(Edit::InsertAfter {
            after: None,
            text: "seen".into(),
        });
        b.apply_remote(&d1);

        let seen = d1.ops[0].id();
        a.apply_local(Edit::InsertAfter {
            after: Some(seen),
            text: "unseen".into(),
        });

        let diff = a.diff_since(b.state_vector());
        assert_eq!(diff.len(), 1);
        for op in &diff.ops {
            assert!(!b.state_vector().contains(&op.id()));
        }
    }

    #[test]
    fn test_diff_size_independent_of_superseded_history() {
        let mut a = replica(10);
        let d = a.apply_local(Edit::InsertAfter {
            after: None,
            text: "v0".into(),
        });
        let id = d.ops[0].id();
        for i in 0..100 {
            a.apply_local(Edit::SetText {
                block: id,
                text: format!("v{i}"),
            });
        }

        // One insert plus the single winning SetText, not 101 updates.
        let diff = a.diff_since(&StateVector::new());
        assert_eq!(diff.len(), 2);

        let mut fresh = replica(20);
        fresh.apply_remote(&diff);
        assert_eq!(fresh.to_text(), "v99");
    }

    #[test]
    fn test_pending_buffer_tracks_unacked_ops() {
        let mut doc = replica(10);
        for i in 0..5 {
            doc.apply_local(Edit::InsertAfter {
                after: None,
                text: format!("edit {i}"),
            });
        }
        assert_eq!(doc.pending_local().len(), 5);
        doc.ack_pending();
        assert!(doc.pending_local().is_empty());
    }

    #[test]
    fn test_snapshot_roundtrip_preserves_state() {
        let mut a = replica(10);
        let d1 = a.apply_local(Edit::InsertAfter {
            after: None,
            text: "alpha".into(),
        });
        let first = d1.ops[0].id();
        a.apply_local(Edit::InsertAfter {
            after: Some(first),
            text: "beta".into(),
        });
        a.apply_local(Edit::Delete { block: first });

        let bytes = a.encode().unwrap();
        let restored = DocumentReplica::decode(&bytes).unwrap();
        assert_eq!(restored.encode_content(), a.encode_content());
        assert_eq!(restored.state_vector(), a.state_vector());
        assert_eq!(restored.to_text(), "beta");
    }

    #[test]
    fn test_state_vector_dominates_and_merge() {
        let r1 = Uuid::from_u128(1);
        let r2 = Uuid::from_u128(2);

        let mut sv1 = StateVector::new();
        sv1.observe(&OpId::new(r1, 3));
        let mut sv2 = StateVector::new();
        sv2.observe(&OpId::new(r2, 1));

        assert!(!sv1.dominates(&sv2));
        sv1.merge(&sv2);
        assert!(sv1.dominates(&sv2));
        assert_eq!(sv1.get(&r1), 3);
        assert_eq!(sv1.get(&r2), 1);
    }

    #[test]
    fn test_delta_rejects_unknown_version() {
        let delta = Delta {
            ops: vec![Operation::DeleteBlock {
                id: OpId::new(Uuid::from_u128(1), 1),
                target: OpId::new(Uuid::from_u128(2), 1),
            }],
        };
        let mut bytes = delta.encode().unwrap();
        bytes[0] = 0xFF;
        assert!(Delta::decode(&bytes).is_err());
        assert!(Delta::decode(&[]).is_err());
    }

    #[test]
    fn test_three_replicas_any_exchange_order() {
        let mut a = replica(10);
        let mut b = replica(20);
        let mut c = replica(30);

        let da = a.apply_local(Edit::InsertAfter {
            after: None,
            text: "a".into(),
        });
        let db = b.apply_local(Edit::InsertAfter {
            after: None,
            text: "b".into(),
        });
        let dc = c.apply_local(Edit::InsertAfter {
            after: None,
            text: "c".into(),
        });

        a.apply_remote(&db);
        a.apply_remote(&dc);
        b.apply_remote(&dc);
        b.apply_remote(&da);
        c.apply_remote(&da);
        c.apply_remote(&db);

        assert_eq!(a.encode_content(), b.encode_content());
        assert_eq!(b.encode_content(), c.encode_content());
    }

    #[test]
    fn test_op_ids_advance_past_received_history() {
        let mut a = replica(10);
        let d = a.apply_local(Edit::InsertAfter {
            after: None,
            text: "x".into(),
        });
        let id = d.ops[0].id();
        a.apply_local(Edit::SetText {
            block: id,
            text: "v1".into(),
        });
        a.apply_local(Edit::SetText {
            block: id,
            text: "v2".into(),
        });

        let mut b = replica(20);
        b.apply_remote(&a.diff_since(b.state_vector()));

        // B has observed up to seq 3, so its first op is seq 4, not seq 1.
        let db = b.apply_local(Edit::InsertAfter {
            after: Some(id),
            text: "y".into(),
        });
        assert_eq!(db.ops[0].id().seq, 4);
    }

    #[test]
    fn test_late_joiner_revision_wins_lww() {
        let mut server = replica(10);
        let d = server.apply_local(Edit::InsertAfter {
            after: None,
            text: "draft".into(),
        });
        let id = d.ops[0].id();
        server.apply_local(Edit::SetText {
            block: id,
            text: "server-revision".into(),
        });
        server.apply_local(Edit::SetAttr {
            block: id,
            key: "kind".into(),
            value: "paragraph".into(),
        });

        // A replica that joins after the document accrued history must be
        // able to revise it: its ids order after everything it caught up on.
        let mut joiner = replica(5);
        joiner.apply_remote(&server.diff_since(joiner.state_vector()));
        joiner.merge_state_vector(server.state_vector());

        let text_edit = joiner.apply_local(Edit::SetText {
            block: id,
            text: "joiner-edit".into(),
        });
        let attr_edit = joiner.apply_local(Edit::SetAttr {
            block: id,
            key: "kind".into(),
            value: "heading".into(),
        });
        assert_eq!(joiner.to_text(), "joiner-edit");

        server.apply_remote(&text_edit);
        server.apply_remote(&attr_edit);
        assert_eq!(server.to_text(), "joiner-edit");
        assert_eq!(
            server.blocks()[0].attrs.get("kind"),
            Some(&"heading".to_string())
        );
        assert_eq!(server.encode_content(), joiner.encode_content());
    }

    #[test]
    fn test_diff_with_repeated_head_inserts_reconstructs_all() {
        let mut a = replica(10);
        for text in ["first", "second", "third"] {
            a.apply_local(Edit::InsertAfter {
                after: None,
                text: text.into(),
            });
        }

        let mut fresh = replica(20);
        fresh.apply_remote(&a.diff_since(&StateVector::new()));
        assert_eq!(fresh.blocks().len(), 3);
        assert_eq!(fresh.deferred_len(), 0);
        assert_eq!(fresh.encode_content(), a.encode_content());
    }
}
