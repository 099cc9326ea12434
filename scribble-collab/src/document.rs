//! Replicated element store.
//!
//! ```text
//!  Transaction { stamp, origin, group, ops }
//!        │
//!        ▼
//!  ReplicatedDocument::apply()
//!        │  1. validate every op (nothing applied on failure)
//!        │  2. Insert/Update: replace if stamp >= current stamp
//!        │     Delete: drop the key and its stamp
//!        ▼
//!  AppliedTransaction { transaction, changes[(id, before, after)] }
//!        │
//!        ├──► subscribers (DocumentEvent)
//!        └──► caller: rebroadcast / debounce / undo capture
//! ```
//!
//! Every record carries the Lamport [`Stamp`] of the transaction that last
//! wrote it. A record is only replaced by an equal or newer stamp, so replicas
//! that see the same transactions in any order converge, and re-delivering a
//! transaction is a no-op. A delete removes the key outright: no tombstone is
//! kept, and an update arriving later brings the element back.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::element::{Element, ElementId};
use crate::error::InvalidOperation;

/// Capacity of the change-notification channel. Slow subscribers lag and
/// skip events rather than block writers.
const EVENT_CAPACITY: usize = 256;

/// How far a transaction's clock may run ahead of the replica applying it.
pub const MAX_CLOCK_SKEW: u64 = 1 << 32;

// ───────────────────────────────────────────────────────────────────
// Transactions
// ───────────────────────────────────────────────────────────────────

/// Lamport timestamp ordered by `(clock, replica)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Stamp {
    pub clock: u64,
    pub replica: Uuid,
}

impl Stamp {
    pub const ZERO: Stamp = Stamp { clock: 0, replica: Uuid::nil() };

    pub fn new(clock: u64, replica: Uuid) -> Self {
        Self { clock, replica }
    }
}

/// Where a transaction came from, as seen by the replica applying it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Origin {
    /// A user edit on this replica. Only these are captured for undo.
    Local,
    /// Received from another replica.
    Remote,
    Undo,
    Redo,
}

/// Opaque token grouping transactions of one logical gesture.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GroupToken(pub u64);

/// One change to one element.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Operation {
    Insert { id: ElementId, element: Element },
    Update { id: ElementId, element: Element },
    Delete { id: ElementId },
}

impl Operation {
    pub fn insert(element: Element) -> Self {
        Operation::Insert { id: element.id, element }
    }

    pub fn update(element: Element) -> Self {
        Operation::Update { id: element.id, element }
    }

    pub fn delete(id: ElementId) -> Self {
        Operation::Delete { id }
    }

    pub fn id(&self) -> ElementId {
        match self {
            Operation::Insert { id, .. } | Operation::Update { id, .. } | Operation::Delete { id } => *id,
        }
    }

    pub fn validate(&self) -> Result<(), InvalidOperation> {
        let id = self.id();
        if id.is_nil() {
            return Err(InvalidOperation::MissingId);
        }
        match self {
            Operation::Insert { element, .. } | Operation::Update { element, .. } => {
                if element.id != id {
                    return Err(InvalidOperation::IdMismatch { op: id, element: element.id });
                }
                element.validate()
            }
            Operation::Delete { .. } => Ok(()),
        }
    }
}

/// Ordered list of operations applied atomically.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub stamp: Stamp,
    pub origin: Origin,
    pub group: GroupToken,
    pub ops: Vec<Operation>,
}

impl Transaction {
    pub fn new(stamp: Stamp, origin: Origin, group: GroupToken, ops: Vec<Operation>) -> Self {
        Self { stamp, origin, group, ops }
    }

    pub fn with_origin(mut self, origin: Origin) -> Self {
        self.origin = origin;
        self
    }

    pub fn validate(&self) -> Result<(), InvalidOperation> {
        if self.ops.is_empty() {
            return Err(InvalidOperation::EmptyTransaction);
        }
        self.ops.iter().try_for_each(Operation::validate)
    }
}

// ───────────────────────────────────────────────────────────────────
// Document
// ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Record {
    element: Element,
    stamp: Stamp,
}

/// Point-in-time value of a board: element id → element.
///
/// Equality compares element content only. Stamps and the clock are
/// bookkeeping and do not take part.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Document {
    records: HashMap<ElementId, Record>,
    clock: u64,
}

impl Document {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &ElementId) -> Option<&Element> {
        self.records.get(id).map(|r| &r.element)
    }

    pub fn contains(&self, id: &ElementId) -> bool {
        self.records.contains_key(id)
    }

    /// Stamp of the last write to `id`, if present.
    pub fn stamp_of(&self, id: &ElementId) -> Option<Stamp> {
        self.records.get(id).map(|r| r.stamp)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Highest Lamport clock observed by this document.
    pub fn clock(&self) -> u64 {
        self.clock
    }

    /// Elements in no particular order.
    pub fn elements(&self) -> impl Iterator<Item = &Element> {
        self.records.values().map(|r| &r.element)
    }

    /// Elements in render order: ascending `created_at`, ties broken by id.
    pub fn paint_order(&self) -> Vec<&Element> {
        let mut elements: Vec<&Element> = self.elements().collect();
        elements.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        elements
    }
}

impl PartialEq for Document {
    fn eq(&self, other: &Self) -> bool {
        self.records.len() == other.records.len()
            && self
                .records
                .iter()
                .all(|(id, r)| other.records.get(id).is_some_and(|o| o.element == r.element))
    }
}

// ───────────────────────────────────────────────────────────────────
// Apply results and notifications
// ───────────────────────────────────────────────────────────────────

/// Visible effect of one operation. `before == after` never appears.
#[derive(Debug, Clone, PartialEq)]
pub struct Change {
    pub id: ElementId,
    pub before: Option<Element>,
    pub after: Option<Element>,
}

/// A transaction together with the changes it actually made.
#[derive(Debug, Clone)]
pub struct AppliedTransaction {
    pub transaction: Transaction,
    pub changes: Vec<Change>,
}

impl AppliedTransaction {
    /// True when every op was stale or redundant.
    pub fn is_noop(&self) -> bool {
        self.changes.is_empty()
    }
}

/// Change notification delivered to subscribers.
#[derive(Debug, Clone)]
pub struct DocumentEvent {
    pub origin: Origin,
    pub changes: Vec<Change>,
}

// ───────────────────────────────────────────────────────────────────
// Replica
// ───────────────────────────────────────────────────────────────────

/// One replica's copy of a board plus its Lamport clock.
pub struct ReplicatedDocument {
    replica_id: Uuid,
    doc: Document,
    events: broadcast::Sender<Arc<DocumentEvent>>,
}

impl ReplicatedDocument {
    pub fn new(replica_id: Uuid) -> Self {
        Self::from_document(replica_id, Document::new())
    }

    pub fn from_document(replica_id: Uuid, doc: Document) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self { replica_id, doc, events }
    }

    pub fn replica_id(&self) -> Uuid {
        self.replica_id
    }

    pub fn get(&self, id: &ElementId) -> Option<&Element> {
        self.doc.get(id)
    }

    pub fn document(&self) -> &Document {
        &self.doc
    }

    /// Owned copy of the current state.
    pub fn snapshot(&self) -> Document {
        self.doc.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Arc<DocumentEvent>> {
        self.events.subscribe()
    }

    /// Next stamp for a transaction authored on this replica.
    pub fn next_stamp(&mut self) -> Stamp {
        self.doc.clock = self.doc.clock.saturating_add(1);
        Stamp::new(self.doc.clock, self.replica_id)
    }

    /// Build (but do not apply) a transaction authored here.
    pub fn transaction(&mut self, origin: Origin, group: GroupToken, ops: Vec<Operation>) -> Transaction {
        Transaction::new(self.next_stamp(), origin, group, ops)
    }

    /// Apply a transaction atomically.
    ///
    /// All operations are validated first; if any is malformed nothing is
    /// applied, and neither is a stamp more than [`MAX_CLOCK_SKEW`] ahead of
    /// the local clock. Stale writes are skipped silently and do not appear in the returned
    /// changes.
    pub fn apply(&mut self, tx: Transaction) -> Result<AppliedTransaction, InvalidOperation> {
        tx.validate()?;
        let local = self.doc.clock;
        if tx.stamp.clock > local.saturating_add(MAX_CLOCK_SKEW) {
            return Err(InvalidOperation::ClockSkew { clock: tx.stamp.clock, local });
        }
        self.doc.clock = self.doc.clock.max(tx.stamp.clock);

        let mut changes = Vec::new();
        for op in &tx.ops {
            match op {
                Operation::Insert { id, element } | Operation::Update { id, element } => {
                    if let Some(current) = self.doc.records.get(id) {
                        if current.stamp > tx.stamp {
                            log::trace!(
                                "Skipping stale write to {id}: {:?} < {:?}",
                                tx.stamp,
                                current.stamp
                            );
                            continue;
                        }
                    }
                    let record = Record { element: element.clone(), stamp: tx.stamp };
                    let before = self.doc.records.insert(*id, record).map(|r| r.element);
                    if before.as_ref() != Some(element) {
                        changes.push(Change { id: *id, before, after: Some(element.clone()) });
                    }
                }
                Operation::Delete { id } => {
                    if let Some(removed) = self.doc.records.remove(id) {
                        changes.push(Change { id: *id, before: Some(removed.element), after: None });
                    }
                }
            }
        }

        if !changes.is_empty() {
            // No receivers is fine.
            let _ = self.events.send(Arc::new(DocumentEvent {
                origin: tx.origin,
                changes: changes.clone(),
            }));
        }

        Ok(AppliedTransaction { transaction: tx, changes })
    }

    /// Replace the whole state, e.g. with a server snapshot.
    ///
    /// Subscribers see the difference as one event with `origin`.
    pub fn load_snapshot(&mut self, doc: Document, origin: Origin) -> Vec<Change> {
        let mut changes = Vec::new();
        for (id, record) in &self.doc.records {
            match doc.get(id) {
                None => changes.push(Change { id: *id, before: Some(record.element.clone()), after: None }),
                Some(next) if *next != record.element => changes.push(Change {
                    id: *id,
                    before: Some(record.element.clone()),
                    after: Some(next.clone()),
                }),
                Some(_) => {}
            }
        }
        for (id, record) in &doc.records {
            if !self.doc.records.contains_key(id) {
                changes.push(Change { id: *id, before: None, after: Some(record.element.clone()) });
            }
        }

        let clock = self.doc.clock.max(doc.clock);
        self.doc = doc;
        self.doc.clock = clock;

        if !changes.is_empty() {
            let _ = self.events.send(Arc::new(DocumentEvent { origin, changes: changes.clone() }));
        }
        changes
    }
}
