//! Per-client undo/redo over a [`ReplicatedDocument`].
//!
//! Only transactions with [`Origin::Local`] are captured. Consecutive local
//! transactions merge into one frame while they share a [`GroupToken`] and
//! arrive within the capture window; [`UndoManager::boundary`] closes the
//! current frame early.
//!
//! A frame stores the state each touched element had *before* the frame
//! (absent for inserts). Undo writes those before-images back as a new
//! transaction, so it propagates to other replicas like any other edit.
//! The inverse of what undo changed becomes the redo frame.

use std::time::{Duration, Instant};

use crate::document::{AppliedTransaction, Change, Document, GroupToken, Operation, Origin, ReplicatedDocument, Transaction};
use crate::element::{Element, ElementId};
use crate::error::InvalidOperation;

/// Undo capture tuning.
#[derive(Debug, Clone)]
pub struct UndoConfig {
    /// Max gap between two local transactions of one frame (default: 500ms).
    pub capture_window: Duration,
    /// Oldest frames are discarded past this depth (default: 100).
    pub max_frames: usize,
}

impl Default for UndoConfig {
    fn default() -> Self {
        Self {
            capture_window: Duration::from_millis(500),
            max_frames: 100,
        }
    }
}

#[derive(Debug, Clone)]
struct UndoFrame {
    group: GroupToken,
    /// First-seen state of each touched element, in touch order.
    before: Vec<(ElementId, Option<Element>)>,
    captured_at: Instant,
}

impl UndoFrame {
    fn from_changes(group: GroupToken, changes: &[Change], now: Instant) -> Self {
        let mut frame = Self { group, before: Vec::new(), captured_at: now };
        frame.absorb(changes, now);
        frame
    }

    fn absorb(&mut self, changes: &[Change], now: Instant) {
        for change in changes {
            if !self.before.iter().any(|(id, _)| *id == change.id) {
                self.before.push((change.id, change.before.clone()));
            }
        }
        self.captured_at = now;
    }

    /// Operations writing the before-images back over `current`.
    fn restore_ops(&self, current: &Document) -> Vec<Operation> {
        self.before
            .iter()
            .filter_map(|(id, before)| match (before, current.get(id)) {
                (Some(el), Some(now)) if now == el => None,
                (Some(el), Some(_)) => Some(Operation::update(el.clone())),
                (Some(el), None) => Some(Operation::insert(el.clone())),
                (None, Some(_)) => Some(Operation::delete(*id)),
                (None, None) => None,
            })
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CaptureState {
    Idle,
    Capturing,
}

/// Undo and redo stacks for one client.
#[derive(Debug)]
pub struct UndoManager {
    config: UndoConfig,
    undo_stack: Vec<UndoFrame>,
    redo_stack: Vec<UndoFrame>,
    state: CaptureState,
}

impl UndoManager {
    pub fn new(config: UndoConfig) -> Self {
        Self {
            config,
            undo_stack: Vec::new(),
            redo_stack: Vec::new(),
            state: CaptureState::Idle,
        }
    }

    /// Apply `tx` to `doc`, capturing it when it is a local edit.
    pub fn apply(
        &mut self,
        doc: &mut ReplicatedDocument,
        tx: Transaction,
    ) -> Result<AppliedTransaction, InvalidOperation> {
        self.apply_at(doc, tx, Instant::now())
    }

    /// [`apply`](Self::apply) with an explicit capture time.
    pub fn apply_at(
        &mut self,
        doc: &mut ReplicatedDocument,
        tx: Transaction,
        now: Instant,
    ) -> Result<AppliedTransaction, InvalidOperation> {
        let origin = tx.origin;
        let group = tx.group;
        let applied = doc.apply(tx)?;
        if origin == Origin::Local {
            self.capture(group, &applied.changes, now);
        }
        Ok(applied)
    }

    fn capture(&mut self, group: GroupToken, changes: &[Change], now: Instant) {
        if changes.is_empty() {
            return;
        }
        self.redo_stack.clear();

        let window = self.config.capture_window;
        let merge = self.state == CaptureState::Capturing
            && self
                .undo_stack
                .last()
                .is_some_and(|top| top.group == group && now.saturating_duration_since(top.captured_at) <= window);

        match self.undo_stack.last_mut() {
            Some(top) if merge => top.absorb(changes, now),
            _ => {
                self.undo_stack.push(UndoFrame::from_changes(group, changes, now));
                if self.undo_stack.len() > self.config.max_frames {
                    self.undo_stack.remove(0);
                }
            }
        }
        self.state = CaptureState::Capturing;
    }

    /// Close the current frame: the next local edit starts a new one.
    pub fn boundary(&mut self) {
        self.state = CaptureState::Idle;
    }

    /// Revert the most recent frame. `Ok(None)` when there is nothing to undo.
    pub fn undo(&mut self, doc: &mut ReplicatedDocument) -> Result<Option<AppliedTransaction>, InvalidOperation> {
        self.state = CaptureState::Idle;
        Self::replay(doc, &mut self.undo_stack, &mut self.redo_stack, Origin::Undo)
    }

    /// Re-apply the most recently undone frame.
    pub fn redo(&mut self, doc: &mut ReplicatedDocument) -> Result<Option<AppliedTransaction>, InvalidOperation> {
        self.state = CaptureState::Idle;
        Self::replay(doc, &mut self.redo_stack, &mut self.undo_stack, Origin::Redo)
    }

    fn replay(
        doc: &mut ReplicatedDocument,
        from: &mut Vec<UndoFrame>,
        to: &mut Vec<UndoFrame>,
        origin: Origin,
    ) -> Result<Option<AppliedTransaction>, InvalidOperation> {
        while let Some(frame) = from.pop() {
            let ops = frame.restore_ops(doc.document());
            if ops.is_empty() {
                // Already reverted by someone else.
                continue;
            }
            let tx = doc.transaction(origin, frame.group, ops);
            match doc.apply(tx) {
                Ok(applied) => {
                    to.push(UndoFrame::from_changes(frame.group, &applied.changes, Instant::now()));
                    return Ok(Some(applied));
                }
                Err(err) => {
                    from.push(frame);
                    return Err(err);
                }
            }
        }
        Ok(None)
    }

    pub fn can_undo(&self) -> bool {
        !self.undo_stack.is_empty()
    }

    pub fn can_redo(&self) -> bool {
        !self.redo_stack.is_empty()
    }

    pub fn undo_depth(&self) -> usize {
        self.undo_stack.len()
    }

    pub fn redo_depth(&self) -> usize {
        self.redo_stack.len()
    }

    /// Drop both stacks, e.g. when the client switches documents.
    pub fn clear(&mut self) {
        self.undo_stack.clear();
        self.redo_stack.clear();
        self.state = CaptureState::Idle;
    }
}

impl Default for UndoManager {
    fn default() -> Self {
        Self::new(UndoConfig::default())
    }
}
