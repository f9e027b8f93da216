//! # Undo/Redo
//!
//! Per-participant history of local edits.
//!
//! - Each recorded operation stores its inverse, computed from local state just
//!   before the operation is applied
//! - Undo applies the inverse locally and hands it back for transmission
//! - Redo reapplies the original
//! - Recording a new operation clears the redo stack
//!
//! Replayed operations go through the server like any live edit, so an undo can be
//! overtaken, rejected or turn into a no-op when its target is gone.

use crate::{Operation, OperationKind, Replica};

/// An operation paired with the operation that reverses it
#[derive(Debug, Clone, PartialEq)]
pub struct UndoableOperation {
    pub original: Operation,
    pub inverse: Operation,
}

impl UndoableOperation {
    /// Pair `op` with its inverse as seen from `replica`, or `None` if it has none
    pub fn capture(op: &Operation, replica: &Replica) -> Option<Self> {
        let inverse = match &op.kind {
            OperationKind::Create { element } => OperationKind::Delete {
                element_id: element.id.clone(),
                snapshot: None,
            },

            OperationKind::Delete {
                element_id,
                snapshot,
            } => {
                let mut element = snapshot
                    .clone()
                    .or_else(|| replica.get(element_id).cloned())?;
                // Restoring must not resurrect a lock
                element.locked_by = None;
                OperationKind::Create { element }
            }

            OperationKind::Update { element_id, patch } => {
                let previous = replica.get(element_id)?.capture(patch);
                if previous.is_empty() {
                    return None;
                }
                OperationKind::Update {
                    element_id: element_id.clone(),
                    patch: previous,
                }
            }

            OperationKind::Lock { .. }
            | OperationKind::Unlock { .. }
            | OperationKind::Presence { .. } => return None,
        };

        Some(Self {
            original: op.clone(),
            inverse: Operation::new(op.session_id.clone(), op.user_id.clone(), inverse),
        })
    }
}

/// Undo/redo stacks for one participant
#[derive(Debug)]
pub struct UndoManager {
    /// Most recent last
    undo_stack: Vec<UndoableOperation>,

    /// Most recent last
    redo_stack: Vec<UndoableOperation>,

    /// Maximum number of undo levels (0 = unlimited)
    max_levels: usize,
}

impl UndoManager {
    pub const DEFAULT_MAX_LEVELS: usize = 100;

    pub fn new() -> Self {
        Self::with_max_levels(Self::DEFAULT_MAX_LEVELS)
    }

    pub fn with_max_levels(max_levels: usize) -> Self {
        Self {
            undo_stack: Vec::new(),
            redo_stack: Vec::new(),
            max_levels,
        }
    }

    /// Record `op` before it is applied to `replica`.
    ///
    /// Returns false for operations without an inverse, which leave both stacks untouched.
    pub fn record(&mut self, op: &Operation, replica: &Replica) -> bool {
        let Some(pair) = UndoableOperation::capture(op, replica) else {
            return false;
        };

        self.undo_stack.push(pair);
        if self.max_levels > 0 && self.undo_stack.len() > self.max_levels {
            self.undo_stack.remove(0);
        }

        // New action invalidates the redo future
        self.redo_stack.clear();
        true
    }

    /// Apply the newest inverse to `replica` and return it for transmission
    pub fn undo(&mut self, replica: &mut Replica) -> Option<Operation> {
        let pair = self.undo_stack.pop()?;

        let op = pair.inverse.reissue();
        replica.apply(&op);

        self.redo_stack.push(pair);
        Some(op)
    }

    /// Reapply the most recently undone original and return it for transmission
    pub fn redo(&mut self, replica: &mut Replica) -> Option<Operation> {
        let pair = self.redo_stack.pop()?;

        let op = pair.original.reissue();
        replica.apply(&op);

        self.undo_stack.push(pair);
        Some(op)
    }

    pub fn can_undo(&self) -> bool {
        !self.undo_stack.is_empty()
    }

    pub fn can_redo(&self) -> bool {
        !self.redo_stack.is_empty()
    }

    pub fn undo_levels(&self) -> usize {
        self.undo_stack.len()
    }

    pub fn redo_levels(&self) -> usize {
        self.redo_stack.len()
    }

    pub fn clear(&mut self) {
        self.undo_stack.clear();
        self.redo_stack.clear();
    }
}

impl Default for UndoManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Element, ElementId, ElementPatch, SessionId, UserId};

    fn op(kind: OperationKind) -> Operation {
        Operation::new(SessionId::parse("doc").unwrap(), UserId::from("alice"), kind)
    }

    /// Record then apply, the way the client does for local edits
    fn edit(manager: &mut UndoManager, replica: &mut Replica, kind: OperationKind) -> bool {
        let op = op(kind);
        let recorded = manager.record(&op, replica);
        replica.apply(&op);
        recorded
    }

    fn create_rect(id: &str) -> OperationKind {
        OperationKind::Create {
            element: Element::rectangle(0.0, 0.0, 10.0, 10.0).with_id(id),
        }
    }

    #[test]
    fn test_create_then_undo_restores_map() {
        let mut manager = UndoManager::new();
        let mut replica = Replica::new();
        let before = replica.elements().clone();

        edit(&mut manager, &mut replica, create_rect("r"));
        let inverse = manager.undo(&mut replica).unwrap();

        assert_eq!(replica.elements(), &before);
        assert!(matches!(inverse.kind, OperationKind::Delete { .. }));
        assert!(manager.can_redo());
    }

    #[test]
    fn test_update_undo_redo_roundtrip() {
        let mut manager = UndoManager::new();
        let mut replica = Replica::new();
        let id = ElementId::from("r");
        edit(&mut manager, &mut replica, create_rect("r"));

        edit(
            &mut manager,
            &mut replica,
            OperationKind::Update {
                element_id: id.clone(),
                patch: ElementPatch::resized_to(20.0, 10.0),
            },
        );
        assert_eq!(replica.get(&id).unwrap().width, 20.0);

        manager.undo(&mut replica).unwrap();
        assert_eq!(replica.get(&id).unwrap().width, 10.0);

        manager.redo(&mut replica).unwrap();
        assert_eq!(replica.get(&id).unwrap().width, 20.0);
    }

    #[test]
    fn test_delete_undo_restores_snapshot_without_lock() {
        let mut manager = UndoManager::new();
        let mut replica = Replica::new();
        let id = ElementId::from("r");
        edit(&mut manager, &mut replica, create_rect("r"));

        let mut snapshot = replica.get(&id).cloned().unwrap();
        snapshot.locked_by = Some(UserId::from("alice"));
        edit(
            &mut manager,
            &mut replica,
            OperationKind::Delete {
                element_id: id.clone(),
                snapshot: Some(snapshot),
            },
        );
        assert!(!replica.contains(&id));

        let inverse = manager.undo(&mut replica).unwrap();
        assert!(matches!(inverse.kind, OperationKind::Create { .. }));
        let restored = replica.get(&id).unwrap();
        assert_eq!(restored.width, 10.0);
        assert!(restored.locked_by.is_none());
    }

    #[test]
    fn test_non_invertible_operations_are_not_recorded() {
        let mut manager = UndoManager::new();
        let mut replica = Replica::new();
        edit(&mut manager, &mut replica, create_rect("r"));

        let lock = OperationKind::Lock {
            element_id: ElementId::from("r"),
        };
        assert!(!edit(&mut manager, &mut replica, lock));

        // Update of an element we do not have has nothing to capture
        let ghost = OperationKind::Update {
            element_id: ElementId::from("ghost"),
            patch: ElementPatch::moved_to(1.0, 1.0),
        };
        assert!(!edit(&mut manager, &mut replica, ghost));

        assert_eq!(manager.undo_levels(), 1);
    }

    #[test]
    fn test_new_record_clears_redo() {
        let mut manager = UndoManager::new();
        let mut replica = Replica::new();
        edit(&mut manager, &mut replica, create_rect("a"));
        manager.undo(&mut replica);
        assert_eq!(manager.redo_levels(), 1);

        edit(&mut manager, &mut replica, create_rect("b"));

        assert_eq!(manager.redo_levels(), 0);
        assert!(manager.redo(&mut replica).is_none());
    }

    #[test]
    fn test_empty_stacks_are_noops() {
        let mut manager = UndoManager::new();
        let mut replica = Replica::new();
        assert!(manager.undo(&mut replica).is_none());
        assert!(manager.redo(&mut replica).is_none());
        assert!(replica.is_empty());
    }

    #[test]
    fn test_replays_get_fresh_ids() {
        let mut manager = UndoManager::new();
        let mut replica = Replica::new();
        edit(&mut manager, &mut replica, create_rect("r"));

        let first = manager.undo(&mut replica).unwrap();
        let redo = manager.redo(&mut replica).unwrap();
        let second = manager.undo(&mut replica).unwrap();

        assert_ne!(first.id, second.id);
        assert_ne!(redo.id, first.id);
    }

    #[test]
    fn test_max_levels_enforced() {
        let mut manager = UndoManager::with_max_levels(2);
        let mut replica = Replica::new();
        for i in 0..3 {
            edit(&mut manager, &mut replica, create_rect(&format!("e{}", i)));
        }

        assert_eq!(manager.undo_levels(), 2);

        // The oldest create fell off the stack
        manager.undo(&mut replica);
        manager.undo(&mut replica);
        assert!(!manager.can_undo());
        assert!(replica.contains(&ElementId::from("e0")));
    }
}
