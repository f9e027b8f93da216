/// Client-side view of a document session
/// Mirrors the server's element map with the same per-field overwrite rules
use std::collections::HashMap;

use crate::{Element, ElementId, Operation, OperationKind};

#[derive(Debug, Clone, Default)]
pub struct Replica {
    elements: HashMap<ElementId, Element>,
}

impl Replica {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a `session_state` baseline
    pub fn reset(&mut self, snapshot: HashMap<ElementId, Element>) {
        self.elements = snapshot;
    }

    /// Apply an operation locally. Missing targets are no-ops.
    pub fn apply(&mut self, op: &Operation) {
        match &op.kind {
            OperationKind::Create { element } => {
                self.elements.insert(element.id.clone(), element.clone());
            }
            OperationKind::Update { element_id, patch } => {
                if let Some(element) = self.elements.get_mut(element_id) {
                    element.apply_patch(patch);
                }
            }
            OperationKind::Delete { element_id, .. } => {
                self.elements.remove(element_id);
            }
            OperationKind::Lock { element_id } => {
                if let Some(element) = self.elements.get_mut(element_id) {
                    element.locked_by = Some(op.user_id.clone());
                }
            }
            OperationKind::Unlock { element_id } => {
                if let Some(element) = self.elements.get_mut(element_id) {
                    element.locked_by = None;
                }
            }
            OperationKind::Presence { .. } => {}
        }
    }

    pub fn get(&self, id: &ElementId) -> Option<&Element> {
        self.elements.get(id)
    }

    pub fn contains(&self, id: &ElementId) -> bool {
        self.elements.contains_key(id)
    }

    pub fn elements(&self) -> &HashMap<ElementId, Element> {
        &self.elements
    }

    pub fn len(&self) -> usize {
        self.elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ElementPatch, SessionId, UserId};

    fn op(user: &str, kind: OperationKind) -> Operation {
        Operation::new(SessionId::parse("doc").unwrap(), UserId::from(user), kind)
    }

    #[test]
    fn test_replica_follows_operations() {
        let mut replica = Replica::new();
        let id = ElementId::from("r");

        replica.apply(&op(
            "alice",
            OperationKind::Create {
                element: Element::rectangle(0.0, 0.0, 10.0, 10.0).with_id("r"),
            },
        ));
        replica.apply(&op(
            "bob",
            OperationKind::Update {
                element_id: id.clone(),
                patch: ElementPatch::resized_to(20.0, 5.0),
            },
        ));
        assert_eq!(replica.get(&id).unwrap().width, 20.0);
        assert_eq!(replica.get(&id).unwrap().x, 0.0);

        replica.apply(&op("bob", OperationKind::Lock { element_id: id.clone() }));
        assert_eq!(replica.get(&id).unwrap().locked_by, Some(UserId::from("bob")));

        replica.apply(&op("server", OperationKind::Unlock { element_id: id.clone() }));
        assert!(replica.get(&id).unwrap().locked_by.is_none());

        replica.apply(&op(
            "alice",
            OperationKind::Delete {
                element_id: id.clone(),
                snapshot: None,
            },
        ));
        assert!(replica.is_empty());
    }

    #[test]
    fn test_update_on_missing_element_is_noop() {
        let mut replica = Replica::new();
        replica.apply(&op(
            "bob",
            OperationKind::Update {
                element_id: ElementId::from("ghost"),
                patch: ElementPatch::moved_to(1.0, 1.0),
            },
        ));
        assert!(replica.is_empty());
    }

    #[test]
    fn test_reset_replaces_state() {
        let mut replica = Replica::new();
        replica.apply(&op(
            "alice",
            OperationKind::Create {
                element: Element::rectangle(0.0, 0.0, 1.0, 1.0).with_id("old"),
            },
        ));

        let fresh = Element::ellipse(0.0, 0.0, 1.0, 1.0).with_id("new");
        replica.reset(HashMap::from([(fresh.id.clone(), fresh)]));

        assert!(!replica.contains(&ElementId::from("old")));
        assert!(replica.contains(&ElementId::from("new")));
    }
}
