//! Authoritative document state and the merge engine.
//!
//! Each document session owns one [`DocumentState`]. The relay feeds it incoming
//! operations strictly one at a time; [`DocumentState::apply`] mutates the element
//! map field by field and returns the operation to rebroadcast.
//!
//! Outside the lock gate the policy is overwrite-on-arrival: whichever operation
//! is processed last wins for the fields it touches. Per-field stamps are recorded
//! for every write but are not consulted when merging.
use std::collections::{BTreeMap, HashMap};

use tracing::{debug, warn};

use crate::lock::{self, LockDecision};
use crate::{
    Element, ElementField, ElementId, Operation, OperationKind, PersistedDocument, ServerClock,
    ServerTimestamp, SessionId, UserId,
};

pub type FieldStamps = BTreeMap<ElementField, ServerTimestamp>;

/// Result of merging one operation into a document
#[derive(Debug, Clone, PartialEq)]
pub enum MergeOutcome {
    /// State changed; rebroadcast this (stamped, possibly narrowed) operation
    Applied(Operation),

    /// Refused by arbitration; not rebroadcast, state untouched
    Rejected(RejectReason),

    /// Nothing to do; not rebroadcast, state untouched
    Ignored(IgnoreReason),
}

impl MergeOutcome {
    pub fn applied(self) -> Option<Operation> {
        match self {
            MergeOutcome::Applied(op) => Some(op),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejectReason {
    LockConflict { element_id: ElementId, holder: UserId },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IgnoreReason {
    /// Target element is not (or no longer) in the document
    UnknownElement(ElementId),

    /// Update named no field applicable to the element's variant
    NoApplicableFields(ElementId),

    /// Unlock from a participant that does not hold the lock
    NotLockHolder(ElementId),

    /// Create carrying an element that fails validation
    InvalidElement(String),

    /// Presence never touches document state
    Presence,
}

/// Server-held state of one document session
#[derive(Debug, Clone, Default)]
pub struct DocumentState {
    elements: HashMap<ElementId, Element>,
    field_stamps: HashMap<ElementId, FieldStamps>,
    clock: ServerClock,
}

impl DocumentState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild state from the persistence collaborator.
    ///
    /// Stamps without an element are dropped and elements without stamps are
    /// stamped now, so the stamp map mirrors the element map.
    pub fn from_persisted(doc: PersistedDocument) -> Self {
        let newest = doc
            .field_stamps
            .values()
            .flat_map(|stamps| stamps.values().copied())
            .max();
        let mut clock = newest.map(ServerClock::resume_after).unwrap_or_default();

        let mut field_stamps: HashMap<ElementId, FieldStamps> = doc
            .field_stamps
            .into_iter()
            .filter(|(id, _)| doc.elements.contains_key(id))
            .collect();

        let elements: HashMap<ElementId, Element> = doc.elements.into_iter().collect();
        let unstamped: Vec<&Element> = elements
            .values()
            .filter(|element| !field_stamps.contains_key(&element.id))
            .collect();
        if !unstamped.is_empty() {
            let stamp = clock.stamp();
            for element in unstamped {
                field_stamps.insert(element.id.clone(), stamp_all(element, stamp));
            }
        }

        Self {
            elements,
            field_stamps,
            clock,
        }
    }

    pub fn to_persisted(&self) -> PersistedDocument {
        PersistedDocument {
            elements: self
                .elements
                .iter()
                .map(|(id, element)| (id.clone(), element.clone()))
                .collect(),
            field_stamps: self
                .field_stamps
                .iter()
                .map(|(id, stamps)| (id.clone(), stamps.clone()))
                .collect(),
        }
    }

    /// Merge one operation into the document
    pub fn apply(&mut self, mut op: Operation) -> MergeOutcome {
        let stamp = match &mut op.kind {
            OperationKind::Presence { .. } => return MergeOutcome::Ignored(IgnoreReason::Presence),

            OperationKind::Create { element } => {
                if let Err(e) = element.validate() {
                    warn!("Dropping invalid create from {}: {}", op.user_id, e);
                    return MergeOutcome::Ignored(IgnoreReason::InvalidElement(e.to_string()));
                }

                // Locks are only taken through the lock action
                element.locked_by = None;

                let stamp = self.clock.stamp();
                if self.elements.contains_key(&element.id) {
                    debug!("Create replaces existing element {}", element.id);
                }
                self.field_stamps
                    .insert(element.id.clone(), stamp_all(element, stamp));
                self.elements.insert(element.id.clone(), element.clone());
                stamp
            }

            OperationKind::Update { element_id, patch } => {
                let Some(element) = self.elements.get_mut(element_id) else {
                    return MergeOutcome::Ignored(IgnoreReason::UnknownElement(element_id.clone()));
                };

                let applied = element.apply_patch(patch);
                if applied.is_empty() {
                    return MergeOutcome::Ignored(IgnoreReason::NoApplicableFields(
                        element_id.clone(),
                    ));
                }

                let stamp = self.clock.stamp();
                let stamps = self.field_stamps.entry(element_id.clone()).or_default();
                for field in applied.fields() {
                    stamps.insert(field, stamp);
                }
                *patch = applied;
                stamp
            }

            OperationKind::Delete { element_id, .. } => {
                if self.elements.remove(element_id).is_none() {
                    return MergeOutcome::Ignored(IgnoreReason::UnknownElement(element_id.clone()));
                }
                self.field_stamps.remove(element_id);
                self.clock.stamp()
            }

            OperationKind::Lock { element_id } => {
                let Some(element) = self.elements.get_mut(element_id) else {
                    return MergeOutcome::Ignored(IgnoreReason::UnknownElement(element_id.clone()));
                };

                if let LockDecision::Conflict { holder } = lock::acquire(element, &op.user_id) {
                    return MergeOutcome::Rejected(RejectReason::LockConflict {
                        element_id: element_id.clone(),
                        holder,
                    });
                }
                self.stamp_lock(element_id)
            }

            OperationKind::Unlock { element_id } => {
                let Some(element) = self.elements.get_mut(element_id) else {
                    return MergeOutcome::Ignored(IgnoreReason::UnknownElement(element_id.clone()));
                };

                if !lock::release(element, &op.user_id) {
                    return MergeOutcome::Ignored(IgnoreReason::NotLockHolder(element_id.clone()));
                }
                self.stamp_lock(element_id)
            }
        };

        op.server_timestamp = Some(stamp);
        MergeOutcome::Applied(op)
    }

    fn stamp_lock(&mut self, element_id: &ElementId) -> ServerTimestamp {
        let stamp = self.clock.stamp();
        self.field_stamps
            .entry(element_id.clone())
            .or_default()
            .insert(ElementField::LockedBy, stamp);
        stamp
    }

    /// Force-release every lock `user` holds, returning one system unlock per element
    pub fn force_unlock_all(&mut self, session_id: &SessionId, user: &UserId) -> Vec<Operation> {
        let held = lock::held_by(&self.elements, user);

        held.into_iter()
            .filter_map(|element_id| {
                let element = self.elements.get_mut(&element_id)?;
                element.locked_by = None;
                let stamp = self.stamp_lock(&element_id);
                Some(Operation::system_unlock(session_id.clone(), element_id, stamp))
            })
            .collect()
    }

    /// Full copy of the element map
    pub fn snapshot(&self) -> HashMap<ElementId, Element> {
        self.elements.clone()
    }

    pub fn elements(&self) -> &HashMap<ElementId, Element> {
        &self.elements
    }

    pub fn get(&self, id: &ElementId) -> Option<&Element> {
        self.elements.get(id)
    }

    pub fn field_stamps(&self, id: &ElementId) -> Option<&FieldStamps> {
        self.field_stamps.get(id)
    }

    pub fn len(&self) -> usize {
        self.elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }
}

fn stamp_all(element: &Element, stamp: ServerTimestamp) -> FieldStamps {
    element.fields().into_iter().map(|field| (field, stamp)).collect()
}
