/// Advisory element locks
/// At most one participant occupies `locked_by` at any time
use std::collections::HashMap;

use crate::{Element, ElementId, UserId};

/// Outcome of a lock request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockDecision {
    /// The element was free and now belongs to the requester
    Granted,

    /// The requester already held the lock
    AlreadyHeld,

    /// Another participant holds the lock; nothing changed
    Conflict { holder: UserId },
}

/// Grant the lock if the element is free or already held by `user`
pub fn acquire(element: &mut Element, user: &UserId) -> LockDecision {
    match &element.locked_by {
        None => {
            element.locked_by = Some(user.clone());
            LockDecision::Granted
        }
        Some(holder) if holder == user => LockDecision::AlreadyHeld,
        Some(holder) => LockDecision::Conflict {
            holder: holder.clone(),
        },
    }
}

/// Release the lock only if `user` holds it. Returns whether anything changed.
pub fn release(element: &mut Element, user: &UserId) -> bool {
    if element.locked_by.as_ref() == Some(user) {
        element.locked_by = None;
        true
    } else {
        false
    }
}

/// Ids of every element locked by `user`, in id order
pub fn held_by(elements: &HashMap<ElementId, Element>, user: &UserId) -> Vec<ElementId> {
    let mut held: Vec<ElementId> = elements
        .values()
        .filter(|element| element.locked_by.as_ref() == Some(user))
        .map(|element| element.id.clone())
        .collect();
    held.sort();
    held
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_exclusivity() {
        let alice = UserId::from("alice");
        let bob = UserId::from("bob");
        let mut element = Element::rectangle(0.0, 0.0, 1.0, 1.0);

        assert_eq!(acquire(&mut element, &alice), LockDecision::Granted);
        assert_eq!(acquire(&mut element, &alice), LockDecision::AlreadyHeld);
        assert_eq!(
            acquire(&mut element, &bob),
            LockDecision::Conflict {
                holder: alice.clone()
            }
        );
        assert_eq!(element.locked_by, Some(alice));
    }

    #[test]
    fn test_release_requires_holder() {
        let alice = UserId::from("alice");
        let bob = UserId::from("bob");
        let mut element = Element::rectangle(0.0, 0.0, 1.0, 1.0);
        acquire(&mut element, &alice);

        assert!(!release(&mut element, &bob));
        assert!(element.locked_by.is_some());
        assert!(release(&mut element, &alice));
        assert!(element.locked_by.is_none());
        assert!(!release(&mut element, &alice));
    }

    #[test]
    fn test_held_by() {
        let alice = UserId::from("alice");
        let mut elements = HashMap::new();
        for id in ["c", "a", "b"] {
            let mut element = Element::rectangle(0.0, 0.0, 1.0, 1.0).with_id(id);
            if id != "b" {
                acquire(&mut element, &alice);
            }
            elements.insert(element.id.clone(), element);
        }

        assert_eq!(
            held_by(&elements, &alice),
            vec![ElementId::from("a"), ElementId::from("c")]
        );
        assert!(held_by(&elements, &UserId::from("bob")).is_empty());
    }
}
