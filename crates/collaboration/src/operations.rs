/// Document operations
/// The unit of change exchanged between participants and the server
use serde::{Deserialize, Serialize};

use crate::{Element, ElementId, ElementPatch, Point, ServerTimestamp, SessionId, UserId};

/// Unique operation identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OperationId(pub uuid::Uuid);

impl OperationId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for OperationId {
    fn default() -> Self {
        Self::new()
    }
}

/// An operation against one document session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    /// Unique operation ID
    pub id: OperationId,

    /// Document session the operation targets
    pub session_id: SessionId,

    /// Participant who originated this operation
    pub user_id: UserId,

    /// The actual change
    #[serde(flatten)]
    pub kind: OperationKind,

    /// Timestamp when operation was created (client time)
    pub timestamp: chrono::DateTime<chrono::Utc>,

    /// Assigned by the server when it processes the operation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_timestamp: Option<ServerTimestamp>,
}

impl Operation {
    pub fn new(session_id: SessionId, user_id: UserId, kind: OperationKind) -> Self {
        Self {
            id: OperationId::new(),
            session_id,
            user_id,
            kind,
            timestamp: chrono::Utc::now(),
            server_timestamp: None,
        }
    }

    /// Server-originated release of a lock left behind by a departed participant
    pub fn system_unlock(
        session_id: SessionId,
        element_id: ElementId,
        stamp: ServerTimestamp,
    ) -> Self {
        let mut op = Self::new(session_id, UserId::system(), OperationKind::Unlock { element_id });
        op.server_timestamp = Some(stamp);
        op
    }

    /// Same change under a fresh id and client time
    pub fn reissue(&self) -> Self {
        Self {
            id: OperationId::new(),
            timestamp: chrono::Utc::now(),
            server_timestamp: None,
            ..self.clone()
        }
    }

    pub fn element_id(&self) -> Option<&ElementId> {
        self.kind.element_id()
    }
}

/// Kinds of change, tagged by `action` on the wire
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum OperationKind {
    Create {
        element: Element,
    },
    Update {
        element_id: ElementId,
        patch: ElementPatch,
    },
    Delete {
        element_id: ElementId,
        /// Element as it was when deleted, kept so the deletion can be undone
        #[serde(default, skip_serializing_if = "Option::is_none")]
        snapshot: Option<Element>,
    },
    Lock {
        element_id: ElementId,
    },
    Unlock {
        element_id: ElementId,
    },
    Presence {
        cursor: Point,
    },
}

impl OperationKind {
    /// Target element; absent only for presence
    pub fn element_id(&self) -> Option<&ElementId> {
        match self {
            OperationKind::Create { element } => Some(&element.id),
            OperationKind::Update { element_id, .. }
            | OperationKind::Delete { element_id, .. }
            | OperationKind::Lock { element_id }
            | OperationKind::Unlock { element_id } => Some(element_id),
            OperationKind::Presence { .. } => None,
        }
    }

    pub fn action(&self) -> &'static str {
        match self {
            OperationKind::Create { .. } => "create",
            OperationKind::Update { .. } => "update",
            OperationKind::Delete { .. } => "delete",
            OperationKind::Lock { .. } => "lock",
            OperationKind::Unlock { .. } => "unlock",
            OperationKind::Presence { .. } => "presence",
        }
    }

    pub fn is_presence(&self) -> bool {
        matches!(self, OperationKind::Presence { .. })
    }

    /// Lock state is server-authoritative; these are always reconciled locally
    pub fn is_lock_state(&self) -> bool {
        matches!(self, OperationKind::Lock { .. } | OperationKind::Unlock { .. })
    }
}
