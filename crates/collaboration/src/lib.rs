//! Real-time collaborative editing of vector-graphics documents.
//!
//! The server holds the authoritative element map of every document session and
//! relays operations between participants; clients apply their own intents
//! optimistically and reconcile against the server echo.
use serde::{Deserialize, Serialize};
use thiserror::Error;

mod element;
pub use element::*;

mod operations;
pub use operations::*;

mod sync;
pub use sync::*;

pub mod lock;
pub use lock::LockDecision;

mod store;
pub use store::*;

mod presence;
pub use presence::*;

mod persistence;
pub use persistence::*;

mod relay;
pub use relay::*;

mod replica;
pub use replica::*;

mod undo;
pub use undo::*;

mod client;
pub use client::*;

#[derive(Debug, Error)]
pub enum CollaborationError {
    #[error("network error: {0}")]
    NetworkError(String),

    #[error("serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("storage error: {0}")]
    StorageError(#[from] std::io::Error),

    #[error("invalid session id: {0:?}")]
    InvalidSessionId(String),

    #[error("invalid element {id}: {reason}")]
    InvalidElement { id: String, reason: String },
}

pub type Result<T> = std::result::Result<T, CollaborationError>;

/// Participant identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UserId(pub String);

impl UserId {
    /// Identity stamped on operations the server originates itself
    pub const SYSTEM: &'static str = "server";

    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn system() -> Self {
        Self(Self::SYSTEM.to_string())
    }

    pub fn is_system(&self) -> bool {
        self.0 == Self::SYSTEM
    }
}

impl Default for UserId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for UserId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Document session identifier.
///
/// Session ids double as persisted file names, so only ASCII alphanumerics,
/// `-` and `_` are accepted.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SessionId(String);

impl SessionId {
    pub const MAX_LEN: usize = 128;

    pub fn parse(raw: &str) -> Result<Self> {
        let valid = !raw.is_empty()
            && raw.len() <= Self::MAX_LEN
            && raw
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_');

        if valid {
            Ok(Self(raw.to_string()))
        } else {
            Err(CollaborationError::InvalidSessionId(raw.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for SessionId {
    type Error = CollaborationError;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<SessionId> for String {
    fn from(value: SessionId) -> Self {
        value.0
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Server-assigned processing timestamp in milliseconds since the Unix epoch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ServerTimestamp(pub i64);

impl ServerTimestamp {
    pub fn now() -> Self {
        Self(chrono::Utc::now().timestamp_millis())
    }
}

/// Per-document stamp source.
///
/// Stamps are strictly increasing in processing order even when the wall clock
/// stalls or steps backwards.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerClock {
    last: Option<ServerTimestamp>,
}

impl ServerClock {
    pub fn new() -> Self {
        Self { last: None }
    }

    /// Continue after the newest stamp already recorded for a document
    pub fn resume_after(last: ServerTimestamp) -> Self {
        Self { last: Some(last) }
    }

    pub fn stamp(&mut self) -> ServerTimestamp {
        let now = ServerTimestamp::now();
        let next = match self.last {
            Some(last) if now <= last => ServerTimestamp(last.0 + 1),
            _ => now,
        };
        self.last = Some(next);
        next
    }
}
