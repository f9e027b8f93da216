/// WebSocket synchronization protocol for real-time collaboration
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::{Element, ElementId, Operation, Result, SessionId, UserId};

/// Message types exchanged between client and server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum SyncMessage {
    // Connection management
    /// Announces the participant id the server assigned to this connection
    #[serde(rename = "connected")]
    Connected { user_id: UserId },

    #[serde(rename = "join_session")]
    JoinSession { session_id: SessionId },

    /// Full element map of a session; the joining participant's baseline
    #[serde(rename = "session_state")]
    SessionState {
        session_id: SessionId,
        elements: HashMap<ElementId, Element>,
    },

    #[serde(rename = "participant_left")]
    ParticipantLeft {
        session_id: SessionId,
        user_id: UserId,
    },

    // Operation relay (both directions)
    #[serde(rename = "operation")]
    Operation { operation: Operation },

    // Heartbeat
    #[serde(rename = "ping")]
    Ping,

    #[serde(rename = "pong")]
    Pong,
}

impl SyncMessage {
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn kind(&self) -> &'static str {
        match self {
            SyncMessage::Connected { .. } => "connected",
            SyncMessage::JoinSession { .. } => "join_session",
            SyncMessage::SessionState { .. } => "session_state",
            SyncMessage::ParticipantLeft { .. } => "participant_left",
            SyncMessage::Operation { .. } => "operation",
            SyncMessage::Ping => "ping",
            SyncMessage::Pong => "pong",
        }
    }
}
