/// Participant presence tracking for collaborative editing
/// Shows where other participants are pointing on the canvas
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::{Point, UserId};

/// Color assigned to a participant for cursor highlighting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserColor {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl UserColor {
    /// Generate a color based on participant ID (deterministic)
    pub fn from_user_id(user_id: &UserId) -> Self {
        // FNV-1a, so short ids still spread across the palette
        let hash = user_id
            .0
            .bytes()
            .fold(0x811c_9dc5_u32, |h, b| (h ^ b as u32).wrapping_mul(0x0100_0193));
        let [r, g, b, _] = hash.to_le_bytes();

        // Keep cursors readable on a white canvas
        Self {
            r: r / 4 * 3,
            g: g / 4 * 3,
            b: b / 4 * 3,
        }
    }

    /// Convert to hex color string
    pub fn to_hex(&self) -> String {
        format!("#{:02X}{:02X}{:02X}", self.r, self.g, self.b)
    }
}

/// Last known cursor of one participant
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceEntry {
    pub cursor: Point,
    pub color: UserColor,
    pub last_seen: chrono::DateTime<chrono::Utc>,
}

/// Ephemeral cursor map keyed by participant.
///
/// Updates are last-write-wins per sender in delivery order; presence timestamps
/// are not compared.
#[derive(Debug, Clone, Default)]
pub struct PresenceTracker {
    entries: HashMap<UserId, PresenceEntry>,
}

impl PresenceTracker {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    /// Record the newest delivered cursor for `user`
    pub fn update(&mut self, user: &UserId, cursor: Point) {
        match self.entries.get_mut(user) {
            Some(entry) => {
                entry.cursor = cursor;
                entry.last_seen = chrono::Utc::now();
            }
            None => {
                self.entries.insert(
                    user.clone(),
                    PresenceEntry {
                        cursor,
                        color: UserColor::from_user_id(user),
                        last_seen: chrono::Utc::now(),
                    },
                );
            }
        }
    }

    /// Drop a participant's entry; returns whether one existed
    pub fn remove(&mut self, user: &UserId) -> bool {
        self.entries.remove(user).is_some()
    }

    pub fn get(&self, user: &UserId) -> Option<&PresenceEntry> {
        self.entries.get(user)
    }

    /// Current cursors for renderers
    pub fn cursors(&self) -> impl Iterator<Item = (&UserId, &PresenceEntry)> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
