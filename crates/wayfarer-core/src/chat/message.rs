//! Display-ready message types
//!
//! [`DisplayMessage`] is the decrypted, UI-facing form of a stored message
//! row. A body that cannot be decrypted with the available keys becomes
//! [`MessageBody::Unreadable`] rather than an error, so one bad row never
//! blocks the rest of a page.

use serde::{Deserialize, Serialize};

use crate::types::{CachedRow, Message};

/// Decrypted message body, or a placeholder when decryption failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageBody {
    /// Decrypted text content
    Text(String),
    /// Could not be opened with available keys; ciphertext stays in the
    /// store for a future retry once the right key is available
    Unreadable,
}

impl MessageBody {
    /// The text content, if readable.
    pub fn text(&self) -> Option<&str> {
        match self {
            MessageBody::Text(s) => Some(s),
            MessageBody::Unreadable => None,
        }
    }
}

/// A message ready for UI rendering.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DisplayMessage {
    /// Message id (client id while pending, server id once canonical)
    pub id: String,
    /// Conversation id
    pub conversation_id: String,
    /// Authoring user id
    pub sender_user_id: String,
    /// Decrypted body or unreadable placeholder
    pub body: MessageBody,
    /// Creation timestamp (millis); provisional for pending rows
    pub created_at: i64,
    /// Still waiting for server confirmation ("sending")
    pub pending: bool,
    /// Whether the session user authored this message
    pub is_mine: bool,
    /// Per-device send counter (orders pending rows)
    pub local_seq: u64,
}

impl DisplayMessage {
    /// Build from a store row and its decryption outcome.
    pub fn from_row(row: &CachedRow<Message>, body: MessageBody, my_user_id: &str) -> Self {
        Self {
            id: row.entity.id.as_str().to_string(),
            conversation_id: row.entity.conversation_id.as_str().to_string(),
            sender_user_id: row.entity.sender_user_id.as_str().to_string(),
            body,
            created_at: row.entity.created_at,
            pending: row.pending,
            is_mine: row.entity.sender_user_id.as_str() == my_user_id,
            local_seq: row.entity.local_seq,
        }
    }
}

/// One page of conversation history, chronological order.
///
/// Canonical rows come first ordered by server `created_at`; pending rows
/// follow in local enqueue order.
#[derive(Debug, Clone)]
pub struct HistoryPage {
    /// Messages in display order
    pub messages: Vec<DisplayMessage>,
    /// Cursor for the next (older) page, if more history exists remotely
    pub next_cursor: Option<String>,
}

/// Order message rows for display: canonical by `created_at` (ties broken
/// by id for stability), then pending by `local_seq`.
pub(crate) fn sort_for_display(rows: &mut [CachedRow<Message>]) {
    rows.sort_by(|a, b| {
        a.pending.cmp(&b.pending).then_with(|| {
            if a.pending {
                a.entity.local_seq.cmp(&b.entity.local_seq)
            } else {
                a.entity
                    .created_at
                    .cmp(&b.entity.created_at)
                    .then_with(|| a.entity.id.cmp(&b.entity.id))
            }
        })
    });
}
