//! Conversation and membership entities

use serde::{Deserialize, Serialize};

use super::{ConversationId, TripId, UserId};

/// What kind of conversation this is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationKind {
    /// One-to-one conversation
    Direct,
    /// Ad-hoc group conversation
    Group,
    /// Conversation bound to a trip
    Trip,
}

/// A conversation mirrored from the server.
///
/// `last_message_preview` is a plaintext cache of the most recently
/// decrypted message, kept so the conversation list renders without
/// re-decrypting history. It is the only plaintext the store ever holds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    /// Stable identifier
    pub id: ConversationId,
    /// Conversation kind
    pub kind: ConversationKind,
    /// Trip this conversation is bound to, for `ConversationKind::Trip`
    pub trip_id: Option<TripId>,
    /// Optional title (group/trip conversations)
    pub title: Option<String>,
    /// Timestamp of the most recent message (millis)
    pub last_message_at: Option<i64>,
    /// Plaintext preview of the most recent decrypted message
    pub last_message_preview: Option<String>,
}

impl Conversation {
    /// Create a direct conversation with no history yet.
    pub fn direct(id: ConversationId) -> Self {
        Self {
            id,
            kind: ConversationKind::Direct,
            trip_id: None,
            title: None,
            last_message_at: None,
            last_message_preview: None,
        }
    }

    /// Create a trip-bound conversation.
    pub fn for_trip(id: ConversationId, trip_id: TripId, title: impl Into<String>) -> Self {
        Self {
            id,
            kind: ConversationKind::Trip,
            trip_id: Some(trip_id),
            title: Some(title.into()),
            last_message_at: None,
            last_message_preview: None,
        }
    }
}

/// Role of a member within a conversation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemberRole {
    /// Created the conversation, may manage membership
    Owner,
    /// Regular participant
    Member,
}

/// Membership row owned exclusively by its conversation.
///
/// Deleting a conversation cascades to its member rows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationMember {
    /// Owning conversation
    pub conversation_id: ConversationId,
    /// Member user
    pub user_id: UserId,
    /// Member role
    pub role: MemberRole,
}

impl ConversationMember {
    /// Store key for a membership row (`conversation:user`).
    pub fn row_id(&self) -> String {
        format!("{}:{}", self.conversation_id.as_str(), self.user_id.as_str())
    }
}
