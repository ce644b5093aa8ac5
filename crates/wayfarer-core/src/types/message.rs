//! Message entity and ciphertext metadata

use serde::{Deserialize, Serialize};

use super::{ConversationId, DeviceId, MessageId, UserId};

/// Parameters needed to decrypt a message body.
///
/// Opaque to the storage layer; only the crypto module interprets it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CipherMeta {
    /// Algorithm tag (currently `"chacha20poly1305"`)
    pub algorithm: String,
    /// Hex-encoded 12-byte nonce
    pub nonce: String,
    /// Device that sealed the message
    pub sender_device_id: DeviceId,
}

/// Message content kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    /// User-authored text
    Text,
    /// Server-generated notice (member joined, trip updated, ...)
    System,
}

/// A message row: ciphertext plus routing metadata.
///
/// A row is either local-pending (client-generated id, not yet acknowledged)
/// or canonical (server-assigned id, server `created_at`), never both.
/// The `pending` flag lives on the surrounding [`CachedRow`], and
/// reconciliation always replaces pending rows delete-then-insert.
///
/// [`CachedRow`]: crate::types::CachedRow
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Stable identifier (client ULID while pending, server id once canonical)
    pub id: MessageId,
    /// Conversation this message belongs to
    pub conversation_id: ConversationId,
    /// Authoring user
    pub sender_user_id: UserId,
    /// Authoring device
    pub sender_device_id: DeviceId,
    /// Sealed message body
    pub ciphertext: Vec<u8>,
    /// Decryption parameters
    pub meta: CipherMeta,
    /// Content kind
    pub kind: MessageKind,
    /// Creation timestamp (millis); provisional until server-assigned
    pub created_at: i64,
    /// Per-device, per-conversation send counter. Used to recognize the
    /// device's own message echoed back by the server under a new id.
    pub local_seq: u64,
}
