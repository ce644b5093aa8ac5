//! Remote service seam and connectivity monitoring
//!
//! The remote API is treated as an opaque query/mutation/subscription
//! service: `execute(operation, variables)` returns a JSON value or a typed
//! error, `subscribe(topic, variables)` yields a stream of events. Typed
//! envelope structs parse the opaque values at the edge, so the rest of the
//! core works with sum types rather than raw JSON.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{mpsc, watch};

use crate::error::{SyncError, SyncResult};
use crate::types::{
    CachedRow, CipherMeta, Conversation, ConversationId, ConversationKind, ConversationMember,
    DeviceId, MemberRole, Message, MessageId, MessageKind, TripId, UserId,
};

/// How a remote failure should be handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteErrorKind {
    /// No connectivity; retry once online
    Network,
    /// Call exceeded its bounded timeout; retry
    Timeout,
    /// Inputs rejected; permanent
    Validation,
    /// Credentials rejected; permanent
    Auth,
}

/// Error returned by the remote service.
#[derive(Debug, Clone)]
pub struct RemoteError {
    /// Failure classification
    pub kind: RemoteErrorKind,
    /// Human-readable detail
    pub message: String,
}

impl RemoteError {
    /// Network-unavailable error.
    pub fn network(message: impl Into<String>) -> Self {
        Self {
            kind: RemoteErrorKind::Network,
            message: message.into(),
        }
    }

    /// Timeout error.
    pub fn timeout(message: impl Into<String>) -> Self {
        Self {
            kind: RemoteErrorKind::Timeout,
            message: message.into(),
        }
    }

    /// Validation error.
    pub fn validation(message: impl Into<String>) -> Self {
        Self {
            kind: RemoteErrorKind::Validation,
            message: message.into(),
        }
    }

    /// Authentication/authorization error.
    pub fn auth(message: impl Into<String>) -> Self {
        Self {
            kind: RemoteErrorKind::Auth,
            message: message.into(),
        }
    }

    /// Whether a retry may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self.kind, RemoteErrorKind::Network | RemoteErrorKind::Timeout)
    }
}

impl std::fmt::Display for RemoteError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

impl From<RemoteError> for SyncError {
    fn from(err: RemoteError) -> Self {
        match err.kind {
            RemoteErrorKind::Network => SyncError::NetworkUnavailable(err.message),
            RemoteErrorKind::Timeout => SyncError::Timeout(err.message),
            RemoteErrorKind::Validation => SyncError::RemoteValidation(err.message),
            RemoteErrorKind::Auth => SyncError::RemoteAuth(err.message),
        }
    }
}

/// Live event pushed by a subscription topic.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum RemoteEvent {
    /// A message was added to a conversation
    #[serde(rename_all = "camelCase")]
    MessageAdded {
        /// Conversation the message belongs to
        conversation_id: String,
        /// The confirmed message
        message: MessageRecord,
    },
    /// A conversation's server-authoritative fields changed
    #[serde(rename_all = "camelCase")]
    ConversationUpdated {
        /// The updated conversation
        conversation: ConversationRecord,
    },
}

/// Opaque remote procedure/query service.
///
/// Injected into the orchestrator as a capability object; the core never
/// assumes anything about the wire beyond operation name, variables, and
/// result shape.
#[async_trait]
pub trait RemoteService: Send + Sync {
    /// Execute a named query or mutation.
    async fn execute(&self, operation: &str, variables: Value) -> Result<Value, RemoteError>;

    /// Subscribe to a named event topic.
    ///
    /// The receiver yields events until the subscription is torn down.
    async fn subscribe(
        &self,
        topic: &str,
        variables: Value,
    ) -> Result<mpsc::Receiver<RemoteEvent>, RemoteError>;
}

/// Parse an opaque result value into a typed envelope.
pub fn parse_result<T: DeserializeOwned>(value: Value) -> SyncResult<T> {
    serde_json::from_value(value).map_err(|e| SyncError::Serialization(e.to_string()))
}

// ═══════════════════════════════════════════════════════════════════════
// Typed operation envelopes
// ═══════════════════════════════════════════════════════════════════════

/// Server-confirmed message as returned by queries, mutations, and events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageRecord {
    /// Server-assigned id
    pub id: String,
    /// Conversation id
    pub conversation_id: String,
    /// Authoring user
    pub sender_user_id: String,
    /// Authoring device
    pub sender_device_id: String,
    /// Sealed body
    pub ciphertext: Vec<u8>,
    /// Decryption parameters
    pub meta: CipherMeta,
    /// Content kind
    pub kind: MessageKind,
    /// Server-assigned creation time (millis)
    pub created_at: i64,
    /// Client id supplied at send time, echoed back for dedup
    pub client_id: Option<String>,
    /// Client per-device send counter, echoed back for echo recognition
    pub client_seq: Option<u64>,
}

impl MessageRecord {
    /// Convert into a canonical store row.
    pub fn into_row(self) -> CachedRow<Message> {
        let created_at = self.created_at;
        let message = Message {
            id: MessageId::from_string(self.id),
            conversation_id: ConversationId::from_string(self.conversation_id),
            sender_user_id: UserId::from_string(self.sender_user_id),
            sender_device_id: DeviceId::from_string(self.sender_device_id),
            ciphertext: self.ciphertext,
            meta: self.meta,
            kind: self.kind,
            created_at,
            local_seq: self.client_seq.unwrap_or(0),
        };
        CachedRow::canonical(message, created_at)
    }
}

/// Membership entry inside a [`ConversationRecord`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemberRecord {
    /// Member user id
    pub user_id: String,
    /// Member role
    pub role: MemberRole,
}

/// Server-confirmed conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationRecord {
    /// Server-assigned id
    pub id: String,
    /// Conversation kind
    pub kind: ConversationKind,
    /// Bound trip, if any
    pub trip_id: Option<String>,
    /// Title, if any
    pub title: Option<String>,
    /// Timestamp of the most recent message (millis)
    pub last_message_at: Option<i64>,
    /// Membership list (owned by the conversation)
    pub members: Vec<MemberRecord>,
    /// Server confirmation timestamp (millis)
    pub synced_at: i64,
}

impl ConversationRecord {
    /// Split into a canonical conversation row and its member rows.
    ///
    /// The preview field is left untouched: it is a local plaintext cache
    /// the server knows nothing about.
    pub fn into_rows(
        self,
        existing_preview: Option<String>,
    ) -> (CachedRow<Conversation>, Vec<CachedRow<ConversationMember>>) {
        let conversation_id = ConversationId::from_string(self.id);
        let members = self
            .members
            .into_iter()
            .map(|m| {
                CachedRow::canonical(
                    ConversationMember {
                        conversation_id: conversation_id.clone(),
                        user_id: UserId::from_string(m.user_id),
                        role: m.role,
                    },
                    self.synced_at,
                )
            })
            .collect();

        let conversation = Conversation {
            id: conversation_id,
            kind: self.kind,
            trip_id: self.trip_id.map(TripId::from_string),
            title: self.title,
            last_message_at: self.last_message_at,
            last_message_preview: existing_preview,
        };
        (CachedRow::canonical(conversation, self.synced_at), members)
    }
}

/// One page of message history, newest-cursor pagination.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagePage {
    /// Messages in this page
    pub records: Vec<MessageRecord>,
    /// Cursor for the next (older) page, if more history exists
    pub next_cursor: Option<String>,
}

// ═══════════════════════════════════════════════════════════════════════
// Connectivity
// ═══════════════════════════════════════════════════════════════════════

/// Device connectivity state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityState {
    /// Network reachable
    Online,
    /// Network unreachable
    Offline,
}

/// Connectivity monitor handle.
///
/// The host platform feeds online/offline transitions in; the orchestrator
/// watches for offline-to-online transitions to trigger outbox draining.
#[derive(Clone)]
pub struct ConnectivityMonitor {
    tx: watch::Sender<ConnectivityState>,
}

impl ConnectivityMonitor {
    /// Create a monitor with the given initial state.
    pub fn new(initial: ConnectivityState) -> Self {
        let (tx, _) = watch::channel(initial);
        Self { tx }
    }

    /// Current state.
    pub fn state(&self) -> ConnectivityState {
        *self.tx.borrow()
    }

    /// Watch for state transitions.
    pub fn watch(&self) -> watch::Receiver<ConnectivityState> {
        self.tx.subscribe()
    }

    /// Report a state transition.
    pub fn set(&self, state: ConnectivityState) {
        // send_replace never fails even with no receivers
        self.tx.send_replace(state);
    }
}

impl Default for ConnectivityMonitor {
    fn default() -> Self {
        Self::new(ConnectivityState::Online)
    }
}
