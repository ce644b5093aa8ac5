//! Sync event and status types
//!
//! The orchestrator broadcasts [`SyncEvent`]s so the UI layer can react to
//! refreshed collections, arriving messages, and outbox activity without
//! polling the store.

use std::fmt;

/// Per-collection fetch/merge state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CollectionStatus {
    /// Nothing in flight
    #[default]
    Idle,
    /// Remote query in flight
    Fetching,
    /// Applying fetched rows to the store
    Merging,
}

impl fmt::Display for CollectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CollectionStatus::Idle => write!(f, "Idle"),
            CollectionStatus::Fetching => write!(f, "Fetching"),
            CollectionStatus::Merging => write!(f, "Merging"),
        }
    }
}

/// Events broadcast by the sync orchestrator.
#[derive(Debug, Clone)]
pub enum SyncEvent {
    /// A collection was refreshed from the server
    CollectionRefreshed {
        /// Collection name
        collection: String,
        /// Rows applied by the merge
        applied: usize,
    },
    /// A fetch failed; cached rows remain valid but may be stale
    StaleData {
        /// Collection name
        collection: String,
        /// Failure detail
        message: String,
    },
    /// An optimistic message row was written locally ("sending")
    MessagePending {
        /// Conversation id
        conversation_id: String,
        /// Client-generated message id
        message_id: String,
    },
    /// A locally sent message was confirmed by the server
    MessageConfirmed {
        /// Conversation id
        conversation_id: String,
        /// Server-assigned message id
        message_id: String,
    },
    /// A new message arrived via the live event stream
    MessageArrived {
        /// Conversation id
        conversation_id: String,
        /// Server-assigned message id
        message_id: String,
    },
    /// A conversation's server-authoritative fields changed
    ConversationUpdated {
        /// Conversation id
        conversation_id: String,
    },
    /// An outbox drain pass finished
    OutboxDrained {
        /// Entries confirmed and removed
        completed: usize,
        /// Entries dropped with a permanent error
        abandoned: usize,
        /// Entries still queued after a transient failure
        stalled: usize,
    },
}

impl SyncEvent {
    /// Conversation id this event concerns, if any.
    pub fn conversation_id(&self) -> Option<&str> {
        match self {
            SyncEvent::MessagePending { conversation_id, .. }
            | SyncEvent::MessageConfirmed { conversation_id, .. }
            | SyncEvent::MessageArrived { conversation_id, .. }
            | SyncEvent::ConversationUpdated { conversation_id } => Some(conversation_id),
            _ => None,
        }
    }
}
