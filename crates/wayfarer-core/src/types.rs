//! Core types for the Wayfarer sync core
//!
//! Identifiers are ULID strings on the client side. Server-assigned ids are
//! opaque strings and pass through unchanged, so the newtypes wrap `String`
//! rather than a parsed ULID.

use serde::{Deserialize, Serialize};
use ulid::Ulid;

pub mod conversation;
pub mod message;
pub mod trip;

pub use conversation::{Conversation, ConversationKind, ConversationMember, MemberRole};
pub use message::{CipherMeta, Message, MessageKind};
pub use trip::{Place, Trip};

macro_rules! string_id {
    ($(#[$doc:meta])* $name:ident, $prefix:expr) => {
        $(#[$doc])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            /// Generate a fresh client-side id (time-ordered ULID).
            pub fn new() -> Self {
                Self(Ulid::new().to_string())
            }

            /// Wrap an existing id (e.g. one assigned by the server).
            pub fn from_string(s: impl Into<String>) -> Self {
                Self(s.into())
            }

            /// The raw id string.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, concat!($prefix, "{}"), self.0)
            }
        }
    };
}

string_id!(
    /// Unique identifier for a conversation
    ConversationId,
    "conv_"
);
string_id!(
    /// Unique identifier for a message
    MessageId,
    "msg_"
);
string_id!(
    /// Unique identifier for a user
    UserId,
    "user_"
);
string_id!(
    /// Unique identifier for a device
    DeviceId,
    "device_"
);
string_id!(
    /// Unique identifier for a trip
    TripId,
    "trip_"
);

/// Current Unix timestamp in milliseconds.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// A cached mirror of a remote entity plus sync bookkeeping columns.
///
/// Every collection in the local store holds rows of this shape. `pending`
/// marks rows written locally that the server has not yet confirmed;
/// `last_sync_at` is the last time the server confirmed this row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedRow<T> {
    /// Local write timestamp (millis)
    pub cached_at: i64,
    /// Last server confirmation timestamp (millis), if any
    pub last_sync_at: Option<i64>,
    /// Written locally, not yet confirmed by the server
    pub pending: bool,
    /// The mirrored entity
    pub entity: T,
}

impl<T> CachedRow<T> {
    /// Wrap a server-confirmed entity.
    pub fn canonical(entity: T, synced_at: i64) -> Self {
        Self {
            cached_at: now_millis(),
            last_sync_at: Some(synced_at),
            pending: false,
            entity,
        }
    }

    /// Wrap a locally written, not-yet-confirmed entity.
    pub fn pending(entity: T) -> Self {
        Self {
            cached_at: now_millis(),
            last_sync_at: None,
            pending: true,
            entity,
        }
    }
}

/// A cached mirror of a remote user profile.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    /// Stable identifier
    pub id: UserId,
    /// Display name
    pub display_name: String,
}
