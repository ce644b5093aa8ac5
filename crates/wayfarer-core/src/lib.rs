//! Wayfarer Sync Core Library
//!
//! Offline-first sync engine for a collaborative travel app: trips, places,
//! and end-to-end encrypted conversations.
//!
//! ## Overview
//!
//! Every read is answered from a local embedded mirror of server state, so
//! the app is fully usable offline. Writes are optimistic: they land in the
//! local store immediately, then reconcile against server confirmations.
//! Sends that fail while offline queue in a durable outbox and replay
//! idempotently on reconnect. Message bodies are sealed on the device and
//! stored only as ciphertext.
//!
//! ## Core Principles
//!
//! - **Cache-then-network**: cached rows synchronously, server refresh in
//!   the background
//! - **Single writer**: only the sync orchestrator mutates the store
//! - **Canonical wins**: server-confirmed rows replace optimistic ones,
//!   never the other way around
//!
//! ## Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use wayfarer_core::{
//!     ConnectivityMonitor, LocalStore, Messenger, SyncOrchestrator, UserId,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let store = LocalStore::new("~/.wayfarer/mirror.redb")?;
//!     let orchestrator = SyncOrchestrator::new(store, remote);
//!
//!     let monitor = ConnectivityMonitor::new();
//!     orchestrator.start_drain_loop(&monitor);
//!     orchestrator.start_live_events("session", serde_json::json!({})).await?;
//!
//!     let messenger =
//!         Messenger::new(orchestrator.clone(), &credentials, UserId::from_string("u1")).await?;
//!     for conversation in messenger.list_conversations()? {
//!         println!("{}", conversation.title.as_deref().unwrap_or("(untitled)"));
//!     }
//!
//!     Ok(())
//! }
//! ```

pub mod chat;
pub mod crypto;
pub mod error;
pub mod identity;
pub mod outbox;
pub mod remote;
pub mod store;
pub mod sync;
pub mod types;

// Re-exports
pub use chat::{DisplayMessage, HistoryPage, MessageBody, Messenger};
pub use crypto::{derive_conversation_key, open, seal, ConversationKey};
pub use error::{SyncError, SyncResult};
pub use identity::{CredentialStore, DeviceKeyPair, MemoryCredentialStore};
pub use outbox::{DrainExecutor, DrainReport, Outbox, PendingMutation};
pub use remote::{
    ConnectivityMonitor, ConnectivityState, RemoteError, RemoteErrorKind, RemoteEvent,
    RemoteService,
};
pub use store::{collections, Collection, Entity, LocalStore, QueryOrder};
pub use sync::{CollectionStatus, FetchedPage, MergeOutcome, SyncEvent, SyncOrchestrator};
pub use types::*;
