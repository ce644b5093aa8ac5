//! Sync orchestration
//!
//! The orchestrator is the single writer for the local store. It merges
//! query responses, applies optimistic local writes, reconciles them
//! against server confirmations, drains the outbox when connectivity
//! allows, and merges live push events without duplicating rows already
//! applied.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │  SyncOrchestrator                                               │
//! │  ├── fetch-and-merge per collection (cache-then-network)        │
//! │  ├── optimistic writes + confirmation reconcile                 │
//! │  ├── live-event merge task (subscription stream -> store)       │
//! │  ├── drain loop task (connectivity watch + backoff)             │
//! │  └── event_tx: broadcast::Sender<SyncEvent>                     │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Tasks coordinate only through the store's transactional boundary; the
//! UI layer and the messaging façade never write to the store directly.

mod events;
mod orchestrator;

pub use events::{CollectionStatus, SyncEvent};
pub use orchestrator::{FetchedPage, MergeOutcome, SyncOrchestrator};
