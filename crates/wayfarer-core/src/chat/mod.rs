//! Conversational messaging facade
//!
//! This module provides the high-level chat API built on the sync engine.
//! It offers a user-friendly surface for listing conversations, loading
//! history pages, and sending encrypted messages.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │  Chat Layer (this module)                                       │
//! │  - Messenger: session-scoped conversational API                 │
//! │  - DisplayMessage: decrypted, display-ready message struct      │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  Sync Layer (sync module)                                       │
//! │  - SyncOrchestrator: fetch/merge, optimistic writes, outbox     │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  Storage Layer (store module)                                   │
//! │  - LocalStore: redb mirror, ciphertext-only message rows        │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Message Flow
//!
//! **Sending:**
//! 1. `send_message()` derives the conversation key and seals the text
//! 2. A pending row lands in the store before any network I/O
//! 3. The orchestrator sends, reconciles, or queues for offline replay
//!
//! **Receiving:**
//! 1. Live events merge canonical rows through the orchestrator
//! 2. `on_message()` decrypts arrivals and delivers them per conversation
//!
//! The encrypt/decrypt boundary lives here: ciphertext and
//! [`crate::types::CipherMeta`] are what the store holds, plaintext exists
//! only in the [`DisplayMessage`] values handed to the caller (plus the
//! conversation-row preview cache).

mod message;

pub use message::{DisplayMessage, HistoryPage, MessageBody};

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::crypto::{self, ConversationKey};
use crate::error::SyncResult;
use crate::identity::{require_device_keypair, CredentialStore, DeviceKeyPair};
use crate::store::{collections, QueryOrder};
use crate::sync::{SyncEvent, SyncOrchestrator};
use crate::types::{
    CachedRow, Conversation, ConversationId, Message, MessageId, MessageKind, UserId,
};

/// Remote page size for history pagination
const HISTORY_PAGE_SIZE: usize = 50;

/// Longest plaintext preview stored on a conversation row
const PREVIEW_MAX_CHARS: usize = 120;

/// Capacity for per-conversation message delivery channels
const DELIVERY_CHANNEL_CAPACITY: usize = 64;

/// The conversational messaging surface for an authenticated session.
///
/// Holds the session identity and device key material; everything else is
/// borrowed from the orchestrator. Reads come straight from the cache,
/// writes go through the orchestrator's optimistic path.
pub struct Messenger {
    orchestrator: Arc<SyncOrchestrator>,
    keypair: DeviceKeyPair,
    user_id: UserId,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Messenger {
    /// Build a messenger for the session user, loading the device key pair
    /// from the platform credential store.
    ///
    /// Fails with [`crate::error::SyncError::CredentialsMissing`] when no
    /// key pair has been provisioned.
    pub async fn new(
        orchestrator: Arc<SyncOrchestrator>,
        credentials: &dyn CredentialStore,
        user_id: UserId,
    ) -> SyncResult<Self> {
        let keypair = require_device_keypair(credentials).await?;
        Ok(Self {
            orchestrator,
            keypair,
            user_id,
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// The session user.
    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    /// Subscribe to the raw sync event stream (pending/confirmed/stale
    /// notifications the delivery channels do not carry).
    pub fn events(&self) -> broadcast::Receiver<SyncEvent> {
        self.orchestrator.subscribe()
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Conversations
    // ═══════════════════════════════════════════════════════════════════════

    /// List conversations, most recent activity first.
    ///
    /// Returns cached rows synchronously and kicks off a background
    /// refresh; the caller hears about server updates through
    /// [`SyncEvent::CollectionRefreshed`].
    pub fn list_conversations(&self) -> SyncResult<Vec<Conversation>> {
        let rows = self.orchestrator.store().query(
            &collections::CONVERSATIONS,
            |_| true,
            QueryOrder::Unordered,
            None,
        )?;

        let mut conversations: Vec<Conversation> =
            rows.into_iter().map(|r| r.entity).collect();
        // Newest activity first; conversations with no messages sink
        conversations.sort_by(|a, b| b.last_message_at.cmp(&a.last_message_at));

        let orchestrator = self.orchestrator.clone();
        let handle = tokio::spawn(async move {
            if let Err(e) = orchestrator.fetch_conversations().await {
                // StaleData already broadcast; cached rows stay valid
                debug!(error = %e, "Background conversation refresh failed");
            }
        });
        self.tasks.lock().push(handle);

        Ok(conversations)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // History
    // ═══════════════════════════════════════════════════════════════════════

    /// Load one page of conversation history.
    ///
    /// Fetches a remote page behind the opaque `cursor` and persists the
    /// canonical rows; the returned page holds the fetched rows plus any
    /// pending rows, not the whole cached history. A transient fetch
    /// failure serves a page-sized slice of the cache and keeps the cursor
    /// so the page can be retried; a row that will not decrypt becomes
    /// [`MessageBody::Unreadable`] instead of failing the page.
    pub async fn paginate_history(
        &self,
        conversation_id: &ConversationId,
        cursor: Option<&str>,
    ) -> SyncResult<HistoryPage> {
        let (mut rows, next_cursor) = match self
            .orchestrator
            .fetch_message_page(conversation_id, cursor, HISTORY_PAGE_SIZE)
            .await
        {
            Ok(page) => {
                let mut rows = Vec::with_capacity(page.message_ids.len());
                for id in &page.message_ids {
                    if let Some(row) = self.orchestrator.store().get(&collections::MESSAGES, id)? {
                        rows.push(row);
                    }
                }
                // Unacknowledged sends ride along so they stay visible
                rows.extend(self.pending_rows(conversation_id)?);
                (rows, page.next_cursor)
            }
            Err(e) if e.is_transient() => {
                debug!(
                    conversation_id = %conversation_id,
                    error = %e,
                    "History fetch unavailable; serving cache"
                );
                (self.cached_page(conversation_id)?, cursor.map(String::from))
            }
            Err(e) => return Err(e),
        };
        message::sort_for_display(&mut rows);

        let key = crypto::derive_conversation_key(conversation_id, &self.keypair);
        let messages = rows
            .iter()
            .map(|row| self.decrypt_row(row, &key))
            .collect();

        Ok(HistoryPage {
            messages,
            next_cursor,
        })
    }

    fn conversation_rows(
        &self,
        conversation_id: &ConversationId,
    ) -> SyncResult<Vec<CachedRow<Message>>> {
        self.orchestrator.store().query(
            &collections::MESSAGES,
            |r| r.entity.conversation_id == *conversation_id,
            QueryOrder::Unordered,
            None,
        )
    }

    fn pending_rows(
        &self,
        conversation_id: &ConversationId,
    ) -> SyncResult<Vec<CachedRow<Message>>> {
        self.orchestrator.store().query(
            &collections::MESSAGES,
            |r| r.pending && r.entity.conversation_id == *conversation_id,
            QueryOrder::Unordered,
            None,
        )
    }

    /// The newest page-sized slice of cached canonical rows, plus every
    /// pending row. Used when the remote page cannot be fetched.
    fn cached_page(
        &self,
        conversation_id: &ConversationId,
    ) -> SyncResult<Vec<CachedRow<Message>>> {
        let mut rows = self.conversation_rows(conversation_id)?;
        message::sort_for_display(&mut rows);
        let canonical = rows.iter().filter(|r| !r.pending).count();
        let start = canonical.saturating_sub(HISTORY_PAGE_SIZE);
        Ok(rows.split_off(start))
    }

    fn decrypt_row(&self, row: &CachedRow<Message>, key: &ConversationKey) -> DisplayMessage {
        let body = match crypto::open(&row.entity.ciphertext, &row.entity.meta, key) {
            Ok(plaintext) => match String::from_utf8(plaintext) {
                Ok(text) => MessageBody::Text(text),
                Err(_) => MessageBody::Unreadable,
            },
            Err(e) => {
                debug!(message_id = %row.entity.id, error = %e, "Message not readable");
                MessageBody::Unreadable
            }
        };
        DisplayMessage::from_row(row, body, self.user_id.as_str())
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Sending
    // ═══════════════════════════════════════════════════════════════════════

    /// Send a text message.
    ///
    /// The sealed message appears locally as a pending row before the
    /// network call starts. On success the returned id is the
    /// server-assigned one; when the device is offline the client id is
    /// returned and the send replays from the outbox on reconnect.
    pub async fn send_message(
        &self,
        conversation_id: &ConversationId,
        plaintext: &str,
    ) -> SyncResult<MessageId> {
        let key = crypto::derive_conversation_key(conversation_id, &self.keypair);
        let (ciphertext, meta) = crypto::seal(plaintext.as_bytes(), &key, &self.keypair)?;

        let message = Message {
            id: MessageId::new(),
            conversation_id: conversation_id.clone(),
            sender_user_id: self.user_id.clone(),
            sender_device_id: self.keypair.device_id().clone(),
            ciphertext,
            meta,
            kind: MessageKind::Text,
            created_at: crate::types::now_millis(),
            local_seq: self.next_local_seq(conversation_id)?,
        };

        self.orchestrator.apply_optimistic_message(
            CachedRow::pending(message.clone()),
            Some(preview_of(plaintext)),
        )?;
        self.orchestrator.send_pending_message(&message).await
    }

    /// Next per-device send counter for a conversation: one past the
    /// highest sequence this device has written, pending or canonical.
    fn next_local_seq(&self, conversation_id: &ConversationId) -> SyncResult<u64> {
        let device_id = self.keypair.device_id().clone();
        let rows = self.orchestrator.store().query(
            &collections::MESSAGES,
            |r| {
                r.entity.conversation_id == *conversation_id
                    && r.entity.sender_device_id == device_id
            },
            QueryOrder::Unordered,
            None,
        )?;
        Ok(rows
            .iter()
            .map(|r| r.entity.local_seq)
            .max()
            .map_or(1, |max| max + 1))
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Live delivery
    // ═══════════════════════════════════════════════════════════════════════

    /// Receive decrypted messages for one conversation as they arrive.
    ///
    /// Spawns a task that filters the orchestrator's broadcast stream,
    /// decrypts each arriving message, and refreshes the conversation's
    /// plaintext preview. The channel closes when the messenger shuts down
    /// or the caller drops the receiver.
    pub fn on_message(&self, conversation_id: &ConversationId) -> mpsc::Receiver<DisplayMessage> {
        let (tx, rx) = mpsc::channel(DELIVERY_CHANNEL_CAPACITY);
        let mut events = self.orchestrator.subscribe();
        let orchestrator = self.orchestrator.clone();
        let key = crypto::derive_conversation_key(conversation_id, &self.keypair);
        let conversation_id = conversation_id.clone();
        let user_id = self.user_id.clone();

        let handle = tokio::spawn(async move {
            loop {
                let event = match events.recv().await {
                    Ok(event) => event,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Message delivery lagged behind sync events");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };

                let SyncEvent::MessageArrived {
                    conversation_id: event_conversation,
                    message_id,
                } = event
                else {
                    continue;
                };
                if event_conversation != conversation_id.as_str() {
                    continue;
                }

                let row = match orchestrator.store().get(&collections::MESSAGES, &message_id) {
                    Ok(Some(row)) => row,
                    Ok(None) => continue,
                    Err(e) => {
                        warn!(message_id = %message_id, error = %e, "Failed to load arrived message");
                        continue;
                    }
                };

                let body = match crypto::open(&row.entity.ciphertext, &row.entity.meta, &key) {
                    Ok(plaintext) => match String::from_utf8(plaintext) {
                        Ok(text) => MessageBody::Text(text),
                        Err(_) => MessageBody::Unreadable,
                    },
                    Err(_) => MessageBody::Unreadable,
                };

                if let MessageBody::Text(text) = &body {
                    if let Err(e) = orchestrator.set_conversation_preview(
                        &conversation_id,
                        preview_of(text),
                        row.entity.created_at,
                    ) {
                        warn!(error = %e, "Failed to update conversation preview");
                    }
                }

                let display = DisplayMessage::from_row(&row, body, user_id.as_str());
                if tx.send(display).await.is_err() {
                    break;
                }
            }
        });
        self.tasks.lock().push(handle);

        rx
    }

    /// Abort the messenger's spawned tasks. Called on logout.
    pub fn shutdown(&self) {
        for handle in self.tasks.lock().drain(..) {
            handle.abort();
        }
    }
}

impl Drop for Messenger {
    fn drop(&mut self) {
        for handle in self.tasks.lock().drain(..) {
            handle.abort();
        }
    }
}

/// Truncate plaintext to the preview budget on a char boundary.
fn preview_of(plaintext: &str) -> String {
    plaintext.chars().take(PREVIEW_MAX_CHARS).collect()
}
