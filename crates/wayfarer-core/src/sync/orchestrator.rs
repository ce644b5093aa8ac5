//! The sync orchestrator: single writer for the local store

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde_json::{json, Value};
use tokio::sync::{broadcast, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::events::{CollectionStatus, SyncEvent};
use crate::error::{SyncError, SyncResult};
use crate::outbox::{DrainExecutor, Outbox, PendingMutation};
use crate::remote::{
    parse_result, ConnectivityMonitor, ConnectivityState, ConversationRecord, MessagePage,
    MessageRecord, RemoteEvent, RemoteService,
};
use crate::store::{collections, LocalStore, QueryOrder};
use crate::types::{CachedRow, ConversationId, Message, MessageId, Trip};

/// Default capacity for the event broadcast channel
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Bound on every remote call; past this the call is treated as transient
const REMOTE_TIMEOUT: Duration = Duration::from_secs(30);

/// Initial drain retry delay after a stalled pass
const BASE_BACKOFF: Duration = Duration::from_secs(1);

/// Cap on the drain retry delay
const MAX_BACKOFF: Duration = Duration::from_secs(60);

/// Per-collection fetch state
#[derive(Default)]
struct CollectionState {
    status: CollectionStatus,
    /// Incremented per fetch; a superseded fetch must not advance the
    /// watermark past a newer one
    generation: u64,
}

/// Outcome of merging a canonical message into the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeOutcome {
    /// New canonical row inserted
    Inserted,
    /// The device's own optimistic row was retired in favor of the
    /// canonical one (pending row id inside)
    RetiredPending(String),
    /// A canonical row with this id already existed; nothing changed
    Duplicate,
}

/// One applied history page: which message ids landed and where the next
/// (older) page starts.
#[derive(Debug, Clone)]
pub struct FetchedPage {
    /// Server ids of the records applied from this page
    pub message_ids: Vec<String>,
    /// Cursor for the next page, if more history exists
    pub next_cursor: Option<String>,
}

/// Coordination point between the local store, the remote service, the
/// outbox, and the live event stream.
///
/// Constructed once per session with explicit collaborators; [`shutdown`]
/// tears down the spawned tasks on logout.
///
/// [`shutdown`]: SyncOrchestrator::shutdown
pub struct SyncOrchestrator {
    store: LocalStore,
    remote: Arc<dyn RemoteService>,
    outbox: Outbox,
    event_tx: broadcast::Sender<SyncEvent>,
    collections: RwLock<HashMap<String, CollectionState>>,
    /// Wakes the drain loop after an enqueue so stalled-while-online
    /// entries retry without waiting for a connectivity transition
    drain_nudge: Arc<Notify>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl SyncOrchestrator {
    /// Create an orchestrator over the given store and remote service.
    pub fn new(store: LocalStore, remote: Arc<dyn RemoteService>) -> Arc<Self> {
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let outbox = Outbox::new(store.clone());
        Arc::new(Self {
            store,
            remote,
            outbox,
            event_tx,
            collections: RwLock::new(HashMap::new()),
            drain_nudge: Arc::new(Notify::new()),
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Subscribe to sync events.
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.event_tx.subscribe()
    }

    /// The local store (read access for the façade).
    pub fn store(&self) -> &LocalStore {
        &self.store
    }

    /// The outbox (introspection; draining runs through the loop task).
    pub fn outbox(&self) -> &Outbox {
        &self.outbox
    }

    /// Current fetch status for a collection.
    pub fn status(&self, collection: &str) -> CollectionStatus {
        self.collections
            .read()
            .get(collection)
            .map(|s| s.status)
            .unwrap_or_default()
    }

    fn begin_fetch(&self, collection: &str) -> u64 {
        let mut map = self.collections.write();
        let state = map.entry(collection.to_string()).or_default();
        state.generation += 1;
        state.status = CollectionStatus::Fetching;
        state.generation
    }

    /// Update a collection's status, unless a newer fetch owns it now.
    fn set_status_if_current(&self, collection: &str, generation: u64, status: CollectionStatus) {
        let mut map = self.collections.write();
        let state = map.entry(collection.to_string()).or_default();
        if state.generation == generation {
            state.status = status;
        }
    }

    fn is_current(&self, collection: &str, generation: u64) -> bool {
        self.collections
            .read()
            .get(collection)
            .map(|s| s.generation == generation)
            .unwrap_or(false)
    }

    /// Execute a remote operation under the bounded timeout.
    async fn execute_remote(&self, operation: &str, variables: Value) -> SyncResult<Value> {
        match tokio::time::timeout(REMOTE_TIMEOUT, self.remote.execute(operation, variables)).await
        {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Err(SyncError::Timeout(format!(
                "{} exceeded {}s",
                operation,
                REMOTE_TIMEOUT.as_secs()
            ))),
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Fetch and merge
    // ═══════════════════════════════════════════════════════════════════════

    /// Fetch the conversation list and merge it into the store.
    ///
    /// Cached rows are never cleared on failure; a fetch error emits
    /// [`SyncEvent::StaleData`] and propagates. Returns rows applied.
    pub async fn fetch_conversations(&self) -> SyncResult<usize> {
        let name = collections::CONVERSATIONS.name;
        let generation = self.begin_fetch(name);
        let result = self.fetch_conversations_inner(name, generation).await;
        if let Err(e) = &result {
            self.set_status_if_current(name, generation, CollectionStatus::Idle);
            let _ = self.event_tx.send(SyncEvent::StaleData {
                collection: name.to_string(),
                message: e.to_string(),
            });
        }
        result
    }

    async fn fetch_conversations_inner(&self, name: &str, generation: u64) -> SyncResult<usize> {
        let since = self.store.watermark(name)?;
        let value = self
            .execute_remote("listConversations", json!({ "since": since }))
            .await?;

        self.set_status_if_current(name, generation, CollectionStatus::Merging);
        let records: Vec<ConversationRecord> = parse_result(value)?;

        let mut applied = 0;
        let mut watermark: Option<i64> = None;
        for record in records {
            watermark = watermark.max(Some(record.synced_at));
            let synced_at = record.synced_at;
            // The preview is a local plaintext cache; keep it across merges
            let preview = self
                .store
                .get(&collections::CONVERSATIONS, &record.id)?
                .and_then(|r| r.entity.last_message_preview);
            let (conversation, members) = record.into_rows(preview);
            let conversation_id = conversation.entity.id.clone();
            applied += self
                .store
                .merge_canonical(&collections::CONVERSATIONS, &[conversation])?;
            // The membership list is server-authoritative; absent rows go
            self.store
                .reconcile_members(&conversation_id, synced_at, &members)?;
        }

        if let Some(ts) = watermark {
            if self.is_current(name, generation) {
                self.store.set_watermark(name, ts)?;
            } else {
                debug!(collection = name, "Superseded fetch; watermark not advanced");
            }
        }

        self.set_status_if_current(name, generation, CollectionStatus::Idle);
        let _ = self.event_tx.send(SyncEvent::CollectionRefreshed {
            collection: name.to_string(),
            applied,
        });
        Ok(applied)
    }

    /// Fetch the trip list and merge it into the store.
    pub async fn fetch_trips(&self) -> SyncResult<usize> {
        let name = collections::TRIPS.name;
        let generation = self.begin_fetch(name);
        let result = self.fetch_trips_inner(name, generation).await;
        if let Err(e) = &result {
            self.set_status_if_current(name, generation, CollectionStatus::Idle);
            let _ = self.event_tx.send(SyncEvent::StaleData {
                collection: name.to_string(),
                message: e.to_string(),
            });
        }
        result
    }

    async fn fetch_trips_inner(&self, name: &str, generation: u64) -> SyncResult<usize> {
        let since = self.store.watermark(name)?;
        let value = self
            .execute_remote("listTrips", json!({ "since": since }))
            .await?;

        self.set_status_if_current(name, generation, CollectionStatus::Merging);
        let trips: Vec<Trip> = parse_result(value)?;
        let fetched_at = crate::types::now_millis();
        let rows: Vec<CachedRow<Trip>> = trips
            .into_iter()
            .map(|t| CachedRow::canonical(t, fetched_at))
            .collect();
        let applied = self.store.merge_canonical(&collections::TRIPS, &rows)?;

        if self.is_current(name, generation) {
            self.store.set_watermark(name, fetched_at)?;
        }

        self.set_status_if_current(name, generation, CollectionStatus::Idle);
        let _ = self.event_tx.send(SyncEvent::CollectionRefreshed {
            collection: name.to_string(),
            applied,
        });
        Ok(applied)
    }

    /// Fetch one page of message history for a conversation and persist it.
    ///
    /// Returns the applied record ids plus the cursor for the next (older)
    /// page, so callers can render exactly the fetched page.
    pub async fn fetch_message_page(
        &self,
        conversation_id: &ConversationId,
        cursor: Option<&str>,
        limit: usize,
    ) -> SyncResult<FetchedPage> {
        let value = self
            .execute_remote(
                "messageHistory",
                json!({
                    "conversationId": conversation_id.as_str(),
                    "cursor": cursor,
                    "limit": limit,
                }),
            )
            .await
            .map_err(|e| {
                let _ = self.event_tx.send(SyncEvent::StaleData {
                    collection: collections::MESSAGES.name.to_string(),
                    message: e.to_string(),
                });
                e
            })?;

        let page: MessagePage = parse_result(value)?;
        let mut message_ids = Vec::with_capacity(page.records.len());
        for record in page.records {
            message_ids.push(record.id.clone());
            self.apply_canonical_message(record)?;
        }
        Ok(FetchedPage {
            message_ids,
            next_cursor: page.next_cursor,
        })
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Optimistic writes
    // ═══════════════════════════════════════════════════════════════════════

    /// Write an optimistic pending message row before the network call
    /// starts, so the UI reflects the send instantly.
    pub fn apply_optimistic_message(
        &self,
        row: CachedRow<Message>,
        preview: Option<String>,
    ) -> SyncResult<()> {
        let conversation_id = row.entity.conversation_id.clone();
        let message_id = row.entity.id.clone();
        let created_at = row.entity.created_at;

        self.store.upsert(&collections::MESSAGES, &[row])?;
        self.touch_conversation(&conversation_id, created_at, preview)?;

        let _ = self.event_tx.send(SyncEvent::MessagePending {
            conversation_id: conversation_id.as_str().to_string(),
            message_id: message_id.as_str().to_string(),
        });
        Ok(())
    }

    /// Attempt the remote send for a pending message.
    ///
    /// On success the pending row is replaced by the canonical row and the
    /// server-assigned id is returned. On a transient failure the pending
    /// row stays visible ("sending") and the operation is enqueued for
    /// replay; the client id is returned. On a permanent failure the
    /// pending row is deleted and the error propagates.
    pub async fn send_pending_message(&self, pending: &Message) -> SyncResult<MessageId> {
        let variables = Self::send_message_variables(pending)?;

        match self.execute_remote("sendMessage", variables.clone()).await {
            Ok(value) => {
                let record: MessageRecord = parse_result(value)?;
                let message_id = record.id.clone();
                self.reconcile_confirmed_send(pending.id.as_str(), record)?;
                let _ = self.event_tx.send(SyncEvent::MessageConfirmed {
                    conversation_id: pending.conversation_id.as_str().to_string(),
                    message_id: message_id.clone(),
                });
                Ok(MessageId::from_string(message_id))
            }
            Err(e) if e.is_transient() => {
                info!(
                    message_id = %pending.id,
                    error = %e,
                    "Send failed transiently; queued for replay"
                );
                self.outbox.enqueue(&PendingMutation::with_client_id(
                    pending.id.as_str(),
                    "sendMessage",
                    variables,
                    Some(pending.conversation_id.clone()),
                ))?;
                self.drain_nudge.notify_one();
                Ok(pending.id.clone())
            }
            Err(e) => {
                warn!(message_id = %pending.id, error = %e, "Send failed permanently");
                self.store
                    .delete(&collections::MESSAGES, pending.id.as_str())?;
                Err(e)
            }
        }
    }

    fn send_message_variables(pending: &Message) -> SyncResult<Value> {
        let meta = serde_json::to_value(&pending.meta)
            .map_err(|e| SyncError::Serialization(e.to_string()))?;
        Ok(json!({
            "conversationId": pending.conversation_id.as_str(),
            "clientId": pending.id.as_str(),
            "clientSeq": pending.local_seq,
            "senderUserId": pending.sender_user_id.as_str(),
            "senderDeviceId": pending.sender_device_id.as_str(),
            "ciphertext": pending.ciphertext,
            "meta": meta,
            "kind": pending.kind,
        }))
    }

    /// Replace the optimistic row with the server-confirmed one,
    /// delete-then-insert in one transaction.
    fn reconcile_confirmed_send(&self, client_id: &str, record: MessageRecord) -> SyncResult<()> {
        let row = record.into_row();
        let conversation_id = row.entity.conversation_id.clone();
        let created_at = row.entity.created_at;
        self.store
            .replace_pending_with_canonical(&collections::MESSAGES, client_id, &row)?;
        self.touch_conversation(&conversation_id, created_at, None)?;
        Ok(())
    }

    /// Update a conversation's last-message timestamp and optional preview.
    fn touch_conversation(
        &self,
        conversation_id: &ConversationId,
        message_at: i64,
        preview: Option<String>,
    ) -> SyncResult<()> {
        let Some(mut row) = self
            .store
            .get(&collections::CONVERSATIONS, conversation_id.as_str())?
        else {
            return Ok(());
        };
        if row.entity.last_message_at.map_or(true, |t| t < message_at) {
            row.entity.last_message_at = Some(message_at);
            if preview.is_some() {
                row.entity.last_message_preview = preview;
            }
            self.store.upsert(&collections::CONVERSATIONS, &[row])?;
        } else if let Some(preview) = preview {
            row.entity.last_message_preview = Some(preview);
            self.store.upsert(&collections::CONVERSATIONS, &[row])?;
        }
        Ok(())
    }

    /// Set a conversation's plaintext preview after the façade decrypted a
    /// message body. Writes stay behind the orchestrator.
    pub fn set_conversation_preview(
        &self,
        conversation_id: &ConversationId,
        preview: String,
        message_at: i64,
    ) -> SyncResult<()> {
        self.touch_conversation(conversation_id, message_at, Some(preview))
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Live-event merge
    // ═══════════════════════════════════════════════════════════════════════

    /// Merge a server-confirmed message into the store.
    ///
    /// Dedup rules:
    /// - a canonical row with the same id already exists: no-op
    /// - a pending row from the same device, conversation, and local
    ///   sequence exists (the device's own echo under a new id): the
    ///   pending row is retired delete-then-insert
    /// - otherwise the row is inserted as new
    pub fn apply_canonical_message(&self, record: MessageRecord) -> SyncResult<MergeOutcome> {
        let row = record.into_row();
        let id = row.entity.id.as_str().to_string();

        if let Some(existing) = self.store.get(&collections::MESSAGES, &id)? {
            if !existing.pending {
                return Ok(MergeOutcome::Duplicate);
            }
        }

        // Own-echo recognition: match by (device, conversation, local_seq),
        // not by id, because the echo carries the server-assigned id.
        let echo = self
            .store
            .query(
                &collections::MESSAGES,
                |r| {
                    r.pending
                        && r.entity.conversation_id == row.entity.conversation_id
                        && r.entity.sender_device_id == row.entity.sender_device_id
                        && r.entity.local_seq == row.entity.local_seq
                },
                QueryOrder::Unordered,
                Some(1),
            )?
            .into_iter()
            .next();

        let conversation_id = row.entity.conversation_id.clone();
        let created_at = row.entity.created_at;

        let outcome = if let Some(pending) = echo {
            let pending_id = pending.entity.id.as_str().to_string();
            self.store
                .replace_pending_with_canonical(&collections::MESSAGES, &pending_id, &row)?;
            MergeOutcome::RetiredPending(pending_id)
        } else {
            match self.store.insert_canonical(&collections::MESSAGES, &row) {
                Ok(()) => MergeOutcome::Inserted,
                Err(e) if e.is_conflict() => return Ok(MergeOutcome::Duplicate),
                Err(e) => return Err(e),
            }
        };

        self.touch_conversation(&conversation_id, created_at, None)?;
        Ok(outcome)
    }

    fn handle_remote_event(&self, event: RemoteEvent) -> SyncResult<()> {
        match event {
            RemoteEvent::MessageAdded {
                conversation_id,
                message,
            } => {
                let message_id = message.id.clone();
                let outcome = self.apply_canonical_message(message)?;
                if outcome != MergeOutcome::Duplicate {
                    let _ = self.event_tx.send(SyncEvent::MessageArrived {
                        conversation_id,
                        message_id,
                    });
                }
            }
            RemoteEvent::ConversationUpdated { conversation } => {
                let preview = self
                    .store
                    .get(&collections::CONVERSATIONS, &conversation.id)?
                    .and_then(|r| r.entity.last_message_preview);
                let id = conversation.id.clone();
                let synced_at = conversation.synced_at;
                let (row, members) = conversation.into_rows(preview);
                let conversation_id = row.entity.id.clone();
                self.store
                    .merge_canonical(&collections::CONVERSATIONS, &[row])?;
                self.store
                    .reconcile_members(&conversation_id, synced_at, &members)?;
                let _ = self.event_tx.send(SyncEvent::ConversationUpdated {
                    conversation_id: id,
                });
            }
        }
        Ok(())
    }

    /// Spawn the task that owns the live subscription stream and merges
    /// its events into the store.
    pub async fn start_live_events(
        self: &Arc<Self>,
        topic: &str,
        variables: Value,
    ) -> SyncResult<()> {
        let mut rx = self
            .remote
            .subscribe(topic, variables)
            .await
            .map_err(SyncError::from)?;
        info!(topic, "Live event stream started");

        let orchestrator = self.clone();
        let topic = topic.to_string();
        let handle = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if let Err(e) = orchestrator.handle_remote_event(event) {
                    warn!(topic = %topic, error = %e, "Failed to merge live event");
                }
            }
            debug!(topic = %topic, "Live event stream closed");
        });
        self.tasks.lock().push(handle);
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Outbox draining
    // ═══════════════════════════════════════════════════════════════════════

    /// Drain the outbox once, replaying entries through the remote service.
    pub async fn drain_outbox(&self) -> SyncResult<()> {
        let report = self.outbox.drain(self).await?;
        if report.completed > 0 || report.stalled > 0 || !report.abandoned.is_empty() {
            info!(
                completed = report.completed,
                abandoned = report.abandoned.len(),
                stalled = report.stalled,
                "Outbox drain pass finished"
            );
        }
        let _ = self.event_tx.send(SyncEvent::OutboxDrained {
            completed: report.completed,
            abandoned: report.abandoned.len(),
            stalled: report.stalled,
        });
        Ok(())
    }

    /// Spawn the drain loop: drains whenever the device comes online,
    /// retries stalled passes with capped exponential backoff, and resets
    /// the backoff on any fresh connectivity signal.
    pub fn start_drain_loop(self: &Arc<Self>, monitor: &ConnectivityMonitor) {
        let mut rx = monitor.watch();
        let orchestrator = self.clone();
        let nudge = self.drain_nudge.clone();

        let handle = tokio::spawn(async move {
            let mut backoff = BASE_BACKOFF;
            loop {
                // Wait until online
                while *rx.borrow_and_update() != ConnectivityState::Online {
                    if rx.changed().await.is_err() {
                        return;
                    }
                }

                let stalled = match orchestrator.outbox.len() {
                    Ok(0) => false,
                    Ok(_) => match orchestrator.drain_outbox().await {
                        Ok(()) => orchestrator
                            .outbox
                            .len()
                            .map(|n| n > 0)
                            .unwrap_or(false),
                        Err(e) => {
                            warn!(error = %e, "Outbox drain failed");
                            true
                        }
                    },
                    Err(e) => {
                        warn!(error = %e, "Outbox unavailable");
                        true
                    }
                };

                if stalled {
                    let wait = backoff;
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                    tokio::select! {
                        _ = tokio::time::sleep(wait) => {}
                        changed = rx.changed() => {
                            if changed.is_err() {
                                return;
                            }
                            // Fresh connectivity signal resets the backoff
                            backoff = BASE_BACKOFF;
                        }
                    }
                } else {
                    backoff = BASE_BACKOFF;
                    tokio::select! {
                        changed = rx.changed() => {
                            if changed.is_err() {
                                return;
                            }
                        }
                        _ = nudge.notified() => {}
                    }
                }
            }
        });
        self.tasks.lock().push(handle);
    }

    /// Abort the spawned tasks. Called on logout/teardown.
    pub fn shutdown(&self) {
        info!("Shutting down sync orchestrator");
        for handle in self.tasks.lock().drain(..) {
            handle.abort();
        }
    }
}

#[async_trait]
impl DrainExecutor for SyncOrchestrator {
    async fn execute(&self, entry: &PendingMutation) -> SyncResult<()> {
        let value = self
            .execute_remote(&entry.operation_name, entry.variables.clone())
            .await?;

        // Reconcile store state for operations we understand; anything else
        // is fire-and-forget.
        if entry.operation_name == "sendMessage" {
            let record: MessageRecord = parse_result(value)?;
            let conversation_id = record.conversation_id.clone();
            let message_id = record.id.clone();
            self.reconcile_confirmed_send(&entry.client_id, record)?;
            let _ = self.event_tx.send(SyncEvent::MessageConfirmed {
                conversation_id,
                message_id,
            });
        }
        Ok(())
    }
}

impl Drop for SyncOrchestrator {
    fn drop(&mut self) {
        for handle in self.tasks.lock().drain(..) {
            handle.abort();
        }
    }
}
