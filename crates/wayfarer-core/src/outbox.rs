//! Durable queue of not-yet-confirmed write operations
//!
//! A write that fails on a transient error lands here and is replayed once
//! connectivity returns. Entries carry a stable client id so the remote
//! service can detect a replay of a write it already applied and no-op.
//!
//! Ordering: entries targeting the same conversation replay strictly in
//! enqueue order; entries for different conversations drain concurrently
//! (one lane per conversation).

use async_trait::async_trait;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};
use ulid::Ulid;

use crate::error::{SyncError, SyncResult};
use crate::store::LocalStore;
use crate::types::{now_millis, ConversationId};

/// A queued write operation with everything needed to replay it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingMutation {
    /// Client-generated id, supplied unchanged on every replay of this
    /// logical write so the remote service can deduplicate.
    pub client_id: String,
    /// Remote operation to invoke on replay
    pub operation_name: String,
    /// Operation inputs
    pub variables: Value,
    /// Conversation this operation targets, if any. Determines the replay
    /// ordering lane.
    pub conversation_id: Option<ConversationId>,
    /// Enqueue timestamp (millis)
    pub queued_at: i64,
}

impl PendingMutation {
    /// Create an entry with a fresh client id.
    pub fn new(
        operation_name: impl Into<String>,
        variables: Value,
        conversation_id: Option<ConversationId>,
    ) -> Self {
        Self::with_client_id(
            Ulid::new().to_string(),
            operation_name,
            variables,
            conversation_id,
        )
    }

    /// Create an entry reusing an existing client id (e.g. the optimistic
    /// row's id, so the replayed write matches the original attempt).
    pub fn with_client_id(
        client_id: impl Into<String>,
        operation_name: impl Into<String>,
        variables: Value,
        conversation_id: Option<ConversationId>,
    ) -> Self {
        Self {
            client_id: client_id.into(),
            operation_name: operation_name.into(),
            variables,
            conversation_id,
            queued_at: now_millis(),
        }
    }
}

/// Executes one outbox entry against the remote service.
///
/// Implemented by the orchestrator: performs the remote call and reconciles
/// the local store with the confirmed result.
#[async_trait]
pub trait DrainExecutor: Send + Sync {
    /// Replay a single entry. A [`SyncError::Conflict`] return means the
    /// write was already applied and counts as success.
    async fn execute(&self, entry: &PendingMutation) -> SyncResult<()>;
}

/// Outcome of one drain pass.
#[derive(Debug, Default)]
pub struct DrainReport {
    /// Entries confirmed (including already-applied conflicts) and removed
    pub completed: usize,
    /// Entries dropped with a permanent error, surfaced here
    pub abandoned: Vec<(String, SyncError)>,
    /// Entries left queued because their lane hit a transient error
    pub stalled: usize,
}

impl DrainReport {
    /// Whether another drain attempt should be scheduled (with backoff).
    pub fn has_stalled(&self) -> bool {
        self.stalled > 0
    }
}

/// Durable, ordered pending-mutation queue over the local store.
#[derive(Clone)]
pub struct Outbox {
    store: LocalStore,
}

impl Outbox {
    /// Create an outbox over the given store.
    pub fn new(store: LocalStore) -> Self {
        Self { store }
    }

    /// Durably append an entry. Returns its FIFO sequence number.
    pub fn enqueue(&self, entry: &PendingMutation) -> SyncResult<u64> {
        let seq = self.store.append_outbox(entry)?;
        debug!(
            client_id = %entry.client_id,
            operation = %entry.operation_name,
            seq,
            "Enqueued pending mutation"
        );
        Ok(seq)
    }

    /// All queued entries in enqueue order, without consuming them.
    pub fn peek_all(&self) -> SyncResult<Vec<PendingMutation>> {
        Ok(self
            .store
            .outbox_entries()?
            .into_iter()
            .map(|(_, e)| e)
            .collect())
    }

    /// Number of queued entries.
    pub fn len(&self) -> SyncResult<usize> {
        self.store.outbox_len()
    }

    /// Whether the queue is empty.
    pub fn is_empty(&self) -> SyncResult<bool> {
        Ok(self.len()? == 0)
    }

    /// Replay queued entries through the executor.
    ///
    /// Entries are partitioned into per-conversation lanes (entries with no
    /// conversation share one lane) and the lanes drain concurrently. Within
    /// a lane, entries replay strictly in enqueue order; a transient error
    /// stops that lane, leaving its remaining entries queued for the next
    /// trigger. A permanent error removes the entry and surfaces it in the
    /// report.
    pub async fn drain(&self, executor: &dyn DrainExecutor) -> SyncResult<DrainReport> {
        let entries = self.store.outbox_entries()?;
        if entries.is_empty() {
            return Ok(DrainReport::default());
        }

        // Partition into lanes, preserving enqueue order within each
        let mut lanes: Vec<(Option<ConversationId>, Vec<(u64, PendingMutation)>)> = Vec::new();
        for (seq, entry) in entries {
            let key = entry.conversation_id.clone();
            match lanes.iter_mut().find(|(k, _)| *k == key) {
                Some((_, lane)) => lane.push((seq, entry)),
                None => lanes.push((key, vec![(seq, entry)])),
            }
        }

        let reports = join_all(
            lanes
                .into_iter()
                .map(|(_, lane)| self.drain_lane(lane, executor)),
        )
        .await;

        let mut merged = DrainReport::default();
        for report in reports {
            let report = report?;
            merged.completed += report.completed;
            merged.stalled += report.stalled;
            merged.abandoned.extend(report.abandoned);
        }
        Ok(merged)
    }

    async fn drain_lane(
        &self,
        lane: Vec<(u64, PendingMutation)>,
        executor: &dyn DrainExecutor,
    ) -> SyncResult<DrainReport> {
        let mut report = DrainReport::default();
        let total = lane.len();

        for (index, (seq, entry)) in lane.into_iter().enumerate() {
            match executor.execute(&entry).await {
                Ok(()) => {
                    self.store.remove_outbox(seq)?;
                    report.completed += 1;
                }
                Err(e) if e.is_conflict() => {
                    // Reply was lost after the server applied the write
                    debug!(client_id = %entry.client_id, "Replay already applied");
                    self.store.remove_outbox(seq)?;
                    report.completed += 1;
                }
                Err(e) if e.is_transient() => {
                    debug!(
                        client_id = %entry.client_id,
                        error = %e,
                        "Transient failure, lane stalled"
                    );
                    report.stalled += total - index;
                    break;
                }
                Err(e) => {
                    warn!(
                        client_id = %entry.client_id,
                        operation = %entry.operation_name,
                        error = %e,
                        "Abandoning pending mutation"
                    );
                    self.store.remove_outbox(seq)?;
                    report.abandoned.push((entry.client_id, e));
                }
            }
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn create_test_outbox() -> (Outbox, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let store = LocalStore::new(temp_dir.path().join("test.redb")).unwrap();
        (Outbox::new(store), temp_dir)
    }

    /// Scripted executor: records executed client ids, fails according to
    /// a per-client-id script.
    #[derive(Default)]
    struct ScriptedExecutor {
        executed: Mutex<Vec<String>>,
        failures: Mutex<HashMap<String, SyncError>>,
    }

    impl ScriptedExecutor {
        fn fail_with(&self, client_id: &str, err: SyncError) {
            self.failures.lock().insert(client_id.to_string(), err);
        }

        fn executed(&self) -> Vec<String> {
            self.executed.lock().clone()
        }
    }

    #[async_trait]
    impl DrainExecutor for ScriptedExecutor {
        async fn execute(&self, entry: &PendingMutation) -> SyncResult<()> {
            self.executed.lock().push(entry.client_id.clone());
            if let Some(err) = self.failures.lock().remove(&entry.client_id) {
                return Err(err);
            }
            Ok(())
        }
    }

    fn entry(client_id: &str, conversation: Option<&str>) -> PendingMutation {
        PendingMutation::with_client_id(
            client_id,
            "sendMessage",
            json!({ "clientId": client_id }),
            conversation.map(ConversationId::from_string),
        )
    }

    #[tokio::test]
    async fn test_drain_empty_outbox() {
        let (outbox, _temp) = create_test_outbox();
        let executor = ScriptedExecutor::default();
        let report = outbox.drain(&executor).await.unwrap();
        assert_eq!(report.completed, 0);
        assert!(!report.has_stalled());
    }

    #[tokio::test]
    async fn test_drain_preserves_enqueue_order_per_conversation() {
        let (outbox, _temp) = create_test_outbox();
        outbox.enqueue(&entry("a", Some("c1"))).unwrap();
        outbox.enqueue(&entry("b", Some("c1"))).unwrap();
        outbox.enqueue(&entry("c", Some("c1"))).unwrap();

        let executor = ScriptedExecutor::default();
        let report = outbox.drain(&executor).await.unwrap();

        assert_eq!(report.completed, 3);
        assert_eq!(executor.executed(), vec!["a", "b", "c"]);
        assert!(outbox.is_empty().unwrap());
    }

    #[tokio::test]
    async fn test_transient_failure_stalls_lane_only() {
        let (outbox, _temp) = create_test_outbox();
        outbox.enqueue(&entry("a1", Some("c1"))).unwrap();
        outbox.enqueue(&entry("a2", Some("c1"))).unwrap();
        outbox.enqueue(&entry("b1", Some("c2"))).unwrap();

        let executor = ScriptedExecutor::default();
        executor.fail_with("a1", SyncError::NetworkUnavailable("down".into()));

        let report = outbox.drain(&executor).await.unwrap();

        // c1 lane stalled at a1 (a2 never attempted), c2 lane completed
        assert_eq!(report.completed, 1);
        assert_eq!(report.stalled, 2);
        let executed = executor.executed();
        assert!(executed.contains(&"a1".to_string()));
        assert!(!executed.contains(&"a2".to_string()));
        assert!(executed.contains(&"b1".to_string()));

        let remaining = outbox.peek_all().unwrap();
        let ids: Vec<&str> = remaining.iter().map(|e| e.client_id.as_str()).collect();
        assert_eq!(ids, vec!["a1", "a2"]);
    }

    #[tokio::test]
    async fn test_permanent_failure_abandons_entry_and_continues() {
        let (outbox, _temp) = create_test_outbox();
        outbox.enqueue(&entry("a", Some("c1"))).unwrap();
        outbox.enqueue(&entry("b", Some("c1"))).unwrap();

        let executor = ScriptedExecutor::default();
        executor.fail_with("a", SyncError::RemoteValidation("too long".into()));

        let report = outbox.drain(&executor).await.unwrap();

        assert_eq!(report.completed, 1);
        assert_eq!(report.abandoned.len(), 1);
        assert_eq!(report.abandoned[0].0, "a");
        assert!(outbox.is_empty().unwrap());
    }

    #[tokio::test]
    async fn test_conflict_counts_as_completed() {
        let (outbox, _temp) = create_test_outbox();
        outbox.enqueue(&entry("a", Some("c1"))).unwrap();

        let executor = ScriptedExecutor::default();
        executor.fail_with("a", SyncError::Conflict("already applied".into()));

        let report = outbox.drain(&executor).await.unwrap();
        assert_eq!(report.completed, 1);
        assert!(report.abandoned.is_empty());
        assert!(outbox.is_empty().unwrap());
    }

    #[tokio::test]
    async fn test_client_id_stable_across_replays() {
        let (outbox, _temp) = create_test_outbox();
        outbox.enqueue(&entry("stable-id", Some("c1"))).unwrap();

        let executor = ScriptedExecutor::default();
        executor.fail_with("stable-id", SyncError::Timeout("slow".into()));
        outbox.drain(&executor).await.unwrap();

        // Second drain replays the same entry with the same client id
        let report = outbox.drain(&executor).await.unwrap();
        assert_eq!(report.completed, 1);
        assert_eq!(executor.executed(), vec!["stable-id", "stable-id"]);
    }

    #[tokio::test]
    async fn test_entries_without_conversation_share_a_lane() {
        let (outbox, _temp) = create_test_outbox();
        outbox.enqueue(&entry("x1", None)).unwrap();
        outbox.enqueue(&entry("x2", None)).unwrap();

        let executor = ScriptedExecutor::default();
        executor.fail_with("x1", SyncError::NetworkUnavailable("down".into()));

        let report = outbox.drain(&executor).await.unwrap();
        assert_eq!(report.stalled, 2);
        assert_eq!(executor.executed(), vec!["x1"]);
    }

    #[test]
    fn test_peek_does_not_consume() {
        let (outbox, _temp) = create_test_outbox();
        outbox.enqueue(&entry("a", None)).unwrap();
        assert_eq!(outbox.peek_all().unwrap().len(), 1);
        assert_eq!(outbox.peek_all().unwrap().len(), 1);
    }
}
