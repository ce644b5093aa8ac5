//! Local mirror store using redb
//!
//! Holds cached mirrors of remote entities (conversations, messages, trips,
//! users, ...) plus sync bookkeeping: the outbox of pending mutations and
//! per-collection watermarks. Every row is a [`CachedRow`] serialized with
//! serde_json.
//!
//! Guarantees:
//! - writes within one call are atomic (single redb write transaction)
//! - reads never observe a half-applied upsert
//! - a canonical write over an existing canonical row with the same id
//!   signals [`SyncError::Conflict`], which callers treat as already-applied
//!
//! No retries happen here; retry policy lives in the orchestrator/outbox.

use parking_lot::RwLock;
use redb::{Database, ReadableTable, TableDefinition};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::marker::PhantomData;
use std::path::Path;
use std::sync::Arc;

use crate::error::{SyncError, SyncResult};
use crate::outbox::PendingMutation;
use crate::types::{
    CachedRow, Conversation, ConversationId, ConversationMember, Message, Place, Trip, User,
};

// Table definitions
const CONVERSATIONS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("conversations");
const MEMBERS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("conversation_members");
const MESSAGES_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("messages");
const TRIPS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("trips");
const PLACES_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("places");
const USERS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("users");
const OUTBOX_TABLE: TableDefinition<u64, &[u8]> = TableDefinition::new("outbox");
const SYNC_META_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("sync_meta");

/// An entity that can live in a store collection.
pub trait Entity: Serialize + DeserializeOwned + Clone {
    /// Stable row key within the collection.
    fn entity_id(&self) -> String;
}

impl Entity for Conversation {
    fn entity_id(&self) -> String {
        self.id.as_str().to_string()
    }
}

impl Entity for ConversationMember {
    fn entity_id(&self) -> String {
        self.row_id()
    }
}

impl Entity for Message {
    fn entity_id(&self) -> String {
        self.id.as_str().to_string()
    }
}

impl Entity for Trip {
    fn entity_id(&self) -> String {
        self.id.as_str().to_string()
    }
}

impl Entity for Place {
    fn entity_id(&self) -> String {
        self.id.clone()
    }
}

impl Entity for User {
    fn entity_id(&self) -> String {
        self.id.as_str().to_string()
    }
}

/// Typed descriptor for a store collection.
pub struct Collection<T: Entity> {
    /// Table name in the database
    pub name: &'static str,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Entity> Collection<T> {
    const fn new(name: &'static str) -> Self {
        Self {
            name,
            _marker: PhantomData,
        }
    }

    fn table(&self) -> TableDefinition<'static, &'static str, &'static [u8]> {
        TableDefinition::new(self.name)
    }
}

/// The fixed set of mirrored collections.
pub mod collections {
    use super::*;

    /// Conversations collection
    pub const CONVERSATIONS: Collection<Conversation> = Collection::new("conversations");
    /// Conversation membership collection (owned by conversations)
    pub const MEMBERS: Collection<ConversationMember> = Collection::new("conversation_members");
    /// Messages collection
    pub const MESSAGES: Collection<Message> = Collection::new("messages");
    /// Trips collection
    pub const TRIPS: Collection<Trip> = Collection::new("trips");
    /// Places collection
    pub const PLACES: Collection<Place> = Collection::new("places");
    /// Users collection
    pub const USERS: Collection<User> = Collection::new("users");
}

/// Row ordering for [`LocalStore::query`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryOrder {
    /// Table iteration order (row key order)
    Unordered,
    /// Oldest local write first
    CachedAtAsc,
    /// Newest local write first
    CachedAtDesc,
}

/// Local mirror store backed by a single redb database.
///
/// Cloning is cheap; all clones share the database handle. Mutation goes
/// through the sync orchestrator only (single-writer discipline).
#[derive(Clone)]
pub struct LocalStore {
    db: Arc<RwLock<Database>>,
}

impl LocalStore {
    /// Open (or create) the store at the given path.
    pub fn new(path: impl AsRef<Path>) -> SyncResult<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let db = Database::create(path)?;

        // Initialize all tables
        let write_txn = db.begin_write()?;
        {
            let _ = write_txn.open_table(CONVERSATIONS_TABLE)?;
            let _ = write_txn.open_table(MEMBERS_TABLE)?;
            let _ = write_txn.open_table(MESSAGES_TABLE)?;
            let _ = write_txn.open_table(TRIPS_TABLE)?;
            let _ = write_txn.open_table(PLACES_TABLE)?;
            let _ = write_txn.open_table(USERS_TABLE)?;
            let _ = write_txn.open_table(OUTBOX_TABLE)?;
            let _ = write_txn.open_table(SYNC_META_TABLE)?;
        }
        write_txn.commit()?;

        Ok(Self {
            db: Arc::new(RwLock::new(db)),
        })
    }

    fn encode<T: Serialize>(value: &T) -> SyncResult<Vec<u8>> {
        serde_json::to_vec(value).map_err(|e| SyncError::Serialization(e.to_string()))
    }

    fn decode<T: DeserializeOwned>(bytes: &[u8]) -> SyncResult<T> {
        serde_json::from_slice(bytes).map_err(|e| SyncError::Serialization(e.to_string()))
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Collection Operations
    // ═══════════════════════════════════════════════════════════════════════

    /// Upsert rows into a collection, atomically.
    pub fn upsert<T: Entity>(
        &self,
        collection: &Collection<T>,
        rows: &[CachedRow<T>],
    ) -> SyncResult<()> {
        let db = self.db.read();
        let write_txn = db.begin_write()?;
        {
            let mut table = write_txn.open_table(collection.table())?;
            for row in rows {
                let key = row.entity.entity_id();
                let data = Self::encode(row)?;
                table.insert(key.as_str(), data.as_slice())?;
            }
        }
        write_txn.commit()?;
        Ok(())
    }

    /// Get a single row by id.
    pub fn get<T: Entity>(
        &self,
        collection: &Collection<T>,
        id: &str,
    ) -> SyncResult<Option<CachedRow<T>>> {
        let db = self.db.read();
        let read_txn = db.begin_read()?;
        let table = read_txn.open_table(collection.table())?;

        match table.get(id)? {
            Some(v) => Ok(Some(Self::decode(v.value())?)),
            None => Ok(None),
        }
    }

    /// Query a collection with a row predicate, ordering, and limit.
    pub fn query<T, F>(
        &self,
        collection: &Collection<T>,
        predicate: F,
        order: QueryOrder,
        limit: Option<usize>,
    ) -> SyncResult<Vec<CachedRow<T>>>
    where
        T: Entity,
        F: Fn(&CachedRow<T>) -> bool,
    {
        let db = self.db.read();
        let read_txn = db.begin_read()?;
        let table = read_txn.open_table(collection.table())?;

        let mut rows = Vec::new();
        for entry in table.iter()? {
            let (_, value) = entry?;
            let row: CachedRow<T> = Self::decode(value.value())?;
            if predicate(&row) {
                rows.push(row);
            }
        }

        match order {
            QueryOrder::Unordered => {}
            QueryOrder::CachedAtAsc => rows.sort_by_key(|r| r.cached_at),
            QueryOrder::CachedAtDesc => rows.sort_by_key(|r| std::cmp::Reverse(r.cached_at)),
        }

        if let Some(limit) = limit {
            rows.truncate(limit);
        }
        Ok(rows)
    }

    /// Delete a row by id. Returns `true` if a row was removed.
    pub fn delete<T: Entity>(&self, collection: &Collection<T>, id: &str) -> SyncResult<bool> {
        let db = self.db.read();
        let write_txn = db.begin_write()?;
        let removed = {
            let mut table = write_txn.open_table(collection.table())?;
            let removed = table.remove(id)?.is_some();
            removed
        };
        write_txn.commit()?;
        Ok(removed)
    }

    /// Insert a canonical (server-confirmed) row.
    ///
    /// Errors with [`SyncError::Conflict`] if a canonical row with the same
    /// id already exists; the write has been applied before and the caller
    /// must treat it as a no-op. A pending row with the same id is replaced
    /// (canonical always wins).
    pub fn insert_canonical<T: Entity>(
        &self,
        collection: &Collection<T>,
        row: &CachedRow<T>,
    ) -> SyncResult<()> {
        let key = row.entity.entity_id();
        let db = self.db.read();
        let write_txn = db.begin_write()?;
        {
            let mut table = write_txn.open_table(collection.table())?;
            if let Some(existing) = table.get(key.as_str())? {
                let existing: CachedRow<T> = Self::decode(existing.value())?;
                if !existing.pending {
                    return Err(SyncError::Conflict(format!(
                        "canonical row already exists: {}/{}",
                        collection.name, key
                    )));
                }
            }
            let data = Self::encode(row)?;
            table.insert(key.as_str(), data.as_slice())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    /// Replace a pending row with its canonical form, atomically.
    ///
    /// The pending row is deleted and the canonical row inserted in one
    /// transaction, so readers never observe both or neither. Succeeds even
    /// if the pending row is already gone (e.g. retired by a live echo).
    pub fn replace_pending_with_canonical<T: Entity>(
        &self,
        collection: &Collection<T>,
        pending_id: &str,
        row: &CachedRow<T>,
    ) -> SyncResult<()> {
        let key = row.entity.entity_id();
        let db = self.db.read();
        let write_txn = db.begin_write()?;
        {
            let mut table = write_txn.open_table(collection.table())?;
            table.remove(pending_id)?;
            let data = Self::encode(row)?;
            table.insert(key.as_str(), data.as_slice())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    /// Merge canonical rows from a fetch, atomically.
    ///
    /// A row is skipped when the stored row has a newer `last_sync_at`, so
    /// a superseded fetch that completes late cannot overwrite fresher
    /// data. Returns the number of rows applied.
    pub fn merge_canonical<T: Entity>(
        &self,
        collection: &Collection<T>,
        rows: &[CachedRow<T>],
    ) -> SyncResult<usize> {
        let db = self.db.read();
        let write_txn = db.begin_write()?;
        let mut applied = 0;
        {
            let mut table = write_txn.open_table(collection.table())?;
            for row in rows {
                let key = row.entity.entity_id();
                if let Some(existing) = table.get(key.as_str())? {
                    let existing: CachedRow<T> = Self::decode(existing.value())?;
                    if existing.last_sync_at > row.last_sync_at {
                        continue;
                    }
                }
                let data = Self::encode(row)?;
                table.insert(key.as_str(), data.as_slice())?;
                applied += 1;
            }
        }
        write_txn.commit()?;
        Ok(applied)
    }

    /// Mirror a conversation's server-authoritative membership list,
    /// atomically.
    ///
    /// Member rows of the conversation that are absent from `rows` are
    /// deleted; present rows merge under the same staleness rule as
    /// [`merge_canonical`]. A row confirmed after `synced_at` is kept, so
    /// a superseded fetch cannot resurrect a removal it never saw.
    ///
    /// [`merge_canonical`]: LocalStore::merge_canonical
    pub fn reconcile_members(
        &self,
        conversation_id: &ConversationId,
        synced_at: i64,
        rows: &[CachedRow<ConversationMember>],
    ) -> SyncResult<()> {
        let db = self.db.read();
        let write_txn = db.begin_write()?;
        {
            let mut table = write_txn.open_table(MEMBERS_TABLE)?;
            let prefix = format!("{}:", conversation_id.as_str());
            let keep: std::collections::HashSet<String> =
                rows.iter().map(|r| r.entity.row_id()).collect();

            let mut removed_keys = Vec::new();
            for entry in table.iter()? {
                let (key, value) = entry?;
                let key = key.value().to_string();
                if !key.starts_with(&prefix) || keep.contains(&key) {
                    continue;
                }
                let existing: CachedRow<ConversationMember> = Self::decode(value.value())?;
                if existing.last_sync_at.map_or(true, |t| t <= synced_at) {
                    removed_keys.push(key);
                }
            }
            for key in removed_keys {
                table.remove(key.as_str())?;
            }

            for row in rows {
                let key = row.entity.row_id();
                if let Some(existing) = table.get(key.as_str())? {
                    let existing: CachedRow<ConversationMember> = Self::decode(existing.value())?;
                    if existing.last_sync_at > row.last_sync_at {
                        continue;
                    }
                }
                let data = Self::encode(row)?;
                table.insert(key.as_str(), data.as_slice())?;
            }
        }
        write_txn.commit()?;
        Ok(())
    }

    /// Delete a conversation and everything it owns (members, messages),
    /// in one transaction.
    pub fn delete_conversation(&self, conversation_id: &ConversationId) -> SyncResult<()> {
        let db = self.db.read();
        let write_txn = db.begin_write()?;
        {
            let mut conversations = write_txn.open_table(CONVERSATIONS_TABLE)?;
            conversations.remove(conversation_id.as_str())?;

            // Cascade: member rows are keyed "conversation:user"
            let mut members = write_txn.open_table(MEMBERS_TABLE)?;
            let prefix = format!("{}:", conversation_id.as_str());
            let member_keys: Vec<String> = members
                .iter()?
                .filter_map(|entry| entry.ok())
                .map(|(k, _)| k.value().to_string())
                .filter(|k| k.starts_with(&prefix))
                .collect();
            for key in member_keys {
                members.remove(key.as_str())?;
            }

            // Cascade: messages reference the conversation in their payload
            let mut messages = write_txn.open_table(MESSAGES_TABLE)?;
            let mut message_keys = Vec::new();
            for entry in messages.iter()? {
                let (key, value) = entry?;
                let row: CachedRow<Message> = Self::decode(value.value())?;
                if row.entity.conversation_id == *conversation_id {
                    message_keys.push(key.value().to_string());
                }
            }
            for key in message_keys {
                messages.remove(key.as_str())?;
            }
        }
        write_txn.commit()?;
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Sync Metadata (watermarks)
    // ═══════════════════════════════════════════════════════════════════════

    /// Last timestamp (millis) up to which a collection is known synced.
    pub fn watermark(&self, collection: &str) -> SyncResult<Option<i64>> {
        let db = self.db.read();
        let read_txn = db.begin_read()?;
        let table = read_txn.open_table(SYNC_META_TABLE)?;
        let key = format!("watermark/{}", collection);

        match table.get(key.as_str())? {
            Some(v) => Ok(Some(Self::decode(v.value())?)),
            None => Ok(None),
        }
    }

    /// Advance a collection's watermark. Never moves backwards.
    pub fn set_watermark(&self, collection: &str, ts: i64) -> SyncResult<()> {
        let db = self.db.read();
        let write_txn = db.begin_write()?;
        {
            let mut table = write_txn.open_table(SYNC_META_TABLE)?;
            let key = format!("watermark/{}", collection);
            let current: Option<i64> = match table.get(key.as_str())? {
                Some(v) => Some(Self::decode(v.value())?),
                None => None,
            };
            if current.map_or(true, |c| c < ts) {
                let data = Self::encode(&ts)?;
                table.insert(key.as_str(), data.as_slice())?;
            }
        }
        write_txn.commit()?;
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Outbox Persistence
    // ═══════════════════════════════════════════════════════════════════════

    /// Append a pending mutation to the durable outbox.
    ///
    /// Returns the assigned sequence number (monotonic, FIFO order).
    pub fn append_outbox(&self, entry: &PendingMutation) -> SyncResult<u64> {
        let db = self.db.read();
        let write_txn = db.begin_write()?;
        let seq = {
            let mut table = write_txn.open_table(OUTBOX_TABLE)?;
            let seq = match table.last()? {
                Some((k, _)) => k.value() + 1,
                None => 0,
            };
            let data = Self::encode(entry)?;
            table.insert(seq, data.as_slice())?;
            seq
        };
        write_txn.commit()?;
        Ok(seq)
    }

    /// All outbox entries in enqueue order.
    pub fn outbox_entries(&self) -> SyncResult<Vec<(u64, PendingMutation)>> {
        let db = self.db.read();
        let read_txn = db.begin_read()?;
        let table = read_txn.open_table(OUTBOX_TABLE)?;

        let mut entries = Vec::new();
        for entry in table.iter()? {
            let (key, value) = entry?;
            entries.push((key.value(), Self::decode(value.value())?));
        }
        Ok(entries)
    }

    /// Remove an outbox entry. Returns `true` if it existed.
    pub fn remove_outbox(&self, seq: u64) -> SyncResult<bool> {
        let db = self.db.read();
        let write_txn = db.begin_write()?;
        let removed = {
            let mut table = write_txn.open_table(OUTBOX_TABLE)?;
            let removed = table.remove(seq)?.is_some();
            removed
        };
        write_txn.commit()?;
        Ok(removed)
    }

    /// Number of queued outbox entries.
    pub fn outbox_len(&self) -> SyncResult<usize> {
        Ok(self.outbox_entries()?.len())
    }
}
