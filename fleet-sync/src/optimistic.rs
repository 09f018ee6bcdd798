//! Optimistic mutation layer.
//!
//! A local create/update/delete is written into the cache immediately and
//! remembered as a [`PendingOptimisticEntry`] until one of four things
//! happens to it:
//!
//! ```text
//!                      apply_optimistic
//!                             │
//!                             ▼
//!   write failed ◄──────── pending ────────► CDC confirmation
//!   rollback(): restore       │  │           marker cleared, value kept
//!   prior value               │  │           unless server truth differs
//!                             │  ▼
//!                             │  confirm_write(server id): rekey, stay pending
//!                             ▼
//!                    timeout: marker cleared, value kept
//! ```
//!
//! Confirmations are matched on `(table, entity id)`, the same key the
//! synchronizer dedups on, so an optimistic insert and its CDC echo can
//! never both end up in a collection.

use fleet_model::{EntityId, EntityRecord, TableName};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;

use crate::cache::{CacheChange, CacheCollection};
use crate::error::SyncError;
use crate::synchronizer::CacheSynchronizer;

/// Identity of one user-initiated mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MutationId(Uuid);

impl MutationId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for MutationId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for MutationId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

impl fmt::Display for MutationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What an optimistic mutation does to the cache.
#[derive(Debug, Clone, PartialEq)]
pub enum OptimisticOp {
    /// Create or replace the record under its id.
    Upsert(EntityRecord),
    Delete(EntityId),
}

impl OptimisticOp {
    pub fn target_id(&self) -> &EntityId {
        match self {
            Self::Upsert(record) => record.id(),
            Self::Delete(id) => id,
        }
    }

    fn rekeyed(self, id: EntityId) -> Self {
        match self {
            Self::Upsert(record) => Self::Upsert(record.rekeyed(id)),
            Self::Delete(_) => Self::Delete(id),
        }
    }

    fn apply_to(&self, collection: &mut CacheCollection) {
        match self {
            Self::Upsert(record) => {
                collection.upsert(record.clone());
            }
            Self::Delete(id) => {
                collection.remove(id.as_str());
            }
        }
    }
}

/// A locally-applied mutation awaiting server confirmation.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingOptimisticEntry {
    /// Record the mutation touched (server id once known).
    pub id: EntityId,
    pub table: TableName,
    pub applied_at: Instant,
    pub source_mutation_id: MutationId,
    /// Whether the persistence API has acknowledged the write.
    pub write_confirmed: bool,
    op: OptimisticOp,
    prior: Option<EntityRecord>,
    seq: u64,
}

impl PendingOptimisticEntry {
    pub fn op(&self) -> &OptimisticOp {
        &self.op
    }

    /// Cached value before this mutation was applied.
    pub fn prior(&self) -> Option<&EntityRecord> {
        self.prior.as_ref()
    }
}

/// Pending entries, indexed by mutation and by record. Several mutations
/// may be stacked on one record; they are kept oldest first.
#[derive(Debug, Default)]
pub struct PendingTable {
    entries: HashMap<MutationId, PendingOptimisticEntry>,
    by_record: HashMap<TableName, HashMap<EntityId, VecDeque<MutationId>>>,
    next_seq: u64,
}

impl PendingTable {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, mutation_id: MutationId) -> bool {
        self.entries.contains_key(&mutation_id)
    }

    pub fn get(&self, mutation_id: MutationId) -> Option<&PendingOptimisticEntry> {
        self.entries.get(&mutation_id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &PendingOptimisticEntry> {
        self.entries.values()
    }

    /// Oldest pending mutation on a record.
    pub fn oldest_for(&self, table: &str, id: &str) -> Option<MutationId> {
        self.by_record
            .get(table)
            .and_then(|records| records.get(id))
            .and_then(|queue| queue.front().copied())
    }

    pub fn count_for(&self, table: &str, id: &str) -> usize {
        self.by_record
            .get(table)
            .and_then(|records| records.get(id))
            .map_or(0, VecDeque::len)
    }

    fn insert(
        &mut self,
        table: TableName,
        op: OptimisticOp,
        prior: Option<EntityRecord>,
        mutation_id: MutationId,
        applied_at: Instant,
    ) {
        self.next_seq += 1;
        let id = op.target_id().clone();
        self.by_record
            .entry(table.clone())
            .or_default()
            .entry(id.clone())
            .or_default()
            .push_back(mutation_id);
        self.entries.insert(
            mutation_id,
            PendingOptimisticEntry {
                id,
                table,
                applied_at,
                source_mutation_id: mutation_id,
                write_confirmed: false,
                op,
                prior,
                seq: self.next_seq,
            },
        );
    }

    /// Remove an entry. Also returns the next newer mutation stacked on the
    /// same record, if any.
    fn remove_with_successor(
        &mut self,
        mutation_id: MutationId,
    ) -> Option<(PendingOptimisticEntry, Option<MutationId>)> {
        let entry = self.entries.remove(&mutation_id)?;
        let mut successor = None;
        if let Some(records) = self.by_record.get_mut(&entry.table) {
            if let Some(queue) = records.get_mut(&entry.id) {
                if let Some(index) = queue.iter().position(|m| *m == mutation_id) {
                    queue.remove(index);
                    successor = queue.get(index).copied();
                }
                if queue.is_empty() {
                    records.remove(&entry.id);
                }
            }
            if records.is_empty() {
                self.by_record.remove(&entry.table);
            }
        }
        Some((entry, successor))
    }

    pub(crate) fn remove(&mut self, mutation_id: MutationId) -> Option<PendingOptimisticEntry> {
        self.remove_with_successor(mutation_id).map(|(entry, _)| entry)
    }

    /// Give the oldest remaining mutation on a record a new prior value.
    /// Returns whether any mutation remains on the record.
    pub(crate) fn hand_down_prior(
        &mut self,
        table: &str,
        id: &str,
        prior: Option<EntityRecord>,
    ) -> bool {
        let Some(oldest) = self.oldest_for(table, id) else {
            return false;
        };
        if let Some(entry) = self.entries.get_mut(&oldest) {
            entry.prior = prior;
        }
        true
    }

    /// Move every marker on `from` to `to`.
    pub(crate) fn rekey_record(&mut self, table: &TableName, from: &EntityId, to: &EntityId) {
        let Some(records) = self.by_record.get_mut(table) else {
            return;
        };
        let Some(moved) = records.remove(from) else {
            return;
        };
        for mutation_id in &moved {
            if let Some(entry) = self.entries.get_mut(mutation_id) {
                entry.id = to.clone();
                entry.op = entry.op.clone().rekeyed(to.clone());
                if let Some(prior) = entry.prior.take() {
                    entry.prior = Some(prior.rekeyed(to.clone()));
                }
            }
        }
        records.entry(to.clone()).or_default().extend(moved);
    }

    /// Re-apply every pending mutation for `table` onto a freshly replaced
    /// collection, oldest first, rebuilding each prior value from it.
    pub(crate) fn replay_onto(&mut self, table: &TableName, collection: &mut CacheCollection) {
        let mut entries: Vec<&mut PendingOptimisticEntry> = self
            .entries
            .values_mut()
            .filter(|e| e.table == *table)
            .collect();
        entries.sort_by_key(|e| e.seq);
        for entry in entries {
            entry.prior = collection.get(entry.id.as_str()).cloned();
            entry.op.apply_to(collection);
        }
    }

    fn expired(&self, now: Instant, timeout: Duration) -> Vec<MutationId> {
        let mut expired: Vec<(u64, MutationId)> = self
            .entries
            .values()
            .filter(|e| now.saturating_duration_since(e.applied_at) >= timeout)
            .map(|e| (e.seq, e.source_mutation_id))
            .collect();
        expired.sort();
        expired.into_iter().map(|(_, id)| id).collect()
    }
}

impl CacheSynchronizer {
    /// Apply a local mutation to the cache right away and record it as
    /// pending. Returns the id of the affected record.
    pub fn apply_optimistic(
        &mut self,
        table: &TableName,
        op: OptimisticOp,
        mutation_id: MutationId,
        now: Instant,
    ) -> Result<EntityId, SyncError> {
        if self.pending.contains(mutation_id) {
            return Err(SyncError::DuplicateMutation(mutation_id));
        }
        let id = op.target_id().clone();
        let collection = self.cache.collection_mut(table);
        let prior = collection.get(id.as_str()).cloned();

        let change = match &op {
            OptimisticOp::Upsert(record) => {
                collection.upsert(record.clone());
                match &prior {
                    Some(before) if before == record => None,
                    Some(before) => Some(CacheChange::Updated {
                        table: table.clone(),
                        before: before.clone(),
                        after: record.clone(),
                    }),
                    None => Some(CacheChange::Inserted {
                        table: table.clone(),
                        record: record.clone(),
                    }),
                }
            }
            OptimisticOp::Delete(_) => collection.remove(id.as_str()).map(|record| {
                CacheChange::Removed {
                    table: table.clone(),
                    record,
                }
            }),
        };

        log::debug!("Optimistic {mutation_id} on {table}/{id}");
        self.pending.insert(table.clone(), op, prior, mutation_id, now);
        if let Some(change) = change {
            self.notify(change);
        }
        Ok(id)
    }

    /// Undo a failed mutation: restore the cached value it replaced (or
    /// remove the record if there was none) and drop the pending entry.
    ///
    /// If a newer mutation is stacked on the same record, the cache keeps
    /// showing the newer value and that mutation inherits the prior value
    /// instead.
    pub fn rollback(&mut self, mutation_id: MutationId) -> Result<(), SyncError> {
        let (entry, successor) = self
            .pending
            .remove_with_successor(mutation_id)
            .ok_or(SyncError::UnknownMutation(mutation_id))?;

        log::info!(
            "Rolling back mutation {mutation_id} on {}/{}",
            entry.table,
            entry.id
        );

        if let Some(successor) = successor {
            if let Some(next) = self.pending.entries.get_mut(&successor) {
                next.prior = entry.prior;
            }
            return Ok(());
        }

        let collection = self.cache.collection_mut(&entry.table);
        let change = match entry.prior {
            Some(prior) => {
                let restored = prior.clone();
                match collection.upsert(prior) {
                    Some(current) if current == restored => None,
                    Some(current) => Some(CacheChange::Updated {
                        table: entry.table.clone(),
                        before: current,
                        after: restored,
                    }),
                    None => Some(CacheChange::Inserted {
                        table: entry.table.clone(),
                        record: restored,
                    }),
                }
            }
            None => collection
                .remove(entry.id.as_str())
                .map(|record| CacheChange::Removed {
                    table: entry.table.clone(),
                    record,
                }),
        };
        if let Some(change) = change {
            self.notify(change);
        }
        Ok(())
    }

    /// The persistence API accepted the write and assigned `server_id`.
    /// The entry stays pending until the CDC confirmation arrives; a
    /// client-generated id is replaced by the server's.
    pub fn confirm_write(
        &mut self,
        mutation_id: MutationId,
        server_id: &EntityId,
    ) -> Result<(), SyncError> {
        let entry = self
            .pending
            .entries
            .get_mut(&mutation_id)
            .ok_or(SyncError::UnknownMutation(mutation_id))?;
        entry.write_confirmed = true;
        if entry.id == *server_id {
            return Ok(());
        }

        let table = entry.table.clone();
        let from = entry.id.clone();
        log::debug!("Mutation {mutation_id}: {table}/{from} is {server_id} on the server");
        if self.move_record(&table, &from, server_id) == RekeyResult::Collapsed {
            // The CDC insert for the server id was applied before the write
            // returned, so this mutation is already confirmed.
            self.pending.remove(mutation_id);
            self.stats.confirmations += 1;
        }
        Ok(())
    }

    /// Clear pending entries older than `timeout`. Optimistic values stay
    /// in the cache. Returns the cleared entries, oldest first.
    pub fn expire_pending(
        &mut self,
        now: Instant,
        timeout: Duration,
    ) -> Vec<PendingOptimisticEntry> {
        self.pending
            .expired(now, timeout)
            .into_iter()
            .filter_map(|mutation_id| {
                let entry = self.pending.remove(mutation_id)?;
                log::warn!(
                    "Mutation {mutation_id} on {}/{} unconfirmed after {}ms, assuming success",
                    entry.table,
                    entry.id,
                    timeout.as_millis()
                );
                Some(entry)
            })
            .collect()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn is_pending(&self, mutation_id: MutationId) -> bool {
        self.pending.contains(mutation_id)
    }

    pub fn pending(&self) -> &PendingTable {
        &self.pending
    }
}

/// How a record move ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RekeyResult {
    Moved,
    /// The target id was already cached; the source record was dropped.
    Collapsed,
    /// Nothing cached under the source id.
    Missing,
}
