//! Cache synchronizer: the only writer of the entity cache.
//!
//! Confirmed change events, optimistic mutations (see
//! [`optimistic`](crate::optimistic)) and invalidation/resync all land
//! here, one at a time, through `&mut self`.
//!
//! ```text
//!  ChangeEvent ──► pending mutation on (table, id)? ──yes──► reconcile
//!                        │                                   (overwrite only if
//!                        no                                   server truth differs)
//!                        ▼
//!            insert:  add if absent, else ignore (dedup)
//!            update:  replace if present, else insert (healed)
//!            delete:  remove if present, else no-op
//! ```
//!
//! Within a collection, events are applied in the order they are handed
//! in. Listeners hear about real changes only; no-ops stay silent.

use fleet_model::{EntityId, EntityRecord, TableName};

use crate::cache::{CacheChange, CacheCollection, ChangeListeners, EntityCache, ListenerId};
use crate::event::{ChangeEvent, Operation};
use crate::optimistic::{MutationId, PendingTable, RekeyResult};

/// Result of applying one change event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Inserted,
    Updated,
    /// Update for an unknown id, applied as an insert.
    HealedInsert,
    Removed,
    /// Update carrying exactly the cached value.
    Unchanged,
    /// Insert for an id already cached.
    DuplicateIgnored,
    /// Delete for an id not cached.
    AbsentDeleteIgnored,
    /// The event confirmed a pending optimistic mutation. `overwritten` is
    /// set when server truth differed and replaced the optimistic value.
    Confirmed {
        mutation_id: MutationId,
        overwritten: bool,
    },
}

impl ApplyOutcome {
    /// Whether the cache content changed.
    pub fn changed_cache(&self) -> bool {
        match self {
            Self::Inserted | Self::Updated | Self::HealedInsert | Self::Removed => true,
            Self::Confirmed { overwritten, .. } => *overwritten,
            Self::Unchanged | Self::DuplicateIgnored | Self::AbsentDeleteIgnored => false,
        }
    }
}

/// Counters for monitoring.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncStats {
    pub applied: u64,
    pub duplicates_ignored: u64,
    pub healed_updates: u64,
    pub confirmations: u64,
    pub invalidations: u64,
}

#[derive(Debug, Default)]
pub struct CacheSynchronizer {
    pub(crate) cache: EntityCache,
    pub(crate) pending: PendingTable,
    pub(crate) listeners: ChangeListeners,
    pub(crate) stats: SyncStats,
}

impl CacheSynchronizer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one normalized change event.
    pub fn apply_change_event(&mut self, event: &ChangeEvent) -> ApplyOutcome {
        self.stats.applied += 1;
        let table = event.table();
        let id = event.entity_id();

        if let Some(mutation_id) = self.pending.oldest_for(table.as_str(), id.as_str()) {
            return self.confirm_pending(mutation_id, event);
        }

        let outcome = match event.operation() {
            Operation::Insert => self.apply_insert(table, event.subject()),
            Operation::Update => self.apply_update(table, event.subject()),
            Operation::Delete => self.apply_delete(table, id.as_str()),
        };
        log::trace!("{} {}/{} -> {outcome:?}", event.operation(), table, id);
        outcome
    }

    fn apply_insert(&mut self, table: &TableName, after: &EntityRecord) -> ApplyOutcome {
        if !self.cache.collection_mut(table).insert(after.clone()) {
            self.stats.duplicates_ignored += 1;
            log::warn!(
                "Ignoring duplicate insert for {}/{}",
                table,
                after.id()
            );
            return ApplyOutcome::DuplicateIgnored;
        }
        self.notify(CacheChange::Inserted {
            table: table.clone(),
            record: after.clone(),
        });
        ApplyOutcome::Inserted
    }

    fn apply_update(&mut self, table: &TableName, after: &EntityRecord) -> ApplyOutcome {
        let collection = self.cache.collection_mut(table);
        match collection.get(after.id().as_str()) {
            Some(current) if current == after => ApplyOutcome::Unchanged,
            Some(_) => {
                let before = collection.upsert(after.clone());
                if let Some(before) = before {
                    self.notify(CacheChange::Updated {
                        table: table.clone(),
                        before,
                        after: after.clone(),
                    });
                }
                ApplyOutcome::Updated
            }
            None => {
                collection.insert(after.clone());
                self.stats.healed_updates += 1;
                log::info!(
                    "Update for unknown {}/{} applied as insert",
                    table,
                    after.id()
                );
                self.notify(CacheChange::Inserted {
                    table: table.clone(),
                    record: after.clone(),
                });
                ApplyOutcome::HealedInsert
            }
        }
    }

    fn apply_delete(&mut self, table: &TableName, id: &str) -> ApplyOutcome {
        match self.cache.collection_mut(table).remove(id) {
            Some(record) => {
                self.notify(CacheChange::Removed {
                    table: table.clone(),
                    record,
                });
                ApplyOutcome::Removed
            }
            None => ApplyOutcome::AbsentDeleteIgnored,
        }
    }

    /// A confirmation for the oldest pending mutation on the event's
    /// record. The marker is cleared; the cached value is only touched if
    /// the server's version differs and no newer local mutation is still
    /// pending on the same record.
    fn confirm_pending(&mut self, mutation_id: MutationId, event: &ChangeEvent) -> ApplyOutcome {
        let table = event.table();
        let id = event.entity_id();
        self.reconcile_optimistic(mutation_id, id);

        let server_value = event.after().cloned();
        if self.pending.hand_down_prior(table.as_str(), id.as_str(), server_value.clone()) {
            log::debug!(
                "Confirmation for {table}/{id} held back by a newer pending mutation"
            );
            return ApplyOutcome::Confirmed {
                mutation_id,
                overwritten: false,
            };
        }

        let overwritten = match server_value {
            Some(after) => {
                let collection = self.cache.collection_mut(table);
                if collection.get(id.as_str()) == Some(&after) {
                    false
                } else {
                    match collection.upsert(after.clone()) {
                        Some(before) => self.notify(CacheChange::Updated {
                            table: table.clone(),
                            before,
                            after,
                        }),
                        None => self.notify(CacheChange::Inserted {
                            table: table.clone(),
                            record: after,
                        }),
                    }
                    true
                }
            }
            None => match self.cache.collection_mut(table).remove(id.as_str()) {
                Some(record) => {
                    self.notify(CacheChange::Removed {
                        table: table.clone(),
                        record,
                    });
                    true
                }
                None => false,
            },
        };

        ApplyOutcome::Confirmed {
            mutation_id,
            overwritten,
        }
    }

    /// Clear a pending marker because its confirmation arrived. Does not
    /// re-apply the mutation. If the confirmed id differs from the id the
    /// record is cached under, the record moves to the confirmed id.
    /// Returns `false` for an unknown mutation.
    pub fn reconcile_optimistic(
        &mut self,
        mutation_id: MutationId,
        confirmed_id: &EntityId,
    ) -> bool {
        let Some(entry) = self.pending.get(mutation_id) else {
            return false;
        };
        if entry.id != *confirmed_id {
            let table = entry.table.clone();
            let from = entry.id.clone();
            self.move_record(&table, &from, confirmed_id);
        }
        self.pending.remove(mutation_id);
        self.stats.confirmations += 1;
        log::debug!("Mutation {mutation_id} confirmed as {confirmed_id}");
        true
    }

    /// Rekey a cached record and every pending marker on it. If the target
    /// id is already cached (its CDC insert won the race), the source record
    /// is dropped instead.
    pub(crate) fn move_record(
        &mut self,
        table: &TableName,
        from: &EntityId,
        to: &EntityId,
    ) -> RekeyResult {
        let collection = self.cache.collection_mut(table);
        let result = if collection.rekey(from.as_str(), to.clone()) {
            self.notify(CacheChange::Rekeyed {
                table: table.clone(),
                from: from.clone(),
                to: to.clone(),
            });
            RekeyResult::Moved
        } else if collection.contains(to.as_str()) {
            if let Some(record) = collection.remove(from.as_str()) {
                self.notify(CacheChange::Removed {
                    table: table.clone(),
                    record,
                });
            }
            RekeyResult::Collapsed
        } else {
            RekeyResult::Missing
        };
        self.pending.rekey_record(table, from, to);
        result
    }

    /// Synchronous read over one collection. Never touches the network.
    pub fn query<F>(&self, table: &str, predicate: F) -> Vec<&EntityRecord>
    where
        F: FnMut(&EntityRecord) -> bool,
    {
        self.cache
            .collection(table)
            .map(|c| c.query(predicate))
            .unwrap_or_default()
    }

    pub fn collection(&self, table: &str) -> Option<&CacheCollection> {
        self.cache.collection(table)
    }

    pub fn cache(&self) -> &EntityCache {
        &self.cache
    }

    /// Flag a collection as possibly diverged. The cached values stay
    /// readable until [`replace_collection`](Self::replace_collection)
    /// brings in a fresh snapshot.
    pub fn invalidate(&mut self, table: &TableName) {
        self.stats.invalidations += 1;
        self.cache.collection_mut(table).mark_stale();
        log::warn!("Invalidated collection {table}");
        self.notify(CacheChange::Invalidated {
            table: table.clone(),
        });
    }

    /// Replace a collection from an authoritative snapshot. Still-pending
    /// optimistic mutations are re-applied on top, in their original order.
    pub fn replace_collection(&mut self, table: &TableName, records: Vec<EntityRecord>) -> usize {
        let collection = self.cache.collection_mut(table);
        let dropped = collection.replace_all(records);
        if dropped > 0 {
            log::warn!("Snapshot for {table} carried {dropped} duplicate id(s)");
        }
        self.pending.replay_onto(table, collection);
        let len = collection.len();
        log::info!("Resynced {table}: {len} record(s)");
        self.notify(CacheChange::Replaced {
            table: table.clone(),
            len,
        });
        len
    }

    pub fn subscribe<F>(&mut self, listener: F) -> ListenerId
    where
        F: Fn(&CacheChange) + Send + 'static,
    {
        self.listeners.subscribe(listener)
    }

    pub fn unsubscribe(&mut self, id: ListenerId) -> bool {
        self.listeners.unsubscribe(id)
    }

    pub fn stats(&self) -> SyncStats {
        self.stats
    }

    /// Updates for unknown ids that were applied as inserts. A non-zero
    /// value means events were missed (or a delete was lost and the row
    /// resurrected); the periodic resync is the safeguard.
    pub fn healed_updates(&self) -> u64 {
        self.stats.healed_updates
    }

    pub(crate) fn notify(&self, change: CacheChange) {
        self.listeners.notify(&change);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::Instant;
    use std::sync::{Arc, Mutex};

    fn record(id: &str, content: &str) -> EntityRecord {
        EntityRecord::new(EntityId::new(id).unwrap()).with_field("content", content)
    }

    fn insert(id: &str, content: &str) -> ChangeEvent {
        ChangeEvent::insert("messages".into(), record(id, content), Instant::now())
    }

    fn update(id: &str, content: &str) -> ChangeEvent {
        ChangeEvent::update("messages".into(), None, record(id, content), Instant::now())
    }

    fn delete(id: &str) -> ChangeEvent {
        ChangeEvent::delete("messages".into(), record(id, ""), Instant::now())
    }

    fn recorder(sync: &mut CacheSynchronizer) -> Arc<Mutex<Vec<CacheChange>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        sync.subscribe(move |change| sink.lock().unwrap().push(change.clone()));
        seen
    }

    #[test]
    fn test_insert_then_query() {
        let mut sync = CacheSynchronizer::new();
        assert_eq!(sync.apply_change_event(&insert("m1", "hi")), ApplyOutcome::Inserted);
        let coll = sync.collection("messages").unwrap();
        assert_eq!(coll.len(), 1);
        assert_eq!(coll.get("m1").unwrap().get_str("content"), Some("hi"));
    }

    #[test]
    fn test_duplicate_insert_ignored() {
        let mut sync = CacheSynchronizer::new();
        let seen = recorder(&mut sync);
        sync.apply_change_event(&insert("m1", "hi"));
        assert_eq!(
            sync.apply_change_event(&insert("m1", "again")),
            ApplyOutcome::DuplicateIgnored
        );
        assert_eq!(sync.collection("messages").unwrap().len(), 1);
        assert_eq!(seen.lock().unwrap().len(), 1);
        assert_eq!(sync.stats().duplicates_ignored, 1);
    }

    #[test]
    fn test_update_replaces_or_heals() {
        let mut sync = CacheSynchronizer::new();
        assert_eq!(sync.apply_change_event(&update("m1", "a")), ApplyOutcome::HealedInsert);
        assert_eq!(sync.healed_updates(), 1);
        assert_eq!(sync.apply_change_event(&update("m1", "b")), ApplyOutcome::Updated);
        assert_eq!(sync.apply_change_event(&update("m1", "b")), ApplyOutcome::Unchanged);
        assert_eq!(
            sync.collection("messages").unwrap().get("m1").unwrap().get_str("content"),
            Some("b")
        );
    }

    #[test]
    fn test_delete_idempotent() {
        let mut sync = CacheSynchronizer::new();
        sync.apply_change_event(&insert("m1", "hi"));
        sync.apply_change_event(&insert("m2", "yo"));
        assert_eq!(sync.apply_change_event(&delete("m1")), ApplyOutcome::Removed);
        let once: Vec<String> = sync
            .collection("messages")
            .unwrap()
            .ids()
            .map(ToString::to_string)
            .collect();
        assert_eq!(
            sync.apply_change_event(&delete("m1")),
            ApplyOutcome::AbsentDeleteIgnored
        );
        let twice: Vec<String> = sync
            .collection("messages")
            .unwrap()
            .ids()
            .map(ToString::to_string)
            .collect();
        assert_eq!(once, twice);
        assert_eq!(
            sync.apply_change_event(&delete("never")),
            ApplyOutcome::AbsentDeleteIgnored
        );
    }

    #[test]
    fn test_noops_do_not_notify() {
        let mut sync = CacheSynchronizer::new();
        sync.apply_change_event(&insert("m1", "hi"));
        let seen = recorder(&mut sync);
        sync.apply_change_event(&insert("m1", "hi"));
        sync.apply_change_event(&update("m1", "hi"));
        sync.apply_change_event(&delete("zzz"));
        assert!(seen.lock().unwrap().is_empty());

        sync.apply_change_event(&update("m1", "edited"));
        assert!(matches!(
            seen.lock().unwrap().as_slice(),
            [CacheChange::Updated { .. }]
        ));
    }

    #[test]
    fn test_collections_are_independent() {
        let mut sync = CacheSynchronizer::new();
        sync.apply_change_event(&insert("x", "msg"));
        let room = ChangeEvent::insert("rooms".into(), record("x", "room"), Instant::now());
        assert_eq!(sync.apply_change_event(&room), ApplyOutcome::Inserted);
        assert_eq!(sync.cache().total_records(), 2);
    }

    #[test]
    fn test_query_unknown_table_is_empty() {
        let sync = CacheSynchronizer::new();
        assert!(sync.query("nothing", |_| true).is_empty());
    }

    #[test]
    fn test_invalidate_then_replace() {
        let mut sync = CacheSynchronizer::new();
        let table = TableName::from("messages");
        sync.apply_change_event(&insert("m1", "hi"));
        let seen = recorder(&mut sync);

        sync.invalidate(&table);
        assert!(sync.collection("messages").unwrap().is_stale());
        assert_eq!(sync.collection("messages").unwrap().len(), 1);

        let len = sync.replace_collection(&table, vec![record("m2", "a"), record("m3", "b")]);
        assert_eq!(len, 2);
        let coll = sync.collection("messages").unwrap();
        assert!(!coll.is_stale());
        assert!(!coll.contains("m1"));

        let changes = seen.lock().unwrap();
        assert!(matches!(changes[0], CacheChange::Invalidated { .. }));
        assert!(matches!(changes[1], CacheChange::Replaced { len: 2, .. }));
    }

    #[test]
    fn test_receipt_order_within_collection() {
        let mut sync = CacheSynchronizer::new();
        sync.apply_change_event(&insert("m1", "a"));
        sync.apply_change_event(&update("m1", "b"));
        sync.apply_change_event(&delete("m1"));
        sync.apply_change_event(&update("m1", "c"));
        let coll = sync.collection("messages").unwrap();
        assert_eq!(coll.get("m1").unwrap().get_str("content"), Some("c"));
    }
}
