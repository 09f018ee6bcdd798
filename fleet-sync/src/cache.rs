//! In-memory entity cache.
//!
//! One [`CacheCollection`] per table, keyed by entity id and iterated in
//! first-insertion order. Consumers only ever get shared references; every
//! mutation goes through the [`CacheSynchronizer`](crate::synchronizer::CacheSynchronizer).
//!
//! ```text
//!  EntityCache
//!  ├── "messages" ─► CacheCollection { m1, m2, m3 }
//!  ├── "rooms"    ─► CacheCollection { roomA }
//!  └── "vehicles" ─► CacheCollection { ... }
//! ```

use fleet_model::{EntityId, EntityRecord, TableName};
use std::collections::{BTreeMap, HashMap};
use std::fmt;

/// Records of one table. Never holds two records with the same id.
///
/// Each record carries the sequence number of its first insertion; `order`
/// maps sequence numbers back to ids, so removal and rekeying stay
/// logarithmic.
#[derive(Debug, Clone)]
pub struct CacheCollection {
    table: TableName,
    records: HashMap<EntityId, (u64, EntityRecord)>,
    order: BTreeMap<u64, EntityId>,
    next_seq: u64,
    stale: bool,
}

impl CacheCollection {
    pub fn new(table: TableName) -> Self {
        Self {
            table,
            records: HashMap::new(),
            order: BTreeMap::new(),
            next_seq: 0,
            stale: false,
        }
    }

    pub fn table(&self) -> &TableName {
        &self.table
    }

    pub fn get(&self, id: &str) -> Option<&EntityRecord> {
        self.records.get(id).map(|(_, record)| record)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.records.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Records in first-insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &EntityRecord> {
        self.order.values().filter_map(|id| self.get(id.as_str()))
    }

    pub fn ids(&self) -> impl Iterator<Item = &EntityId> {
        self.order.values()
    }

    /// Records matching `predicate`, in first-insertion order.
    pub fn query<F>(&self, mut predicate: F) -> Vec<&EntityRecord>
    where
        F: FnMut(&EntityRecord) -> bool,
    {
        self.iter().filter(|r| predicate(r)).collect()
    }

    /// Whether the collection was invalidated and has not been resynced
    /// since.
    pub fn is_stale(&self) -> bool {
        self.stale
    }

    fn push(&mut self, record: EntityRecord) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.order.insert(seq, record.id().clone());
        self.records.insert(record.id().clone(), (seq, record));
    }

    /// Add a record whose id is absent. Returns `false` (and changes
    /// nothing) if the id is already present.
    pub(crate) fn insert(&mut self, record: EntityRecord) -> bool {
        if self.records.contains_key(record.id().as_str()) {
            return false;
        }
        self.push(record);
        true
    }

    /// Insert or replace, keeping the original position of a replaced
    /// record. Returns the previous value.
    pub(crate) fn upsert(&mut self, record: EntityRecord) -> Option<EntityRecord> {
        match self.records.get_mut(record.id().as_str()) {
            Some((_, slot)) => Some(std::mem::replace(slot, record)),
            None => {
                self.push(record);
                None
            }
        }
    }

    pub(crate) fn remove(&mut self, id: &str) -> Option<EntityRecord> {
        let (seq, removed) = self.records.remove(id)?;
        self.order.remove(&seq);
        Some(removed)
    }

    /// Move a record to a new id in place. Fails if `from` is absent or
    /// `to` is already taken.
    pub(crate) fn rekey(&mut self, from: &str, to: EntityId) -> bool {
        if self.records.contains_key(to.as_str()) {
            return false;
        }
        let Some((seq, record)) = self.records.remove(from) else {
            return false;
        };
        self.order.insert(seq, to.clone());
        self.records.insert(to.clone(), (seq, record.rekeyed(to)));
        true
    }

    /// Replace the whole content. Later duplicates of an id are dropped.
    /// Returns how many duplicates were dropped.
    pub(crate) fn replace_all(&mut self, records: Vec<EntityRecord>) -> usize {
        self.records.clear();
        self.order.clear();
        self.next_seq = 0;
        self.stale = false;
        let mut duplicates = 0;
        for record in records {
            if !self.insert(record) {
                duplicates += 1;
            }
        }
        duplicates
    }

    pub(crate) fn mark_stale(&mut self) {
        self.stale = true;
    }
}

/// All cached collections.
#[derive(Debug, Default)]
pub struct EntityCache {
    collections: HashMap<TableName, CacheCollection>,
}

impl EntityCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn collection(&self, table: &str) -> Option<&CacheCollection> {
        self.collections.get(table)
    }

    pub fn get(&self, table: &str, id: &str) -> Option<&EntityRecord> {
        self.collections.get(table).and_then(|c| c.get(id))
    }

    pub fn tables(&self) -> impl Iterator<Item = &TableName> {
        self.collections.keys()
    }

    pub fn total_records(&self) -> usize {
        self.collections.values().map(CacheCollection::len).sum()
    }

    pub(crate) fn collection_mut(&mut self, table: &TableName) -> &mut CacheCollection {
        self.collections
            .entry(table.clone())
            .or_insert_with(|| CacheCollection::new(table.clone()))
    }
}

/// A logical cache mutation, delivered to change listeners.
#[derive(Debug, Clone, PartialEq)]
pub enum CacheChange {
    Inserted {
        table: TableName,
        record: EntityRecord,
    },
    Updated {
        table: TableName,
        before: EntityRecord,
        after: EntityRecord,
    },
    Removed {
        table: TableName,
        record: EntityRecord,
    },
    /// A client-generated id was replaced by the server-assigned one.
    Rekeyed {
        table: TableName,
        from: EntityId,
        to: EntityId,
    },
    /// The collection may have diverged and should be resynced.
    Invalidated { table: TableName },
    /// The collection was replaced wholesale from a snapshot.
    Replaced { table: TableName, len: usize },
}

impl CacheChange {
    pub fn table(&self) -> &TableName {
        match self {
            Self::Inserted { table, .. }
            | Self::Updated { table, .. }
            | Self::Removed { table, .. }
            | Self::Rekeyed { table, .. }
            | Self::Invalidated { table }
            | Self::Replaced { table, .. } => table,
        }
    }
}

/// Handle returned by [`ChangeListeners::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

impl fmt::Display for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "listener-{}", self.0)
    }
}

pub type ChangeListener = Box<dyn Fn(&CacheChange) + Send>;

/// Observer list for cache changes. Listeners are looked up at dispatch
/// time, so one registered after a change never sees it and one removed
/// before a change never sees it either.
#[derive(Default)]
pub struct ChangeListeners {
    next_id: u64,
    listeners: Vec<(ListenerId, ChangeListener)>,
}

impl ChangeListeners {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F>(&mut self, listener: F) -> ListenerId
    where
        F: Fn(&CacheChange) + Send + 'static,
    {
        self.next_id += 1;
        let id = ListenerId(self.next_id);
        self.listeners.push((id, Box::new(listener)));
        id
    }

    pub fn unsubscribe(&mut self, id: ListenerId) -> bool {
        let before = self.listeners.len();
        self.listeners.retain(|(existing, _)| *existing != id);
        self.listeners.len() != before
    }

    pub fn notify(&self, change: &CacheChange) {
        for (_, listener) in &self.listeners {
            listener(change);
        }
    }

    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }
}

impl fmt::Debug for ChangeListeners {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChangeListeners")
            .field("count", &self.listeners.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn record(id: &str, content: &str) -> EntityRecord {
        EntityRecord::new(EntityId::new(id).unwrap()).with_field("content", content)
    }

    fn messages() -> CacheCollection {
        CacheCollection::new(TableName::from("messages"))
    }

    #[test]
    fn test_insert_rejects_existing_id() {
        let mut coll = messages();
        assert!(coll.insert(record("m1", "hi")));
        assert!(!coll.insert(record("m1", "other")));
        assert_eq!(coll.len(), 1);
        assert_eq!(coll.get("m1").unwrap().get_str("content"), Some("hi"));
    }

    #[test]
    fn test_upsert_keeps_position() {
        let mut coll = messages();
        coll.insert(record("a", "1"));
        coll.insert(record("b", "2"));
        let prev = coll.upsert(record("a", "changed"));
        assert_eq!(prev.unwrap().get_str("content"), Some("1"));
        let ids: Vec<&str> = coll.ids().map(EntityId::as_str).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert_eq!(coll.iter().next().unwrap().get_str("content"), Some("changed"));
    }

    #[test]
    fn test_remove_and_query() {
        let mut coll = messages();
        coll.insert(record("a", "x"));
        coll.insert(record("b", "y"));
        coll.insert(record("c", "x"));
        assert!(coll.remove("b").is_some());
        assert!(coll.remove("b").is_none());

        let hits = coll.query(|r| r.get_str("content") == Some("x"));
        let ids: Vec<&str> = hits.iter().map(|r| r.id().as_str()).collect();
        assert_eq!(ids, vec!["a", "c"]);
    }

    #[test]
    fn test_bulk_remove_keeps_order_of_survivors() {
        let mut coll = messages();
        for i in 0..1_000 {
            coll.insert(record(&format!("m{i}"), "x"));
        }
        for i in (0..1_000).filter(|i| i % 3 != 0) {
            assert!(coll.remove(&format!("m{i}")).is_some());
        }
        coll.insert(record("m1", "back"));

        assert_eq!(coll.len(), 335);
        let ids: Vec<&str> = coll.ids().map(EntityId::as_str).collect();
        assert_eq!(&ids[..3], &["m0", "m3", "m6"]);
        assert_eq!(ids.last(), Some(&"m1"));
        assert_eq!(coll.iter().count(), 335);
    }

    #[test]
    fn test_rekey_in_place() {
        let mut coll = messages();
        coll.insert(record("tmp", "hi"));
        coll.insert(record("other", "x"));
        assert!(coll.rekey("tmp", EntityId::new("srv-1").unwrap()));
        assert!(!coll.contains("tmp"));
        assert_eq!(coll.get("srv-1").unwrap().get_str("id"), Some("srv-1"));
        assert_eq!(coll.ids().next().unwrap().as_str(), "srv-1");

        assert!(!coll.rekey("srv-1", EntityId::new("other").unwrap()));
        assert!(!coll.rekey("missing", EntityId::new("z").unwrap()));
    }

    #[test]
    fn test_replace_all_dedups_and_clears_stale() {
        let mut coll = messages();
        coll.insert(record("old", "x"));
        coll.mark_stale();
        let dropped = coll.replace_all(vec![record("a", "1"), record("a", "2"), record("b", "3")]);
        assert_eq!(dropped, 1);
        assert_eq!(coll.len(), 2);
        assert!(!coll.contains("old"));
        assert!(!coll.is_stale());
        assert_eq!(coll.get("a").unwrap().get_str("content"), Some("1"));
    }

    #[test]
    fn test_entity_cache_lookup() {
        let mut cache = EntityCache::new();
        cache
            .collection_mut(&TableName::from("messages"))
            .insert(record("m1", "hi"));
        assert!(cache.get("messages", "m1").is_some());
        assert!(cache.get("rooms", "m1").is_none());
        assert!(cache.collection("rooms").is_none());
        assert_eq!(cache.total_records(), 1);
    }

    #[test]
    fn test_listeners_subscribe_unsubscribe() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut listeners = ChangeListeners::new();
        let sink = seen.clone();
        let id = listeners.subscribe(move |change| {
            sink.lock().unwrap().push(change.table().to_string());
        });

        let change = CacheChange::Invalidated {
            table: TableName::from("rooms"),
        };
        listeners.notify(&change);
        assert!(listeners.unsubscribe(id));
        assert!(!listeners.unsubscribe(id));
        listeners.notify(&change);

        assert_eq!(*seen.lock().unwrap(), vec!["rooms".to_string()]);
        assert!(listeners.is_empty());
    }
}
