//! The local user's memberships, derived from the cached membership table.

use std::collections::BTreeSet;

use crate::cache::CacheCollection;

/// Keys of the entities (rooms) the local user belongs to.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MembershipSet(BTreeSet<String>);

/// Symmetric difference between two membership sets.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MembershipDiff {
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub retained: Vec<String>,
}

impl MembershipDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

impl MembershipSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Collect `key_field` of every row whose `user_field` is `user_id`.
    /// Rows without a string key are skipped.
    pub fn from_collection(
        collection: &CacheCollection,
        user_field: &str,
        user_id: &str,
        key_field: &str,
    ) -> Self {
        collection
            .iter()
            .filter(|row| row.get_str(user_field) == Some(user_id))
            .filter_map(|row| row.get_str(key_field))
            .filter(|key| !key.is_empty())
            .map(str::to_string)
            .collect()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.0.contains(key)
    }

    pub fn insert(&mut self, key: impl Into<String>) -> bool {
        self.0.insert(key.into())
    }

    pub fn remove(&mut self, key: &str) -> bool {
        self.0.remove(key)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }

    /// What changes going from `self` to `next`.
    pub fn diff(&self, next: &MembershipSet) -> MembershipDiff {
        MembershipDiff {
            added: next.0.difference(&self.0).cloned().collect(),
            removed: self.0.difference(&next.0).cloned().collect(),
            retained: self.0.intersection(&next.0).cloned().collect(),
        }
    }
}

impl<S: Into<String>> FromIterator<S> for MembershipSet {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Self(iter.into_iter().map(Into::into).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_model::{EntityId, EntityRecord, TableName};

    fn member(id: &str, room: &str, user: &str) -> EntityRecord {
        EntityRecord::new(EntityId::new(id).unwrap())
            .with_field("room_id", room)
            .with_field("user_id", user)
    }

    #[test]
    fn test_from_collection_filters_user() {
        let mut coll = CacheCollection::new(TableName::from("room_members"));
        coll.insert(member("1", "roomA", "me"));
        coll.insert(member("2", "roomB", "someone"));
        coll.insert(member("3", "roomC", "me"));
        coll.insert(EntityRecord::new(EntityId::new("4").unwrap()).with_field("user_id", "me"));

        let set = MembershipSet::from_collection(&coll, "user_id", "me", "room_id");
        assert_eq!(set.iter().collect::<Vec<_>>(), vec!["roomA", "roomC"]);
    }

    #[test]
    fn test_diff() {
        let before: MembershipSet = ["roomA", "roomB"].into_iter().collect();
        let after: MembershipSet = ["roomB", "roomC"].into_iter().collect();
        let diff = before.diff(&after);
        assert_eq!(diff.added, vec!["roomC"]);
        assert_eq!(diff.removed, vec!["roomA"]);
        assert_eq!(diff.retained, vec!["roomB"]);
        assert!(!diff.is_empty());
        assert!(after.diff(&after).is_empty());
    }

    #[test]
    fn test_remove_and_readd_is_no_change() {
        let before: MembershipSet = ["roomA"].into_iter().collect();
        let mut next = before.clone();
        next.remove("roomA");
        next.insert("roomA");
        let diff = before.diff(&next);
        assert!(diff.is_empty());
        assert_eq!(diff.retained, vec!["roomA"]);
    }
}
