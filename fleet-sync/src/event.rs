//! Validated change events.
//!
//! A [`ChangeEvent`] can only be built with the record(s) its operation
//! requires, so `insert|update ⇒ after` and `delete ⇒ before` hold by
//! construction. Records always carry a valid id.

use fleet_model::{EntityId, EntityRecord, TableName};
use std::fmt;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Insert,
    Update,
    Delete,
}

impl Operation {
    /// Case-insensitive parse of the wire tag.
    pub fn parse(tag: &str) -> Option<Self> {
        if tag.eq_ignore_ascii_case("insert") {
            Some(Self::Insert)
        } else if tag.eq_ignore_ascii_case("update") {
            Some(Self::Update)
        } else if tag.eq_ignore_ascii_case("delete") {
            Some(Self::Delete)
        } else {
            None
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Insert => "INSERT",
            Self::Update => "UPDATE",
            Self::Delete => "DELETE",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Records {
    Insert {
        after: EntityRecord,
    },
    Update {
        before: Option<EntityRecord>,
        after: EntityRecord,
    },
    Delete {
        before: EntityRecord,
    },
}

/// Immutable, normalized row change.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    table: TableName,
    records: Records,
    received_at: Instant,
}

impl ChangeEvent {
    pub fn insert(table: TableName, after: EntityRecord, received_at: Instant) -> Self {
        Self {
            table,
            records: Records::Insert { after },
            received_at,
        }
    }

    pub fn update(
        table: TableName,
        before: Option<EntityRecord>,
        after: EntityRecord,
        received_at: Instant,
    ) -> Self {
        Self {
            table,
            records: Records::Update { before, after },
            received_at,
        }
    }

    pub fn delete(table: TableName, before: EntityRecord, received_at: Instant) -> Self {
        Self {
            table,
            records: Records::Delete { before },
            received_at,
        }
    }

    pub fn table(&self) -> &TableName {
        &self.table
    }

    pub fn operation(&self) -> Operation {
        match self.records {
            Records::Insert { .. } => Operation::Insert,
            Records::Update { .. } => Operation::Update,
            Records::Delete { .. } => Operation::Delete,
        }
    }

    pub fn before(&self) -> Option<&EntityRecord> {
        match &self.records {
            Records::Insert { .. } => None,
            Records::Update { before, .. } => before.as_ref(),
            Records::Delete { before } => Some(before),
        }
    }

    pub fn after(&self) -> Option<&EntityRecord> {
        match &self.records {
            Records::Insert { after } | Records::Update { after, .. } => Some(after),
            Records::Delete { .. } => None,
        }
    }

    pub fn received_at(&self) -> Instant {
        self.received_at
    }

    /// The record the operation is about: `after` for insert/update,
    /// `before` for delete.
    pub fn subject(&self) -> &EntityRecord {
        match &self.records {
            Records::Insert { after } | Records::Update { after, .. } => after,
            Records::Delete { before } => before,
        }
    }

    pub fn entity_id(&self) -> &EntityId {
        self.subject().id()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: &str) -> EntityRecord {
        EntityRecord::new(EntityId::new(id).unwrap())
    }

    #[test]
    fn test_operation_parse() {
        assert_eq!(Operation::parse("INSERT"), Some(Operation::Insert));
        assert_eq!(Operation::parse("update"), Some(Operation::Update));
        assert_eq!(Operation::parse("Delete"), Some(Operation::Delete));
        assert_eq!(Operation::parse("upsert"), None);
        assert_eq!(Operation::Insert.to_string(), "INSERT");
    }

    #[test]
    fn test_subject_per_operation() {
        let now = Instant::now();
        let ins = ChangeEvent::insert("messages".into(), record("a"), now);
        assert_eq!(ins.entity_id().as_str(), "a");
        assert!(ins.before().is_none());

        let upd = ChangeEvent::update("messages".into(), Some(record("old")), record("b"), now);
        assert_eq!(upd.entity_id().as_str(), "b");

        let del = ChangeEvent::delete("messages".into(), record("c"), now);
        assert_eq!(del.entity_id().as_str(), "c");
        assert!(del.after().is_none());
        assert_eq!(del.operation(), Operation::Delete);
    }
}
