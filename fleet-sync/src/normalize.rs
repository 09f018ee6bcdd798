//! Validate-or-reject normalization of raw CDC payloads.
//!
//! The transport delivers `{table, eventType, new?, old?}` objects whose
//! shape nobody guarantees. Nothing downstream of this module ever sees a
//! raw payload: it either becomes a [`ChangeEvent`] or a
//! [`MalformedPayload`], and the session turns the latter into a
//! full-collection invalidation so the cache cannot silently drift.
//!
//! ```text
//!  raw JSON ──► object? ──► table? ──► op tag? ──► records? ──► ChangeEvent
//!                 │           │           │            │
//!                 └───────────┴───────────┴────────────┴──► MalformedPayload
//! ```

use fleet_model::{EntityRecord, RecordError, TableName};
use serde_json::Value;
use std::fmt;
use thiserror::Error;
use tokio::time::Instant;

use crate::event::{ChangeEvent, Operation};

/// Field naming the table the change belongs to.
pub const TABLE_FIELD: &str = "table";

/// Operation tag fields, current name first, then legacy aliases.
pub const OPERATION_FIELDS: &[&str] = &["eventType", "type", "event"];

/// Fields carrying the post-change row.
pub const AFTER_FIELDS: &[&str] = &["new", "record"];

/// Fields carrying the pre-change row.
pub const BEFORE_FIELDS: &[&str] = &["old", "old_record"];

/// Which side of the change a record problem was found on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordSide {
    Before,
    After,
}

impl fmt::Display for RecordSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Before => f.write_str("before"),
            Self::After => f.write_str("after"),
        }
    }
}

/// Why a payload was rejected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MalformedReason {
    #[error("payload is not an object")]
    NotAnObject,

    #[error("payload has no table name")]
    MissingTable,

    #[error("payload has no operation tag")]
    MissingOperation,

    #[error("unknown operation `{0}`")]
    UnknownOperation(String),

    #[error("{0} record missing or null")]
    MissingRecord(RecordSide),

    #[error("{side} record invalid: {error}")]
    InvalidRecord { side: RecordSide, error: RecordError },
}

/// A rejected payload. `table` is known whenever the payload got far enough
/// to name one, and scopes the invalidation that follows.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("malformed change payload for {}: {reason}", table.as_ref().map(TableName::as_str).unwrap_or("<unknown table>"))]
pub struct MalformedPayload {
    pub table: Option<TableName>,
    pub reason: MalformedReason,
}

/// Counters over everything the normalizer has seen.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NormalizerStats {
    pub accepted: u64,
    pub rejected: u64,
    pub legacy_tags: u64,
}

#[derive(Debug, Default)]
pub struct ChangeEventNormalizer {
    stats: NormalizerStats,
}

impl ChangeEventNormalizer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Normalize one raw payload. Rejections are logged here and returned;
    /// they never panic.
    pub fn normalize(
        &mut self,
        raw: &Value,
        received_at: Instant,
    ) -> Result<ChangeEvent, MalformedPayload> {
        match self.validate(raw, received_at) {
            Ok(event) => {
                self.stats.accepted += 1;
                log::trace!(
                    "normalized {} on {} for {}",
                    event.operation(),
                    event.table(),
                    event.entity_id()
                );
                Ok(event)
            }
            Err(rejection) => {
                self.stats.rejected += 1;
                log::warn!("Rejected CDC payload: {rejection}");
                Err(rejection)
            }
        }
    }

    pub fn stats(&self) -> NormalizerStats {
        self.stats
    }

    fn validate(&mut self, raw: &Value, received_at: Instant) -> Result<ChangeEvent, MalformedPayload> {
        let reject = |table: Option<TableName>, reason| MalformedPayload { table, reason };

        let Value::Object(obj) = raw else {
            return Err(reject(None, MalformedReason::NotAnObject));
        };

        let table = match obj.get(TABLE_FIELD) {
            Some(Value::String(t)) if !t.is_empty() => TableName::new(t.clone()),
            _ => return Err(reject(None, MalformedReason::MissingTable)),
        };

        let tag = OPERATION_FIELDS
            .iter()
            .enumerate()
            .find_map(|(i, field)| obj.get(*field).and_then(Value::as_str).map(|t| (i, t)));
        let Some((alias_index, tag)) = tag else {
            return Err(reject(Some(table), MalformedReason::MissingOperation));
        };
        let Some(operation) = Operation::parse(tag) else {
            return Err(reject(
                Some(table),
                MalformedReason::UnknownOperation(tag.to_string()),
            ));
        };
        if alias_index > 0 {
            self.stats.legacy_tags += 1;
        }

        let record = |fields: &[&str], side: RecordSide| -> Result<EntityRecord, MalformedReason> {
            let value = fields
                .iter()
                .find_map(|f| obj.get(*f).filter(|v| !v.is_null()))
                .ok_or(MalformedReason::MissingRecord(side))?;
            EntityRecord::from_value(value)
                .map_err(|error| MalformedReason::InvalidRecord { side, error })
        };
        // A `before` image on update is optional; an empty `{}` counts as
        // absent (servers without full replica identity send that).
        let optional_before = || -> Option<EntityRecord> {
            BEFORE_FIELDS
                .iter()
                .find_map(|f| obj.get(*f))
                .and_then(|v| EntityRecord::from_value(v).ok())
        };

        let event = match operation {
            Operation::Insert => {
                let after = record(AFTER_FIELDS, RecordSide::After)
                    .map_err(|r| reject(Some(table.clone()), r))?;
                ChangeEvent::insert(table, after, received_at)
            }
            Operation::Update => {
                let after = record(AFTER_FIELDS, RecordSide::After)
                    .map_err(|r| reject(Some(table.clone()), r))?;
                ChangeEvent::update(table, optional_before(), after, received_at)
            }
            Operation::Delete => {
                let before = record(BEFORE_FIELDS, RecordSide::Before)
                    .map_err(|r| reject(Some(table.clone()), r))?;
                ChangeEvent::delete(table, before, received_at)
            }
        };
        Ok(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn normalize(raw: Value) -> Result<ChangeEvent, MalformedPayload> {
        ChangeEventNormalizer::new().normalize(&raw, Instant::now())
    }

    #[test]
    fn test_insert_accepted() {
        let event = normalize(json!({
            "table": "messages",
            "eventType": "INSERT",
            "new": {"id": "m1", "content": "hi"},
            "old": {}
        }))
        .unwrap();
        assert_eq!(event.operation(), Operation::Insert);
        assert_eq!(event.table().as_str(), "messages");
        assert_eq!(event.entity_id().as_str(), "m1");
        assert_eq!(event.after().unwrap().get_str("content"), Some("hi"));
    }

    #[test]
    fn test_legacy_aliases_accepted() {
        let mut normalizer = ChangeEventNormalizer::new();
        let event = normalizer
            .normalize(
                &json!({"table": "rooms", "type": "update", "record": {"id": "r1"}}),
                Instant::now(),
            )
            .unwrap();
        assert_eq!(event.operation(), Operation::Update);
        assert!(event.before().is_none());

        let event = normalizer
            .normalize(
                &json!({"table": "rooms", "event": "DELETE", "old_record": {"id": "r1"}}),
                Instant::now(),
            )
            .unwrap();
        assert_eq!(event.operation(), Operation::Delete);
        assert_eq!(normalizer.stats().legacy_tags, 2);
        assert_eq!(normalizer.stats().accepted, 2);
    }

    #[test]
    fn test_update_keeps_before_image() {
        let event = normalize(json!({
            "table": "rooms",
            "eventType": "UPDATE",
            "new": {"id": "r1", "name": "b"},
            "old": {"id": "r1", "name": "a"}
        }))
        .unwrap();
        assert_eq!(event.before().unwrap().get_str("name"), Some("a"));
    }

    #[test]
    fn test_rejects_non_object() {
        for raw in [Value::Null, json!("INSERT"), json!([1, 2])] {
            let err = normalize(raw).unwrap_err();
            assert_eq!(err.reason, MalformedReason::NotAnObject);
            assert!(err.table.is_none());
        }
    }

    #[test]
    fn test_rejects_missing_table() {
        let err = normalize(json!({"eventType": "INSERT", "new": {"id": "x"}})).unwrap_err();
        assert_eq!(err.reason, MalformedReason::MissingTable);
    }

    #[test]
    fn test_rejects_missing_or_unknown_operation() {
        let err = normalize(json!({"table": "messages", "new": {"id": "x"}})).unwrap_err();
        assert_eq!(err.reason, MalformedReason::MissingOperation);
        assert_eq!(err.table, Some(TableName::from("messages")));

        let err = normalize(json!({"table": "messages", "eventType": "TRUNCATE"})).unwrap_err();
        assert_eq!(
            err.reason,
            MalformedReason::UnknownOperation("TRUNCATE".into())
        );
    }

    #[test]
    fn test_insert_without_after_rejected() {
        let err = normalize(json!({"table": "messages", "eventType": "INSERT", "new": null}))
            .unwrap_err();
        assert_eq!(err.reason, MalformedReason::MissingRecord(RecordSide::After));
        assert_eq!(err.table, Some(TableName::from("messages")));
    }

    #[test]
    fn test_update_with_empty_id_rejected() {
        let err = normalize(json!({"table": "messages", "eventType": "UPDATE", "new": {"id": ""}}))
            .unwrap_err();
        assert_eq!(
            err.reason,
            MalformedReason::InvalidRecord {
                side: RecordSide::After,
                error: RecordError::EmptyId
            }
        );
    }

    #[test]
    fn test_delete_requires_before_with_id() {
        let err = normalize(json!({"table": "messages", "eventType": "DELETE", "old": {}}))
            .unwrap_err();
        assert_eq!(
            err.reason,
            MalformedReason::InvalidRecord {
                side: RecordSide::Before,
                error: RecordError::MissingId
            }
        );

        let err = normalize(json!({"table": "messages", "eventType": "DELETE"})).unwrap_err();
        assert_eq!(err.reason, MalformedReason::MissingRecord(RecordSide::Before));
    }

    #[test]
    fn test_numeric_id_rejected() {
        let err = normalize(json!({"table": "messages", "eventType": "INSERT", "new": {"id": 5}}))
            .unwrap_err();
        assert!(matches!(err.reason, MalformedReason::InvalidRecord { .. }));
    }

    #[test]
    fn test_rejections_counted() {
        let mut normalizer = ChangeEventNormalizer::new();
        let _ = normalizer.normalize(&Value::Null, Instant::now());
        let _ = normalizer.normalize(&json!({}), Instant::now());
        assert_eq!(normalizer.stats().rejected, 2);
        assert_eq!(normalizer.stats().accepted, 0);
    }

    #[test]
    fn test_error_display_names_table() {
        let err = normalize(json!({"table": "vehicles", "eventType": "INSERT"})).unwrap_err();
        assert!(err.to_string().contains("vehicles"));
        let err = normalize(Value::Null).unwrap_err();
        assert!(err.to_string().contains("<unknown table>"));
    }
}
