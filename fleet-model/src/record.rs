use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::borrow::Borrow;
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

/// Field carrying the identity of a record.
pub const ID_FIELD: &str = "id";

/// Errors raised while building records.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RecordError {
    #[error("entity id must be a non-empty string")]
    EmptyId,

    #[error("record has no string `id` field")]
    MissingId,

    #[error("record must be a JSON object")]
    NotAnObject,

    #[error("record conversion failed: {0}")]
    Serde(String),
}

/// Stable identity of an entity. Never empty.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct EntityId(String);

impl EntityId {
    pub fn new(id: impl Into<String>) -> Result<Self, RecordError> {
        let id = id.into();
        if id.is_empty() {
            return Err(RecordError::EmptyId);
        }
        Ok(Self(id))
    }

    /// Fresh client-side id, used for optimistic inserts before the server
    /// assigns one.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for EntityId {
    type Error = RecordError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl TryFrom<&str> for EntityId {
    type Error = RecordError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<EntityId> for String {
    fn from(id: EntityId) -> Self {
        id.0
    }
}

impl From<Uuid> for EntityId {
    fn from(id: Uuid) -> Self {
        Self(id.to_string())
    }
}

impl Borrow<str> for EntityId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Name of a server-side relation, e.g. `messages` or `vehicles`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TableName(String);

impl TableName {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for TableName {
    fn from(name: &str) -> Self {
        Self(name.to_string())
    }
}

impl From<String> for TableName {
    fn from(name: String) -> Self {
        Self(name)
    }
}

impl Borrow<str> for TableName {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TableName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Keyed, versionless snapshot of a domain entity.
///
/// `fields` holds every column of the row, including `id`; the cached
/// [`EntityId`] always agrees with `fields["id"]`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EntityRecord {
    #[serde(skip)]
    id: EntityId,
    #[serde(flatten)]
    fields: Map<String, Value>,
}

impl EntityRecord {
    /// Build a record from a row object. The object must carry a non-empty
    /// string `id`.
    pub fn from_object(fields: Map<String, Value>) -> Result<Self, RecordError> {
        let id = match fields.get(ID_FIELD) {
            Some(Value::String(s)) => EntityId::new(s.clone())?,
            _ => return Err(RecordError::MissingId),
        };
        Ok(Self { id, fields })
    }

    pub fn from_value(value: &Value) -> Result<Self, RecordError> {
        match value {
            Value::Object(map) => Self::from_object(map.clone()),
            _ => Err(RecordError::NotAnObject),
        }
    }

    /// Record with only an id; further columns via [`with_field`](Self::with_field).
    pub fn new(id: EntityId) -> Self {
        let mut fields = Map::new();
        fields.insert(ID_FIELD.to_string(), Value::String(id.to_string()));
        Self { id, fields }
    }

    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        let name = name.into();
        if name != ID_FIELD {
            self.fields.insert(name, value.into());
        }
        self
    }

    pub fn id(&self) -> &EntityId {
        &self.id
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    pub fn get_str(&self, field: &str) -> Option<&str> {
        self.fields.get(field).and_then(Value::as_str)
    }

    pub fn fields(&self) -> &Map<String, Value> {
        &self.fields
    }

    pub fn to_value(&self) -> Value {
        Value::Object(self.fields.clone())
    }

    /// Same record under a different identity (server-assigned id replacing
    /// a client-generated one).
    pub fn rekeyed(mut self, id: EntityId) -> Self {
        self.fields
            .insert(ID_FIELD.to_string(), Value::String(id.to_string()));
        self.id = id;
        self
    }

    pub fn from_entity<E: Serialize>(entity: &E) -> Result<Self, RecordError> {
        let value = serde_json::to_value(entity).map_err(|e| RecordError::Serde(e.to_string()))?;
        Self::from_value(&value)
    }

    pub fn to_entity<E: DeserializeOwned>(&self) -> Result<E, RecordError> {
        serde_json::from_value(self.to_value()).map_err(|e| RecordError::Serde(e.to_string()))
    }
}

impl<'de> Deserialize<'de> for EntityRecord {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let fields = Map::<String, Value>::deserialize(deserializer)?;
        Self::from_object(fields).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_entity_id_rejects_empty() {
        assert_eq!(EntityId::new(""), Err(RecordError::EmptyId));
        assert_eq!(EntityId::new("m1").unwrap().as_str(), "m1");
    }

    #[test]
    fn test_generated_ids_distinct() {
        assert_ne!(EntityId::generate(), EntityId::generate());
    }

    #[test]
    fn test_record_from_value() {
        let record = EntityRecord::from_value(&json!({"id": "m1", "content": "hi"})).unwrap();
        assert_eq!(record.id().as_str(), "m1");
        assert_eq!(record.get_str("content"), Some("hi"));
    }

    #[test]
    fn test_record_requires_string_id() {
        assert_eq!(
            EntityRecord::from_value(&json!({"content": "hi"})),
            Err(RecordError::MissingId)
        );
        assert_eq!(
            EntityRecord::from_value(&json!({"id": 7})),
            Err(RecordError::MissingId)
        );
        assert_eq!(
            EntityRecord::from_value(&json!({"id": ""})),
            Err(RecordError::EmptyId)
        );
        assert_eq!(
            EntityRecord::from_value(&json!(["m1"])),
            Err(RecordError::NotAnObject)
        );
    }

    #[test]
    fn test_with_field_cannot_overwrite_id() {
        let record = EntityRecord::new(EntityId::new("a").unwrap()).with_field("id", "b");
        assert_eq!(record.get_str("id"), Some("a"));
    }

    #[test]
    fn test_rekeyed_updates_id_field() {
        let record = EntityRecord::new(EntityId::new("tmp").unwrap()).with_field("content", "hi");
        let rekeyed = record.rekeyed(EntityId::new("srv-1").unwrap());
        assert_eq!(rekeyed.id().as_str(), "srv-1");
        assert_eq!(rekeyed.get_str("id"), Some("srv-1"));
        assert_eq!(rekeyed.get_str("content"), Some("hi"));
    }

    #[test]
    fn test_record_serde_flattened() {
        let record = EntityRecord::new(EntityId::new("r1").unwrap()).with_field("name", "ops");
        let text = serde_json::to_string(&record).unwrap();
        let back: EntityRecord = serde_json::from_str(&text).unwrap();
        assert_eq!(back, record);
        assert!(serde_json::from_str::<EntityRecord>(r#"{"name":"x"}"#).is_err());
    }
}
