//! Typed domain entities.
//!
//! Chat (rooms, messages, memberships) and fleet (equipment, vehicles) use
//! the same synchronization pattern; the engine only ever sees them as
//! [`EntityRecord`]s in the collection named by [`Entity::TABLE`].

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::record::{EntityId, EntityRecord, RecordError, TableName};

/// A domain type stored in one server-side table.
pub trait Entity: Serialize + DeserializeOwned {
    /// Table the entity lives in; also the cache collection name.
    const TABLE: &'static str;

    fn id(&self) -> &EntityId;

    fn table() -> TableName {
        TableName::new(Self::TABLE)
    }

    fn to_record(&self) -> Result<EntityRecord, RecordError> {
        EntityRecord::from_entity(self)
    }

    fn from_record(record: &EntityRecord) -> Result<Self, RecordError> {
        record.to_entity()
    }
}

/// Chat room.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Room {
    pub id: EntityId,
    pub name: String,
    pub created_by: String,
    #[serde(default)]
    pub member_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
}

impl Entity for Room {
    const TABLE: &'static str = "rooms";

    fn id(&self) -> &EntityId {
        &self.id
    }
}

/// Chat message posted in a room.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: EntityId,
    pub room_id: String,
    pub sender_id: String,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
}

impl Entity for Message {
    const TABLE: &'static str = "messages";

    fn id(&self) -> &EntityId {
        &self.id
    }
}

/// "User belongs to room" relation. Drives which room channels are open.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Membership {
    pub id: EntityId,
    pub room_id: String,
    pub user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
}

impl Entity for Membership {
    const TABLE: &'static str = "room_members";

    fn id(&self) -> &EntityId {
        &self.id
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Equipment {
    pub id: EntityId,
    pub name: String,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assigned_vehicle_id: Option<String>,
}

impl Entity for Equipment {
    const TABLE: &'static str = "equipment";

    fn id(&self) -> &EntityId {
        &self.id
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Vehicle {
    pub id: EntityId,
    pub plate: String,
    pub model: String,
    pub status: String,
}

impl Entity for Vehicle {
    const TABLE: &'static str = "vehicles";

    fn id(&self) -> &EntityId {
        &self.id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn id(s: &str) -> EntityId {
        EntityId::new(s).unwrap()
    }

    #[test]
    fn test_message_record_conversion() {
        let msg = Message {
            id: id("m1"),
            room_id: "roomA".into(),
            sender_id: "u1".into(),
            content: "hi".into(),
            created_at: None,
        };
        let record = msg.to_record().unwrap();
        assert_eq!(record.id(), &msg.id);
        assert_eq!(record.get_str("content"), Some("hi"));
        assert!(record.get("created_at").is_none());

        let back = Message::from_record(&record).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn test_room_defaults_member_count() {
        let record = EntityRecord::from_value(&json!({
            "id": "roomA",
            "name": "Dispatch",
            "created_by": "u1"
        }))
        .unwrap();
        let room = Room::from_record(&record).unwrap();
        assert_eq!(room.member_count, 0);
    }

    #[test]
    fn test_entity_rejects_empty_id_on_decode() {
        let value = json!({"id": "", "plate": "X", "model": "Y", "status": "idle"});
        assert!(serde_json::from_value::<Vehicle>(value).is_err());
    }

    #[test]
    fn test_tables() {
        assert_eq!(Room::table().as_str(), "rooms");
        assert_eq!(Message::table().as_str(), "messages");
        assert_eq!(Membership::table().as_str(), "room_members");
        assert_eq!(Equipment::table().as_str(), "equipment");
        assert_eq!(Vehicle::table().as_str(), "vehicles");
    }

    #[test]
    fn test_missing_field_fails_typed_decode() {
        let record = EntityRecord::new(id("e1")).with_field("name", "Jack");
        assert!(matches!(
            Equipment::from_record(&record),
            Err(RecordError::Serde(_))
        ));
    }
}
