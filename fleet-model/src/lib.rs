//! # fleet-model: Entity records for the fleet realtime engine
//!
//! Every collaborative entity (chat rooms, messages, memberships, and the
//! equipment/vehicle records of the fleet side) travels through the sync
//! engine as an [`EntityRecord`]: a keyed, versionless JSON snapshot whose
//! identity is a stable, non-empty [`EntityId`].
//!
//! ```text
//! Room / Message / Membership / Equipment / Vehicle
//!                 │  (serde)
//!                 ▼
//!           EntityRecord { id, fields }
//!                 │
//!                 ▼
//!    fleet-sync CacheCollection (one per TableName)
//! ```
//!
//! Typed entities implement [`Entity`], which names the table they live in
//! and converts to and from records.

pub mod entity;
pub mod record;

pub use entity::{Entity, Equipment, Membership, Message, Room, Vehicle};
pub use record::{EntityId, EntityRecord, RecordError, TableName};
