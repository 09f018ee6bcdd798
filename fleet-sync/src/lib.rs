//! # fleet-sync: Realtime cache synchronization for the fleet/chat client
//!
//! Keeps a local, in-memory copy of server entities (rooms, messages,
//! memberships, equipment, vehicles) in step with the server by consuming
//! row-level change events (CDC) pushed over a realtime relay, plus presence
//! and ephemeral broadcasts on the same connection.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   WebSocket    ┌───────────────┐   Publish   ┌─────────────┐
//! │ SyncSession │ ◄────────────► │ RealtimeServer│ ◄────────── │ DB / CDC    │
//! │ (per user)  │  Binary Proto  │ (relay)       │   (rows)    │ source      │
//! └──────┬──────┘                └───────┬───────┘             └─────────────┘
//!        │                               │
//!        ▼                               ▼
//! ┌─────────────┐                ┌───────────────┐
//! │ EntityCache │                │ Fanout        │
//! │ + pending   │                │ (per-topic    │
//! │ optimistic  │                │  filtering)   │
//! └─────────────┘                └───────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`transport`]: named channels over one connection (WebSocket or in-memory)
//! - [`normalize`]: raw CDC payloads into [`ChangeEvent`]s
//! - [`subscription`]: which channels should be open, from static config and memberships
//! - [`synchronizer`] / [`cache`]: applying change events to the entity cache
//! - [`optimistic`]: local mutations ahead of server confirmation
//! - [`presence`]: who is online, per channel
//! - [`broadcast`]: ephemeral peer events and typing indicators
//! - [`reconnect`]: per-channel backoff after failures
//! - [`session`]: the engine tying all of the above together
//! - [`server`]: the relay a session talks to

pub mod broadcast;
pub mod cache;
pub mod channel;
pub mod config;
pub mod error;
pub mod event;
pub mod handlers;
pub mod membership;
pub mod normalize;
pub mod optimistic;
pub mod persistence;
pub mod presence;
pub mod protocol;
pub mod reconnect;
pub mod server;
pub mod session;
pub mod subscription;
pub mod synchronizer;
pub mod transport;

pub use broadcast::{BroadcastEvent, BroadcastMessenger, TypingChange, TypingIndicators, TypingPayload};
pub use cache::{CacheChange, CacheCollection, EntityCache, ListenerId};
pub use channel::{
    CdcBinding, ChannelHandle, ChannelName, ChannelSpec, ChannelStatus, DeliveryModes, RowFilter,
};
pub use config::{ConfigError, MembershipBinding, ScopedBinding, SyncConfig};
pub use error::{Result, SyncError, WriteError};
pub use event::{ChangeEvent, Operation};
pub use handlers::HandlerId;
pub use membership::MembershipSet;
pub use normalize::{ChangeEventNormalizer, MalformedPayload, MalformedReason};
pub use optimistic::{MutationId, OptimisticOp, PendingOptimisticEntry};
pub use persistence::{MemoryPersistence, PersistenceApi, WriteAck, WriteOp, WriteRequest};
pub use presence::{PresenceDelta, PresenceState, PresenceTracker};
pub use protocol::{MessageType, PresenceMeta, ProtocolError, SyncMessage};
pub use reconnect::{BackoffPolicy, ReconnectController, ReconnectDecision};
pub use server::{RealtimeServer, ServerConfig, ServerStats};
pub use session::{SessionEvent, SessionStats, SyncSession};
pub use subscription::{ChannelPlanner, ReconcileReport, StatusChange, SubscriptionManager};
pub use synchronizer::{ApplyOutcome, CacheSynchronizer, SyncStats};
pub use transport::{
    MemoryRemote, MemoryTransport, Transport, TransportEvent, TransportEventKind, WsOptions,
    WsTransport,
};
