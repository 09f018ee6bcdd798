//! Error types surfaced to callers of the engine.
//!
//! Only failures a caller can act on become errors. Malformed CDC payloads
//! and channel failures are recovered inside the engine and show up as
//! session events instead.

use fleet_model::{RecordError, TableName};
use thiserror::Error;

use crate::channel::ChannelName;
use crate::config::ConfigError;
use crate::optimistic::MutationId;
use crate::protocol::ProtocolError;

/// Failure reported by the external persistence API.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WriteError {
    /// The server refused the write (validation, permissions, conflict).
    #[error("write rejected: {0}")]
    Rejected(String),

    /// The write API could not be reached or did not answer.
    #[error("persistence unavailable: {0}")]
    Unavailable(String),
}

/// Session-level errors.
#[derive(Debug, Error)]
pub enum SyncError {
    /// A write failed; the optimistic change has already been rolled back.
    #[error("Write failed: {0}")]
    Write(#[from] WriteError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Invalid record: {0}")]
    Record(#[from] RecordError),

    /// Fetching a snapshot for `table` failed; the collection stays stale.
    #[error("Resync of {table} failed: {source}")]
    Resync { table: TableName, source: WriteError },

    #[error("Unknown mutation {0}")]
    UnknownMutation(MutationId),

    #[error("Mutation {0} already applied")]
    DuplicateMutation(MutationId),

    #[error("Unknown channel {0}")]
    UnknownChannel(ChannelName),

    #[error("No cached record {id} in {table}")]
    MissingRecord { table: TableName, id: String },

    /// The transport event stream was already taken by someone else.
    #[error("Transport event stream unavailable")]
    EventStreamTaken,
}

pub type Result<T> = std::result::Result<T, SyncError>;
