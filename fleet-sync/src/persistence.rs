//! The external persistence API, as seen by the engine.
//!
//! The engine only needs two things from it: a write that either fails or
//! returns the server-assigned id (the one the confirming CDC event will
//! carry), and a full snapshot of a table for resync.

use async_trait::async_trait;
use fleet_model::{EntityId, EntityRecord, TableName};
use std::collections::HashMap;
use tokio::sync::RwLock;

use crate::error::WriteError;
use crate::optimistic::MutationId;

#[derive(Debug, Clone, PartialEq)]
pub enum WriteOp {
    Create(EntityRecord),
    Update(EntityRecord),
    Delete(EntityId),
}

impl WriteOp {
    pub fn target_id(&self) -> &EntityId {
        match self {
            Self::Create(record) | Self::Update(record) => record.id(),
            Self::Delete(id) => id,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct WriteRequest {
    pub table: TableName,
    pub op: WriteOp,
    /// Idempotency key for the write.
    pub mutation_id: MutationId,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteAck {
    /// Server id of the written record.
    pub id: EntityId,
}

#[async_trait]
pub trait PersistenceApi: Send + Sync {
    async fn write(&self, request: WriteRequest) -> Result<WriteAck, WriteError>;

    /// Every record of a table, in server order.
    async fn fetch(&self, table: &TableName) -> Result<Vec<EntityRecord>, WriteError>;
}

/// In-process persistence for embedding and tests.
///
/// Writes are applied to in-memory tables, so a later `fetch` sees them.
#[derive(Debug, Default)]
pub struct MemoryPersistence {
    tables: RwLock<HashMap<TableName, Vec<EntityRecord>>>,
    writes: RwLock<Vec<WriteRequest>>,
    failure: RwLock<Option<WriteError>>,
    server_ids: bool,
}

impl MemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates get a fresh server id instead of keeping the client's.
    pub fn with_server_ids(mut self) -> Self {
        self.server_ids = true;
        self
    }

    pub fn with_table(mut self, table: impl Into<TableName>, records: Vec<EntityRecord>) -> Self {
        self.tables.get_mut().insert(table.into(), records);
        self
    }

    /// Make every following call fail with `error` (`None` heals).
    pub async fn set_failure(&self, error: Option<WriteError>) {
        *self.failure.write().await = error;
    }

    /// Every write accepted or refused so far.
    pub async fn writes(&self) -> Vec<WriteRequest> {
        self.writes.read().await.clone()
    }

    pub async fn records(&self, table: &str) -> Vec<EntityRecord> {
        self.tables
            .read()
            .await
            .get(table)
            .cloned()
            .unwrap_or_default()
    }

    async fn check_failure(&self) -> Result<(), WriteError> {
        match self.failure.read().await.clone() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl PersistenceApi for MemoryPersistence {
    async fn write(&self, request: WriteRequest) -> Result<WriteAck, WriteError> {
        self.writes.write().await.push(request.clone());
        self.check_failure().await?;

        let mut tables = self.tables.write().await;
        let rows = tables.entry(request.table.clone()).or_default();
        match request.op {
            WriteOp::Create(record) => {
                let record = if self.server_ids {
                    record.rekeyed(EntityId::generate())
                } else {
                    record
                };
                if rows.iter().any(|r| r.id() == record.id()) {
                    return Err(WriteError::Rejected(format!(
                        "{} {} already exists",
                        request.table,
                        record.id()
                    )));
                }
                let id = record.id().clone();
                rows.push(record);
                Ok(WriteAck { id })
            }
            WriteOp::Update(record) => {
                let id = record.id().clone();
                match rows.iter_mut().find(|r| r.id() == &id) {
                    Some(row) => *row = record,
                    None => rows.push(record),
                }
                Ok(WriteAck { id })
            }
            WriteOp::Delete(id) => {
                let before = rows.len();
                rows.retain(|r| r.id() != &id);
                if rows.len() == before {
                    return Err(WriteError::Rejected(format!(
                        "{} {id} does not exist",
                        request.table
                    )));
                }
                Ok(WriteAck { id })
            }
        }
    }

    async fn fetch(&self, table: &TableName) -> Result<Vec<EntityRecord>, WriteError> {
        self.check_failure().await?;
        Ok(self.records(table.as_str()).await)
    }
}
