//! Target store abstraction.
//!
//! A [`UnitOfWork`] is one atomic change against the target database: the row
//! write (or dead letter) and the checkpoint advance commit together or not at
//! all. Dropping a unit without calling `commit` rolls it back.

mod memory;
mod postgres;

pub use memory::{FaultKind, FaultPoint, MemoryStore, StoredRow};
pub use postgres::{classify_sqlstate, PostgresStore};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::str::FromStr;
use thiserror::Error;

use super::schema::ColumnValue;
use crate::error::ErrorClass;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Connection loss, pool exhaustion, statement timeout
    #[error("connection error: {0}")]
    Connection(String),

    /// Unique violation, serialization failure, deadlock, lock not available
    #[error("write conflict: {0}")]
    Conflict(String),

    #[error("foreign key violation: {0}")]
    ForeignKey(String),

    /// Data exception or check/not-null violation
    #[error("invalid data: {0}")]
    InvalidData(String),

    /// Authentication failure, missing table or column
    #[error("fatal store error: {0}")]
    Fatal(String),

    #[error("unit of work already finished")]
    Finished,
}

impl StoreError {
    pub fn class(&self) -> ErrorClass {
        match self {
            StoreError::Connection(_) | StoreError::Conflict(_) => ErrorClass::Transient,
            StoreError::ForeignKey(_) => ErrorClass::Constraint,
            StoreError::InvalidData(_) => ErrorClass::Permanent,
            StoreError::Fatal(_) | StoreError::Finished => ErrorClass::Fatal,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeletePolicy {
    /// Keep the row, set `deleted_at`
    #[default]
    Tombstone,
    /// Remove the row
    Hard,
}

impl FromStr for DeletePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "tombstone" | "soft" => Ok(DeletePolicy::Tombstone),
            "hard" => Ok(DeletePolicy::Hard),
            other => Err(format!("unknown delete policy '{}'", other)),
        }
    }
}

/// Column values for one entity at one position.
#[derive(Debug, Clone, PartialEq)]
pub struct RowWrite {
    pub entity_id: String,
    pub columns: Vec<(String, ColumnValue)>,
    pub position: i64,
}

/// What a guarded write did to the target row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Inserted,
    Updated,
    Deleted,
    /// The row already reflects this or a later position
    Stale,
    /// Delete of an entity that does not exist
    Missing,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CheckpointKey {
    pub consumer_group: String,
    pub topic: String,
    pub partition: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct CheckpointRecord {
    pub consumer_group: String,
    pub topic: String,
    #[sqlx(rename = "partition_id")]
    pub partition: i32,
    pub last_applied_position: i64,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadLetterRecord {
    pub consumer_group: String,
    pub topic: String,
    pub partition: i32,
    pub position: i64,
    pub entity_id: Option<String>,
    pub payload: Option<Vec<u8>>,
    pub reason: String,
    pub error_class: ErrorClass,
    pub attempts: u32,
    pub failed_at: DateTime<Utc>,
}

#[async_trait]
pub trait UnitOfWork: Send {
    /// Insert or update the row unless it already holds `row.position` or later.
    async fn upsert_row(&mut self, row: &RowWrite) -> Result<WriteOutcome, StoreError>;

    /// Delete (or tombstone) the row unless it already holds `position` or later.
    async fn delete_row(
        &mut self,
        entity_id: &str,
        position: i64,
        policy: DeletePolicy,
    ) -> Result<WriteOutcome, StoreError>;

    /// Advance the checkpoint; never lowers a stored value.
    async fn write_checkpoint(&mut self, key: &CheckpointKey, position: i64)
        -> Result<(), StoreError>;

    async fn record_dead_letter(&mut self, record: &DeadLetterRecord) -> Result<(), StoreError>;

    async fn commit(&mut self) -> Result<(), StoreError>;

    async fn rollback(&mut self) -> Result<(), StoreError>;
}

#[async_trait]
pub trait TargetStore: Send + Sync {
    async fn begin(&self) -> Result<Box<dyn UnitOfWork>, StoreError>;

    /// Last applied position, if the partition has ever committed.
    async fn read_checkpoint(&self, key: &CheckpointKey) -> Result<Option<i64>, StoreError>;

    async fn list_checkpoints(
        &self,
        consumer_group: &str,
        topic: &str,
    ) -> Result<Vec<CheckpointRecord>, StoreError>;

    /// Remove a checkpoint (operator reset). Returns whether one existed.
    async fn delete_checkpoint(&self, key: &CheckpointKey) -> Result<bool, StoreError>;

    /// Verify or create the tables the pipeline writes to.
    async fn ensure_schema(&self) -> Result<(), StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_error_classes() {
        assert_eq!(StoreError::Conflict("40001".into()).class(), ErrorClass::Transient);
        assert_eq!(StoreError::InvalidData("22P02".into()).class(), ErrorClass::Permanent);
        assert_eq!(StoreError::Finished.class(), ErrorClass::Fatal);
    }

    #[test]
    fn test_delete_policy_parse() {
        assert_eq!("tombstone".parse::<DeletePolicy>(), Ok(DeletePolicy::Tombstone));
        assert_eq!("HARD".parse::<DeletePolicy>(), Ok(DeletePolicy::Hard));
        assert!("purge".parse::<DeletePolicy>().is_err());
        assert_eq!(DeletePolicy::default(), DeletePolicy::Tombstone);
    }
}
