//! In-memory target store.
//!
//! Mirrors the PostgreSQL store's guarded-write semantics. A unit of work holds
//! the store lock for its lifetime and edits a private copy of the state, so an
//! uncommitted unit leaves nothing behind. Faults can be injected at each step
//! to exercise the worker's retry and atomicity paths.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::{Mutex, OwnedMutexGuard};

use super::{
    CheckpointKey, CheckpointRecord, DeadLetterRecord, DeletePolicy, RowWrite, StoreError,
    TargetStore, UnitOfWork, WriteOutcome,
};
use crate::services::cdc::schema::ColumnValue;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultPoint {
    Begin,
    Upsert,
    Delete,
    CheckpointWrite,
    DeadLetter,
    Commit,
    ReadCheckpoint,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    Connection,
    Conflict,
    ForeignKey,
    InvalidData,
    Fatal,
}

impl FaultKind {
    fn to_error(self, point: FaultPoint) -> StoreError {
        let detail = format!("injected at {:?}", point);
        match self {
            FaultKind::Connection => StoreError::Connection(detail),
            FaultKind::Conflict => StoreError::Conflict(detail),
            FaultKind::ForeignKey => StoreError::ForeignKey(detail),
            FaultKind::InvalidData => StoreError::InvalidData(detail),
            FaultKind::Fatal => StoreError::Fatal(detail),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StoredRow {
    pub columns: BTreeMap<String, ColumnValue>,
    pub last_applied_position: i64,
    pub deleted_at: Option<DateTime<Utc>>,
    pub synced_at: DateTime<Utc>,
}

impl StoredRow {
    pub fn column(&self, name: &str) -> Option<&ColumnValue> {
        self.columns.get(name)
    }

    pub fn is_live(&self) -> bool {
        self.deleted_at.is_none()
    }
}

#[derive(Debug, Clone, Default)]
struct MemoryState {
    rows: BTreeMap<String, StoredRow>,
    checkpoints: BTreeMap<CheckpointKey, CheckpointRecord>,
    dead_letters: Vec<DeadLetterRecord>,
    commits: u64,
}

#[derive(Debug)]
struct Fault {
    point: FaultPoint,
    kind: FaultKind,
    remaining: u32,
}

#[derive(Debug, Default)]
struct Faults {
    pending: Vec<Fault>,
}

impl Faults {
    fn check(&mut self, point: FaultPoint) -> Result<(), StoreError> {
        if let Some(fault) = self
            .pending
            .iter_mut()
            .find(|f| f.point == point && f.remaining > 0)
        {
            fault.remaining -= 1;
            return Err(fault.kind.to_error(point));
        }
        Ok(())
    }
}

/// Shared in-memory store; clones see the same state.
#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
    faults: Arc<StdMutex<Faults>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `times` operations at `point` with `kind`.
    pub fn inject_fault(&self, point: FaultPoint, kind: FaultKind, times: u32) {
        if let Ok(mut faults) = self.faults.lock() {
            faults.pending.push(Fault {
                point,
                kind,
                remaining: times,
            });
        }
    }

    pub fn clear_faults(&self) {
        if let Ok(mut faults) = self.faults.lock() {
            faults.pending.clear();
        }
    }

    fn check_fault(&self, point: FaultPoint) -> Result<(), StoreError> {
        match self.faults.lock() {
            Ok(mut faults) => faults.check(point),
            Err(_) => Err(StoreError::Fatal("fault registry poisoned".to_string())),
        }
    }

    /// Row including tombstoned ones.
    pub async fn row(&self, entity_id: &str) -> Option<StoredRow> {
        self.state.lock().await.rows.get(entity_id).cloned()
    }

    /// Row as readers of the target table see it (tombstones hidden).
    pub async fn live_row(&self, entity_id: &str) -> Option<StoredRow> {
        self.row(entity_id).await.filter(StoredRow::is_live)
    }

    pub async fn live_row_count(&self) -> usize {
        self.state
            .lock()
            .await
            .rows
            .values()
            .filter(|r| r.is_live())
            .count()
    }

    pub async fn dead_letters(&self) -> Vec<DeadLetterRecord> {
        self.state.lock().await.dead_letters.clone()
    }

    pub async fn commit_count(&self) -> u64 {
        self.state.lock().await.commits
    }
}

pub struct MemoryUnit {
    guard: Option<OwnedMutexGuard<MemoryState>>,
    working: MemoryState,
    store: MemoryStore,
}

impl MemoryUnit {
    fn working(&mut self) -> Result<&mut MemoryState, StoreError> {
        if self.guard.is_some() {
            Ok(&mut self.working)
        } else {
            Err(StoreError::Finished)
        }
    }
}

#[async_trait]
impl UnitOfWork for MemoryUnit {
    async fn upsert_row(&mut self, row: &RowWrite) -> Result<WriteOutcome, StoreError> {
        self.store.check_fault(FaultPoint::Upsert)?;
        let now = Utc::now();
        let state = self.working()?;

        match state.rows.get_mut(&row.entity_id) {
            Some(existing) if existing.last_applied_position >= row.position => {
                Ok(WriteOutcome::Stale)
            }
            Some(existing) => {
                for (column, value) in &row.columns {
                    existing.columns.insert(column.clone(), value.clone());
                }
                existing.last_applied_position = row.position;
                existing.deleted_at = None;
                existing.synced_at = now;
                Ok(WriteOutcome::Updated)
            }
            None => {
                state.rows.insert(
                    row.entity_id.clone(),
                    StoredRow {
                        columns: row.columns.iter().cloned().collect(),
                        last_applied_position: row.position,
                        deleted_at: None,
                        synced_at: now,
                    },
                );
                Ok(WriteOutcome::Inserted)
            }
        }
    }

    async fn delete_row(
        &mut self,
        entity_id: &str,
        position: i64,
        policy: DeletePolicy,
    ) -> Result<WriteOutcome, StoreError> {
        self.store.check_fault(FaultPoint::Delete)?;
        let now = Utc::now();
        let state = self.working()?;

        let Some(existing) = state.rows.get_mut(entity_id) else {
            return Ok(WriteOutcome::Missing);
        };
        if existing.last_applied_position >= position {
            return Ok(WriteOutcome::Stale);
        }

        match policy {
            DeletePolicy::Tombstone => {
                existing.deleted_at = Some(now);
                existing.last_applied_position = position;
                existing.synced_at = now;
            }
            DeletePolicy::Hard => {
                state.rows.remove(entity_id);
            }
        }
        Ok(WriteOutcome::Deleted)
    }

    async fn write_checkpoint(
        &mut self,
        key: &CheckpointKey,
        position: i64,
    ) -> Result<(), StoreError> {
        self.store.check_fault(FaultPoint::CheckpointWrite)?;
        let now = Utc::now();
        let state = self.working()?;

        let entry = state
            .checkpoints
            .entry(key.clone())
            .or_insert_with(|| CheckpointRecord {
                consumer_group: key.consumer_group.clone(),
                topic: key.topic.clone(),
                partition: key.partition,
                last_applied_position: position,
                updated_at: now,
            });
        entry.last_applied_position = entry.last_applied_position.max(position);
        entry.updated_at = now;
        Ok(())
    }

    async fn record_dead_letter(&mut self, record: &DeadLetterRecord) -> Result<(), StoreError> {
        self.store.check_fault(FaultPoint::DeadLetter)?;
        let state = self.working()?;

        let duplicate = state.dead_letters.iter().any(|d| {
            d.consumer_group == record.consumer_group
                && d.topic == record.topic
                && d.partition == record.partition
                && d.position == record.position
        });
        if !duplicate {
            state.dead_letters.push(record.clone());
        }
        Ok(())
    }

    async fn commit(&mut self) -> Result<(), StoreError> {
        if self.guard.is_none() {
            return Err(StoreError::Finished);
        }
        self.store.check_fault(FaultPoint::Commit)?;

        if let Some(mut guard) = self.guard.take() {
            let mut committed = std::mem::take(&mut self.working);
            committed.commits += 1;
            *guard = committed;
        }
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), StoreError> {
        self.guard.take();
        Ok(())
    }
}

#[async_trait]
impl TargetStore for MemoryStore {
    async fn begin(&self) -> Result<Box<dyn UnitOfWork>, StoreError> {
        self.check_fault(FaultPoint::Begin)?;
        let guard = self.state.clone().lock_owned().await;
        let working = guard.clone();

        Ok(Box::new(MemoryUnit {
            guard: Some(guard),
            working,
            store: self.clone(),
        }))
    }

    async fn read_checkpoint(&self, key: &CheckpointKey) -> Result<Option<i64>, StoreError> {
        self.check_fault(FaultPoint::ReadCheckpoint)?;
        Ok(self
            .state
            .lock()
            .await
            .checkpoints
            .get(key)
            .map(|c| c.last_applied_position))
    }

    async fn list_checkpoints(
        &self,
        consumer_group: &str,
        topic: &str,
    ) -> Result<Vec<CheckpointRecord>, StoreError> {
        Ok(self
            .state
            .lock()
            .await
            .checkpoints
            .values()
            .filter(|c| c.consumer_group == consumer_group && c.topic == topic)
            .cloned()
            .collect())
    }

    async fn delete_checkpoint(&self, key: &CheckpointKey) -> Result<bool, StoreError> {
        Ok(self.state.lock().await.checkpoints.remove(key).is_some())
    }

    async fn ensure_schema(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(partition: i32) -> CheckpointKey {
        CheckpointKey {
            consumer_group: "g".into(),
            topic: "t".into(),
            partition,
        }
    }

    fn row(id: &str, position: i64, owner: &str) -> RowWrite {
        RowWrite {
            entity_id: id.into(),
            columns: vec![("owner_name".into(), ColumnValue::Text(owner.into()))],
            position,
        }
    }

    #[tokio::test]
    async fn test_uncommitted_unit_leaves_nothing() {
        let store = MemoryStore::new();
        {
            let mut unit = store.begin().await.unwrap();
            unit.upsert_row(&row("a", 1, "x")).await.unwrap();
            unit.write_checkpoint(&key(0), 1).await.unwrap();
        }

        assert!(store.row("a").await.is_none());
        assert_eq!(store.read_checkpoint(&key(0)).await.unwrap(), None);
        assert_eq!(store.commit_count().await, 0);
    }

    #[tokio::test]
    async fn test_guarded_upsert() {
        let store = MemoryStore::new();
        let mut unit = store.begin().await.unwrap();
        assert_eq!(unit.upsert_row(&row("a", 7, "new")).await.unwrap(), WriteOutcome::Inserted);
        assert_eq!(unit.upsert_row(&row("a", 5, "old")).await.unwrap(), WriteOutcome::Stale);
        assert_eq!(unit.upsert_row(&row("a", 7, "new")).await.unwrap(), WriteOutcome::Stale);
        assert_eq!(unit.upsert_row(&row("a", 8, "newer")).await.unwrap(), WriteOutcome::Updated);
        unit.commit().await.unwrap();

        let stored = store.row("a").await.unwrap();
        assert_eq!(stored.last_applied_position, 8);
        assert_eq!(
            stored.column("owner_name"),
            Some(&ColumnValue::Text("newer".into()))
        );
    }

    #[tokio::test]
    async fn test_tombstone_and_revive() {
        let store = MemoryStore::new();
        let mut unit = store.begin().await.unwrap();
        unit.upsert_row(&row("a", 1, "x")).await.unwrap();
        assert_eq!(
            unit.delete_row("a", 2, DeletePolicy::Tombstone).await.unwrap(),
            WriteOutcome::Deleted
        );
        assert_eq!(
            unit.delete_row("missing", 3, DeletePolicy::Tombstone).await.unwrap(),
            WriteOutcome::Missing
        );
        unit.commit().await.unwrap();

        assert!(store.live_row("a").await.is_none());
        assert!(store.row("a").await.is_some());
        assert!(store.row("missing").await.is_none());

        let mut unit = store.begin().await.unwrap();
        assert_eq!(unit.upsert_row(&row("a", 4, "back")).await.unwrap(), WriteOutcome::Updated);
        unit.commit().await.unwrap();
        assert!(store.live_row("a").await.is_some());
    }

    #[tokio::test]
    async fn test_checkpoint_is_monotonic() {
        let store = MemoryStore::new();
        let mut unit = store.begin().await.unwrap();
        unit.write_checkpoint(&key(0), 10).await.unwrap();
        unit.write_checkpoint(&key(0), 4).await.unwrap();
        unit.commit().await.unwrap();

        assert_eq!(store.read_checkpoint(&key(0)).await.unwrap(), Some(10));
        assert!(store.delete_checkpoint(&key(0)).await.unwrap());
        assert_eq!(store.read_checkpoint(&key(0)).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_commit_fault_discards_unit() {
        let store = MemoryStore::new();
        store.inject_fault(FaultPoint::Commit, FaultKind::Connection, 1);

        let mut unit = store.begin().await.unwrap();
        unit.upsert_row(&row("a", 1, "x")).await.unwrap();
        unit.write_checkpoint(&key(0), 1).await.unwrap();
        assert!(matches!(unit.commit().await, Err(StoreError::Connection(_))));
        drop(unit);

        assert!(store.row("a").await.is_none());
        assert_eq!(store.read_checkpoint(&key(0)).await.unwrap(), None);

        let mut unit = store.begin().await.unwrap();
        unit.upsert_row(&row("a", 1, "x")).await.unwrap();
        unit.commit().await.unwrap();
        assert!(matches!(unit.commit().await, Err(StoreError::Finished)));
        assert!(store.row("a").await.is_some());
    }
}
