use std::sync::Arc;
use tracing::{debug, info, warn};

use super::store::{CheckpointKey, CheckpointRecord, StoreError, TargetStore, UnitOfWork};

/// Per-partition progress for one consumer group and topic.
///
/// The stored value is the last applied broker offset; consumption resumes one
/// past it. Advancing only happens inside a unit of work, so the checkpoint can
/// never get ahead of the data it covers.
#[derive(Clone)]
pub struct CheckpointTracker {
    store: Arc<dyn TargetStore>,
    consumer_group: String,
    topic: String,
}

impl CheckpointTracker {
    pub fn new(store: Arc<dyn TargetStore>, consumer_group: &str, topic: &str) -> Self {
        Self {
            store,
            consumer_group: consumer_group.to_string(),
            topic: topic.to_string(),
        }
    }

    pub fn key(&self, partition: i32) -> CheckpointKey {
        CheckpointKey {
            consumer_group: self.consumer_group.clone(),
            topic: self.topic.clone(),
            partition,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn consumer_group(&self) -> &str {
        &self.consumer_group
    }

    /// Last applied position, or None if the partition never committed.
    pub async fn last_applied(&self, partition: i32) -> Result<Option<i64>, StoreError> {
        self.store.read_checkpoint(&self.key(partition)).await
    }

    /// Offset to resume consumption from.
    pub async fn resume_position(&self, partition: i32) -> Result<Option<i64>, StoreError> {
        let resume = self
            .last_applied(partition)
            .await?
            .map(|position| position.saturating_add(1));

        debug!(
            topic = %self.topic,
            partition,
            resume = ?resume,
            "Resolved resume position"
        );
        Ok(resume)
    }

    /// Advance the checkpoint inside `unit`; takes effect on commit.
    pub async fn advance(
        &self,
        unit: &mut dyn UnitOfWork,
        partition: i32,
        position: i64,
    ) -> Result<(), StoreError> {
        unit.write_checkpoint(&self.key(partition), position).await
    }

    pub async fn list(&self) -> Result<Vec<CheckpointRecord>, StoreError> {
        self.store
            .list_checkpoints(&self.consumer_group, &self.topic)
            .await
    }

    /// Operator reset: the partition restarts from the starting-offset policy.
    pub async fn reset(&self, partition: i32) -> Result<bool, StoreError> {
        let removed = self.store.delete_checkpoint(&self.key(partition)).await?;
        if removed {
            warn!(
                consumer_group = %self.consumer_group,
                topic = %self.topic,
                partition,
                "Checkpoint reset; partition will be reprocessed"
            );
        }
        Ok(removed)
    }

    /// Log stored progress at startup.
    pub async fn log_positions(&self) -> Result<(), StoreError> {
        let records = self.list().await?;
        if records.is_empty() {
            info!(
                consumer_group = %self.consumer_group,
                topic = %self.topic,
                "No stored checkpoints"
            );
        }
        for record in records {
            info!(
                topic = %record.topic,
                partition = record.partition,
                last_applied_position = record.last_applied_position,
                updated_at = %record.updated_at,
                "Stored checkpoint"
            );
        }
        Ok(())
    }
}
