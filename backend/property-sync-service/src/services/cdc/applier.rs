//! Applies decoded change records to the target table inside a unit of work.

use std::sync::Arc;
use tracing::debug;

use super::models::{ChangeOperation, ChangeRecord};
use super::schema::TargetSchema;
use super::store::{DeletePolicy, RowWrite, UnitOfWork, WriteOutcome};
use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// The row already reflects this or a later position
    Stale,
    /// Delete of an entity that was never stored
    MissingEntity,
    /// Broker offset at or below the partition checkpoint
    Duplicate,
    /// Kafka tombstone (null value) following a delete
    BrokerTombstone,
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SkipReason::Stale => "stale",
            SkipReason::MissingEntity => "missing_entity",
            SkipReason::Duplicate => "duplicate",
            SkipReason::BrokerTombstone => "broker_tombstone",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Inserted,
    Updated,
    Deleted,
    Skipped(SkipReason),
}

impl ApplyOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            ApplyOutcome::Inserted => "inserted",
            ApplyOutcome::Updated => "updated",
            ApplyOutcome::Deleted => "deleted",
            ApplyOutcome::Skipped(reason) => reason.as_str(),
        }
    }
}

impl From<WriteOutcome> for ApplyOutcome {
    fn from(outcome: WriteOutcome) -> Self {
        match outcome {
            WriteOutcome::Inserted => ApplyOutcome::Inserted,
            WriteOutcome::Updated => ApplyOutcome::Updated,
            WriteOutcome::Deleted => ApplyOutcome::Deleted,
            WriteOutcome::Stale => ApplyOutcome::Skipped(SkipReason::Stale),
            WriteOutcome::Missing => ApplyOutcome::Skipped(SkipReason::MissingEntity),
        }
    }
}

/// Maps change records onto target rows with last-writer-wins guarding.
pub struct UpsertApplier {
    schema: Arc<TargetSchema>,
    delete_policy: DeletePolicy,
}

impl UpsertApplier {
    pub fn new(schema: Arc<TargetSchema>, delete_policy: DeletePolicy) -> Self {
        Self {
            schema,
            delete_policy,
        }
    }

    pub fn delete_policy(&self) -> DeletePolicy {
        self.delete_policy
    }

    pub async fn apply(
        &self,
        unit: &mut dyn UnitOfWork,
        record: &ChangeRecord,
    ) -> Result<ApplyOutcome> {
        let outcome = match record.operation {
            ChangeOperation::Create | ChangeOperation::Update => {
                let columns = match &record.after_image {
                    Some(image) => self.schema.map_image(image)?,
                    None => Vec::new(),
                };
                let row = RowWrite {
                    entity_id: record.entity_id.clone(),
                    columns,
                    position: record.position,
                };
                unit.upsert_row(&row).await?
            }
            ChangeOperation::Delete => {
                unit.delete_row(&record.entity_id, record.position, self.delete_policy)
                    .await?
            }
        };

        let outcome = ApplyOutcome::from(outcome);
        debug!(
            entity_id = %record.entity_id,
            position = record.position,
            operation = record.operation.as_str(),
            outcome = outcome.label(),
            "Applied change record"
        );
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SyncError;
    use crate::services::cdc::models::CdcSource;
    use crate::services::cdc::schema::ColumnValue;
    use crate::services::cdc::store::{MemoryStore, TargetStore};
    use serde_json::{json, Map, Value};

    fn record(id: &str, operation: ChangeOperation, position: i64, image: Value) -> ChangeRecord {
        let image: Map<String, Value> = image.as_object().cloned().unwrap();
        let (before_image, after_image) = match operation {
            ChangeOperation::Delete => (Some(image), None),
            _ => (None, Some(image)),
        };
        ChangeRecord {
            entity_id: id.to_string(),
            operation,
            before_image,
            after_image,
            position,
            source: CdcSource::default(),
            ts_ms: None,
            snapshot: false,
        }
    }

    fn applier(policy: DeletePolicy) -> UpsertApplier {
        UpsertApplier::new(Arc::new(TargetSchema::properties_default().unwrap()), policy)
    }

    async fn apply_one(
        store: &MemoryStore,
        applier: &UpsertApplier,
        record: &ChangeRecord,
    ) -> Result<ApplyOutcome> {
        let mut unit = store.begin().await?;
        let outcome = applier.apply(unit.as_mut(), record).await?;
        unit.commit().await?;
        Ok(outcome)
    }

    #[tokio::test]
    async fn test_update_touches_only_present_columns() {
        let store = MemoryStore::new();
        let applier = applier(DeletePolicy::Tombstone);

        let create = record(
            "P-1",
            ChangeOperation::Create,
            1,
            json!({"id": "P-1", "ownerName": "Ada", "situsAddr": "1 Main St"}),
        );
        let update = record(
            "P-1",
            ChangeOperation::Update,
            2,
            json!({"id": "P-1", "ownerName": "Grace", "unmapped": 1}),
        );

        assert_eq!(apply_one(&store, &applier, &create).await.unwrap(), ApplyOutcome::Inserted);
        assert_eq!(apply_one(&store, &applier, &update).await.unwrap(), ApplyOutcome::Updated);

        let row = store.live_row("P-1").await.unwrap();
        assert_eq!(row.column("owner_name"), Some(&ColumnValue::Text("Grace".into())));
        assert_eq!(
            row.column("situs_address"),
            Some(&ColumnValue::Text("1 Main St".into()))
        );
        assert!(row.column("unmapped").is_none());
    }

    #[tokio::test]
    async fn test_replay_is_idempotent() {
        let store = MemoryStore::new();
        let applier = applier(DeletePolicy::Tombstone);
        let create = record("P-1", ChangeOperation::Create, 4, json!({"id": "P-1", "ownerName": "Ada"}));

        apply_one(&store, &applier, &create).await.unwrap();
        let before = store.row("P-1").await.unwrap();
        assert_eq!(
            apply_one(&store, &applier, &create).await.unwrap(),
            ApplyOutcome::Skipped(SkipReason::Stale)
        );
        let after = store.row("P-1").await.unwrap();
        assert_eq!(before.columns, after.columns);
        assert_eq!(after.last_applied_position, 4);
    }

    #[tokio::test]
    async fn test_out_of_order_older_change_is_ignored() {
        let store = MemoryStore::new();
        let applier = applier(DeletePolicy::Tombstone);

        let newer = record("P-1", ChangeOperation::Update, 7, json!({"id": "P-1", "ownerName": "Seven"}));
        let older = record("P-1", ChangeOperation::Update, 5, json!({"id": "P-1", "ownerName": "Five"}));

        apply_one(&store, &applier, &newer).await.unwrap();
        assert_eq!(
            apply_one(&store, &applier, &older).await.unwrap(),
            ApplyOutcome::Skipped(SkipReason::Stale)
        );
        assert_eq!(
            store.row("P-1").await.unwrap().column("owner_name"),
            Some(&ColumnValue::Text("Seven".into()))
        );
    }

    #[tokio::test]
    async fn test_delete_semantics() {
        for policy in [DeletePolicy::Tombstone, DeletePolicy::Hard] {
            let store = MemoryStore::new();
            let applier = applier(policy);

            apply_one(
                &store,
                &applier,
                &record("P-1", ChangeOperation::Create, 1, json!({"id": "P-1"})),
            )
            .await
            .unwrap();

            let delete = record("P-1", ChangeOperation::Delete, 2, json!({"id": "P-1"}));
            assert_eq!(apply_one(&store, &applier, &delete).await.unwrap(), ApplyOutcome::Deleted);
            assert!(store.live_row("P-1").await.is_none());

            let missing = record("P-9", ChangeOperation::Delete, 3, json!({"id": "P-9"}));
            assert_eq!(
                apply_one(&store, &applier, &missing).await.unwrap(),
                ApplyOutcome::Skipped(SkipReason::MissingEntity)
            );
            assert!(store.row("P-9").await.is_none());
            assert_eq!(store.live_row_count().await, 0);
        }
    }

    #[tokio::test]
    async fn test_coercion_failure_is_permanent() {
        let store = MemoryStore::new();
        let applier = applier(DeletePolicy::Tombstone);
        let bad = record("P-1", ChangeOperation::Create, 1, json!({"id": "P-1", "yearBuilt": "soon"}));

        let err = apply_one(&store, &applier, &bad).await.unwrap_err();
        assert!(matches!(err, SyncError::Mapping(_)));
        assert!(store.row("P-1").await.is_none());
    }
}
