use async_trait::async_trait;
use db_pool::acquire_with_metrics;
use sqlx::{PgPool, Postgres, QueryBuilder, Transaction};
use tracing::{debug, error, info};

use super::{
    CheckpointKey, CheckpointRecord, DeadLetterRecord, DeletePolicy, RowWrite, StoreError,
    TargetStore, UnitOfWork, WriteOutcome,
};
use crate::services::cdc::schema::{ColumnKind, ColumnValue, TargetSchema};

/// Map a PostgreSQL SQLSTATE to a store error.
pub fn classify_sqlstate(code: &str, message: String) -> StoreError {
    match code {
        // foreign_key_violation
        "23503" => StoreError::ForeignKey(message),
        // unique_violation, serialization_failure, deadlock_detected, lock_not_available
        "23505" | "40001" | "40P01" | "55P03" => StoreError::Conflict(message),
        // query_canceled (statement_timeout), admin/crash shutdown, cannot_connect_now
        "57014" | "57P01" | "57P02" | "57P03" => StoreError::Connection(message),
        c if c.starts_with("22") || c.starts_with("23") => StoreError::InvalidData(message),
        // connection exceptions, insufficient resources
        c if c.starts_with("08") || c.starts_with("53") => StoreError::Connection(message),
        // invalid authorization, invalid catalog, syntax/undefined object, privileges
        c if c.starts_with("28") || c.starts_with("3D") || c.starts_with("42") => {
            StoreError::Fatal(message)
        }
        _ => StoreError::Connection(message),
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        let message = err.to_string();
        match &err {
            sqlx::Error::Database(db_err) => match db_err.code() {
                Some(code) => classify_sqlstate(&code, message),
                None => StoreError::Connection(message),
            },
            sqlx::Error::PoolClosed
            | sqlx::Error::Configuration(_)
            | sqlx::Error::ColumnNotFound(_)
            | sqlx::Error::ColumnDecode { .. }
            | sqlx::Error::TypeNotFound { .. } => StoreError::Fatal(message),
            _ => StoreError::Connection(message),
        }
    }
}

/// PostgreSQL target store.
///
/// Table and column names come from a validated [`TargetSchema`]; values are
/// always bound.
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
    table: String,
    key_column: String,
    service_name: String,
}

impl PostgresStore {
    pub fn new(pool: PgPool, schema: &TargetSchema, service_name: &str) -> Self {
        Self {
            pool,
            table: schema.table.clone(),
            key_column: schema.key_column.clone(),
            service_name: service_name.to_string(),
        }
    }
}

pub struct PostgresUnit {
    tx: Option<Transaction<'static, Postgres>>,
    table: String,
    key_column: String,
}

impl PostgresUnit {
    fn tx(&mut self) -> Result<&mut Transaction<'static, Postgres>, StoreError> {
        self.tx.as_mut().ok_or(StoreError::Finished)
    }
}

fn push_column_value(qb: &mut QueryBuilder<'_, Postgres>, value: &ColumnValue) {
    match value.clone() {
        ColumnValue::Null(kind) => match kind {
            ColumnKind::Text => qb.push_bind(None::<String>),
            ColumnKind::Integer => qb.push_bind(None::<i64>),
            ColumnKind::Float => qb.push_bind(None::<f64>),
            ColumnKind::Boolean => qb.push_bind(None::<bool>),
            ColumnKind::Timestamp => qb.push_bind(None::<chrono::DateTime<chrono::Utc>>),
            ColumnKind::Json => qb.push_bind(None::<sqlx::types::Json<serde_json::Value>>),
        },
        ColumnValue::Text(v) => qb.push_bind(v),
        ColumnValue::Integer(v) => qb.push_bind(v),
        ColumnValue::Float(v) => qb.push_bind(v),
        ColumnValue::Boolean(v) => qb.push_bind(v),
        ColumnValue::Timestamp(v) => qb.push_bind(v),
        ColumnValue::Json(v) => qb.push_bind(sqlx::types::Json(v)),
    };
}

#[async_trait]
impl UnitOfWork for PostgresUnit {
    async fn upsert_row(&mut self, row: &RowWrite) -> Result<WriteOutcome, StoreError> {
        let table = self.table.clone();
        let key = self.key_column.clone();

        let mut qb: QueryBuilder<'_, Postgres> = QueryBuilder::new("INSERT INTO ");
        qb.push(&table).push(" (").push(&key);
        for (column, _) in &row.columns {
            qb.push(", ").push(column);
        }
        qb.push(", last_applied_position, deleted_at, synced_at) VALUES (");
        qb.push_bind(row.entity_id.clone());
        for (_, value) in &row.columns {
            qb.push(", ");
            push_column_value(&mut qb, value);
        }
        qb.push(", ").push_bind(row.position);
        qb.push(", NULL, NOW()) ON CONFLICT (").push(&key).push(") DO UPDATE SET ");
        for (column, _) in &row.columns {
            qb.push(column).push(" = EXCLUDED.").push(column).push(", ");
        }
        qb.push("last_applied_position = EXCLUDED.last_applied_position, ")
            .push("deleted_at = NULL, synced_at = NOW() WHERE ")
            .push(&table)
            .push(".last_applied_position < EXCLUDED.last_applied_position ")
            .push("RETURNING (xmax = 0) AS inserted");

        let inserted = qb
            .build_query_scalar::<bool>()
            .fetch_optional(&mut **self.tx()?)
            .await?;

        Ok(match inserted {
            Some(true) => WriteOutcome::Inserted,
            Some(false) => WriteOutcome::Updated,
            None => WriteOutcome::Stale,
        })
    }

    async fn delete_row(
        &mut self,
        entity_id: &str,
        position: i64,
        policy: DeletePolicy,
    ) -> Result<WriteOutcome, StoreError> {
        let statement = match policy {
            DeletePolicy::Tombstone => format!(
                "UPDATE {table} SET deleted_at = NOW(), last_applied_position = $2, \
                 synced_at = NOW() WHERE {key} = $1 AND last_applied_position < $2",
                table = self.table,
                key = self.key_column
            ),
            DeletePolicy::Hard => format!(
                "DELETE FROM {table} WHERE {key} = $1 AND last_applied_position < $2",
                table = self.table,
                key = self.key_column
            ),
        };
        let exists_query = format!(
            "SELECT EXISTS (SELECT 1 FROM {table} WHERE {key} = $1)",
            table = self.table,
            key = self.key_column
        );

        let tx = self.tx()?;
        let affected = sqlx::query(&statement)
            .bind(entity_id)
            .bind(position)
            .execute(&mut **tx)
            .await?
            .rows_affected();

        if affected > 0 {
            return Ok(WriteOutcome::Deleted);
        }

        let exists: bool = sqlx::query_scalar(&exists_query)
            .bind(entity_id)
            .fetch_one(&mut **tx)
            .await?;

        Ok(if exists {
            WriteOutcome::Stale
        } else {
            WriteOutcome::Missing
        })
    }

    async fn write_checkpoint(
        &mut self,
        key: &CheckpointKey,
        position: i64,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO cdc_checkpoints (consumer_group, topic, partition_id, last_applied_position, updated_at)
            VALUES ($1, $2, $3, $4, NOW())
            ON CONFLICT (consumer_group, topic, partition_id)
            DO UPDATE SET
                last_applied_position = GREATEST(cdc_checkpoints.last_applied_position, EXCLUDED.last_applied_position),
                updated_at = NOW()
            "#,
        )
        .bind(&key.consumer_group)
        .bind(&key.topic)
        .bind(key.partition)
        .bind(position)
        .execute(&mut **self.tx()?)
        .await?;

        Ok(())
    }

    async fn record_dead_letter(&mut self, record: &DeadLetterRecord) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO cdc_dead_letters
                (consumer_group, topic, partition_id, position, entity_id, payload, reason, error_class, attempts, failed_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (consumer_group, topic, partition_id, position) DO NOTHING
            "#,
        )
        .bind(&record.consumer_group)
        .bind(&record.topic)
        .bind(record.partition)
        .bind(record.position)
        .bind(record.entity_id.as_deref())
        .bind(record.payload.as_deref())
        .bind(&record.reason)
        .bind(record.error_class.as_str())
        .bind(i32::try_from(record.attempts).unwrap_or(i32::MAX))
        .bind(record.failed_at)
        .execute(&mut **self.tx()?)
        .await?;

        Ok(())
    }

    async fn commit(&mut self) -> Result<(), StoreError> {
        let tx = self.tx.take().ok_or(StoreError::Finished)?;
        tx.commit().await?;
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), StoreError> {
        if let Some(tx) = self.tx.take() {
            tx.rollback().await?;
        }
        Ok(())
    }
}

#[async_trait]
impl TargetStore for PostgresStore {
    async fn begin(&self) -> Result<Box<dyn UnitOfWork>, StoreError> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PostgresUnit {
            tx: Some(tx),
            table: self.table.clone(),
            key_column: self.key_column.clone(),
        }))
    }

    async fn read_checkpoint(&self, key: &CheckpointKey) -> Result<Option<i64>, StoreError> {
        let mut conn = acquire_with_metrics(&self.pool, &self.service_name).await?;

        let position = sqlx::query_scalar::<_, i64>(
            r#"
            SELECT last_applied_position FROM cdc_checkpoints
            WHERE consumer_group = $1 AND topic = $2 AND partition_id = $3
            "#,
        )
        .bind(&key.consumer_group)
        .bind(&key.topic)
        .bind(key.partition)
        .fetch_optional(&mut *conn)
        .await?;

        debug!(
            topic = %key.topic,
            partition = key.partition,
            checkpoint = ?position,
            "Read checkpoint"
        );
        Ok(position)
    }

    async fn list_checkpoints(
        &self,
        consumer_group: &str,
        topic: &str,
    ) -> Result<Vec<CheckpointRecord>, StoreError> {
        let records = sqlx::query_as::<_, CheckpointRecord>(
            r#"
            SELECT consumer_group, topic, partition_id, last_applied_position, updated_at
            FROM cdc_checkpoints
            WHERE consumer_group = $1 AND topic = $2
            ORDER BY partition_id ASC
            "#,
        )
        .bind(consumer_group)
        .bind(topic)
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    async fn delete_checkpoint(&self, key: &CheckpointKey) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            DELETE FROM cdc_checkpoints
            WHERE consumer_group = $1 AND topic = $2 AND partition_id = $3
            "#,
        )
        .bind(&key.consumer_group)
        .bind(&key.topic)
        .bind(key.partition)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Migrations create the tables; this only confirms they are reachable
    /// with the configured names before any partition starts.
    async fn ensure_schema(&self) -> Result<(), StoreError> {
        for table in [self.table.as_str(), "cdc_checkpoints", "cdc_dead_letters"] {
            let exists: bool = sqlx::query_scalar("SELECT to_regclass($1) IS NOT NULL")
                .bind(table)
                .fetch_one(&self.pool)
                .await?;

            if !exists {
                error!(table, "Target table is missing");
                return Err(StoreError::Fatal(format!("table '{}' does not exist", table)));
            }
        }

        let column_check = format!(
            "SELECT {key}, last_applied_position, deleted_at, synced_at FROM {table} LIMIT 0",
            key = self.key_column,
            table = self.table
        );
        sqlx::query(&column_check).execute(&self.pool).await?;

        info!(table = %self.table, "Target schema verified");
        Ok(())
    }
}
