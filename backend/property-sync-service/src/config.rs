/// Configuration management
use db_pool::{parse_env_with_default, DbConfig};
use resilience::RetryConfig;
use serde::Deserialize;
use std::time::Duration;

use crate::error::SyncError;
use crate::services::cdc::broker::StartingOffset;
use crate::services::cdc::dead_letter::DlqConfig;
use crate::services::cdc::schema::TargetSchema;
use crate::services::cdc::store::DeletePolicy;
use crate::services::cdc::worker::WorkerConfig;

pub const SERVICE_NAME: &str = "property-sync-service";

/// Kafka client settings, read from `KAFKA_*`.
#[derive(Debug, Clone, Deserialize)]
pub struct KafkaConfig {
    pub brokers: String,
    #[serde(default = "default_consumer_group")]
    pub consumer_group: String,
    #[serde(default = "default_session_timeout_ms")]
    pub session_timeout_ms: u64,
    #[serde(default = "default_client_id")]
    pub client_id: String,
    pub security_protocol: Option<String>,
    pub sasl_mechanism: Option<String>,
    pub sasl_username: Option<String>,
    pub sasl_password: Option<String>,
}

/// Pipeline settings, read from `CDC_*`.
#[derive(Debug, Clone, Deserialize)]
pub struct CdcSettings {
    pub topic: String,
    /// `resume-from-checkpoint` or `earliest`
    #[serde(default = "default_starting_offset")]
    pub starting_offset: String,
    #[serde(default = "default_poll_timeout_ms")]
    pub poll_timeout_ms: u64,
    #[serde(default = "default_store_timeout_ms")]
    pub store_timeout_ms: u64,
    #[serde(default = "default_max_constraint_attempts")]
    pub max_constraint_attempts: u32,
    #[serde(default = "default_retry_initial_backoff_ms")]
    pub retry_initial_backoff_ms: u64,
    #[serde(default = "default_retry_max_backoff_ms")]
    pub retry_max_backoff_ms: u64,
    /// Consecutive failures before retry logging escalates to error
    #[serde(default = "default_alert_after")]
    pub alert_after: u32,
    /// `tombstone` or `hard`
    #[serde(default = "default_delete_policy")]
    pub delete_policy: String,
    #[serde(default = "default_target_table")]
    pub target_table: String,
    #[serde(default = "default_key_column")]
    pub key_column: String,
    #[serde(default = "default_key_field")]
    pub key_field: String,
    /// `sourceField:column:kind,...`; the properties mapping when unset
    pub column_map: Option<String>,
    pub expected_source_table: Option<String>,
    /// Kafka topic mirroring dead letters; disabled when unset
    pub dlq_topic: Option<String>,
    /// Sizing hint for the connection pool
    #[serde(default = "default_expected_partitions")]
    pub expected_partitions: u32,
    /// Expose `/admin/checkpoints` routes
    #[serde(default)]
    pub admin_enabled: bool,
}

fn default_consumer_group() -> String {
    "property-sync".to_string()
}

fn default_session_timeout_ms() -> u64 {
    30_000
}

fn default_client_id() -> String {
    SERVICE_NAME.to_string()
}

fn default_starting_offset() -> String {
    "resume-from-checkpoint".to_string()
}

fn default_poll_timeout_ms() -> u64 {
    1_000
}

fn default_store_timeout_ms() -> u64 {
    10_000
}

fn default_max_constraint_attempts() -> u32 {
    5
}

fn default_retry_initial_backoff_ms() -> u64 {
    200
}

fn default_retry_max_backoff_ms() -> u64 {
    30_000
}

fn default_alert_after() -> u32 {
    5
}

fn default_delete_policy() -> String {
    "tombstone".to_string()
}

fn default_target_table() -> String {
    "properties".to_string()
}

fn default_key_column() -> String {
    "property_id".to_string()
}

fn default_key_field() -> String {
    "id".to_string()
}

fn default_expected_partitions() -> u32 {
    12
}

#[derive(Clone)]
pub struct Config {
    pub http_port: u16,
    pub kafka: KafkaConfig,
    pub cdc: CdcSettings,
    pub database: DbConfig,
}

impl Config {
    pub fn from_env() -> Result<Self, SyncError> {
        let kafka = envy::prefixed("KAFKA_")
            .from_env::<KafkaConfig>()
            .map_err(|e| SyncError::Config(format!("KAFKA_*: {}", e)))?;
        let cdc = envy::prefixed("CDC_")
            .from_env::<CdcSettings>()
            .map_err(|e| SyncError::Config(format!("CDC_*: {}", e)))?;
        let database = DbConfig::from_env(SERVICE_NAME).map_err(SyncError::Config)?;

        let config = Self {
            http_port: parse_env_with_default("PORT", 8080),
            kafka,
            cdc,
            database,
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the pipeline cannot start with.
    pub fn validate(&self) -> Result<(), SyncError> {
        if self.cdc.topic.trim().is_empty() {
            return Err(SyncError::Config("CDC_TOPIC must not be empty".into()));
        }
        if self.kafka.consumer_group.trim().is_empty() {
            return Err(SyncError::Config(
                "KAFKA_CONSUMER_GROUP must not be empty".into(),
            ));
        }
        if self.kafka.brokers.trim().is_empty() {
            return Err(SyncError::Config("KAFKA_BROKERS must not be empty".into()));
        }
        if self.cdc.poll_timeout_ms == 0 || self.cdc.store_timeout_ms == 0 {
            return Err(SyncError::Config(
                "CDC_POLL_TIMEOUT_MS and CDC_STORE_TIMEOUT_MS must be positive".into(),
            ));
        }
        if self.cdc.max_constraint_attempts == 0 {
            return Err(SyncError::Config(
                "CDC_MAX_CONSTRAINT_ATTEMPTS must be at least 1".into(),
            ));
        }
        self.starting_offset()?;
        self.delete_policy()?;
        self.target_schema()?;
        Ok(())
    }

    pub fn starting_offset(&self) -> Result<StartingOffset, SyncError> {
        self.cdc.starting_offset.parse().map_err(SyncError::Config)
    }

    pub fn delete_policy(&self) -> Result<DeletePolicy, SyncError> {
        self.cdc.delete_policy.parse().map_err(SyncError::Config)
    }

    /// Target table and column mapping.
    pub fn target_schema(&self) -> Result<TargetSchema, SyncError> {
        let cdc = &self.cdc;
        let schema = TargetSchema::new(&cdc.target_table, &cdc.key_column, &cdc.key_field)?;
        let schema = match &cdc.column_map {
            Some(spec) => schema.with_mapping_spec(spec)?,
            None => {
                let mut schema = schema;
                for mapping in TargetSchema::properties_default()?.columns {
                    schema = schema.with_column(&mapping.source_field, &mapping.column, mapping.kind)?;
                }
                schema
            }
        };
        Ok(schema.with_expected_source_table(cdc.expected_source_table.clone()))
    }

    pub fn worker_config(&self) -> Result<WorkerConfig, SyncError> {
        let mut worker = WorkerConfig::new(&self.cdc.topic, &self.kafka.consumer_group);
        worker.poll_timeout = Duration::from_millis(self.cdc.poll_timeout_ms);
        worker.store_timeout = Duration::from_millis(self.cdc.store_timeout_ms);
        worker.max_constraint_attempts = self.cdc.max_constraint_attempts;
        worker.starting_offset = self.starting_offset()?;
        worker.retry = RetryConfig {
            initial_backoff: Duration::from_millis(self.cdc.retry_initial_backoff_ms),
            max_backoff: Duration::from_millis(self.cdc.retry_max_backoff_ms),
            alert_after: self.cdc.alert_after,
            ..worker.retry
        };
        Ok(worker)
    }

    pub fn dlq_config(&self) -> Option<DlqConfig> {
        self.cdc
            .dlq_topic
            .as_ref()
            .filter(|topic| !topic.trim().is_empty())
            .map(|topic| DlqConfig {
                kafka_brokers: self.kafka.brokers.clone(),
                topic: topic.clone(),
                timeout_ms: 5_000,
            })
    }
}
