//! Dead letters.
//!
//! The `cdc_dead_letters` row is written in the same unit of work as the
//! checkpoint advance and is the durable record. The Kafka mirror is published
//! after commit so downstream tooling can alert on it; losing a mirror message
//! loses nothing.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rdkafka::config::ClientConfig;
use rdkafka::producer::{FutureProducer, FutureRecord};
use resilience::{dead_letter_publish_config, with_retry, with_timeout_result};
use serde::{Deserialize, Serialize};
use tracing::{debug, error};

use super::broker::RawMessage;
use super::store::DeadLetterRecord;
use crate::error::{ErrorClass, Result, SyncError};

impl DeadLetterRecord {
    pub fn new(
        consumer_group: &str,
        topic: &str,
        message: &RawMessage,
        reason: String,
        error_class: ErrorClass,
    ) -> Self {
        Self {
            consumer_group: consumer_group.to_string(),
            topic: topic.to_string(),
            partition: message.partition,
            position: message.offset,
            entity_id: None,
            payload: message.payload.clone(),
            reason,
            error_class,
            attempts: 1,
            failed_at: Utc::now(),
        }
    }

    pub fn with_entity_id(mut self, entity_id: Option<String>) -> Self {
        self.entity_id = entity_id;
        self
    }

    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts.max(1);
        self
    }

    /// Copy without the entity id and with control characters stripped from
    /// the reason, for when the store rejected the full record.
    pub fn degraded(&self) -> Self {
        Self {
            entity_id: None,
            reason: self
                .reason
                .chars()
                .filter(|c| !c.is_control() || *c == '\n')
                .collect(),
            ..self.clone()
        }
    }
}

/// DLQ topic message format
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DlqMessage {
    pub consumer_group: String,
    pub topic: String,
    pub partition: i32,
    pub position: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<String>,
    pub reason: String,
    pub error_class: String,
    pub attempts: u32,
    pub failed_at: DateTime<Utc>,
    /// Original message value, lossily decoded as UTF-8
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<String>,
}

impl From<&DeadLetterRecord> for DlqMessage {
    fn from(record: &DeadLetterRecord) -> Self {
        Self {
            consumer_group: record.consumer_group.clone(),
            topic: record.topic.clone(),
            partition: record.partition,
            position: record.position,
            entity_id: record.entity_id.clone(),
            reason: record.reason.clone(),
            error_class: record.error_class.as_str().to_string(),
            attempts: record.attempts,
            failed_at: record.failed_at,
            payload: record
                .payload
                .as_deref()
                .map(|p| String::from_utf8_lossy(p).into_owned()),
        }
    }
}

/// Post-commit destination for dead letters.
#[async_trait]
pub trait DeadLetterSink: Send + Sync {
    async fn publish(&self, record: &DeadLetterRecord) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct DlqConfig {
    pub kafka_brokers: String,
    pub topic: String,
    pub timeout_ms: u64,
}

/// Mirrors dead letters to a Kafka topic, keyed by `topic-partition-position`.
pub struct KafkaDeadLetterSink {
    config: DlqConfig,
    producer: FutureProducer,
}

impl KafkaDeadLetterSink {
    pub fn new(config: DlqConfig) -> Result<Self> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", &config.kafka_brokers)
            .set("message.timeout.ms", config.timeout_ms.to_string())
            .set("enable.idempotence", "true")
            .create()
            .map_err(|e| SyncError::Config(format!("DLQ producer: {}", e)))?;

        Ok(Self { config, producer })
    }

    async fn send_once(&self, key: &str, payload: &str) -> Result<()> {
        let record = FutureRecord::to(&self.config.topic).key(key).payload(payload);

        self.producer
            .send(
                record,
                std::time::Duration::from_millis(self.config.timeout_ms),
            )
            .await
            .map(|(partition, offset)| {
                debug!(
                    dlq_topic = %self.config.topic,
                    partition,
                    offset,
                    "Dead letter mirrored"
                );
            })
            .map_err(|(e, _)| SyncError::DeadLetterPublish(e.to_string()))
    }
}

#[async_trait]
impl DeadLetterSink for KafkaDeadLetterSink {
    async fn publish(&self, record: &DeadLetterRecord) -> Result<()> {
        let message = DlqMessage::from(record);
        let payload = serde_json::to_string(&message)
            .map_err(|e| SyncError::DeadLetterPublish(e.to_string()))?;
        let key = format!("{}-{}-{}", record.topic, record.partition, record.position);

        let preset = dead_letter_publish_config();
        let timeout = preset.timeout.duration;
        let (key, payload) = (key.as_str(), payload.as_str());
        let result = with_retry(preset.retry, move || {
            with_timeout_result(timeout, self.send_once(key, payload))
        })
        .await;

        result.map_err(|e| {
            let e = e.into_inner();
            error!(
                topic = %record.topic,
                partition = record.partition,
                position = record.position,
                error = %e,
                "Failed to mirror dead letter to Kafka"
            );
            SyncError::DeadLetterPublish(e.to_string())
        })
    }
}
