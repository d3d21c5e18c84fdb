use async_trait::async_trait;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::stream_consumer::StreamPartitionQueue;
use rdkafka::consumer::{CommitMode, Consumer, DefaultConsumerContext, StreamConsumer};
use rdkafka::error::KafkaError;
use rdkafka::message::{BorrowedMessage, Message};
use rdkafka::types::RDKafkaErrorCode;
use rdkafka::{Offset, TopicPartitionList};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use super::{BrokerError, PartitionSource, RawMessage, SeekTarget};
use crate::config::KafkaConfig;

const SEEK_TIMEOUT: Duration = Duration::from_secs(5);

/// Build the group consumer. Offsets are stored and committed by the
/// pipeline, never automatically.
pub fn create_consumer(config: &KafkaConfig) -> Result<StreamConsumer, BrokerError> {
    let mut client_config = ClientConfig::new();
    client_config
        .set("group.id", &config.consumer_group)
        .set("bootstrap.servers", &config.brokers)
        .set("enable.auto.commit", "false")
        .set("enable.auto.offset.store", "false")
        .set("enable.partition.eof", "false")
        .set("auto.offset.reset", "earliest")
        .set("session.timeout.ms", config.session_timeout_ms.to_string())
        .set("client.id", &config.client_id);

    if let Some(protocol) = &config.security_protocol {
        client_config.set("security.protocol", protocol);
    }
    if let Some(mechanism) = &config.sasl_mechanism {
        client_config.set("sasl.mechanism", mechanism);
    }
    if let (Some(username), Some(password)) = (&config.sasl_username, &config.sasl_password) {
        client_config
            .set("sasl.username", username)
            .set("sasl.password", password);
    }

    let consumer: StreamConsumer = client_config.create().map_err(|e| classify_kafka_error(&e))?;

    info!(
        brokers = %config.brokers,
        group = %config.consumer_group,
        "Kafka consumer created"
    );
    Ok(consumer)
}

pub fn classify_kafka_error(err: &KafkaError) -> BrokerError {
    match err.rdkafka_error_code() {
        Some(
            RDKafkaErrorCode::SaslAuthenticationFailed
            | RDKafkaErrorCode::Authentication
            | RDKafkaErrorCode::TopicAuthorizationFailed
            | RDKafkaErrorCode::GroupAuthorizationFailed
            | RDKafkaErrorCode::ClusterAuthorizationFailed,
        ) => BrokerError::Authentication(err.to_string()),
        _ => BrokerError::Kafka(err.to_string()),
    }
}

pub(crate) fn to_raw_message(msg: &BorrowedMessage<'_>) -> RawMessage {
    RawMessage {
        partition: msg.partition(),
        offset: msg.offset(),
        key: msg.key().map(<[u8]>::to_vec),
        payload: msg.payload().map(<[u8]>::to_vec),
        timestamp_ms: msg.timestamp().to_millis(),
    }
}

/// Partition queue split off the group consumer.
pub struct KafkaPartitionSource {
    consumer: Arc<StreamConsumer>,
    queue: StreamPartitionQueue<DefaultConsumerContext>,
    topic: String,
    partition: i32,
}

impl KafkaPartitionSource {
    /// Split `partition` off the consumer's main queue. Returns None if the
    /// partition is not currently assigned.
    pub fn split(consumer: &Arc<StreamConsumer>, topic: &str, partition: i32) -> Option<Self> {
        let queue = consumer.split_partition_queue(topic, partition)?;
        Some(Self {
            consumer: Arc::clone(consumer),
            queue,
            topic: topic.to_string(),
            partition,
        })
    }

    fn partition_list(&self) -> TopicPartitionList {
        let mut tpl = TopicPartitionList::new();
        tpl.add_partition(&self.topic, self.partition);
        tpl
    }
}

#[async_trait]
impl PartitionSource for KafkaPartitionSource {
    fn partition(&self) -> i32 {
        self.partition
    }

    async fn next_message(&mut self, timeout: Duration) -> Result<Option<RawMessage>, BrokerError> {
        match tokio::time::timeout(timeout, self.queue.recv()).await {
            Ok(Ok(msg)) => Ok(Some(to_raw_message(&msg))),
            Ok(Err(e)) => Err(classify_kafka_error(&e)),
            Err(_) => Ok(None),
        }
    }

    async fn seek(&mut self, target: SeekTarget) -> Result<(), BrokerError> {
        let offset = match target {
            SeekTarget::Offset(position) => Offset::Offset(position),
            SeekTarget::Beginning => Offset::Beginning,
        };
        let consumer = Arc::clone(&self.consumer);
        let topic = self.topic.clone();
        let partition = self.partition;

        // seek blocks inside librdkafka until the fetcher acknowledges
        tokio::task::spawn_blocking(move || consumer.seek(&topic, partition, offset, SEEK_TIMEOUT))
            .await
            .map_err(|e| BrokerError::Kafka(format!("seek task failed: {}", e)))?
            .map_err(|e| classify_kafka_error(&e))?;

        debug!(
            topic = %self.topic,
            partition = self.partition,
            target = ?target,
            "Seeked partition"
        );
        Ok(())
    }

    async fn acknowledge(&mut self, next_offset: i64) -> Result<(), BrokerError> {
        let mut tpl = TopicPartitionList::new();
        tpl.add_partition_offset(&self.topic, self.partition, Offset::Offset(next_offset))
            .map_err(|e| classify_kafka_error(&e))?;

        self.consumer
            .commit(&tpl, CommitMode::Async)
            .map_err(|e| classify_kafka_error(&e))
    }

    async fn pause(&mut self) -> Result<(), BrokerError> {
        self.consumer
            .pause(&self.partition_list())
            .map_err(|e| classify_kafka_error(&e))
    }
}
