//! Broker client.
//!
//! Each partition worker reads through a [`PartitionSource`]: an ordered
//! stream of messages for exactly one partition that can be repositioned and
//! acknowledged.

mod kafka;
mod scripted;

pub use kafka::{classify_kafka_error, create_consumer, KafkaPartitionSource};
pub use scripted::ScriptedSource;

use async_trait::async_trait;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

use crate::error::ErrorClass;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BrokerError {
    /// The source has no more messages and never will (scripted sources only)
    #[error("end of stream")]
    EndOfStream,

    #[error("kafka error: {0}")]
    Kafka(String),

    #[error("broker authentication failed: {0}")]
    Authentication(String),

    #[error("partition {0} is not assigned to this consumer")]
    NotAssigned(i32),
}

impl BrokerError {
    pub fn class(&self) -> ErrorClass {
        match self {
            BrokerError::Kafka(_) => ErrorClass::Transient,
            BrokerError::EndOfStream
            | BrokerError::Authentication(_)
            | BrokerError::NotAssigned(_) => ErrorClass::Fatal,
        }
    }
}

/// Where consumption starts when a partition is (re)assigned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StartingOffset {
    /// Replay the partition from the earliest retained offset
    Earliest,
    /// Continue one past the stored checkpoint
    #[default]
    ResumeFromCheckpoint,
}

impl FromStr for StartingOffset {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "earliest" | "frombeginning" | "from-beginning" => Ok(StartingOffset::Earliest),
            "resume-from-checkpoint" | "resume" | "checkpoint" => {
                Ok(StartingOffset::ResumeFromCheckpoint)
            }
            other => Err(format!("unknown starting offset policy '{}'", other)),
        }
    }
}

/// Concrete seek target for a partition source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeekTarget {
    Offset(i64),
    Beginning,
}

/// One message as delivered by the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawMessage {
    pub partition: i32,
    pub offset: i64,
    pub key: Option<Vec<u8>>,
    /// None for a broker tombstone
    pub payload: Option<Vec<u8>>,
    pub timestamp_ms: Option<i64>,
}

#[async_trait]
pub trait PartitionSource: Send {
    fn partition(&self) -> i32;

    /// Next message, or `Ok(None)` if nothing arrived within `timeout`.
    async fn next_message(&mut self, timeout: Duration) -> Result<Option<RawMessage>, BrokerError>;

    async fn seek(&mut self, target: SeekTarget) -> Result<(), BrokerError>;

    /// Mirror progress to the broker: `next_offset` is the next offset to read.
    async fn acknowledge(&mut self, next_offset: i64) -> Result<(), BrokerError>;

    /// Stop fetching for this partition (after a fatal worker error).
    async fn pause(&mut self) -> Result<(), BrokerError>;
}
