use std::time::Duration;
use thiserror::Error;

use crate::services::cdc::broker::BrokerError;
use crate::services::cdc::decoder::DecodeError;
use crate::services::cdc::schema::{CoercionError, SchemaError};
use crate::services::cdc::store::StoreError;

pub type Result<T> = std::result::Result<T, SyncError>;

/// How the partition worker reacts to a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    /// Connection loss, timeouts, lock contention: retry the same record forever.
    Transient,
    /// Referential constraint: retry a bounded number of times, then dead-letter.
    Constraint,
    /// Malformed or unmappable data: dead-letter immediately.
    Permanent,
    /// Misconfiguration or lost authorization: stop the partition.
    Fatal,
}

impl ErrorClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorClass::Transient => "transient",
            ErrorClass::Constraint => "constraint",
            ErrorClass::Permanent => "permanent",
            ErrorClass::Fatal => "fatal",
        }
    }
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    #[error("Mapping error: {0}")]
    Mapping(#[from] CoercionError),

    #[error("Schema error: {0}")]
    Schema(#[from] SchemaError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Broker error: {0}")]
    Broker(#[from] BrokerError),

    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Dead letter publish failed: {0}")]
    DeadLetterPublish(String),
}

impl SyncError {
    /// Classify the error for the worker's retry coordinator.
    pub fn class(&self) -> ErrorClass {
        match self {
            SyncError::Decode(_) | SyncError::Mapping(_) => ErrorClass::Permanent,
            SyncError::Store(e) => e.class(),
            SyncError::Broker(e) => e.class(),
            SyncError::Timeout(_) | SyncError::DeadLetterPublish(_) => ErrorClass::Transient,
            SyncError::Schema(_) | SyncError::Config(_) => ErrorClass::Fatal,
        }
    }
}
