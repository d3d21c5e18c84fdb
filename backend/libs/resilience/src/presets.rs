/// Preset configurations for the CDC pipeline's I/O paths
use crate::retry::RetryConfig;
use crate::timeout::TimeoutConfig;
use std::time::Duration;

/// Configuration bundle for one kind of call
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub timeout: TimeoutConfig,
    pub retry: RetryConfig,
}

/// Target store unit of work (one transaction per change record)
///
/// - Timeout: 10s per unit
/// - Retry: backoff 200ms..30s; alert after 5 consecutive failures
pub fn store_write_config() -> ServiceConfig {
    ServiceConfig {
        timeout: TimeoutConfig {
            duration: Duration::from_secs(10),
        },
        retry: RetryConfig {
            max_retries: 5,
            initial_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            jitter: true,
            alert_after: 5,
        },
    }
}

/// Broker consumer errors (poll failures, rebalances in progress)
///
/// - Timeout: 1s poll
/// - Retry: backoff 1s..60s, matching the consumer health thresholds
pub fn broker_reconnect_config() -> ServiceConfig {
    ServiceConfig {
        timeout: TimeoutConfig {
            duration: Duration::from_secs(1),
        },
        retry: RetryConfig {
            max_retries: 10,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(60),
            backoff_multiplier: 2.0,
            jitter: true,
            alert_after: 5,
        },
    }
}

/// Best-effort mirror of dead letters to a Kafka topic
///
/// - Timeout: 5s per send
/// - Retry: 3 attempts, the database row is the durable copy
pub fn dead_letter_publish_config() -> ServiceConfig {
    ServiceConfig {
        timeout: TimeoutConfig {
            duration: Duration::from_secs(5),
        },
        retry: RetryConfig {
            max_retries: 3,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(2),
            backoff_multiplier: 2.0,
            jitter: true,
            alert_after: 0,
        },
    }
}
