//! Consumer and per-partition health tracking, surfaced on `/ready`.

use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use crate::metrics::{CDC_CONSUMER_HEALTHY, CDC_WORKER_HEALTHY};

/// Consecutive consumer errors before the consumer is reported unhealthy
pub const UNHEALTHY_ERROR_THRESHOLD: u32 = 5;

/// Consecutive consumer errors before logging escalates to critical
pub const CRITICAL_ERROR_THRESHOLD: u32 = 10;

fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Error state of the group consumer's main queue
pub struct ConsumerHealth {
    consecutive_count: AtomicU32,
    last_success_ms: AtomicU64,
}

impl ConsumerHealth {
    pub fn new() -> Self {
        Self {
            consecutive_count: AtomicU32::new(0),
            last_success_ms: AtomicU64::new(now_millis()),
        }
    }

    pub fn record_success(&self) {
        self.consecutive_count.store(0, Ordering::SeqCst);
        self.last_success_ms.store(now_millis(), Ordering::SeqCst);
        CDC_CONSUMER_HEALTHY.set(1);
    }

    /// Record an error and return the consecutive count
    pub fn record_error(&self) -> u32 {
        let count = self.consecutive_count.fetch_add(1, Ordering::SeqCst) + 1;
        if count >= UNHEALTHY_ERROR_THRESHOLD {
            CDC_CONSUMER_HEALTHY.set(0);
        }
        count
    }

    pub fn consecutive_errors(&self) -> u32 {
        self.consecutive_count.load(Ordering::SeqCst)
    }

    pub fn time_since_success(&self) -> Duration {
        let last = self.last_success_ms.load(Ordering::SeqCst);
        Duration::from_millis(now_millis().saturating_sub(last))
    }

    pub fn is_healthy(&self) -> bool {
        self.consecutive_errors() < UNHEALTHY_ERROR_THRESHOLD
    }
}

impl Default for ConsumerHealth {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum PartitionState {
    Starting,
    Running { last_applied: Option<i64> },
    Retrying { attempts: u32, error: String },
    Stopped { reason: String },
    Failed { error: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub healthy: bool,
    pub consumer_consecutive_errors: u32,
    pub partitions: BTreeMap<i32, PartitionState>,
}

/// Health of the whole pipeline: consumer plus every partition worker.
#[derive(Default)]
pub struct PipelineHealth {
    consumer: ConsumerHealth,
    partitions: Mutex<BTreeMap<i32, PartitionState>>,
}

impl PipelineHealth {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn consumer(&self) -> &ConsumerHealth {
        &self.consumer
    }

    fn partitions(&self) -> MutexGuard<'_, BTreeMap<i32, PartitionState>> {
        match self.partitions.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn set_partition(&self, partition: i32, state: PartitionState) {
        let healthy = !matches!(
            state,
            PartitionState::Retrying { .. } | PartitionState::Failed { .. }
        );
        CDC_WORKER_HEALTHY
            .with_label_values(&[&partition.to_string()])
            .set(i64::from(healthy));
        self.partitions().insert(partition, state);
    }

    pub fn remove_partition(&self, partition: i32) {
        let _ = CDC_WORKER_HEALTHY.remove_label_values(&[&partition.to_string()]);
        self.partitions().remove(&partition);
    }

    pub fn partition(&self, partition: i32) -> Option<PartitionState> {
        self.partitions().get(&partition).cloned()
    }

    /// Healthy when the consumer is polling and no partition has failed or is
    /// stuck retrying.
    pub fn report(&self) -> HealthReport {
        let partitions = self.partitions().clone();
        let partitions_ok = partitions.values().all(|s| {
            !matches!(
                s,
                PartitionState::Failed { .. } | PartitionState::Retrying { .. }
            )
        });

        HealthReport {
            healthy: self.consumer.is_healthy() && partitions_ok,
            consumer_consecutive_errors: self.consumer.consecutive_errors(),
            partitions,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_consumer_health_threshold() {
        let health = ConsumerHealth::new();
        for _ in 0..UNHEALTHY_ERROR_THRESHOLD - 1 {
            health.record_error();
        }
        assert!(health.is_healthy());
        assert_eq!(health.record_error(), UNHEALTHY_ERROR_THRESHOLD);
        assert!(!health.is_healthy());

        health.record_success();
        assert!(health.is_healthy());
        assert_eq!(health.consecutive_errors(), 0);
    }

    #[test]
    fn test_report_flags_failed_partition() {
        let health = PipelineHealth::new();
        health.set_partition(900, PartitionState::Running { last_applied: Some(3) });
        assert!(health.report().healthy);

        health.set_partition(
            901,
            PartitionState::Failed {
                error: "relation does not exist".into(),
            },
        );
        let report = health.report();
        assert!(!report.healthy);
        assert_eq!(report.partitions.len(), 2);

        health.remove_partition(901);
        assert!(health.report().healthy);
    }
}
