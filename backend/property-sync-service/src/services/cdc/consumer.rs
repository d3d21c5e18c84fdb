//! Group consumer and partition coordinator.
//!
//! The group consumer owns the subscription and rebalances. Every assigned
//! partition is split into its own queue and handed to a [`PartitionWorker`];
//! the main queue is still polled so librdkafka can drive the group protocol.
//! Assignment is reconciled on a short tick: new partitions get a worker,
//! revoked ones are told to stop and are not restarted until their worker has
//! drained.

use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::message::Message;
use resilience::{broker_reconnect_config, Backoff};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::broker::{classify_kafka_error, BrokerError, KafkaPartitionSource, StartingOffset};
use super::health::{PartitionState, CRITICAL_ERROR_THRESHOLD, UNHEALTHY_ERROR_THRESHOLD};
use super::worker::{wait_for_shutdown, PartitionWorker, PipelineContext, WorkerExit};
use crate::error::{ErrorClass, Result, SyncError};
use crate::metrics::CDC_CONSUMER_ERRORS;

const ASSIGNMENT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Partitions to start and stop after comparing the broker's assignment with
/// the workers currently running.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct AssignmentPlan {
    pub start: Vec<i32>,
    pub stop: Vec<i32>,
}

/// Failed partitions are left alone until the broker revokes them; a worker
/// that is still draining counts as running.
pub fn plan_assignment(
    assigned: &BTreeSet<i32>,
    running: &BTreeSet<i32>,
    failed: &BTreeSet<i32>,
) -> AssignmentPlan {
    AssignmentPlan {
        start: assigned
            .iter()
            .filter(|p| !running.contains(*p) && !failed.contains(*p))
            .copied()
            .collect(),
        stop: running
            .iter()
            .filter(|p| !assigned.contains(*p))
            .copied()
            .collect(),
    }
}

struct PartitionHandle {
    stop: watch::Sender<bool>,
    task: JoinHandle<WorkerExit>,
    stopping: bool,
}

pub struct CdcConsumer {
    consumer: Arc<StreamConsumer>,
    ctx: Arc<PipelineContext>,
    workers: BTreeMap<i32, PartitionHandle>,
    failed: BTreeSet<i32>,
    /// Partitions assigned at least once in this process
    seen: BTreeSet<i32>,
}

impl CdcConsumer {
    pub fn new(consumer: StreamConsumer, ctx: Arc<PipelineContext>) -> Result<Self> {
        consumer
            .subscribe(&[ctx.config.topic.as_str()])
            .map_err(|e| SyncError::Broker(classify_kafka_error(&e)))?;

        info!(
            topic = %ctx.config.topic,
            group = %ctx.config.consumer_group,
            starting_offset = ?ctx.config.starting_offset,
            "Subscribed to CDC topic"
        );

        Ok(Self {
            consumer: Arc::new(consumer),
            ctx,
            workers: BTreeMap::new(),
            failed: BTreeSet::new(),
            seen: BTreeSet::new(),
        })
    }

    /// Run until shutdown is signalled. Returns an error only when the group
    /// consumer itself can no longer operate (lost authorization).
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        info!("Starting CDC consumer loop");

        let consumer = Arc::clone(&self.consumer);
        let mut ticker = tokio::time::interval(ASSIGNMENT_POLL_INTERVAL);
        let mut backoff = Backoff::new(broker_reconnect_config().retry);

        let result = loop {
            tokio::select! {
                biased;
                _ = wait_for_shutdown(&mut shutdown) => break Ok(()),
                _ = ticker.tick() => self.reconcile().await,
                received = consumer.recv() => match received {
                    Ok(msg) => {
                        backoff.reset();
                        // re-read after the worker seeks
                        debug!(
                            partition = msg.partition(),
                            offset = msg.offset(),
                            "Message on main queue before partition split, dropping"
                        );
                    }
                    Err(e) => {
                        let err = classify_kafka_error(&e);
                        if err.class() == ErrorClass::Fatal {
                            error!(error = %err, "Kafka consumer cannot continue");
                            break Err(SyncError::Broker(err));
                        }
                        if self.back_off(&mut backoff, &err, &mut shutdown).await {
                            break Ok(());
                        }
                    }
                },
            }
        };

        self.stop_all().await;
        info!("CDC consumer stopped");
        result
    }

    /// Returns true if shutdown was signalled while backing off.
    async fn back_off(
        &self,
        backoff: &mut Backoff,
        err: &BrokerError,
        shutdown: &mut watch::Receiver<bool>,
    ) -> bool {
        CDC_CONSUMER_ERRORS.inc();
        let consumer_health = self.ctx.health.consumer();
        let consecutive = consumer_health.record_error();
        let delay = backoff.next_delay();

        if consecutive >= CRITICAL_ERROR_THRESHOLD {
            error!(
                consecutive_errors = consecutive,
                backoff_ms = delay.as_millis() as u64,
                time_since_success_secs = consumer_health.time_since_success().as_secs(),
                error = %err,
                "CRITICAL: Kafka consumer experiencing persistent failures"
            );
        } else if consecutive >= UNHEALTHY_ERROR_THRESHOLD {
            warn!(
                consecutive_errors = consecutive,
                backoff_ms = delay.as_millis() as u64,
                error = %err,
                "Kafka consumer unhealthy - multiple consecutive errors"
            );
        } else {
            error!(
                consecutive_errors = consecutive,
                backoff_ms = delay.as_millis() as u64,
                error = %err,
                "Kafka consumer error (will retry with backoff)"
            );
        }

        tokio::select! {
            _ = wait_for_shutdown(shutdown) => true,
            _ = tokio::time::sleep(delay) => false,
        }
    }

    fn assigned_partitions(&self) -> std::result::Result<BTreeSet<i32>, BrokerError> {
        let assignment = self
            .consumer
            .assignment()
            .map_err(|e| classify_kafka_error(&e))?;
        Ok(assignment
            .elements_for_topic(&self.ctx.config.topic)
            .iter()
            .map(|elem| elem.partition())
            .collect())
    }

    async fn reconcile(&mut self) {
        self.reap_finished().await;

        let assigned = match self.assigned_partitions() {
            Ok(assigned) => {
                self.ctx.health.consumer().record_success();
                assigned
            }
            Err(e) => {
                warn!(error = %e, "Failed to read partition assignment");
                return;
            }
        };

        let revoked_failed: Vec<i32> = self
            .failed
            .iter()
            .filter(|p| !assigned.contains(*p))
            .copied()
            .collect();
        for partition in revoked_failed {
            info!(partition, "Failed partition revoked");
            self.failed.remove(&partition);
            self.ctx.health.remove_partition(partition);
        }

        let running: BTreeSet<i32> = self.workers.keys().copied().collect();
        let plan = plan_assignment(&assigned, &running, &self.failed);

        for partition in plan.stop {
            if let Some(handle) = self.workers.get_mut(&partition) {
                if !handle.stopping {
                    info!(partition, "Partition revoked, stopping worker");
                    let _ = handle.stop.send(true);
                    handle.stopping = true;
                }
            }
        }
        for partition in plan.start {
            self.start_worker(partition);
        }
    }

    fn start_worker(&mut self, partition: i32) {
        let topic = &self.ctx.config.topic;
        let source = match KafkaPartitionSource::split(&self.consumer, topic, partition) {
            Some(source) => source,
            None => {
                warn!(partition, "Partition not assigned at split time, will retry");
                return;
            }
        };

        let first_assignment = self.seen.insert(partition);
        let replay = first_assignment && self.ctx.config.starting_offset == StartingOffset::Earliest;

        let (stop, stop_rx) = watch::channel(false);
        let worker = PartitionWorker::new(Arc::clone(&self.ctx), Box::new(source), stop_rx, replay);
        let task = tokio::spawn(worker.run());

        info!(partition, replay_from_beginning = replay, "Partition assigned, worker spawned");
        self.workers.insert(
            partition,
            PartitionHandle {
                stop,
                task,
                stopping: false,
            },
        );
    }

    async fn reap_finished(&mut self) {
        let finished: Vec<i32> = self
            .workers
            .iter()
            .filter(|(_, handle)| handle.task.is_finished())
            .map(|(partition, _)| *partition)
            .collect();

        for partition in finished {
            let Some(handle) = self.workers.remove(&partition) else {
                continue;
            };
            match handle.task.await {
                Ok(WorkerExit::Failed(_)) => {
                    self.failed.insert(partition);
                }
                Ok(_) => {
                    if handle.stopping {
                        self.ctx.health.remove_partition(partition);
                    }
                }
                Err(e) => {
                    error!(partition, error = %e, "Partition worker panicked");
                    self.failed.insert(partition);
                    self.ctx.health.set_partition(
                        partition,
                        PartitionState::Failed {
                            error: e.to_string(),
                        },
                    );
                }
            }
        }
    }

    /// Signal every worker and wait for in-flight units of work to finish.
    async fn stop_all(&mut self) {
        for handle in self.workers.values() {
            let _ = handle.stop.send(true);
        }
        for (partition, handle) in std::mem::take(&mut self.workers) {
            if let Err(e) = handle.task.await {
                error!(partition, error = %e, "Partition worker panicked during shutdown");
            }
        }
        self.consumer.unsubscribe();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(items: &[i32]) -> BTreeSet<i32> {
        items.iter().copied().collect()
    }

    #[test]
    fn test_plan_starts_new_and_stops_revoked() {
        let plan = plan_assignment(&set(&[0, 1, 2]), &set(&[1, 3]), &set(&[]));
        assert_eq!(plan.start, vec![0, 2]);
        assert_eq!(plan.stop, vec![3]);
    }

    #[test]
    fn test_plan_leaves_failed_partitions_stopped() {
        let plan = plan_assignment(&set(&[0, 1]), &set(&[0]), &set(&[1]));
        assert!(plan.start.is_empty());
        assert!(plan.stop.is_empty());
    }

    #[test]
    fn test_plan_noop_when_in_sync() {
        let plan = plan_assignment(&set(&[4, 5]), &set(&[4, 5]), &set(&[]));
        assert_eq!(plan, AssignmentPlan::default());
    }
}
