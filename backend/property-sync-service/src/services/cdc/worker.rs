//! Partition worker.
//!
//! One worker owns one partition for as long as it is assigned. Messages are
//! applied strictly in offset order: each one is decoded, applied, and its
//! checkpoint advanced inside a single unit of work, and the worker does not
//! read the next message until that unit has committed or the message has been
//! dead-lettered. A failure on one partition never blocks another.

use resilience::{store_write_config, with_timeout_result, Backoff, RetryConfig, TimeoutError};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use super::applier::{ApplyOutcome, SkipReason, UpsertApplier};
use super::broker::{BrokerError, PartitionSource, RawMessage, SeekTarget, StartingOffset};
use super::checkpoint::CheckpointTracker;
use super::dead_letter::DeadLetterSink;
use super::decoder::ChangeDecoder;
use super::health::{PartitionState, PipelineHealth};
use super::models::ChangeRecord;
use super::schema::TargetSchema;
use super::store::{DeadLetterRecord, DeletePolicy, TargetStore};
use crate::error::{ErrorClass, Result, SyncError};
use crate::metrics::{
    CDC_CHECKPOINT_POSITION, CDC_DEAD_LETTERS, CDC_DEAD_LETTER_MIRROR_FAILURES,
    CDC_MESSAGES_APPLIED, CDC_MESSAGES_SKIPPED, CDC_RETRIES,
};

/// Tunables shared by every partition worker of one pipeline.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub topic: String,
    pub consumer_group: String,
    /// How long a single read waits before re-checking for shutdown
    pub poll_timeout: Duration,
    /// Upper bound on one unit of work (begin through commit)
    pub store_timeout: Duration,
    /// Backoff for transient and constraint failures
    pub retry: RetryConfig,
    /// Constraint failures tolerated before a record is dead-lettered
    pub max_constraint_attempts: u32,
    pub starting_offset: StartingOffset,
}

impl WorkerConfig {
    pub fn new(topic: &str, consumer_group: &str) -> Self {
        let preset = store_write_config();
        Self {
            topic: topic.to_string(),
            consumer_group: consumer_group.to_string(),
            poll_timeout: Duration::from_secs(1),
            store_timeout: preset.timeout.duration,
            // transient failures never give up on a record
            retry: RetryConfig {
                max_retries: u32::MAX,
                ..preset.retry
            },
            max_constraint_attempts: 5,
            starting_offset: StartingOffset::default(),
        }
    }
}

/// Everything a worker needs besides its partition source.
pub struct PipelineContext {
    pub config: WorkerConfig,
    pub store: Arc<dyn TargetStore>,
    pub decoder: ChangeDecoder,
    pub applier: UpsertApplier,
    pub checkpoints: CheckpointTracker,
    pub dead_letter_sink: Option<Arc<dyn DeadLetterSink>>,
    pub health: Arc<PipelineHealth>,
}

impl PipelineContext {
    pub fn new(
        config: WorkerConfig,
        store: Arc<dyn TargetStore>,
        schema: TargetSchema,
        delete_policy: DeletePolicy,
    ) -> Self {
        let decoder = ChangeDecoder::from_schema(&schema);
        let checkpoints =
            CheckpointTracker::new(Arc::clone(&store), &config.consumer_group, &config.topic);
        Self {
            applier: UpsertApplier::new(Arc::new(schema), delete_policy),
            decoder,
            checkpoints,
            store,
            config,
            dead_letter_sink: None,
            health: Arc::new(PipelineHealth::new()),
        }
    }

    pub fn with_dead_letter_sink(mut self, sink: Arc<dyn DeadLetterSink>) -> Self {
        self.dead_letter_sink = Some(sink);
        self
    }

    pub fn with_health(mut self, health: Arc<PipelineHealth>) -> Self {
        self.health = health;
        self
    }
}

/// Why a worker returned.
#[derive(Debug)]
pub enum WorkerExit {
    /// Shutdown or revocation was signalled
    Stopped,
    /// The source ran dry (scripted sources only)
    EndOfStream,
    /// A fatal error stopped this partition; it stays paused until reassigned
    Failed(SyncError),
}

/// What the unit of work for one message contains.
enum Disposition {
    Apply(ChangeRecord),
    Skip(SkipReason),
    DeadLetter(DeadLetterRecord),
}

enum Committed {
    Applied(ApplyOutcome),
    DeadLettered(DeadLetterRecord),
}

enum Step {
    Continue,
    Stop,
}

pub struct PartitionWorker {
    ctx: Arc<PipelineContext>,
    source: Box<dyn PartitionSource>,
    partition: i32,
    partition_label: String,
    shutdown: watch::Receiver<bool>,
    replay_from_beginning: bool,
    /// Highest offset committed (or inherited from the checkpoint)
    last_applied: Option<i64>,
    /// Offset the next message should carry, once known
    expected: Option<i64>,
    /// Gapped offset already re-sought once
    pending_gap: Option<i64>,
    read_backoff: Backoff,
}

impl PartitionWorker {
    /// `replay_from_beginning` ignores the stored checkpoint and seeks to the
    /// earliest retained offset; the coordinator sets it on the first
    /// assignment when the starting-offset policy is `Earliest`.
    pub fn new(
        ctx: Arc<PipelineContext>,
        source: Box<dyn PartitionSource>,
        shutdown: watch::Receiver<bool>,
        replay_from_beginning: bool,
    ) -> Self {
        let partition = source.partition();
        let read_backoff = Backoff::new(ctx.config.retry.clone());
        Self {
            ctx,
            source,
            partition,
            partition_label: partition.to_string(),
            shutdown,
            replay_from_beginning,
            last_applied: None,
            expected: None,
            pending_gap: None,
            read_backoff,
        }
    }

    pub async fn run(mut self) -> WorkerExit {
        self.ctx
            .health
            .set_partition(self.partition, PartitionState::Starting);
        info!(
            topic = %self.ctx.config.topic,
            partition = self.partition,
            replay_from_beginning = self.replay_from_beginning,
            "Partition worker starting"
        );

        let exit = match self.position().await {
            Ok(Step::Continue) => self.consume().await,
            Ok(Step::Stop) => WorkerExit::Stopped,
            Err(e) => WorkerExit::Failed(e),
        };
        self.finish(exit).await
    }

    /// Seek the source according to the checkpoint and starting-offset policy.
    async fn position(&mut self) -> Result<Step> {
        let mut backoff = Backoff::new(self.ctx.config.retry.clone());
        loop {
            if *self.shutdown.borrow() {
                return Ok(Step::Stop);
            }
            let err = match self.try_position().await {
                Ok(()) => return Ok(Step::Continue),
                Err(e) => e,
            };
            if err.class() != ErrorClass::Transient {
                return Err(err);
            }
            let delay = backoff.next_delay();
            warn!(
                partition = self.partition,
                attempt = backoff.attempts(),
                retry_in_ms = delay.as_millis() as u64,
                error = %err,
                "Failed to position partition, retrying"
            );
            if sleep_or_shutdown(&mut self.shutdown, delay).await {
                return Ok(Step::Stop);
            }
        }
    }

    async fn try_position(&mut self) -> Result<()> {
        let resume = match with_timeout_result(
            self.ctx.config.store_timeout,
            self.ctx.checkpoints.resume_position(self.partition),
        )
        .await
        {
            Ok(resume) => resume,
            Err(TimeoutError::Elapsed(d)) => return Err(SyncError::Timeout(d)),
            Err(TimeoutError::Inner(e)) => return Err(e.into()),
        };
        let checkpoint = resume.map(|position| position - 1);

        let target = if self.replay_from_beginning {
            self.last_applied = None;
            self.expected = None;
            SeekTarget::Beginning
        } else {
            self.last_applied = checkpoint;
            self.expected = resume;
            match resume {
                Some(position) => SeekTarget::Offset(position),
                None => SeekTarget::Beginning,
            }
        };
        self.source.seek(target).await?;

        if let Some(cp) = checkpoint {
            CDC_CHECKPOINT_POSITION
                .with_label_values(&[&self.partition_label])
                .set(cp);
        }
        info!(
            topic = %self.ctx.config.topic,
            partition = self.partition,
            checkpoint = ?checkpoint,
            target = ?target,
            "Partition positioned"
        );
        self.ctx.health.set_partition(
            self.partition,
            PartitionState::Running {
                last_applied: checkpoint,
            },
        );
        Ok(())
    }

    async fn consume(&mut self) -> WorkerExit {
        loop {
            let next = tokio::select! {
                biased;
                _ = wait_for_shutdown(&mut self.shutdown) => return WorkerExit::Stopped,
                next = self.source.next_message(self.ctx.config.poll_timeout) => next,
            };

            let message = match next {
                Ok(Some(message)) => {
                    self.read_backoff.reset();
                    message
                }
                Ok(None) => continue,
                Err(BrokerError::EndOfStream) => return WorkerExit::EndOfStream,
                Err(e) if e.class() == ErrorClass::Transient => {
                    if self.back_off_read(&e).await {
                        return WorkerExit::Stopped;
                    }
                    continue;
                }
                Err(e) => return WorkerExit::Failed(e.into()),
            };

            match self.handle_message(message).await {
                Ok(Step::Continue) => {}
                Ok(Step::Stop) => return WorkerExit::Stopped,
                Err(e) => return WorkerExit::Failed(e),
            }
        }
    }

    /// Returns true if shutdown was signalled while waiting.
    async fn back_off_read(&mut self, err: &BrokerError) -> bool {
        let delay = self.read_backoff.next_delay();
        if self.read_backoff.should_alert() {
            error!(
                partition = self.partition,
                attempt = self.read_backoff.attempts(),
                error = %err,
                "Partition read keeps failing"
            );
        } else {
            warn!(
                partition = self.partition,
                attempt = self.read_backoff.attempts(),
                error = %err,
                "Partition read failed, retrying"
            );
        }
        sleep_or_shutdown(&mut self.shutdown, delay).await
    }

    async fn handle_message(&mut self, message: RawMessage) -> Result<Step> {
        let offset = message.offset;

        if let Some(cp) = self.last_applied {
            if offset <= cp {
                debug!(partition = self.partition, offset, checkpoint = cp, "Skipping duplicate delivery");
                CDC_MESSAGES_SKIPPED
                    .with_label_values(&[&self.partition_label, SkipReason::Duplicate.as_str()])
                    .inc();
                return Ok(Step::Continue);
            }
        }

        if let Some(expected) = self.expected {
            if offset > expected {
                if self.pending_gap != Some(offset) {
                    warn!(
                        partition = self.partition,
                        expected,
                        received = offset,
                        "Offset gap detected, re-seeking to expected offset"
                    );
                    match self.source.seek(SeekTarget::Offset(expected)).await {
                        Ok(()) => self.pending_gap = Some(offset),
                        Err(e) if e.class() == ErrorClass::Transient => {
                            if self.back_off_read(&e).await {
                                return Ok(Step::Stop);
                            }
                        }
                        Err(e) => return Err(e.into()),
                    }
                    return Ok(Step::Continue);
                }
                // compaction and transaction markers leave real holes
                warn!(
                    partition = self.partition,
                    expected,
                    received = offset,
                    "Offset gap confirmed after re-seek, continuing"
                );
            }
        }
        self.pending_gap = None;

        self.process(message).await
    }

    fn disposition(&self, message: &RawMessage) -> Disposition {
        let payload = match &message.payload {
            Some(payload) => payload,
            None => return Disposition::Skip(SkipReason::BrokerTombstone),
        };

        match self.ctx.decoder.decode(payload, message.offset) {
            Ok(record) => Disposition::Apply(record),
            Err(e) => {
                error!(
                    partition = self.partition,
                    offset = message.offset,
                    error = %e,
                    "Undecodable change record"
                );
                Disposition::DeadLetter(self.dead_letter(message, None, &SyncError::from(e), 1))
            }
        }
    }

    fn dead_letter(
        &self,
        message: &RawMessage,
        entity_id: Option<String>,
        err: &SyncError,
        attempts: u32,
    ) -> DeadLetterRecord {
        DeadLetterRecord::new(
            &self.ctx.config.consumer_group,
            &self.ctx.config.topic,
            message,
            err.to_string(),
            err.class(),
        )
        .with_entity_id(entity_id)
        .with_attempts(attempts)
    }

    /// Drive one message to a committed unit of work, retrying per error class.
    ///
    /// Only constraint failures count against `max_constraint_attempts`. A
    /// dead letter that the store itself rejects is retried once without its
    /// entity id before the partition is stopped.
    async fn process(&mut self, message: RawMessage) -> Result<Step> {
        let mut disposition = self.disposition(&message);
        let mut backoff = Backoff::new(self.ctx.config.retry.clone());
        let mut constraint_attempts = 0u32;
        let mut degraded = false;

        loop {
            let err = match with_timeout_result(
                self.ctx.config.store_timeout,
                Self::commit_unit(&self.ctx, self.partition, &message, &disposition),
            )
            .await
            {
                Ok(committed) => {
                    self.on_committed(&message, committed).await;
                    return Ok(Step::Continue);
                }
                Err(TimeoutError::Elapsed(d)) => SyncError::Timeout(d),
                Err(TimeoutError::Inner(e)) => e,
            };

            let class = err.class();
            if class == ErrorClass::Constraint {
                constraint_attempts += 1;
            }

            match (class, &disposition) {
                (ErrorClass::Transient, _) => {}
                (ErrorClass::Constraint, Disposition::Apply(_))
                    if constraint_attempts < self.ctx.config.max_constraint_attempts => {}
                (ErrorClass::Constraint | ErrorClass::Permanent, Disposition::Apply(record)) => {
                    error!(
                        partition = self.partition,
                        offset = message.offset,
                        entity_id = %record.entity_id,
                        attempts = constraint_attempts.max(1),
                        error_class = %class,
                        error = %err,
                        "Routing change record to dead letters"
                    );
                    let entity_id = Some(record.entity_id.clone());
                    disposition = Disposition::DeadLetter(self.dead_letter(
                        &message,
                        entity_id,
                        &err,
                        constraint_attempts,
                    ));
                    continue;
                }
                (ErrorClass::Constraint | ErrorClass::Permanent, Disposition::DeadLetter(record))
                    if !degraded =>
                {
                    warn!(
                        partition = self.partition,
                        offset = message.offset,
                        error_class = %class,
                        error = %err,
                        "Dead letter rejected by the store, retrying with payload only"
                    );
                    disposition = Disposition::DeadLetter(record.degraded());
                    degraded = true;
                    continue;
                }
                _ => {
                    error!(
                        partition = self.partition,
                        offset = message.offset,
                        error_class = %class,
                        error = %err,
                        "Fatal error, stopping partition"
                    );
                    return Err(err);
                }
            }

            CDC_RETRIES
                .with_label_values(&[&self.partition_label, class.as_str()])
                .inc();
            let delay = backoff.next_delay();
            if backoff.should_alert() {
                error!(
                    partition = self.partition,
                    offset = message.offset,
                    attempt = backoff.attempts(),
                    error_class = %class,
                    error = %err,
                    "Unit of work keeps failing"
                );
                self.ctx.health.set_partition(
                    self.partition,
                    PartitionState::Retrying {
                        attempts: backoff.attempts(),
                        error: err.to_string(),
                    },
                );
            } else {
                warn!(
                    partition = self.partition,
                    offset = message.offset,
                    attempt = backoff.attempts(),
                    retry_in_ms = delay.as_millis() as u64,
                    error_class = %class,
                    error = %err,
                    "Unit of work failed, retrying"
                );
            }

            if sleep_or_shutdown(&mut self.shutdown, delay).await {
                return Ok(Step::Stop);
            }
        }
    }

    /// One unit of work: the row change (or dead letter) plus the checkpoint.
    async fn commit_unit(
        ctx: &PipelineContext,
        partition: i32,
        message: &RawMessage,
        disposition: &Disposition,
    ) -> Result<Committed> {
        let mut unit = ctx.store.begin().await?;

        let committed = match disposition {
            Disposition::Apply(record) => {
                Committed::Applied(ctx.applier.apply(unit.as_mut(), record).await?)
            }
            Disposition::Skip(reason) => Committed::Applied(ApplyOutcome::Skipped(*reason)),
            Disposition::DeadLetter(record) => {
                unit.record_dead_letter(record).await?;
                Committed::DeadLettered(record.clone())
            }
        };

        ctx.checkpoints
            .advance(unit.as_mut(), partition, message.offset)
            .await?;
        unit.commit().await?;
        Ok(committed)
    }

    async fn on_committed(&mut self, message: &RawMessage, committed: Committed) {
        let offset = message.offset;
        self.last_applied = Some(offset);
        self.expected = Some(offset.saturating_add(1));

        CDC_CHECKPOINT_POSITION
            .with_label_values(&[&self.partition_label])
            .set(offset);
        self.ctx.health.set_partition(
            self.partition,
            PartitionState::Running {
                last_applied: Some(offset),
            },
        );

        if let Err(e) = self.source.acknowledge(offset.saturating_add(1)).await {
            warn!(
                partition = self.partition,
                offset,
                error = %e,
                "Failed to mirror progress to the broker"
            );
        }

        match committed {
            Committed::Applied(ApplyOutcome::Skipped(reason)) => {
                CDC_MESSAGES_SKIPPED
                    .with_label_values(&[&self.partition_label, reason.as_str()])
                    .inc();
            }
            Committed::Applied(outcome) => {
                CDC_MESSAGES_APPLIED
                    .with_label_values(&[&self.partition_label, outcome.label()])
                    .inc();
            }
            Committed::DeadLettered(record) => {
                CDC_DEAD_LETTERS
                    .with_label_values(&[&self.partition_label, record.error_class.as_str()])
                    .inc();
                if let Some(sink) = &self.ctx.dead_letter_sink {
                    // published off the partition loop; the table row is the durable copy
                    let sink = Arc::clone(sink);
                    tokio::spawn(async move {
                        if sink.publish(&record).await.is_err() {
                            CDC_DEAD_LETTER_MIRROR_FAILURES.inc();
                        }
                    });
                }
            }
        }
    }

    async fn finish(mut self, exit: WorkerExit) -> WorkerExit {
        match &exit {
            WorkerExit::Failed(err) => {
                if let Err(e) = self.source.pause().await {
                    warn!(partition = self.partition, error = %e, "Failed to pause partition");
                }
                error!(
                    topic = %self.ctx.config.topic,
                    partition = self.partition,
                    last_applied = ?self.last_applied,
                    error = %err,
                    "Partition worker failed; partition paused"
                );
                self.ctx.health.set_partition(
                    self.partition,
                    PartitionState::Failed {
                        error: err.to_string(),
                    },
                );
            }
            WorkerExit::Stopped | WorkerExit::EndOfStream => {
                let reason = if matches!(exit, WorkerExit::Stopped) {
                    "shutdown"
                } else {
                    "end of stream"
                };
                info!(
                    topic = %self.ctx.config.topic,
                    partition = self.partition,
                    last_applied = ?self.last_applied,
                    reason,
                    "Partition worker stopped"
                );
                self.ctx.health.set_partition(
                    self.partition,
                    PartitionState::Stopped {
                        reason: reason.to_string(),
                    },
                );
            }
        }
        exit
    }
}

/// Resolves once shutdown is signalled or the sender is gone.
pub(crate) async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow_and_update() {
            return;
        }
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

/// Sleep for `delay`; returns true if shutdown interrupted the sleep.
async fn sleep_or_shutdown(shutdown: &mut watch::Receiver<bool>, delay: Duration) -> bool {
    tokio::select! {
        _ = wait_for_shutdown(shutdown) => true,
        _ = tokio::time::sleep(delay) => false,
    }
}
