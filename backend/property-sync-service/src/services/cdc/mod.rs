//! CDC pipeline: Debezium change records from Kafka applied to PostgreSQL.

pub mod applier;
pub mod broker;
pub mod checkpoint;
pub mod consumer;
pub mod dead_letter;
pub mod decoder;
pub mod health;
pub mod models;
pub mod schema;
pub mod store;
pub mod worker;

pub use applier::{ApplyOutcome, SkipReason, UpsertApplier};
pub use broker::{PartitionSource, RawMessage, ScriptedSource, SeekTarget, StartingOffset};
pub use checkpoint::CheckpointTracker;
pub use consumer::CdcConsumer;
pub use dead_letter::{DeadLetterSink, DlqConfig, KafkaDeadLetterSink};
pub use decoder::{ChangeDecoder, DecodeError};
pub use health::{PartitionState, PipelineHealth};
pub use models::{ChangeOperation, ChangeRecord};
pub use schema::{ColumnKind, ColumnValue, TargetSchema};
pub use store::{DeletePolicy, MemoryStore, PostgresStore, TargetStore, UnitOfWork};
pub use worker::{PartitionWorker, PipelineContext, WorkerConfig, WorkerExit};
