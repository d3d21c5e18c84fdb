//! A partition source backed by a fixed message log.
//!
//! Behaves like a single Kafka partition: reads advance a cursor, `seek`
//! repositions it, and acknowledgements are recorded. Reading past the end
//! yields [`BrokerError::EndOfStream`], which stops the worker cleanly. Clones
//! share the same log so a test can inspect it after handing one to a worker.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::{BrokerError, PartitionSource, RawMessage, SeekTarget};

#[derive(Debug, Default)]
struct ScriptedLog {
    messages: Vec<RawMessage>,
    cursor: usize,
    failures: VecDeque<BrokerError>,
    delivered: Vec<i64>,
    seeks: Vec<SeekTarget>,
    acknowledged: Option<i64>,
    paused: bool,
}

#[derive(Debug, Clone)]
pub struct ScriptedSource {
    partition: i32,
    log: Arc<Mutex<ScriptedLog>>,
}

impl ScriptedSource {
    pub fn new(partition: i32) -> Self {
        Self {
            partition,
            log: Arc::new(Mutex::new(ScriptedLog::default())),
        }
    }

    /// Append a message at `offset` (offsets need not be contiguous).
    pub fn push(&self, offset: i64, payload: Option<Vec<u8>>) {
        self.with_log(|log| {
            log.messages.push(RawMessage {
                partition: self.partition,
                offset,
                key: None,
                payload,
                timestamp_ms: None,
            })
        });
    }

    pub fn push_json(&self, offset: i64, value: &serde_json::Value) {
        self.push(offset, Some(value.to_string().into_bytes()));
    }

    /// Fail the next read with `error` before delivering anything else.
    pub fn fail_next_read(&self, error: BrokerError) {
        self.with_log(|log| log.failures.push_back(error));
    }

    /// Offsets handed out by `next_message`, in delivery order.
    pub fn delivered(&self) -> Vec<i64> {
        self.with_log(|log| log.delivered.clone())
    }

    pub fn seeks(&self) -> Vec<SeekTarget> {
        self.with_log(|log| log.seeks.clone())
    }

    pub fn acknowledged(&self) -> Option<i64> {
        self.with_log(|log| log.acknowledged)
    }

    pub fn is_paused(&self) -> bool {
        self.with_log(|log| log.paused)
    }

    fn with_log<T>(&self, f: impl FnOnce(&mut ScriptedLog) -> T) -> T {
        let mut log = match self.log.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut log)
    }
}

#[async_trait]
impl PartitionSource for ScriptedSource {
    fn partition(&self) -> i32 {
        self.partition
    }

    async fn next_message(&mut self, _timeout: Duration) -> Result<Option<RawMessage>, BrokerError> {
        self.with_log(|log| {
            if let Some(error) = log.failures.pop_front() {
                return Err(error);
            }
            if log.paused {
                return Ok(None);
            }
            let message = log
                .messages
                .get(log.cursor)
                .cloned()
                .ok_or(BrokerError::EndOfStream)?;
            log.cursor += 1;
            log.delivered.push(message.offset);
            Ok(Some(message))
        })
    }

    async fn seek(&mut self, target: SeekTarget) -> Result<(), BrokerError> {
        self.with_log(|log| {
            log.seeks.push(target);
            log.cursor = match target {
                SeekTarget::Beginning => 0,
                SeekTarget::Offset(offset) => log
                    .messages
                    .iter()
                    .position(|m| m.offset >= offset)
                    .unwrap_or(log.messages.len()),
            };
        });
        Ok(())
    }

    async fn acknowledge(&mut self, next_offset: i64) -> Result<(), BrokerError> {
        self.with_log(|log| {
            log.acknowledged = Some(log.acknowledged.map_or(next_offset, |a| a.max(next_offset)));
        });
        Ok(())
    }

    async fn pause(&mut self) -> Result<(), BrokerError> {
        self.with_log(|log| log.paused = true);
        Ok(())
    }
}
