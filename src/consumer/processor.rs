//! Record Processor
//!
//! Decodes raw log records into tasks and runs a batch processor under a time
//! budget. Decoding is fail-fast: one malformed record fails the whole batch.

use crate::error::{ProcessorTimeoutError, RecordParseError};
use crate::queue::handler::BatchProcessor;
use crate::queue::types::{ProcessOutcome, Task, TaskId, TaskStatus};
use crate::stream::types::StreamRecord;

use anyhow::Result;
use std::time::Duration;

pub const DEFAULT_PROCESSOR_TIMEOUT: Duration = Duration::from_millis(300_000);

pub struct RecordProcessor {
    queue_id: String,
    timeout: Duration,
}

impl RecordProcessor {
    pub fn new(queue_id: &str, timeout: Duration) -> Self {
        Self {
            queue_id: queue_id.to_string(),
            timeout,
        }
    }

    pub fn queue_id(&self) -> &str {
        &self.queue_id
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Decodes one record. The task is re-homed to this processor's queue and
    /// a missing id is derived from the record's position.
    pub fn parse_record(&self, record: &StreamRecord) -> Result<Task, RecordParseError> {
        let malformed = |reason: String| RecordParseError {
            shard_id: record.shard_id.clone(),
            sequence_number: record.sequence_number,
            reason,
        };

        let mut task: Task =
            serde_json::from_slice(&record.data).map_err(|e| malformed(e.to_string()))?;
        if task.task_type.trim().is_empty() {
            return Err(malformed("empty task type".to_string()));
        }
        if task.id.is_empty() {
            task.id = TaskId(format!("{}:{}", record.shard_id, record.sequence_number));
        }
        if task.partition_key.is_none() {
            task.partition_key = Some(record.partition_key.clone());
        }
        task.queue_id = self.queue_id.clone();
        task.status = TaskStatus::Processing;
        Ok(task)
    }

    /// Decodes a batch, stopping at the first malformed record.
    pub fn parse_records(&self, records: &[StreamRecord]) -> Result<Vec<Task>, RecordParseError> {
        records.iter().map(|record| self.parse_record(record)).collect()
    }

    /// Runs `processor` on `tasks`, failing with [`ProcessorTimeoutError`] if
    /// it does not finish within the time budget.
    pub async fn dispatch(
        &self,
        processor: &dyn BatchProcessor,
        tasks: Vec<Task>,
    ) -> Result<ProcessOutcome> {
        match tokio::time::timeout(self.timeout, processor.process(&self.queue_id, tasks)).await {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!(
                    "Processor for {} timed out after {:?}",
                    self.queue_id,
                    self.timeout
                );
                Err(ProcessorTimeoutError {
                    queue_id: self.queue_id.clone(),
                    timeout_ms: self.timeout.as_millis() as u64,
                }
                .into())
            }
        }
    }
}
