use crate::types::now_ms;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Unique identifier for a task.
///
/// Wrapper around a UUID string. Tasks decoded from the log without an id get
/// one derived from their shard and sequence number instead.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(pub String);

impl TaskId {
    /// Generates a new random UUID v4-based TaskId.
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TaskId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Lifecycle state of a task.
///
/// `Scheduled -> Processing -> Executed | Failed | Expired | Ignored`. A failed
/// task that still has retries left goes back to `Scheduled`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    /// Waiting for `execute_at` and a consumer.
    Scheduled,
    /// Claimed by a consumer and handed to an executor.
    Processing,
    Executed,
    /// Failed with no retries left.
    Failed,
    /// Stuck in `Processing` past the stale cutoff.
    Expired,
    /// Isolated poison task, or explicitly ignored by its executor.
    Ignored,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Executed | TaskStatus::Failed | TaskStatus::Expired | TaskStatus::Ignored
        )
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExecutionStats {
    pub started_at: u64,
    pub finished_at: u64,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// A unit of work owned by one queue.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Task {
    pub id: TaskId,
    pub task_type: String,
    #[serde(default)]
    pub payload: serde_json::Value,
    pub status: TaskStatus,
    #[serde(default)]
    pub retry_count: u32,
    pub created_at: u64,
    pub updated_at: u64,
    /// Not to be dispatched before this timestamp (ms).
    pub execute_at: u64,
    pub queue_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partition_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_stats: Option<ExecutionStats>,
}

impl Task {
    /// Materializes a producer's message as a scheduled task of `queue_id`.
    pub fn scheduled(queue_id: &str, id: TaskId, message: NewTask) -> Self {
        let now = now_ms();
        Self {
            id,
            task_type: message.task_type,
            payload: message.payload,
            status: TaskStatus::Scheduled,
            retry_count: 0,
            created_at: now,
            updated_at: now,
            execute_at: message.execute_at.unwrap_or(now),
            queue_id: queue_id.to_string(),
            partition_key: message.partition_key,
            execution_stats: None,
        }
    }

    pub fn is_due(&self, now: u64) -> bool {
        self.execute_at <= now
    }

    /// Key used to place the task on a log shard.
    pub fn routing_key(&self) -> &str {
        self.partition_key.as_deref().unwrap_or(self.id.as_str())
    }
}

/// What a producer submits.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NewTask {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<TaskId>,
    pub task_type: String,
    #[serde(default)]
    pub payload: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execute_at: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partition_key: Option<String>,
}

impl NewTask {
    pub fn new(task_type: &str, payload: serde_json::Value) -> Self {
        Self {
            id: None,
            task_type: task_type.to_string(),
            payload,
            execute_at: None,
            partition_key: None,
        }
    }

    pub fn with_id(mut self, id: TaskId) -> Self {
        self.id = Some(id);
        self
    }

    pub fn with_partition_key(mut self, key: &str) -> Self {
        self.partition_key = Some(key.to_string());
        self
    }

    pub fn with_execute_at(mut self, execute_at: u64) -> Self {
        self.execute_at = Some(execute_at);
        self
    }
}

/// How often a failed task is retried before it is discarded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub retry_after: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_after: Duration::from_secs(10),
        }
    }
}

/// Dispatch policy of one (queue, task type) executor.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutorConfig {
    /// Executor receives every same-type task of a batch in one call.
    pub multiple: bool,
    /// Single-task calls for the same type run concurrently instead of one by one.
    pub parallel: bool,
    /// Failed tasks are written to the storage adapter even if they did not come from it.
    pub store_on_failure: bool,
    #[serde(default)]
    pub retry: RetryPolicy,
}

/// Per-batch result reported by a batch processor.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProcessOutcome {
    pub executed: Vec<TaskId>,
    pub ignored: Vec<TaskId>,
    /// Accepted by the async task manager; they settle in the background.
    pub handed_off: Vec<TaskId>,
    /// Failed with retries left; `retry_count` is already incremented and
    /// `execute_at` moved to the retry time.
    pub rescheduled: Vec<Task>,
    /// Failed with no retries left and dropped.
    pub discarded: Vec<TaskId>,
}

impl ProcessOutcome {
    pub fn total(&self) -> usize {
        self.executed.len()
            + self.ignored.len()
            + self.handed_off.len()
            + self.rescheduled.len()
            + self.discarded.len()
    }

    pub fn failure_count(&self) -> usize {
        self.rescheduled.len() + self.discarded.len()
    }

    pub fn is_retrying(&self, id: &TaskId) -> bool {
        self.rescheduled.iter().any(|task| &task.id == id)
    }

    pub fn merge(&mut self, other: ProcessOutcome) {
        self.executed.extend(other.executed);
        self.ignored.extend(other.ignored);
        self.handed_off.extend(other.handed_off);
        self.rescheduled.extend(other.rescheduled);
        self.discarded.extend(other.discarded);
    }
}

/// Task counts per status for one queue.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct QueueStats {
    pub queue_id: String,
    pub scheduled: usize,
    pub processing: usize,
    pub executed: usize,
    pub failed: usize,
    pub expired: usize,
    pub ignored: usize,
}

impl QueueStats {
    pub fn new(queue_id: &str) -> Self {
        Self {
            queue_id: queue_id.to_string(),
            ..Default::default()
        }
    }

    pub fn record(&mut self, status: TaskStatus) {
        match status {
            TaskStatus::Scheduled => self.scheduled += 1,
            TaskStatus::Processing => self.processing += 1,
            TaskStatus::Executed => self.executed += 1,
            TaskStatus::Failed => self.failed += 1,
            TaskStatus::Expired => self.expired += 1,
            TaskStatus::Ignored => self.ignored += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.scheduled + self.processing + self.executed + self.failed + self.expired + self.ignored
    }
}
