//! Task Storage Adapter
//!
//! The persistence contract the task pipeline writes lifecycle transitions
//! through, plus an in-memory implementation. Claims (`Scheduled -> Processing`)
//! are atomic per task, so two consumers never both claim one task.

use super::types::{ExecutionStats, QueueStats, Task, TaskId, TaskStatus};
use crate::types::now_ms;

use anyhow::Result;
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;

#[async_trait]
pub trait TaskStorage: Send + Sync {
    fn generate_task_id(&self) -> TaskId {
        TaskId::new()
    }

    /// Inserts new tasks; an id that already exists is left untouched.
    async fn insert_tasks(&self, tasks: Vec<Task>) -> Result<Vec<TaskId>>;

    /// Inserts or replaces a task.
    async fn upsert_task(&self, task: Task) -> Result<()>;

    async fn get_task(&self, id: &TaskId) -> Result<Option<Task>>;

    /// Due scheduled tasks of a queue, earliest `execute_at` first.
    async fn find_scheduled_tasks(&self, queue_id: &str, limit: usize) -> Result<Vec<Task>>;

    /// Claims tasks that are still scheduled. Returns the ids actually claimed.
    async fn mark_tasks_as_processing(&self, ids: &[TaskId]) -> Result<Vec<TaskId>>;

    async fn mark_tasks_as_executed(&self, ids: &[TaskId]) -> Result<usize>;

    /// Counts one more retry. `Some(retry_at)` reschedules the task, `None`
    /// makes the failure terminal.
    async fn mark_tasks_as_failed(
        &self,
        ids: &[TaskId],
        retry_at: Option<u64>,
        error: &str,
    ) -> Result<usize>;

    async fn mark_tasks_as_ignored(&self, ids: &[TaskId]) -> Result<usize>;

    async fn queue_stats(&self, queue_id: &str) -> Result<QueueStats>;

    /// Moves processing tasks not updated since `cutoff_ms` to `Expired`.
    async fn expire_stale_tasks(&self, queue_id: &str, cutoff_ms: u64) -> Result<usize>;

    /// Deletes terminal tasks last updated before `cutoff_ms`.
    async fn delete_finished_before(&self, queue_id: &str, cutoff_ms: u64) -> Result<usize>;
}

/// In-memory storage adapter.
pub struct MemoryTaskStorage {
    tasks: DashMap<TaskId, Task>,
}

impl MemoryTaskStorage {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            tasks: DashMap::new(),
        })
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    fn update<F>(&self, ids: &[TaskId], mut f: F) -> usize
    where
        F: FnMut(&mut Task) -> bool,
    {
        let mut changed = 0;
        for id in ids {
            if let Some(mut task) = self.tasks.get_mut(id)
                && f(&mut task)
            {
                task.updated_at = now_ms();
                changed += 1;
            }
        }
        changed
    }
}

impl Default for MemoryTaskStorage {
    fn default() -> Self {
        Self {
            tasks: DashMap::new(),
        }
    }
}

#[async_trait]
impl TaskStorage for MemoryTaskStorage {
    async fn insert_tasks(&self, tasks: Vec<Task>) -> Result<Vec<TaskId>> {
        let mut inserted = Vec::with_capacity(tasks.len());
        for task in tasks {
            let id = task.id.clone();
            self.tasks.entry(id.clone()).or_insert(task);
            inserted.push(id);
        }
        Ok(inserted)
    }

    async fn upsert_task(&self, task: Task) -> Result<()> {
        self.tasks.insert(task.id.clone(), task);
        Ok(())
    }

    async fn get_task(&self, id: &TaskId) -> Result<Option<Task>> {
        Ok(self.tasks.get(id).map(|task| task.clone()))
    }

    async fn find_scheduled_tasks(&self, queue_id: &str, limit: usize) -> Result<Vec<Task>> {
        let now = now_ms();
        let mut due: Vec<Task> = self
            .tasks
            .iter()
            .filter(|task| {
                task.queue_id == queue_id && task.status == TaskStatus::Scheduled && task.is_due(now)
            })
            .map(|task| task.clone())
            .collect();
        due.sort_by(|a, b| {
            (a.execute_at, a.created_at, &a.id).cmp(&(b.execute_at, b.created_at, &b.id))
        });
        due.truncate(limit);
        Ok(due)
    }

    async fn mark_tasks_as_processing(&self, ids: &[TaskId]) -> Result<Vec<TaskId>> {
        let mut claimed = Vec::new();
        for id in ids {
            if let Some(mut task) = self.tasks.get_mut(id)
                && task.status == TaskStatus::Scheduled
            {
                task.status = TaskStatus::Processing;
                task.updated_at = now_ms();
                claimed.push(id.clone());
            }
        }
        Ok(claimed)
    }

    async fn mark_tasks_as_executed(&self, ids: &[TaskId]) -> Result<usize> {
        Ok(self.update(ids, |task| {
            task.status = TaskStatus::Executed;
            true
        }))
    }

    async fn mark_tasks_as_failed(
        &self,
        ids: &[TaskId],
        retry_at: Option<u64>,
        error: &str,
    ) -> Result<usize> {
        let now = now_ms();
        Ok(self.update(ids, |task| {
            task.retry_count += 1;
            match retry_at {
                Some(at) => {
                    task.status = TaskStatus::Scheduled;
                    task.execute_at = at;
                }
                None => task.status = TaskStatus::Failed,
            }
            let started_at = task
                .execution_stats
                .as_ref()
                .map(|stats| stats.started_at)
                .unwrap_or(now);
            task.execution_stats = Some(ExecutionStats {
                started_at,
                finished_at: now,
                duration_ms: now.saturating_sub(started_at),
                error: Some(error.to_string()),
            });
            true
        }))
    }

    async fn mark_tasks_as_ignored(&self, ids: &[TaskId]) -> Result<usize> {
        Ok(self.update(ids, |task| {
            task.status = TaskStatus::Ignored;
            true
        }))
    }

    async fn queue_stats(&self, queue_id: &str) -> Result<QueueStats> {
        let mut stats = QueueStats::new(queue_id);
        for task in self.tasks.iter().filter(|task| task.queue_id == queue_id) {
            stats.record(task.status);
        }
        Ok(stats)
    }

    async fn expire_stale_tasks(&self, queue_id: &str, cutoff_ms: u64) -> Result<usize> {
        let mut expired = 0;
        for mut task in self.tasks.iter_mut() {
            if task.queue_id == queue_id
                && task.status == TaskStatus::Processing
                && task.updated_at < cutoff_ms
            {
                task.status = TaskStatus::Expired;
                task.updated_at = now_ms();
                expired += 1;
            }
        }
        if expired > 0 {
            tracing::warn!("Expired {} stale task(s) in queue {}", expired, queue_id);
        }
        Ok(expired)
    }

    async fn delete_finished_before(&self, queue_id: &str, cutoff_ms: u64) -> Result<usize> {
        let mut deleted = 0;
        self.tasks.retain(|_, task| {
            let finished =
                task.queue_id == queue_id && task.status.is_terminal() && task.updated_at < cutoff_ms;
            if finished {
                deleted += 1;
            }
            !finished
        });
        Ok(deleted)
    }
}
