//! Queue Backends
//!
//! The uniform `Queue` contract plus the in-memory and storage-backed
//! implementations. The log-backed queue lives in the consumer module.

use super::handler::BatchProcessor;
use super::notify::Notifications;
use super::storage::TaskStorage;
use super::types::{NewTask, ProcessOutcome, RetryPolicy, Task, TaskId};
use crate::lock::manager::LockManager;
use crate::types::now_ms;

use anyhow::{Result, bail};
use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

pub const DEFAULT_BATCH_LIMIT: usize = 50;

#[async_trait]
pub trait Queue: Send + Sync {
    async fn register(&self, queue_id: &str) -> Result<()>;

    async fn add_messages(&self, queue_id: &str, messages: Vec<NewTask>) -> Result<Vec<TaskId>>;

    /// Consumes until `cancel` fires or the queue shuts down.
    async fn consume_messages_stream(
        &self,
        queue_id: &str,
        processor: Arc<dyn BatchProcessor>,
        cancel: CancellationToken,
    ) -> Result<()>;

    /// Consumes at most one batch of up to `limit` tasks.
    async fn consume_messages_batch(
        &self,
        queue_id: &str,
        processor: Arc<dyn BatchProcessor>,
        limit: Option<usize>,
    ) -> Result<ProcessOutcome>;

    async fn shutdown(&self) -> Result<()>;
}

/// Sleeps for `delay` unless `cancel` fires first. Returns false if cancelled.
pub(crate) async fn pause(delay: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}

// ============================================================
// IN-MEMORY QUEUE
// ============================================================

/// Process-local FIFO per queue. Rescheduled tasks go to the back and wait
/// for their `execute_at`.
pub struct MemoryQueue {
    queues: DashMap<String, VecDeque<Task>>,
    poll_interval: Duration,
    stopped: CancellationToken,
}

impl MemoryQueue {
    pub fn new(poll_interval: Duration) -> Arc<Self> {
        Arc::new(Self {
            queues: DashMap::new(),
            poll_interval,
            stopped: CancellationToken::new(),
        })
    }

    pub fn pending(&self, queue_id: &str) -> usize {
        self.queues.get(queue_id).map(|queue| queue.len()).unwrap_or(0)
    }

    /// Takes up to `limit` due tasks, keeping the rest in order.
    fn take_due(&self, queue_id: &str, limit: usize) -> Result<Vec<Task>> {
        let Some(mut queue) = self.queues.get_mut(queue_id) else {
            bail!("queue {} is not registered", queue_id);
        };
        let now = now_ms();
        let mut taken = Vec::new();
        let mut kept = VecDeque::with_capacity(queue.len());
        while let Some(task) = queue.pop_front() {
            if taken.len() < limit && task.is_due(now) {
                taken.push(task);
            } else {
                kept.push_back(task);
            }
        }
        *queue = kept;
        Ok(taken)
    }

    fn requeue(&self, queue_id: &str, tasks: Vec<Task>) {
        if let Some(mut queue) = self.queues.get_mut(queue_id) {
            queue.extend(tasks);
        }
    }
}

#[async_trait]
impl Queue for MemoryQueue {
    async fn register(&self, queue_id: &str) -> Result<()> {
        self.queues.entry(queue_id.to_string()).or_default();
        tracing::info!("Registered in-memory queue {}", queue_id);
        Ok(())
    }

    async fn add_messages(&self, queue_id: &str, messages: Vec<NewTask>) -> Result<Vec<TaskId>> {
        let Some(mut queue) = self.queues.get_mut(queue_id) else {
            bail!("queue {} is not registered", queue_id);
        };
        let mut ids = Vec::with_capacity(messages.len());
        for mut message in messages {
            let id = message.id.take().unwrap_or_default();
            ids.push(id.clone());
            queue.push_back(Task::scheduled(queue_id, id, message));
        }
        Ok(ids)
    }

    async fn consume_messages_stream(
        &self,
        queue_id: &str,
        processor: Arc<dyn BatchProcessor>,
        cancel: CancellationToken,
    ) -> Result<()> {
        tracing::info!("Consuming in-memory queue {}", queue_id);
        while !cancel.is_cancelled() && !self.stopped.is_cancelled() {
            match self
                .consume_messages_batch(queue_id, processor.clone(), None)
                .await
            {
                Ok(outcome) if outcome.total() > 0 => continue,
                Ok(_) => {}
                Err(e) => tracing::warn!("Batch on queue {} failed: {}", queue_id, e),
            }
            if !pause(self.poll_interval, &cancel).await {
                break;
            }
        }
        Ok(())
    }

    async fn consume_messages_batch(
        &self,
        queue_id: &str,
        processor: Arc<dyn BatchProcessor>,
        limit: Option<usize>,
    ) -> Result<ProcessOutcome> {
        let tasks = self.take_due(queue_id, limit.unwrap_or(DEFAULT_BATCH_LIMIT))?;
        if tasks.is_empty() {
            return Ok(ProcessOutcome::default());
        }

        match processor.process(queue_id, tasks.clone()).await {
            Ok(outcome) => {
                self.requeue(queue_id, outcome.rescheduled.clone());
                Ok(outcome)
            }
            Err(e) => {
                // Nothing was handled; put the batch back untouched.
                self.requeue(queue_id, tasks);
                Err(e)
            }
        }
    }

    async fn shutdown(&self) -> Result<()> {
        self.stopped.cancel();
        Ok(())
    }
}

// ============================================================
// STORAGE-BACKED QUEUE
// ============================================================

#[derive(Debug, Clone)]
pub struct StorageQueueConfig {
    pub poll_interval: Duration,
    pub batch_limit: usize,
    /// Applied when a whole batch fails.
    pub retry: RetryPolicy,
    /// Processing tasks untouched for this long are expired by maintenance.
    pub processing_timeout: Duration,
    /// Finished tasks older than this are deleted by maintenance.
    pub retention: Duration,
    pub maintenance_interval: Duration,
}

impl Default for StorageQueueConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            batch_limit: DEFAULT_BATCH_LIMIT,
            retry: RetryPolicy::default(),
            processing_timeout: Duration::from_secs(600),
            retention: Duration::from_secs(24 * 60 * 60),
            maintenance_interval: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MaintenanceReport {
    pub expired: usize,
    pub deleted: usize,
}

/// Database-style queue: tasks live in a [`TaskStorage`] and are claimed
/// atomically before dispatch, so several instances can share one store.
pub struct StorageQueue {
    storage: Arc<dyn TaskStorage>,
    /// Elects one instance per maintenance interval.
    locks: Arc<LockManager>,
    notifications: Notifications,
    config: StorageQueueConfig,
    registered: DashMap<String, ()>,
    stopped: AtomicBool,
}

impl StorageQueue {
    pub fn new(
        storage: Arc<dyn TaskStorage>,
        locks: Arc<LockManager>,
        notifications: Notifications,
        config: StorageQueueConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            storage,
            locks,
            notifications,
            config,
            registered: DashMap::new(),
            stopped: AtomicBool::new(false),
        })
    }

    fn ensure_registered(&self, queue_id: &str) -> Result<()> {
        if !self.registered.contains_key(queue_id) {
            bail!("queue {} is not registered", queue_id);
        }
        Ok(())
    }

    /// Expires stale processing tasks and deletes old finished ones, if this
    /// instance wins the maintenance lock for the current interval.
    pub async fn run_maintenance(&self, queue_id: &str) -> Result<Option<MaintenanceReport>> {
        let resource = format!("queue-maintenance:{}", queue_id);
        let interval_secs = self.config.maintenance_interval.as_secs().max(1);
        if !self.locks.acquire(&resource, interval_secs).await? {
            tracing::trace!("Maintenance of {} runs elsewhere", queue_id);
            return Ok(None);
        }

        let now = now_ms();
        let stale_cutoff = now.saturating_sub(self.config.processing_timeout.as_millis() as u64);
        let retention_cutoff = now.saturating_sub(self.config.retention.as_millis() as u64);

        let report = MaintenanceReport {
            expired: self.storage.expire_stale_tasks(queue_id, stale_cutoff).await?,
            deleted: self
                .storage
                .delete_finished_before(queue_id, retention_cutoff)
                .await?,
        };
        tracing::debug!(
            "Maintenance of {}: expired={} deleted={}",
            queue_id,
            report.expired,
            report.deleted
        );

        self.notifications
            .queue_stats(self.storage.queue_stats(queue_id).await?);
        Ok(Some(report))
    }
}

#[async_trait]
impl Queue for StorageQueue {
    async fn register(&self, queue_id: &str) -> Result<()> {
        self.registered.insert(queue_id.to_string(), ());
        tracing::info!("Registered storage queue {}", queue_id);
        Ok(())
    }

    async fn add_messages(&self, queue_id: &str, messages: Vec<NewTask>) -> Result<Vec<TaskId>> {
        self.ensure_registered(queue_id)?;
        let tasks: Vec<Task> = messages
            .into_iter()
            .map(|mut message| {
                let id = message
                    .id
                    .take()
                    .unwrap_or_else(|| self.storage.generate_task_id());
                Task::scheduled(queue_id, id, message)
            })
            .collect();
        self.storage.insert_tasks(tasks).await
    }

    async fn consume_messages_stream(
        &self,
        queue_id: &str,
        processor: Arc<dyn BatchProcessor>,
        cancel: CancellationToken,
    ) -> Result<()> {
        self.ensure_registered(queue_id)?;
        tracing::info!("Consuming storage queue {}", queue_id);

        let mut next_maintenance = Instant::now();

        while !cancel.is_cancelled() && !self.stopped.load(Ordering::SeqCst) {
            if Instant::now() >= next_maintenance {
                if let Err(e) = self.run_maintenance(queue_id).await {
                    tracing::warn!("Maintenance of {} failed: {}", queue_id, e);
                }
                next_maintenance = Instant::now() + self.config.maintenance_interval;
            }

            match self
                .consume_messages_batch(queue_id, processor.clone(), None)
                .await
            {
                Ok(outcome) if outcome.total() > 0 => continue,
                Ok(_) => {}
                Err(e) => tracing::warn!("Batch on queue {} failed: {}", queue_id, e),
            }
            if !pause(self.config.poll_interval, &cancel).await {
                break;
            }
        }
        Ok(())
    }

    async fn consume_messages_batch(
        &self,
        queue_id: &str,
        processor: Arc<dyn BatchProcessor>,
        limit: Option<usize>,
    ) -> Result<ProcessOutcome> {
        self.ensure_registered(queue_id)?;
        let limit = limit.unwrap_or(self.config.batch_limit);

        let candidates = self.storage.find_scheduled_tasks(queue_id, limit).await?;
        if candidates.is_empty() {
            return Ok(ProcessOutcome::default());
        }
        let ids: Vec<TaskId> = candidates.iter().map(|task| task.id.clone()).collect();
        let claimed = self.storage.mark_tasks_as_processing(&ids).await?;
        let tasks: Vec<Task> = candidates
            .into_iter()
            .filter(|task| claimed.contains(&task.id))
            .collect();
        if tasks.is_empty() {
            return Ok(ProcessOutcome::default());
        }

        let (retryable, exhausted): (Vec<&Task>, Vec<&Task>) = tasks
            .iter()
            .partition(|task| task.retry_count < self.config.retry.max_retries);
        let retryable: Vec<TaskId> = retryable.into_iter().map(|task| task.id.clone()).collect();
        let exhausted: Vec<TaskId> = exhausted.into_iter().map(|task| task.id.clone()).collect();

        match processor.process(queue_id, tasks).await {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                let error = e.to_string();
                let retry_at = now_ms() + self.config.retry.retry_after.as_millis() as u64;
                self.storage
                    .mark_tasks_as_failed(&retryable, Some(retry_at), &error)
                    .await?;
                if !exhausted.is_empty() {
                    self.storage
                        .mark_tasks_as_failed(&exhausted, None, &error)
                        .await?;
                    self.notifications.tasks_discarded(queue_id, exhausted.len());
                }
                Err(e)
            }
        }
    }

    async fn shutdown(&self) -> Result<()> {
        self.stopped.store(true, Ordering::SeqCst);
        Ok(())
    }
}
