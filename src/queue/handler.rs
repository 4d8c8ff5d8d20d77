//! Task Handler
//!
//! Turns a batch of tasks into executor calls and the executors' verdicts into
//! lifecycle transitions.
//!
//! ## Dispatch
//! Tasks are grouped by type in order of first appearance. A `multiple`
//! executor gets its whole group in one call; otherwise each task gets its own
//! call, concurrently when `parallel` is set and one after another when not.
//!
//! ## Settlement
//! Each task is settled once through [`TaskActions`]: success, failure, ignore
//! or handoff to the [`AsyncTaskManager`]. A task left unsettled when its call
//! returns is failed, with the call's error if it returned one.
//!
//! ## Retries
//! A failed task with retries left is rescheduled `retry_after` later with its
//! retry count incremented. Past `max_retries` it is discarded and reported.

use super::async_tasks::AsyncTaskManager;
use super::notify::Notifications;
use super::registry::{RegisteredExecutor, TaskQueueManager};
use super::storage::TaskStorage;
use super::types::{ExecutionStats, ExecutorConfig, ProcessOutcome, Task, TaskId, TaskStatus};
use crate::types::now_ms;

use anyhow::Result;
use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::FutureExt;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

/// A record isolated by a shard consumer after exhausting its attempts.
#[derive(Debug, Clone)]
pub struct PoisonRecord {
    pub shard_id: String,
    pub sequence_number: u64,
    /// `None` when the record could not be decoded at all.
    pub task: Option<Task>,
    pub reason: String,
}

/// Anything a queue backend can hand a batch of tasks to.
#[async_trait]
pub trait BatchProcessor: Send + Sync {
    /// Handles `tasks` and reports what happened to each. `Err` means the
    /// batch as a whole failed and none of it should be considered handled.
    async fn process(&self, queue_id: &str, tasks: Vec<Task>) -> Result<ProcessOutcome>;

    async fn on_poison(&self, _queue_id: &str, _poison: PoisonRecord) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone)]
enum Settlement {
    Success,
    Failure(String),
    Ignored,
    HandedOff,
}

/// Settlement handle given to executors. Only the first settlement of a task counts.
#[derive(Clone)]
pub struct TaskActions {
    settlements: Arc<DashMap<TaskId, Settlement>>,
    async_tasks: Arc<AsyncTaskManager>,
}

impl TaskActions {
    fn new(async_tasks: Arc<AsyncTaskManager>) -> Self {
        Self {
            settlements: Arc::new(DashMap::new()),
            async_tasks,
        }
    }

    fn settle(&self, task: &Task, settlement: Settlement) -> bool {
        match self.settlements.entry(task.id.clone()) {
            Entry::Occupied(_) => {
                tracing::warn!("Task {} was already settled; ignoring {:?}", task.id, settlement);
                false
            }
            Entry::Vacant(slot) => {
                slot.insert(settlement);
                true
            }
        }
    }

    fn is_settled(&self, id: &TaskId) -> bool {
        self.settlements.contains_key(id)
    }

    fn settlement(&self, id: &TaskId) -> Option<Settlement> {
        self.settlements.get(id).map(|entry| entry.value().clone())
    }

    pub fn success(&self, task: &Task) -> bool {
        self.settle(task, Settlement::Success)
    }

    pub fn fail(&self, task: &Task, error: impl Into<String>) -> bool {
        self.settle(task, Settlement::Failure(error.into()))
    }

    pub fn ignore(&self, task: &Task) -> bool {
        self.settle(task, Settlement::Ignored)
    }

    /// Hands `work` to the async task manager. On `false` nothing was started
    /// and the caller must settle the task itself.
    pub fn handoff<F>(&self, task: &Task, work: F) -> bool
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        if self.is_settled(&task.id) {
            tracing::warn!("Task {} was already settled; not handing it off", task.id);
            return false;
        }
        if !self.async_tasks.handoff(task, Box::pin(work)) {
            return false;
        }
        self.settle(task, Settlement::HandedOff)
    }
}

pub struct TaskHandler {
    manager: Arc<TaskQueueManager>,
    async_tasks: Arc<AsyncTaskManager>,
    storage: Option<Arc<dyn TaskStorage>>,
    notifications: Notifications,
}

impl TaskHandler {
    pub fn new(manager: Arc<TaskQueueManager>, async_tasks: Arc<AsyncTaskManager>) -> Self {
        Self {
            manager,
            async_tasks,
            storage: None,
            notifications: Notifications::noop(),
        }
    }

    /// Lifecycle transitions are written through `storage`.
    pub fn with_storage(mut self, storage: Arc<dyn TaskStorage>) -> Self {
        self.storage = Some(storage);
        self
    }

    pub fn with_notifications(mut self, notifications: Notifications) -> Self {
        self.notifications = notifications;
        self
    }

    pub fn manager(&self) -> &Arc<TaskQueueManager> {
        &self.manager
    }

    pub fn async_tasks(&self) -> &Arc<AsyncTaskManager> {
        &self.async_tasks
    }

    async fn invoke(executor: &RegisteredExecutor, tasks: Vec<Task>, actions: &TaskActions) {
        let call = (executor.on_task)(tasks.clone(), actions.clone());
        let result = match AssertUnwindSafe(call).catch_unwind().await {
            Ok(result) => result,
            Err(_) => Err(anyhow::anyhow!("executor panicked")),
        };

        for task in &tasks {
            if actions.is_settled(&task.id) {
                continue;
            }
            match &result {
                Err(e) => {
                    actions.fail(task, e.to_string());
                }
                Ok(()) => {
                    tracing::warn!(
                        "Executor for {} returned without settling task {}",
                        task.task_type,
                        task.id
                    );
                    actions.fail(task, "executor did not settle the task");
                }
            }
        }
    }

    async fn dispatch(executor: &RegisteredExecutor, group: Vec<Task>, actions: &TaskActions) {
        if executor.config.multiple {
            Self::invoke(executor, group, actions).await;
        } else if executor.config.parallel {
            let calls = group
                .into_iter()
                .map(|task| Self::invoke(executor, vec![task], actions));
            futures::future::join_all(calls).await;
        } else {
            for task in group {
                Self::invoke(executor, vec![task], actions).await;
            }
        }
    }

    /// Writes a failure for `task`. Tasks the storage does not know are only
    /// written when their executor asked for `store_on_failure`.
    async fn store_failure(
        &self,
        storage: &Arc<dyn TaskStorage>,
        task: &Task,
        retry_at: Option<u64>,
        error: &str,
        store_on_failure: bool,
    ) -> Result<()> {
        if storage.get_task(&task.id).await?.is_some() {
            storage
                .mark_tasks_as_failed(std::slice::from_ref(&task.id), retry_at, error)
                .await?;
        } else if store_on_failure {
            let mut failed = task.clone();
            failed.status = TaskStatus::Failed;
            storage.upsert_task(failed).await?;
        }
        Ok(())
    }

    async fn finish(
        &self,
        queue_id: &str,
        tasks: Vec<Task>,
        configs: &HashMap<String, ExecutorConfig>,
        actions: &TaskActions,
        started_at: u64,
    ) -> Result<ProcessOutcome> {
        let now = now_ms();
        let mut outcome = ProcessOutcome::default();
        // (task as stored before this run, retry time, error, store_on_failure)
        let mut failures: Vec<(Task, Option<u64>, String, bool)> = Vec::new();

        for task in tasks {
            let config = configs.get(&task.task_type).cloned().unwrap_or_default();
            let settlement = actions
                .settlement(&task.id)
                .unwrap_or_else(|| Settlement::Failure("task was not dispatched".to_string()));

            match settlement {
                Settlement::Success => outcome.executed.push(task.id),
                Settlement::Ignored => outcome.ignored.push(task.id),
                Settlement::HandedOff => outcome.handed_off.push(task.id),
                Settlement::Failure(error) => {
                    let stats = ExecutionStats {
                        started_at,
                        finished_at: now,
                        duration_ms: now.saturating_sub(started_at),
                        error: Some(error.clone()),
                    };

                    if task.retry_count >= config.retry.max_retries {
                        tracing::warn!(
                            "Discarding task {} ({}) after {} retries: {}",
                            task.id,
                            task.task_type,
                            task.retry_count,
                            error
                        );
                        outcome.discarded.push(task.id.clone());
                        let mut failed = task;
                        failed.retry_count += 1;
                        failed.updated_at = now;
                        failed.execution_stats = Some(stats);
                        failures.push((failed, None, error, config.store_on_failure));
                    } else {
                        let retry_at = now + config.retry.retry_after.as_millis() as u64;
                        tracing::debug!(
                            "Task {} failed, retry {} at {}: {}",
                            task.id,
                            task.retry_count + 1,
                            retry_at,
                            error
                        );
                        let mut retry = task;
                        retry.retry_count += 1;
                        retry.status = TaskStatus::Scheduled;
                        retry.execute_at = retry_at;
                        retry.updated_at = now;
                        retry.execution_stats = Some(stats);
                        outcome.rescheduled.push(retry.clone());
                        failures.push((retry, Some(retry_at), error, config.store_on_failure));
                    }
                }
            }
        }

        if let Some(storage) = &self.storage {
            if !outcome.executed.is_empty() {
                storage.mark_tasks_as_executed(&outcome.executed).await?;
            }
            if !outcome.ignored.is_empty() {
                storage.mark_tasks_as_ignored(&outcome.ignored).await?;
            }
            for (task, retry_at, error, store_on_failure) in &failures {
                self.store_failure(storage, task, *retry_at, error, *store_on_failure)
                    .await?;
            }
        }

        if !outcome.discarded.is_empty() {
            self.notifications
                .tasks_discarded(queue_id, outcome.discarded.len());
        }

        Ok(outcome)
    }
}

/// Groups tasks by type, keeping the order in which types first appear.
fn group_by_type(tasks: &[Task]) -> Vec<(String, Vec<Task>)> {
    let mut groups: Vec<(String, Vec<Task>)> = Vec::new();
    for task in tasks {
        match groups.iter_mut().find(|(task_type, _)| task_type == &task.task_type) {
            Some((_, group)) => group.push(task.clone()),
            None => groups.push((task.task_type.clone(), vec![task.clone()])),
        }
    }
    groups
}

#[async_trait]
impl BatchProcessor for TaskHandler {
    async fn process(&self, queue_id: &str, tasks: Vec<Task>) -> Result<ProcessOutcome> {
        if tasks.is_empty() {
            return Ok(ProcessOutcome::default());
        }

        let started_at = now_ms();
        let actions = TaskActions::new(self.async_tasks.clone());
        let mut configs = HashMap::new();

        for (task_type, group) in group_by_type(&tasks) {
            match self.manager.resolve(queue_id, &task_type) {
                Some(executor) => {
                    configs.insert(task_type.clone(), executor.config.clone());
                    Self::dispatch(&executor, group, &actions).await;
                }
                None => {
                    tracing::warn!("No executor registered for {}/{}", queue_id, task_type);
                    for task in &group {
                        actions.fail(
                            task,
                            format!("no executor registered for {}/{}", queue_id, task_type),
                        );
                    }
                }
            }
        }

        let outcome = self
            .finish(queue_id, tasks, &configs, &actions, started_at)
            .await?;

        tracing::debug!(
            "Queue {}: executed={} handed_off={} ignored={} rescheduled={} discarded={}",
            queue_id,
            outcome.executed.len(),
            outcome.handed_off.len(),
            outcome.ignored.len(),
            outcome.rescheduled.len(),
            outcome.discarded.len()
        );
        Ok(outcome)
    }

    async fn on_poison(&self, queue_id: &str, poison: PoisonRecord) -> Result<()> {
        match &poison.task {
            Some(task) => {
                tracing::error!(
                    "Isolated poison task {} ({}) at {}/{}: {}",
                    task.id,
                    task.task_type,
                    poison.shard_id,
                    poison.sequence_number,
                    poison.reason
                );
                if let Some(storage) = &self.storage {
                    if storage.get_task(&task.id).await?.is_some() {
                        storage
                            .mark_tasks_as_ignored(std::slice::from_ref(&task.id))
                            .await?;
                    } else {
                        let mut ignored = task.clone();
                        ignored.status = TaskStatus::Ignored;
                        ignored.updated_at = now_ms();
                        storage.upsert_task(ignored).await?;
                    }
                }
            }
            None => {
                self.notifications.critical_error(format!(
                    "malformed record {} on shard {} of queue {} was skipped: {}",
                    poison.sequence_number, poison.shard_id, queue_id, poison.reason
                ));
            }
        }
        Ok(())
    }
}
