//! Async Task Manager
//!
//! Bounded registry for work an executor hands off to finish in the background.
//!
//! ## Rules
//! - A handoff is accepted only for a task with an id and only while fewer than
//!   `max_tasks` handoffs are in flight. A rejected handoff returns `false` and
//!   the executor must settle the task itself.
//! - Entries are removed by the manager when their future settles, never by callers.
//! - `shutdown` waits up to the grace period, then logs what is still running and returns.

use super::storage::TaskStorage;
use super::types::{Task, TaskId};

use anyhow::Result;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::FutureExt;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

pub const DEFAULT_MAX_ASYNC_TASKS: usize = 100;
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

struct AsyncTaskEntry {
    queue_id: String,
    task_type: String,
    started: Instant,
}

/// In-flight handoff, as reported on the status surface.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AsyncTaskInfo {
    pub task_id: TaskId,
    pub queue_id: String,
    pub task_type: String,
    pub running_ms: u64,
}

pub struct AsyncTaskManager {
    max_tasks: usize,
    grace: Duration,
    entries: DashMap<TaskId, AsyncTaskEntry>,
    /// Slots taken, including handoffs between reservation and insertion.
    reserved: AtomicUsize,
    accepting: AtomicBool,
    settled: Notify,
    storage: Option<Arc<dyn TaskStorage>>,
}

impl AsyncTaskManager {
    pub fn new(max_tasks: usize, grace: Duration) -> Arc<Self> {
        Self::build(max_tasks, grace, None)
    }

    /// Settled handoffs are also recorded as executed/failed in `storage`.
    pub fn with_storage(
        max_tasks: usize,
        grace: Duration,
        storage: Arc<dyn TaskStorage>,
    ) -> Arc<Self> {
        Self::build(max_tasks, grace, Some(storage))
    }

    fn build(
        max_tasks: usize,
        grace: Duration,
        storage: Option<Arc<dyn TaskStorage>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            max_tasks,
            grace,
            entries: DashMap::new(),
            reserved: AtomicUsize::new(0),
            accepting: AtomicBool::new(true),
            settled: Notify::new(),
            storage,
        })
    }

    pub fn max_tasks(&self) -> usize {
        self.max_tasks
    }

    pub fn len(&self) -> usize {
        self.reserved.load(Ordering::SeqCst)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn in_flight(&self) -> Vec<AsyncTaskInfo> {
        let mut tasks: Vec<AsyncTaskInfo> = self
            .entries
            .iter()
            .map(|entry| AsyncTaskInfo {
                task_id: entry.key().clone(),
                queue_id: entry.queue_id.clone(),
                task_type: entry.task_type.clone(),
                running_ms: entry.started.elapsed().as_millis() as u64,
            })
            .collect();
        tasks.sort_by(|a, b| a.task_id.cmp(&b.task_id));
        tasks
    }

    fn try_reserve(&self) -> bool {
        self.reserved
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |taken| {
                (taken < self.max_tasks).then_some(taken + 1)
            })
            .is_ok()
    }

    fn free_slot(&self) {
        self.reserved.fetch_sub(1, Ordering::SeqCst);
        self.settled.notify_waiters();
    }

    /// Takes ownership of `work` for `task`. Returns false if the handoff was rejected.
    pub fn handoff(self: &Arc<Self>, task: &Task, work: BoxFuture<'static, Result<()>>) -> bool {
        if task.id.is_empty() {
            tracing::warn!(
                "Rejected handoff of a {} task without an id",
                task.task_type
            );
            return false;
        }
        if !self.accepting.load(Ordering::SeqCst) {
            tracing::warn!("Rejected handoff of {}: shutting down", task.id);
            return false;
        }
        if !self.try_reserve() {
            tracing::warn!(
                "Rejected handoff of {}: {} async tasks already running",
                task.id,
                self.max_tasks
            );
            return false;
        }

        let inserted = match self.entries.entry(task.id.clone()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(AsyncTaskEntry {
                    queue_id: task.queue_id.clone(),
                    task_type: task.task_type.clone(),
                    started: Instant::now(),
                });
                true
            }
        };
        if !inserted {
            tracing::warn!("Rejected handoff of {}: already in flight", task.id);
            self.free_slot();
            return false;
        }

        let manager = self.clone();
        let task_id = task.id.clone();
        tokio::spawn(async move {
            let result = match AssertUnwindSafe(work).catch_unwind().await {
                Ok(result) => result,
                Err(_) => Err(anyhow::anyhow!("async task panicked")),
            };
            manager.settle(&task_id, result).await;
        });

        tracing::debug!("Accepted handoff of {} ({} in flight)", task.id, self.len());
        true
    }

    async fn settle(&self, task_id: &TaskId, result: Result<()>) {
        let elapsed = self
            .entries
            .get(task_id)
            .map(|entry| entry.started.elapsed())
            .unwrap_or_default();

        match &result {
            Ok(()) => tracing::info!("Async task {} finished in {:?}", task_id, elapsed),
            Err(e) => tracing::warn!("Async task {} failed after {:?}: {}", task_id, elapsed, e),
        }

        if let Some(storage) = &self.storage {
            let ids = [task_id.clone()];
            let stored = match &result {
                Ok(()) => storage.mark_tasks_as_executed(&ids).await,
                Err(e) => storage.mark_tasks_as_failed(&ids, None, &e.to_string()).await,
            };
            if let Err(e) = stored {
                tracing::warn!("Could not record outcome of async task {}: {}", task_id, e);
            }
        }

        self.entries.remove(task_id);
        self.free_slot();
    }

    /// Stops accepting handoffs and waits up to the grace period for in-flight
    /// ones. Returns how many were still running when it gave up.
    pub async fn shutdown(&self) -> usize {
        self.accepting.store(false, Ordering::SeqCst);
        let deadline = Instant::now() + self.grace;

        loop {
            let settled = self.settled.notified();
            if self.is_empty() {
                tracing::info!("Async task manager drained");
                return 0;
            }
            if tokio::time::timeout_at(deadline, settled).await.is_err() {
                break;
            }
        }

        let outstanding = self.in_flight();
        for task in &outstanding {
            tracing::warn!(
                "Async task {} ({}) still running after {:?} grace",
                task.task_id,
                task.task_type,
                self.grace
            );
        }
        self.len()
    }
}
