//! Task Queue Registry
//!
//! Maps `(queue, task type)` pairs to executors. Queues exist only in this
//! in-memory registry and are rebuilt by registration at process start.

use super::handler::TaskActions;
use super::types::{ExecutorConfig, Task};

use anyhow::Result;
use dashmap::DashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// Type-erased executor. It receives one task, or every same-type task of a
/// batch when registered with `multiple`, and must settle each of them through
/// the given [`TaskActions`].
pub type TaskExecutorFn = Arc<
    dyn Fn(Vec<Task>, TaskActions) -> Pin<Box<dyn Future<Output = Result<()>> + Send>>
        + Send
        + Sync,
>;

#[derive(Clone)]
pub struct RegisteredExecutor {
    pub config: ExecutorConfig,
    pub on_task: TaskExecutorFn,
}

pub struct TaskQueueManager {
    /// `(queue, task type) -> executor`
    executors: DashMap<(String, String), RegisteredExecutor>,
}

impl TaskQueueManager {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Registers an executor for `task_type` on `queue_id`, replacing any previous one.
    pub fn register<F, Fut>(&self, queue_id: &str, task_type: &str, config: ExecutorConfig, on_task: F)
    where
        F: Fn(Vec<Task>, TaskActions) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let on_task: TaskExecutorFn = Arc::new(move |tasks, actions| {
            Box::pin(on_task(tasks, actions)) as Pin<Box<dyn Future<Output = Result<()>> + Send>>
        });

        tracing::info!(
            "Registered executor {}/{} (multiple={}, parallel={})",
            queue_id,
            task_type,
            config.multiple,
            config.parallel
        );
        self.executors.insert(
            (queue_id.to_string(), task_type.to_string()),
            RegisteredExecutor { config, on_task },
        );
    }

    pub fn resolve(&self, queue_id: &str, task_type: &str) -> Option<RegisteredExecutor> {
        self.executors
            .get(&(queue_id.to_string(), task_type.to_string()))
            .map(|entry| entry.value().clone())
    }

    pub fn has_executor(&self, queue_id: &str, task_type: &str) -> bool {
        self.executors
            .contains_key(&(queue_id.to_string(), task_type.to_string()))
    }

    /// Sorted names of queues with at least one executor.
    pub fn list_queues(&self) -> Vec<String> {
        let mut queues: Vec<String> = self
            .executors
            .iter()
            .map(|entry| entry.key().0.clone())
            .collect();
        queues.sort();
        queues.dedup();
        queues
    }

    /// Sorted task types registered on `queue_id`.
    pub fn task_types(&self, queue_id: &str) -> Vec<String> {
        let mut types: Vec<String> = self
            .executors
            .iter()
            .filter(|entry| entry.key().0 == queue_id)
            .map(|entry| entry.key().1.clone())
            .collect();
        types.sort();
        types
    }

    pub fn executor_count(&self) -> usize {
        self.executors.len()
    }
}

impl Default for TaskQueueManager {
    fn default() -> Self {
        Self {
            executors: DashMap::new(),
        }
    }
}
