//! Operator notifications.
//!
//! Fire-and-forget callbacks for queue statistics, discarded tasks and critical
//! errors. [`Notifications`] runs every call on its own task and swallows both
//! errors and panics, so a broken notifier never stalls or breaks processing.

use super::types::QueueStats;

use anyhow::Result;
use async_trait::async_trait;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::task::JoinHandle;

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn queue_stats(&self, _stats: &QueueStats) -> Result<()> {
        Ok(())
    }

    async fn tasks_discarded(&self, _queue_id: &str, _count: usize) -> Result<()> {
        Ok(())
    }

    async fn critical_error(&self, _message: &str) -> Result<()> {
        Ok(())
    }
}

/// Notifier that does nothing.
pub struct NoopNotifier;

#[async_trait]
impl Notifier for NoopNotifier {}

/// Notifier that writes every notification to the log.
pub struct TracingNotifier;

#[async_trait]
impl Notifier for TracingNotifier {
    async fn queue_stats(&self, stats: &QueueStats) -> Result<()> {
        tracing::info!(
            "Queue {}: scheduled={} processing={} executed={} failed={} expired={} ignored={}",
            stats.queue_id,
            stats.scheduled,
            stats.processing,
            stats.executed,
            stats.failed,
            stats.expired,
            stats.ignored
        );
        Ok(())
    }

    async fn tasks_discarded(&self, queue_id: &str, count: usize) -> Result<()> {
        tracing::warn!("Discarded {} task(s) from queue {}", count, queue_id);
        Ok(())
    }

    async fn critical_error(&self, message: &str) -> Result<()> {
        tracing::error!("CRITICAL: {}", message);
        Ok(())
    }
}

/// Guarded, non-blocking front of a [`Notifier`].
#[derive(Clone)]
pub struct Notifications {
    inner: Arc<dyn Notifier>,
}

impl Notifications {
    pub fn new(inner: Arc<dyn Notifier>) -> Self {
        Self { inner }
    }

    pub fn noop() -> Self {
        Self::new(Arc::new(NoopNotifier))
    }

    pub fn queue_stats(&self, stats: QueueStats) -> JoinHandle<()> {
        let inner = self.inner.clone();
        spawn_guarded("queue_stats", async move { inner.queue_stats(&stats).await })
    }

    pub fn tasks_discarded(&self, queue_id: &str, count: usize) -> JoinHandle<()> {
        let inner = self.inner.clone();
        let queue_id = queue_id.to_string();
        spawn_guarded("tasks_discarded", async move {
            inner.tasks_discarded(&queue_id, count).await
        })
    }

    pub fn critical_error(&self, message: impl Into<String>) -> JoinHandle<()> {
        let inner = self.inner.clone();
        let message = message.into();
        spawn_guarded("critical_error", async move { inner.critical_error(&message).await })
    }
}

impl Default for Notifications {
    fn default() -> Self {
        Self::noop()
    }
}

fn spawn_guarded<F>(kind: &'static str, call: F) -> JoinHandle<()>
where
    F: std::future::Future<Output = Result<()>> + Send + 'static,
{
    tokio::spawn(async move {
        match AssertUnwindSafe(call).catch_unwind().await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!("Notifier {} failed: {}", kind, e),
            Err(_) => tracing::warn!("Notifier {} panicked", kind),
        }
    })
}
