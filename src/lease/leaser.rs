//! Shard Leaser
//!
//! Binds one [`LockProvider`] to one stream and one instance. It owns the
//! instance's heartbeat timer and gives consumers shard-level lock and
//! checkpoint operations.
//!
//! ## Heartbeats
//! One heartbeat is sent while the leaser is being started, then one every
//! `heartbeat_ttl / 2`. Failures are counted; after the configured number of
//! consecutive failures the leaser logs an error and calls the optional
//! `on_heartbeat_failure` hook. It never stops the timer and never gives up
//! leases on its own: a dead instance is handled by lock TTL expiry.

use super::types::{HeartbeatFailureFn, LeaserConfig, LockProvider, shard_key};
use crate::types::InstanceId;

use anyhow::Result;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// The state shared between the leaser and its heartbeat loop.
#[derive(Clone)]
struct HeartbeatSender {
    stream_id: String,
    instance_id: InstanceId,
    provider: Arc<dyn LockProvider>,
    ttl: Duration,
    threshold: u32,
    failures: Arc<AtomicU32>,
    on_failure: Option<HeartbeatFailureFn>,
}

impl HeartbeatSender {
    async fn beat(&self) {
        match self
            .provider
            .send_heartbeat(&self.stream_id, self.instance_id.as_str(), self.ttl)
            .await
        {
            Ok(()) => {
                let previous = self.failures.swap(0, Ordering::SeqCst);
                if previous > 0 {
                    tracing::info!(
                        "Heartbeat for {} on {} recovered after {} failure(s)",
                        self.instance_id,
                        self.stream_id,
                        previous
                    );
                }
                tracing::trace!("Heartbeat sent for {} on {}", self.instance_id, self.stream_id);
            }
            Err(e) => {
                let count = self.failures.fetch_add(1, Ordering::SeqCst) + 1;
                if count >= self.threshold {
                    tracing::error!(
                        "Heartbeat for {} on {} failed {} times in a row: {}",
                        self.instance_id,
                        self.stream_id,
                        count,
                        e
                    );
                    if let Some(hook) = &self.on_failure {
                        hook(&self.stream_id, self.instance_id.as_str(), count);
                    }
                } else {
                    tracing::warn!(
                        "Heartbeat for {} on {} failed ({}/{}): {}",
                        self.instance_id,
                        self.stream_id,
                        count,
                        self.threshold,
                        e
                    );
                }
            }
        }
    }
}

pub struct ShardLeaser {
    heartbeat: HeartbeatSender,
    lock_ttl: Duration,
    cancel: CancellationToken,
    timer: Mutex<Option<JoinHandle<()>>>,
}

impl ShardLeaser {
    /// Sends the first heartbeat and starts the heartbeat timer.
    ///
    /// Must be called from within a tokio runtime. Call [`ShardLeaser::cleanup`]
    /// on shutdown to stop the timer.
    pub async fn start(
        stream_id: &str,
        instance_id: InstanceId,
        provider: Arc<dyn LockProvider>,
        config: LeaserConfig,
        on_heartbeat_failure: Option<HeartbeatFailureFn>,
    ) -> Arc<Self> {
        let heartbeat = HeartbeatSender {
            stream_id: stream_id.to_string(),
            instance_id,
            provider,
            ttl: config.heartbeat_ttl,
            threshold: config.heartbeat_failure_threshold.max(1),
            failures: Arc::new(AtomicU32::new(0)),
            on_failure: on_heartbeat_failure,
        };

        heartbeat.beat().await;

        let cancel = CancellationToken::new();
        let period = (config.heartbeat_ttl / 2).max(Duration::from_millis(1));
        let timer = {
            let heartbeat = heartbeat.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(period);
                interval.tick().await;
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = interval.tick() => heartbeat.beat().await,
                    }
                }
                tracing::debug!("Heartbeat timer for {} stopped", heartbeat.instance_id);
            })
        };

        tracing::info!(
            "Leaser started for {} on stream {} (heartbeat every {:?})",
            heartbeat.instance_id,
            heartbeat.stream_id,
            period
        );

        Arc::new(Self {
            heartbeat,
            lock_ttl: config.lock_ttl,
            cancel,
            timer: Mutex::new(Some(timer)),
        })
    }

    pub fn stream_id(&self) -> &str {
        &self.heartbeat.stream_id
    }

    pub fn instance_id(&self) -> &InstanceId {
        &self.heartbeat.instance_id
    }

    pub fn lock_ttl(&self) -> Duration {
        self.lock_ttl
    }

    fn key(&self, shard_id: &str) -> String {
        shard_key(&self.heartbeat.stream_id, shard_id)
    }

    fn owner(&self) -> &str {
        self.heartbeat.instance_id.as_str()
    }

    fn provider(&self) -> &Arc<dyn LockProvider> {
        &self.heartbeat.provider
    }

    pub async fn acquire_shard(&self, shard_id: &str) -> Result<bool> {
        let acquired = self
            .provider()
            .acquire_lock(&self.key(shard_id), self.owner(), self.lock_ttl)
            .await?;
        if acquired {
            tracing::info!("{} acquired shard {}", self.owner(), shard_id);
        }
        Ok(acquired)
    }

    /// False means the lease was lost and the caller must stop using the shard.
    pub async fn renew_shard(&self, shard_id: &str) -> Result<bool> {
        let renewed = self
            .provider()
            .renew_lock(&self.key(shard_id), self.owner(), self.lock_ttl)
            .await?;
        if !renewed {
            tracing::warn!("{} lost the lease on shard {}", self.owner(), shard_id);
        }
        Ok(renewed)
    }

    pub async fn release_shard(&self, shard_id: &str) -> Result<bool> {
        let released = self
            .provider()
            .release_lock(&self.key(shard_id), self.owner())
            .await?;
        if released {
            tracing::info!("{} released shard {}", self.owner(), shard_id);
        }
        Ok(released)
    }

    pub async fn shard_owner(&self, shard_id: &str) -> Result<Option<String>> {
        self.provider().lock_owner(&self.key(shard_id)).await
    }

    pub async fn owns_shard(&self, shard_id: &str) -> Result<bool> {
        Ok(self.shard_owner(shard_id).await?.as_deref() == Some(self.owner()))
    }

    pub async fn get_checkpoint(&self, shard_id: &str) -> Result<Option<u64>> {
        self.provider().get_checkpoint(&self.key(shard_id)).await
    }

    /// Persists `sequence_number` as the shard's checkpoint unless the stored
    /// checkpoint is already at or past it. Returns whether it moved.
    pub async fn checkpoint(&self, shard_id: &str, sequence_number: u64) -> Result<bool> {
        let key = self.key(shard_id);
        if let Some(current) = self.provider().get_checkpoint(&key).await?
            && current >= sequence_number
        {
            tracing::trace!(
                "Checkpoint of {} stays at {} (offered {})",
                shard_id,
                current,
                sequence_number
            );
            return Ok(false);
        }

        self.provider().set_checkpoint(&key, sequence_number).await?;
        tracing::debug!("Checkpoint of {} advanced to {}", shard_id, sequence_number);
        Ok(true)
    }

    pub async fn active_instances(&self) -> Result<Vec<String>> {
        self.provider()
            .get_active_instances(&self.heartbeat.stream_id)
            .await
    }

    pub fn consecutive_heartbeat_failures(&self) -> u32 {
        self.heartbeat.failures.load(Ordering::SeqCst)
    }

    /// Stops the heartbeat timer. Idempotent.
    pub fn cleanup(&self) {
        self.cancel.cancel();
        if let Ok(mut timer) = self.timer.lock()
            && let Some(handle) = timer.take()
        {
            handle.abort();
            tracing::info!("Leaser for {} cleaned up", self.heartbeat.instance_id);
        }
    }
}

impl Drop for ShardLeaser {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
