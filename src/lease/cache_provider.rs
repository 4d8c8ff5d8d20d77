//! Cache-Backed Lock Provider
//!
//! Reference `LockProvider` over any [`Cache`]. Locks map to
//! `set_nx`/`expire_if_eq`/`delete_if_eq`, so every renewal and release is a
//! single compare-and-act on the backend. Heartbeats live in one hash per
//! stream (`instance -> unix ms`), and the whole hash expires with the
//! heartbeat TTL when every instance stops beating.
//!
//! With a shared clustered cache behind it this is the only provider that is
//! safe across processes.

use super::types::{ACTIVE_INSTANCE_WINDOW, LockProvider};
use crate::lock::cache::Cache;
use crate::types::now_ms;

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

const LOCK_PREFIX: &str = "shard-lock";
const CHECKPOINT_PREFIX: &str = "shard-checkpoint";
const HEARTBEAT_PREFIX: &str = "heartbeats";

pub struct CacheLockProvider {
    cache: Arc<dyn Cache>,
}

impl CacheLockProvider {
    pub fn new(cache: Arc<dyn Cache>) -> Arc<Self> {
        Arc::new(Self { cache })
    }

    fn lock_key(key: &str) -> String {
        format!("{}:{}", LOCK_PREFIX, key)
    }

    fn checkpoint_key(key: &str) -> String {
        format!("{}:{}", CHECKPOINT_PREFIX, key)
    }

    fn heartbeat_key(stream_id: &str) -> String {
        format!("{}:{}", HEARTBEAT_PREFIX, stream_id)
    }
}

#[async_trait]
impl LockProvider for CacheLockProvider {
    async fn acquire_lock(&self, key: &str, owner_id: &str, ttl: Duration) -> Result<bool> {
        self.cache.set_nx(&Self::lock_key(key), owner_id, ttl).await
    }

    async fn renew_lock(&self, key: &str, owner_id: &str, ttl: Duration) -> Result<bool> {
        self.cache
            .expire_if_eq(&Self::lock_key(key), owner_id, ttl)
            .await
    }

    async fn release_lock(&self, key: &str, owner_id: &str) -> Result<bool> {
        self.cache.delete_if_eq(&Self::lock_key(key), owner_id).await
    }

    async fn lock_owner(&self, key: &str) -> Result<Option<String>> {
        self.cache.get(&Self::lock_key(key)).await
    }

    async fn set_checkpoint(&self, key: &str, sequence_number: u64) -> Result<()> {
        self.cache
            .set(&Self::checkpoint_key(key), &sequence_number.to_string(), None)
            .await
    }

    async fn get_checkpoint(&self, key: &str) -> Result<Option<u64>> {
        match self.cache.get(&Self::checkpoint_key(key)).await? {
            Some(raw) => {
                let sequence = raw
                    .parse::<u64>()
                    .with_context(|| format!("corrupt checkpoint for '{}': {}", key, raw))?;
                Ok(Some(sequence))
            }
            None => Ok(None),
        }
    }

    async fn send_heartbeat(
        &self,
        stream_id: &str,
        instance_id: &str,
        ttl: Duration,
    ) -> Result<()> {
        self.cache
            .hset(
                &Self::heartbeat_key(stream_id),
                instance_id,
                &now_ms().to_string(),
                Some(ttl),
            )
            .await
    }

    async fn get_active_instances(&self, stream_id: &str) -> Result<Vec<String>> {
        let key = Self::heartbeat_key(stream_id);
        let beats = self.cache.hgetall(&key).await?;
        let cutoff = now_ms().saturating_sub(ACTIVE_INSTANCE_WINDOW.as_millis() as u64);

        let mut active = Vec::with_capacity(beats.len());
        for (instance, raw) in beats {
            match raw.parse::<u64>() {
                Ok(timestamp) if timestamp >= cutoff => active.push(instance),
                Ok(_) => {
                    tracing::debug!("Pruning stale heartbeat of {} on {}", instance, stream_id);
                    self.cache.hdel(&key, &instance).await?;
                }
                Err(_) => {
                    tracing::warn!("Ignoring malformed heartbeat of {}: {}", instance, raw);
                }
            }
        }

        active.sort();
        Ok(active)
    }
}
