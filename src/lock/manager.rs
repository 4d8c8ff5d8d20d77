//! Generic Distributed Mutex
//!
//! `LockManager` claims named resources through a shared [`Cache`]. Concurrent
//! in-process attempts on the same resource collapse into a single cache round
//! trip: the first caller issues the set-if-absent, later callers wait for it
//! and report `false`.

use super::cache::Cache;

use anyhow::Result;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use std::sync::Arc;
use std::time::Duration;

type PendingAcquire = Shared<BoxFuture<'static, Result<bool, String>>>;

const DEFAULT_PREFIX: &str = "lock";

pub struct LockManager {
    cache: Arc<dyn Cache>,
    prefix: String,
    /// Value written into every lock this manager creates.
    owner: String,
    /// Acquire attempts currently in flight, keyed by cache key.
    pending: DashMap<String, PendingAcquire>,
}

impl LockManager {
    pub fn new(cache: Arc<dyn Cache>, owner: impl Into<String>) -> Arc<Self> {
        Self::with_prefix(cache, owner, DEFAULT_PREFIX)
    }

    pub fn with_prefix(
        cache: Arc<dyn Cache>,
        owner: impl Into<String>,
        prefix: &str,
    ) -> Arc<Self> {
        Arc::new(Self {
            cache,
            prefix: prefix.to_string(),
            owner: owner.into(),
            pending: DashMap::new(),
        })
    }

    fn lock_key(&self, resource_id: &str) -> String {
        format!("{}:{}", self.prefix, resource_id)
    }

    /// Tries to claim `resource_id` for `timeout_seconds`.
    ///
    /// Returns `Ok(false)` if the resource is already locked, or if another
    /// caller in this process is acquiring it right now.
    pub async fn acquire(&self, resource_id: &str, timeout_seconds: u64) -> Result<bool> {
        let key = self.lock_key(resource_id);

        let (attempt, leader) = match self.pending.entry(key.clone()) {
            Entry::Occupied(occupied) => (occupied.get().clone(), false),
            Entry::Vacant(vacant) => {
                let cache = Arc::clone(&self.cache);
                let owner = self.owner.clone();
                let cache_key = key.clone();
                let ttl = Duration::from_secs(timeout_seconds);

                let attempt = async move {
                    cache
                        .set_nx(&cache_key, &owner, ttl)
                        .await
                        .map_err(|e| e.to_string())
                }
                .boxed()
                .shared();

                vacant.insert(attempt.clone());
                (attempt, true)
            }
        };

        if !leader {
            let _ = attempt.await;
            tracing::debug!(
                "Duplicate acquire of '{}' collapsed into in-flight attempt",
                resource_id
            );
            return Ok(false);
        }

        // Removed on drop too, so a cancelled leader cannot wedge the resource.
        let _pending = PendingGuard {
            pending: &self.pending,
            key,
        };

        match attempt.await {
            Ok(acquired) => {
                tracing::trace!("Acquire '{}' -> {}", resource_id, acquired);
                Ok(acquired)
            }
            Err(e) => Err(anyhow::anyhow!("acquire of '{}' failed: {}", resource_id, e)),
        }
    }

    /// Deletes the lock unconditionally. Ownership is not verified.
    pub async fn release(&self, resource_id: &str) -> Result<()> {
        self.cache.delete(&self.lock_key(resource_id)).await?;
        tracing::trace!("Released '{}'", resource_id);
        Ok(())
    }

    pub async fn is_locked(&self, resource_id: &str) -> Result<bool> {
        let flags = self
            .cache
            .exists_many(&[self.lock_key(resource_id)])
            .await?;
        Ok(flags.first().copied().unwrap_or(false))
    }

    /// Drops every resource that is currently locked, in one batched lookup.
    pub async fn filter_locked<T, F>(&self, resources: Vec<T>, id_fn: F) -> Result<Vec<T>>
    where
        F: Fn(&T) -> String,
    {
        if resources.is_empty() {
            return Ok(resources);
        }

        let keys: Vec<String> = resources
            .iter()
            .map(|resource| self.lock_key(&id_fn(resource)))
            .collect();
        let locked = self.cache.exists_many(&keys).await?;

        Ok(resources
            .into_iter()
            .zip(locked)
            .filter_map(|(resource, is_locked)| (!is_locked).then_some(resource))
            .collect())
    }
}

struct PendingGuard<'a> {
    pending: &'a DashMap<String, PendingAcquire>,
    key: String,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending.remove(&self.key);
    }
}
