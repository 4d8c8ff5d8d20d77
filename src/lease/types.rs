use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// Lease lifetime for a shard lock.
pub const DEFAULT_LOCK_TTL: Duration = Duration::from_secs(35);
/// Heartbeat record lifetime; heartbeats are re-sent every half of it.
pub const DEFAULT_HEARTBEAT_TTL: Duration = Duration::from_secs(30);
/// An instance is active iff its last heartbeat is younger than this.
pub const ACTIVE_INSTANCE_WINDOW: Duration = Duration::from_secs(30);
/// Consecutive heartbeat failures before the leaser escalates.
pub const HEARTBEAT_FAILURE_THRESHOLD: u32 = 3;

/// Backend contract for shard leasing.
///
/// Every mutation of lock state must be atomic and ownership-verified on the
/// backend side; callers never read-then-write a lock.
#[async_trait]
pub trait LockProvider: Send + Sync {
    /// Atomic set-if-absent with TTL. True only if this call created the lock.
    async fn acquire_lock(&self, key: &str, owner_id: &str, ttl: Duration) -> Result<bool>;

    /// Extends the TTL only while `owner_id` still holds the lock.
    /// Returns false if ownership was lost.
    async fn renew_lock(&self, key: &str, owner_id: &str, ttl: Duration) -> Result<bool>;

    /// Deletes the lock only while `owner_id` still holds it.
    async fn release_lock(&self, key: &str, owner_id: &str) -> Result<bool>;

    /// Current holder of a live lock, if any.
    async fn lock_owner(&self, key: &str) -> Result<Option<String>>;

    async fn set_checkpoint(&self, key: &str, sequence_number: u64) -> Result<()>;

    async fn get_checkpoint(&self, key: &str) -> Result<Option<u64>>;

    async fn send_heartbeat(&self, stream_id: &str, instance_id: &str, ttl: Duration)
    -> Result<()>;

    /// Instances with a heartbeat inside [`ACTIVE_INSTANCE_WINDOW`], sorted.
    async fn get_active_instances(&self, stream_id: &str) -> Result<Vec<String>>;
}

/// Alert hook invoked as `(stream_id, instance_id, consecutive_failures)` once
/// heartbeats have failed [`HEARTBEAT_FAILURE_THRESHOLD`] times in a row.
pub type HeartbeatFailureFn = Arc<dyn Fn(&str, &str, u32) + Send + Sync>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaserConfig {
    pub lock_ttl: Duration,
    pub heartbeat_ttl: Duration,
    pub heartbeat_failure_threshold: u32,
}

impl Default for LeaserConfig {
    fn default() -> Self {
        Self {
            lock_ttl: DEFAULT_LOCK_TTL,
            heartbeat_ttl: DEFAULT_HEARTBEAT_TTL,
            heartbeat_failure_threshold: HEARTBEAT_FAILURE_THRESHOLD,
        }
    }
}

/// Key under which a shard's lock and checkpoint live for one stream.
pub fn shard_key(stream_id: &str, shard_id: &str) -> String {
    format!("{}:{}", stream_id, shard_id)
}
