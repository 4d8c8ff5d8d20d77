use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// One entry of a shard, as read back from the log.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StreamRecord {
    pub shard_id: String,
    /// Strictly increasing within a shard.
    pub sequence_number: u64,
    pub partition_key: String,
    pub data: Vec<u8>,
    pub arrival_ms: u64,
}

/// A record to be appended; the log picks the shard from `partition_key`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PutRecord {
    pub partition_key: String,
    pub data: Vec<u8>,
}

/// Per-record outcome of a `put_records` call, in request order.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum PutRecordResult {
    Ok {
        shard_id: String,
        sequence_number: u64,
    },
    Failed {
        error_code: String,
        message: String,
    },
}

impl PutRecordResult {
    pub fn is_ok(&self) -> bool {
        matches!(self, PutRecordResult::Ok { .. })
    }
}

/// A sharded append log.
#[async_trait]
pub trait LogStream: Send + Sync {
    fn stream_id(&self) -> &str;

    async fn list_shards(&self) -> Result<Vec<String>>;

    /// Up to `limit` records strictly after `after`, in sequence order.
    /// `None` reads from the start of the shard.
    ///
    /// A read rejected for throughput fails with
    /// [`ThrottledError`](crate::error::ThrottledError).
    async fn get_records(
        &self,
        shard_id: &str,
        after: Option<u64>,
        limit: usize,
    ) -> Result<Vec<StreamRecord>>;

    /// Appends a batch. A partial failure is reported per record, never as `Err`.
    async fn put_records(&self, records: &[PutRecord]) -> Result<Vec<PutRecordResult>>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublisherConfig {
    pub max_attempts: u32,
    /// Sleep before retry `n` (0-based) is `base_delay * 2^n`.
    pub base_delay: Duration,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(200),
        }
    }
}

/// Where a published record landed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PublishedRecord {
    pub partition_key: String,
    pub shard_id: String,
    pub sequence_number: u64,
}
