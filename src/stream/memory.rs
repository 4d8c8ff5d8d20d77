use super::types::{LogStream, PutRecord, PutRecordResult, StreamRecord};
use crate::types::now_ms;

use anyhow::{Result, bail};
use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// In-process log with a fixed shard set.
///
/// Partition keys are hashed onto shards, and sequence numbers come from one
/// counter for the whole stream, so they increase within every shard.
pub struct MemoryStream {
    stream_id: String,
    shard_ids: Vec<String>,
    /// `Shard ID -> records`, each vector ordered by sequence number.
    shards: DashMap<String, Vec<StreamRecord>>,
    next_sequence: AtomicU64,
}

impl MemoryStream {
    pub fn new(stream_id: &str, shard_count: usize) -> Arc<Self> {
        let shard_ids: Vec<String> = (0..shard_count.max(1))
            .map(|i| format!("shard-{:04}", i))
            .collect();
        let shards = DashMap::new();
        for shard_id in &shard_ids {
            shards.insert(shard_id.clone(), Vec::new());
        }

        Arc::new(Self {
            stream_id: stream_id.to_string(),
            shard_ids,
            shards,
            next_sequence: AtomicU64::new(1),
        })
    }

    pub fn shard_for(&self, partition_key: &str) -> &str {
        let mut hasher = DefaultHasher::new();
        partition_key.hash(&mut hasher);
        let index = (hasher.finish() % self.shard_ids.len() as u64) as usize;
        &self.shard_ids[index]
    }

    pub fn len(&self, shard_id: &str) -> usize {
        self.shards.get(shard_id).map(|shard| shard.len()).unwrap_or(0)
    }

    pub fn total_records(&self) -> usize {
        self.shards.iter().map(|shard| shard.value().len()).sum()
    }

    fn append(&self, record: &PutRecord) -> PutRecordResult {
        let shard_id = self.shard_for(&record.partition_key).to_string();
        let Some(mut shard) = self.shards.get_mut(&shard_id) else {
            return PutRecordResult::Failed {
                error_code: "ResourceNotFound".to_string(),
                message: format!("shard {} does not exist", shard_id),
            };
        };

        // Drawn under the shard's lock so appends stay ordered.
        let sequence_number = self.next_sequence.fetch_add(1, Ordering::SeqCst);
        shard.push(StreamRecord {
            shard_id: shard_id.clone(),
            sequence_number,
            partition_key: record.partition_key.clone(),
            data: record.data.clone(),
            arrival_ms: now_ms(),
        });

        PutRecordResult::Ok {
            shard_id,
            sequence_number,
        }
    }
}

#[async_trait]
impl LogStream for MemoryStream {
    fn stream_id(&self) -> &str {
        &self.stream_id
    }

    async fn list_shards(&self) -> Result<Vec<String>> {
        Ok(self.shard_ids.clone())
    }

    async fn get_records(
        &self,
        shard_id: &str,
        after: Option<u64>,
        limit: usize,
    ) -> Result<Vec<StreamRecord>> {
        let Some(shard) = self.shards.get(shard_id) else {
            bail!("shard {} does not exist on stream {}", shard_id, self.stream_id);
        };

        let start = match after {
            Some(after) => shard.partition_point(|record| record.sequence_number <= after),
            None => 0,
        };
        Ok(shard.iter().skip(start).take(limit).cloned().collect())
    }

    async fn put_records(&self, records: &[PutRecord]) -> Result<Vec<PutRecordResult>> {
        Ok(records.iter().map(|record| self.append(record)).collect())
    }
}
