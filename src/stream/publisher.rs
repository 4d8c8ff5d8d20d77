//! Publish-side retry.
//!
//! A `put_records` call can accept part of a batch. The publisher resubmits only
//! the rejected records, sleeping `base_delay * 2^attempt` in between, and gives
//! up with a [`PublishError`] naming what could not be written. Nothing is
//! dropped silently.

use super::types::{LogStream, PublishedRecord, PublisherConfig, PutRecord, PutRecordResult};
use crate::error::PublishError;

use anyhow::{Result, bail};
use std::sync::Arc;

pub struct RecordPublisher {
    stream: Arc<dyn LogStream>,
    config: PublisherConfig,
}

impl RecordPublisher {
    pub fn new(stream: Arc<dyn LogStream>, config: PublisherConfig) -> Self {
        Self { stream, config }
    }

    pub fn stream(&self) -> &Arc<dyn LogStream> {
        &self.stream
    }

    /// Publishes `records`, returning where each landed in request order.
    pub async fn publish(&self, records: Vec<PutRecord>) -> Result<Vec<PublishedRecord>> {
        let total = records.len();
        let mut placed: Vec<Option<PublishedRecord>> = vec![None; total];
        // (original index, record) still waiting to be accepted
        let mut pending: Vec<(usize, PutRecord)> = records.into_iter().enumerate().collect();
        let max_attempts = self.config.max_attempts.max(1);

        for attempt in 0..max_attempts {
            if pending.is_empty() {
                break;
            }
            if attempt > 0 {
                let delay = self.config.base_delay * 2u32.pow(attempt - 1);
                tracing::debug!(
                    "Retrying {} record(s) on {} in {:?}",
                    pending.len(),
                    self.stream.stream_id(),
                    delay
                );
                tokio::time::sleep(delay).await;
            }

            let batch: Vec<PutRecord> = pending.iter().map(|(_, record)| record.clone()).collect();
            let results = match self.stream.put_records(&batch).await {
                Ok(results) if results.len() == batch.len() => results,
                Ok(results) => bail!(
                    "stream {} answered {} results for {} records",
                    self.stream.stream_id(),
                    results.len(),
                    batch.len()
                ),
                Err(e) => {
                    tracing::warn!(
                        "Publish attempt {} on {} failed: {}",
                        attempt + 1,
                        self.stream.stream_id(),
                        e
                    );
                    continue;
                }
            };

            let mut still_failing = Vec::new();
            for ((index, record), result) in pending.into_iter().zip(results) {
                match result {
                    PutRecordResult::Ok {
                        shard_id,
                        sequence_number,
                    } => {
                        placed[index] = Some(PublishedRecord {
                            partition_key: record.partition_key,
                            shard_id,
                            sequence_number,
                        });
                    }
                    PutRecordResult::Failed {
                        error_code,
                        message,
                    } => {
                        tracing::trace!("Record {} rejected: {} {}", index, error_code, message);
                        still_failing.push((index, record));
                    }
                }
            }
            pending = still_failing;
        }

        if !pending.is_empty() {
            tracing::error!(
                "Giving up on {} of {} record(s) for stream {}",
                pending.len(),
                total,
                self.stream.stream_id()
            );
            return Err(PublishError {
                stream_id: self.stream.stream_id().to_string(),
                failed_count: pending.len(),
                attempts: max_attempts,
            }
            .into());
        }

        Ok(placed.into_iter().flatten().collect())
    }
}
