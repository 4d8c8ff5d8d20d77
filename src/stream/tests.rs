//! Stream Module Tests
//!
//! ## Test Scopes
//! - **MemoryStream**: Stable partitioning, per-shard ordering, reads after a checkpoint.
//! - **RecordPublisher**: Resubmission of rejected records only, backoff and the aggregated error.

#[cfg(test)]
mod tests {
    use crate::error::PublishError;
    use crate::stream::memory::MemoryStream;
    use crate::stream::publisher::RecordPublisher;
    use crate::stream::types::{LogStream, PublisherConfig, PutRecord, PutRecordResult, StreamRecord};
    use anyhow::Result;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    fn record(key: &str) -> PutRecord {
        PutRecord {
            partition_key: key.to_string(),
            data: key.as_bytes().to_vec(),
        }
    }

    /// Stream whose `put_records` rejects scripted indices of each call.
    struct ScriptedStream {
        /// Rejected indices for call 1, call 2, ...; later calls accept everything.
        script: Mutex<VecDeque<Vec<usize>>>,
        calls: Mutex<Vec<Vec<String>>>,
        accepted: Mutex<Vec<String>>,
    }

    impl ScriptedStream {
        fn new(script: Vec<Vec<usize>>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into()),
                calls: Mutex::new(Vec::new()),
                accepted: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl LogStream for ScriptedStream {
        fn stream_id(&self) -> &str {
            "scripted"
        }

        async fn list_shards(&self) -> Result<Vec<String>> {
            Ok(vec!["shard-0000".to_string()])
        }

        async fn get_records(&self, _: &str, _: Option<u64>, _: usize) -> Result<Vec<StreamRecord>> {
            Ok(Vec::new())
        }

        async fn put_records(&self, records: &[PutRecord]) -> Result<Vec<PutRecordResult>> {
            let keys: Vec<String> = records.iter().map(|r| r.partition_key.clone()).collect();
            self.calls.lock().unwrap().push(keys);
            let rejected = self.script.lock().unwrap().pop_front().unwrap_or_default();

            let mut accepted = self.accepted.lock().unwrap();
            Ok(records
                .iter()
                .enumerate()
                .map(|(i, r)| {
                    if rejected.contains(&i) {
                        PutRecordResult::Failed {
                            error_code: "ProvisionedThroughputExceeded".to_string(),
                            message: "slow down".to_string(),
                        }
                    } else {
                        accepted.push(r.partition_key.clone());
                        PutRecordResult::Ok {
                            shard_id: "shard-0000".to_string(),
                            sequence_number: accepted.len() as u64,
                        }
                    }
                })
                .collect())
        }
    }

    // ============================================================
    // MEMORY STREAM
    // ============================================================

    #[tokio::test]
    async fn test_same_partition_key_lands_on_same_shard() {
        let stream = MemoryStream::new("orders", 4);

        let first = stream.put_records(&[record("customer-7")]).await.unwrap();
        let second = stream.put_records(&[record("customer-7")]).await.unwrap();

        match (&first[0], &second[0]) {
            (
                PutRecordResult::Ok { shard_id: a, sequence_number: s1 },
                PutRecordResult::Ok { shard_id: b, sequence_number: s2 },
            ) => {
                assert_eq!(a, b);
                assert!(s2 > s1);
            }
            other => panic!("unexpected results: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_get_records_reads_strictly_after_checkpoint() {
        // ARRANGE
        let stream = MemoryStream::new("orders", 1);
        let keys: Vec<PutRecord> = (0..6).map(|i| record(&format!("k{}", i))).collect();
        stream.put_records(&keys).await.unwrap();
        let shard = stream.list_shards().await.unwrap().remove(0);

        // ACT
        let head = stream.get_records(&shard, None, 2).await.unwrap();
        let rest = stream
            .get_records(&shard, Some(head[1].sequence_number), 100)
            .await
            .unwrap();

        // ASSERT
        assert_eq!(head.len(), 2);
        assert_eq!(rest.len(), 4);
        assert_eq!(rest[0].partition_key, "k2");
        let sequences: Vec<u64> = rest.iter().map(|r| r.sequence_number).collect();
        let mut sorted = sequences.clone();
        sorted.sort();
        assert_eq!(sequences, sorted);
    }

    #[tokio::test]
    async fn test_unknown_shard_is_an_error() {
        let stream = MemoryStream::new("orders", 2);

        assert!(stream.get_records("shard-9999", None, 10).await.is_err());
    }

    #[tokio::test]
    async fn test_all_records_are_kept() {
        let stream = MemoryStream::new("orders", 3);
        let batch: Vec<PutRecord> = (0..30).map(|i| record(&format!("k{}", i))).collect();

        stream.put_records(&batch).await.unwrap();

        assert_eq!(stream.total_records(), 30);
    }

    // ============================================================
    // PUBLISHER
    // ============================================================

    #[tokio::test(start_paused = true)]
    async fn test_publish_resubmits_only_rejected_records() {
        // ARRANGE
        let stream = ScriptedStream::new(vec![vec![1, 3], vec![0]]);
        let publisher = RecordPublisher::new(stream.clone(), PublisherConfig::default());
        let records: Vec<PutRecord> = ["a", "b", "c", "d", "e"].iter().map(|k| record(k)).collect();
        let started = tokio::time::Instant::now();

        // ACT
        let published = publisher.publish(records).await.unwrap();

        // ASSERT
        let calls = stream.calls.lock().unwrap().clone();
        assert_eq!(calls.len(), 3);
        assert_eq!(calls[1], vec!["b", "d"]);
        assert_eq!(calls[2], vec!["b"]);

        let mut accepted = stream.accepted.lock().unwrap().clone();
        accepted.sort();
        assert_eq!(accepted, vec!["a", "b", "c", "d", "e"]);

        let order: Vec<&str> = published.iter().map(|p| p.partition_key.as_str()).collect();
        assert_eq!(order, vec!["a", "b", "c", "d", "e"]);

        // 200ms before the second call, 400ms before the third
        assert!(started.elapsed() >= Duration::from_millis(600));
    }

    #[tokio::test(start_paused = true)]
    async fn test_publish_gives_up_with_named_error() {
        let stream = ScriptedStream::new(vec![vec![0, 1], vec![0, 1], vec![1]]);
        let publisher = RecordPublisher::new(stream.clone(), PublisherConfig::default());

        let err = publisher
            .publish(vec![record("a"), record("b"), record("c")])
            .await
            .unwrap_err();

        let publish_err = err.downcast_ref::<PublishError>().unwrap();
        assert_eq!(publish_err.stream_id, "scripted");
        assert_eq!(publish_err.failed_count, 1);
        assert_eq!(publish_err.attempts, 3);
        assert_eq!(stream.calls.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_publish_empty_batch_makes_no_call() {
        let stream = ScriptedStream::new(vec![]);
        let publisher = RecordPublisher::new(stream.clone(), PublisherConfig::default());

        let published = publisher.publish(Vec::new()).await.unwrap();

        assert!(published.is_empty());
        assert!(stream.calls.lock().unwrap().is_empty());
    }
}
