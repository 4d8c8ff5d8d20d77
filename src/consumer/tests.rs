//! Consumer Module Tests
//!
//! ## Test Scopes
//! - **RecordProcessor**: Decoding defaults, fail-fast batches, the processor time budget.
//! - **ShardConsumer**: Checkpointing, ownership, poison isolation, throttling, relinquishing.
//! - **Rebalancer**: Fair share arithmetic, per-pass cap, surplus hand-back between instances.
//! - **StreamQueue**: Publishing and consuming through the `Queue` contract.

#[cfg(test)]
mod tests {
    use crate::adaptive::strategy::AdaptiveStrategy;
    use crate::consumer::processor::RecordProcessor;
    use crate::consumer::rebalancer::{
        AssignmentListener, RebalancerConfig, ShardRebalancer, fair_share, plan_assignment,
    };
    use crate::consumer::shard_consumer::{
        ConsumerExit, CycleOutcome, ShardConsumer, ShardConsumerConfig,
    };
    use crate::consumer::stream_queue::StreamQueue;
    use crate::error::{ProcessorTimeoutError, RecordParseError, ThrottledError};
    use crate::lease::cache_provider::CacheLockProvider;
    use crate::lease::leaser::ShardLeaser;
    use crate::lease::types::{LeaserConfig, LockProvider};
    use crate::lock::cache::MemoryCache;
    use crate::queue::async_tasks::AsyncTaskManager;
    use crate::queue::backend::Queue;
    use crate::queue::handler::{BatchProcessor, PoisonRecord, TaskActions, TaskHandler};
    use crate::queue::registry::TaskQueueManager;
    use crate::queue::types::{
        ExecutorConfig, NewTask, ProcessOutcome, Task, TaskId, TaskStatus,
    };
    use crate::stream::memory::MemoryStream;
    use crate::stream::types::{LogStream, PublisherConfig, PutRecord, PutRecordResult, StreamRecord};
    use crate::types::InstanceId;
    use anyhow::Result;
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    const SHARD: &str = "shard-0000";

    fn provider() -> Arc<dyn LockProvider> {
        CacheLockProvider::new(Arc::new(MemoryCache::new()))
    }

    async fn leaser(provider: Arc<dyn LockProvider>, instance: &str) -> Arc<ShardLeaser> {
        ShardLeaser::start(
            "orders",
            InstanceId::from(instance),
            provider,
            LeaserConfig::default(),
            None,
        )
        .await
    }

    fn task_record(shard_id: &str, sequence_number: u64, id: &str) -> StreamRecord {
        let task = Task::scheduled("emails", TaskId::from(id), NewTask::new("send", json!({})));
        StreamRecord {
            shard_id: shard_id.to_string(),
            sequence_number,
            partition_key: id.to_string(),
            data: serde_json::to_vec(&task).unwrap(),
            arrival_ms: 0,
        }
    }

    /// Publishes tasks with the given ids; a one-shard stream keeps them in order.
    async fn publish(stream: &MemoryStream, ids: &[&str]) -> Vec<u64> {
        let records: Vec<PutRecord> = ids
            .iter()
            .map(|id| {
                let task = Task::scheduled("emails", TaskId::from(*id), NewTask::new("send", json!({})));
                PutRecord {
                    partition_key: id.to_string(),
                    data: serde_json::to_vec(&task).unwrap(),
                }
            })
            .collect();
        publish_raw(stream, records).await
    }

    async fn publish_raw(stream: &MemoryStream, records: Vec<PutRecord>) -> Vec<u64> {
        stream
            .put_records(&records)
            .await
            .unwrap()
            .into_iter()
            .map(|result| match result {
                PutRecordResult::Ok { sequence_number, .. } => sequence_number,
                PutRecordResult::Failed { message, .. } => panic!("publish failed: {}", message),
            })
            .collect()
    }

    /// Executes every task except the ones listed as failing, which are
    /// rescheduled. Remembers what it saw and what was isolated.
    #[derive(Default)]
    struct ScriptedProcessor {
        failing: HashSet<String>,
        batch_error: bool,
        delay: Option<Duration>,
        seen: Mutex<Vec<Vec<String>>>,
        poisoned: Mutex<Vec<PoisonRecord>>,
    }

    impl ScriptedProcessor {
        fn failing(ids: &[&str]) -> Arc<Self> {
            Arc::new(Self {
                failing: ids.iter().map(|id| id.to_string()).collect(),
                ..Default::default()
            })
        }

        fn batches(&self) -> Vec<Vec<String>> {
            self.seen.lock().unwrap().clone()
        }

        fn poisoned(&self) -> Vec<PoisonRecord> {
            self.poisoned.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl BatchProcessor for ScriptedProcessor {
        async fn process(&self, _queue_id: &str, tasks: Vec<Task>) -> Result<ProcessOutcome> {
            self.seen
                .lock()
                .unwrap()
                .push(tasks.iter().map(|t| t.id.to_string()).collect());
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            if self.batch_error {
                anyhow::bail!("processor crashed");
            }

            let mut outcome = ProcessOutcome::default();
            for mut task in tasks {
                if self.failing.contains(task.id.as_str()) {
                    task.retry_count += 1;
                    outcome.rescheduled.push(task);
                } else {
                    outcome.executed.push(task.id);
                }
            }
            Ok(outcome)
        }

        async fn on_poison(&self, _queue_id: &str, poison: PoisonRecord) -> Result<()> {
            self.poisoned.lock().unwrap().push(poison);
            Ok(())
        }
    }

    fn consumer(
        stream: Arc<dyn LogStream>,
        leaser: Arc<ShardLeaser>,
        strategy: Arc<AdaptiveStrategy>,
        processor: Arc<dyn BatchProcessor>,
        config: ShardConsumerConfig,
    ) -> Arc<ShardConsumer> {
        ShardConsumer::new(SHARD, "emails", stream, leaser, strategy, processor, config)
    }

    fn self_acquiring() -> ShardConsumerConfig {
        ShardConsumerConfig {
            self_acquire: true,
            ..Default::default()
        }
    }

    // ============================================================
    // RECORD PROCESSOR
    // ============================================================

    #[test]
    fn test_parse_record_rehomes_task_and_fills_defaults() {
        // ARRANGE: a task published without id or partition key
        let processor = RecordProcessor::new("emails", Duration::from_secs(1));
        let mut record = task_record(SHARD, 42, "ignored");
        let mut raw: serde_json::Value = serde_json::from_slice(&record.data).unwrap();
        raw["id"] = json!("");
        raw["queue_id"] = json!("somewhere-else");
        record.data = serde_json::to_vec(&raw).unwrap();
        record.partition_key = "customer-7".to_string();

        // ACT
        let task = processor.parse_record(&record).unwrap();

        // ASSERT
        assert_eq!(task.id.as_str(), "shard-0000:42");
        assert_eq!(task.partition_key.as_deref(), Some("customer-7"));
        assert_eq!(task.queue_id, "emails");
        assert_eq!(task.status, TaskStatus::Processing);
    }

    #[test]
    fn test_parse_records_fails_whole_batch_on_first_malformed() {
        let processor = RecordProcessor::new("emails", Duration::from_secs(1));
        let mut broken = task_record(SHARD, 2, "b");
        broken.data = b"{not json".to_vec();
        let mut untyped = task_record(SHARD, 3, "c");
        let mut raw: serde_json::Value = serde_json::from_slice(&untyped.data).unwrap();
        raw["task_type"] = json!("  ");
        untyped.data = serde_json::to_vec(&raw).unwrap();

        let batch = vec![task_record(SHARD, 1, "a"), broken, untyped.clone()];
        let err: RecordParseError = processor.parse_records(&batch).unwrap_err();
        assert_eq!(err.sequence_number, 2);
        assert_eq!(err.shard_id, SHARD);

        let err = processor.parse_record(&untyped).unwrap_err();
        assert!(err.reason.contains("empty task type"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_dispatch_times_out_with_typed_error() {
        let records = RecordProcessor::new("emails", Duration::from_secs(2));
        let processor = ScriptedProcessor {
            delay: Some(Duration::from_secs(600)),
            ..Default::default()
        };
        let task = records.parse_record(&task_record(SHARD, 1, "slow")).unwrap();

        let err = records.dispatch(&processor, vec![task]).await.unwrap_err();

        let timeout = err.downcast_ref::<ProcessorTimeoutError>().unwrap();
        assert_eq!(timeout.queue_id, "emails");
        assert_eq!(timeout.timeout_ms, 2_000);
    }

    // ============================================================
    // SHARD CONSUMER
    // ============================================================

    #[tokio::test]
    async fn test_cycle_processes_batch_and_checkpoints_last_record() {
        // ARRANGE
        let stream = MemoryStream::new("orders", 1);
        let seqs = publish(&stream, &["a", "b", "c"]).await;
        let leaser = leaser(provider(), "node-1").await;
        let processor = Arc::new(ScriptedProcessor::default());
        let consumer = consumer(
            stream.clone(),
            leaser.clone(),
            Arc::new(AdaptiveStrategy::default()),
            processor.clone(),
            self_acquiring(),
        );

        // ACT
        let first = consumer.run_cycle().await;
        let second = consumer.run_cycle().await;

        // ASSERT
        let CycleOutcome::Processed(report) = first else {
            panic!("expected a processed batch, got {:?}", first);
        };
        assert_eq!(report.records, 3);
        assert_eq!(report.checkpoint, Some(seqs[2]));
        assert_eq!(report.outcome.executed.len(), 3);
        assert_eq!(leaser.get_checkpoint(SHARD).await.unwrap(), Some(seqs[2]));
        assert!(matches!(second, CycleOutcome::Idle));
        assert_eq!(processor.batches(), vec![vec!["a", "b", "c"]]);

        leaser.cleanup();
    }

    #[tokio::test]
    async fn test_cycle_skips_shard_it_does_not_own() {
        let provider = provider();
        let stream = MemoryStream::new("orders", 1);
        publish(&stream, &["a"]).await;
        let other = leaser(provider.clone(), "node-2").await;
        let me = leaser(provider, "node-1").await;
        let processor = Arc::new(ScriptedProcessor::default());

        // Not acquired by anyone and not allowed to acquire on its own.
        let waiting = consumer(
            stream.clone(),
            me.clone(),
            Arc::new(AdaptiveStrategy::default()),
            processor.clone(),
            ShardConsumerConfig::default(),
        );
        assert!(matches!(waiting.run_cycle().await, CycleOutcome::NotOwned));

        // Held by another instance.
        assert!(other.acquire_shard(SHARD).await.unwrap());
        let eager = consumer(
            stream,
            me.clone(),
            Arc::new(AdaptiveStrategy::default()),
            processor.clone(),
            self_acquiring(),
        );
        assert!(matches!(eager.run_cycle().await, CycleOutcome::NotOwned));
        assert!(processor.batches().is_empty());

        me.cleanup();
        other.cleanup();
    }

    #[tokio::test]
    async fn test_poison_record_isolated_after_three_failures() {
        // ARRANGE: "bad" is rescheduled every time it is processed
        let stream = MemoryStream::new("orders", 1);
        let seqs = publish(&stream, &["good-1", "bad", "good-2"]).await;
        let leaser = leaser(provider(), "node-1").await;
        let strategy = Arc::new(AdaptiveStrategy::default());
        let processor = ScriptedProcessor::failing(&["bad"]);
        let consumer = consumer(
            stream.clone(),
            leaser.clone(),
            strategy.clone(),
            processor.clone(),
            self_acquiring(),
        );

        // ACT: three failing cycles
        for attempt in 1..=3 {
            let outcome = consumer.run_cycle().await;
            assert!(matches!(outcome, CycleOutcome::Processed(_)));
            assert_eq!(consumer.attempts(seqs[1]), attempt);
            // The checkpoint stops in front of the failing record.
            assert_eq!(leaser.get_checkpoint(SHARD).await.unwrap(), Some(seqs[0]));
        }
        let isolating = consumer.run_cycle().await;

        // ASSERT
        let CycleOutcome::Processed(report) = isolating else {
            panic!("expected isolation, got {:?}", isolating);
        };
        assert_eq!(report.isolated, vec![seqs[1]]);
        assert_eq!(report.checkpoint, Some(seqs[2]));
        assert_eq!(leaser.get_checkpoint(SHARD).await.unwrap(), Some(seqs[2]));

        let poisoned = processor.poisoned();
        assert_eq!(poisoned.len(), 1);
        assert_eq!(poisoned[0].sequence_number, seqs[1]);
        assert_eq!(poisoned[0].task.as_ref().unwrap().id.as_str(), "bad");

        // The failing task carried its attempt count into the processor.
        let batches = processor.batches();
        assert_eq!(batches.len(), 4);
        assert_eq!(batches[3], vec!["good-2"]);

        let snapshot = &strategy.get_snapshot(Some(SHARD))[0];
        assert_eq!(snapshot.poison_pills, 1);
        assert!(!strategy.should_backoff(SHARD));

        leaser.cleanup();
    }

    #[tokio::test]
    async fn test_failed_task_sees_prior_attempts_as_retry_count() {
        struct RetryCounter {
            counts: Mutex<Vec<u32>>,
        }

        #[async_trait]
        impl BatchProcessor for RetryCounter {
            async fn process(&self, _: &str, tasks: Vec<Task>) -> Result<ProcessOutcome> {
                self.counts.lock().unwrap().push(tasks[0].retry_count);
                Ok(ProcessOutcome {
                    rescheduled: tasks,
                    ..Default::default()
                })
            }
        }

        let stream = MemoryStream::new("orders", 1);
        publish(&stream, &["flaky"]).await;
        let leaser = leaser(provider(), "node-1").await;
        let processor = Arc::new(RetryCounter {
            counts: Mutex::new(Vec::new()),
        });
        let consumer = consumer(
            stream,
            leaser.clone(),
            Arc::new(AdaptiveStrategy::default()),
            processor.clone(),
            self_acquiring(),
        );

        for _ in 0..3 {
            consumer.run_cycle().await;
        }

        assert_eq!(*processor.counts.lock().unwrap(), vec![0, 1, 2]);
        leaser.cleanup();
    }

    #[tokio::test]
    async fn test_malformed_record_fails_batch_then_is_isolated() {
        // ARRANGE: a corrupt record at the head, a valid one behind it
        let stream = MemoryStream::new("orders", 1);
        let corrupt = publish_raw(
            &stream,
            vec![PutRecord {
                partition_key: "x".to_string(),
                data: b"\x00\x01garbage".to_vec(),
            }],
        )
        .await[0];
        let valid = publish(&stream, &["after"]).await[0];
        let leaser = leaser(provider(), "node-1").await;
        let processor = Arc::new(ScriptedProcessor::default());
        let consumer = consumer(
            stream.clone(),
            leaser.clone(),
            Arc::new(AdaptiveStrategy::default()),
            processor.clone(),
            self_acquiring(),
        );

        // ACT & ASSERT: fail-fast, nothing reaches the processor
        for attempt in 1..=3 {
            let outcome = consumer.run_cycle().await;
            let CycleOutcome::Failed(reason) = outcome else {
                panic!("expected a failed batch, got {:?}", outcome);
            };
            assert!(reason.contains("malformed record"));
            assert_eq!(consumer.attempts(corrupt), attempt);
        }
        assert!(processor.batches().is_empty());
        assert_eq!(leaser.get_checkpoint(SHARD).await.unwrap(), None);

        let outcome = consumer.run_cycle().await;
        let CycleOutcome::Processed(report) = outcome else {
            panic!("expected isolation, got {:?}", outcome);
        };
        assert_eq!(report.isolated, vec![corrupt]);
        assert_eq!(leaser.get_checkpoint(SHARD).await.unwrap(), Some(valid));
        assert_eq!(processor.batches(), vec![vec!["after"]]);

        let poisoned = processor.poisoned();
        assert_eq!(poisoned.len(), 1);
        assert!(poisoned[0].task.is_none());

        leaser.cleanup();
    }

    #[tokio::test(start_paused = true)]
    async fn test_processor_timeout_is_a_retryable_failure() {
        let stream = MemoryStream::new("orders", 1);
        let seqs = publish(&stream, &["slow", "next"]).await;
        let leaser = leaser(provider(), "node-1").await;
        let strategy = Arc::new(AdaptiveStrategy::default());
        let processor = Arc::new(ScriptedProcessor {
            delay: Some(Duration::from_secs(600)),
            ..Default::default()
        });
        let consumer = consumer(
            stream,
            leaser.clone(),
            strategy.clone(),
            processor.clone(),
            ShardConsumerConfig {
                processor_timeout: Duration::from_secs(5),
                self_acquire: true,
                ..Default::default()
            },
        );
        let initial = strategy.get_batch_size(SHARD);

        let outcome = consumer.run_cycle().await;

        let CycleOutcome::Failed(reason) = outcome else {
            panic!("expected a failed batch, got {:?}", outcome);
        };
        assert!(reason.contains("timed out after 5000ms"));
        // Nobody is charged for a multi-record batch.
        assert_eq!(consumer.attempts(seqs[0]), 0);
        assert_eq!(consumer.attempts(seqs[1]), 0);
        assert_eq!(leaser.get_checkpoint(SHARD).await.unwrap(), None);
        assert!(strategy.get_batch_size(SHARD) < initial);

        // The retry holds the head record alone, which now takes the attempt.
        assert!(matches!(consumer.run_cycle().await, CycleOutcome::Failed(_)));
        assert_eq!(consumer.attempts(seqs[0]), 1);
        assert_eq!(consumer.attempts(seqs[1]), 0);
        assert_eq!(processor.batches()[1], vec!["slow"]);

        leaser.cleanup();
    }

    /// Fails the whole batch whenever it contains the given task.
    struct CrashingProcessor {
        crash_on: String,
        executed: Mutex<Vec<String>>,
        poisoned: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl BatchProcessor for CrashingProcessor {
        async fn process(&self, _: &str, tasks: Vec<Task>) -> Result<ProcessOutcome> {
            if tasks.iter().any(|task| task.id.as_str() == self.crash_on) {
                anyhow::bail!("crash on {}", self.crash_on);
            }
            let mut executed = self.executed.lock().unwrap();
            Ok(ProcessOutcome {
                executed: tasks
                    .into_iter()
                    .map(|task| {
                        executed.push(task.id.to_string());
                        task.id
                    })
                    .collect(),
                ..Default::default()
            })
        }

        async fn on_poison(&self, _: &str, poison: PoisonRecord) -> Result<()> {
            let id = poison.task.map(|task| task.id.to_string()).unwrap_or_default();
            self.poisoned.lock().unwrap().push(id);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_batch_crash_charges_only_the_crashing_record() {
        // ARRANGE: the second record takes the whole batch down
        let stream = MemoryStream::new("orders", 1);
        let seqs = publish(&stream, &["good", "bad", "after"]).await;
        let leaser = leaser(provider(), "node-1").await;
        let processor = Arc::new(CrashingProcessor {
            crash_on: "bad".to_string(),
            executed: Mutex::new(Vec::new()),
            poisoned: Mutex::new(Vec::new()),
        });
        let consumer = consumer(
            stream,
            leaser.clone(),
            Arc::new(AdaptiveStrategy::default()),
            processor.clone(),
            self_acquiring(),
        );

        // ACT
        let mut cycles = 0;
        while leaser.get_checkpoint(SHARD).await.unwrap() != Some(seqs[2]) {
            assert!(cycles < 10, "shard did not drain");
            let outcome = consumer.run_cycle().await;
            assert!(!matches!(outcome, CycleOutcome::Relinquished));
            cycles += 1;
        }

        // ASSERT
        assert_eq!(*processor.executed.lock().unwrap(), vec!["good", "after"]);
        assert_eq!(*processor.poisoned.lock().unwrap(), vec!["bad"]);

        leaser.cleanup();
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_waits_between_failed_attempts() {
        // ARRANGE: one record that is rescheduled every time
        let stream = MemoryStream::new("orders", 1);
        publish(&stream, &["flaky"]).await;
        let leaser = leaser(provider(), "node-1").await;
        let strategy = Arc::new(AdaptiveStrategy::default());
        let processor = ScriptedProcessor::failing(&["flaky"]);
        let consumer = consumer(
            stream,
            leaser.clone(),
            strategy.clone(),
            processor.clone(),
            self_acquiring(),
        );

        // ACT
        let started = tokio::time::Instant::now();
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(consumer.run(cancel.clone()));
        while processor.poisoned().is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let elapsed = started.elapsed();
        cancel.cancel();
        handle.await.unwrap();

        // ASSERT: three attempts, each failure followed by the adaptive delay
        assert_eq!(processor.batches().len(), 3);
        assert!(elapsed >= Duration::from_secs(3), "isolated after {:?}", elapsed);

        leaser.cleanup();
    }

    /// Stream whose reads always fail, either throttled or broken.
    struct FailingStream {
        throttled: bool,
        reads: AtomicUsize,
    }

    #[async_trait]
    impl LogStream for FailingStream {
        fn stream_id(&self) -> &str {
            "orders"
        }

        async fn list_shards(&self) -> Result<Vec<String>> {
            Ok(vec![SHARD.to_string()])
        }

        async fn get_records(&self, shard_id: &str, _: Option<u64>, _: usize) -> Result<Vec<StreamRecord>> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            if self.throttled {
                Err(ThrottledError {
                    shard_id: shard_id.to_string(),
                }
                .into())
            } else {
                Err(anyhow::anyhow!("connection reset"))
            }
        }

        async fn put_records(&self, _: &[PutRecord]) -> Result<Vec<PutRecordResult>> {
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn test_throttled_read_shrinks_batch_quarter() {
        let stream = Arc::new(FailingStream {
            throttled: true,
            reads: AtomicUsize::new(0),
        });
        let leaser = leaser(provider(), "node-1").await;
        let strategy = Arc::new(AdaptiveStrategy::default());
        let consumer = consumer(
            stream,
            leaser.clone(),
            strategy.clone(),
            Arc::new(ScriptedProcessor::default()),
            self_acquiring(),
        );

        let outcome = consumer.run_cycle().await;

        assert!(matches!(outcome, CycleOutcome::Throttled));
        assert_eq!(strategy.get_batch_size(SHARD), 12);
        // Throttling is not held against the shard.
        assert!(leaser.owns_shard(SHARD).await.unwrap());

        leaser.cleanup();
    }

    #[tokio::test]
    async fn test_consumer_relinquishes_after_five_errors() {
        let stream = Arc::new(FailingStream {
            throttled: false,
            reads: AtomicUsize::new(0),
        });
        let leaser = leaser(provider(), "node-1").await;
        let consumer = consumer(
            stream.clone(),
            leaser.clone(),
            Arc::new(AdaptiveStrategy::default()),
            Arc::new(ScriptedProcessor::default()),
            self_acquiring(),
        );

        for _ in 0..4 {
            assert!(matches!(consumer.run_cycle().await, CycleOutcome::Failed(_)));
            assert!(leaser.owns_shard(SHARD).await.unwrap());
        }
        let outcome = consumer.run_cycle().await;

        assert!(matches!(outcome, CycleOutcome::Relinquished));
        assert_eq!(leaser.shard_owner(SHARD).await.unwrap(), None);
        assert_eq!(stream.reads.load(Ordering::SeqCst), 5);

        leaser.cleanup();
    }

    #[tokio::test]
    async fn test_run_stops_on_cancel_and_releases_lease() {
        let stream = MemoryStream::new("orders", 1);
        publish(&stream, &["a"]).await;
        let leaser = leaser(provider(), "node-1").await;
        assert!(leaser.acquire_shard(SHARD).await.unwrap());
        let processor = Arc::new(ScriptedProcessor::default());
        let consumer = consumer(
            stream,
            leaser.clone(),
            Arc::new(AdaptiveStrategy::default()),
            processor.clone(),
            ShardConsumerConfig::default(),
        );

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(consumer.run(cancel.clone()));
        while processor.batches().is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        cancel.cancel();
        let exit = handle.await.unwrap();

        assert_eq!(exit, ConsumerExit::Cancelled);
        assert_eq!(leaser.shard_owner(SHARD).await.unwrap(), None);

        leaser.cleanup();
    }

    // ============================================================
    // REBALANCER
    // ============================================================

    #[test]
    fn test_fair_share_and_plan() {
        assert_eq!(fair_share(10, 3), 4);
        assert_eq!(fair_share(8, 4), 2);
        assert_eq!(fair_share(5, 0), 5);

        // Below target, capped per pass.
        assert_eq!(plan_assignment(10, 1, 0, 3), 3);
        assert_eq!(plan_assignment(10, 3, 3, 3), 1);
        // Above target.
        assert_eq!(plan_assignment(4, 2, 4, 3), -2);
        assert_eq!(plan_assignment(12, 4, 12, 3), -3);
        // Balanced.
        assert_eq!(plan_assignment(4, 2, 2, 3), 0);
    }

    #[derive(Default)]
    struct RecordingListener {
        acquired: Mutex<Vec<String>>,
        releasing: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl AssignmentListener for RecordingListener {
        async fn shard_acquired(&self, shard_id: &str) {
            self.acquired.lock().unwrap().push(shard_id.to_string());
        }

        async fn shard_releasing(&self, shard_id: &str) {
            self.releasing.lock().unwrap().push(shard_id.to_string());
        }
    }

    #[tokio::test]
    async fn test_rebalance_acquires_at_most_cap_per_pass() {
        // ARRANGE
        let stream = MemoryStream::new("orders", 8);
        let leaser = leaser(provider(), "node-1").await;
        let listener = Arc::new(RecordingListener::default());
        let rebalancer = ShardRebalancer::new(
            stream,
            leaser.clone(),
            listener.clone(),
            RebalancerConfig::default(),
        );

        // ACT
        let first = rebalancer.rebalance_once().await.unwrap();
        let second = rebalancer.rebalance_once().await.unwrap();
        let third = rebalancer.rebalance_once().await.unwrap();

        // ASSERT
        assert_eq!(first.target, 8);
        assert_eq!(first.acquired.len(), 3);
        assert_eq!(second.owned.len(), 6);
        assert_eq!(third.acquired.len(), 2);
        assert_eq!(third.owned.len(), 8);
        assert_eq!(listener.acquired.lock().unwrap().len(), 8);

        leaser.cleanup();
    }

    #[tokio::test]
    async fn test_rebalance_hands_surplus_to_new_instance() {
        let provider = provider();
        let stream = MemoryStream::new("orders", 4);
        let config = RebalancerConfig {
            max_reassignments: 10,
            ..Default::default()
        };

        let first = leaser(provider.clone(), "node-1").await;
        let first_listener = Arc::new(RecordingListener::default());
        let first_rebalancer =
            ShardRebalancer::new(stream.clone(), first.clone(), first_listener.clone(), config.clone());
        assert_eq!(first_rebalancer.rebalance_once().await.unwrap().owned.len(), 4);

        // A second instance joins with nothing free to take.
        let second = leaser(provider, "node-2").await;
        let second_rebalancer = ShardRebalancer::new(
            stream.clone(),
            second.clone(),
            Arc::new(RecordingListener::default()),
            config,
        );
        assert!(second_rebalancer.rebalance_once().await.unwrap().acquired.is_empty());

        // ACT
        let shrink = first_rebalancer.rebalance_once().await.unwrap();
        let grow = second_rebalancer.rebalance_once().await.unwrap();

        // ASSERT
        assert_eq!(shrink.instances, 2);
        assert_eq!(shrink.released.len(), 2);
        assert_eq!(*first_listener.releasing.lock().unwrap(), shrink.released);
        assert_eq!(shrink.owned.len(), 2);
        let mut taken = grow.acquired.clone();
        taken.sort();
        let mut released = shrink.released.clone();
        released.sort();
        assert_eq!(taken, released);

        first.cleanup();
        second.cleanup();
    }

    // ============================================================
    // STREAM QUEUE
    // ============================================================

    fn task_handler(executed: Arc<AtomicUsize>) -> Arc<dyn BatchProcessor> {
        let manager = TaskQueueManager::new();
        manager.register(
            "emails",
            "send",
            ExecutorConfig::default(),
            move |tasks: Vec<Task>, actions: TaskActions| {
                let executed = executed.clone();
                async move {
                    for task in &tasks {
                        executed.fetch_add(1, Ordering::SeqCst);
                        actions.success(task);
                    }
                    Ok(())
                }
            },
        );
        Arc::new(TaskHandler::new(
            manager,
            AsyncTaskManager::new(100, Duration::from_secs(10)),
        ))
    }

    async fn stream_queue(shards: usize) -> (Arc<MemoryStream>, Arc<StreamQueue>) {
        let stream = MemoryStream::new("orders", shards);
        let leaser = leaser(provider(), "node-1").await;
        let queue = StreamQueue::new(
            stream.clone(),
            leaser,
            Arc::new(AdaptiveStrategy::default()),
            PublisherConfig::default(),
            ShardConsumerConfig::default(),
            RebalancerConfig::default(),
        );
        (stream, queue)
    }

    #[tokio::test]
    async fn test_stream_queue_publishes_and_consumes_batch() {
        // ARRANGE
        let (stream, queue) = stream_queue(2).await;
        queue.register("emails").await.unwrap();
        let messages = (0..5)
            .map(|i| NewTask::new("send", json!({ "n": i })).with_partition_key(&format!("k{}", i)))
            .collect();

        // ACT
        let ids = queue.add_messages("emails", messages).await.unwrap();
        let executed = Arc::new(AtomicUsize::new(0));
        let outcome = queue
            .consume_messages_batch("emails", task_handler(executed.clone()), None)
            .await
            .unwrap();

        // ASSERT
        assert_eq!(ids.len(), 5);
        assert_eq!(stream.total_records(), 5);
        assert_eq!(outcome.executed.len(), 5);
        assert_eq!(executed.load(Ordering::SeqCst), 5);

        let mut executed_ids = outcome.executed.clone();
        executed_ids.sort();
        let mut published = ids.clone();
        published.sort();
        assert_eq!(executed_ids, published);

        queue.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_stream_queue_carries_one_queue() {
        let (_, queue) = stream_queue(1).await;

        assert!(queue.add_messages("emails", vec![]).await.is_err());
        queue.register("emails").await.unwrap();
        queue.register("emails").await.unwrap();
        assert!(queue.register("invoices").await.is_err());

        queue.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_stream_queue_consumes_until_cancelled() {
        let (_, queue) = stream_queue(2).await;
        queue.register("emails").await.unwrap();
        let messages = (0..6)
            .map(|i| NewTask::new("send", json!({})).with_partition_key(&format!("k{}", i)))
            .collect();
        queue.add_messages("emails", messages).await.unwrap();

        let executed = Arc::new(AtomicUsize::new(0));
        let cancel = CancellationToken::new();
        let consuming = {
            let queue = queue.clone();
            let processor = task_handler(executed.clone());
            let cancel = cancel.clone();
            tokio::spawn(async move { queue.consume_messages_stream("emails", processor, cancel).await })
        };

        tokio::time::timeout(Duration::from_secs(5), async {
            while executed.load(Ordering::SeqCst) < 6 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(queue.running_shards("emails").len(), 2);

        cancel.cancel();
        consuming.await.unwrap().unwrap();

        assert!(queue.running_shards("emails").is_empty());
        for shard in ["shard-0000", "shard-0001"] {
            assert_eq!(queue.leaser().shard_owner(shard).await.unwrap(), None);
        }
        queue.shutdown().await.unwrap();
    }
}
