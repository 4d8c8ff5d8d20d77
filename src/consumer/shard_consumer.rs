//! Shard Consumer
//!
//! The poll, process, checkpoint loop of one shard.
//!
//! ## Cycle
//! 1. Skip while the adaptive strategy says back off.
//! 2. Make sure this instance holds the shard's lease (renew it, or acquire a free one when
//!    running self-managed).
//! 3. Isolate exhausted records at the head of the shard (poison records).
//! 4. Read up to the adaptive batch size after the checkpoint, decode fail-fast, dispatch under
//!    the processor timeout.
//! 5. Renew, then move the checkpoint over the handled prefix of the batch. Records still
//!    waiting for a retry are charged one attempt and re-read next cycle.
//! 6. Feed the result to the adaptive strategy.
//!
//! A decode failure charges the malformed record. A timeout or processor error on a batch of
//! several records charges nobody: the consumer narrows to one record per cycle through the end
//! of that batch, so the attempt lands on the record that actually fails. Any cycle with a
//! failure waits the adaptive delay before the next poll. Shard-level errors in a row beyond the
//! threshold make the consumer release the shard.

use super::processor::{DEFAULT_PROCESSOR_TIMEOUT, RecordProcessor};
use crate::adaptive::strategy::AdaptiveStrategy;
use crate::adaptive::types::BatchResult;
use crate::error::is_throttled;
use crate::lease::leaser::ShardLeaser;
use crate::queue::backend::pause;
use crate::queue::handler::{BatchProcessor, PoisonRecord};
use crate::queue::types::{ProcessOutcome, TaskId};
use crate::stream::types::{LogStream, StreamRecord};

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShardConsumerConfig {
    pub processor_timeout: Duration,
    /// Attempts a record gets before it is isolated as poison.
    pub max_record_attempts: u32,
    /// Shard-level errors in a row before the shard is released.
    pub max_consecutive_errors: u32,
    /// Acquire a free shard on its own instead of waiting for the rebalancer.
    pub self_acquire: bool,
}

impl Default for ShardConsumerConfig {
    fn default() -> Self {
        Self {
            processor_timeout: DEFAULT_PROCESSOR_TIMEOUT,
            max_record_attempts: 3,
            max_consecutive_errors: 5,
            self_acquire: false,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct BatchReport {
    pub records: usize,
    /// Sequence numbers isolated as poison during the cycle.
    pub isolated: Vec<u64>,
    /// Checkpoint after the cycle, if it moved.
    pub checkpoint: Option<u64>,
    /// Records left waiting for a retry.
    pub failed: usize,
    pub outcome: ProcessOutcome,
}

#[derive(Debug, Clone)]
pub enum CycleOutcome {
    NotOwned,
    BackingOff,
    Idle,
    Throttled,
    Processed(BatchReport),
    Failed(String),
    /// Too many errors in a row; the lease was given up.
    Relinquished,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerExit {
    Cancelled,
    LostLease,
    Relinquished,
}

pub struct ShardConsumer {
    shard_id: String,
    stream: Arc<dyn LogStream>,
    leaser: Arc<ShardLeaser>,
    strategy: Arc<AdaptiveStrategy>,
    records: RecordProcessor,
    processor: Arc<dyn BatchProcessor>,
    config: ShardConsumerConfig,
    /// `sequence number -> failed attempts` for records not yet past the checkpoint.
    attempts: Mutex<HashMap<u64, u32>>,
    /// Last sequence number of a batch that failed as a whole. Until the
    /// checkpoint passes it, batches hold a single record.
    narrow_through: Mutex<Option<u64>>,
    consecutive_errors: AtomicU32,
}

impl ShardConsumer {
    pub fn new(
        shard_id: &str,
        queue_id: &str,
        stream: Arc<dyn LogStream>,
        leaser: Arc<ShardLeaser>,
        strategy: Arc<AdaptiveStrategy>,
        processor: Arc<dyn BatchProcessor>,
        config: ShardConsumerConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            shard_id: shard_id.to_string(),
            stream,
            leaser,
            strategy,
            records: RecordProcessor::new(queue_id, config.processor_timeout),
            processor,
            config,
            attempts: Mutex::new(HashMap::new()),
            narrow_through: Mutex::new(None),
            consecutive_errors: AtomicU32::new(0),
        })
    }

    pub fn shard_id(&self) -> &str {
        &self.shard_id
    }

    pub fn attempts(&self, sequence_number: u64) -> u32 {
        self.attempts
            .lock()
            .map(|attempts| attempts.get(&sequence_number).copied().unwrap_or(0))
            .unwrap_or(0)
    }

    fn charge(&self, sequence_number: u64) -> u32 {
        match self.attempts.lock() {
            Ok(mut attempts) => {
                let count = attempts.entry(sequence_number).or_insert(0);
                *count += 1;
                *count
            }
            Err(_) => 0,
        }
    }

    fn forget_through(&self, sequence_number: u64) {
        if let Ok(mut attempts) = self.attempts.lock() {
            attempts.retain(|seq, _| *seq > sequence_number);
        }
    }

    /// True while the checkpoint has not yet passed a failed batch.
    fn is_narrowed(&self, checkpoint: Option<u64>) -> bool {
        let Ok(mut narrow) = self.narrow_through.lock() else {
            return false;
        };
        let through = *narrow;
        match through {
            Some(last) if checkpoint.is_none_or(|checkpoint| checkpoint < last) => true,
            Some(_) => {
                *narrow = None;
                false
            }
            None => false,
        }
    }

    fn narrow(&self, through: u64) {
        if let Ok(mut narrow) = self.narrow_through.lock() {
            *narrow = Some(through);
        }
    }

    fn is_exhausted(&self, record: &StreamRecord) -> bool {
        self.attempts(record.sequence_number) >= self.config.max_record_attempts
    }

    async fn ensure_owned(&self) -> Result<bool> {
        let me = self.leaser.instance_id().as_str();
        match self.leaser.shard_owner(&self.shard_id).await? {
            Some(owner) if owner == me => self.leaser.renew_shard(&self.shard_id).await,
            None if self.config.self_acquire => self.leaser.acquire_shard(&self.shard_id).await,
            _ => Ok(false),
        }
    }

    /// A shard-level error. Returns `Relinquished` once the threshold is reached.
    async fn on_error(&self, error: anyhow::Error) -> CycleOutcome {
        let errors = self.consecutive_errors.fetch_add(1, Ordering::SeqCst) + 1;
        tracing::warn!(
            "Shard {} error {}/{}: {}",
            self.shard_id,
            errors,
            self.config.max_consecutive_errors,
            error
        );
        if errors < self.config.max_consecutive_errors {
            return CycleOutcome::Failed(error.to_string());
        }

        tracing::error!(
            "Relinquishing shard {} after {} consecutive errors",
            self.shard_id,
            errors
        );
        if let Err(e) = self.leaser.release_shard(&self.shard_id).await {
            tracing::warn!("Could not release shard {}: {}", self.shard_id, e);
        }
        self.consecutive_errors.store(0, Ordering::SeqCst);
        if let Ok(mut attempts) = self.attempts.lock() {
            attempts.clear();
        }
        if let Ok(mut narrow) = self.narrow_through.lock() {
            *narrow = None;
        }
        self.strategy.reset(&self.shard_id);
        CycleOutcome::Relinquished
    }

    /// Hands an exhausted record to the processor's poison hook and moves the
    /// checkpoint past it.
    async fn isolate(&self, record: &StreamRecord) -> Result<()> {
        let attempts = self.attempts(record.sequence_number);
        let (task, reason) = match self.records.parse_record(record) {
            Ok(task) => (Some(task), format!("failed {} processing attempts", attempts)),
            Err(e) => (None, format!("{} ({} attempts)", e, attempts)),
        };
        tracing::error!(
            "Isolating poison record {} on shard {}: {}",
            record.sequence_number,
            self.shard_id,
            reason
        );

        let poison = PoisonRecord {
            shard_id: self.shard_id.clone(),
            sequence_number: record.sequence_number,
            task,
            reason,
        };
        if let Err(e) = self.processor.on_poison(self.records.queue_id(), poison).await {
            tracing::warn!("Poison hook failed for {}: {}", record.sequence_number, e);
        }

        self.leaser
            .checkpoint(&self.shard_id, record.sequence_number)
            .await?;
        self.forget_through(record.sequence_number);
        Ok(())
    }

    pub async fn run_cycle(&self) -> CycleOutcome {
        self.run_cycle_with_limit(None).await
    }

    /// One poll, process, checkpoint pass. `limit` caps the adaptive batch size.
    pub async fn run_cycle_with_limit(&self, limit: Option<usize>) -> CycleOutcome {
        if self.strategy.should_backoff(&self.shard_id) {
            return CycleOutcome::BackingOff;
        }

        match self.ensure_owned().await {
            Ok(true) => {}
            Ok(false) => return CycleOutcome::NotOwned,
            Err(e) => return self.on_error(e).await,
        }

        let checkpoint = match self.leaser.get_checkpoint(&self.shard_id).await {
            Ok(checkpoint) => checkpoint,
            Err(e) => return self.on_error(e).await,
        };

        let batch_size = if self.is_narrowed(checkpoint) {
            1
        } else {
            let batch_size = self.strategy.get_batch_size(&self.shard_id);
            limit.map_or(batch_size, |limit| batch_size.min(limit.max(1)))
        };

        let records = match self
            .stream
            .get_records(&self.shard_id, checkpoint, batch_size)
            .await
        {
            Ok(records) => records,
            Err(e) if is_throttled(&e) => {
                tracing::debug!("Shard {} throttled: {}", self.shard_id, e);
                self.strategy.record_batch_result(
                    &self.shard_id,
                    &BatchResult {
                        throttled: true,
                        ..Default::default()
                    },
                );
                return CycleOutcome::Throttled;
            }
            Err(e) => return self.on_error(e).await,
        };
        if records.is_empty() {
            self.consecutive_errors.store(0, Ordering::SeqCst);
            return CycleOutcome::Idle;
        }

        match self.process_records(records).await {
            Ok(outcome) => outcome,
            Err(e) => self.on_error(e).await,
        }
    }

    async fn process_records(&self, mut records: Vec<StreamRecord>) -> Result<CycleOutcome> {
        let started = Instant::now();
        let mut report = BatchReport::default();

        // Exhausted records at the head are isolated so they cannot block the shard.
        while let Some(head) = records.first() {
            if !self.is_exhausted(head) {
                break;
            }
            let head = records.remove(0);
            self.isolate(&head).await?;
            report.isolated.push(head.sequence_number);
            report.checkpoint = Some(head.sequence_number);
        }
        // Anything behind a later exhausted record waits until it reaches the head.
        if let Some(pos) = records.iter().position(|record| self.is_exhausted(record)) {
            records.truncate(pos);
        }

        report.records = records.len() + report.isolated.len();
        let poison_pill = !report.isolated.is_empty();

        if records.is_empty() {
            self.strategy.record_batch_result(
                &self.shard_id,
                &BatchResult {
                    record_count: report.records,
                    poison_pill,
                    processing_time_ms: started.elapsed().as_millis() as u64,
                    ..Default::default()
                },
            );
            self.consecutive_errors.store(0, Ordering::SeqCst);
            return Ok(CycleOutcome::Processed(report));
        }

        let mut tasks = match self.records.parse_records(&records) {
            Ok(tasks) => tasks,
            Err(e) => {
                let attempts = self.charge(e.sequence_number);
                tracing::warn!("{} (attempt {})", e, attempts);
                self.record_failure(&records, poison_pill, started, Vec::new());
                return Err(e.into());
            }
        };
        for (task, record) in tasks.iter_mut().zip(&records) {
            task.retry_count = self.attempts(record.sequence_number);
        }
        let task_types: Vec<String> = tasks.iter().map(|task| task.task_type.clone()).collect();
        let ids: Vec<TaskId> = tasks.iter().map(|task| task.id.clone()).collect();

        let outcome = match self.records.dispatch(self.processor.as_ref(), tasks).await {
            Ok(outcome) => outcome,
            Err(e) => {
                if let [record] = records.as_slice() {
                    let attempts = self.charge(record.sequence_number);
                    tracing::warn!(
                        "Record {} on shard {} failed, attempt {}: {}",
                        record.sequence_number,
                        self.shard_id,
                        attempts,
                        e
                    );
                } else if let Some(last) = records.last() {
                    self.narrow(last.sequence_number);
                    tracing::warn!(
                        "Batch of {} on shard {} failed, retrying one record at a time through {}: {}",
                        records.len(),
                        self.shard_id,
                        last.sequence_number,
                        e
                    );
                }
                self.record_failure(&records, poison_pill, started, task_types);
                return Err(e);
            }
        };

        let handled: HashSet<&TaskId> = outcome
            .executed
            .iter()
            .chain(&outcome.ignored)
            .chain(&outcome.handed_off)
            .chain(&outcome.discarded)
            .collect();

        let mut pending = 0;
        let mut prefix_end = None;
        for (index, (record, id)) in records.iter().zip(&ids).enumerate() {
            if handled.contains(id) {
                if pending == 0 {
                    prefix_end = Some(index);
                }
            } else {
                pending += 1;
                let attempts = self.charge(record.sequence_number);
                tracing::debug!(
                    "Record {} on shard {} needs a retry (attempt {})",
                    record.sequence_number,
                    self.shard_id,
                    attempts
                );
            }
        }

        if let Some(end) = prefix_end {
            let sequence_number = records[end].sequence_number;
            if !self.leaser.renew_shard(&self.shard_id).await? {
                return Ok(CycleOutcome::NotOwned);
            }
            self.leaser.checkpoint(&self.shard_id, sequence_number).await?;
            self.forget_through(sequence_number);
            report.checkpoint = Some(sequence_number);
        }

        self.strategy.record_batch_result(
            &self.shard_id,
            &BatchResult {
                record_count: report.records,
                success_count: records.len() - pending,
                failure_count: pending,
                processing_time_ms: started.elapsed().as_millis() as u64,
                throttled: false,
                poison_pill,
                task_types,
            },
        );
        self.consecutive_errors.store(0, Ordering::SeqCst);

        report.failed = pending;
        report.outcome = outcome;
        Ok(CycleOutcome::Processed(report))
    }

    fn record_failure(
        &self,
        records: &[StreamRecord],
        poison_pill: bool,
        started: Instant,
        task_types: Vec<String>,
    ) {
        self.strategy.record_batch_result(
            &self.shard_id,
            &BatchResult {
                record_count: records.len(),
                success_count: 0,
                failure_count: records.len(),
                processing_time_ms: started.elapsed().as_millis() as u64,
                throttled: false,
                poison_pill,
                task_types,
            },
        );
    }

    /// Runs cycles until cancelled, the lease is lost or the shard is relinquished.
    /// On cancellation the lease is released.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) -> ConsumerExit {
        tracing::info!("Consumer for shard {} started", self.shard_id);

        let exit = loop {
            if cancel.is_cancelled() {
                break ConsumerExit::Cancelled;
            }

            let delay = match self.run_cycle().await {
                CycleOutcome::Processed(report) if report.failed == 0 => Duration::ZERO,
                CycleOutcome::Relinquished => break ConsumerExit::Relinquished,
                CycleOutcome::NotOwned if !self.config.self_acquire => {
                    break ConsumerExit::LostLease;
                }
                CycleOutcome::Processed(_)
                | CycleOutcome::NotOwned
                | CycleOutcome::BackingOff
                | CycleOutcome::Idle
                | CycleOutcome::Throttled
                | CycleOutcome::Failed(_) => self.strategy.get_processing_delay(&self.shard_id),
            };

            if delay.is_zero() {
                tokio::task::yield_now().await;
            } else if !pause(delay, &cancel).await {
                break ConsumerExit::Cancelled;
            }
        };

        if exit == ConsumerExit::Cancelled
            && let Err(e) = self.leaser.release_shard(&self.shard_id).await
        {
            tracing::warn!("Could not release shard {} on stop: {}", self.shard_id, e);
        }
        tracing::info!("Consumer for shard {} stopped: {:?}", self.shard_id, exit);
        exit
    }
}
