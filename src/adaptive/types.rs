use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;

pub const DEFAULT_MAX_BATCH_SIZE: usize = 50;

/// Tuning knobs of the per-shard AIMD controller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdaptiveConfig {
    pub min_batch_size: usize,
    pub max_batch_size: usize,
    pub initial_batch_size: usize,
    /// Additive increase applied after a clean batch.
    pub batch_increase_step: usize,
    /// Multiplicative decrease applied after a failed batch.
    pub batch_decrease_factor: f64,
    /// Multiplicative decrease applied after a throttled batch.
    pub throttle_decrease_factor: f64,

    pub min_delay: Duration,
    pub max_delay: Duration,
    pub initial_delay: Duration,
    /// Additive delay increase after a failed batch; doubled when throttled.
    pub delay_increase_step: Duration,
    /// Multiplicative delay decrease after a clean batch.
    pub delay_decrease_factor: f64,

    /// Consecutive failures after which the shard is put into backoff.
    pub failure_threshold: u32,
    pub backoff_penalty: Duration,
    /// How many distinct task types to remember per shard.
    pub recent_task_types: usize,
}

impl Default for AdaptiveConfig {
    fn default() -> Self {
        Self {
            min_batch_size: 1,
            max_batch_size: DEFAULT_MAX_BATCH_SIZE,
            initial_batch_size: DEFAULT_MAX_BATCH_SIZE,
            batch_increase_step: 5,
            batch_decrease_factor: 0.5,
            throttle_decrease_factor: 0.25,
            min_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            initial_delay: Duration::from_secs(1),
            delay_increase_step: Duration::from_millis(500),
            delay_decrease_factor: 0.5,
            failure_threshold: 5,
            backoff_penalty: Duration::from_secs(30),
            recent_task_types: 10,
        }
    }
}

/// What a consumer observed while handling one batch.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BatchResult {
    pub record_count: usize,
    pub success_count: usize,
    /// Records that failed and will be retried. Isolated poison records are
    /// not counted here.
    pub failure_count: usize,
    pub processing_time_ms: u64,
    pub throttled: bool,
    /// A poison record was isolated during this batch.
    pub poison_pill: bool,
    #[serde(default)]
    pub task_types: Vec<String>,
}

impl BatchResult {
    pub fn is_clean(&self) -> bool {
        self.failure_count == 0 && !self.throttled
    }
}

/// Mutable controller state of one shard.
#[derive(Debug, Clone)]
pub(crate) struct ShardState {
    pub batch_size: usize,
    pub delay: Duration,
    pub consecutive_successes: u32,
    pub consecutive_failures: u32,
    pub backoff_until: Option<Instant>,
    pub poison_pills: u64,
    pub batches: u64,
    pub last_processing_time_ms: u64,
    pub recent_task_types: VecDeque<String>,
}

impl ShardState {
    pub fn new(config: &AdaptiveConfig) -> Self {
        Self {
            batch_size: config
                .initial_batch_size
                .clamp(config.min_batch_size, config.max_batch_size),
            delay: config.initial_delay.clamp(config.min_delay, config.max_delay),
            consecutive_successes: 0,
            consecutive_failures: 0,
            backoff_until: None,
            poison_pills: 0,
            batches: 0,
            last_processing_time_ms: 0,
            recent_task_types: VecDeque::new(),
        }
    }
}

/// Read-only view for telemetry. Never feed it back into control decisions.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AdaptiveSnapshot {
    pub shard_id: String,
    pub batch_size: usize,
    pub delay_ms: u64,
    pub consecutive_successes: u32,
    pub consecutive_failures: u32,
    /// Remaining backoff, `None` when the shard is not backing off.
    pub backoff_remaining_ms: Option<u64>,
    pub poison_pills: u64,
    pub batches: u64,
    pub last_processing_time_ms: u64,
    pub recent_task_types: Vec<String>,
}
