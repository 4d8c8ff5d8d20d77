//! Adaptive Strategy (AIMD)
//!
//! Sizes each shard's batches and poll delay from what this consumer itself
//! observed. There is no cross-instance coordination: every instance tunes the
//! shards it owns independently.
//!
//! - **Clean batch**: batch size grows additively (capped at max), delay shrinks multiplicatively (floored at min).
//! - **Failed batch**: batch size shrinks multiplicatively (floored at min), delay grows additively (capped at max).
//! - **Throttled batch**: like a failure, but harder on both.
//! - **Backoff**: after `failure_threshold` consecutive failures the shard is paused for `backoff_penalty`.

use super::types::{AdaptiveConfig, AdaptiveSnapshot, BatchResult, ShardState};

use dashmap::DashMap;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;

pub struct AdaptiveStrategy {
    config: AdaptiveConfig,
    shards: DashMap<String, ShardState>,
}

impl AdaptiveStrategy {
    pub fn new(config: AdaptiveConfig) -> Self {
        Self {
            config: normalize(config),
            shards: DashMap::new(),
        }
    }

    pub fn config(&self) -> &AdaptiveConfig {
        &self.config
    }

    fn read<T>(&self, shard_id: &str, f: impl FnOnce(&ShardState) -> T) -> T {
        match self.shards.get(shard_id) {
            Some(state) => f(&state),
            None => f(&ShardState::new(&self.config)),
        }
    }

    pub fn get_batch_size(&self, shard_id: &str) -> usize {
        self.read(shard_id, |state| state.batch_size)
    }

    pub fn get_processing_delay(&self, shard_id: &str) -> Duration {
        self.read(shard_id, |state| state.delay)
    }

    /// True while the shard is inside its backoff window.
    pub fn should_backoff(&self, shard_id: &str) -> bool {
        let now = Instant::now();
        self.read(shard_id, |state| {
            state
                .backoff_until
                .map(|until| now < until)
                .unwrap_or(false)
        })
    }

    /// The only mutator of controller state.
    pub fn record_batch_result(&self, shard_id: &str, result: &BatchResult) {
        let config = &self.config;
        let mut state = self
            .shards
            .entry(shard_id.to_string())
            .or_insert_with(|| ShardState::new(config));

        state.batches += 1;
        state.last_processing_time_ms = result.processing_time_ms;
        remember_task_types(
            &mut state.recent_task_types,
            &result.task_types,
            config.recent_task_types,
        );

        // Data-quality signal only; it must not shrink batches for other records.
        if result.poison_pill {
            state.poison_pills += 1;
            tracing::warn!(
                "Shard {} isolated a poison record ({} so far)",
                shard_id,
                state.poison_pills
            );
        }

        if result.is_clean() {
            state.consecutive_successes += 1;
            state.consecutive_failures = 0;
            state.backoff_until = None;
            state.batch_size = (state.batch_size + config.batch_increase_step)
                .clamp(config.min_batch_size, config.max_batch_size);
            state.delay = scale(state.delay, config.delay_decrease_factor)
                .clamp(config.min_delay, config.max_delay);

            tracing::trace!(
                "Shard {} clean batch: size={} delay={:?}",
                shard_id,
                state.batch_size,
                state.delay
            );
            return;
        }

        state.consecutive_successes = 0;
        state.consecutive_failures += 1;

        let (factor, delay_step) = if result.throttled {
            (config.throttle_decrease_factor, config.delay_increase_step * 2)
        } else {
            (config.batch_decrease_factor, config.delay_increase_step)
        };

        let shrunk = (state.batch_size as f64 * factor).floor() as usize;
        state.batch_size = shrunk.clamp(config.min_batch_size, config.max_batch_size);
        state.delay = (state.delay + delay_step).clamp(config.min_delay, config.max_delay);

        if state.consecutive_failures >= config.failure_threshold {
            state.backoff_until = Some(Instant::now() + config.backoff_penalty);
            tracing::warn!(
                "Shard {} backing off for {:?} after {} consecutive failures",
                shard_id,
                config.backoff_penalty,
                state.consecutive_failures
            );
        } else {
            tracing::debug!(
                "Shard {} {} batch: size={} delay={:?} failures={}",
                shard_id,
                if result.throttled { "throttled" } else { "failed" },
                state.batch_size,
                state.delay,
                state.consecutive_failures
            );
        }
    }

    /// Drops all state of a shard, e.g. after it was handed to another instance.
    pub fn reset(&self, shard_id: &str) {
        self.shards.remove(shard_id);
    }

    /// Diagnostic view of one shard, or of every known shard sorted by id.
    pub fn get_snapshot(&self, shard_id: Option<&str>) -> Vec<AdaptiveSnapshot> {
        let now = Instant::now();
        match shard_id {
            Some(shard_id) => {
                vec![self.read(shard_id, |state| snapshot(shard_id, state, now))]
            }
            None => {
                let mut all: Vec<AdaptiveSnapshot> = self
                    .shards
                    .iter()
                    .map(|entry| snapshot(entry.key(), entry.value(), now))
                    .collect();
                all.sort_by(|a, b| a.shard_id.cmp(&b.shard_id));
                all
            }
        }
    }
}

impl Default for AdaptiveStrategy {
    fn default() -> Self {
        Self::new(AdaptiveConfig::default())
    }
}

fn scale(delay: Duration, factor: f64) -> Duration {
    Duration::from_secs_f64(delay.as_secs_f64() * factor.max(0.0))
}

fn remember_task_types(recent: &mut VecDeque<String>, seen: &[String], cap: usize) {
    for task_type in seen {
        if let Some(pos) = recent.iter().position(|known| known == task_type) {
            recent.remove(pos);
        }
        recent.push_back(task_type.clone());
        while recent.len() > cap {
            recent.pop_front();
        }
    }
}

fn snapshot(shard_id: &str, state: &ShardState, now: Instant) -> AdaptiveSnapshot {
    AdaptiveSnapshot {
        shard_id: shard_id.to_string(),
        batch_size: state.batch_size,
        delay_ms: state.delay.as_millis() as u64,
        consecutive_successes: state.consecutive_successes,
        consecutive_failures: state.consecutive_failures,
        backoff_remaining_ms: state
            .backoff_until
            .filter(|until| *until > now)
            .map(|until| (until - now).as_millis() as u64),
        poison_pills: state.poison_pills,
        batches: state.batches,
        last_processing_time_ms: state.last_processing_time_ms,
        recent_task_types: state.recent_task_types.iter().cloned().collect(),
    }
}

/// Puts every bound pair in order so clamping can never panic.
fn normalize(mut config: AdaptiveConfig) -> AdaptiveConfig {
    if config.min_batch_size > config.max_batch_size {
        tracing::warn!(
            "Adaptive batch bounds {}..{} are inverted; swapping",
            config.min_batch_size,
            config.max_batch_size
        );
        std::mem::swap(&mut config.min_batch_size, &mut config.max_batch_size);
    }
    config.min_batch_size = config.min_batch_size.max(1);
    config.max_batch_size = config.max_batch_size.max(config.min_batch_size);
    if config.min_delay > config.max_delay {
        tracing::warn!(
            "Adaptive delay bounds {:?}..{:?} are inverted; swapping",
            config.min_delay,
            config.max_delay
        );
        std::mem::swap(&mut config.min_delay, &mut config.max_delay);
    }
    config
}
