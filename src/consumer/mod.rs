//! Consumer Module
//!
//! Reads tasks out of a sharded log and hands them to a batch processor.
//!
//! ## Architecture Overview
//! 1. **Assignment**: Every instance runs a `ShardRebalancer` that acquires free shards up to its
//!    fair share and gives back surplus ones, a few per pass.
//! 2. **Consumption**: One `ShardConsumer` loop per owned shard polls records after the checkpoint,
//!    sized and paced by the adaptive strategy.
//! 3. **Decoding and dispatch**: The `RecordProcessor` turns records into tasks (fail-fast) and runs
//!    the processor under a timeout.
//! 4. **Isolation**: A record that keeps failing is handed to the poison hook and skipped.
//!
//! ## Submodules
//! - **`processor`**: Record decoding and time-bounded dispatch.
//! - **`shard_consumer`**: The per-shard poll, process, checkpoint loop.
//! - **`rebalancer`**: Fair-share shard assignment across instances.
//! - **`stream_queue`**: The `Queue` implementation over a log, and the consumer pool behind it.

pub mod processor;
pub mod rebalancer;
pub mod shard_consumer;
pub mod stream_queue;

#[cfg(test)]
mod tests;
