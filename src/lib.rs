//! Shard Dispatch Engine Library
//!
//! Coordinates many processes consuming one sharded log and dispatching the
//! records as tasks. It serves as the foundation for the node binary (`main.rs`).
//!
//! ## Architecture Modules
//! Data flows bottom-up at runtime: the rebalancer assigns shards, the leaser
//! holds their locks, shard consumers poll records sized by the adaptive
//! strategy and dispatch them to the task queue, whose outcome feeds back into
//! the strategy and the checkpoint store.
//!
//! - **`lock`**: The key/value cache contract and a generic named mutex over it.
//! - **`lease`**: Shard lock providers and the `ShardLeaser` with its heartbeat timer.
//! - **`adaptive`**: The per-shard AIMD controller for batch size and poll delay.
//! - **`stream`**: The sharded log contract, an in-memory log and the publish-side retry.
//! - **`consumer`**: Record decoding, the shard consumer loop, the rebalancer and the
//!   log-backed queue.
//! - **`queue`**: Executor registry, task handler, async handoff, storage and queue backends.
//! - **`status`**: Read-only HTTP telemetry.
//! - **`config`**, **`error`**, **`types`**: Node configuration, typed errors, shared identifiers.

pub mod adaptive;
pub mod config;
pub mod consumer;
pub mod error;
pub mod lease;
pub mod lock;
pub mod queue;
pub mod status;
pub mod stream;
pub mod types;
