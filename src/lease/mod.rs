//! Shard Leasing Module
//!
//! Distributed, TTL-based ownership of log shards without a central coordinator.
//!
//! ## Core Mechanisms
//! - **Leases**: A shard lock is created with set-if-absent and is only renewed or released
//!   through compare-and-act on the owner token, so a lock is never touched by a non-owner.
//! - **Heartbeats**: Every instance writes a timestamp into a per-stream hash; instances seen
//!   within the last 30s form the active membership used for rebalancing.
//! - **Checkpoints**: The last handled sequence number per shard, written only by the owner and
//!   never moved backwards.
//!
//! ## Submodules
//! - **`types`**: The `LockProvider` contract, defaults and leaser configuration.
//! - **`cache_provider`**: Provider over a clustered key/value cache.
//! - **`file_provider`**: Single-file provider for local development.
//! - **`leaser`**: `ShardLeaser`, the per-stream facade with the heartbeat timer.

pub mod cache_provider;
pub mod file_provider;
pub mod leaser;
pub mod types;
