//! Adaptive Throughput Module
//!
//! Per-shard AIMD controller that turns observed batch outcomes into the next batch size,
//! poll delay and backoff decision. State is purely local to the instance.

pub mod strategy;
pub mod types;
