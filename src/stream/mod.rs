//! Log Stream Module
//!
//! The sharded append log the consumers read from.
//!
//! ## Submodules
//! - **`types`**: The `LogStream` contract and record types.
//! - **`memory`**: `MemoryStream`, an in-process log with hashed partition keys.
//! - **`publisher`**: `RecordPublisher`, batched writes with retry of rejected records.

pub mod memory;
pub mod publisher;
pub mod types;

#[cfg(test)]
mod tests;
