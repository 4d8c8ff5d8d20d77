//! Distributed Lock Module
//!
//! A generic mutex over a pluggable key/value cache with TTL.
//!
//! ## Submodules
//! - **`cache`**: The `Cache` contract (set-if-absent, compare-and-act, hashes) and its in-memory implementation.
//! - **`manager`**: `LockManager`, which claims resources and de-duplicates concurrent in-process attempts.

pub mod cache;
pub mod manager;
