//! Typed Errors
//!
//! Most of the crate returns `anyhow::Result`. The failures below are the ones a
//! caller needs to tell apart, so they get their own types; they travel inside
//! `anyhow::Error` and are recovered with `downcast_ref`.

use thiserror::Error;

/// The batch processor did not finish within its time budget.
///
/// Retryable: the consumer treats it as a processing failure, never a crash.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("processor for queue '{queue_id}' timed out after {timeout_ms}ms")]
pub struct ProcessorTimeoutError {
    pub queue_id: String,
    pub timeout_ms: u64,
}

/// Records still rejected by the log after every publish attempt.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("failed to publish {failed_count} record(s) to stream '{stream_id}' after {attempts} attempts")]
pub struct PublishError {
    pub stream_id: String,
    pub failed_count: usize,
    pub attempts: u32,
}

/// A record whose payload could not be decoded into a task.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("malformed record {sequence_number} on shard '{shard_id}': {reason}")]
pub struct RecordParseError {
    pub shard_id: String,
    pub sequence_number: u64,
    pub reason: String,
}

/// The log refused a read because the shard's throughput limit was exceeded.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("read throughput exceeded on shard '{shard_id}'")]
pub struct ThrottledError {
    pub shard_id: String,
}

/// Returns true when `err` (or anything in its chain) is a [`ThrottledError`].
pub fn is_throttled(err: &anyhow::Error) -> bool {
    err.chain()
        .any(|cause| cause.downcast_ref::<ThrottledError>().is_some())
}
