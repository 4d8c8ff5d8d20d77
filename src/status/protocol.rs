//! Status Protocol Definitions
//!
//! Endpoints and response bodies of the read-only status surface.

use crate::adaptive::types::AdaptiveSnapshot;
use crate::queue::async_tasks::AsyncTaskInfo;
use serde::{Deserialize, Serialize};

pub const ENDPOINT_HEALTH: &str = "/health";
pub const ENDPOINT_ADAPTIVE: &str = "/status/adaptive";
pub const ENDPOINT_ADAPTIVE_SHARD: &str = "/status/adaptive/:shard_id";
pub const ENDPOINT_INSTANCES: &str = "/status/instances";
pub const ENDPOINT_QUEUE_STATS: &str = "/status/queues/:queue_id";
pub const ENDPOINT_ASYNC_TASKS: &str = "/status/async";

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub instance_id: String,
    pub stream_id: String,
    pub heartbeat_failures: u32,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AdaptiveResponse {
    pub shards: Vec<AdaptiveSnapshot>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct InstancesResponse {
    pub stream_id: String,
    pub instances: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AsyncTasksResponse {
    pub max_tasks: usize,
    pub tasks: Vec<AsyncTaskInfo>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}
