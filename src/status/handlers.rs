use super::protocol::*;
use crate::adaptive::strategy::AdaptiveStrategy;
use crate::lease::leaser::ShardLeaser;
use crate::queue::async_tasks::AsyncTaskManager;
use crate::queue::storage::TaskStorage;
use crate::queue::types::QueueStats;

use axum::{Extension, Json, Router, extract::Path, http::StatusCode, routing::get};
use std::sync::Arc;

pub async fn handle_health(
    Extension(leaser): Extension<Arc<ShardLeaser>>,
) -> (StatusCode, Json<HealthResponse>) {
    let heartbeat_failures = leaser.consecutive_heartbeat_failures();
    let status = if heartbeat_failures == 0 {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status,
        Json(HealthResponse {
            instance_id: leaser.instance_id().to_string(),
            stream_id: leaser.stream_id().to_string(),
            heartbeat_failures,
        }),
    )
}

pub async fn handle_adaptive(
    Extension(strategy): Extension<Arc<AdaptiveStrategy>>,
) -> Json<AdaptiveResponse> {
    Json(AdaptiveResponse {
        shards: strategy.get_snapshot(None),
    })
}

pub async fn handle_adaptive_shard(
    Extension(strategy): Extension<Arc<AdaptiveStrategy>>,
    Path(shard_id): Path<String>,
) -> (StatusCode, Json<AdaptiveResponse>) {
    let shards = strategy.get_snapshot(Some(&shard_id));
    let status = if shards.is_empty() {
        StatusCode::NOT_FOUND
    } else {
        StatusCode::OK
    };
    (status, Json(AdaptiveResponse { shards }))
}

pub async fn handle_instances(
    Extension(leaser): Extension<Arc<ShardLeaser>>,
) -> Result<Json<InstancesResponse>, (StatusCode, Json<ErrorResponse>)> {
    match leaser.active_instances().await {
        Ok(instances) => Ok(Json(InstancesResponse {
            stream_id: leaser.stream_id().to_string(),
            instances,
        })),
        Err(e) => {
            tracing::warn!("Could not list active instances: {}", e);
            Err((
                StatusCode::SERVICE_UNAVAILABLE,
                Json(ErrorResponse {
                    error: e.to_string(),
                }),
            ))
        }
    }
}

pub async fn handle_queue_stats(
    Extension(storage): Extension<Arc<dyn TaskStorage>>,
    Path(queue_id): Path<String>,
) -> Result<Json<QueueStats>, (StatusCode, Json<ErrorResponse>)> {
    storage.queue_stats(&queue_id).await.map(Json).map_err(|e| {
        tracing::warn!("Could not read stats of queue {}: {}", queue_id, e);
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ErrorResponse {
                error: e.to_string(),
            }),
        )
    })
}

pub async fn handle_async_tasks(
    Extension(async_tasks): Extension<Arc<AsyncTaskManager>>,
) -> Json<AsyncTasksResponse> {
    Json(AsyncTasksResponse {
        max_tasks: async_tasks.max_tasks(),
        tasks: async_tasks.in_flight(),
    })
}

/// The status routes with their shared state attached.
pub fn router(
    leaser: Arc<ShardLeaser>,
    strategy: Arc<AdaptiveStrategy>,
    storage: Arc<dyn TaskStorage>,
    async_tasks: Arc<AsyncTaskManager>,
) -> Router {
    Router::new()
        .route(ENDPOINT_HEALTH, get(handle_health))
        .route(ENDPOINT_ADAPTIVE, get(handle_adaptive))
        .route(ENDPOINT_ADAPTIVE_SHARD, get(handle_adaptive_shard))
        .route(ENDPOINT_INSTANCES, get(handle_instances))
        .route(ENDPOINT_QUEUE_STATS, get(handle_queue_stats))
        .route(ENDPOINT_ASYNC_TASKS, get(handle_async_tasks))
        .layer(Extension(leaser))
        .layer(Extension(strategy))
        .layer(Extension(storage))
        .layer(Extension(async_tasks))
}
