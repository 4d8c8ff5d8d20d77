//! Status Module Tests
//!
//! ## Test Scopes
//! - **Handlers**: Each endpoint reports the state of the component behind it.

#[cfg(test)]
mod tests {
    use crate::adaptive::strategy::AdaptiveStrategy;
    use crate::adaptive::types::BatchResult;
    use crate::lease::cache_provider::CacheLockProvider;
    use crate::lease::leaser::ShardLeaser;
    use crate::lease::types::LeaserConfig;
    use crate::lock::cache::MemoryCache;
    use crate::queue::async_tasks::AsyncTaskManager;
    use crate::queue::storage::{MemoryTaskStorage, TaskStorage};
    use crate::queue::types::{NewTask, Task, TaskId};
    use crate::status::handlers::*;
    use crate::types::InstanceId;
    use axum::{Extension, extract::Path, http::StatusCode};
    use futures::FutureExt;
    use serde_json::json;
    use std::sync::Arc;
    use std::time::Duration;

    async fn leaser() -> Arc<ShardLeaser> {
        ShardLeaser::start(
            "orders",
            InstanceId::from("node-1"),
            CacheLockProvider::new(Arc::new(MemoryCache::new())),
            LeaserConfig::default(),
            None,
        )
        .await
    }

    #[tokio::test]
    async fn test_health_and_instances() {
        let leaser = leaser().await;

        let (status, health) = handle_health(Extension(leaser.clone())).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(health.instance_id, "node-1");
        assert_eq!(health.stream_id, "orders");

        let instances = handle_instances(Extension(leaser.clone())).await.unwrap();
        assert_eq!(instances.instances, vec!["node-1"]);

        leaser.cleanup();
    }

    #[tokio::test]
    async fn test_adaptive_snapshots() {
        let strategy = Arc::new(AdaptiveStrategy::default());
        strategy.record_batch_result("shard-0001", &BatchResult::default());

        let all = handle_adaptive(Extension(strategy.clone())).await;
        assert_eq!(all.shards.len(), 1);

        let (status, one) =
            handle_adaptive_shard(Extension(strategy.clone()), Path("shard-0001".to_string())).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(one.shards[0].shard_id, "shard-0001");

        let (status, _) =
            handle_adaptive_shard(Extension(strategy), Path("shard-9999".to_string())).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_queue_stats_and_async_tasks() {
        let storage: Arc<dyn TaskStorage> = MemoryTaskStorage::new();
        storage
            .insert_tasks(vec![Task::scheduled(
                "emails",
                TaskId::from("t-1"),
                NewTask::new("send", json!({})),
            )])
            .await
            .unwrap();

        let stats = handle_queue_stats(Extension(storage), Path("emails".to_string()))
            .await
            .unwrap();
        assert_eq!(stats.scheduled, 1);

        let manager = AsyncTaskManager::new(100, Duration::from_secs(10));
        let task = Task::scheduled("emails", TaskId::from("t-2"), NewTask::new("send", json!({})));
        assert!(manager.handoff(
            &task,
            async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok::<(), anyhow::Error>(())
            }
            .boxed()
        ));

        let response = handle_async_tasks(Extension(manager.clone())).await;
        assert_eq!(response.max_tasks, 100);
        assert_eq!(response.tasks.len(), 1);
        assert_eq!(response.tasks[0].task_id.as_str(), "t-2");
    }
}
