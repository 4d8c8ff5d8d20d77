use shard_dispatch::adaptive::strategy::AdaptiveStrategy;
use shard_dispatch::config::EngineConfig;
use shard_dispatch::consumer::stream_queue::StreamQueue;
use shard_dispatch::lease::cache_provider::CacheLockProvider;
use shard_dispatch::lease::file_provider::FileLockProvider;
use shard_dispatch::lease::leaser::ShardLeaser;
use shard_dispatch::lease::types::{HeartbeatFailureFn, LockProvider};
use shard_dispatch::lock::cache::MemoryCache;
use shard_dispatch::queue::async_tasks::AsyncTaskManager;
use shard_dispatch::queue::backend::Queue;
use shard_dispatch::queue::handler::{BatchProcessor, TaskActions, TaskHandler};
use shard_dispatch::queue::notify::{Notifications, TracingNotifier};
use shard_dispatch::queue::registry::TaskQueueManager;
use shard_dispatch::queue::storage::{MemoryTaskStorage, TaskStorage};
use shard_dispatch::queue::types::{ExecutorConfig, NewTask, Task};
use shard_dispatch::status::handlers::router;
use shard_dispatch::stream::memory::MemoryStream;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        // .with_max_level(tracing::Level::DEBUG)
        .with_max_level(tracing::Level::INFO)
        .init();

    let args: Vec<String> = std::env::args().collect();
    let config = match EngineConfig::from_args(&args) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{}", e);
            eprintln!(
                "Usage: {} [--instance <id>] [--stream <id>] [--queue <id>] [--shards <n>] \
                 [--bind <addr:port>] [--lock-file <path>] [--max-async-tasks <n>]",
                args[0]
            );
            eprintln!("Example: {} --instance node-1 --bind 127.0.0.1:8080", args[0]);
            std::process::exit(1);
        }
    };

    tracing::info!(
        "Starting instance {} on stream {} ({} shards)",
        config.instance_id,
        config.stream_id,
        config.shard_count
    );

    let notifications = Notifications::new(Arc::new(TracingNotifier));

    // 1. Leasing:
    let provider: Arc<dyn LockProvider> = match &config.lock_file {
        Some(path) => {
            tracing::warn!("Using file lock provider at {:?} (single host only)", path);
            FileLockProvider::new(path)
        }
        None => CacheLockProvider::new(Arc::new(MemoryCache::new())),
    };
    let on_heartbeat_failure: HeartbeatFailureFn = {
        let notifications = notifications.clone();
        Arc::new(move |stream_id: &str, instance_id: &str, failures: u32| {
            notifications.critical_error(format!(
                "instance {} lost {} heartbeats in a row on {}",
                instance_id, failures, stream_id
            ));
        })
    };
    let leaser = ShardLeaser::start(
        &config.stream_id,
        config.instance_id.clone(),
        provider,
        config.leaser.clone(),
        Some(on_heartbeat_failure),
    )
    .await;
    let strategy = Arc::new(AdaptiveStrategy::new(config.adaptive.clone()));

    // 2. Task queue:
    let storage: Arc<dyn TaskStorage> = MemoryTaskStorage::new();
    let async_tasks = AsyncTaskManager::with_storage(
        config.max_async_tasks,
        config.async_shutdown_grace,
        storage.clone(),
    );

    let manager = TaskQueueManager::new();
    let executor_config = ExecutorConfig {
        multiple: true,
        parallel: false,
        store_on_failure: true,
        retry: config.retry.clone(),
    };
    manager.register(
        &config.queue_id,
        "log",
        executor_config.clone(),
        |tasks: Vec<Task>, actions: TaskActions| async move {
            for task in &tasks {
                tracing::info!("Executing task {}: {}", task.id, task.payload);
                actions.success(task);
            }
            Ok(())
        },
    );
    manager.register(
        &config.queue_id,
        "slow",
        ExecutorConfig {
            multiple: false,
            parallel: true,
            ..executor_config
        },
        |tasks: Vec<Task>, actions: TaskActions| async move {
            for task in &tasks {
                let id = task.id.clone();
                let accepted = actions.handoff(task, async move {
                    tokio::time::sleep(Duration::from_secs(2)).await;
                    tracing::info!("Slow task {} finished", id);
                    Ok(())
                });
                if !accepted {
                    actions.fail(task, "async task capacity reached");
                }
            }
            Ok(())
        },
    );

    let handler: Arc<dyn BatchProcessor> = Arc::new(
        TaskHandler::new(manager, async_tasks.clone())
            .with_storage(storage.clone())
            .with_notifications(notifications.clone()),
    );

    // 3. Log-backed queue:
    let stream = MemoryStream::new(&config.stream_id, config.shard_count);
    let queue = StreamQueue::new(
        stream,
        leaser.clone(),
        strategy.clone(),
        config.publisher.clone(),
        config.consumer.clone(),
        config.rebalancer.clone(),
    );
    queue.register(&config.queue_id).await?;

    let cancel = CancellationToken::new();
    let consumer = {
        let queue = queue.clone();
        let queue_id = config.queue_id.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if let Err(e) = queue.consume_messages_stream(&queue_id, handler, cancel).await {
                tracing::error!("Consumer for {} stopped: {}", queue_id, e);
            }
        })
    };

    // 4. Spawn demo producer:
    let producer = {
        let queue = queue.clone();
        let queue_id = config.queue_id.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(5));
            let mut batch = 0u64;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {}
                }
                batch += 1;
                let messages = (0..5)
                    .map(|i| {
                        let task_type = if i == 0 { "slow" } else { "log" };
                        NewTask::new(task_type, serde_json::json!({ "batch": batch, "n": i }))
                            .with_partition_key(&format!("customer-{}", i))
                    })
                    .collect();
                match queue.add_messages(&queue_id, messages).await {
                    Ok(ids) => tracing::info!("Produced {} tasks (batch {})", ids.len(), batch),
                    Err(e) => tracing::warn!("Producing batch {} failed: {}", batch, e),
                }
            }
        })
    };

    // 5. Spawn stats reporter:
    {
        let leaser = leaser.clone();
        let storage = storage.clone();
        let queue = queue.clone();
        let queue_id = config.queue_id.clone();
        let notifications = notifications.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(30));
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {}
                }
                match leaser.active_instances().await {
                    Ok(instances) => tracing::info!(
                        "Stream stats: {} active instances, consuming {:?}",
                        instances.len(),
                        queue.running_shards(&queue_id)
                    ),
                    Err(e) => tracing::warn!("Could not list active instances: {}", e),
                }
                if let Ok(stats) = storage.queue_stats(&queue_id).await {
                    notifications.queue_stats(stats);
                }
            }
        });
    }

    // 6. Start status server:
    let app = router(leaser.clone(), strategy, storage, async_tasks.clone());
    tracing::info!("Status server listening on {}", config.bind_addr);
    tracing::info!("Press Ctrl+C to shutdown");

    let listener = tokio::net::TcpListener::bind(config.bind_addr).await?;
    let server = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move { cancel.cancelled().await })
                .await
        })
    };

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down");

    // 7. Shutdown: stop producing and consuming, give handoffs their grace, drop leases.
    cancel.cancel();
    join_logged("Producer", producer).await;
    join_logged("Consumer", consumer).await;
    queue.shutdown().await?;
    let outstanding = async_tasks.shutdown().await;
    if outstanding > 0 {
        tracing::warn!("{} async tasks did not finish in time", outstanding);
    }
    leaser.cleanup();
    server.await??;

    Ok(())
}

/// Waits for a background task, logging a panic or cancellation instead of dropping it.
async fn join_logged(name: &str, handle: JoinHandle<()>) -> bool {
    match handle.await {
        Ok(()) => true,
        Err(e) => {
            tracing::warn!("{} task failed: {}", name, e);
            false
        }
    }
}
