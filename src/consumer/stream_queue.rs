//! Log-backed Queue
//!
//! `StreamQueue` implements the uniform `Queue` contract over a sharded log.
//! Producing publishes tasks as JSON records keyed by their routing key.
//! Consuming runs a rebalancer whose assignments start and stop one
//! `ShardConsumer` per owned shard through the `ConsumerPool`.

use super::rebalancer::{AssignmentListener, RebalancerConfig, ShardRebalancer};
use super::shard_consumer::{ConsumerExit, CycleOutcome, ShardConsumer, ShardConsumerConfig};
use crate::adaptive::strategy::AdaptiveStrategy;
use crate::lease::leaser::ShardLeaser;
use crate::queue::backend::Queue;
use crate::queue::handler::BatchProcessor;
use crate::queue::types::{NewTask, ProcessOutcome, Task, TaskId};
use crate::stream::publisher::RecordPublisher;
use crate::stream::types::{LogStream, PublisherConfig, PutRecord};

use anyhow::{Result, bail};
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

struct RunningConsumer {
    cancel: CancellationToken,
    handle: JoinHandle<ConsumerExit>,
}

/// The shard consumers of one queue on this instance.
pub struct ConsumerPool {
    queue_id: String,
    stream: Arc<dyn LogStream>,
    leaser: Arc<ShardLeaser>,
    strategy: Arc<AdaptiveStrategy>,
    processor: Arc<dyn BatchProcessor>,
    config: ShardConsumerConfig,
    running: DashMap<String, RunningConsumer>,
}

impl ConsumerPool {
    pub fn new(
        queue_id: &str,
        stream: Arc<dyn LogStream>,
        leaser: Arc<ShardLeaser>,
        strategy: Arc<AdaptiveStrategy>,
        processor: Arc<dyn BatchProcessor>,
        config: ShardConsumerConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            queue_id: queue_id.to_string(),
            stream,
            leaser,
            strategy,
            processor,
            config,
            running: DashMap::new(),
        })
    }

    /// Shards with a live consumer, sorted. Finished consumers are dropped.
    pub fn running_shards(&self) -> Vec<String> {
        self.running.retain(|_, consumer| !consumer.handle.is_finished());
        let mut shards: Vec<String> = self.running.iter().map(|e| e.key().clone()).collect();
        shards.sort();
        shards
    }

    async fn stop(&self, shard_id: &str) {
        if let Some((_, consumer)) = self.running.remove(shard_id) {
            consumer.cancel.cancel();
            match consumer.handle.await {
                Ok(exit) => tracing::debug!("Consumer for {} exited: {:?}", shard_id, exit),
                Err(e) => tracing::warn!("Consumer for {} panicked: {}", shard_id, e),
            }
        }
    }

    /// Stops every consumer; each releases its shard on the way out.
    pub async fn shutdown(&self) {
        let shards: Vec<String> = self.running.iter().map(|e| e.key().clone()).collect();
        for shard in shards {
            self.stop(&shard).await;
        }
    }
}

#[async_trait]
impl AssignmentListener for ConsumerPool {
    async fn shard_acquired(&self, shard_id: &str) {
        if let Some(existing) = self.running.get(shard_id)
            && !existing.handle.is_finished()
        {
            return;
        }

        let consumer = ShardConsumer::new(
            shard_id,
            &self.queue_id,
            self.stream.clone(),
            self.leaser.clone(),
            self.strategy.clone(),
            self.processor.clone(),
            self.config.clone(),
        );
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(consumer.run(cancel.clone()));
        self.running
            .insert(shard_id.to_string(), RunningConsumer { cancel, handle });
        tracing::info!("Shard {} acquired for queue {}", shard_id, self.queue_id);
    }

    async fn shard_releasing(&self, shard_id: &str) {
        tracing::info!("Shard {} released by queue {}", shard_id, self.queue_id);
        self.stop(shard_id).await;
    }
}

pub struct StreamQueue {
    stream: Arc<dyn LogStream>,
    publisher: RecordPublisher,
    leaser: Arc<ShardLeaser>,
    strategy: Arc<AdaptiveStrategy>,
    consumer_config: ShardConsumerConfig,
    rebalancer_config: RebalancerConfig,
    /// The one queue this stream carries.
    queue_id: Mutex<Option<String>>,
    pools: DashMap<String, Arc<ConsumerPool>>,
    /// Consumers kept between `consume_messages_batch` calls so attempt
    /// counts survive.
    batch_consumers: DashMap<String, Arc<ShardConsumer>>,
    stopped: CancellationToken,
}

impl StreamQueue {
    pub fn new(
        stream: Arc<dyn LogStream>,
        leaser: Arc<ShardLeaser>,
        strategy: Arc<AdaptiveStrategy>,
        publisher_config: PublisherConfig,
        consumer_config: ShardConsumerConfig,
        rebalancer_config: RebalancerConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            publisher: RecordPublisher::new(stream.clone(), publisher_config),
            stream,
            leaser,
            strategy,
            consumer_config,
            rebalancer_config,
            queue_id: Mutex::new(None),
            pools: DashMap::new(),
            batch_consumers: DashMap::new(),
            stopped: CancellationToken::new(),
        })
    }

    pub fn leaser(&self) -> &Arc<ShardLeaser> {
        &self.leaser
    }

    pub fn strategy(&self) -> &Arc<AdaptiveStrategy> {
        &self.strategy
    }

    /// Shards with a live stream consumer for `queue_id`.
    pub fn running_shards(&self, queue_id: &str) -> Vec<String> {
        self.pools
            .get(queue_id)
            .map(|pool| pool.running_shards())
            .unwrap_or_default()
    }

    fn check_queue(&self, queue_id: &str) -> Result<()> {
        let Ok(registered) = self.queue_id.lock() else {
            bail!("queue registration poisoned");
        };
        match registered.as_deref() {
            Some(id) if id == queue_id => Ok(()),
            Some(id) => bail!(
                "stream {} carries queue {}, not {}",
                self.stream.stream_id(),
                id,
                queue_id
            ),
            None => bail!("queue {} is not registered", queue_id),
        }
    }

    fn batch_consumer(&self, shard_id: &str, queue_id: &str, processor: &Arc<dyn BatchProcessor>) -> Arc<ShardConsumer> {
        self.batch_consumers
            .entry(shard_id.to_string())
            .or_insert_with(|| {
                ShardConsumer::new(
                    shard_id,
                    queue_id,
                    self.stream.clone(),
                    self.leaser.clone(),
                    self.strategy.clone(),
                    processor.clone(),
                    ShardConsumerConfig {
                        self_acquire: true,
                        ..self.consumer_config.clone()
                    },
                )
            })
            .clone()
    }
}

#[async_trait]
impl Queue for StreamQueue {
    async fn register(&self, queue_id: &str) -> Result<()> {
        let Ok(mut registered) = self.queue_id.lock() else {
            bail!("queue registration poisoned");
        };
        match registered.as_deref() {
            Some(id) if id != queue_id => bail!(
                "stream {} already carries queue {}",
                self.stream.stream_id(),
                id
            ),
            _ => {
                *registered = Some(queue_id.to_string());
                tracing::info!(
                    "Queue {} registered on stream {}",
                    queue_id,
                    self.stream.stream_id()
                );
                Ok(())
            }
        }
    }

    async fn add_messages(&self, queue_id: &str, messages: Vec<NewTask>) -> Result<Vec<TaskId>> {
        self.check_queue(queue_id)?;

        let mut ids = Vec::with_capacity(messages.len());
        let mut records = Vec::with_capacity(messages.len());
        for mut message in messages {
            let id = message.id.take().unwrap_or_default();
            let task = Task::scheduled(queue_id, id.clone(), message);
            records.push(PutRecord {
                partition_key: task.routing_key().to_string(),
                data: serde_json::to_vec(&task)?,
            });
            ids.push(id);
        }

        let published = self.publisher.publish(records).await?;
        tracing::debug!(
            "Published {} tasks for {} to {}",
            published.len(),
            queue_id,
            self.stream.stream_id()
        );
        Ok(ids)
    }

    async fn consume_messages_stream(
        &self,
        queue_id: &str,
        processor: Arc<dyn BatchProcessor>,
        cancel: CancellationToken,
    ) -> Result<()> {
        self.check_queue(queue_id)?;
        if self.pools.contains_key(queue_id) {
            bail!("queue {} is already being consumed", queue_id);
        }

        let pool = ConsumerPool::new(
            queue_id,
            self.stream.clone(),
            self.leaser.clone(),
            self.strategy.clone(),
            processor,
            self.consumer_config.clone(),
        );
        self.pools.insert(queue_id.to_string(), pool.clone());

        let rebalancer = ShardRebalancer::new(
            self.stream.clone(),
            self.leaser.clone(),
            pool.clone(),
            self.rebalancer_config.clone(),
        );

        let stop = CancellationToken::new();
        let watcher = {
            let stop = stop.clone();
            let stopped = self.stopped.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = cancel.cancelled() => {}
                    _ = stopped.cancelled() => {}
                }
                stop.cancel();
            })
        };

        tracing::info!(
            "Consuming queue {} from stream {}",
            queue_id,
            self.stream.stream_id()
        );
        rebalancer.run(stop).await;
        watcher.abort();

        pool.shutdown().await;
        self.pools.remove(queue_id);
        tracing::info!("Stopped consuming queue {}", queue_id);
        Ok(())
    }

    async fn consume_messages_batch(
        &self,
        queue_id: &str,
        processor: Arc<dyn BatchProcessor>,
        limit: Option<usize>,
    ) -> Result<ProcessOutcome> {
        self.check_queue(queue_id)?;

        let mut outcome = ProcessOutcome::default();
        let mut remaining = limit;
        for shard_id in self.stream.list_shards().await? {
            if remaining == Some(0) {
                break;
            }
            let consumer = self.batch_consumer(&shard_id, queue_id, &processor);
            match consumer.run_cycle_with_limit(remaining).await {
                CycleOutcome::Processed(report) => {
                    remaining = remaining.map(|left| left.saturating_sub(report.records));
                    outcome.merge(report.outcome);
                }
                CycleOutcome::Failed(e) => {
                    tracing::warn!("Batch on shard {} failed: {}", shard_id, e);
                }
                _ => {}
            }
        }
        Ok(outcome)
    }

    async fn shutdown(&self) -> Result<()> {
        self.stopped.cancel();

        let pools: Vec<Arc<ConsumerPool>> = self.pools.iter().map(|e| e.value().clone()).collect();
        for pool in pools {
            pool.shutdown().await;
        }

        let shards: Vec<String> = self.batch_consumers.iter().map(|e| e.key().clone()).collect();
        for shard in shards {
            if let Err(e) = self.leaser.release_shard(&shard).await {
                tracing::warn!("Could not release shard {}: {}", shard, e);
            }
        }
        self.batch_consumers.clear();

        self.leaser.cleanup();
        tracing::info!("Stream queue on {} shut down", self.stream.stream_id());
        Ok(())
    }
}
