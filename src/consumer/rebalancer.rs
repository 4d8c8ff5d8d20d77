//! Shard Rebalancer
//!
//! Spreads a stream's shards over the active instances. Every instance runs
//! its own rebalancer; there is no coordinator. Each pass an instance compares
//! the shards it holds against its fair share `ceil(shards / instances)`,
//! picks up free shards when below it and gives back shards when above it.
//! Reassignments per pass are capped so the cluster converges gradually.

use crate::lease::leaser::ShardLeaser;
use crate::stream::types::LogStream;

use anyhow::Result;
use async_trait::async_trait;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RebalancerConfig {
    pub interval: Duration,
    /// Shards acquired or released per pass, at most.
    pub max_reassignments: usize,
}

impl Default for RebalancerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            max_reassignments: 3,
        }
    }
}

/// Told about shards changing hands on this instance.
#[async_trait]
pub trait AssignmentListener: Send + Sync {
    /// The lease on `shard_id` was just acquired.
    async fn shard_acquired(&self, shard_id: &str);
    /// The lease on `shard_id` is about to be released. Consumption must stop
    /// before this returns.
    async fn shard_releasing(&self, shard_id: &str);
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RebalanceReport {
    pub shards: usize,
    pub instances: usize,
    pub target: usize,
    pub acquired: Vec<String>,
    pub released: Vec<String>,
    /// Shards held once the pass is done, sorted.
    pub owned: Vec<String>,
}

/// Fair share of `shards` for one of `instances` instances.
pub fn fair_share(shards: usize, instances: usize) -> usize {
    shards.div_ceil(instances.max(1))
}

/// How many shards an instance holding `owned` should acquire (positive) or
/// release (negative) this pass.
pub fn plan_assignment(shards: usize, instances: usize, owned: usize, max_reassignments: usize) -> i64 {
    let target = fair_share(shards, instances);
    let cap = max_reassignments as i64;
    (target as i64 - owned as i64).clamp(-cap, cap)
}

pub struct ShardRebalancer {
    stream: Arc<dyn LogStream>,
    leaser: Arc<ShardLeaser>,
    listener: Arc<dyn AssignmentListener>,
    config: RebalancerConfig,
}

impl ShardRebalancer {
    pub fn new(
        stream: Arc<dyn LogStream>,
        leaser: Arc<ShardLeaser>,
        listener: Arc<dyn AssignmentListener>,
        config: RebalancerConfig,
    ) -> Self {
        Self {
            stream,
            leaser,
            listener,
            config,
        }
    }

    pub async fn rebalance_once(&self) -> Result<RebalanceReport> {
        let me = self.leaser.instance_id().as_str().to_string();

        let shards = self.stream.list_shards().await?;
        let mut instances = self.leaser.active_instances().await?;
        if !instances.contains(&me) {
            instances.push(me.clone());
        }

        let mut owners: HashMap<String, Option<String>> = HashMap::new();
        for shard in &shards {
            owners.insert(shard.clone(), self.leaser.shard_owner(shard).await?);
        }
        let mut mine: Vec<String> = shards
            .iter()
            .filter(|shard| owners.get(*shard).and_then(|o| o.as_deref()) == Some(me.as_str()))
            .cloned()
            .collect();
        let mut free: Vec<String> = shards
            .iter()
            .filter(|shard| matches!(owners.get(*shard), Some(None)))
            .cloned()
            .collect();

        let target = fair_share(shards.len(), instances.len());
        let planned = plan_assignment(
            shards.len(),
            instances.len(),
            mine.len(),
            self.config.max_reassignments,
        );

        let mut report = RebalanceReport {
            shards: shards.len(),
            instances: instances.len(),
            target,
            ..Default::default()
        };

        if planned > 0 {
            free.shuffle(&mut rand::thread_rng());
            for shard in free {
                if report.acquired.len() as i64 >= planned {
                    break;
                }
                if self.leaser.acquire_shard(&shard).await? {
                    self.listener.shard_acquired(&shard).await;
                    report.acquired.push(shard.clone());
                    mine.push(shard);
                }
            }
        } else if planned < 0 {
            mine.shuffle(&mut rand::thread_rng());
            let surplus = planned.unsigned_abs() as usize;
            let giving_up: Vec<String> = mine.drain(..surplus.min(mine.len())).collect();
            for shard in giving_up {
                self.listener.shard_releasing(&shard).await;
                self.leaser.release_shard(&shard).await?;
                report.released.push(shard);
            }
        }

        mine.sort();
        report.owned = mine;

        if !report.acquired.is_empty() || !report.released.is_empty() {
            tracing::info!(
                "Rebalanced {}: target {} of {} shards over {} instances, acquired {:?}, released {:?}",
                me,
                report.target,
                report.shards,
                report.instances,
                report.acquired,
                report.released
            );
        } else {
            tracing::debug!("Rebalance pass for {}: holding {:?}", me, report.owned);
        }
        Ok(report)
    }

    /// Runs a pass immediately, then every interval, until cancelled.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(self.config.interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {
                    if let Err(e) = self.rebalance_once().await {
                        tracing::warn!("Rebalance pass failed: {}", e);
                    }
                }
            }
        }
        tracing::debug!("Rebalancer stopped");
    }
}
