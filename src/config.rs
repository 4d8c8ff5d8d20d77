//! Engine Configuration
//!
//! One node's identity plus the tunables of every component. Each component
//! config carries its own defaults; `EngineConfig::from_args` only overrides
//! what the command line names.

use crate::adaptive::types::AdaptiveConfig;
use crate::consumer::rebalancer::RebalancerConfig;
use crate::consumer::shard_consumer::ShardConsumerConfig;
use crate::lease::types::LeaserConfig;
use crate::queue::async_tasks::{DEFAULT_MAX_ASYNC_TASKS, DEFAULT_SHUTDOWN_GRACE};
use crate::queue::types::RetryPolicy;
use crate::stream::types::PublisherConfig;
use crate::types::InstanceId;

use anyhow::{Context, Result, bail};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub instance_id: InstanceId,
    pub stream_id: String,
    pub queue_id: String,
    pub shard_count: usize,
    /// Address of the status HTTP server.
    pub bind_addr: SocketAddr,
    /// Use the file-backed lock provider instead of the cache-backed one.
    pub lock_file: Option<PathBuf>,
    pub max_async_tasks: usize,
    pub async_shutdown_grace: Duration,

    pub leaser: LeaserConfig,
    pub adaptive: AdaptiveConfig,
    pub consumer: ShardConsumerConfig,
    pub rebalancer: RebalancerConfig,
    pub publisher: PublisherConfig,
    pub retry: RetryPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            instance_id: InstanceId::new(),
            stream_id: "tasks".to_string(),
            queue_id: "default".to_string(),
            shard_count: 4,
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 8080)),
            lock_file: None,
            max_async_tasks: DEFAULT_MAX_ASYNC_TASKS,
            async_shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
            leaser: LeaserConfig::default(),
            adaptive: AdaptiveConfig::default(),
            consumer: ShardConsumerConfig::default(),
            rebalancer: RebalancerConfig::default(),
            publisher: PublisherConfig::default(),
            retry: RetryPolicy::default(),
        }
    }
}

impl EngineConfig {
    /// Parses `--flag value` pairs. `args[0]` is the program name.
    /// Unknown flags are skipped.
    pub fn from_args(args: &[String]) -> Result<Self> {
        let mut config = Self::default();

        let mut i = 1;
        while i < args.len() {
            let flag = args[i].as_str();
            let known = matches!(
                flag,
                "--instance"
                    | "--stream"
                    | "--queue"
                    | "--shards"
                    | "--bind"
                    | "--lock-file"
                    | "--max-async-tasks"
            );
            if !known {
                i += 1;
                continue;
            }

            let Some(value) = args.get(i + 1) else {
                bail!("{} needs a value", flag);
            };
            match flag {
                "--instance" => config.instance_id = InstanceId::from(value.as_str()),
                "--stream" => config.stream_id = value.clone(),
                "--queue" => config.queue_id = value.clone(),
                "--shards" => {
                    config.shard_count = value
                        .parse()
                        .with_context(|| format!("invalid --shards value '{}'", value))?;
                    if config.shard_count == 0 {
                        bail!("--shards must be at least 1");
                    }
                }
                "--bind" => {
                    config.bind_addr = value
                        .parse()
                        .with_context(|| format!("invalid --bind address '{}'", value))?;
                }
                "--lock-file" => config.lock_file = Some(PathBuf::from(value)),
                "--max-async-tasks" => {
                    config.max_async_tasks = value
                        .parse()
                        .with_context(|| format!("invalid --max-async-tasks value '{}'", value))?;
                }
                _ => {}
            }
            i += 2;
        }

        Ok(config)
    }
}
