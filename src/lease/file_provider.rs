//! File-Backed Lock Provider
//!
//! Keeps locks, checkpoints and heartbeats in a single JSON document on local
//! disk. Operations are serialized by an in-process mutex and the file is
//! replaced atomically (write to a sibling temp file, then rename).
//!
//! Intended for local development: two processes sharing the file are NOT
//! protected from each other.

use super::types::{ACTIVE_INSTANCE_WINDOW, LockProvider};
use crate::types::now_ms;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct FileLock {
    owner: String,
    expires_at: u64,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct FileState {
    #[serde(default)]
    locks: HashMap<String, FileLock>,
    #[serde(default)]
    checkpoints: HashMap<String, u64>,
    /// stream -> instance -> last heartbeat (unix ms)
    #[serde(default)]
    heartbeats: HashMap<String, BTreeMap<String, u64>>,
}

impl FileState {
    fn live_lock(&self, key: &str, now: u64) -> Option<&FileLock> {
        self.locks.get(key).filter(|lock| lock.expires_at > now)
    }
}

pub struct FileLockProvider {
    path: PathBuf,
    guard: Mutex<()>,
}

impl FileLockProvider {
    pub fn new(path: impl AsRef<Path>) -> Arc<Self> {
        Arc::new(Self {
            path: path.as_ref().to_path_buf(),
            guard: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn load(&self) -> Result<FileState> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) if bytes.is_empty() => Ok(FileState::default()),
            Ok(bytes) => serde_json::from_slice(&bytes)
                .with_context(|| format!("corrupt lock file {}", self.path.display())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(FileState::default()),
            Err(e) => Err(e).with_context(|| format!("reading {}", self.path.display())),
        }
    }

    async fn store(&self, state: &FileState) -> Result<()> {
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent).await?;
        }

        let tmp = self.path.with_extension("tmp");
        let bytes = serde_json::to_vec_pretty(state)?;
        tokio::fs::write(&tmp, bytes)
            .await
            .with_context(|| format!("writing {}", tmp.display()))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .with_context(|| format!("replacing {}", self.path.display()))?;
        Ok(())
    }

    /// Runs `f` against the current state under the provider mutex, persisting
    /// the state afterwards when `f` reports a change.
    async fn with_state<T>(&self, f: impl FnOnce(&mut FileState, u64) -> (T, bool)) -> Result<T> {
        let _guard = self.guard.lock().await;
        let mut state = self.load().await?;
        let (out, dirty) = f(&mut state, now_ms());
        if dirty {
            self.store(&state).await?;
        }
        Ok(out)
    }
}

#[async_trait]
impl LockProvider for FileLockProvider {
    async fn acquire_lock(&self, key: &str, owner_id: &str, ttl: Duration) -> Result<bool> {
        self.with_state(|state, now| {
            if state.live_lock(key, now).is_some() {
                return (false, false);
            }
            state.locks.insert(
                key.to_string(),
                FileLock {
                    owner: owner_id.to_string(),
                    expires_at: now + ttl.as_millis() as u64,
                },
            );
            (true, true)
        })
        .await
    }

    async fn renew_lock(&self, key: &str, owner_id: &str, ttl: Duration) -> Result<bool> {
        self.with_state(|state, now| match state.locks.get_mut(key) {
            Some(lock) if lock.expires_at > now && lock.owner == owner_id => {
                lock.expires_at = now + ttl.as_millis() as u64;
                (true, true)
            }
            _ => (false, false),
        })
        .await
    }

    async fn release_lock(&self, key: &str, owner_id: &str) -> Result<bool> {
        self.with_state(|state, now| {
            let owned = state
                .live_lock(key, now)
                .map(|lock| lock.owner == owner_id)
                .unwrap_or(false);
            if owned {
                state.locks.remove(key);
            }
            (owned, owned)
        })
        .await
    }

    async fn lock_owner(&self, key: &str) -> Result<Option<String>> {
        self.with_state(|state, now| {
            (state.live_lock(key, now).map(|lock| lock.owner.clone()), false)
        })
        .await
    }

    async fn set_checkpoint(&self, key: &str, sequence_number: u64) -> Result<()> {
        self.with_state(|state, _| {
            state.checkpoints.insert(key.to_string(), sequence_number);
            ((), true)
        })
        .await
    }

    async fn get_checkpoint(&self, key: &str) -> Result<Option<u64>> {
        self.with_state(|state, _| (state.checkpoints.get(key).copied(), false))
            .await
    }

    async fn send_heartbeat(
        &self,
        stream_id: &str,
        instance_id: &str,
        _ttl: Duration,
    ) -> Result<()> {
        self.with_state(|state, now| {
            state
                .heartbeats
                .entry(stream_id.to_string())
                .or_default()
                .insert(instance_id.to_string(), now);
            ((), true)
        })
        .await
    }

    async fn get_active_instances(&self, stream_id: &str) -> Result<Vec<String>> {
        let window = ACTIVE_INSTANCE_WINDOW.as_millis() as u64;
        self.with_state(|state, now| {
            let cutoff = now.saturating_sub(window);
            let Some(beats) = state.heartbeats.get_mut(stream_id) else {
                return (Vec::new(), false);
            };

            let before = beats.len();
            beats.retain(|_, last| *last >= cutoff);
            let pruned = beats.len() != before;

            // BTreeMap keys are already sorted
            (beats.keys().cloned().collect(), pruned)
        })
        .await
    }
}
