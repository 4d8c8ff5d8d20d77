//! Key/Value Cache Backend
//!
//! The narrow set of atomic key/value operations the lock manager and the
//! cache-backed lock provider are built on. Any store offering set-if-absent
//! with TTL and compare-and-act on a single key can implement it.
//!
//! `MemoryCache` keeps everything in a `DashMap`; each operation runs under the
//! shard lock of its key, which makes every primitive atomic per key.

use anyhow::Result;
use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

#[async_trait]
pub trait Cache: Send + Sync {
    /// Reads a string value. Expired keys read as absent.
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Unconditional write, optionally with a TTL.
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()>;

    /// Writes `value` only if the key is absent (or expired).
    /// Returns true only if this call created the key.
    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool>;

    /// Resets the TTL of `key` only if its current value equals `expected`.
    async fn expire_if_eq(&self, key: &str, expected: &str, ttl: Duration) -> Result<bool>;

    /// Deletes `key` only if its current value equals `expected`.
    async fn delete_if_eq(&self, key: &str, expected: &str) -> Result<bool>;

    /// Unconditional delete. Returns whether a live key was removed.
    async fn delete(&self, key: &str) -> Result<bool>;

    /// Batch existence check, one flag per key in input order.
    async fn exists_many(&self, keys: &[String]) -> Result<Vec<bool>>;

    /// Sets one field of a hash; `ttl` (if given) applies to the whole hash.
    async fn hset(&self, key: &str, field: &str, value: &str, ttl: Option<Duration>)
    -> Result<()>;

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>>;

    async fn hdel(&self, key: &str, field: &str) -> Result<bool>;
}

#[derive(Debug, Clone)]
enum CacheValue {
    Text(String),
    Hash(HashMap<String, String>),
}

#[derive(Debug, Clone)]
struct CacheEntry {
    value: CacheValue,
    expires_at: Option<Instant>,
}

impl CacheEntry {
    fn text(value: &str, ttl: Option<Duration>) -> Self {
        Self {
            value: CacheValue::Text(value.to_string()),
            expires_at: ttl.map(|ttl| Instant::now() + ttl),
        }
    }

    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map(|deadline| now < deadline).unwrap_or(true)
    }

    fn text_equals(&self, expected: &str) -> bool {
        matches!(&self.value, CacheValue::Text(current) if current == expected)
    }
}

/// In-process implementation of [`Cache`].
///
/// Expiry is evaluated lazily against tokio's clock, so paused-time tests can
/// fast-forward through TTLs.
#[derive(Default)]
pub struct MemoryCache {
    entries: DashMap<String, CacheEntry>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored keys, including expired ones not yet evicted.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn evict_if_expired(&self, key: &str) {
        let now = Instant::now();
        self.entries.remove_if(key, |_, entry| !entry.is_live(now));
    }
}

#[async_trait]
impl Cache for MemoryCache {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let now = Instant::now();
        let value = match self.entries.get(key) {
            Some(entry) if entry.is_live(now) => match &entry.value {
                CacheValue::Text(value) => Some(value.clone()),
                CacheValue::Hash(_) => {
                    anyhow::bail!("key '{}' holds a hash, not a string", key)
                }
            },
            Some(_) => None,
            None => return Ok(None),
        };

        if value.is_none() {
            self.evict_if_expired(key);
        }
        Ok(value)
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        self.entries
            .insert(key.to_string(), CacheEntry::text(value, ttl));
        Ok(())
    }

    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        let now = Instant::now();
        match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().is_live(now) {
                    return Ok(false);
                }
                occupied.insert(CacheEntry::text(value, Some(ttl)));
                Ok(true)
            }
            Entry::Vacant(vacant) => {
                vacant.insert(CacheEntry::text(value, Some(ttl)));
                Ok(true)
            }
        }
    }

    async fn expire_if_eq(&self, key: &str, expected: &str, ttl: Duration) -> Result<bool> {
        let now = Instant::now();
        if let Some(mut entry) = self.entries.get_mut(key)
            && entry.is_live(now)
            && entry.text_equals(expected)
        {
            entry.expires_at = Some(now + ttl);
            return Ok(true);
        }
        Ok(false)
    }

    async fn delete_if_eq(&self, key: &str, expected: &str) -> Result<bool> {
        let now = Instant::now();
        let removed = self
            .entries
            .remove_if(key, |_, entry| entry.is_live(now) && entry.text_equals(expected));
        Ok(removed.is_some())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let now = Instant::now();
        Ok(self
            .entries
            .remove(key)
            .map(|(_, entry)| entry.is_live(now))
            .unwrap_or(false))
    }

    async fn exists_many(&self, keys: &[String]) -> Result<Vec<bool>> {
        let now = Instant::now();
        Ok(keys
            .iter()
            .map(|key| {
                self.entries
                    .get(key)
                    .map(|entry| entry.is_live(now))
                    .unwrap_or(false)
            })
            .collect())
    }

    async fn hset(
        &self,
        key: &str,
        field: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<()> {
        let now = Instant::now();
        let mut entry = self
            .entries
            .entry(key.to_string())
            .or_insert_with(|| CacheEntry {
                value: CacheValue::Hash(HashMap::new()),
                expires_at: None,
            });

        if !entry.is_live(now) {
            *entry = CacheEntry {
                value: CacheValue::Hash(HashMap::new()),
                expires_at: None,
            };
        }

        match &mut entry.value {
            CacheValue::Hash(fields) => {
                fields.insert(field.to_string(), value.to_string());
            }
            CacheValue::Text(_) => {
                anyhow::bail!("key '{}' holds a string, not a hash", key)
            }
        }

        if let Some(ttl) = ttl {
            entry.expires_at = Some(now + ttl);
        }
        Ok(())
    }

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>> {
        let now = Instant::now();
        match self.entries.get(key) {
            Some(entry) if entry.is_live(now) => match &entry.value {
                CacheValue::Hash(fields) => Ok(fields.clone()),
                CacheValue::Text(_) => anyhow::bail!("key '{}' holds a string, not a hash", key),
            },
            _ => Ok(HashMap::new()),
        }
    }

    async fn hdel(&self, key: &str, field: &str) -> Result<bool> {
        let now = Instant::now();
        if let Some(mut entry) = self.entries.get_mut(key)
            && entry.is_live(now)
            && let CacheValue::Hash(fields) = &mut entry.value
        {
            return Ok(fields.remove(field).is_some());
        }
        Ok(false)
    }
}
