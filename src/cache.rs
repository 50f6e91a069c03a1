//
// Copyright 2018-2019 Tamas Blummer
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//
//!
//! # Cache agent
//!
//! Read/write/remove by `(namespace, key)` with a bounded total byte size (spec §4.6). Keys
//! and values are opaque; `AggregationService` owns the `serde_json` contract per namespace
//! and only ever hands this module already-serialised bytes.
//!

use std::collections::HashSet;
use std::io;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use log::warn;
use lru_cache::LruCache;
use tokio::sync::Mutex;

use crate::error::{Result, SprunedError};

#[async_trait]
pub trait CacheAgent: Send + Sync {
    async fn get(&self, namespace: &str, key: &str) -> Result<Option<Vec<u8>>>;

    /// `ttl` MUST be `None` unless a concrete backend documents TTL support; the reference
    /// backends below both reject it, per §4.6.
    async fn put(&self, namespace: &str, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<()>;

    async fn remove(&self, namespace: &str, key: &str) -> Result<()>;

    /// Marks `(namespace, key)` as pinned: eviction must skip it, used to protect entries a
    /// live retention window (e.g. recently fetched blocks) still needs.
    async fn pin(&self, namespace: &str, key: &str);

    async fn unpin(&self, namespace: &str, key: &str);
}

fn compound_key(namespace: &str, key: &str) -> String {
    format!("{}.{}", namespace, key)
}

/// First two hex digits of `key` with leading zeros stripped, matching the on-disk layout of
/// `FileCacheInterface` (`original_source/spruned/service/file_cache_interface.py`).
fn prefix_for(key: &str) -> String {
    let trimmed = key.trim_start_matches('0');
    let prefix: String = trimmed.chars().take(2).collect();
    if prefix.is_empty() {
        "0".to_owned()
    } else {
        prefix
    }
}

/// One file per entry at `<dir>/<prefix>/<namespace>.<key>.bin`. No byte-size bound or
/// eviction: the file system is the bound, and retention is managed by whoever calls
/// `remove` (the blocks reactor's eviction, the aggregation service's cache policy).
pub struct FileCacheAgent {
    directory: PathBuf,
}

impl FileCacheAgent {
    pub fn new(directory: impl Into<PathBuf>) -> Result<Self> {
        let directory = directory.into();
        std::fs::create_dir_all(&directory).map_err(SprunedError::repository)?;
        Ok(FileCacheAgent { directory })
    }

    fn path_for(&self, namespace: &str, key: &str) -> PathBuf {
        self.directory.join(prefix_for(key)).join(format!("{}.{}.bin", namespace, key))
    }
}

#[async_trait]
impl CacheAgent for FileCacheAgent {
    async fn get(&self, namespace: &str, key: &str) -> Result<Option<Vec<u8>>> {
        match tokio::fs::read(self.path_for(namespace, key)).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(SprunedError::repository(e)),
        }
    }

    async fn put(&self, namespace: &str, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<()> {
        if ttl.is_some() {
            return Err(SprunedError::config("FileCacheAgent does not support TTL"));
        }
        let path = self.path_for(namespace, key);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(SprunedError::repository)?;
        }
        tokio::fs::write(&path, value).await.map_err(SprunedError::repository)
    }

    async fn remove(&self, namespace: &str, key: &str) -> Result<()> {
        match tokio::fs::remove_file(self.path_for(namespace, key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(SprunedError::repository(e)),
        }
    }

    // The file backend has no in-memory LRU to protect entries from, so pinning is a no-op:
    // every written file survives until an explicit `remove`.
    async fn pin(&self, _namespace: &str, _key: &str) {}

    async fn unpin(&self, _namespace: &str, _key: &str) {}
}

struct MemCacheInner {
    entries: LruCache<String, Vec<u8>>,
    pinned: HashSet<String>,
    bytes_used: u64,
}

/// Bounded in-memory cache: LRU eviction, except entries marked `pin`ned, which survive until
/// explicitly `unpin`ned (spec §4.6 "entries referenced by a live retention window are
/// pinned"). `lru_cache::LruCache` tracks recency; eviction walks it oldest-first itself
/// rather than relying on the crate's own capacity-triggered eviction, since that has no way
/// to skip a pinned entry.
pub struct MemCacheAgent {
    inner: Mutex<MemCacheInner>,
    capacity_bytes: u64,
}

impl MemCacheAgent {
    pub fn new(capacity_bytes: u64) -> Self {
        MemCacheAgent {
            inner: Mutex::new(MemCacheInner {
                entries: LruCache::new(usize::max_value()),
                pinned: HashSet::new(),
                bytes_used: 0,
            }),
            capacity_bytes,
        }
    }

    async fn evict_until_within_budget(inner: &mut MemCacheInner, capacity_bytes: u64) {
        if inner.bytes_used <= capacity_bytes {
            return;
        }
        let victims: Vec<String> = inner
            .entries
            .iter()
            .filter(|(k, _)| !inner.pinned.contains(*k))
            .map(|(k, _)| k.clone())
            .collect();
        for key in victims {
            if inner.bytes_used <= capacity_bytes {
                break;
            }
            if let Some(value) = inner.entries.remove(&key) {
                inner.bytes_used = inner.bytes_used.saturating_sub(value.len() as u64);
            }
        }
        if inner.bytes_used > capacity_bytes {
            warn!("cache over budget ({} / {} bytes) but every remaining entry is pinned", inner.bytes_used, capacity_bytes);
        }
    }
}

#[async_trait]
impl CacheAgent for MemCacheAgent {
    async fn get(&self, namespace: &str, key: &str) -> Result<Option<Vec<u8>>> {
        let mut inner = self.inner.lock().await;
        Ok(inner.entries.get_mut(&compound_key(namespace, key)).map(|v| v.clone()))
    }

    async fn put(&self, namespace: &str, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<()> {
        if ttl.is_some() {
            return Err(SprunedError::config("MemCacheAgent does not support TTL"));
        }
        let mut inner = self.inner.lock().await;
        let compound = compound_key(namespace, key);
        if let Some(old) = inner.entries.remove(&compound) {
            inner.bytes_used = inner.bytes_used.saturating_sub(old.len() as u64);
        }
        inner.bytes_used += value.len() as u64;
        inner.entries.insert(compound, value);
        let capacity_bytes = self.capacity_bytes;
        Self::evict_until_within_budget(&mut inner, capacity_bytes).await;
        Ok(())
    }

    async fn remove(&self, namespace: &str, key: &str) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let compound = compound_key(namespace, key);
        if let Some(old) = inner.entries.remove(&compound) {
            inner.bytes_used = inner.bytes_used.saturating_sub(old.len() as u64);
        }
        inner.pinned.remove(&compound);
        Ok(())
    }

    async fn pin(&self, namespace: &str, key: &str) {
        self.inner.lock().await.pinned.insert(compound_key(namespace, key));
    }

    async fn unpin(&self, namespace: &str, key: &str) {
        self.inner.lock().await.pinned.remove(&compound_key(namespace, key));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefix_strips_leading_zeros() {
        assert_eq!(prefix_for("00ab12"), "ab");
        assert_eq!(prefix_for("ffff"), "ff");
        assert_eq!(prefix_for("0000"), "0");
    }

    #[tokio::test]
    async fn mem_cache_round_trips_a_value() {
        let cache = MemCacheAgent::new(1024);
        cache.put("getblock", "abc", vec![1, 2, 3], None).await.unwrap();
        assert_eq!(cache.get("getblock", "abc").await.unwrap(), Some(vec![1, 2, 3]));
    }

    #[tokio::test]
    async fn mem_cache_rejects_ttl() {
        let cache = MemCacheAgent::new(1024);
        let result = cache.put("getblock", "abc", vec![1], Some(Duration::from_secs(1))).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn mem_cache_evicts_unpinned_before_pinned() {
        let cache = MemCacheAgent::new(16);
        cache.put("ns", "pinned", vec![0u8; 10], None).await.unwrap();
        cache.pin("ns", "pinned").await;
        cache.put("ns", "a", vec![0u8; 10], None).await.unwrap();
        cache.put("ns", "b", vec![0u8; 10], None).await.unwrap();

        assert_eq!(cache.get("ns", "pinned").await.unwrap().map(|v| v.len()), Some(10));
        assert!(cache.get("ns", "a").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn file_cache_round_trips_and_removes() {
        let dir = tempfile::tempdir().unwrap();
        let cache = FileCacheAgent::new(dir.path()).unwrap();
        cache.put("getrawtransaction", "00deadbeef", vec![9, 9, 9], None).await.unwrap();
        assert_eq!(cache.get("getrawtransaction", "00deadbeef").await.unwrap(), Some(vec![9, 9, 9]));
        cache.remove("getrawtransaction", "00deadbeef").await.unwrap();
        assert_eq!(cache.get("getrawtransaction", "00deadbeef").await.unwrap(), None);
    }
}
