//! Router-side shard map cache.
//!
//! TTL-bounded and push-updated: entries are seeded by fetch, refreshed from
//! the directory watch stream (always preferring the highest epoch seen),
//! and force-invalidated when the data path reports staleness. Lagged watch
//! consumers drop their cache and resynchronize with a full fetch.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use tokio::time::Instant;

use crate::directory::{Directory, DirectoryEvent, MapKey, ShardMap, WatchItem};
use crate::error::{ClusterError, Result};

struct Cached {
    map: ShardMap,
    fetched: Instant,
}

pub struct ShardMapCache {
    directory: Directory,
    ttl: Duration,
    inner: RwLock<HashMap<MapKey, Cached>>,
}

impl ShardMapCache {
    pub fn new(directory: Directory, ttl: Duration) -> Arc<Self> {
        Arc::new(Self {
            directory,
            ttl,
            inner: RwLock::new(HashMap::new()),
        })
    }

    /// Resolve a map, serving from cache within the staleness window.
    pub fn get(&self, key: &MapKey) -> Result<ShardMap> {
        {
            let inner = self.inner.read().unwrap();
            if let Some(cached) = inner.get(key) {
                if cached.fetched.elapsed() < self.ttl {
                    return Ok(cached.map.clone());
                }
            }
        }
        self.refetch(key)
    }

    /// Drop a cached map after a `NotLeader`/`EpochConflict` signal.
    pub fn invalidate(&self, key: &MapKey) {
        self.inner.write().unwrap().remove(key);
    }

    /// Install a pushed map version, keeping the highest epoch seen. Watch
    /// deliveries may duplicate or arrive reordered; the epoch comparison
    /// makes that harmless.
    pub fn observe(&self, map: ShardMap) {
        let mut inner = self.inner.write().unwrap();
        match inner.get(&map.key) {
            Some(cached) if cached.map.epoch() > map.epoch() => {}
            _ => {
                inner.insert(
                    map.key.clone(),
                    Cached {
                        map,
                        fetched: Instant::now(),
                    },
                );
            }
        }
    }

    fn refetch(&self, key: &MapKey) -> Result<ShardMap> {
        let map = self
            .directory
            .store()
            .shard_map(key)
            .ok_or_else(|| ClusterError::UnknownObject {
                namespace: key.namespace.to_string(),
                object: key.object.clone(),
            })?;
        self.observe(map.clone());
        Ok(map)
    }

    /// Run the push-update loop until the directory closes.
    pub fn spawn_refresh(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            let mut watch = cache.directory.watch_all();
            loop {
                match watch.recv().await {
                    WatchItem::Event(DirectoryEvent::Map { map, .. }) => cache.observe(map),
                    WatchItem::Event(_) => {}
                    WatchItem::Lagged => {
                        // Dropped deliveries: any cached entry may be stale
                        // beyond its epoch. Start over from full fetches.
                        cache.inner.write().unwrap().clear();
                    }
                    WatchItem::Closed => return,
                }
            }
        })
    }
}
