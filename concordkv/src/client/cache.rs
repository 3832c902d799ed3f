//! Client-side shard cache.
//!
//! Size-bounded (strict LRU), TTL-bounded, and version-aware: an entry too
//! far behind the global topology version is purged on access, and incoming
//! events only ever move entries forward (an older-versioned event is
//! dropped). Expired entries are purged lazily on access, plus in bulk by a
//! periodic sweep.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tokio::time::Instant;

use crate::config::CacheConfig;
use crate::topology::ShardInfo;
use crate::topology::Subscription;
use crate::topology::TopologyEvent;
use crate::topology::TopologyEventKind;
use crate::ShardId;

/// Counters of cache effectiveness.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub expirations: u64,
    pub version_purges: u64,
    pub stale_event_drops: u64,
    pub size: usize,
}

struct CacheEntry {
    info: ShardInfo,
    inserted_at: Instant,
    last_access: Instant,
}

struct CacheInner {
    entries: HashMap<ShardId, CacheEntry>,
    key_map: HashMap<String, ShardId>,
    global_version: i64,
    stats: CacheStats,
}

/// The client's local view of shard placements.
pub struct TopologyCache {
    cfg: CacheConfig,
    ttl: Duration,
    inner: Mutex<CacheInner>,
}

impl TopologyCache {
    pub fn new(cfg: CacheConfig) -> Self {
        Self {
            ttl: Duration::from_millis(cfg.ttl),
            cfg,
            inner: Mutex::new(CacheInner {
                entries: HashMap::new(),
                key_map: HashMap::new(),
                global_version: 0,
                stats: CacheStats::default(),
            }),
        }
    }

    /// Look up a shard. Never returns an expired or version-stale entry.
    pub fn get(&self, shard_id: &ShardId) -> Option<ShardInfo> {
        let mut inner = self.inner.lock().unwrap();
        self.get_locked(&mut inner, shard_id)
    }

    /// Look up the shard owning `key` through the secondary mapping.
    pub fn get_by_key(&self, key: &str) -> Option<ShardInfo> {
        let mut inner = self.inner.lock().unwrap();
        let shard_id = match inner.key_map.get(key) {
            Some(shard_id) => shard_id.clone(),
            None => {
                inner.stats.misses += 1;
                return None;
            }
        };
        self.get_locked(&mut inner, &shard_id)
    }

    fn get_locked(&self, inner: &mut CacheInner, shard_id: &ShardId) -> Option<ShardInfo> {
        let global_version = inner.global_version;
        let verdict = match inner.entries.get_mut(shard_id) {
            None => None,
            Some(entry) => {
                if entry.inserted_at.elapsed() > self.ttl {
                    Some(false) // expired
                } else if self.cfg.version_check_enabled
                    && global_version - entry.info.version > self.cfg.version_tolerance
                {
                    Some(true) // version-stale
                } else {
                    entry.last_access = Instant::now();
                    let info = entry.info.clone();
                    inner.stats.hits += 1;
                    inner.stats.size = inner.entries.len();
                    return Some(info);
                }
            }
        };

        match verdict {
            None => {
                inner.stats.misses += 1;
            }
            Some(version_stale) => {
                inner.entries.remove(shard_id);
                if version_stale {
                    inner.stats.version_purges += 1;
                } else {
                    inner.stats.expirations += 1;
                }
                inner.stats.misses += 1;
                inner.stats.size = inner.entries.len();
            }
        }
        None
    }

    /// Insert or replace a shard entry, evicting the least recently used
    /// entry when full.
    pub fn set(&self, info: ShardInfo) {
        let mut inner = self.inner.lock().unwrap();
        self.set_locked(&mut inner, info);
    }

    fn set_locked(&self, inner: &mut CacheInner, info: ShardInfo) {
        let now = Instant::now();
        let id = info.id.clone();
        let replacing = inner.entries.contains_key(&id);
        inner.entries.insert(
            id,
            CacheEntry {
                info,
                inserted_at: now,
                last_access: now,
            },
        );
        if !replacing && inner.entries.len() > self.cfg.max_cache_size {
            if let Some(victim) = inner
                .entries
                .iter()
                .min_by_key(|(_, e)| e.last_access)
                .map(|(id, _)| id.clone())
            {
                inner.entries.remove(&victim);
                inner.stats.evictions += 1;
            }
        }
        inner.stats.size = inner.entries.len();
    }

    /// Record which shard owns `key`.
    pub fn set_key_mapping(&self, key: impl Into<String>, shard_id: ShardId) {
        self.inner.lock().unwrap().key_map.insert(key.into(), shard_id);
    }

    /// Advance the known global topology version. Monotonic.
    pub fn update_version(&self, version: i64) {
        let mut inner = self.inner.lock().unwrap();
        inner.global_version = inner.global_version.max(version);
    }

    pub fn global_version(&self) -> i64 {
        self.inner.lock().unwrap().global_version
    }

    pub fn invalidate(&self, shard_id: &ShardId) {
        let mut inner = self.inner.lock().unwrap();
        inner.entries.remove(shard_id);
        inner.key_map.retain(|_, mapped| mapped != shard_id);
        inner.stats.size = inner.entries.len();
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.lock().unwrap();
        let mut stats = inner.stats;
        stats.size = inner.entries.len();
        stats
    }

    /// Bulk purge of expired and version-stale entries.
    pub fn sweep(&self) {
        let mut inner = self.inner.lock().unwrap();
        let global_version = inner.global_version;
        let ttl = self.ttl;
        let check_version = self.cfg.version_check_enabled;
        let tolerance = self.cfg.version_tolerance;
        let before = inner.entries.len();
        let mut expired = 0u64;
        let mut stale = 0u64;
        inner.entries.retain(|_, entry| {
            if entry.inserted_at.elapsed() > ttl {
                expired += 1;
                false
            } else if check_version && global_version - entry.info.version > tolerance {
                stale += 1;
                false
            } else {
                true
            }
        });
        inner.stats.expirations += expired;
        inner.stats.version_purges += stale;
        inner.stats.size = inner.entries.len();
        if before != inner.entries.len() {
            tracing::debug!(purged = before - inner.entries.len(), "cache sweep");
        }
    }

    /// Apply one topology event. Out-of-order shard versions are dropped.
    pub fn apply_event(&self, event: &TopologyEvent) {
        self.update_version(event.version);
        match &event.kind {
            TopologyEventKind::ShardUpdated(info) => {
                let mut inner = self.inner.lock().unwrap();
                if let Some(entry) = inner.entries.get(&info.id) {
                    if info.version <= entry.info.version {
                        inner.stats.stale_event_drops += 1;
                        return;
                    }
                    self.set_locked(&mut inner, info.clone());
                }
            }
            TopologyEventKind::ShardRemoved(id) => self.invalidate(id),
            TopologyEventKind::ShardAdded(_)
            | TopologyEventKind::NodeAdded(_)
            | TopologyEventKind::NodeRemoved(_)
            | TopologyEventKind::NodeHealthChanged { .. }
            | TopologyEventKind::ConfigChanged => {}
        }
    }

    /// Spawn the periodic bulk-purge sweeper.
    pub fn spawn_sweeper(self: &Arc<Self>) -> JoinHandle<()> {
        let this = self.clone();
        let period = Duration::from_millis(self.cfg.sweep_interval.max(1));
        tokio::spawn(async move {
            let mut ticker = interval(period);
            loop {
                ticker.tick().await;
                this.sweep();
            }
        })
    }

    /// Spawn the event-driven refresh task over a topology subscription.
    pub fn run_subscriber(self: &Arc<Self>, mut subscription: Subscription) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            while let Some(event) = subscription.events.recv().await {
                this.apply_event(&event);
            }
            tracing::debug!(client = %subscription.client_id, "topology subscription closed");
        })
    }
}
