//! Proxy pool: reverse proxies cached per routing key with a sliding TTL
//!
//! Each entry owns a [`ProxyInstance`] and a deadline. The first `get` for a
//! key creates the entry and spawns one expiry task for it; later calls only
//! push the deadline forward. The expiry task sleeps until the current
//! deadline, re-checks it, and removes the entry once it has really passed,
//! so resetting the deadline never spawns a second task.

use crate::config::PoolSettings;
use crate::error::GatewayError;
use crate::instance::ProxyInstance;
use crate::resolver::LocationResolver;
use crate::source::{PoolKey, Source};
use crate::transport::ReverseProxy;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Statistics for the proxy pool
#[derive(Debug, Default)]
pub struct PoolStats {
    /// Lookups served by an existing entry
    pub hits: AtomicU64,
    /// Lookups that created a new entry
    pub misses: AtomicU64,
    /// Entries removed after their TTL passed
    pub evictions: AtomicU64,
}

impl PoolStats {
    pub fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_eviction(&self) {
        self.evictions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get_hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn get_misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    pub fn get_evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }
}

/// Point-in-time view of the pool, as served by the admin API
#[derive(Debug, Clone, Serialize)]
pub struct PoolSnapshot {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub ttl_secs: u64,
}

struct PoolEntry {
    instance: ProxyInstance,
    deadline: Mutex<Instant>,
}

impl PoolEntry {
    fn new(instance: ProxyInstance, ttl: Duration) -> Self {
        Self {
            instance,
            deadline: Mutex::new(Instant::now() + ttl),
        }
    }

    fn touch(&self, ttl: Duration) {
        *self.deadline.lock() = Instant::now() + ttl;
    }

    fn deadline(&self) -> Instant {
        *self.deadline.lock()
    }
}

type Entries = DashMap<PoolKey, Arc<PoolEntry>>;

/// Concurrency-safe cache of reverse proxies keyed by source and invoke flag
pub struct ProxyPool {
    entries: Arc<Entries>,
    resolver: Arc<dyn LocationResolver>,
    settings: PoolSettings,
    stats: Arc<PoolStats>,
}

impl ProxyPool {
    pub fn new(resolver: Arc<dyn LocationResolver>, settings: PoolSettings) -> Self {
        debug!(
            ttl_secs = settings.ttl_secs,
            dial_timeout_secs = settings.dial_timeout_secs,
            max_idle = settings.max_idle_per_host,
            "Proxy pool initialized"
        );

        Self {
            entries: Arc::new(DashMap::new()),
            resolver,
            settings,
            stats: Arc::new(PoolStats::default()),
        }
    }

    /// Get pool statistics
    pub fn stats(&self) -> Arc<PoolStats> {
        Arc::clone(&self.stats)
    }

    /// Number of live entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, source: &Source, invoke: bool) -> bool {
        self.entries.contains_key(&PoolKey::new(source, invoke))
    }

    pub fn snapshot(&self) -> PoolSnapshot {
        PoolSnapshot {
            entries: self.len(),
            hits: self.stats.get_hits(),
            misses: self.stats.get_misses(),
            evictions: self.stats.get_evictions(),
            ttl_secs: self.settings.ttl_secs,
        }
    }

    /// Get the reverse proxy for a source, creating and caching it on first
    /// use. Every call pushes the entry's expiry out by the TTL.
    pub async fn get(
        &self,
        source: &Source,
        invoke: bool,
    ) -> Result<Arc<ReverseProxy>, GatewayError> {
        let key = PoolKey::new(source, invoke);
        let ttl = self.settings.ttl();

        // The shard lock is released at the end of the match, before any await
        let (entry, created) = match self.entries.entry(key.clone()) {
            Entry::Occupied(occupied) => {
                let entry = Arc::clone(occupied.get());
                entry.touch(ttl);
                (entry, false)
            }
            Entry::Vacant(vacant) => {
                let instance = ProxyInstance::new(
                    source.clone(),
                    invoke,
                    Arc::clone(&self.resolver),
                    self.settings.clone(),
                );
                let entry = Arc::new(PoolEntry::new(instance, ttl));
                vacant.insert(Arc::clone(&entry));
                (entry, true)
            }
        };

        if created {
            self.stats.record_miss();
            debug!(key = %key, "Proxy pool miss, entry created");
            spawn_expiry(
                Arc::downgrade(&self.entries),
                Arc::clone(&self.stats),
                key,
                Arc::clone(&entry),
            );
        } else {
            self.stats.record_hit();
            debug!(key = %key, ready = entry.instance.is_initialized(), "Proxy pool hit");
        }

        entry.instance.get().await
    }
}

/// Wait for the entry's deadline and evict it once the deadline has passed
/// without being pushed out. Ends early if the pool is dropped or the entry
/// was replaced.
fn spawn_expiry(entries: Weak<Entries>, stats: Arc<PoolStats>, key: PoolKey, entry: Arc<PoolEntry>) {
    tokio::spawn(async move {
        loop {
            tokio::time::sleep_until(entry.deadline()).await;

            let Some(map) = entries.upgrade() else {
                return;
            };

            // Deadline check and removal happen under the shard lock, which
            // also serializes against `touch` in `get`.
            let evicted = map.remove_if(&key, |_, current| {
                Arc::ptr_eq(current, &entry) && current.deadline() <= Instant::now()
            });
            if evicted.is_some() {
                stats.record_eviction();
                debug!(key = %key, "Proxy pool entry expired");
                return;
            }

            let still_ours = map
                .get(&key)
                .map(|current| Arc::ptr_eq(current.value(), &entry))
                .unwrap_or(false);
            if !still_ours {
                return;
            }
        }
    });
}
