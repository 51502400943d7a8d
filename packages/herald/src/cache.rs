//! In-memory caches with expiry and a capacity bound.
//!
//! Two caches are built on [`TtlCache`]: the response cache holding proxied
//! feed bodies, and the discovery cache holding the bridge feed URL picked
//! for each source. Both are keyed by source key.
//!
//! Each cache has one time-to-live for all of its entries and a capacity
//! measured in [`Weigh`] units: bytes for feed bodies, entries for discovered
//! URLs. Expired entries are never returned; eviction past the capacity is
//! left to [`moka`].

use std::time::{Duration, Instant};

use axum::body::Bytes;
use derive_more::Debug;
use moka::sync::Cache;
use tap::Pipe;
use url::Url;

/// How much of a cache's capacity a value takes up.
pub trait Weigh {
    fn weight(&self) -> u32;
}

impl Weigh for Url {
    fn weight(&self) -> u32 {
        1
    }
}

/// A cached value and when it was stored.
#[derive(Clone, Debug)]
pub struct CacheEntry<V> {
    pub value: V,
    pub cached_at: Instant,
}

impl<V> CacheEntry<V> {
    /// Whole seconds since the value was stored.
    pub fn age_secs(&self) -> u64 {
        self.cached_at.elapsed().as_secs()
    }
}

/// A proxied feed body as returned by the upstream.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CachedFeed {
    #[debug("{} bytes", body.len())]
    pub body: Bytes,
    pub content_type: String,
}

impl Weigh for CachedFeed {
    fn weight(&self) -> u32 {
        let bytes = self.body.len().saturating_add(self.content_type.len());
        u32::try_from(bytes).unwrap_or(u32::MAX)
    }
}

/// Concurrent map whose entries expire and whose total weight is bounded.
///
/// Cheaply cloneable; clones share state.
#[derive(Clone, Debug)]
pub struct TtlCache<V> {
    #[debug("{} entries", entries.entry_count())]
    entries: Cache<String, CacheEntry<V>>,
}

impl<V> TtlCache<V>
where
    V: Weigh + Clone + Send + Sync + 'static,
{
    /// A cache holding at most `capacity` units of weight, each entry
    /// living for `ttl` after it was stored.
    pub fn new(capacity: u64, ttl: Duration) -> Self {
        Cache::builder()
            .max_capacity(capacity)
            .weigher(|_key: &String, entry: &CacheEntry<V>| entry.value.weight())
            .time_to_live(ttl)
            .build()
            .pipe(|entries| Self { entries })
    }

    /// Look up a live entry.
    pub fn get(&self, key: &str) -> Option<CacheEntry<V>> {
        self.entries.get(key)
    }

    /// Store a value, replacing any existing entry for the key.
    pub fn set(&self, key: &str, value: V) {
        self.entries.insert(
            key.to_string(),
            CacheEntry {
                value,
                cached_at: Instant::now(),
            },
        );
    }

    /// Number of stored entries after pending evictions are applied.
    pub fn len(&self) -> u64 {
        self.entries.run_pending_tasks();
        self.entries.entry_count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total weight of stored entries after pending evictions are applied.
    pub fn weighted_size(&self) -> u64 {
        self.entries.run_pending_tasks();
        self.entries.weighted_size()
    }
}
