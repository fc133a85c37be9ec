//! Advisory key/value cache with per-entry TTL and prefix-based bulk
//! deletion.
//!
//! Losing a cache entry never changes correctness, only latency, so every
//! failure is surfaced as a `Result` for the caller to log and ignore.

pub mod invalidation;

pub use invalidation::InvalidationScheduler;

use async_trait::async_trait;
use moka::future::Cache;
use moka::Expiry;
use std::time::{Duration, Instant};
use tokio::time::sleep;

/// Narrow cache interface used by the resolver, recorder, and aggregator.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    async fn get(&self, key: &str) -> anyhow::Result<Option<String>>;
    async fn set(&self, key: &str, value: String, ttl: Duration) -> anyhow::Result<()>;
    async fn delete(&self, key: &str) -> anyhow::Result<()>;
    /// Delete every key starting with `prefix`, in bounded batches.
    async fn delete_by_prefix(&self, prefix: &str) -> anyhow::Result<()>;
}

#[derive(Clone)]
struct Entry {
    value: String,
    ttl: Duration,
}

struct EntryExpiry;

impl Expiry<String, Entry> for EntryExpiry {
    fn expire_after_create(
        &self,
        _key: &String,
        entry: &Entry,
        _created_at: Instant,
    ) -> Option<Duration> {
        Some(entry.ttl)
    }

    // Re-setting a key restarts its TTL from the new entry; the default
    // would keep the remaining time of the old one.
    fn expire_after_update(
        &self,
        _key: &String,
        entry: &Entry,
        _updated_at: Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        Some(entry.ttl)
    }
}

/// In-process moka-backed cache.
pub struct MemoryCache {
    cache: Cache<String, Entry>,
    delete_chunk: usize,
    delete_pause: Duration,
}

impl MemoryCache {
    pub fn new(max_entries: u64, delete_chunk: usize, delete_pause: Duration) -> Self {
        let cache = Cache::builder()
            .max_capacity(max_entries)
            .expire_after(EntryExpiry)
            .build();
        Self {
            cache,
            delete_chunk: delete_chunk.max(1),
            delete_pause,
        }
    }
}

#[async_trait]
impl CacheBackend for MemoryCache {
    async fn get(&self, key: &str) -> anyhow::Result<Option<String>> {
        Ok(self.cache.get(key).await.map(|e| e.value))
    }

    async fn set(&self, key: &str, value: String, ttl: Duration) -> anyhow::Result<()> {
        self.cache
            .insert(key.to_string(), Entry { value, ttl })
            .await;
        Ok(())
    }

    async fn delete(&self, key: &str) -> anyhow::Result<()> {
        self.cache.invalidate(key).await;
        Ok(())
    }

    async fn delete_by_prefix(&self, prefix: &str) -> anyhow::Result<()> {
        let matching: Vec<String> = self
            .cache
            .iter()
            .filter(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.as_ref().clone())
            .collect();

        // Chunked deletion with a short pause keeps large invalidation
        // bursts from saturating the backend.
        for (i, chunk) in matching.chunks(self.delete_chunk).enumerate() {
            if i > 0 && !self.delete_pause.is_zero() {
                sleep(self.delete_pause).await;
            }
            for key in chunk {
                self.cache.invalidate(key).await;
            }
        }

        Ok(())
    }
}

/// Popularity-tiered TTL selection.
#[derive(Debug, Clone, Copy)]
pub struct TtlPolicy {
    pub hot_threshold: i64,
    pub hot_ttl: Duration,
    pub cold_ttl: Duration,
    pub analytics_ttl: Duration,
}

impl TtlPolicy {
    pub fn from_config(cfg: &crate::config::CacheConfig) -> Self {
        Self {
            hot_threshold: cfg.hot_threshold,
            hot_ttl: Duration::from_secs(cfg.hot_ttl_secs),
            cold_ttl: Duration::from_secs(cfg.cold_ttl_secs),
            analytics_ttl: Duration::from_secs(cfg.analytics_ttl_secs),
        }
    }

    /// Popular links get the long TTL to keep storage off the hot path;
    /// cold links stay fresh with the short TTL.
    pub fn link_ttl(&self, click_count: i64) -> Duration {
        if click_count >= self.hot_threshold {
            self.hot_ttl
        } else {
            self.cold_ttl
        }
    }
}

/// Key builders shared by everything that touches the cache.
pub mod keys {
    pub fn link_by_id(id: i64) -> String {
        format!("url:{id}")
    }

    pub fn link_by_slug(slug: &str) -> String {
        format!("url:slug:{slug}")
    }

    /// `scope_prefix` is `link:{id}` or `owner:{account}`.
    pub fn analytics(scope_prefix: &str, kind: &str, start: &str, end: &str) -> String {
        format!("analytics:{scope_prefix}:{kind}:{start}:{end}")
    }

    pub fn analytics_prefix(scope_prefix: &str) -> String {
        format!("analytics:{scope_prefix}:")
    }
}
