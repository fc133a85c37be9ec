//! Debounced cache invalidation.
//!
//! Clicks do not clear cache entries synchronously. Affected link and owner
//! ids are buffered in a shared set and flushed once per debounce window by
//! a single timer that is only armed when work is pending, so a burst of
//! clicks on a hot link collapses into one bulk deletion.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::{sleep, timeout};
use tracing::{debug, warn};

use crate::cache::{keys, CacheBackend};

#[derive(Default)]
struct PendingInvalidations {
    /// (link id, slug) pairs whose cached snapshots must go.
    links: HashSet<(i64, String)>,
    /// Owner accounts whose cached analytics must go.
    owners: HashSet<String>,
}

impl PendingInvalidations {
    fn is_empty(&self) -> bool {
        self.links.is_empty() && self.owners.is_empty()
    }
}

pub struct InvalidationScheduler {
    cache: Arc<dyn CacheBackend>,
    pending: Mutex<PendingInvalidations>,
    timer_armed: AtomicBool,
    debounce: Duration,
    shutdown_flush_timeout: Duration,
}

impl InvalidationScheduler {
    pub fn new(
        cache: Arc<dyn CacheBackend>,
        debounce: Duration,
        shutdown_flush_timeout: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            cache,
            pending: Mutex::new(PendingInvalidations::default()),
            timer_armed: AtomicBool::new(false),
            debounce,
            shutdown_flush_timeout,
        })
    }

    /// Buffer invalidation for a clicked link and arm the flush timer if it
    /// is not already pending.
    pub fn schedule(self: &Arc<Self>, link_id: i64, slug: &str, owner_id: &str) {
        {
            let mut pending = self.pending.lock().expect("invalidation buffer poisoned");
            pending.links.insert((link_id, slug.to_string()));
            pending.owners.insert(owner_id.to_string());
        }

        if !self.timer_armed.swap(true, Ordering::AcqRel) {
            let scheduler = Arc::clone(self);
            tokio::spawn(async move {
                sleep(scheduler.debounce).await;
                scheduler.timer_armed.store(false, Ordering::Release);
                scheduler.flush().await;
            });
        }
    }

    /// Drain the buffer and delete the affected keys. Cache errors are
    /// logged and swallowed; the entries expire by TTL anyway.
    pub async fn flush(&self) {
        let drained = {
            let mut pending = self.pending.lock().expect("invalidation buffer poisoned");
            std::mem::take(&mut *pending)
        };

        if drained.is_empty() {
            return;
        }

        debug!(
            links = drained.links.len(),
            owners = drained.owners.len(),
            "flushing debounced cache invalidations"
        );

        for (link_id, slug) in &drained.links {
            if let Err(err) = self.cache.delete(&keys::link_by_id(*link_id)).await {
                warn!(link_id, error = %err, "cache delete failed");
            }
            if let Err(err) = self.cache.delete(&keys::link_by_slug(slug)).await {
                warn!(link_id, error = %err, "cache delete failed");
            }
            let prefix = keys::analytics_prefix(&format!("link:{link_id}"));
            if let Err(err) = self.cache.delete_by_prefix(&prefix).await {
                warn!(link_id, error = %err, "cache pattern delete failed");
            }
        }

        for owner in &drained.owners {
            let prefix = keys::analytics_prefix(&format!("owner:{owner}"));
            if let Err(err) = self.cache.delete_by_prefix(&prefix).await {
                warn!(owner, error = %err, "cache pattern delete failed");
            }
        }
    }

    /// Best-effort synchronous drain for process shutdown. Buffered
    /// invalidations that are lost here would serve stale analytics for the
    /// remainder of the TTL window.
    pub async fn shutdown(&self) {
        if timeout(self.shutdown_flush_timeout, self.flush()).await.is_err() {
            warn!("shutdown invalidation flush timed out");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;

    fn setup(debounce_ms: u64) -> (Arc<MemoryCache>, Arc<InvalidationScheduler>) {
        let cache = Arc::new(MemoryCache::new(1_000, 50, Duration::from_millis(0)));
        let scheduler = InvalidationScheduler::new(
            cache.clone() as Arc<dyn CacheBackend>,
            Duration::from_millis(debounce_ms),
            Duration::from_secs(1),
        );
        (cache, scheduler)
    }

    async fn seed(cache: &MemoryCache) {
        for key in [
            "url:5",
            "url:slug:promo",
            "analytics:link:5:report:a:b",
            "analytics:owner:acme:report:a:b",
        ] {
            cache
                .set(key, "v".into(), Duration::from_secs(300))
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn flush_clears_link_and_owner_keys() {
        let (cache, scheduler) = setup(10);
        seed(&cache).await;

        scheduler.schedule(5, "promo", "acme");
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(cache.get("url:5").await.unwrap(), None);
        assert_eq!(cache.get("url:slug:promo").await.unwrap(), None);
        assert_eq!(cache.get("analytics:link:5:report:a:b").await.unwrap(), None);
        assert_eq!(
            cache.get("analytics:owner:acme:report:a:b").await.unwrap(),
            None
        );
    }

    #[tokio::test]
    async fn burst_of_schedules_coalesces_into_one_buffer() {
        let (cache, scheduler) = setup(50);
        seed(&cache).await;

        for _ in 0..100 {
            scheduler.schedule(5, "promo", "acme");
        }
        {
            let pending = scheduler.pending.lock().unwrap();
            assert_eq!(pending.links.len(), 1);
            assert_eq!(pending.owners.len(), 1);
        }

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(cache.get("url:5").await.unwrap(), None);
    }

    #[tokio::test]
    async fn shutdown_drains_pending_buffer() {
        let (cache, scheduler) = setup(60_000);
        seed(&cache).await;

        // Timer is armed far in the future; shutdown must flush anyway.
        scheduler.schedule(5, "promo", "acme");
        scheduler.shutdown().await;

        assert_eq!(cache.get("url:5").await.unwrap(), None);
        assert_eq!(cache.get("url:slug:promo").await.unwrap(), None);
    }
}
