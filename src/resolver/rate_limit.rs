//! Brute-force protection for password-gated links, keyed by
//! (slug, client). Consulted before resolving; failed attempts feed the
//! window, a successful attempt clears it.

use dashmap::DashMap;
use std::time::{Duration, Instant};
use thiserror::Error;

use crate::config::RateLimitConfig;

#[derive(Debug, Error)]
#[error("too many failed password attempts")]
pub struct RateLimitExceeded;

pub trait RateLimiter: Send + Sync {
    fn check_attempt(&self, slug: &str, client_id: &str) -> Result<(), RateLimitExceeded>;
    fn record_failure(&self, slug: &str, client_id: &str);
    fn record_success(&self, slug: &str, client_id: &str);
}

struct FailureWindow {
    started: Instant,
    failures: u32,
}

/// Fixed-window in-process limiter.
pub struct FixedWindowLimiter {
    windows: DashMap<(String, String), FailureWindow>,
    max_failures: u32,
    window: Duration,
}

impl FixedWindowLimiter {
    pub fn new(max_failures: u32, window: Duration) -> Self {
        Self {
            windows: DashMap::new(),
            max_failures: max_failures.max(1),
            window,
        }
    }

    pub fn from_config(cfg: &RateLimitConfig) -> Self {
        Self::new(cfg.max_failures, Duration::from_secs(cfg.window_secs))
    }

    fn key(slug: &str, client_id: &str) -> (String, String) {
        (slug.to_string(), client_id.to_string())
    }
}

impl RateLimiter for FixedWindowLimiter {
    fn check_attempt(&self, slug: &str, client_id: &str) -> Result<(), RateLimitExceeded> {
        if let Some(entry) = self.windows.get(&Self::key(slug, client_id)) {
            if entry.started.elapsed() < self.window && entry.failures >= self.max_failures {
                return Err(RateLimitExceeded);
            }
        }
        Ok(())
    }

    fn record_failure(&self, slug: &str, client_id: &str) {
        let mut entry = self
            .windows
            .entry(Self::key(slug, client_id))
            .or_insert_with(|| FailureWindow {
                started: Instant::now(),
                failures: 0,
            });

        if entry.started.elapsed() >= self.window {
            entry.started = Instant::now();
            entry.failures = 0;
        }
        entry.failures += 1;
    }

    fn record_success(&self, slug: &str, client_id: &str) {
        self.windows.remove(&Self::key(slug, client_id));
    }
}
