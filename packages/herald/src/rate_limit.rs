//! Fixed-window rate limiting.
//!
//! Buckets are keyed by arbitrary strings so one limiter serves every scope
//! the API uses:
//! - `create:{caller}` limits feed creation per caller
//! - `proxy:global` limits all proxied fetches together
//! - `proxy:source:{source_key}` limits fetches of a single upstream source
//!
//! Each bucket counts requests from the moment its window opened; once the
//! window elapses the next request opens a fresh window. Expired buckets are
//! swept every [`SWEEP_INTERVAL`] checks so idle keys don't accumulate.
//!
//! Limits live in process memory: running several instances multiplies the
//! effective limit by the instance count.

use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use dashmap::DashMap;
use tokio::time::Instant;
use tracing::debug;

/// Number of checks between sweeps of expired buckets.
pub const SWEEP_INTERVAL: u64 = 200;

/// Scope key shared by all proxied fetches.
pub const PROXY_GLOBAL: &str = "proxy:global";

/// The allowance for a scope.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct RateLimit {
    pub max: u32,
    pub window: Duration,
}

impl RateLimit {
    pub const fn new(max: u32, window: Duration) -> Self {
        Self { max, window }
    }
}

/// The outcome of a rate limit check.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct RateLimitDecision {
    pub allowed: bool,

    /// Requests left in the current window after this one.
    pub remaining: u32,

    /// Whole seconds until the window resets; zero when allowed.
    pub retry_after_secs: u64,
}

#[derive(Copy, Clone, Debug)]
struct Bucket {
    count: u32,
    reset_at: Instant,
}

/// In-memory fixed-window rate limiter.
///
/// Cheaply cloneable; clones share state.
#[derive(Clone, Debug, Default)]
pub struct RateLimiter {
    buckets: Arc<DashMap<String, Bucket>>,
    checks: Arc<AtomicU64>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count a request against `key` and report whether it may proceed.
    pub fn check(&self, key: &str, limit: RateLimit) -> RateLimitDecision {
        let now = Instant::now();
        if self.checks.fetch_add(1, Ordering::Relaxed) % SWEEP_INTERVAL == SWEEP_INTERVAL - 1 {
            self.sweep(now);
        }

        let mut bucket = self
            .buckets
            .entry(key.to_string())
            .or_insert_with(|| Bucket {
                count: 0,
                reset_at: now,
            });

        if now >= bucket.reset_at {
            *bucket = Bucket {
                count: 1,
                reset_at: now + limit.window,
            };
            return RateLimitDecision {
                allowed: true,
                remaining: limit.max.saturating_sub(1),
                retry_after_secs: 0,
            };
        }

        if bucket.count < limit.max {
            bucket.count += 1;
            return RateLimitDecision {
                allowed: true,
                remaining: limit.max - bucket.count,
                retry_after_secs: 0,
            };
        }

        let wait = bucket.reset_at - now;
        RateLimitDecision {
            allowed: false,
            remaining: 0,
            retry_after_secs: ceil_secs(wait).max(1),
        }
    }

    /// Number of live buckets.
    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    fn sweep(&self, now: Instant) {
        let before = self.buckets.len();
        self.buckets.retain(|_, bucket| bucket.reset_at > now);
        let swept = before.saturating_sub(self.buckets.len());
        debug!(swept, "rate_limit.sweep");
    }
}

/// Per-source scope key.
pub fn source_scope(source_key: impl std::fmt::Display) -> String {
    format!("proxy:source:{source_key}")
}

/// Per-caller feed creation scope key.
pub fn create_scope(caller: impl std::fmt::Display) -> String {
    format!("create:{caller}")
}

fn ceil_secs(duration: Duration) -> u64 {
    let secs = duration.as_secs();
    if duration.subsec_nanos() > 0 {
        secs + 1
    } else {
        secs
    }
}
