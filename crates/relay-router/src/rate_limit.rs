//! Keyed rate limiting
//!
//! Token buckets with a per-minute quota, one per key, created lazily and
//! cached. Acquisition is non-blocking; a refused permit is reported back to
//! the caller, which nacks with fast-fail visibility instead of waiting.

use dashmap::DashMap;
use governor::{
    clock::DefaultClock,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter,
};
use std::num::NonZeroU32;
use std::sync::Arc;
use tracing::debug;

type DirectLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

struct CachedLimiter {
    per_minute: u32,
    limiter: Arc<DirectLimiter>,
}

/// Registry of independent per-key token buckets.
#[derive(Default)]
pub struct RateLimiterRegistry {
    limiters: DashMap<String, CachedLimiter>,
}

impl RateLimiterRegistry {
    pub fn new() -> Self {
        Self {
            limiters: DashMap::new(),
        }
    }

    /// Try to take one permit for `key` at `per_minute`. Returns immediately.
    ///
    /// A zero rate disables limiting for the key. When the configured rate
    /// for an existing key changes, its bucket is replaced in place.
    pub fn try_acquire(&self, key: &str, per_minute: u32) -> bool {
        let Some(quota) = NonZeroU32::new(per_minute) else {
            return true;
        };

        let mut entry = self
            .limiters
            .entry(key.to_string())
            .or_insert_with(|| CachedLimiter {
                per_minute,
                limiter: Arc::new(RateLimiter::direct(Quota::per_minute(quota))),
            });

        if entry.per_minute != per_minute {
            debug!(
                key = %key,
                old = entry.per_minute,
                new = per_minute,
                "Rate limit changed, replacing bucket"
            );
            entry.per_minute = per_minute;
            entry.limiter = Arc::new(RateLimiter::direct(Quota::per_minute(quota)));
        }

        entry.limiter.check().is_ok()
    }

    /// Whether the key's bucket currently has no permit available.
    pub fn is_exhausted(&self, key: &str) -> bool {
        self.limiters
            .get(key)
            .map(|entry| entry.limiter.check().is_err())
            .unwrap_or(false)
    }

    /// Drop the cached bucket for a key (e.g. when its pool is removed).
    pub fn remove(&self, key: &str) {
        self.limiters.remove(key);
    }

    pub fn len(&self) -> usize {
        self.limiters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.limiters.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_rate_bypasses_limiting() {
        let registry = RateLimiterRegistry::new();
        for _ in 0..1000 {
            assert!(registry.try_acquire("K", 0));
        }
        assert!(registry.is_empty());
    }

    #[test]
    fn permits_exhaust_at_configured_rate() {
        let registry = RateLimiterRegistry::new();

        for _ in 0..5 {
            assert!(registry.try_acquire("K", 5));
        }
        assert!(!registry.try_acquire("K", 5));
        assert!(registry.is_exhausted("K"));
    }

    #[test]
    fn keys_are_independent() {
        let registry = RateLimiterRegistry::new();

        for _ in 0..3 {
            assert!(registry.try_acquire("A", 3));
        }
        assert!(!registry.try_acquire("A", 3));

        // Key B has its own bucket
        assert!(registry.try_acquire("B", 3));
    }

    #[test]
    fn rate_change_replaces_bucket() {
        let registry = RateLimiterRegistry::new();

        for _ in 0..2 {
            assert!(registry.try_acquire("K", 2));
        }
        assert!(!registry.try_acquire("K", 2));

        // Raising the rate starts a fresh bucket with the new quota
        assert!(registry.try_acquire("K", 10));
    }
}
