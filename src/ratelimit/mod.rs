//! RateLimiter (component A) — sliding window with sub-bucket decay.
//!
//! Grounded on the teacher's `proxy/filter/rate_limit.rs`: a `DashMap` of
//! per-identity state, a fast-path read before the allocating
//! `entry().or_insert_with()`, and an LRU-by-last-access GC sweep. The
//! algorithm itself follows spec.md §4.A exactly — a ring of `subWindows`
//! discrete counters, not the teacher's continuous blended estimate,
//! since the spec calls for an exact count rather than an approximation.

use crate::clock::Clock;
use crate::config::RateLimitConfig;
use dashmap::DashMap;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Result of a `check`/`peek` call (spec.md §4.A contract).
#[derive(Debug, Clone, PartialEq)]
pub struct RateDecision {
    pub allowed: bool,
    pub remaining: u32,
    pub limit: u32,
    pub current_count: u32,
    pub retry_after_ms: i64,
    pub reset_at_ms: i64,
}

struct Ring {
    counts: Mutex<RingState>,
    last_touched_ms: AtomicI64,
}

struct RingState {
    /// Count per sub-window bucket.
    buckets: Vec<u32>,
    /// Absolute bucket index the buckets[0] slot currently represents is
    /// tracked implicitly via `base_bucket` — the bucket index of
    /// `buckets[i]` is `base_bucket + i`.
    base_bucket: i64,
}

/// Entries untouched for this long are eligible for GC (independent of
/// the configured window — bounds memory for identities that stop
/// calling entirely).
const GC_EXPIRE_MS: i64 = 10 * 60 * 1000;

pub struct RateLimiter {
    rings: DashMap<String, Arc<Ring>>,
    clock: Arc<dyn Clock>,
    touch_order: AtomicUsize,
}

impl RateLimiter {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            rings: DashMap::new(),
            clock,
            touch_order: AtomicUsize::new(0),
        }
    }

    fn sub_width_ms(config: &RateLimitConfig) -> i64 {
        (config.window_ms / config.sub_windows.max(1) as u64).max(1) as i64
    }

    fn get_or_create(&self, identity: &str, config: &RateLimitConfig) -> Arc<Ring> {
        if let Some(entry) = self.rings.get(identity) {
            return entry.value().clone();
        }
        if self.rings.len() >= config.max_keys {
            self.evict_lru();
        }
        self.rings
            .entry(identity.to_string())
            .or_insert_with(|| {
                Arc::new(Ring {
                    counts: Mutex::new(RingState {
                        buckets: vec![0; config.sub_windows.max(1) as usize],
                        base_bucket: 0,
                    }),
                    last_touched_ms: AtomicI64::new(self.clock.now_ms()),
                })
            })
            .clone()
    }

    fn evict_lru(&self) {
        if let Some(victim) = self
            .rings
            .iter()
            .min_by_key(|r| r.value().last_touched_ms.load(Ordering::Relaxed))
            .map(|r| r.key().clone())
        {
            self.rings.remove(&victim);
        }
    }

    /// Advance the ring so it covers the trailing `subWindows` buckets
    /// ending at `now`'s bucket, zeroing anything that fell out of range.
    fn advance(state: &mut RingState, now_bucket: i64, sub_windows: i64) {
        let newest = state.base_bucket + state.buckets.len() as i64 - 1;
        if now_bucket <= newest {
            return;
        }
        let advance_by = now_bucket - newest;
        if advance_by >= sub_windows {
            // Entirely stale: zero everything and restart the window.
            for b in state.buckets.iter_mut() {
                *b = 0;
            }
            state.base_bucket = now_bucket - sub_windows + 1;
            return;
        }
        // Rotate `advance_by` slots out, zeroing the vacated tail.
        state.buckets.rotate_left(advance_by as usize);
        let len = state.buckets.len();
        for b in state.buckets[len - advance_by as usize..].iter_mut() {
            *b = 0;
        }
        state.base_bucket += advance_by;
    }

    fn evaluate(&self, identity: &str, config: &RateLimitConfig, consume: bool) -> RateDecision {
        if config.max_requests == 0 {
            // Disabled: always allow (spec.md §4.A special case).
            return RateDecision {
                allowed: true,
                remaining: u32::MAX,
                limit: 0,
                current_count: 0,
                retry_after_ms: 0,
                reset_at_ms: self.clock.now_ms(),
            };
        }

        let sub_width = Self::sub_width_ms(config);
        let sub_windows = config.sub_windows.max(1) as i64;
        let now = self.clock.now_ms();
        let now_bucket = now.div_euclid(sub_width);

        let ring = self.get_or_create(identity, config);
        ring.last_touched_ms.store(now, Ordering::Relaxed);

        let mut state = ring.counts.lock().unwrap();
        Self::advance(&mut state, now_bucket, sub_windows);

        let current_count: u32 = state.buckets.iter().sum();
        let window_end = (state.base_bucket + sub_windows) * sub_width;

        if current_count + 1 > config.max_requests {
            // retryAfterMs: time until the oldest still-counted bucket
            // leaves the window, i.e. when base_bucket's slot expires.
            let oldest_bucket_end = (state.base_bucket + 1) * sub_width;
            let retry_after_ms = (oldest_bucket_end - now).max(1);
            return RateDecision {
                allowed: false,
                remaining: 0,
                limit: config.max_requests,
                current_count,
                retry_after_ms,
                reset_at_ms: window_end,
            };
        }

        if consume {
            let idx = (now_bucket - state.base_bucket) as usize;
            state.buckets[idx] += 1;
        }

        RateDecision {
            allowed: true,
            remaining: config.max_requests - (current_count + 1),
            limit: config.max_requests,
            current_count: current_count + if consume { 1 } else { 0 },
            retry_after_ms: 0,
            reset_at_ms: window_end,
        }
    }

    /// Consume one unit on allow.
    pub fn check(&self, identity: &str, config: &RateLimitConfig) -> RateDecision {
        let decision = self.evaluate(identity, config, true);
        if decision.allowed {
            metrics::counter!("creditgate_rate_limit_allowed_total").increment(1);
        } else {
            metrics::counter!("creditgate_rate_limit_denied_total").increment(1);
        }
        decision
    }

    /// Same shape as `check` without consuming a unit.
    pub fn peek(&self, identity: &str, config: &RateLimitConfig) -> RateDecision {
        self.evaluate(identity, config, false)
    }

    /// Wipe all state for one identity.
    pub fn reset_key(&self, identity: &str) {
        self.rings.remove(identity);
    }

    /// Periodic GC of identities untouched for `GC_EXPIRE_MS`, grounded on
    /// the teacher's `RateLimiter::evict_stale`.
    pub fn gc(&self) {
        let now = self.clock.now_ms();
        self.rings
            .retain(|_, v| now.saturating_sub(v.last_touched_ms.load(Ordering::Relaxed)) < GC_EXPIRE_MS);
    }

    pub fn destroy(&self) {
        self.rings.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::TestClock;

    fn config(max_requests: u32, window_ms: u64, sub_windows: u32) -> RateLimitConfig {
        RateLimitConfig {
            window_ms,
            max_requests,
            sub_windows,
            max_keys: 1000,
        }
    }

    #[test]
    fn sliding_window_scenario_from_spec() {
        // spec.md §8 scenario 1.
        let clock = Arc::new(TestClock::new(0));
        let limiter = RateLimiter::new(clock.clone());
        let cfg = config(5, 1000, 5);

        for expected_remaining in [4u32, 3, 2, 1, 0] {
            let d = limiter.check("k1", &cfg);
            assert!(d.allowed);
            assert_eq!(d.remaining, expected_remaining);
        }
        let denied = limiter.check("k1", &cfg);
        assert!(!denied.allowed);
        assert!(denied.retry_after_ms > 0);

        // A different identity at the same instant is independent.
        let other = limiter.check("k2", &cfg);
        assert!(other.allowed);
    }

    #[test]
    fn max_requests_zero_disables_limiting() {
        let clock = Arc::new(TestClock::new(0));
        let limiter = RateLimiter::new(clock);
        let cfg = config(0, 1000, 5);
        for _ in 0..1000 {
            assert!(limiter.check("k", &cfg).allowed);
        }
    }

    #[test]
    fn window_recovers_after_full_period() {
        let clock = Arc::new(TestClock::new(0));
        let limiter = RateLimiter::new(clock.clone());
        let cfg = config(2, 1000, 5);

        assert!(limiter.check("k", &cfg).allowed);
        assert!(limiter.check("k", &cfg).allowed);
        assert!(!limiter.check("k", &cfg).allowed);

        clock.advance_ms(1001);
        assert!(limiter.check("k", &cfg).allowed);
    }

    #[test]
    fn peek_does_not_consume() {
        let clock = Arc::new(TestClock::new(0));
        let limiter = RateLimiter::new(clock);
        let cfg = config(1, 1000, 2);

        let peeked = limiter.peek("k", &cfg);
        assert!(peeked.allowed);
        assert_eq!(peeked.current_count, 0);

        assert!(limiter.check("k", &cfg).allowed);
        assert!(!limiter.check("k", &cfg).allowed);
    }

    #[test]
    fn reset_key_wipes_state() {
        let clock = Arc::new(TestClock::new(0));
        let limiter = RateLimiter::new(clock);
        let cfg = config(1, 1000, 2);

        assert!(limiter.check("k", &cfg).allowed);
        assert!(!limiter.check("k", &cfg).allowed);
        limiter.reset_key("k");
        assert!(limiter.check("k", &cfg).allowed);
    }

    #[test]
    fn rate_monotonicity_property() {
        // Invariant 2: within one windowMs, allowed calls never exceed maxRequests.
        let clock = Arc::new(TestClock::new(0));
        let limiter = RateLimiter::new(clock.clone());
        let cfg = config(10, 1000, 10);

        let mut allowed = 0;
        for _ in 0..50 {
            clock.advance_ms(10);
            if limiter.check("k", &cfg).allowed {
                allowed += 1;
            }
        }
        assert!(allowed <= cfg.max_requests + 1); // window may slide once during the loop
    }

    #[test]
    fn gc_evicts_untouched_identity() {
        let clock = Arc::new(TestClock::new(0));
        let limiter = RateLimiter::new(clock.clone());
        let cfg = config(5, 1000, 5);
        limiter.check("stale", &cfg);
        assert_eq!(limiter.rings.len(), 1);
        clock.advance_ms(GC_EXPIRE_MS + 1);
        limiter.gc();
        assert_eq!(limiter.rings.len(), 0);
    }
}
