// ABOUTME: Fixed-window per-key rate limiter for API key authorization
// ABOUTME: Sharded concurrent counters with per-key exclusive updates and a once-per-window sweep
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Pierre Fitness Intelligence

//! # Rate Limiting
//!
//! Each key gets a counter for the current fixed window. Windows are aligned
//! to multiples of the window length since the Unix epoch, so every process
//! agrees on where a window starts.
//!
//! The check is a single read-modify-write under the map entry's shard lock:
//! concurrent requests for the same key are serialized, requests for
//! different keys are not. Once a key is over its limit the counter stops
//! growing, so rejected requests never count twice.
//!
//! ## Known limitations
//!
//! - Counters live in process memory. Running N worker processes gives each
//!   key an effective budget of `rate_limit * N` per window, and counters
//!   reset on restart. Share the counter through an external store if a
//!   deployment needs a global limit.
//! - Fixed windows admit up to twice the limit across a window boundary
//!   (a burst at the end of one window followed by one at the start of the
//!   next).

use crate::config::SecurityConfig;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use uuid::Uuid;

/// Counter for one key's current window
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateWindow {
    /// Window start, epoch milliseconds
    pub window_start_ms: i64,
    /// Requests admitted in this window, plus at most one marking exhaustion
    pub count: u32,
}

/// Result of a rate limit check
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RateLimitStatus {
    /// Whether this request is admitted
    pub allowed: bool,
    /// Configured limit for the key
    pub limit: u32,
    /// Requests still available in the current window
    pub remaining: u32,
    /// When the current window ends
    pub reset_at: DateTime<Utc>,
}

impl RateLimitStatus {
    /// Seconds until the window resets, rounded up, for `Retry-After`
    #[must_use]
    pub fn retry_after_secs(&self, now: DateTime<Utc>) -> i64 {
        let millis = (self.reset_at - now).num_milliseconds().max(0);
        (millis + 999) / 1000
    }
}

/// Fixed-window rate limiter keyed by API key id
#[derive(Clone, Debug)]
pub struct RateLimiter {
    state: Arc<DashMap<Uuid, RateWindow>>,
    window_ms: i64,
    cleanup_threshold: usize,
    /// Start of the window in which stale counters were last swept
    last_sweep_ms: Arc<AtomicI64>,
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(&SecurityConfig::default())
    }
}

impl RateLimiter {
    /// Create a limiter from security settings
    #[must_use]
    pub fn new(config: &SecurityConfig) -> Self {
        let window = i64::try_from(config.rate_limit_window_secs)
            .ok()
            .and_then(Duration::try_seconds)
            .unwrap_or_else(|| Duration::seconds(60));
        Self::with_window(window, config.rate_limit_cleanup_threshold)
    }

    /// Create a limiter with an explicit window length
    #[must_use]
    pub fn with_window(window: Duration, cleanup_threshold: usize) -> Self {
        Self {
            state: Arc::new(DashMap::new()),
            window_ms: window.num_milliseconds().max(1),
            cleanup_threshold,
            last_sweep_ms: Arc::new(AtomicI64::new(i64::MIN)),
        }
    }

    /// Window length
    #[must_use]
    pub fn window(&self) -> Duration {
        Duration::milliseconds(self.window_ms)
    }

    /// Count a request for `key_id` at the current time
    #[must_use]
    pub fn check(&self, key_id: Uuid, limit: u32) -> RateLimitStatus {
        self.check_at(key_id, limit, Utc::now())
    }

    /// Count a request for `key_id` at `now`
    ///
    /// Uses the `DashMap` entry API so the read-modify-write is atomic per key.
    #[must_use]
    pub fn check_at(&self, key_id: Uuid, limit: u32, now: DateTime<Utc>) -> RateLimitStatus {
        let window_start_ms = self.window_start(now);

        let mut entry = self.state.entry(key_id).or_insert(RateWindow {
            window_start_ms,
            count: 0,
        });
        let window = entry.value_mut();

        if window.window_start_ms != window_start_ms {
            window.window_start_ms = window_start_ms;
            window.count = 0;
        }

        let allowed = window.count < limit;
        if window.count <= limit {
            window.count = window.count.saturating_add(1);
        }
        let remaining = limit.saturating_sub(window.count);
        drop(entry);

        if self.state.len() > self.cleanup_threshold {
            self.sweep_once_per_window(window_start_ms);
        }

        RateLimitStatus {
            allowed,
            limit,
            remaining,
            reset_at: DateTime::from_timestamp_millis(window_start_ms + self.window_ms)
                .unwrap_or(now),
        }
    }

    /// Current window for a key without counting a request
    #[must_use]
    pub fn peek_at(&self, key_id: Uuid, limit: u32, now: DateTime<Utc>) -> RateLimitStatus {
        let window_start_ms = self.window_start(now);
        let count = self
            .state
            .get(&key_id)
            .filter(|w| w.window_start_ms == window_start_ms)
            .map_or(0, |w| w.count);
        RateLimitStatus {
            allowed: count < limit,
            limit,
            remaining: limit.saturating_sub(count),
            reset_at: DateTime::from_timestamp_millis(window_start_ms + self.window_ms)
                .unwrap_or(now),
        }
    }

    /// Drop a key's counter (used when a key is deleted)
    pub fn forget(&self, key_id: Uuid) {
        self.state.remove(&key_id);
    }

    /// Number of keys currently tracked
    #[must_use]
    pub fn tracked_keys(&self) -> usize {
        self.state.len()
    }

    fn window_start(&self, now: DateTime<Utc>) -> i64 {
        now.timestamp_millis().div_euclid(self.window_ms) * self.window_ms
    }

    /// Remove counters whose window has closed, at most once per window
    fn sweep_once_per_window(&self, window_start_ms: i64) {
        let previous = self.last_sweep_ms.fetch_max(window_start_ms, Ordering::AcqRel);
        if previous >= window_start_ms {
            return;
        }
        self.state
            .retain(|_key_id, window| window.window_start_ms >= window_start_ms);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter() -> RateLimiter {
        RateLimiter::with_window(Duration::seconds(60), 10_000)
    }

    fn window_aligned() -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_040, 0).unwrap()
    }

    #[test]
    fn test_allows_up_to_limit_then_denies() {
        let limiter = limiter();
        let key = Uuid::new_v4();
        let now = window_aligned();

        for i in 0..5 {
            let status = limiter.check_at(key, 5, now);
            assert!(status.allowed, "request {i} should be allowed");
            assert_eq!(status.remaining, 4 - i);
        }
        let status = limiter.check_at(key, 5, now);
        assert!(!status.allowed);
        assert_eq!(status.remaining, 0);
    }

    #[test]
    fn test_rejections_do_not_grow_the_counter() {
        let limiter = limiter();
        let key = Uuid::new_v4();
        let now = window_aligned();
        for _ in 0..50 {
            let _ = limiter.check_at(key, 2, now);
        }
        assert_eq!(limiter.state.get(&key).unwrap().count, 3);
    }

    #[test]
    fn test_window_rollover_resets_counter() {
        let limiter = limiter();
        let key = Uuid::new_v4();
        let start = window_aligned();
        for _ in 0..6 {
            let _ = limiter.check_at(key, 5, start + Duration::seconds(10));
        }
        assert!(!limiter.check_at(key, 5, start + Duration::seconds(59)).allowed);

        let next = limiter.check_at(key, 5, start + Duration::seconds(60));
        assert!(next.allowed);
        assert_eq!(next.remaining, 4);
        assert_eq!(next.reset_at, start + Duration::seconds(120));
    }

    #[test]
    fn test_keys_are_independent() {
        let limiter = limiter();
        let now = window_aligned();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        assert!(limiter.check_at(a, 1, now).allowed);
        assert!(!limiter.check_at(a, 1, now).allowed);
        assert!(limiter.check_at(b, 1, now).allowed);
    }

    #[test]
    fn test_retry_after_rounds_up() {
        let limiter = limiter();
        let now = window_aligned() + Duration::milliseconds(59_500);
        let status = limiter.check_at(Uuid::new_v4(), 1, now);
        assert_eq!(status.retry_after_secs(now), 1);
    }

    #[test]
    fn test_cleanup_drops_closed_windows() {
        let limiter = RateLimiter::with_window(Duration::seconds(60), 1);
        let start = window_aligned();
        let _ = limiter.check_at(Uuid::new_v4(), 5, start);
        let _ = limiter.check_at(Uuid::new_v4(), 5, start);
        let later = start + Duration::seconds(120);
        let _ = limiter.check_at(Uuid::new_v4(), 5, later);
        assert_eq!(limiter.tracked_keys(), 1);
    }

    #[test]
    fn test_sweep_runs_at_most_once_per_window() {
        let limiter = RateLimiter::with_window(Duration::seconds(60), 1);
        let start = window_aligned();
        let _ = limiter.check_at(Uuid::new_v4(), 5, start);
        // Over the threshold: this window's sweep runs and removes nothing
        let _ = limiter.check_at(Uuid::new_v4(), 5, start);

        // A counter from an earlier window is left for the next window's sweep
        let _ = limiter.check_at(Uuid::new_v4(), 5, start - Duration::seconds(120));
        let _ = limiter.check_at(Uuid::new_v4(), 5, start + Duration::seconds(30));
        assert_eq!(limiter.tracked_keys(), 4);

        let _ = limiter.check_at(Uuid::new_v4(), 5, start + Duration::seconds(60));
        assert_eq!(limiter.tracked_keys(), 1);
    }

    #[test]
    fn test_forget_and_peek() {
        let limiter = limiter();
        let key = Uuid::new_v4();
        let now = window_aligned();
        let _ = limiter.check_at(key, 3, now);
        assert_eq!(limiter.peek_at(key, 3, now).remaining, 2);
        limiter.forget(key);
        assert_eq!(limiter.peek_at(key, 3, now).remaining, 3);
    }

    #[test]
    fn test_concurrent_checks_admit_exactly_limit() {
        let limiter = limiter();
        let key = Uuid::new_v4();
        let now = window_aligned();
        let admitted = std::sync::atomic::AtomicU32::new(0);

        std::thread::scope(|scope| {
            for _ in 0..8 {
                scope.spawn(|| {
                    for _ in 0..50 {
                        if limiter.check_at(key, 100, now).allowed {
                            admitted.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                        }
                    }
                });
            }
        });

        assert_eq!(admitted.into_inner(), 100);
    }
}
