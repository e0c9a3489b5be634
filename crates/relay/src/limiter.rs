// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Token-bucket admission control.
//!
//! One bucket set per key (tenant id for connect/publish, webhook id for
//! outbound fan-out). Buckets refill continuously and are created lazily on
//! first use; [`RateLimiter::forget`] drops a key's buckets when its owner is
//! removed.

use std::collections::HashMap;
use std::time::Instant;

use parking_lot::Mutex;

/// Which admission gate a caller is asking about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Gate {
    Connect,
    Publish,
    Fanout,
}

/// Refill rates and burst capacities for each gate.
#[derive(Debug, Clone, Copy)]
pub struct LimiterConfig {
    pub connect_burst: f64,
    pub connect_per_sec: f64,
    pub publish_burst: f64,
    pub publish_per_sec: f64,
    pub fanout_burst: f64,
    pub fanout_per_sec: f64,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            connect_burst: 10.0,
            connect_per_sec: 10.0,
            publish_burst: 500.0,
            publish_per_sec: 500.0,
            fanout_burst: 100.0,
            fanout_per_sec: 100.0,
        }
    }
}

/// Continuous-refill token bucket.
#[derive(Debug)]
pub struct TokenBucket {
    capacity: f64,
    tokens: f64,
    refill_per_sec: f64,
    last_refill: Instant,
}

impl TokenBucket {
    pub fn new(capacity: f64, refill_per_sec: f64, now: Instant) -> Self {
        Self { capacity, tokens: capacity, refill_per_sec, last_refill: now }
    }

    /// Take one token if available. Refills based on elapsed time first.
    pub fn try_acquire(&mut self, now: Instant) -> bool {
        self.refill(now);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        if elapsed > 0.0 {
            self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
            self.last_refill = now;
        }
    }

    /// Tokens currently available (after refill).
    pub fn available(&mut self, now: Instant) -> f64 {
        self.refill(now);
        self.tokens
    }
}

struct KeyBuckets {
    connect: TokenBucket,
    publish: TokenBucket,
    fanout: TokenBucket,
}

/// Per-key token buckets behind a single short-lived lock.
pub struct RateLimiter {
    config: LimiterConfig,
    buckets: Mutex<HashMap<String, KeyBuckets>>,
}

impl RateLimiter {
    pub fn new(config: LimiterConfig) -> Self {
        Self { config, buckets: Mutex::new(HashMap::new()) }
    }

    /// Take one token from the given gate's bucket for `key`.
    pub fn allow(&self, key: &str, gate: Gate) -> bool {
        self.allow_at(key, gate, Instant::now())
    }

    /// Like [`allow`](Self::allow) with an explicit clock, for tests.
    pub fn allow_at(&self, key: &str, gate: Gate, now: Instant) -> bool {
        let mut buckets = self.buckets.lock();
        let entry = buckets.entry(key.to_owned()).or_insert_with(|| KeyBuckets {
            connect: TokenBucket::new(self.config.connect_burst, self.config.connect_per_sec, now),
            publish: TokenBucket::new(self.config.publish_burst, self.config.publish_per_sec, now),
            fanout: TokenBucket::new(self.config.fanout_burst, self.config.fanout_per_sec, now),
        });
        let bucket = match gate {
            Gate::Connect => &mut entry.connect,
            Gate::Publish => &mut entry.publish,
            Gate::Fanout => &mut entry.fanout,
        };
        bucket.try_acquire(now)
    }

    /// Drop all buckets for a removed key.
    pub fn forget(&self, key: &str) {
        self.buckets.lock().remove(key);
    }
}

#[cfg(test)]
#[path = "limiter_tests.rs"]
mod tests;
