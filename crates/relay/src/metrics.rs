// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Relay-wide counters, sliding-window rates, and the queryable snapshot.
//!
//! Windows prune on read and on write; there is no background aggregation
//! task mutating them.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use serde::Serialize;

use crate::events::epoch_ms;
use crate::window::SlidingWindow;

/// Window length for msgs/s and bytes/s.
const RATE_WINDOW_MS: u64 = 60_000;

/// Shared relay-side counters and rate windows.
pub struct RelayMetrics {
    started_at_ms: u64,
    msgs: Mutex<SlidingWindow>,
    bytes: Mutex<SlidingWindow>,
    pub delivery_deferred: AtomicU64,
    pub buffer_expired: AtomicU64,
    pub buffer_overflows: AtomicU64,
}

impl RelayMetrics {
    pub fn new() -> Self {
        Self {
            started_at_ms: epoch_ms(),
            msgs: Mutex::new(SlidingWindow::new(RATE_WINDOW_MS)),
            bytes: Mutex::new(SlidingWindow::new(RATE_WINDOW_MS)),
            delivery_deferred: AtomicU64::new(0),
            buffer_expired: AtomicU64::new(0),
            buffer_overflows: AtomicU64::new(0),
        }
    }

    /// Record one relayed message of `byte_size` bytes.
    pub fn record_message(&self, now_ms: u64, byte_size: u64) {
        self.msgs.lock().record(now_ms, 1);
        self.bytes.lock().record(now_ms, byte_size);
    }

    pub fn messages_per_sec(&self, now_ms: u64) -> f64 {
        self.msgs.lock().rate_per_sec(now_ms)
    }

    pub fn bytes_per_sec(&self, now_ms: u64) -> f64 {
        self.bytes.lock().rate_per_sec(now_ms)
    }

    pub fn started_at_ms(&self) -> u64 {
        self.started_at_ms
    }

    pub fn uptime_ms(&self, now_ms: u64) -> u64 {
        now_ms.saturating_sub(self.started_at_ms)
    }
}

impl Default for RelayMetrics {
    fn default() -> Self {
        Self::new()
    }
}

// -- Snapshot -----------------------------------------------------------------

/// Per-webhook delivery stats, as reported in the snapshot.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct WebhookStats {
    pub sent: u64,
    pub failed: u64,
    pub dead_lettered: u64,
}

/// Point-in-time view of the whole relay, served by `GET /api/v1/metrics`.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub status: String,
    pub uptime_ms: u64,
    pub tenants: usize,
    pub connections: usize,
    pub messages_per_sec: f64,
    pub bytes_per_sec: f64,
    pub buffered_messages: usize,
    pub buffered_bytes: usize,
    /// `sum(buffered bytes) / (tenants × messageBufferBytes)`; zero when no
    /// tenants exist.
    pub buffer_utilization: f64,
    pub delivery_deferred: u64,
    pub buffer_expired: u64,
    pub buffer_overflows: u64,
    pub bus_dropped_by_queue_pressure: u64,
    pub bus_filter_errors: u64,
    pub trigger_fanout_depth_exceeded: u64,
    pub dlq_size: usize,
    pub dlq_by_kind: HashMap<String, usize>,
    pub webhooks: HashMap<String, WebhookStats>,
}

/// Compute buffer utilization from totals.
pub fn buffer_utilization(buffered_bytes: usize, tenants: usize, ceiling_bytes: usize) -> f64 {
    let denom = tenants.saturating_mul(ceiling_bytes);
    if denom == 0 {
        return 0.0;
    }
    buffered_bytes as f64 / denom as f64
}

/// Read the deferred/expired/overflow counters relaxed; exactness across
/// racing updates is not part of the contract.
pub fn load_counter(counter: &AtomicU64) -> u64 {
    counter.load(Ordering::Relaxed)
}

#[cfg(test)]
#[path = "metrics_tests.rs"]
mod tests;
