// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Shared test infrastructure: sink doubles and a wired-up relay harness.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;

use crate::connection::ConnectionManager;
use crate::events::EventHub;
use crate::limiter::{LimiterConfig, RateLimiter};
use crate::metrics::RelayMetrics;
use crate::orchestrator::{Phase, PhaseCell};
use crate::registry::{ConnectionSink, SinkStatus, TenantRegistry, TierLimits};
use crate::router::RelayRouter;

/// Sink that records delivered payloads and can simulate saturation.
pub struct CollectSink {
    pub delivered: Mutex<Vec<(Option<String>, Bytes)>>,
    pub saturated: AtomicBool,
    pub closed: AtomicBool,
}

impl CollectSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            delivered: Mutex::new(Vec::new()),
            saturated: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        })
    }

    /// Delivered payloads, in arrival order.
    pub fn payloads(&self) -> Vec<Bytes> {
        self.delivered.lock().iter().map(|(_, p)| p.clone()).collect()
    }
}

impl ConnectionSink for CollectSink {
    fn try_deliver(&self, from: Option<&str>, payload: &Bytes) -> SinkStatus {
        if self.saturated.load(Ordering::SeqCst) {
            return SinkStatus::Saturated;
        }
        self.delivered.lock().push((from.map(String::from), payload.clone()));
        SinkStatus::Accepted
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Fully wired relay core (no transports) for unit tests.
pub struct Harness {
    pub registry: Arc<TenantRegistry>,
    pub limiter: Arc<RateLimiter>,
    pub manager: ConnectionManager,
    pub router: RelayRouter,
    pub metrics: Arc<RelayMetrics>,
    pub hub: EventHub,
    pub phase: PhaseCell,
}

/// Builder with sensible defaults; override what the test cares about.
pub struct HarnessBuilder {
    limits: TierLimits,
    buffer_bytes: usize,
    buffer_ttl_ms: u64,
    idle_timeout_ms: u64,
    limiter: LimiterConfig,
}

impl HarnessBuilder {
    pub fn new() -> Self {
        Self {
            limits: TierLimits::default(),
            buffer_bytes: 10 * 1024 * 1024,
            buffer_ttl_ms: 300_000,
            idle_timeout_ms: 300_000,
            limiter: LimiterConfig::default(),
        }
    }

    pub fn tier_limits(mut self, limits: TierLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn buffer_bytes(mut self, bytes: usize) -> Self {
        self.buffer_bytes = bytes;
        self
    }

    pub fn buffer_ttl_ms(mut self, ttl: u64) -> Self {
        self.buffer_ttl_ms = ttl;
        self
    }

    pub fn idle_timeout_ms(mut self, timeout: u64) -> Self {
        self.idle_timeout_ms = timeout;
        self
    }

    pub fn limiter(mut self, config: LimiterConfig) -> Self {
        self.limiter = config;
        self
    }

    pub fn build(self) -> Harness {
        let hub = EventHub::new(256);
        let registry =
            Arc::new(TenantRegistry::new(self.limits, self.buffer_bytes, hub.clone()));
        let limiter = Arc::new(RateLimiter::new(self.limiter));
        let metrics = Arc::new(RelayMetrics::new());
        let phase = PhaseCell::new(Phase::Running);
        let manager = ConnectionManager::new(
            Arc::clone(&registry),
            Arc::clone(&limiter),
            hub.clone(),
            phase.clone(),
            self.idle_timeout_ms,
        );
        let router = RelayRouter::new(
            Arc::clone(&registry),
            Arc::clone(&limiter),
            hub.clone(),
            Arc::clone(&metrics),
            self.buffer_ttl_ms,
        );
        Harness { registry, limiter, manager, router, metrics, hub, phase }
    }
}

impl Default for HarnessBuilder {
    fn default() -> Self {
        Self::new()
    }
}

pub fn harness() -> Harness {
    HarnessBuilder::new().build()
}
