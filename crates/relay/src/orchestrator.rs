// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Orchestrator: binds the relay components, runs the lifecycle state
//! machine, and schedules the periodic sweeps.
//!
//! `stopped → starting → running → draining → stopped`, with `destroy`
//! reachable from anywhere. Every timer is a spawned loop that exits when
//! the current run's cancellation token fires.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::bus::dlq::DeadLetterQueue;
use crate::bus::{EventBus, PublishOptions, SubscribeOptions};
use crate::config::RelayConfig;
use crate::connection::ConnectionManager;
use crate::error::{FatalError, LifecycleError};
use crate::events::{epoch_ms, DisconnectReason, EventHub, RelayEvent};
use crate::limiter::RateLimiter;
use crate::metrics::{self, MetricsSnapshot, RelayMetrics};
use crate::registry::TenantRegistry;
use crate::router::RelayRouter;
use crate::transport::auth::RelayAuth;
use crate::trigger::TriggerEngine;
use crate::webhook::WebhookDispatcher;

// -- Phase --------------------------------------------------------------------

/// Relay lifecycle phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Phase {
    Stopped = 0,
    Starting = 1,
    Running = 2,
    Draining = 3,
    Destroyed = 4,
}

impl Phase {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Starting,
            2 => Self::Running,
            3 => Self::Draining,
            4 => Self::Destroyed,
            _ => Self::Stopped,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stopped => "stopped",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Draining => "draining",
            Self::Destroyed => "destroyed",
        }
    }
}

/// Shared, lock-free view of the current phase. Admission paths read this on
/// every connect.
#[derive(Clone)]
pub struct PhaseCell(Arc<AtomicU8>);

impl PhaseCell {
    pub fn new(phase: Phase) -> Self {
        Self(Arc::new(AtomicU8::new(phase as u8)))
    }

    pub fn get(&self) -> Phase {
        Phase::from_u8(self.0.load(Ordering::Acquire))
    }

    pub fn set(&self, phase: Phase) {
        self.0.store(phase as u8, Ordering::Release);
    }
}

// -- Relay --------------------------------------------------------------------

/// The assembled relay core. Wrap in an `Arc` and share with transports.
pub struct Relay {
    pub config: RelayConfig,
    pub auth: RelayAuth,
    pub events: EventHub,
    pub registry: Arc<TenantRegistry>,
    pub limiter: Arc<RateLimiter>,
    pub metrics: Arc<RelayMetrics>,
    pub connections: ConnectionManager,
    pub router: RelayRouter,
    pub bus: Arc<EventBus>,
    pub dlq: Arc<DeadLetterQueue>,
    pub webhooks: WebhookDispatcher,
    pub triggers: Arc<TriggerEngine>,
    phase: PhaseCell,
    /// Cancelled when the whole process should come down (stop/destroy).
    pub shutdown: CancellationToken,
    /// Token for the current run's timers; refreshed on each start.
    timer_token: Mutex<CancellationToken>,
}

impl Relay {
    /// Validate the configuration and assemble the core. Nothing is spawned
    /// until [`start`](Self::start).
    pub fn new(config: RelayConfig) -> Result<Self, FatalError> {
        config.validate()?;

        let auth = RelayAuth::from_config(&config);
        let events = EventHub::new(1024);
        let registry = Arc::new(TenantRegistry::new(
            config.tier_limits(),
            config.message_buffer_bytes,
            events.clone(),
        ));
        let limiter = Arc::new(RateLimiter::new(config.limiter_config()));
        let metrics = Arc::new(RelayMetrics::new());
        let dlq = Arc::new(DeadLetterQueue::new(config.dlq_capacity));
        let bus = Arc::new(EventBus::new(
            config.replay_ring_size,
            config.subscription_queue_depth,
            Arc::clone(&dlq),
            events.clone(),
        ));
        let webhooks = WebhookDispatcher::new(
            config.webhook_config(),
            Arc::clone(&dlq),
            events.clone(),
            Arc::clone(&limiter),
        );
        let triggers = Arc::new(TriggerEngine::new(
            Arc::clone(&bus),
            webhooks.clone(),
            events.clone(),
            config.max_fanout_depth,
        ));
        let phase = PhaseCell::new(Phase::Stopped);
        let connections = ConnectionManager::new(
            Arc::clone(&registry),
            Arc::clone(&limiter),
            events.clone(),
            phase.clone(),
            config.idle_timeout_ms,
        );
        let router = RelayRouter::new(
            Arc::clone(&registry),
            Arc::clone(&limiter),
            events.clone(),
            Arc::clone(&metrics),
            config.buffer_ttl_ms,
        );

        Ok(Self {
            config,
            auth,
            events,
            registry,
            limiter,
            metrics,
            connections,
            router,
            bus,
            dlq,
            webhooks,
            triggers,
            phase,
            shutdown: CancellationToken::new(),
            timer_token: Mutex::new(CancellationToken::new()),
        })
    }

    pub fn phase(&self) -> Phase {
        self.phase.get()
    }

    /// Start timers and delivery wiring. Idempotent on a running relay.
    pub fn start(relay: &Arc<Relay>) -> Result<(), LifecycleError> {
        match relay.phase.get() {
            Phase::Running => return Ok(()),
            Phase::Destroyed => return Err(LifecycleError::Destroyed),
            Phase::Stopped | Phase::Starting | Phase::Draining => {}
        }
        relay.phase.set(Phase::Starting);

        let token = relay.shutdown.child_token();
        *relay.timer_token.lock() = token.clone();

        // Webhook dispatch rides the bus: every published event fans out to
        // matching registrations.
        let webhooks = relay.webhooks.clone();
        let dispatch: crate::bus::Handler = Arc::new(move |event: &crate::bus::Event| {
            webhooks.dispatch(event);
            Ok(())
        });
        if let Err(e) = relay.bus.subscribe("*", dispatch, SubscribeOptions::default()) {
            tracing::warn!(err = %e, "webhook bus subscription failed");
        }

        spawn_event_pump(Arc::clone(relay), token.clone());
        spawn_timers(relay, token);

        relay.phase.set(Phase::Running);
        tracing::info!("relay running");
        Ok(())
    }

    /// Drain and stop: refuse new admissions, flush in-flight webhook
    /// deliveries up to the drain deadline, close all connections, stop
    /// timers.
    pub async fn stop(&self) -> Result<(), LifecycleError> {
        match self.phase.get() {
            Phase::Stopped => return Err(LifecycleError::AlreadyStopped),
            Phase::Destroyed => return Err(LifecycleError::Destroyed),
            Phase::Draining => return Err(LifecycleError::AlreadyStopped),
            Phase::Starting | Phase::Running => {}
        }
        self.phase.set(Phase::Draining);
        tracing::info!("relay draining");

        let flushed = self.webhooks.drain(self.config.drain_deadline()).await;
        if !flushed {
            tracing::warn!("drain deadline expired with webhook deliveries outstanding");
        }

        let closed = self.connections.close_all(DisconnectReason::Shutdown);
        self.timer_token.lock().cancel();
        self.shutdown.cancel();
        self.phase.set(Phase::Stopped);
        tracing::info!(connections_closed = closed, "relay stopped");
        Ok(())
    }

    /// Tear everything down. Valid from any state; all further operations
    /// are refused.
    pub fn destroy(&self) {
        self.timer_token.lock().cancel();
        self.shutdown.cancel();
        self.bus.shutdown();
        self.connections.close_all(DisconnectReason::Shutdown);
        for handle in self.registry.list() {
            self.registry.remove(&handle.id);
        }
        self.phase.set(Phase::Destroyed);
        tracing::info!("relay destroyed");
    }

    /// Point-in-time metrics snapshot.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let now = epoch_ms();
        let totals = self.registry.totals();
        let webhooks = self
            .webhooks
            .stats(None)
            .into_iter()
            .map(|view| {
                (
                    view.id.clone(),
                    metrics::WebhookStats {
                        sent: view.sent,
                        failed: view.failed,
                        dead_lettered: view.dead_lettered,
                    },
                )
            })
            .collect();
        MetricsSnapshot {
            status: self.phase.get().as_str().to_owned(),
            uptime_ms: self.metrics.uptime_ms(now),
            tenants: totals.tenants,
            connections: totals.connections,
            messages_per_sec: self.metrics.messages_per_sec(now),
            bytes_per_sec: self.metrics.bytes_per_sec(now),
            buffered_messages: totals.buffered_messages,
            buffered_bytes: totals.buffered_bytes,
            buffer_utilization: metrics::buffer_utilization(
                totals.buffered_bytes,
                totals.tenants,
                self.config.message_buffer_bytes,
            ),
            delivery_deferred: metrics::load_counter(&self.metrics.delivery_deferred),
            buffer_expired: metrics::load_counter(&self.metrics.buffer_expired),
            buffer_overflows: metrics::load_counter(&self.metrics.buffer_overflows),
            bus_dropped_by_queue_pressure: metrics::load_counter(
                &self.bus.dropped_by_queue_pressure,
            ),
            bus_filter_errors: metrics::load_counter(&self.bus.filter_errors),
            trigger_fanout_depth_exceeded: metrics::load_counter(
                &self.triggers.fanout_depth_exceeded,
            ),
            dlq_size: self.dlq.len(),
            dlq_by_kind: self.dlq.counts_by_kind(),
            webhooks,
        }
    }
}

// -- Background tasks ---------------------------------------------------------

/// Forward hub events onto the bus under `relay.<category>` topics so
/// subscribers, webhooks, and trigger rules can consume lifecycle changes.
/// Delivery-plumbing categories stay off the bus.
fn spawn_event_pump(relay: Arc<Relay>, token: CancellationToken) {
    let mut rx = relay.events.subscribe();
    tokio::spawn(async move {
        loop {
            let event = tokio::select! {
                _ = token.cancelled() => break,
                event = rx.recv() => event,
            };
            let event = match event {
                Ok(event) => event,
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!(skipped = n, "event pump lagged");
                    continue;
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            };
            if !event.forwards_to_bus() {
                continue;
            }
            let topic = format!("relay.{}", event.category());
            let payload = match serde_json::to_vec(&event) {
                Ok(bytes) => Bytes::from(bytes),
                Err(_) => continue,
            };
            let options = PublishOptions {
                content_type: Some("application/json".to_owned()),
                ..PublishOptions::default()
            };
            match relay.bus.publish(&topic, payload.clone(), options) {
                Ok(sequence) => {
                    let chained = Arc::new(crate::bus::Event {
                        meta: crate::bus::EventMeta {
                            topic,
                            sequence,
                            timestamp_ms: epoch_ms(),
                            content_type: "application/json".to_owned(),
                            correlation_id: None,
                            hops: 0,
                        },
                        payload,
                    });
                    relay.triggers.ingest(&chained);
                }
                Err(_) => break,
            }
        }
    });
}

/// Spawn the periodic sweeps: health beat, idle sweep, buffer TTL, DLQ age,
/// and the metrics report.
fn spawn_timers(relay: &Arc<Relay>, token: CancellationToken) {
    spawn_periodic(relay, token.clone(), relay.config.health_check_interval(), |relay| {
        let totals = relay.registry.totals();
        relay.events.emit(RelayEvent::HealthCheck {
            status: relay.phase.get().as_str().to_owned(),
            connections: totals.connections,
            tenants: totals.tenants,
        });
    });
    spawn_periodic(relay, token.clone(), relay.config.idle_sweep_interval(), |relay| {
        relay.connections.sweep_idle();
    });
    spawn_periodic(relay, token.clone(), relay.config.buffer_sweep_interval(), |relay| {
        relay.router.sweep_buffers();
    });
    let dlq_max_age_ms = relay.config.dlq_max_age_ms;
    spawn_periodic(relay, token.clone(), relay.config.dlq_sweep_interval(), move |relay| {
        let cutoff = epoch_ms().saturating_sub(dlq_max_age_ms);
        relay.dlq.sweep_older_than(cutoff);
    });
    spawn_periodic(relay, token, relay.config.metrics_interval(), |relay| {
        let snapshot = relay.snapshot();
        tracing::info!(
            tenants = snapshot.tenants,
            connections = snapshot.connections,
            msgs_per_sec = %format!("{:.1}", snapshot.messages_per_sec),
            bytes_per_sec = %format!("{:.0}", snapshot.bytes_per_sec),
            buffered_bytes = snapshot.buffered_bytes,
            dlq = snapshot.dlq_size,
            "metrics report"
        );
    });
}

fn spawn_periodic(
    relay: &Arc<Relay>,
    token: CancellationToken,
    period: std::time::Duration,
    tick: impl Fn(&Relay) + Send + 'static,
) {
    let relay = Arc::clone(relay);
    tokio::spawn(async move {
        let mut timer = tokio::time::interval(period);
        timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // The first tick fires immediately; skip it so sweeps start one
        // period after start.
        timer.tick().await;
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = timer.tick() => {}
            }
            tick(&relay);
        }
    });
}

#[cfg(test)]
#[path = "orchestrator_tests.rs"]
mod tests;
