// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Relay router: direct delivery, tenant broadcast, and bounded buffering.
//!
//! The router never blocks on a slow recipient. Transports take messages
//! through the non-blocking sink handoff; a saturated sink re-routes the
//! message into the tenant buffer (subject to the byte ceiling) and the
//! delivery is counted as deferred.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use bytes::Bytes;

use crate::error::RelayError;
use crate::events::{epoch_ms, EventHub, RelayEvent, ThrottleReason};
use crate::limiter::{Gate, RateLimiter};
use crate::metrics::RelayMetrics;
use crate::registry::{BufferedMessage, SinkStatus, TenantRegistry};

/// Hard cap on a single relayed payload.
pub const MAX_PAYLOAD_BYTES: usize = 1024 * 1024;

/// What happened to a relayed message.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayOutcome {
    /// Recipients the payload was handed to.
    pub delivered: u32,
    /// Whether the payload (or part of a broadcast) was parked in the buffer.
    pub buffered: bool,
    /// Recipients whose transport was saturated and got re-routed to buffer.
    pub deferred: u32,
}

pub struct RelayRouter {
    registry: Arc<TenantRegistry>,
    limiter: Arc<RateLimiter>,
    events: EventHub,
    metrics: Arc<RelayMetrics>,
    buffer_ttl_ms: u64,
}

impl RelayRouter {
    pub fn new(
        registry: Arc<TenantRegistry>,
        limiter: Arc<RateLimiter>,
        events: EventHub,
        metrics: Arc<RelayMetrics>,
        buffer_ttl_ms: u64,
    ) -> Self {
        Self { registry, limiter, events, metrics, buffer_ttl_ms }
    }

    /// Relay a payload from `sender` to `target` (direct) or to every other
    /// connection in the tenant (broadcast).
    pub fn relay(
        &self,
        tenant_id: &str,
        sender: &str,
        payload: Bytes,
        target: Option<&str>,
    ) -> Result<RelayOutcome, RelayError> {
        if payload.len() > MAX_PAYLOAD_BYTES {
            return Err(RelayError::PayloadTooLarge);
        }

        let handle = self.registry.get(tenant_id).ok_or(RelayError::UnknownSender)?;

        if !self.limiter.allow(tenant_id, Gate::Publish) {
            self.events.emit(RelayEvent::TenantThrottled {
                tenant: tenant_id.to_owned(),
                reason: ThrottleReason::Rate,
                limit: None,
            });
            return Err(RelayError::RateLimited);
        }

        let now = epoch_ms();
        let byte_size = payload.len();
        let ceiling = self.registry.message_buffer_bytes();
        let mut pending_events: Vec<RelayEvent> = Vec::new();
        let mut outcome = RelayOutcome::default();

        {
            let mut state = handle.state.write();
            if !state.connections.contains_key(sender) {
                return Err(RelayError::UnknownSender);
            }

            match target {
                Some(target_id) => {
                    let status = match state.connections.get(target_id) {
                        Some(record) => record.sink.try_deliver(Some(sender), &payload),
                        // Absent target: park the message for a later join.
                        None => SinkStatus::Gone,
                    };
                    match status {
                        SinkStatus::Accepted => outcome.delivered = 1,
                        SinkStatus::Saturated | SinkStatus::Gone => {
                            let deferred = status == SinkStatus::Saturated;
                            let msg = BufferedMessage {
                                target: target_id.to_owned(),
                                payload: payload.clone(),
                                enqueued_at_ms: now,
                            };
                            if state.enqueue_buffered(msg, ceiling).is_err() {
                                drop(state);
                                self.events.emit(RelayEvent::BufferOverflow {
                                    tenant: tenant_id.to_owned(),
                                    target: target_id.to_owned(),
                                    dropped_bytes: byte_size as u64,
                                });
                                self.metrics.buffer_overflows.fetch_add(1, Ordering::Relaxed);
                                return Err(RelayError::BufferFull);
                            }
                            outcome.buffered = true;
                            if deferred {
                                outcome.deferred = 1;
                                self.metrics.delivery_deferred.fetch_add(1, Ordering::Relaxed);
                            }
                        }
                    }
                }
                None => {
                    // Broadcast to every peer except the sender. Saturated
                    // recipients are deferred into the buffer individually; a
                    // full buffer drops only that recipient's copy.
                    let recipients: Vec<String> = state
                        .connections
                        .keys()
                        .filter(|id| id.as_str() != sender)
                        .cloned()
                        .collect();
                    for recipient in recipients {
                        let status = match state.connections.get(&recipient) {
                            Some(record) => record.sink.try_deliver(Some(sender), &payload),
                            None => continue,
                        };
                        match status {
                            SinkStatus::Accepted => outcome.delivered += 1,
                            SinkStatus::Saturated | SinkStatus::Gone => {
                                let msg = BufferedMessage {
                                    target: recipient.clone(),
                                    payload: payload.clone(),
                                    enqueued_at_ms: now,
                                };
                                if state.enqueue_buffered(msg, ceiling).is_err() {
                                    pending_events.push(RelayEvent::BufferOverflow {
                                        tenant: tenant_id.to_owned(),
                                        target: recipient.clone(),
                                        dropped_bytes: byte_size as u64,
                                    });
                                    self.metrics.buffer_overflows.fetch_add(1, Ordering::Relaxed);
                                } else {
                                    outcome.buffered = true;
                                    outcome.deferred += 1;
                                    self.metrics
                                        .delivery_deferred
                                        .fetch_add(1, Ordering::Relaxed);
                                }
                            }
                        }
                    }
                }
            }

            // Credit sender and tenant counters.
            if let Some(record) = state.connections.get_mut(sender) {
                record.last_message_ms = Some(now);
                record.messages_relayed += 1;
                record.bytes_relayed += byte_size as u64;
            }
            state.counters.messages_relayed += 1;
            state.counters.bytes_relayed += byte_size as u64;
            state.counters.last_activity_ms = now;
        }

        self.metrics.record_message(now, byte_size as u64);
        for event in pending_events {
            self.events.emit(event);
        }
        self.events.emit(RelayEvent::MessageRelayed {
            tenant: tenant_id.to_owned(),
            from: sender.to_owned(),
            delivered: outcome.delivered,
            buffered: outcome.buffered,
            bytes: byte_size as u64,
        });

        Ok(outcome)
    }

    /// Evict buffered messages older than the TTL across all tenants.
    /// Returns how many entries were dropped.
    pub fn sweep_buffers(&self) -> usize {
        self.sweep_buffers_at(epoch_ms())
    }

    pub fn sweep_buffers_at(&self, now_ms: u64) -> usize {
        let cutoff = now_ms.saturating_sub(self.buffer_ttl_ms);
        let mut dropped = 0;
        for handle in self.registry.list() {
            let expired = handle.state.write().expire_buffered(cutoff);
            for msg in &expired {
                self.events.emit(RelayEvent::BufferExpired {
                    tenant: handle.id.clone(),
                    target: msg.target.clone(),
                    bytes: msg.payload.len() as u64,
                });
            }
            self.metrics.buffer_expired.fetch_add(expired.len() as u64, Ordering::Relaxed);
            dropped += expired.len();
        }
        if dropped > 0 {
            tracing::debug!(count = dropped, "buffer ttl sweep evicted entries");
        }
        dropped
    }
}

#[cfg(test)]
#[path = "router_tests.rs"]
mod tests;
