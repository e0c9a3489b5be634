// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Connection lifecycle: admission, idle sweep, buffered-message flush.
//!
//! Admission order is fixed and observable: tenant lookup, rate limiter,
//! tier cap, then id allocation and buffer flush. Connection ids are UUIDv7
//! strings — process-unique, non-guessable, and lexically time-ordered, so
//! iteration over a tenant's `BTreeMap` of connections is deterministic.

use std::sync::Arc;

use crate::error::AdmissionError;
use crate::events::{epoch_ms, DisconnectReason, EventHub, RelayEvent, ThrottleReason};
use crate::limiter::{Gate, RateLimiter};
use crate::orchestrator::{Phase, PhaseCell};
use crate::registry::{ConnectionRecord, ConnectionSink, SinkStatus, TenantRegistry};

/// Result of a successful admission.
#[derive(Debug, Clone)]
pub struct Admitted {
    pub connection_id: String,
    /// Buffered messages flushed to this connection on join.
    pub flushed: usize,
}

pub struct ConnectionManager {
    registry: Arc<TenantRegistry>,
    limiter: Arc<RateLimiter>,
    events: EventHub,
    phase: PhaseCell,
    idle_timeout_ms: u64,
}

impl ConnectionManager {
    pub fn new(
        registry: Arc<TenantRegistry>,
        limiter: Arc<RateLimiter>,
        events: EventHub,
        phase: PhaseCell,
        idle_timeout_ms: u64,
    ) -> Self {
        Self { registry, limiter, events, phase, idle_timeout_ms }
    }

    /// Admit a connection with a freshly allocated id.
    pub fn connect(
        &self,
        tenant_id: &str,
        sink: Arc<dyn ConnectionSink>,
    ) -> Result<Admitted, AdmissionError> {
        self.connect_with_id(tenant_id, None, sink)
    }

    /// Admit a connection, optionally resuming a previous connection id so
    /// messages buffered for it are flushed on join. A requested id that is
    /// already active gets a fresh one instead.
    pub fn connect_with_id(
        &self,
        tenant_id: &str,
        requested_id: Option<String>,
        sink: Arc<dyn ConnectionSink>,
    ) -> Result<Admitted, AdmissionError> {
        if self.phase.get() != Phase::Running {
            return Err(AdmissionError::Draining);
        }

        let handle = self.registry.get(tenant_id).ok_or(AdmissionError::UnknownTenant)?;

        if !self.limiter.allow(tenant_id, Gate::Connect) {
            self.events.emit(RelayEvent::TenantThrottled {
                tenant: tenant_id.to_owned(),
                reason: ThrottleReason::Rate,
                limit: None,
            });
            return Err(AdmissionError::RateLimited);
        }

        let now = epoch_ms();
        let (connection_id, delivered) = {
            let mut state = handle.state.write();
            let limit = self.registry.tier_limit(state.tier);
            if state.connections.len() as u32 >= limit {
                drop(state);
                self.events.emit(RelayEvent::TenantThrottled {
                    tenant: tenant_id.to_owned(),
                    reason: ThrottleReason::MaxConnections,
                    limit: Some(limit),
                });
                return Err(AdmissionError::CapExceeded { limit });
            }

            let connection_id = match requested_id {
                Some(id) if !state.connections.contains_key(&id) => id,
                _ => uuid::Uuid::now_v7().to_string(),
            };

            state.connections.insert(
                connection_id.clone(),
                ConnectionRecord {
                    id: connection_id.clone(),
                    connected_at_ms: now,
                    last_message_ms: None,
                    messages_relayed: 0,
                    bytes_relayed: 0,
                    sink: Arc::clone(&sink),
                },
            );
            state.counters.last_activity_ms = now;

            // Flush buffered messages in enqueue order while still holding
            // the tenant lock, so no live relay can interleave with the
            // backlog. `try_deliver` never blocks. On saturation the
            // remainder goes back to the buffer front, order intact.
            let flushed = state.take_buffered_for(&connection_id);
            let mut delivered = 0usize;
            let mut delivered_bytes = 0u64;
            let mut remainder = Vec::new();
            for (i, msg) in flushed.iter().enumerate() {
                match sink.try_deliver(None, &msg.payload) {
                    SinkStatus::Accepted => {
                        delivered += 1;
                        delivered_bytes += msg.payload.len() as u64;
                    }
                    SinkStatus::Saturated | SinkStatus::Gone => {
                        remainder = flushed[i..].to_vec();
                        break;
                    }
                }
            }
            state.counters.bytes_relayed += delivered_bytes;
            for msg in remainder.into_iter().rev() {
                state.buffered_bytes += msg.payload.len();
                state.buffer.push_front(msg);
            }
            (connection_id, delivered)
        };

        self.events.emit(RelayEvent::ClientConnected {
            tenant: tenant_id.to_owned(),
            connection: connection_id.clone(),
        });
        tracing::debug!(tenant = %tenant_id, connection = %connection_id, "client connected");

        Ok(Admitted { connection_id, flushed: delivered })
    }

    /// Remove a connection. Returns false if tenant or connection is unknown.
    pub fn disconnect(&self, tenant_id: &str, connection_id: &str, reason: DisconnectReason) -> bool {
        let Some(handle) = self.registry.get(tenant_id) else {
            return false;
        };
        let removed = handle.state.write().connections.remove(connection_id);
        match removed {
            Some(record) => {
                record.sink.close();
                self.events.emit(RelayEvent::ClientDisconnected {
                    tenant: tenant_id.to_owned(),
                    connection: connection_id.to_owned(),
                    reason,
                });
                tracing::debug!(
                    tenant = %tenant_id,
                    connection = %connection_id,
                    reason = reason.as_str(),
                    "client disconnected"
                );
                true
            }
            None => false,
        }
    }

    /// Refresh a connection's last-message timestamp.
    pub fn touch(&self, tenant_id: &str, connection_id: &str) -> bool {
        eprintln!("DEBUG touch: start");
        let Some(handle) = self.registry.get(tenant_id) else {
            eprintln!("DEBUG touch: no handle");
            return false;
        };
        eprintln!("DEBUG touch: got handle");
        let now = epoch_ms();
        eprintln!("DEBUG touch: got now, locking write");
        let mut state = handle.state.write();
        eprintln!("DEBUG touch: got write lock");
        state.counters.last_activity_ms = now;
        let result = match state.connections.get_mut(connection_id) {
            Some(record) => {
                record.last_message_ms = Some(now);
                true
            }
            None => false,
        };
        eprintln!("DEBUG touch: returning {result}");
        result
    }

    /// Disconnect connections whose last activity is older than the idle
    /// timeout. Returns how many were closed.
    pub fn sweep_idle(&self) -> usize {
        self.sweep_idle_at(epoch_ms())
    }

    pub fn sweep_idle_at(&self, now_ms: u64) -> usize {
        let mut swept = 0;
        for handle in self.registry.list() {
            let idle: Vec<String> = {
                let state = handle.state.read();
                state
                    .connections
                    .values()
                    .filter(|c| now_ms.saturating_sub(c.last_activity_ms()) > self.idle_timeout_ms)
                    .map(|c| c.id.clone())
                    .collect()
            };
            for id in idle {
                if self.disconnect(&handle.id, &id, DisconnectReason::Idle) {
                    swept += 1;
                }
            }
        }
        if swept > 0 {
            tracing::info!(count = swept, "idle sweep closed connections");
        }
        swept
    }

    /// Close every connection, tenant by tenant in id order. Used on stop.
    pub fn close_all(&self, reason: DisconnectReason) -> usize {
        let mut closed = 0;
        for handle in self.registry.list() {
            let ids: Vec<String> = handle.state.read().connections.keys().cloned().collect();
            for id in ids {
                if self.disconnect(&handle.id, &id, reason) {
                    closed += 1;
                }
            }
        }
        closed
    }
}

#[cfg(test)]
#[path = "connection_tests.rs"]
mod tests;
