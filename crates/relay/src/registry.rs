// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Tenant registry: tiers, connection sets, buffered-message queues, counters.
//!
//! Each tenant's mutable state sits behind its own lock; the registry map
//! itself is only locked long enough to resolve a tenant handle. Nothing
//! suspends while a tenant lock is held — sinks are handed messages through
//! the non-blocking [`ConnectionSink::try_deliver`].

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::events::{epoch_ms, DisconnectReason, EventHub, RelayEvent};

// -- Tiers --------------------------------------------------------------------

/// Subscription class determining per-tenant connection caps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Free,
    Pro,
    Enterprise,
}

impl Tier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Free => "free",
            Self::Pro => "pro",
            Self::Enterprise => "enterprise",
        }
    }
}

impl std::str::FromStr for Tier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "free" => Ok(Self::Free),
            "pro" => Ok(Self::Pro),
            "enterprise" => Ok(Self::Enterprise),
            other => Err(format!("unknown tier: {other}")),
        }
    }
}

/// Per-tier connection caps. A tier that was explicitly configured away
/// fails closed with a cap of zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TierLimits {
    pub free: u32,
    pub pro: u32,
    pub enterprise: u32,
}

impl TierLimits {
    /// Same cap for every tier (used when no per-tier overrides are given).
    pub fn uniform(cap: u32) -> Self {
        Self { free: cap, pro: cap, enterprise: cap }
    }

    /// Build from explicit `tier=limit` overrides; unnamed tiers get zero.
    pub fn from_overrides(overrides: &[(Tier, u32)]) -> Self {
        let mut limits = Self { free: 0, pro: 0, enterprise: 0 };
        for (tier, cap) in overrides {
            match tier {
                Tier::Free => limits.free = *cap,
                Tier::Pro => limits.pro = *cap,
                Tier::Enterprise => limits.enterprise = *cap,
            }
        }
        limits
    }

    pub fn limit(&self, tier: Tier) -> u32 {
        match tier {
            Tier::Free => self.free,
            Tier::Pro => self.pro,
            Tier::Enterprise => self.enterprise,
        }
    }
}

impl Default for TierLimits {
    fn default() -> Self {
        Self { free: 10, pro: 100, enterprise: 1000 }
    }
}

// -- Connection sinks ---------------------------------------------------------

/// Outcome of a non-blocking handoff to a connection's transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkStatus {
    /// The transport accepted the message.
    Accepted,
    /// The transport's outbound queue is full; the message was not taken.
    Saturated,
    /// The transport is gone (socket closed under us).
    Gone,
}

/// Transport-side handle for delivering payloads to one connection.
///
/// `try_deliver` must return promptly and never block; recipient-side flow
/// control is the transport's problem.
pub trait ConnectionSink: Send + Sync {
    fn try_deliver(&self, from: Option<&str>, payload: &Bytes) -> SinkStatus;

    /// Ask the transport to close the connection.
    fn close(&self);
}

// -- Records ------------------------------------------------------------------

/// A single client session within a tenant.
pub struct ConnectionRecord {
    pub id: String,
    pub connected_at_ms: u64,
    pub last_message_ms: Option<u64>,
    pub messages_relayed: u64,
    pub bytes_relayed: u64,
    pub sink: Arc<dyn ConnectionSink>,
}

impl ConnectionRecord {
    /// Timestamp the idle sweep compares against.
    pub fn last_activity_ms(&self) -> u64 {
        self.last_message_ms.unwrap_or(self.connected_at_ms)
    }
}

/// A message parked for a currently-absent target connection.
#[derive(Debug, Clone)]
pub struct BufferedMessage {
    pub target: String,
    pub payload: Bytes,
    pub enqueued_at_ms: u64,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TenantCounters {
    pub messages_relayed: u64,
    pub bytes_relayed: u64,
    pub last_activity_ms: u64,
}

/// Mutable per-tenant state, guarded by the tenant's own lock.
pub struct TenantState {
    pub tier: Tier,
    /// Keyed by connection id; `BTreeMap` gives deterministic id order for
    /// removal and sweeps.
    pub connections: BTreeMap<String, ConnectionRecord>,
    pub buffer: VecDeque<BufferedMessage>,
    pub buffered_bytes: usize,
    pub counters: TenantCounters,
}

impl TenantState {
    fn new(tier: Tier) -> Self {
        Self {
            tier,
            connections: BTreeMap::new(),
            buffer: VecDeque::new(),
            buffered_bytes: 0,
            counters: TenantCounters { last_activity_ms: epoch_ms(), ..Default::default() },
        }
    }

    /// Enqueue under the byte ceiling. On overflow nothing is buffered and
    /// the would-be total is returned.
    pub fn enqueue_buffered(
        &mut self,
        msg: BufferedMessage,
        ceiling_bytes: usize,
    ) -> Result<(), usize> {
        let next_total = self.buffered_bytes + msg.payload.len();
        if next_total > ceiling_bytes {
            return Err(next_total);
        }
        self.buffered_bytes = next_total;
        self.buffer.push_back(msg);
        Ok(())
    }

    /// Remove and return all buffered messages for `target`, preserving
    /// enqueue order. Entries for other targets stay put.
    pub fn take_buffered_for(&mut self, target: &str) -> Vec<BufferedMessage> {
        let mut taken = Vec::new();
        let mut kept = VecDeque::with_capacity(self.buffer.len());
        for msg in self.buffer.drain(..) {
            if msg.target == target {
                self.buffered_bytes -= msg.payload.len();
                taken.push(msg);
            } else {
                kept.push_back(msg);
            }
        }
        self.buffer = kept;
        taken
    }

    /// Drop buffered messages enqueued before `cutoff_ms`. The queue is in
    /// enqueue order, so expired entries form a prefix.
    pub fn expire_buffered(&mut self, cutoff_ms: u64) -> Vec<BufferedMessage> {
        let mut expired = Vec::new();
        while let Some(head) = self.buffer.front() {
            if head.enqueued_at_ms < cutoff_ms {
                let msg = match self.buffer.pop_front() {
                    Some(m) => m,
                    None => break,
                };
                self.buffered_bytes -= msg.payload.len();
                expired.push(msg);
            } else {
                break;
            }
        }
        expired
    }
}

/// Shared handle to one tenant's state.
pub struct TenantHandle {
    pub id: String,
    pub state: RwLock<TenantState>,
}

// -- Snapshots ----------------------------------------------------------------

/// Point-in-time per-tenant metrics, read under the tenant lock.
#[derive(Debug, Clone, Serialize)]
pub struct TenantMetrics {
    pub tenant: String,
    pub tier: Tier,
    pub active_connections: usize,
    pub buffered_messages: usize,
    pub buffered_bytes: usize,
    pub messages_relayed: u64,
    pub bytes_relayed: u64,
    pub last_activity_ms: u64,
}

/// Outcome of [`TenantRegistry::register`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterOutcome {
    Created,
    Unchanged,
    TierChanged { prev: Tier },
}

// -- Registry -----------------------------------------------------------------

/// Owner of all tenant records.
pub struct TenantRegistry {
    tenants: RwLock<HashMap<String, Arc<TenantHandle>>>,
    limits: TierLimits,
    message_buffer_bytes: usize,
    events: EventHub,
}

impl TenantRegistry {
    pub fn new(limits: TierLimits, message_buffer_bytes: usize, events: EventHub) -> Self {
        Self { tenants: RwLock::new(HashMap::new()), limits, message_buffer_bytes, events }
    }

    pub fn tier_limit(&self, tier: Tier) -> u32 {
        self.limits.limit(tier)
    }

    pub fn message_buffer_bytes(&self) -> usize {
        self.message_buffer_bytes
    }

    /// Register a tenant. Idempotent: same tier is a no-op; a different tier
    /// updates it and emits `tenant-tier-changed`. A downgrade below the
    /// current connection count evicts the newest connections so the cap
    /// invariant holds at all times.
    pub fn register(&self, tenant_id: &str, tier: Tier) -> RegisterOutcome {
        let mut tenants = self.tenants.write();
        if let Some(handle) = tenants.get(tenant_id) {
            let mut state = handle.state.write();
            if state.tier == tier {
                return RegisterOutcome::Unchanged;
            }
            let prev = state.tier;
            state.tier = tier;

            let limit = self.limits.limit(tier) as usize;
            let mut evicted = Vec::new();
            while state.connections.len() > limit {
                let newest = match state.connections.keys().next_back().cloned() {
                    Some(id) => id,
                    None => break,
                };
                if let Some(record) = state.connections.remove(&newest) {
                    evicted.push(record);
                }
            }
            drop(state);

            for record in &evicted {
                record.sink.close();
                self.events.emit(RelayEvent::ClientDisconnected {
                    tenant: tenant_id.to_owned(),
                    connection: record.id.clone(),
                    reason: DisconnectReason::TierDowngrade,
                });
            }
            self.events.emit(RelayEvent::TenantTierChanged {
                tenant: tenant_id.to_owned(),
                prev: prev.as_str().to_owned(),
                next: tier.as_str().to_owned(),
            });
            tracing::info!(tenant = %tenant_id, prev = prev.as_str(), next = tier.as_str(), "tenant tier changed");
            return RegisterOutcome::TierChanged { prev };
        }
        tenants.insert(
            tenant_id.to_owned(),
            Arc::new(TenantHandle {
                id: tenant_id.to_owned(),
                state: RwLock::new(TenantState::new(tier)),
            }),
        );
        tracing::info!(tenant = %tenant_id, tier = tier.as_str(), "tenant registered");
        RegisterOutcome::Created
    }

    /// Remove a tenant: close every connection in deterministic id order,
    /// drop its buffer, emit one `client-disconnected` per connection then
    /// `tenant-removed`.
    pub fn remove(&self, tenant_id: &str) -> bool {
        let handle = match self.tenants.write().remove(tenant_id) {
            Some(h) => h,
            None => return false,
        };

        let drained: Vec<ConnectionRecord> = {
            let mut state = handle.state.write();
            state.buffer.clear();
            state.buffered_bytes = 0;
            // BTreeMap yields ascending id order.
            let ids: Vec<String> = state.connections.keys().cloned().collect();
            ids.into_iter().filter_map(|id| state.connections.remove(&id)).collect()
        };

        for record in &drained {
            record.sink.close();
            self.events.emit(RelayEvent::ClientDisconnected {
                tenant: tenant_id.to_owned(),
                connection: record.id.clone(),
                reason: DisconnectReason::TenantRemoved,
            });
        }
        self.events.emit(RelayEvent::TenantRemoved { tenant: tenant_id.to_owned() });
        tracing::info!(tenant = %tenant_id, connections = drained.len(), "tenant removed");
        true
    }

    pub fn get(&self, tenant_id: &str) -> Option<Arc<TenantHandle>> {
        self.tenants.read().get(tenant_id).map(Arc::clone)
    }

    /// All tenant handles, sorted by id.
    pub fn list(&self) -> Vec<Arc<TenantHandle>> {
        let mut handles: Vec<_> = self.tenants.read().values().map(Arc::clone).collect();
        handles.sort_by(|a, b| a.id.cmp(&b.id));
        handles
    }

    /// Consistent point-in-time snapshot for one tenant.
    pub fn metrics(&self, tenant_id: &str) -> Option<TenantMetrics> {
        let handle = self.get(tenant_id)?;
        let state = handle.state.read();
        Some(TenantMetrics {
            tenant: handle.id.clone(),
            tier: state.tier,
            active_connections: state.connections.len(),
            buffered_messages: state.buffer.len(),
            buffered_bytes: state.buffered_bytes,
            messages_relayed: state.counters.messages_relayed,
            bytes_relayed: state.counters.bytes_relayed,
            last_activity_ms: state.counters.last_activity_ms,
        })
    }

    /// Aggregate totals for health and metrics snapshots.
    pub fn totals(&self) -> RegistryTotals {
        let handles: Vec<_> = self.tenants.read().values().map(Arc::clone).collect();
        let mut totals = RegistryTotals { tenants: handles.len(), ..Default::default() };
        for handle in handles {
            let state = handle.state.read();
            totals.connections += state.connections.len();
            totals.buffered_bytes += state.buffered_bytes;
            totals.buffered_messages += state.buffer.len();
        }
        totals
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RegistryTotals {
    pub tenants: usize,
    pub connections: usize,
    pub buffered_messages: usize,
    pub buffered_bytes: usize,
}

#[cfg(test)]
#[path = "registry_tests.rs"]
mod tests;
