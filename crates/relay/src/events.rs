// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Lifecycle event categories and the in-process fan-out hub.
//!
//! Every user-visible state change in the relay is announced as a
//! [`RelayEvent`] on a broadcast channel. The observer WebSocket endpoint,
//! the metrics reporter, and the bus-forwarding pump all subscribe here.
//! Event payload bytes never appear in these events, only identifiers and
//! sizes.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Why a connection was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisconnectReason {
    ClientRequest,
    Idle,
    TenantRemoved,
    TierDowngrade,
    Shutdown,
    TransportError,
}

impl DisconnectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ClientRequest => "client_request",
            Self::Idle => "idle",
            Self::TenantRemoved => "tenant_removed",
            Self::TierDowngrade => "tier_downgrade",
            Self::Shutdown => "shutdown",
            Self::TransportError => "transport_error",
        }
    }
}

/// Why a tenant was throttled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThrottleReason {
    Rate,
    MaxConnections,
}

/// Structured events emitted by the relay core.
///
/// Wire identifiers are stable; dashboards and tests match on them.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum RelayEvent {
    ClientConnected { tenant: String, connection: String },
    ClientDisconnected { tenant: String, connection: String, reason: DisconnectReason },
    MessageRelayed { tenant: String, from: String, delivered: u32, buffered: bool, bytes: u64 },
    BufferOverflow { tenant: String, target: String, dropped_bytes: u64 },
    BufferExpired { tenant: String, target: String, bytes: u64 },
    TenantThrottled {
        tenant: String,
        reason: ThrottleReason,
        #[serde(skip_serializing_if = "Option::is_none")]
        limit: Option<u32>,
    },
    TenantRemoved { tenant: String },
    TenantTierChanged { tenant: String, prev: String, next: String },
    HealthCheck { status: String, connections: usize, tenants: usize },
    WebhookSent { webhook: String, topic: String, sequence: u64, attempt: u32 },
    WebhookFailed { webhook: String, topic: String, sequence: u64, attempt: u32, error: String },
    WebhookDlq { webhook: String, sequence: u64, kind: String },
    BusDlq { subscription: String, sequence: u64, kind: String },
    RuleDisabled { rule: String, error: String },
}

impl RelayEvent {
    /// Stable category identifier (the serialized `type` tag).
    pub fn category(&self) -> &'static str {
        match self {
            Self::ClientConnected { .. } => "client-connected",
            Self::ClientDisconnected { .. } => "client-disconnected",
            Self::MessageRelayed { .. } => "message-relayed",
            Self::BufferOverflow { .. } => "buffer-overflow",
            Self::BufferExpired { .. } => "buffer-expired",
            Self::TenantThrottled { .. } => "tenant-throttled",
            Self::TenantRemoved { .. } => "tenant-removed",
            Self::TenantTierChanged { .. } => "tenant-tier-changed",
            Self::HealthCheck { .. } => "health-check",
            Self::WebhookSent { .. } => "webhook-sent",
            Self::WebhookFailed { .. } => "webhook-failed",
            Self::WebhookDlq { .. } => "webhook-dlq",
            Self::BusDlq { .. } => "bus-dlq",
            Self::RuleDisabled { .. } => "rule-disabled",
        }
    }

    /// Tenant the event concerns, when it is tenant-scoped.
    pub fn tenant(&self) -> Option<&str> {
        match self {
            Self::ClientConnected { tenant, .. }
            | Self::ClientDisconnected { tenant, .. }
            | Self::MessageRelayed { tenant, .. }
            | Self::BufferOverflow { tenant, .. }
            | Self::BufferExpired { tenant, .. }
            | Self::TenantThrottled { tenant, .. }
            | Self::TenantRemoved { tenant }
            | Self::TenantTierChanged { tenant, .. } => Some(tenant),
            _ => None,
        }
    }

    /// Whether this category is re-published onto the event bus under a
    /// `relay.<category>` topic. Delivery-plumbing categories stay off the
    /// bus so a failing webhook cannot feed its own failure events back
    /// into webhook dispatch.
    pub fn forwards_to_bus(&self) -> bool {
        !matches!(
            self,
            Self::WebhookSent { .. }
                | Self::WebhookFailed { .. }
                | Self::WebhookDlq { .. }
                | Self::BusDlq { .. }
                | Self::RuleDisabled { .. }
        )
    }
}

// -- Event hub ----------------------------------------------------------------

/// Broadcast hub for relay events.
///
/// `emit` never blocks and never fails; events sent with no subscribers are
/// dropped, and lagging subscribers lose oldest-first (observers are
/// best-effort by contract).
#[derive(Clone)]
pub struct EventHub {
    tx: broadcast::Sender<RelayEvent>,
}

impl EventHub {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn emit(&self, event: RelayEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RelayEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new(256)
    }
}

/// Return current epoch millis.
pub fn epoch_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
#[path = "events_tests.rs"]
mod tests;
