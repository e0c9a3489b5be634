// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use crate::events::{DisconnectReason, ThrottleReason};

fn connected(tenant: &str) -> RelayEvent {
    RelayEvent::ClientConnected { tenant: tenant.into(), connection: "c1".into() }
}

#[test]
fn all_all_accepts_everything() {
    let filter = EventFilter::new("all", "all");
    assert!(filter.wants(&connected("t1")));
    assert!(filter.wants(&RelayEvent::HealthCheck {
        status: "running".into(),
        connections: 0,
        tenants: 0
    }));
}

#[test]
fn category_filter_selects() {
    let filter = EventFilter::new("client-connected,client-disconnected", "all");
    assert!(filter.wants(&connected("t1")));
    assert!(filter.wants(&RelayEvent::ClientDisconnected {
        tenant: "t1".into(),
        connection: "c1".into(),
        reason: DisconnectReason::Idle,
    }));
    assert!(!filter.wants(&RelayEvent::TenantRemoved { tenant: "t1".into() }));
}

#[test]
fn tenant_filter_scopes_tenant_events() {
    let filter = EventFilter::new("all", "t1,t2");
    assert!(filter.wants(&connected("t1")));
    assert!(filter.wants(&connected("t2")));
    assert!(!filter.wants(&connected("t3")));
}

#[test]
fn unscoped_events_pass_tenant_filter() {
    let filter = EventFilter::new("all", "t1");
    assert!(filter.wants(&RelayEvent::HealthCheck {
        status: "running".into(),
        connections: 0,
        tenants: 0
    }));
    assert!(filter.wants(&RelayEvent::WebhookSent {
        webhook: "wh_1".into(),
        topic: "x".into(),
        sequence: 1,
        attempt: 1
    }));
}

#[test]
fn combined_filters_intersect() {
    let filter = EventFilter::new("tenant-throttled", "t1");
    assert!(filter.wants(&RelayEvent::TenantThrottled {
        tenant: "t1".into(),
        reason: ThrottleReason::Rate,
        limit: None
    }));
    assert!(!filter.wants(&RelayEvent::TenantThrottled {
        tenant: "t2".into(),
        reason: ThrottleReason::Rate,
        limit: None
    }));
    assert!(!filter.wants(&connected("t1")));
}
