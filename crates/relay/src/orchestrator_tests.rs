// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;

use super::*;
use crate::error::AdmissionError;
use crate::registry::Tier;
use crate::test_support::CollectSink;

fn relay() -> Arc<Relay> {
    relay_with(RelayConfig::default())
}

fn relay_with(config: RelayConfig) -> Arc<Relay> {
    Arc::new(Relay::new(config).unwrap())
}

#[tokio::test]
async fn start_is_idempotent() {
    let relay = relay();
    assert_eq!(relay.phase(), Phase::Stopped);
    Relay::start(&relay).unwrap();
    assert_eq!(relay.phase(), Phase::Running);
    Relay::start(&relay).unwrap();
    assert_eq!(relay.phase(), Phase::Running);
    relay.destroy();
}

#[tokio::test]
async fn stop_transitions_through_draining_to_stopped() {
    let relay = relay_with(RelayConfig { drain_deadline_ms: 500, ..RelayConfig::default() });
    Relay::start(&relay).unwrap();
    relay.registry.register("t", Tier::Free);
    relay.connections.connect("t", CollectSink::new()).unwrap();

    relay.stop().await.unwrap();
    assert_eq!(relay.phase(), Phase::Stopped);
    assert_eq!(relay.registry.totals().connections, 0, "no connection stays open");
    assert!(relay.webhooks.idle(), "no webhook attempt outstanding");

    // Stopping again is an error.
    assert_eq!(relay.stop().await.unwrap_err(), crate::error::LifecycleError::AlreadyStopped);
}

#[tokio::test]
async fn draining_refuses_admission() {
    let relay = relay();
    Relay::start(&relay).unwrap();
    relay.registry.register("t", Tier::Free);
    relay.stop().await.unwrap();

    let err = relay.connections.connect("t", CollectSink::new()).unwrap_err();
    assert_eq!(err, AdmissionError::Draining);
}

#[tokio::test]
async fn destroy_from_any_state() {
    let destroyed = relay();
    destroyed.destroy();
    assert_eq!(destroyed.phase(), Phase::Destroyed);
    assert!(Relay::start(&destroyed).is_err(), "destroyed relay cannot restart");

    let running = relay();
    Relay::start(&running).unwrap();
    running.registry.register("t", Tier::Pro);
    running.destroy();
    assert_eq!(running.phase(), Phase::Destroyed);
    assert!(running.registry.get("t").is_none(), "tenants released");
}

#[tokio::test]
async fn lifecycle_events_reach_the_bus() {
    let relay = relay();
    Relay::start(&relay).unwrap();
    relay.registry.register("t", Tier::Free);
    relay.connections.connect("t", CollectSink::new()).unwrap();

    // The pump republishes hub events onto relay.* topics.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let replayed = relay.bus.replay("relay.client-connected", 1, None).unwrap();
        if !replayed.is_empty() {
            let parsed: serde_json::Value = serde_json::from_slice(&replayed[0].payload).unwrap();
            assert_eq!(parsed["type"], "client-connected");
            assert_eq!(parsed["tenant"], "t");
            break;
        }
        if tokio::time::Instant::now() > deadline {
            panic!("client-connected never reached the bus");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    relay.destroy();
}

#[tokio::test]
async fn webhook_plumbing_events_stay_off_the_bus() {
    let relay = relay();
    Relay::start(&relay).unwrap();

    relay.events.emit(RelayEvent::WebhookFailed {
        webhook: "wh_x".into(),
        topic: "y".into(),
        sequence: 1,
        attempt: 1,
        error: "HTTP 503".into(),
    });
    relay.events.emit(RelayEvent::TenantRemoved { tenant: "t".into() });

    // Wait for the pump to process both, then check what landed.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while relay.bus.replay("relay.tenant-removed", 1, None).unwrap().is_empty() {
        if tokio::time::Instant::now() > deadline {
            panic!("tenant-removed never reached the bus");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(relay.bus.replay("relay.webhook-failed", 1, None).unwrap().is_empty());
    relay.destroy();
}

#[tokio::test]
async fn snapshot_reflects_relay_state() {
    let relay = relay();
    Relay::start(&relay).unwrap();
    relay.registry.register("t", Tier::Pro);
    let sink = CollectSink::new();
    let c1 = relay.connections.connect("t", sink).unwrap().connection_id;
    relay.router.relay("t", &c1, Bytes::from_static(b"hello"), Some("absent")).unwrap();

    let snapshot = relay.snapshot();
    assert_eq!(snapshot.status, "running");
    assert_eq!(snapshot.tenants, 1);
    assert_eq!(snapshot.connections, 1);
    assert_eq!(snapshot.buffered_messages, 1);
    assert_eq!(snapshot.buffered_bytes, 5);
    assert!(snapshot.messages_per_sec > 0.0);
    let expected_util = 5.0 / relay.config.message_buffer_bytes as f64;
    assert!((snapshot.buffer_utilization - expected_util).abs() < 1e-12);
    relay.destroy();
}

#[test]
fn invalid_config_is_a_64_exit() {
    let bad = RelayConfig { message_buffer_bytes: 0, ..RelayConfig::default() };
    match Relay::new(bad) {
        Err(e) => assert_eq!(e.exit_code(), 64),
        Ok(_) => panic!("expected config error"),
    }
}
