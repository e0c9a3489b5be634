// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;

use super::*;
use crate::events::EventHub;

/// Sink that records closes and accepts everything.
struct NullSink {
    closed: AtomicBool,
}

impl NullSink {
    fn new() -> Arc<Self> {
        Arc::new(Self { closed: AtomicBool::new(false) })
    }
}

impl ConnectionSink for NullSink {
    fn try_deliver(&self, _from: Option<&str>, _payload: &Bytes) -> SinkStatus {
        SinkStatus::Accepted
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

fn registry() -> (TenantRegistry, EventHub) {
    let hub = EventHub::new(64);
    (TenantRegistry::new(TierLimits::default(), 1024, hub.clone()), hub)
}

fn insert_connection(handle: &TenantHandle, id: &str) -> Arc<NullSink> {
    let sink = NullSink::new();
    handle.state.write().connections.insert(
        id.to_owned(),
        ConnectionRecord {
            id: id.to_owned(),
            connected_at_ms: 0,
            last_message_ms: None,
            messages_relayed: 0,
            bytes_relayed: 0,
            sink: sink.clone(),
        },
    );
    sink
}

#[test]
fn register_is_idempotent_on_same_tier() {
    let (reg, _hub) = registry();
    assert_eq!(reg.register("t1", Tier::Free), RegisterOutcome::Created);
    assert_eq!(reg.register("t1", Tier::Free), RegisterOutcome::Unchanged);
}

#[tokio::test]
async fn register_with_new_tier_emits_tier_changed() {
    let (reg, hub) = registry();
    let mut rx = hub.subscribe();
    reg.register("t1", Tier::Free);
    assert_eq!(reg.register("t1", Tier::Pro), RegisterOutcome::TierChanged { prev: Tier::Free });

    let event = rx.recv().await.unwrap();
    match event {
        RelayEvent::TenantTierChanged { tenant, prev, next } => {
            assert_eq!(tenant, "t1");
            assert_eq!(prev, "free");
            assert_eq!(next, "pro");
        }
        other => panic!("unexpected event: {other:?}"),
    }
}

#[tokio::test]
async fn remove_closes_connections_in_id_order() {
    let (reg, hub) = registry();
    let mut rx = hub.subscribe();
    reg.register("t1", Tier::Pro);
    let handle = reg.get("t1").unwrap();

    // Insert out of order; removal events must come back sorted.
    let sink_b = insert_connection(&handle, "conn-b");
    let sink_a = insert_connection(&handle, "conn-a");

    assert!(reg.remove("t1"));
    assert!(sink_a.closed.load(Ordering::SeqCst));
    assert!(sink_b.closed.load(Ordering::SeqCst));

    let mut seen = Vec::new();
    for _ in 0..3 {
        seen.push(rx.recv().await.unwrap());
    }
    match (&seen[0], &seen[1], &seen[2]) {
        (
            RelayEvent::ClientDisconnected { connection: c1, reason: r1, .. },
            RelayEvent::ClientDisconnected { connection: c2, reason: r2, .. },
            RelayEvent::TenantRemoved { tenant },
        ) => {
            assert_eq!(c1, "conn-a");
            assert_eq!(c2, "conn-b");
            assert_eq!(*r1, DisconnectReason::TenantRemoved);
            assert_eq!(*r2, DisconnectReason::TenantRemoved);
            assert_eq!(tenant, "t1");
        }
        other => panic!("unexpected event order: {other:?}"),
    }

    assert!(reg.get("t1").is_none());
    assert!(!reg.remove("t1"), "second remove is a no-op");
}

#[test]
fn buffer_ceiling_rejects_whole_message() {
    let (reg, _hub) = registry();
    reg.register("t1", Tier::Free);
    let handle = reg.get("t1").unwrap();
    let mut state = handle.state.write();

    let msg = |bytes: &'static [u8]| BufferedMessage {
        target: "c2".to_owned(),
        payload: Bytes::from_static(bytes),
        enqueued_at_ms: 0,
    };

    assert!(state.enqueue_buffered(msg(b"aa"), 4).is_ok());
    assert!(state.enqueue_buffered(msg(b"bb"), 4).is_ok());
    // One more byte would exceed the ceiling; nothing is partially buffered.
    assert_eq!(state.enqueue_buffered(msg(b"c"), 4), Err(5));
    assert_eq!(state.buffer.len(), 2);
    assert_eq!(state.buffered_bytes, 4);
}

#[test]
fn take_buffered_preserves_order_and_other_targets() {
    let (reg, _hub) = registry();
    reg.register("t1", Tier::Free);
    let handle = reg.get("t1").unwrap();
    let mut state = handle.state.write();

    let msg = |target: &str, payload: &'static [u8], ts: u64| BufferedMessage {
        target: target.to_owned(),
        payload: Bytes::from_static(payload),
        enqueued_at_ms: ts,
    };
    state.enqueue_buffered(msg("c2", b"a", 1), 1024).unwrap();
    state.enqueue_buffered(msg("c3", b"x", 2), 1024).unwrap();
    state.enqueue_buffered(msg("c2", b"bb", 3), 1024).unwrap();

    let taken = state.take_buffered_for("c2");
    assert_eq!(taken.len(), 2);
    assert_eq!(&taken[0].payload[..], b"a");
    assert_eq!(&taken[1].payload[..], b"bb");
    assert_eq!(state.buffer.len(), 1);
    assert_eq!(state.buffered_bytes, 1);
}

#[test]
fn expire_buffered_drops_aged_prefix() {
    let (reg, _hub) = registry();
    reg.register("t1", Tier::Free);
    let handle = reg.get("t1").unwrap();
    let mut state = handle.state.write();

    let msg = |ts: u64| BufferedMessage {
        target: "c2".to_owned(),
        payload: Bytes::from_static(b"ab"),
        enqueued_at_ms: ts,
    };
    state.enqueue_buffered(msg(100), 1024).unwrap();
    state.enqueue_buffered(msg(200), 1024).unwrap();
    state.enqueue_buffered(msg(300), 1024).unwrap();

    let expired = state.expire_buffered(250);
    assert_eq!(expired.len(), 2);
    assert_eq!(state.buffer.len(), 1);
    assert_eq!(state.buffered_bytes, 2);
}

#[tokio::test]
async fn tier_downgrade_evicts_newest_connections() {
    let hub = EventHub::new(64);
    let reg = TenantRegistry::new(
        TierLimits { free: 1, pro: 100, enterprise: 1000 },
        1024,
        hub.clone(),
    );
    reg.register("t1", Tier::Pro);
    let handle = reg.get("t1").unwrap();
    let sink_old = insert_connection(&handle, "conn-a");
    let sink_new = insert_connection(&handle, "conn-b");

    let mut rx = hub.subscribe();
    assert_eq!(reg.register("t1", Tier::Free), RegisterOutcome::TierChanged { prev: Tier::Pro });

    // The cap invariant holds immediately: the newest connection went.
    let state = handle.state.read();
    assert_eq!(state.connections.len(), 1);
    assert!(state.connections.contains_key("conn-a"));
    drop(state);
    assert!(sink_new.closed.load(Ordering::SeqCst));
    assert!(!sink_old.closed.load(Ordering::SeqCst));

    match rx.recv().await.unwrap() {
        RelayEvent::ClientDisconnected { connection, reason, .. } => {
            assert_eq!(connection, "conn-b");
            assert_eq!(reason, DisconnectReason::TierDowngrade);
        }
        other => panic!("unexpected event: {other:?}"),
    }
    match rx.recv().await.unwrap() {
        RelayEvent::TenantTierChanged { next, .. } => assert_eq!(next, "free"),
        other => panic!("unexpected event: {other:?}"),
    }
}

#[test]
fn tier_limits_fail_closed_for_missing_overrides() {
    let limits = TierLimits::from_overrides(&[(Tier::Free, 5)]);
    assert_eq!(limits.limit(Tier::Free), 5);
    assert_eq!(limits.limit(Tier::Pro), 0);
    assert_eq!(limits.limit(Tier::Enterprise), 0);
}

#[test]
fn metrics_snapshot_is_consistent() {
    let (reg, _hub) = registry();
    reg.register("t1", Tier::Pro);
    let handle = reg.get("t1").unwrap();
    insert_connection(&handle, "c1");
    {
        let mut state = handle.state.write();
        state.counters.messages_relayed = 7;
        state.counters.bytes_relayed = 99;
        state
            .enqueue_buffered(
                BufferedMessage {
                    target: "c9".into(),
                    payload: Bytes::from_static(b"xyz"),
                    enqueued_at_ms: 0,
                },
                1024,
            )
            .unwrap();
    }

    let m = reg.metrics("t1").unwrap();
    assert_eq!(m.tier, Tier::Pro);
    assert_eq!(m.active_connections, 1);
    assert_eq!(m.buffered_messages, 1);
    assert_eq!(m.buffered_bytes, 3);
    assert_eq!(m.messages_relayed, 7);
    assert_eq!(m.bytes_relayed, 99);

    assert!(reg.metrics("nope").is_none());
}
