// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! End-to-end wire-protocol specs: HELLO/WELCOME, RELAY/DELIVER, buffering,
//! caps, and lifecycle over a real socket.

use satchel_relay::config::RelayConfig;
use satchel_relay::events::RelayEvent;
use satchel_relay::registry::Tier;

use satchel_specs::{wait_until, Client, RelayServer};

fn spec_config() -> RelayConfig {
    RelayConfig {
        // Slow periodic sweeps so tests control timing.
        idle_sweep_ms: 60_000,
        buffer_sweep_ms: 60_000,
        health_check_interval_ms: 60_000,
        metrics_interval_ms: 60_000,
        dlq_sweep_ms: 60_000,
        ..RelayConfig::default()
    }
}

#[tokio::test]
async fn hello_gets_welcome_with_connection_id() -> anyhow::Result<()> {
    let server = RelayServer::start(spec_config()).await?;
    server.relay.registry.register("t", Tier::Free);

    let client = Client::connect(&server, "t", None).await?;
    assert!(!client.connection_id.is_empty());

    let metrics = server.relay.registry.metrics("t").ok_or_else(|| anyhow::anyhow!("no tenant"))?;
    assert_eq!(metrics.active_connections, 1);
    server.relay.destroy();
    Ok(())
}

#[tokio::test]
async fn unknown_tenant_is_refused() -> anyhow::Result<()> {
    let server = RelayServer::start(spec_config()).await?;
    let frame = Client::connect_expect_error(&server, "ghost").await?;
    assert_eq!(frame["code"], "UNKNOWN_TENANT");
    server.relay.destroy();
    Ok(())
}

#[tokio::test]
async fn direct_relay_delivers_with_sender_id() -> anyhow::Result<()> {
    let server = RelayServer::start(spec_config()).await?;
    server.relay.registry.register("t", Tier::Pro);

    let mut sender = Client::connect(&server, "t", None).await?;
    let mut receiver = Client::connect(&server, "t", None).await?;

    sender.relay(Some(&receiver.connection_id), b"hello there").await?;

    let (from, payload) = receiver.expect_deliver().await?;
    assert_eq!(from.as_deref(), Some(sender.connection_id.as_str()));
    assert_eq!(payload, b"hello there");
    server.relay.destroy();
    Ok(())
}

#[tokio::test]
async fn broadcast_reaches_peers_but_not_sender() -> anyhow::Result<()> {
    let server = RelayServer::start(spec_config()).await?;
    server.relay.registry.register("t", Tier::Pro);

    let mut sender = Client::connect(&server, "t", None).await?;
    let mut peer_a = Client::connect(&server, "t", None).await?;
    let mut peer_b = Client::connect(&server, "t", None).await?;

    sender.relay(None, b"to-everyone").await?;

    let (_, payload) = peer_a.expect_deliver().await?;
    assert_eq!(payload, b"to-everyone");
    let (_, payload) = peer_b.expect_deliver().await?;
    assert_eq!(payload, b"to-everyone");

    // The sender must not hear its own broadcast; a subsequent direct
    // message is the next thing it sees.
    peer_a.relay(Some(&sender.connection_id), b"direct").await?;
    let (_, payload) = sender.expect_deliver().await?;
    assert_eq!(payload, b"direct");
    server.relay.destroy();
    Ok(())
}

#[tokio::test]
async fn per_sender_order_is_preserved() -> anyhow::Result<()> {
    let server = RelayServer::start(spec_config()).await?;
    server.relay.registry.register("t", Tier::Pro);

    let mut sender = Client::connect(&server, "t", None).await?;
    let mut receiver = Client::connect(&server, "t", None).await?;

    for i in 0..20u8 {
        sender.relay(Some(&receiver.connection_id), &[i]).await?;
    }
    for i in 0..20u8 {
        let (_, payload) = receiver.expect_deliver().await?;
        assert_eq!(payload, vec![i], "delivery order must match publication order");
    }
    server.relay.destroy();
    Ok(())
}

#[tokio::test]
async fn buffered_messages_flush_in_order_on_join() -> anyhow::Result<()> {
    let server = RelayServer::start(spec_config()).await?;
    server.relay.registry.register("t", Tier::Free);

    let mut sender = Client::connect(&server, "t", None).await?;
    sender.relay(Some("c2"), b"a").await?;
    sender.relay(Some("c2"), b"bb").await?;

    let relay = &server.relay;
    wait_until(|| {
        relay.registry.metrics("t").map(|m| m.buffered_messages == 2).unwrap_or(false)
    })
    .await?;

    // Joining as c2 flushes the backlog, in enqueue order, before anything
    // published later.
    let mut late = Client::connect(&server, "t", Some("c2")).await?;
    assert_eq!(late.connection_id, "c2");
    sender.relay(Some("c2"), b"live").await?;

    let (_, first) = late.expect_deliver().await?;
    let (_, second) = late.expect_deliver().await?;
    let (_, third) = late.expect_deliver().await?;
    assert_eq!(first, b"a");
    assert_eq!(second, b"bb");
    assert_eq!(third, b"live");

    let metrics = relay.registry.metrics("t").ok_or_else(|| anyhow::anyhow!("no tenant"))?;
    assert_eq!(metrics.buffered_messages, 0);
    server.relay.destroy();
    Ok(())
}

#[tokio::test]
async fn free_tier_cap_refuses_third_connection() -> anyhow::Result<()> {
    let server = RelayServer::start(RelayConfig {
        tier_limit: vec![(Tier::Free, 2), (Tier::Pro, 100), (Tier::Enterprise, 1000)],
        ..spec_config()
    })
    .await?;
    server.relay.registry.register("t", Tier::Free);
    let mut events = server.relay.events.subscribe();

    let _c1 = Client::connect(&server, "t", None).await?;
    let _c2 = Client::connect(&server, "t", None).await?;
    let refusal = Client::connect(&server, "t", None).await;
    let message = format!("{}", refusal.err().ok_or_else(|| anyhow::anyhow!("expected refusal"))?);
    assert!(message.contains("CAP_EXCEEDED"), "got: {message}");

    let mut connected = 0;
    let mut throttled = 0;
    while let Ok(event) = events.try_recv() {
        match event {
            RelayEvent::ClientConnected { .. } => connected += 1,
            RelayEvent::TenantThrottled { limit, .. } => {
                assert_eq!(limit, Some(2));
                throttled += 1;
            }
            _ => {}
        }
    }
    assert_eq!(connected, 2);
    assert_eq!(throttled, 1);
    server.relay.destroy();
    Ok(())
}

#[tokio::test]
async fn tenant_token_gates_admission() -> anyhow::Result<()> {
    let server = RelayServer::start(RelayConfig {
        tenant_token: vec![("t".to_owned(), "sekrit".to_owned())],
        ..spec_config()
    })
    .await?;
    server.relay.registry.register("t", Tier::Free);
    server.relay.registry.register("open", Tier::Free);

    // No token: refused before admission.
    let refusal = Client::connect(&server, "t", None).await;
    let message = format!("{}", refusal.err().ok_or_else(|| anyhow::anyhow!("expected refusal"))?);
    assert!(message.contains("UNAUTHORIZED"), "got: {message}");
    assert_eq!(
        server
            .relay
            .registry
            .metrics("t")
            .ok_or_else(|| anyhow::anyhow!("no tenant"))?
            .active_connections,
        0
    );

    // Wrong tenant's guard does not leak to unguarded tenants.
    let _open = Client::connect(&server, "open", None).await?;

    // The right token is admitted.
    let client = Client::connect_with_token(&server, "t", None, Some("sekrit")).await?;
    assert!(!client.connection_id.is_empty());
    server.relay.destroy();
    Ok(())
}

#[tokio::test]
async fn ping_pong() -> anyhow::Result<()> {
    let server = RelayServer::start(spec_config()).await?;
    server.relay.registry.register("t", Tier::Free);

    let mut client = Client::connect(&server, "t", None).await?;
    client.send_json(serde_json::json!({"type": "ping"})).await?;
    let frame = client.next_frame().await?;
    assert_eq!(frame["type"], "pong");
    server.relay.destroy();
    Ok(())
}

#[tokio::test]
async fn bye_closes_the_connection() -> anyhow::Result<()> {
    let server = RelayServer::start(spec_config()).await?;
    server.relay.registry.register("t", Tier::Free);

    let client = Client::connect(&server, "t", None).await?;
    client.bye().await?;

    let relay = &server.relay;
    wait_until(|| relay.registry.metrics("t").map(|m| m.active_connections == 0).unwrap_or(false))
        .await?;
    server.relay.destroy();
    Ok(())
}

#[tokio::test]
async fn relay_error_comes_back_as_error_frame() -> anyhow::Result<()> {
    let server = RelayServer::start(RelayConfig {
        message_buffer_bytes: 4,
        ..spec_config()
    })
    .await?;
    server.relay.registry.register("t", Tier::Free);

    let mut client = Client::connect(&server, "t", None).await?;
    client.relay(Some("absent"), b"aa").await?;
    client.relay(Some("absent"), b"bb").await?;
    // Buffer is at its 4-byte ceiling; the next relay overflows.
    client.relay(Some("absent"), b"c").await?;

    let frame = client.next_frame().await?;
    assert_eq!(frame["type"], "error");
    assert_eq!(frame["code"], "BUFFER_FULL");

    let metrics =
        server.relay.registry.metrics("t").ok_or_else(|| anyhow::anyhow!("no tenant"))?;
    assert_eq!(metrics.buffered_messages, 2, "prior entries intact");
    server.relay.destroy();
    Ok(())
}

#[tokio::test]
async fn observer_stream_sees_lifecycle_events() -> anyhow::Result<()> {
    use futures_util::StreamExt;

    let server = RelayServer::start(spec_config()).await?;
    server.relay.registry.register("t", Tier::Free);

    let url = format!("{}?categories=client-connected&tenants=all", server.events_url());
    let (mut observer, _) = tokio_tungstenite::connect_async(url).await?;

    let client = Client::connect(&server, "t", None).await?;

    let msg = tokio::time::timeout(satchel_specs::TIMEOUT, observer.next())
        .await?
        .ok_or_else(|| anyhow::anyhow!("observer stream ended"))??;
    let text = match msg {
        tokio_tungstenite::tungstenite::Message::Text(text) => text.to_string(),
        other => anyhow::bail!("expected text, got {other:?}"),
    };
    let event: serde_json::Value = serde_json::from_str(&text)?;
    assert_eq!(event["type"], "client-connected");
    assert_eq!(event["tenant"], "t");
    assert_eq!(event["connection"], client.connection_id);
    server.relay.destroy();
    Ok(())
}

#[tokio::test]
async fn stop_closes_connections_and_flushes_webhooks() -> anyhow::Result<()> {
    let server = RelayServer::start(RelayConfig {
        drain_deadline_ms: 1_000,
        ..spec_config()
    })
    .await?;
    server.relay.registry.register("t", Tier::Free);
    let _client = Client::connect(&server, "t", None).await?;

    server.relay.stop().await.map_err(|e| anyhow::anyhow!("{e}"))?;

    assert_eq!(server.relay.registry.totals().connections, 0, "no connection stays open");
    assert!(server.relay.webhooks.idle(), "no webhook attempt outstanding");
    Ok(())
}
