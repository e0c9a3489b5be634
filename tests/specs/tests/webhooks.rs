// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! End-to-end event distribution: a relayed message surfaces on the bus as
//! `relay.message-relayed` and lands on a registered webhook endpoint,
//! signed and addressed.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::post;
use axum::Router;

use satchel_relay::config::RelayConfig;
use satchel_relay::registry::Tier;
use satchel_relay::webhook::sign;

use satchel_specs::{wait_until, Client, RelayServer};

#[derive(Clone)]
struct HookState {
    hits: Arc<AtomicU32>,
    last: Arc<std::sync::Mutex<Option<(HeaderMap, Vec<u8>)>>>,
    fail_first: Arc<AtomicU32>,
}

async fn hook(
    State(state): State<HookState>,
    headers: HeaderMap,
    body: axum::body::Bytes,
) -> StatusCode {
    state.hits.fetch_add(1, Ordering::SeqCst);
    if let Ok(mut last) = state.last.lock() {
        *last = Some((headers, body.to_vec()));
    }
    if state.fail_first.load(Ordering::SeqCst) > 0 {
        state.fail_first.fetch_sub(1, Ordering::SeqCst);
        return StatusCode::SERVICE_UNAVAILABLE;
    }
    StatusCode::OK
}

async fn start_receiver(fail_first: u32) -> anyhow::Result<(String, HookState)> {
    let state = HookState {
        hits: Arc::new(AtomicU32::new(0)),
        last: Arc::new(std::sync::Mutex::new(None)),
        fail_first: Arc::new(AtomicU32::new(fail_first)),
    };
    let app = Router::new().route("/hook", post(hook)).with_state(state.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    Ok((format!("http://{addr}/hook"), state))
}

fn spec_config() -> RelayConfig {
    RelayConfig {
        idle_sweep_ms: 60_000,
        buffer_sweep_ms: 60_000,
        health_check_interval_ms: 60_000,
        metrics_interval_ms: 60_000,
        dlq_sweep_ms: 60_000,
        webhook_base_backoff_ms: 10,
        webhook_max_backoff_ms: 50,
        webhook_jitter_pct: 0,
        ..RelayConfig::default()
    }
}

#[tokio::test]
async fn relayed_message_reaches_webhook_signed() -> anyhow::Result<()> {
    let (url, hook_state) = start_receiver(0).await?;
    let server = RelayServer::start(spec_config()).await?;
    server.relay.registry.register("t", Tier::Pro);

    let registration = server
        .relay
        .webhooks
        .register(&url, "relay.message-relayed", None, None)
        .map_err(|e| anyhow::anyhow!(e))?;

    let mut sender = Client::connect(&server, "t", None).await?;
    let mut receiver = Client::connect(&server, "t", None).await?;
    sender.relay(Some(&receiver.connection_id), b"sync-me").await?;
    receiver.expect_deliver().await?;

    let hits = Arc::clone(&hook_state.hits);
    wait_until(move || hits.load(Ordering::SeqCst) >= 1).await?;

    let last = hook_state.last.lock().map_err(|_| anyhow::anyhow!("poisoned"))?;
    let (headers, body) =
        last.as_ref().ok_or_else(|| anyhow::anyhow!("no delivery captured"))?;
    assert_eq!(
        headers.get("x-topic").and_then(|v| v.to_str().ok()),
        Some("relay.message-relayed")
    );

    // The signature verifies with the secret returned at registration.
    let sig_header = headers
        .get("x-signature")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| anyhow::anyhow!("missing signature"))?;
    let (t_part, v_part) =
        sig_header.split_once(',').ok_or_else(|| anyhow::anyhow!("bad signature header"))?;
    let ts: u64 = t_part.trim_start_matches("t=").parse()?;
    let sig = v_part.trim_start_matches("v1=");
    assert!(sign::verify(&registration.secret, ts, body, sig));

    // The JSON body names the relayed tenant.
    let parsed: serde_json::Value = serde_json::from_slice(body)?;
    use base64::Engine as _;
    let inner = base64::engine::general_purpose::STANDARD
        .decode(parsed["payload"].as_str().unwrap_or_default())?;
    let event: serde_json::Value = serde_json::from_slice(&inner)?;
    assert_eq!(event["type"], "message-relayed");
    assert_eq!(event["tenant"], "t");

    server.relay.destroy();
    Ok(())
}

#[tokio::test]
async fn transient_failures_retry_to_success() -> anyhow::Result<()> {
    let (url, hook_state) = start_receiver(2).await?;
    let server = RelayServer::start(spec_config()).await?;
    server.relay.registry.register("t", Tier::Pro);
    server
        .relay
        .webhooks
        .register(&url, "relay.client-connected", None, None)
        .map_err(|e| anyhow::anyhow!(e))?;

    let _client = Client::connect(&server, "t", None).await?;

    // Two 503s then success: three attempts total, nothing dead-lettered.
    let hits = Arc::clone(&hook_state.hits);
    wait_until(move || hits.load(Ordering::SeqCst) >= 3).await?;
    wait_until(|| server.relay.webhooks.idle()).await?;
    assert!(server.relay.dlq.is_empty());

    server.relay.destroy();
    Ok(())
}
