// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Spec-test harness: an in-process relay on a real socket plus a minimal
//! wire-protocol client.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use satchel_relay::config::RelayConfig;
use satchel_relay::orchestrator::Relay;
use satchel_relay::transport::serve_on;

pub const TIMEOUT: Duration = Duration::from_secs(10);

/// An in-process relay bound to an ephemeral port.
pub struct RelayServer {
    pub relay: Arc<Relay>,
    pub addr: SocketAddr,
}

impl RelayServer {
    /// Start a relay with the given config on 127.0.0.1:0.
    pub async fn start(mut config: RelayConfig) -> anyhow::Result<Self> {
        config.port = 0;
        let relay = Arc::new(Relay::new(config).map_err(|e| anyhow::anyhow!("{e}"))?);
        Relay::start(&relay).map_err(|e| anyhow::anyhow!("{e}"))?;

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let serve_relay = Arc::clone(&relay);
        tokio::spawn(async move {
            if let Err(e) = serve_on(serve_relay, listener).await {
                tracing::error!("spec relay exited: {e}");
            }
        });

        Ok(Self { relay, addr })
    }

    pub fn ws_url(&self) -> String {
        format!("ws://{}/ws", self.addr)
    }

    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn events_url(&self) -> String {
        format!("ws://{}/ws/events", self.addr)
    }
}

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;
type WsStream = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

/// A connected wire-protocol client.
pub struct Client {
    tx: WsSink,
    rx: WsStream,
    pub connection_id: String,
}

impl Client {
    /// Open a socket, send HELLO, and wait for WELCOME. `resume` requests a
    /// specific connection id.
    pub async fn connect(
        server: &RelayServer,
        tenant: &str,
        resume: Option<&str>,
    ) -> anyhow::Result<Self> {
        Self::connect_with_token(server, tenant, resume, None).await
    }

    /// Like [`connect`](Self::connect) with a connect token in the query
    /// string, for tenants guarded by `--tenant-token`.
    pub async fn connect_with_token(
        server: &RelayServer,
        tenant: &str,
        resume: Option<&str>,
        token: Option<&str>,
    ) -> anyhow::Result<Self> {
        let url = match token {
            Some(token) => format!("{}?token={token}", server.ws_url()),
            None => server.ws_url(),
        };
        let (socket, _) = tokio_tungstenite::connect_async(url).await?;
        let (mut tx, mut rx) = socket.split();

        let mut hello = serde_json::json!({
            "type": "hello",
            "tenant_id": tenant,
            "client_version": "specs/0.1",
        });
        if let Some(id) = resume {
            hello["connection_id"] = serde_json::Value::String(id.to_owned());
        }
        tx.send(Message::Text(hello.to_string().into())).await?;

        let frame = next_json(&mut rx).await?;
        match frame["type"].as_str() {
            Some("welcome") => {
                let connection_id = frame["connection_id"]
                    .as_str()
                    .ok_or_else(|| anyhow::anyhow!("welcome without connection_id"))?
                    .to_owned();
                Ok(Self { tx, rx, connection_id })
            }
            Some("error") => anyhow::bail!(
                "admission refused: {} ({})",
                frame["code"].as_str().unwrap_or("?"),
                frame["message"].as_str().unwrap_or("")
            ),
            other => anyhow::bail!("expected welcome, got {other:?}"),
        }
    }

    /// Like [`connect`](Self::connect) but returns the raw refusal frame.
    pub async fn connect_expect_error(
        server: &RelayServer,
        tenant: &str,
    ) -> anyhow::Result<serde_json::Value> {
        let (socket, _) = tokio_tungstenite::connect_async(server.ws_url()).await?;
        let (mut tx, mut rx) = socket.split();
        let hello = serde_json::json!({"type": "hello", "tenant_id": tenant});
        tx.send(Message::Text(hello.to_string().into())).await?;
        let frame = next_json(&mut rx).await?;
        anyhow::ensure!(frame["type"] == "error", "expected error frame, got {frame}");
        Ok(frame)
    }

    /// Send a RELAY frame. Payload travels base64-encoded.
    pub async fn relay(&mut self, target: Option<&str>, payload: &[u8]) -> anyhow::Result<()> {
        use base64::Engine as _;
        let mut frame = serde_json::json!({
            "type": "relay",
            "payload": base64::engine::general_purpose::STANDARD.encode(payload),
        });
        if let Some(target) = target {
            frame["target"] = serde_json::Value::String(target.to_owned());
        }
        self.tx.send(Message::Text(frame.to_string().into())).await?;
        Ok(())
    }

    pub async fn send_json(&mut self, frame: serde_json::Value) -> anyhow::Result<()> {
        self.tx.send(Message::Text(frame.to_string().into())).await?;
        Ok(())
    }

    /// Next server frame, with timeout.
    pub async fn next_frame(&mut self) -> anyhow::Result<serde_json::Value> {
        next_json(&mut self.rx).await
    }

    /// Next DELIVER frame, decoded. Fails on anything else.
    pub async fn expect_deliver(&mut self) -> anyhow::Result<(Option<String>, Vec<u8>)> {
        use base64::Engine as _;
        let frame = self.next_frame().await?;
        anyhow::ensure!(frame["type"] == "deliver", "expected deliver, got {frame}");
        let payload = base64::engine::general_purpose::STANDARD
            .decode(frame["payload"].as_str().unwrap_or_default())?;
        Ok((frame["from"].as_str().map(String::from), payload))
    }

    pub async fn bye(mut self) -> anyhow::Result<()> {
        self.tx
            .send(Message::Text(serde_json::json!({"type": "bye"}).to_string().into()))
            .await?;
        Ok(())
    }
}

async fn next_json(rx: &mut WsStream) -> anyhow::Result<serde_json::Value> {
    let deadline = tokio::time::Instant::now() + TIMEOUT;
    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        let msg = tokio::time::timeout(remaining, rx.next())
            .await
            .map_err(|_| anyhow::anyhow!("timed out waiting for server frame"))?
            .ok_or_else(|| anyhow::anyhow!("socket closed"))?;
        match msg? {
            Message::Text(text) => return Ok(serde_json::from_str(&text)?),
            Message::Close(_) => anyhow::bail!("socket closed by server"),
            _ => {}
        }
    }
}

/// Poll until `check` passes or the timeout hits.
pub async fn wait_until(check: impl Fn() -> bool) -> anyhow::Result<()> {
    let deadline = tokio::time::Instant::now() + TIMEOUT;
    while !check() {
        anyhow::ensure!(tokio::time::Instant::now() <= deadline, "condition not reached");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    Ok(())
}
