// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Client WebSocket sessions: HELLO handshake, RELAY ingest, DELIVER fan-in.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::response::IntoResponse;
use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::{AdmissionError, ApiError};
use crate::events::{epoch_ms, DisconnectReason};
use crate::orchestrator::Relay;
use crate::registry::{ConnectionSink, SinkStatus};
use crate::transport::frame::{ClientFrame, ServerFrame};

/// How long a client may sit on an open socket before sending HELLO.
const HELLO_TIMEOUT: Duration = Duration::from_secs(10);

/// Outbound frames queued per connection before the transport reports
/// saturation back to the router.
const OUTBOX_DEPTH: usize = 256;

/// Query parameters for the client WebSocket.
#[derive(Debug, Clone, Deserialize)]
pub struct WsQuery {
    pub token: Option<String>,
}

/// Sink handed to the relay core; delivers via the connection's outbox.
struct WsSink {
    tx: mpsc::Sender<ServerFrame>,
    closed: CancellationToken,
}

impl ConnectionSink for WsSink {
    fn try_deliver(&self, from: Option<&str>, payload: &Bytes) -> SinkStatus {
        let frame =
            ServerFrame::Deliver { from: from.map(String::from), payload: payload.clone() };
        match self.tx.try_send(frame) {
            Ok(()) => SinkStatus::Accepted,
            Err(mpsc::error::TrySendError::Full(_)) => SinkStatus::Saturated,
            Err(mpsc::error::TrySendError::Closed(_)) => SinkStatus::Gone,
        }
    }

    fn close(&self) {
        self.closed.cancel();
    }
}

/// `GET /ws` — WebSocket upgrade for relay clients.
///
/// The connect token rides the query string, but which credential it must
/// match depends on the tenant named in HELLO, so authorization happens
/// after the handshake.
pub async fn ws_handler(
    State(relay): State<Arc<Relay>>,
    Query(query): Query<WsQuery>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_ws(relay, query.token, socket)).into_response()
}

async fn handle_ws(relay: Arc<Relay>, token: Option<String>, socket: WebSocket) {
    let (mut ws_tx, mut ws_rx) = socket.split();

    // Handshake: the first frame must be HELLO, within the timeout.
    let hello = tokio::time::timeout(HELLO_TIMEOUT, next_client_frame(&mut ws_rx)).await;
    let (tenant_id, requested_id) = match hello {
        Ok(Some(ClientFrame::Hello { tenant_id, connection_id, client_version })) => {
            if let Some(version) = client_version {
                tracing::debug!(tenant = %tenant_id, version = %version, "client hello");
            }
            (tenant_id, connection_id)
        }
        Ok(Some(_)) => {
            send_error(&mut ws_tx, "PROTOCOL", "expected hello").await;
            return;
        }
        Ok(None) => return,
        Err(_) => {
            send_error(&mut ws_tx, "PROTOCOL", "hello timeout").await;
            return;
        }
    };

    if relay.auth.authorize_tenant(&tenant_id, token.as_deref()).is_err() {
        tracing::debug!(tenant = %tenant_id, "client presented no valid connect token");
        send_error(
            &mut ws_tx,
            ApiError::Unauthorized.as_str(),
            "invalid connect token for tenant",
        )
        .await;
        return;
    }

    let (outbox_tx, mut outbox_rx) = mpsc::channel::<ServerFrame>(OUTBOX_DEPTH);
    let closed = CancellationToken::new();
    let sink = Arc::new(WsSink { tx: outbox_tx, closed: closed.clone() });

    let admitted = match relay.connections.connect_with_id(&tenant_id, requested_id, sink) {
        Ok(admitted) => admitted,
        Err(e) => {
            send_error(&mut ws_tx, e.as_str(), admission_message(&e)).await;
            return;
        }
    };
    let connection_id = admitted.connection_id.clone();

    let welcome =
        ServerFrame::Welcome { connection_id: connection_id.clone(), server_time: epoch_ms() };
    if send_frame(&mut ws_tx, &welcome).await.is_err() {
        relay.connections.disconnect(&tenant_id, &connection_id, DisconnectReason::TransportError);
        return;
    }

    let mut reason = DisconnectReason::TransportError;
    loop {
        tokio::select! {
            _ = closed.cancelled() => {
                // Core-side close (tenant removal, idle sweep, shutdown);
                // the disconnect bookkeeping already happened there.
                let _ = ws_tx.send(Message::Close(None)).await;
                return;
            }
            _ = relay.shutdown.cancelled() => {
                reason = DisconnectReason::Shutdown;
                break;
            }

            // Core -> client.
            frame = outbox_rx.recv() => {
                match frame {
                    Some(frame) => {
                        if send_frame(&mut ws_tx, &frame).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }

            // Client -> core.
            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<ClientFrame>(&text) {
                            Ok(frame) => {
                                if handle_client_frame(&relay, &tenant_id, &connection_id, frame, &mut ws_tx).await {
                                    reason = DisconnectReason::ClientRequest;
                                    break;
                                }
                            }
                            Err(e) => {
                                send_error(&mut ws_tx, "PROTOCOL", format!("bad frame: {e}")).await;
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        reason = DisconnectReason::ClientRequest;
                        break;
                    }
                    Some(Err(_)) => break,
                    _ => {}
                }
            }
        }
    }

    relay.connections.disconnect(&tenant_id, &connection_id, reason);
}

/// Process one parsed client frame. Returns true when the client said BYE.
async fn handle_client_frame(
    relay: &Arc<Relay>,
    tenant_id: &str,
    connection_id: &str,
    frame: ClientFrame,
    ws_tx: &mut SplitSink<WebSocket, Message>,
) -> bool {
    match frame {
        ClientFrame::Relay { target, payload } => {
            let result = relay.router.relay(tenant_id, connection_id, payload, target.as_deref());
            if let Err(e) = result {
                send_error(ws_tx, e.as_str(), format!("relay failed: {e}")).await;
            }
            false
        }
        ClientFrame::Ping => {
            relay.connections.touch(tenant_id, connection_id);
            let _ = send_frame(ws_tx, &ServerFrame::Pong).await;
            false
        }
        ClientFrame::Pong => false,
        ClientFrame::Bye { reason } => {
            if let Some(reason) = reason {
                tracing::debug!(connection = %connection_id, reason = %reason, "client bye");
            }
            true
        }
        ClientFrame::Hello { .. } => {
            send_error(ws_tx, "PROTOCOL", "already connected").await;
            false
        }
    }
}

async fn next_client_frame(ws_rx: &mut SplitStream<WebSocket>) -> Option<ClientFrame> {
    while let Some(msg) = ws_rx.next().await {
        match msg {
            Ok(Message::Text(text)) => return serde_json::from_str(&text).ok(),
            Ok(Message::Close(_)) | Err(_) => return None,
            _ => {}
        }
    }
    None
}

async fn send_frame(
    ws_tx: &mut SplitSink<WebSocket, Message>,
    frame: &ServerFrame,
) -> Result<(), axum::Error> {
    match serde_json::to_string(frame) {
        Ok(json) => ws_tx.send(Message::Text(json.into())).await,
        Err(_) => Ok(()),
    }
}

async fn send_error(
    ws_tx: &mut SplitSink<WebSocket, Message>,
    code: &str,
    message: impl Into<String>,
) {
    let frame = ServerFrame::Error { code: code.to_owned(), message: message.into() };
    let _ = send_frame(ws_tx, &frame).await;
}

fn admission_message(error: &AdmissionError) -> String {
    match error {
        AdmissionError::UnknownTenant => "tenant is not registered".to_owned(),
        AdmissionError::CapExceeded { limit } => {
            format!("tenant connection cap reached ({limit})")
        }
        AdmissionError::RateLimited => "connect rate exceeded".to_owned(),
        AdmissionError::Draining => "relay is draining".to_owned(),
    }
}
