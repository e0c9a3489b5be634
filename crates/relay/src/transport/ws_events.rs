// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Observer WebSocket — streams relay lifecycle events to dashboards over a
//! single `/ws/events` connection, with category and tenant filtering.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::response::IntoResponse;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;

use crate::events::RelayEvent;
use crate::orchestrator::Relay;

/// Query parameters for the observer stream.
#[derive(Debug, Deserialize)]
pub struct EventsQuery {
    /// Auth token.
    pub token: Option<String>,
    /// Comma-separated event categories, or "all" (default).
    #[serde(default = "default_all")]
    pub categories: String,
    /// Comma-separated tenant ids, or "all" (default). Tenant-scoped events
    /// outside the list are dropped; unscoped events always pass.
    #[serde(default = "default_all")]
    pub tenants: String,
}

fn default_all() -> String {
    "all".to_owned()
}

/// Parsed observer subscription preferences.
pub struct EventFilter {
    all_categories: bool,
    categories: Vec<String>,
    all_tenants: bool,
    tenants: Vec<String>,
}

impl EventFilter {
    pub fn new(categories_csv: &str, tenants_csv: &str) -> Self {
        let all_categories = categories_csv == "all";
        let all_tenants = tenants_csv == "all";
        Self {
            all_categories,
            categories: if all_categories {
                vec![]
            } else {
                categories_csv.split(',').map(|s| s.trim().to_owned()).collect()
            },
            all_tenants,
            tenants: if all_tenants {
                vec![]
            } else {
                tenants_csv.split(',').map(|s| s.trim().to_owned()).collect()
            },
        }
    }

    /// Whether the filter accepts this event.
    pub fn wants(&self, event: &RelayEvent) -> bool {
        if !self.all_categories && !self.categories.iter().any(|c| c == event.category()) {
            return false;
        }
        match event.tenant() {
            Some(tenant) => self.all_tenants || self.tenants.iter().any(|t| t == tenant),
            None => true,
        }
    }
}

/// `GET /ws/events` — WebSocket upgrade for the observer stream.
pub async fn ws_events_handler(
    State(relay): State<Arc<Relay>>,
    Query(query): Query<EventsQuery>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    if relay.auth.authorize_observer(query.token.as_deref()).is_err() {
        return axum::http::Response::builder()
            .status(401)
            .body(axum::body::Body::from("unauthorized"))
            .unwrap_or_default()
            .into_response();
    }

    let filter = EventFilter::new(&query.categories, &query.tenants);
    ws.on_upgrade(move |socket| handle_events(relay, filter, socket)).into_response()
}

/// Per-connection loop. Lagging observers skip events rather than slow the
/// hub; a closed hub or socket ends the stream.
async fn handle_events(relay: Arc<Relay>, filter: EventFilter, socket: WebSocket) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let mut events_rx = relay.events.subscribe();

    loop {
        tokio::select! {
            _ = relay.shutdown.cancelled() => {
                let _ = ws_tx.send(Message::Close(None)).await;
                break;
            }
            event = events_rx.recv() => {
                let event = match event {
                    Ok(event) => event,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                };
                if filter.wants(&event) {
                    if let Ok(json) = serde_json::to_string(&event) {
                        if ws_tx.send(Message::Text(json.into())).await.is_err() {
                            break;
                        }
                    }
                }
            }
            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Close(_))) | None => break,
                    _ => {}
                }
            }
        }
    }
}

#[cfg(test)]
#[path = "ws_events_tests.rs"]
mod tests;
