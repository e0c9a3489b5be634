// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! HTTP handlers for the relay admin and observability API.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::response::IntoResponse;
use axum::Json;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::bus::dlq::DeadLetterEntry;
use crate::bus::{Event, EventMeta, PublishOptions};
use crate::error::ApiError;
use crate::events::epoch_ms;
use crate::metrics::MetricsSnapshot;
use crate::orchestrator::{Phase, Relay};
use crate::registry::{TenantMetrics, Tier};
use crate::trigger::{TriggerAction, TriggerRuleView};
use crate::webhook::{RetryPolicy, WebhookView};

// -- Request/Response types ---------------------------------------------------

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub uptime_ms: u64,
    pub tenants: usize,
    pub connections: usize,
}

#[derive(Debug, Deserialize)]
pub struct RegisterTenantRequest {
    pub tenant_id: String,
    pub tier: Tier,
}

#[derive(Debug, Serialize)]
pub struct RegisterTenantResponse {
    pub tenant_id: String,
    pub tier: Tier,
    pub outcome: String,
}

#[derive(Debug, Serialize)]
pub struct RemoveResponse {
    pub id: String,
    pub removed: bool,
}

#[derive(Debug, Deserialize)]
pub struct RegisterWebhookRequest {
    pub url: String,
    pub pattern: String,
    /// Server-generated when omitted; returned once.
    #[serde(default)]
    pub secret: Option<String>,
    #[serde(default)]
    pub max_attempts: Option<u32>,
    #[serde(default)]
    pub base_backoff_ms: Option<u64>,
    #[serde(default)]
    pub max_backoff_ms: Option<u64>,
    #[serde(default)]
    pub jitter_pct: Option<u8>,
}

#[derive(Debug, Serialize)]
pub struct RegisterWebhookResponse {
    pub id: String,
    pub url: String,
    pub pattern: String,
    pub secret: String,
}

#[derive(Debug, Deserialize)]
pub struct InstallTriggerRequest {
    #[serde(default)]
    pub id: Option<String>,
    pub pattern: String,
    /// Topic to re-publish matched events onto.
    pub topic: String,
}

#[derive(Debug, Serialize)]
pub struct InstallTriggerResponse {
    pub id: String,
}

#[derive(Debug, Deserialize)]
pub struct PublishRequest {
    pub topic: String,
    /// Base64 payload bytes.
    pub payload: String,
    #[serde(default)]
    pub content_type: Option<String>,
    #[serde(default)]
    pub correlation_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct PublishResponse {
    pub topic: String,
    pub sequence: u64,
}

#[derive(Debug, Deserialize)]
pub struct ReplayQuery {
    #[serde(default = "default_from")]
    pub from: u64,
    #[serde(default)]
    pub to: Option<u64>,
}

fn default_from() -> u64 {
    1
}

#[derive(Debug, Serialize)]
pub struct ReplayedEvent {
    pub sequence: u64,
    pub timestamp_ms: u64,
    pub content_type: String,
    /// Base64 payload bytes.
    pub payload: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
}

// -- Handlers -----------------------------------------------------------------

/// `GET /api/v1/health`
pub async fn health(State(relay): State<Arc<Relay>>) -> impl IntoResponse {
    let totals = relay.registry.totals();
    Json(HealthResponse {
        status: relay.phase().as_str().to_owned(),
        uptime_ms: relay.metrics.uptime_ms(epoch_ms()),
        tenants: totals.tenants,
        connections: totals.connections,
    })
}

/// `GET /api/v1/metrics`
pub async fn metrics(State(relay): State<Arc<Relay>>) -> Json<MetricsSnapshot> {
    Json(relay.snapshot())
}

/// `POST /api/v1/tenants` — register (or re-tier) a tenant.
pub async fn register_tenant(
    State(relay): State<Arc<Relay>>,
    Json(req): Json<RegisterTenantRequest>,
) -> impl IntoResponse {
    if relay.phase() != Phase::Running {
        return ApiError::Draining.to_http_response("relay is not accepting registrations").into_response();
    }
    if req.tenant_id.is_empty() {
        return ApiError::BadRequest.to_http_response("tenant_id must not be empty").into_response();
    }
    let outcome = match relay.registry.register(&req.tenant_id, req.tier) {
        crate::registry::RegisterOutcome::Created => "created",
        crate::registry::RegisterOutcome::Unchanged => "unchanged",
        crate::registry::RegisterOutcome::TierChanged { .. } => "tier_changed",
    };
    Json(RegisterTenantResponse {
        tenant_id: req.tenant_id,
        tier: req.tier,
        outcome: outcome.to_owned(),
    })
    .into_response()
}

/// `GET /api/v1/tenants`
pub async fn list_tenants(State(relay): State<Arc<Relay>>) -> Json<Vec<TenantMetrics>> {
    let metrics =
        relay.registry.list().iter().filter_map(|h| relay.registry.metrics(&h.id)).collect();
    Json(metrics)
}

/// `DELETE /api/v1/tenants/{id}`
pub async fn remove_tenant(
    State(relay): State<Arc<Relay>>,
    Path(tenant_id): Path<String>,
) -> impl IntoResponse {
    let removed = relay.registry.remove(&tenant_id);
    if removed {
        relay.limiter.forget(&tenant_id);
        Json(RemoveResponse { id: tenant_id, removed: true }).into_response()
    } else {
        ApiError::TenantNotFound.to_http_response("no such tenant").into_response()
    }
}

/// `GET /api/v1/tenants/{id}/metrics`
pub async fn tenant_metrics(
    State(relay): State<Arc<Relay>>,
    Path(tenant_id): Path<String>,
) -> impl IntoResponse {
    match relay.registry.metrics(&tenant_id) {
        Some(metrics) => Json(metrics).into_response(),
        None => ApiError::TenantNotFound.to_http_response("no such tenant").into_response(),
    }
}

/// `POST /api/v1/webhooks` — register an endpoint. The secret appears only
/// in this response.
pub async fn register_webhook(
    State(relay): State<Arc<Relay>>,
    Json(req): Json<RegisterWebhookRequest>,
) -> impl IntoResponse {
    let retry = match (req.max_attempts, req.base_backoff_ms, req.max_backoff_ms, req.jitter_pct) {
        (None, None, None, None) => None,
        (attempts, base, max, jitter) => {
            let default = relay.config.webhook_config().retry;
            Some(RetryPolicy {
                max_attempts: attempts.unwrap_or(default.max_attempts),
                base_backoff_ms: base.unwrap_or(default.base_backoff_ms),
                max_backoff_ms: max.unwrap_or(default.max_backoff_ms),
                jitter_pct: jitter.unwrap_or(default.jitter_pct),
            })
        }
    };
    match relay.webhooks.register(&req.url, &req.pattern, req.secret, retry) {
        Ok(reg) => Json(RegisterWebhookResponse {
            id: reg.id,
            url: reg.url,
            pattern: reg.pattern.as_str().to_owned(),
            secret: reg.secret,
        })
        .into_response(),
        Err(e) => ApiError::BadRequest.to_http_response(e).into_response(),
    }
}

/// `GET /api/v1/webhooks` — list registrations (secrets redacted).
pub async fn list_webhooks(State(relay): State<Arc<Relay>>) -> Json<Vec<WebhookView>> {
    Json(relay.webhooks.stats(None))
}

/// `DELETE /api/v1/webhooks/{id}`
pub async fn unregister_webhook(
    State(relay): State<Arc<Relay>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    if relay.webhooks.unregister(&id) {
        Json(RemoveResponse { id, removed: true }).into_response()
    } else {
        ApiError::WebhookNotFound.to_http_response("no such webhook").into_response()
    }
}

/// `GET /api/v1/webhooks/{id}/stats`
pub async fn webhook_stats(
    State(relay): State<Arc<Relay>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match relay.webhooks.stats(Some(&id)).pop() {
        Some(view) => Json(view).into_response(),
        None => ApiError::WebhookNotFound.to_http_response("no such webhook").into_response(),
    }
}

/// `POST /api/v1/triggers` — install a bus-republish rule. Predicate-bearing
/// rules are a library-level feature; HTTP rules match on pattern alone.
pub async fn install_trigger(
    State(relay): State<Arc<Relay>>,
    Json(req): Json<InstallTriggerRequest>,
) -> impl IntoResponse {
    let action = TriggerAction::Bus { topic: req.topic };
    match relay.triggers.install_rule(req.id, &req.pattern, None, action) {
        Ok(id) => Json(InstallTriggerResponse { id }).into_response(),
        Err(e) => ApiError::BadRequest.to_http_response(e).into_response(),
    }
}

/// `GET /api/v1/triggers`
pub async fn list_triggers(State(relay): State<Arc<Relay>>) -> Json<Vec<TriggerRuleView>> {
    Json(relay.triggers.list_rules())
}

/// `DELETE /api/v1/triggers/{id}`
pub async fn remove_trigger(
    State(relay): State<Arc<Relay>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    if relay.triggers.remove_rule(&id) {
        Json(RemoveResponse { id, removed: true }).into_response()
    } else {
        ApiError::RuleNotFound.to_http_response("no such rule").into_response()
    }
}

/// `GET /api/v1/replay/{topic}?from=&to=` — retained events for a topic.
/// A `from` older than the retained window is an error, not a short answer.
pub async fn replay(
    State(relay): State<Arc<Relay>>,
    Path(topic): Path<String>,
    axum::extract::Query(query): axum::extract::Query<ReplayQuery>,
) -> impl IntoResponse {
    match relay.bus.replay(&topic, query.from, query.to) {
        Ok(events) => {
            let replayed: Vec<ReplayedEvent> = events
                .iter()
                .map(|e| ReplayedEvent {
                    sequence: e.meta.sequence,
                    timestamp_ms: e.meta.timestamp_ms,
                    content_type: e.meta.content_type.clone(),
                    payload: BASE64.encode(&e.payload),
                    correlation_id: e.meta.correlation_id.clone(),
                })
                .collect();
            Json(replayed).into_response()
        }
        Err(e) => ApiError::BadRequest.to_http_response(e.to_string()).into_response(),
    }
}

/// `GET /api/v1/dlq` — current dead-letter entries, oldest first.
pub async fn dlq(State(relay): State<Arc<Relay>>) -> Json<Vec<DeadLetterEntry>> {
    Json(relay.dlq.snapshot())
}

/// `POST /api/v1/publish` — publish onto the bus and run trigger rules.
/// This is the host database's integration point for change events.
pub async fn publish(
    State(relay): State<Arc<Relay>>,
    Json(req): Json<PublishRequest>,
) -> impl IntoResponse {
    if relay.phase() != Phase::Running {
        return ApiError::Draining.to_http_response("relay is not accepting publishes").into_response();
    }
    let payload = match BASE64.decode(req.payload.as_bytes()) {
        Ok(bytes) => Bytes::from(bytes),
        Err(_) => {
            return ApiError::BadRequest.to_http_response("payload must be base64").into_response()
        }
    };
    let content_type =
        req.content_type.unwrap_or_else(|| "application/octet-stream".to_owned());
    let options = PublishOptions {
        content_type: Some(content_type.clone()),
        correlation_id: req.correlation_id.clone(),
        hops: 0,
    };
    let sequence = match relay.bus.publish(&req.topic, payload.clone(), options) {
        Ok(sequence) => sequence,
        Err(e) => return ApiError::Internal.to_http_response(e.to_string()).into_response(),
    };
    let event = Arc::new(Event {
        meta: EventMeta {
            topic: req.topic.clone(),
            sequence,
            timestamp_ms: epoch_ms(),
            content_type,
            correlation_id: req.correlation_id,
            hops: 0,
        },
        payload,
    });
    relay.triggers.ingest(&event);
    Json(PublishResponse { topic: req.topic, sequence }).into_response()
}
