// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Credential checks for the admin API, observer stream, and client
//! admission.
//!
//! Two layers: a shared token gating the HTTP surface and observer stream,
//! and optional per-tenant connect tokens checked during the HELLO
//! handshake (the tenant is only known once HELLO arrives, so client
//! sockets are authorized post-handshake rather than at upgrade). A tenant
//! without its own token falls back to the shared token; with nothing
//! configured, auth is disabled. Token comparisons go through ring's
//! constant-time primitive.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::State;
use axum::http::{HeaderMap, Request, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};

use crate::config::RelayConfig;
use crate::error::ApiError;
use crate::orchestrator::Relay;

/// Pre-shared credentials, resolved once from config.
pub struct RelayAuth {
    shared_token: Option<String>,
    tenant_tokens: HashMap<String, String>,
}

impl RelayAuth {
    pub fn from_config(config: &RelayConfig) -> Self {
        Self {
            shared_token: config.auth_token.clone(),
            tenant_tokens: config.tenant_token.iter().cloned().collect(),
        }
    }

    /// Whether any credential is configured at all.
    pub fn enabled(&self) -> bool {
        self.shared_token.is_some() || !self.tenant_tokens.is_empty()
    }

    fn token_eq(presented: &str, expected: &str) -> bool {
        ring::constant_time::verify_slices_are_equal(presented.as_bytes(), expected.as_bytes())
            .is_ok()
    }

    /// Admin surface: `Authorization: Bearer <shared token>`.
    pub fn authorize_admin(&self, headers: &HeaderMap) -> Result<(), ApiError> {
        let Some(expected) = self.shared_token.as_deref() else {
            return Ok(());
        };
        let presented = bearer_token(headers).ok_or(ApiError::Unauthorized)?;
        if Self::token_eq(presented, expected) {
            Ok(())
        } else {
            Err(ApiError::Unauthorized)
        }
    }

    /// Observer stream: shared token via the `?token=` query parameter.
    pub fn authorize_observer(&self, presented: Option<&str>) -> Result<(), ApiError> {
        let Some(expected) = self.shared_token.as_deref() else {
            return Ok(());
        };
        match presented {
            Some(token) if Self::token_eq(token, expected) => Ok(()),
            _ => Err(ApiError::Unauthorized),
        }
    }

    /// Client admission: the HELLO'd tenant's own connect token when one is
    /// registered, otherwise the shared token.
    pub fn authorize_tenant(
        &self,
        tenant_id: &str,
        presented: Option<&str>,
    ) -> Result<(), ApiError> {
        let expected = match self.tenant_tokens.get(tenant_id) {
            Some(token) => Some(token.as_str()),
            None => self.shared_token.as_deref(),
        };
        let Some(expected) = expected else {
            return Ok(());
        };
        match presented {
            Some(token) if Self::token_eq(token, expected) => Ok(()),
            _ => Err(ApiError::Unauthorized),
        }
    }
}

/// Pull the token out of an `Authorization: Bearer ...` header.
fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers.get("authorization")?.to_str().ok()?.strip_prefix("Bearer ")
}

/// Axum middleware enforcing admin bearer auth.
///
/// Exempt: `/api/v1/health` and WebSocket upgrades (`/ws`); client sockets
/// are authorized per tenant after HELLO, observers via query param.
pub async fn auth_layer(
    state: State<Arc<Relay>>,
    req: Request<axum::body::Body>,
    next: Next,
) -> Response {
    let path = req.uri().path();

    if path == "/api/v1/health" || path == "/ws" || path.starts_with("/ws/") {
        return next.run(req).await;
    }

    if let Err(code) = state.auth.authorize_admin(req.headers()) {
        let body = crate::error::ErrorResponse { error: code.to_error_body("unauthorized") };
        return (
            StatusCode::from_u16(code.http_status()).unwrap_or(StatusCode::UNAUTHORIZED),
            axum::Json(body),
        )
            .into_response();
    }

    next.run(req).await
}

#[cfg(test)]
#[path = "auth_tests.rs"]
mod tests;
