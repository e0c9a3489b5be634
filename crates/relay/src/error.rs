// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Error taxonomy for the relay core.
//!
//! Each domain gets its own plain enum with a stable machine-readable code.
//! Admission errors are returned to callers; delivery failures inside the bus
//! and webhook paths are never propagated to publishers — they surface as
//! events and dead-letter entries instead.

use std::fmt;

use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};

// -- Admission ----------------------------------------------------------------

/// Why a connection attempt was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmissionError {
    UnknownTenant,
    CapExceeded { limit: u32 },
    RateLimited,
    Draining,
}

impl AdmissionError {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::UnknownTenant => "UNKNOWN_TENANT",
            Self::CapExceeded { .. } => "CAP_EXCEEDED",
            Self::RateLimited => "RATE_LIMITED",
            Self::Draining => "DRAINING",
        }
    }

    pub fn http_status(&self) -> u16 {
        match self {
            Self::UnknownTenant => 404,
            Self::CapExceeded { .. } => 429,
            Self::RateLimited => 429,
            Self::Draining => 503,
        }
    }
}

impl fmt::Display for AdmissionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// -- Relay --------------------------------------------------------------------

/// Why a relayed message was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayError {
    UnknownSender,
    BufferFull,
    PayloadTooLarge,
    RateLimited,
}

impl RelayError {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::UnknownSender => "UNKNOWN_SENDER",
            Self::BufferFull => "BUFFER_FULL",
            Self::PayloadTooLarge => "PAYLOAD_TOO_LARGE",
            Self::RateLimited => "RATE_LIMITED",
        }
    }
}

impl fmt::Display for RelayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// -- Bus ----------------------------------------------------------------------

/// Errors returned by event-bus operations. Handler and filter failures are
/// never returned; they are counted and dead-lettered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusError {
    /// The requested replay range starts before the retained window.
    ReplayTruncated { oldest_retained: u64 },
    /// The bus has been shut down.
    Closed,
}

impl BusError {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ReplayTruncated { .. } => "REPLAY_TRUNCATED",
            Self::Closed => "BUS_CLOSED",
        }
    }
}

impl fmt::Display for BusError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// -- Lifecycle ----------------------------------------------------------------

/// Orchestrator state-machine violations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleError {
    NotStarted,
    AlreadyStopped,
    Destroyed,
}

impl LifecycleError {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotStarted => "NOT_STARTED",
            Self::AlreadyStopped => "ALREADY_STOPPED",
            Self::Destroyed => "DESTROYED",
        }
    }
}

impl fmt::Display for LifecycleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// -- HTTP surface -------------------------------------------------------------

/// Error codes for the admin API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ApiError {
    Unauthorized,
    BadRequest,
    TenantNotFound,
    WebhookNotFound,
    RuleNotFound,
    Draining,
    Internal,
}

impl ApiError {
    pub fn http_status(&self) -> u16 {
        match self {
            Self::Unauthorized => 401,
            Self::BadRequest => 400,
            Self::TenantNotFound | Self::WebhookNotFound | Self::RuleNotFound => 404,
            Self::Draining => 503,
            Self::Internal => 500,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unauthorized => "UNAUTHORIZED",
            Self::BadRequest => "BAD_REQUEST",
            Self::TenantNotFound => "TENANT_NOT_FOUND",
            Self::WebhookNotFound => "WEBHOOK_NOT_FOUND",
            Self::RuleNotFound => "RULE_NOT_FOUND",
            Self::Draining => "DRAINING",
            Self::Internal => "INTERNAL",
        }
    }

    pub fn to_error_body(&self, message: impl Into<String>) -> ErrorBody {
        ErrorBody { code: self.as_str().to_owned(), message: message.into() }
    }

    pub fn to_http_response(
        &self,
        message: impl Into<String>,
    ) -> (StatusCode, Json<ErrorResponse>) {
        let status =
            StatusCode::from_u16(self.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let body = ErrorResponse { error: self.to_error_body(message) };
        (status, Json(body))
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Top-level error response envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: ErrorBody,
}

/// Error body with machine-readable code and human-readable message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
}

// -- Fatal startup/runtime errors ---------------------------------------------

/// Process-terminating failures, mapped to exit codes in `main`.
#[derive(Debug)]
pub enum FatalError {
    /// Invalid configuration. Exit code 64.
    Config(String),
    /// The listener could not be established. Exit code 69.
    Listener(std::io::Error),
    /// Anything else. Exit code 70.
    Internal(anyhow::Error),
}

impl FatalError {
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Config(_) => 64,
            Self::Listener(_) => 69,
            Self::Internal(_) => 70,
        }
    }
}

impl fmt::Display for FatalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "configuration error: {msg}"),
            Self::Listener(e) => write!(f, "listener failure: {e}"),
            Self::Internal(e) => write!(f, "internal error: {e:#}"),
        }
    }
}

impl std::error::Error for FatalError {}

impl From<anyhow::Error> for FatalError {
    fn from(e: anyhow::Error) -> Self {
        Self::Internal(e)
    }
}
