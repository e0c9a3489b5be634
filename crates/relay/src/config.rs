// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::path::PathBuf;
use std::time::Duration;

use crate::error::FatalError;
use crate::limiter::LimiterConfig;
use crate::registry::{Tier, TierLimits};
use crate::webhook::circuit::CircuitConfig;
use crate::webhook::{RetryPolicy, WebhookConfig};

/// Configuration for the relay server.
#[derive(Debug, Clone, clap::Args)]
pub struct RelayConfig {
    /// Host to bind on.
    #[arg(long, default_value = "127.0.0.1", env = "SATCHEL_RELAY_HOST")]
    pub host: String,

    /// Port to listen on.
    #[arg(long, default_value_t = 9600, env = "SATCHEL_RELAY_PORT")]
    pub port: u16,

    /// TLS certificate file (PEM). Plain TCP when unset.
    #[arg(long, env = "SATCHEL_RELAY_TLS_CERT", requires = "tls_key")]
    pub tls_cert: Option<PathBuf>,

    /// TLS private key file (PEM).
    #[arg(long, env = "SATCHEL_RELAY_TLS_KEY", requires = "tls_cert")]
    pub tls_key: Option<PathBuf>,

    /// Shared token for the admin API, observer stream, and — absent a
    /// per-tenant token — client admission. If unset, those surfaces are
    /// open.
    #[arg(long, env = "SATCHEL_RELAY_AUTH_TOKEN")]
    pub auth_token: Option<String>,

    /// Per-tenant connect tokens as `tenant=token` (repeatable,
    /// comma-separable), checked during the HELLO handshake. Tenants without
    /// an entry fall back to --auth-token.
    #[arg(long = "tenant-token", value_parser = parse_tenant_token, value_delimiter = ',', env = "SATCHEL_RELAY_TENANT_TOKENS")]
    pub tenant_token: Vec<(String, String)>,

    /// Connection cap applied to every tier when no --tier-limit overrides
    /// are given.
    #[arg(long, default_value_t = 100, env = "SATCHEL_RELAY_MAX_CONNECTIONS_PER_TENANT")]
    pub max_connections_per_tenant: u32,

    /// Per-tier cap overrides as `tier=limit` (repeatable, comma-separable).
    /// Tiers missing from an explicit override set fail closed at zero.
    #[arg(long = "tier-limit", value_parser = parse_tier_limit, value_delimiter = ',', env = "SATCHEL_RELAY_TIER_LIMITS")]
    pub tier_limit: Vec<(Tier, u32)>,

    /// Per-tenant buffered-message ceiling in bytes.
    #[arg(long, default_value_t = 10 * 1024 * 1024, env = "SATCHEL_RELAY_MESSAGE_BUFFER_BYTES")]
    pub message_buffer_bytes: usize,

    /// Buffered-message TTL in milliseconds.
    #[arg(long, default_value_t = 300_000, env = "SATCHEL_RELAY_BUFFER_TTL_MS")]
    pub buffer_ttl_ms: u64,

    /// Idle connection timeout in milliseconds.
    #[arg(long, default_value_t = 300_000, env = "SATCHEL_RELAY_IDLE_TIMEOUT_MS")]
    pub idle_timeout_ms: u64,

    /// Idle sweep interval in milliseconds.
    #[arg(long, default_value_t = 30_000, env = "SATCHEL_RELAY_IDLE_SWEEP_MS")]
    pub idle_sweep_ms: u64,

    /// Health-check beat interval in milliseconds.
    #[arg(long, default_value_t = 30_000, env = "SATCHEL_RELAY_HEALTH_CHECK_INTERVAL_MS")]
    pub health_check_interval_ms: u64,

    /// Metrics report interval in milliseconds.
    #[arg(long, default_value_t = 60_000, env = "SATCHEL_RELAY_METRICS_INTERVAL_MS")]
    pub metrics_interval_ms: u64,

    /// Buffer TTL sweep interval in milliseconds.
    #[arg(long, default_value_t = 30_000, env = "SATCHEL_RELAY_BUFFER_SWEEP_MS")]
    pub buffer_sweep_ms: u64,

    /// Dead-letter age sweep interval in milliseconds.
    #[arg(long, default_value_t = 60_000, env = "SATCHEL_RELAY_DLQ_SWEEP_MS")]
    pub dlq_sweep_ms: u64,

    /// Dead-letter entries older than this are swept, in milliseconds.
    #[arg(long, default_value_t = 3_600_000, env = "SATCHEL_RELAY_DLQ_MAX_AGE_MS")]
    pub dlq_max_age_ms: u64,

    /// Events retained per topic for replay.
    #[arg(long, default_value_t = 10_000, env = "SATCHEL_RELAY_REPLAY_RING_SIZE")]
    pub replay_ring_size: usize,

    /// Default queued-subscription depth.
    #[arg(long, default_value_t = 1_024, env = "SATCHEL_RELAY_SUBSCRIPTION_QUEUE_DEPTH")]
    pub subscription_queue_depth: usize,

    /// Dead-letter ring capacity.
    #[arg(long, default_value_t = 4_096, env = "SATCHEL_RELAY_DLQ_CAPACITY")]
    pub dlq_capacity: usize,

    /// Drain deadline for `stop()` in milliseconds.
    #[arg(long, default_value_t = 30_000, env = "SATCHEL_RELAY_DRAIN_DEADLINE_MS")]
    pub drain_deadline_ms: u64,

    /// Trigger fan-out depth cap.
    #[arg(long, default_value_t = 8, env = "SATCHEL_RELAY_MAX_FANOUT_DEPTH")]
    pub max_fanout_depth: u32,

    // -- Rate limiter ---------------------------------------------------------
    /// Per-tenant connect admissions per second (burst equals the rate).
    #[arg(long, default_value_t = 10.0, env = "SATCHEL_RELAY_CONNECT_RATE")]
    pub connect_rate: f64,

    /// Per-tenant relayed publishes per second.
    #[arg(long, default_value_t = 500.0, env = "SATCHEL_RELAY_PUBLISH_RATE")]
    pub publish_rate: f64,

    /// Per-webhook outbound deliveries per second.
    #[arg(long, default_value_t = 100.0, env = "SATCHEL_RELAY_FANOUT_RATE")]
    pub fanout_rate: f64,

    // -- Webhook delivery -----------------------------------------------------
    /// Per-attempt webhook HTTP timeout in milliseconds.
    #[arg(long, default_value_t = 10_000, env = "SATCHEL_RELAY_WEBHOOK_TIMEOUT_MS")]
    pub webhook_timeout_ms: u64,

    /// Webhook delivery attempts, including the first.
    #[arg(long, default_value_t = 5, env = "SATCHEL_RELAY_WEBHOOK_MAX_ATTEMPTS")]
    pub webhook_max_attempts: u32,

    /// Base retry backoff in milliseconds.
    #[arg(long, default_value_t = 500, env = "SATCHEL_RELAY_WEBHOOK_BASE_BACKOFF_MS")]
    pub webhook_base_backoff_ms: u64,

    /// Retry backoff cap in milliseconds.
    #[arg(long, default_value_t = 30_000, env = "SATCHEL_RELAY_WEBHOOK_MAX_BACKOFF_MS")]
    pub webhook_max_backoff_ms: u64,

    /// Backoff jitter as ± percent.
    #[arg(long, default_value_t = 20, env = "SATCHEL_RELAY_WEBHOOK_JITTER_PCT")]
    pub webhook_jitter_pct: u8,

    /// Overall per-delivery deadline in milliseconds; 0 derives one from the
    /// retry policy's worst case.
    #[arg(long, default_value_t = 0, env = "SATCHEL_RELAY_WEBHOOK_DEADLINE_MS")]
    pub webhook_deadline_ms: u64,

    // -- Circuit breaker ------------------------------------------------------
    /// Rolling error window in milliseconds.
    #[arg(long, default_value_t = 30_000, env = "SATCHEL_RELAY_CIRCUIT_WINDOW_MS")]
    pub circuit_window_ms: u64,

    /// Minimum samples before the breaker may trip.
    #[arg(long, default_value_t = 10, env = "SATCHEL_RELAY_CIRCUIT_MIN_SAMPLES")]
    pub circuit_min_samples: u64,

    /// Error percentage the rolling rate must exceed to trip.
    #[arg(long, default_value_t = 50, env = "SATCHEL_RELAY_CIRCUIT_ERROR_RATE_PCT")]
    pub circuit_error_rate_pct: u8,

    /// Open-circuit cool-down in milliseconds.
    #[arg(long, default_value_t = 60_000, env = "SATCHEL_RELAY_CIRCUIT_COOLDOWN_MS")]
    pub circuit_cooldown_ms: u64,

    /// Cool-down doubling cap in milliseconds.
    #[arg(long, default_value_t = 600_000, env = "SATCHEL_RELAY_CIRCUIT_MAX_COOLDOWN_MS")]
    pub circuit_max_cooldown_ms: u64,
}

fn parse_tier_limit(raw: &str) -> Result<(Tier, u32), String> {
    let (tier, limit) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected tier=limit, got: {raw}"))?;
    let tier: Tier = tier.trim().parse()?;
    let limit: u32 =
        limit.trim().parse().map_err(|_| format!("invalid limit in: {raw}"))?;
    Ok((tier, limit))
}

fn parse_tenant_token(raw: &str) -> Result<(String, String), String> {
    let (tenant, token) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected tenant=token, got: {raw}"))?;
    let tenant = tenant.trim();
    let token = token.trim();
    if tenant.is_empty() || token.is_empty() {
        return Err(format!("tenant and token must be non-empty: {raw}"));
    }
    Ok((tenant.to_owned(), token.to_owned()))
}

impl RelayConfig {
    /// Fail fast on nonsense before anything binds or spawns.
    pub fn validate(&self) -> Result<(), FatalError> {
        if self.message_buffer_bytes == 0 {
            return Err(FatalError::Config("message_buffer_bytes must be positive".into()));
        }
        if self.webhook_max_attempts == 0 {
            return Err(FatalError::Config("webhook_max_attempts must be at least 1".into()));
        }
        if self.webhook_jitter_pct > 100 {
            return Err(FatalError::Config("webhook_jitter_pct must be 0..=100".into()));
        }
        if self.circuit_error_rate_pct > 100 {
            return Err(FatalError::Config("circuit_error_rate_pct must be 0..=100".into()));
        }
        if self.circuit_min_samples == 0 {
            return Err(FatalError::Config("circuit_min_samples must be at least 1".into()));
        }
        if self.tls_cert.is_some() != self.tls_key.is_some() {
            return Err(FatalError::Config("tls requires both cert and key".into()));
        }
        if self.replay_ring_size == 0 || self.subscription_queue_depth == 0 {
            return Err(FatalError::Config("replay ring and queue depth must be positive".into()));
        }
        Ok(())
    }

    /// Effective per-tier caps; explicit overrides fail closed for tiers
    /// they do not name.
    pub fn tier_limits(&self) -> TierLimits {
        if self.tier_limit.is_empty() {
            TierLimits::uniform(self.max_connections_per_tenant)
        } else {
            TierLimits::from_overrides(&self.tier_limit)
        }
    }

    pub fn limiter_config(&self) -> LimiterConfig {
        LimiterConfig {
            connect_burst: self.connect_rate,
            connect_per_sec: self.connect_rate,
            publish_burst: self.publish_rate,
            publish_per_sec: self.publish_rate,
            fanout_burst: self.fanout_rate,
            fanout_per_sec: self.fanout_rate,
        }
    }

    pub fn webhook_config(&self) -> WebhookConfig {
        WebhookConfig {
            timeout_ms: self.webhook_timeout_ms,
            retry: RetryPolicy {
                max_attempts: self.webhook_max_attempts,
                base_backoff_ms: self.webhook_base_backoff_ms,
                max_backoff_ms: self.webhook_max_backoff_ms,
                jitter_pct: self.webhook_jitter_pct,
            },
            deadline_ms: self.webhook_deadline_ms,
            circuit: CircuitConfig {
                window_ms: self.circuit_window_ms,
                min_samples: self.circuit_min_samples,
                error_rate_pct: self.circuit_error_rate_pct,
                cooldown_ms: self.circuit_cooldown_ms,
                max_cooldown_ms: self.circuit_max_cooldown_ms,
            },
        }
    }

    pub fn idle_sweep_interval(&self) -> Duration {
        Duration::from_millis(self.idle_sweep_ms)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms)
    }

    pub fn metrics_interval(&self) -> Duration {
        Duration::from_millis(self.metrics_interval_ms)
    }

    pub fn buffer_sweep_interval(&self) -> Duration {
        Duration::from_millis(self.buffer_sweep_ms)
    }

    pub fn dlq_sweep_interval(&self) -> Duration {
        Duration::from_millis(self.dlq_sweep_ms)
    }

    pub fn drain_deadline(&self) -> Duration {
        Duration::from_millis(self.drain_deadline_ms)
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_owned(),
            port: 9600,
            tls_cert: None,
            tls_key: None,
            auth_token: None,
            tenant_token: Vec::new(),
            max_connections_per_tenant: 100,
            tier_limit: Vec::new(),
            message_buffer_bytes: 10 * 1024 * 1024,
            buffer_ttl_ms: 300_000,
            idle_timeout_ms: 300_000,
            idle_sweep_ms: 30_000,
            health_check_interval_ms: 30_000,
            metrics_interval_ms: 60_000,
            buffer_sweep_ms: 30_000,
            dlq_sweep_ms: 60_000,
            dlq_max_age_ms: 3_600_000,
            replay_ring_size: 10_000,
            subscription_queue_depth: 1_024,
            dlq_capacity: 4_096,
            drain_deadline_ms: 30_000,
            max_fanout_depth: 8,
            connect_rate: 10.0,
            publish_rate: 500.0,
            fanout_rate: 100.0,
            webhook_timeout_ms: 10_000,
            webhook_max_attempts: 5,
            webhook_base_backoff_ms: 500,
            webhook_max_backoff_ms: 30_000,
            webhook_jitter_pct: 20,
            webhook_deadline_ms: 0,
            circuit_window_ms: 30_000,
            circuit_min_samples: 10,
            circuit_error_rate_pct: 50,
            circuit_cooldown_ms: 60_000,
            circuit_max_cooldown_ms: 600_000,
        }
    }
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
