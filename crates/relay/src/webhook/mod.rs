// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Outbound webhook delivery: signed POSTs with exponential-backoff retry,
//! a per-endpoint circuit breaker, and a dead-letter sink shared with the
//! event bus.
//!
//! Every delivery runs as a tracked task so `drain` can flush in-flight
//! work up to the stop deadline.

pub mod circuit;
pub mod sign;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use base64::Engine as _;
use indexmap::IndexMap;
use parking_lot::{Mutex, RwLock};
use rand::Rng;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::bus::dlq::{DeadLetterQueue, DlqKind};
use crate::bus::pattern::TopicPattern;
use crate::bus::Event;
use crate::events::{epoch_ms, EventHub, RelayEvent};
use crate::limiter::{Gate, RateLimiter};

use circuit::{Admission, CircuitBreaker, CircuitConfig, CircuitState};

// -- Retry policy -------------------------------------------------------------

/// Exponential backoff with jitter.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_backoff_ms: u64,
    pub max_backoff_ms: u64,
    /// Jitter as ± percent of the computed delay.
    pub jitter_pct: u8,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { max_attempts: 5, base_backoff_ms: 500, max_backoff_ms: 30_000, jitter_pct: 20 }
    }
}

impl RetryPolicy {
    /// Deterministic delay before retry `n` (1-indexed failed attempts):
    /// `min(base * 2^(n-1), max)`.
    pub fn backoff_base_ms(&self, failed_attempts: u32) -> u64 {
        self.base_backoff_ms
            .saturating_mul(2u64.saturating_pow(failed_attempts.saturating_sub(1)))
            .min(self.max_backoff_ms)
    }

    /// Backoff with ±jitter applied.
    pub fn backoff_ms(&self, failed_attempts: u32) -> u64 {
        let base = self.backoff_base_ms(failed_attempts);
        let spread = base * self.jitter_pct as u64 / 100;
        if spread == 0 {
            return base;
        }
        rand::rng().random_range(base.saturating_sub(spread)..=base.saturating_add(spread))
    }
}

// -- Attempt classification ---------------------------------------------------

/// How a single HTTP attempt ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptOutcome {
    Success(u16),
    /// 408/425/429, 5xx, timeouts, and transport errors.
    Retriable(String),
    /// Any other non-2xx status; retrying will not help.
    NonRetriable(u16, String),
}

/// Classify an HTTP status per the delivery contract.
pub fn classify_status(status: u16) -> AttemptOutcome {
    match status {
        200..=299 => AttemptOutcome::Success(status),
        408 | 425 | 429 => AttemptOutcome::Retriable(format!("HTTP {status}")),
        500..=599 => AttemptOutcome::Retriable(format!("HTTP {status}")),
        other => AttemptOutcome::NonRetriable(other, format!("HTTP {other}")),
    }
}

// -- Registrations ------------------------------------------------------------

/// A registered webhook endpoint.
#[derive(Clone)]
pub struct WebhookRegistration {
    pub id: String,
    pub url: String,
    pub pattern: TopicPattern,
    pub secret: String,
    pub retry: RetryPolicy,
}

/// Public view with the secret redacted.
#[derive(Debug, Clone, Serialize)]
pub struct WebhookView {
    pub id: String,
    pub url: String,
    pub pattern: String,
    pub circuit: CircuitState,
    pub sent: u64,
    pub failed: u64,
    pub dead_lettered: u64,
}

struct RegistrationEntry {
    reg: WebhookRegistration,
    breaker: Mutex<CircuitBreaker>,
    sent: AtomicU64,
    failed: AtomicU64,
    dead_lettered: AtomicU64,
}

impl RegistrationEntry {
    fn view(&self) -> WebhookView {
        WebhookView {
            id: self.reg.id.clone(),
            url: self.reg.url.clone(),
            pattern: self.reg.pattern.as_str().to_owned(),
            circuit: self.breaker.lock().state(),
            sent: self.sent.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
        }
    }
}

// -- Dispatcher ---------------------------------------------------------------

/// Delivery timing knobs.
#[derive(Debug, Clone, Copy)]
pub struct WebhookConfig {
    /// Per-attempt HTTP timeout.
    pub timeout_ms: u64,
    pub retry: RetryPolicy,
    /// Overall per-delivery deadline. Zero derives one from the retry
    /// policy's worst case.
    pub deadline_ms: u64,
    pub circuit: CircuitConfig,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 10_000,
            retry: RetryPolicy::default(),
            deadline_ms: 0,
            circuit: CircuitConfig::default(),
        }
    }
}

impl WebhookConfig {
    fn effective_deadline_ms(&self) -> u64 {
        if self.deadline_ms > 0 {
            return self.deadline_ms;
        }
        let mut total = self.timeout_ms.saturating_mul(self.retry.max_attempts as u64);
        for n in 1..self.retry.max_attempts {
            // Worst case: every backoff lands at +jitter.
            let base = self.retry.backoff_base_ms(n);
            total = total.saturating_add(base + base * self.retry.jitter_pct as u64 / 100);
        }
        total
    }
}

struct Inner {
    registrations: RwLock<IndexMap<String, Arc<RegistrationEntry>>>,
    client: reqwest::Client,
    dlq: Arc<DeadLetterQueue>,
    events: EventHub,
    limiter: Arc<RateLimiter>,
    config: WebhookConfig,
    tracker: TaskTracker,
    shutdown: CancellationToken,
}

/// The webhook dispatcher. Cheap to clone.
#[derive(Clone)]
pub struct WebhookDispatcher {
    inner: Arc<Inner>,
}

impl WebhookDispatcher {
    pub fn new(
        config: WebhookConfig,
        dlq: Arc<DeadLetterQueue>,
        events: EventHub,
        limiter: Arc<RateLimiter>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                registrations: RwLock::new(IndexMap::new()),
                client: reqwest::Client::new(),
                dlq,
                events,
                limiter,
                config,
                tracker: TaskTracker::new(),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Register an endpoint. Generates id and, when absent, a signing
    /// secret; the secret is only ever returned here.
    pub fn register(
        &self,
        url: &str,
        pattern: &str,
        secret: Option<String>,
        retry: Option<RetryPolicy>,
    ) -> Result<WebhookRegistration, String> {
        if !url.starts_with("http://") && !url.starts_with("https://") {
            return Err("webhook url must start with http:// or https://".to_owned());
        }
        let pattern = TopicPattern::parse(pattern)?;
        let reg = WebhookRegistration {
            id: format!("wh_{}", uuid::Uuid::new_v4()),
            url: url.to_owned(),
            pattern,
            secret: secret.unwrap_or_else(|| format!("whsec_{}", uuid::Uuid::new_v4())),
            retry: retry.unwrap_or(self.inner.config.retry),
        };
        let entry = Arc::new(RegistrationEntry {
            reg: reg.clone(),
            breaker: Mutex::new(CircuitBreaker::new(self.inner.config.circuit)),
            sent: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            dead_lettered: AtomicU64::new(0),
        });
        self.inner.registrations.write().insert(reg.id.clone(), entry);
        tracing::info!(webhook = %reg.id, url = %reg.url, pattern = %reg.pattern, "webhook registered");
        Ok(reg)
    }

    pub fn unregister(&self, id: &str) -> bool {
        let removed = self.inner.registrations.write().shift_remove(id).is_some();
        if removed {
            tracing::info!(webhook = %id, "webhook unregistered");
        }
        removed
    }

    /// Stats for one registration, or all of them.
    pub fn stats(&self, id: Option<&str>) -> Vec<WebhookView> {
        let regs = self.inner.registrations.read();
        match id {
            Some(id) => regs.get(id).map(|e| vec![e.view()]).unwrap_or_default(),
            None => regs.values().map(|e| e.view()).collect(),
        }
    }

    /// Fan an event out to every registration whose pattern matches.
    pub fn dispatch(&self, event: &Event) {
        let matching: Vec<Arc<RegistrationEntry>> = {
            let regs = self.inner.registrations.read();
            regs.values()
                .filter(|e| e.reg.pattern.matches(&event.meta.topic))
                .map(Arc::clone)
                .collect()
        };
        if matching.is_empty() {
            return;
        }
        let event = Arc::new(event.clone());
        for entry in matching {
            self.spawn_delivery(entry, Arc::clone(&event));
        }
    }

    /// Deliver to one registration by id, pattern match bypassed (trigger
    /// engine actions address webhooks directly).
    pub fn dispatch_to(&self, id: &str, event: &Event) -> bool {
        let entry = self.inner.registrations.read().get(id).map(Arc::clone);
        match entry {
            Some(entry) => {
                self.spawn_delivery(entry, Arc::new(event.clone()));
                true
            }
            None => {
                tracing::warn!(webhook = %id, "dispatch to unknown webhook dropped");
                false
            }
        }
    }

    fn spawn_delivery(&self, entry: Arc<RegistrationEntry>, event: Arc<Event>) {
        if self.inner.tracker.is_closed() {
            return;
        }
        let inner = Arc::clone(&self.inner);
        self.inner.tracker.spawn(async move {
            deliver(inner, entry, event).await;
        });
    }

    /// Stop accepting deliveries and wait for in-flight ones up to
    /// `deadline`. Returns true if everything flushed in time; stragglers
    /// are cancelled either way.
    pub async fn drain(&self, deadline: Duration) -> bool {
        self.inner.tracker.close();
        let flushed =
            tokio::time::timeout(deadline, self.inner.tracker.wait()).await.is_ok();
        if !flushed {
            tracing::warn!("webhook drain deadline expired, cancelling stragglers");
        }
        self.inner.shutdown.cancel();
        flushed
    }

    /// Whether any delivery task is still running (test/diagnostic hook).
    pub fn idle(&self) -> bool {
        self.inner.tracker.is_empty()
    }
}

// -- Delivery task ------------------------------------------------------------

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct DeliveryBody<'a> {
    sequence: u64,
    topic: &'a str,
    payload: String,
    timestamp: u64,
    delivery_id: &'a str,
}

async fn deliver(inner: Arc<Inner>, entry: Arc<RegistrationEntry>, event: Arc<Event>) {
    let reg = &entry.reg;
    let deadline_ms = inner.config.effective_deadline_ms();
    let started_ms = epoch_ms();

    // Fan-out admission: wait for a token, bounded by the delivery deadline.
    loop {
        if inner.limiter.allow(&reg.id, Gate::Fanout) {
            break;
        }
        if epoch_ms().saturating_sub(started_ms) >= deadline_ms {
            dead_letter(&inner, &entry, &event, DlqKind::DeadlineExceeded, "fan-out throttled", 0);
            return;
        }
        tokio::select! {
            _ = inner.shutdown.cancelled() => return,
            _ = tokio::time::sleep(Duration::from_millis(50)) => {}
        }
    }

    let admission = entry.breaker.lock().check(epoch_ms());
    let max_attempts = match admission {
        Admission::Reject => {
            dead_letter(&inner, &entry, &event, DlqKind::CircuitOpen, "circuit open", 0);
            return;
        }
        // Half-open circuits get exactly one probe attempt.
        Admission::Probe => 1,
        Admission::Allow => reg.retry.max_attempts.max(1),
    };

    let delivery_id = format!("{}.{}.{}", reg.id, event.meta.topic, event.meta.sequence);
    let timestamp_ms = epoch_ms();
    let body = DeliveryBody {
        sequence: event.meta.sequence,
        topic: &event.meta.topic,
        payload: base64::engine::general_purpose::STANDARD.encode(&event.payload),
        timestamp: timestamp_ms,
        delivery_id: &delivery_id,
    };
    let body_bytes = match serde_json::to_vec(&body) {
        Ok(b) => b,
        Err(e) => {
            dead_letter(&inner, &entry, &event, DlqKind::ClientError, format!("encode: {e}"), 0);
            return;
        }
    };
    let signature = sign::signature_header(&reg.secret, timestamp_ms, &body_bytes);

    let mut attempt = 0u32;
    while attempt < max_attempts {
        attempt += 1;

        if attempt > 1 {
            let backoff = Duration::from_millis(reg.retry.backoff_ms(attempt - 1));
            tokio::select! {
                _ = inner.shutdown.cancelled() => {
                    dead_letter(&inner, &entry, &event, DlqKind::DeadlineExceeded, "shutdown", attempt - 1);
                    return;
                }
                _ = tokio::time::sleep(backoff) => {}
            }
        }

        // The overall deadline wins over remaining attempts.
        if epoch_ms().saturating_sub(started_ms) >= deadline_ms {
            dead_letter(&inner, &entry, &event, DlqKind::DeadlineExceeded, "deadline", attempt - 1);
            return;
        }

        let outcome = tokio::select! {
            _ = inner.shutdown.cancelled() => {
                dead_letter(&inner, &entry, &event, DlqKind::DeadlineExceeded, "shutdown", attempt - 1);
                return;
            }
            outcome = attempt_once(&inner, reg, &body_bytes, &signature, &event, &delivery_id) => outcome,
        };
        match outcome {
            AttemptOutcome::Success(status) => {
                entry.breaker.lock().record(epoch_ms(), true);
                entry.sent.fetch_add(1, Ordering::Relaxed);
                inner.events.emit(RelayEvent::WebhookSent {
                    webhook: reg.id.clone(),
                    topic: event.meta.topic.clone(),
                    sequence: event.meta.sequence,
                    attempt,
                });
                tracing::debug!(webhook = %reg.id, status, attempt, "webhook delivered");
                return;
            }
            AttemptOutcome::NonRetriable(status, error) => {
                entry.breaker.lock().record(epoch_ms(), false);
                entry.failed.fetch_add(1, Ordering::Relaxed);
                inner.events.emit(RelayEvent::WebhookFailed {
                    webhook: reg.id.clone(),
                    topic: event.meta.topic.clone(),
                    sequence: event.meta.sequence,
                    attempt,
                    error: error.clone(),
                });
                tracing::debug!(webhook = %reg.id, status, "webhook got non-retriable status");
                dead_letter(&inner, &entry, &event, DlqKind::ClientError, error, attempt);
                return;
            }
            AttemptOutcome::Retriable(error) => {
                entry.breaker.lock().record(epoch_ms(), false);
                entry.failed.fetch_add(1, Ordering::Relaxed);
                inner.events.emit(RelayEvent::WebhookFailed {
                    webhook: reg.id.clone(),
                    topic: event.meta.topic.clone(),
                    sequence: event.meta.sequence,
                    attempt,
                    error: error.clone(),
                });
                tracing::debug!(webhook = %reg.id, attempt, err = %error, "webhook attempt failed");
            }
        }
    }

    dead_letter(&inner, &entry, &event, DlqKind::Exhausted, "all attempts failed", max_attempts);
}

async fn attempt_once(
    inner: &Inner,
    reg: &WebhookRegistration,
    body: &[u8],
    signature: &str,
    event: &Event,
    delivery_id: &str,
) -> AttemptOutcome {
    let request = inner
        .client
        .post(&reg.url)
        .header("Content-Type", "application/json")
        .header("X-Topic", &event.meta.topic)
        .header("X-Sequence", event.meta.sequence.to_string())
        .header("X-Delivery-Id", delivery_id)
        .header("X-Signature", signature)
        .body(body.to_vec())
        .timeout(Duration::from_millis(inner.config.timeout_ms));

    match request.send().await {
        Ok(response) => classify_status(response.status().as_u16()),
        Err(e) if e.is_timeout() => AttemptOutcome::Retriable("timeout".to_owned()),
        Err(e) => AttemptOutcome::Retriable(format!("network: {e}")),
    }
}

fn dead_letter(
    inner: &Inner,
    entry: &RegistrationEntry,
    event: &Event,
    kind: DlqKind,
    error: impl Into<String>,
    attempts: u32,
) {
    let reg_id = &entry.reg.id;
    inner.dlq.record(reg_id, event.meta.sequence, &event.meta.topic, kind, error, attempts);
    entry.dead_lettered.fetch_add(1, Ordering::Relaxed);
    inner.events.emit(RelayEvent::WebhookDlq {
        webhook: reg_id.clone(),
        sequence: event.meta.sequence,
        kind: kind.as_str().to_owned(),
    });
    tracing::debug!(webhook = %reg_id, sequence = event.meta.sequence, kind = kind.as_str(), "webhook dead-lettered");
}

#[cfg(test)]
#[path = "webhook_tests.rs"]
mod tests;
