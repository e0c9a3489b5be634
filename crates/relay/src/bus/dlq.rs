// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Dead-letter queue shared by the event bus and the webhook dispatcher.
//!
//! A bounded ring keyed by `(target, sequence)`: re-dead-lettering the same
//! delivery updates the existing entry in place rather than consuming another
//! slot. Writers go through one lock; readers get cloned snapshots.

use std::collections::{HashMap, VecDeque};

use parking_lot::Mutex;
use serde::Serialize;

use crate::events::epoch_ms;

/// Terminal classification for a given-up delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DlqKind {
    /// A bus handler returned an error during delivery.
    HandlerError,
    /// The endpoint's circuit was open; no attempt was made.
    CircuitOpen,
    /// Non-retriable HTTP 4xx from the endpoint.
    ClientError,
    /// All retry attempts failed.
    Exhausted,
    /// The overall delivery deadline expired with attempts remaining.
    DeadlineExceeded,
}

impl DlqKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::HandlerError => "HandlerError",
            Self::CircuitOpen => "CircuitOpen",
            Self::ClientError => "ClientError",
            Self::Exhausted => "Exhausted",
            Self::DeadlineExceeded => "DeadlineExceeded",
        }
    }
}

impl Serialize for DlqKind {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

/// One given-up delivery. Payload bytes are deliberately absent.
#[derive(Debug, Clone, Serialize)]
pub struct DeadLetterEntry {
    /// Subscription id or webhook id.
    pub target: String,
    pub sequence: u64,
    pub topic: String,
    pub kind: DlqKind,
    pub error: String,
    pub attempts: u32,
    pub first_seen_ms: u64,
    pub last_attempt_ms: u64,
}

struct DlqInner {
    order: VecDeque<(String, u64)>,
    entries: HashMap<(String, u64), DeadLetterEntry>,
    dropped: u64,
}

/// Bounded dead-letter ring.
pub struct DeadLetterQueue {
    inner: Mutex<DlqInner>,
    capacity: usize,
}

impl DeadLetterQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(DlqInner {
                order: VecDeque::new(),
                entries: HashMap::new(),
                dropped: 0,
            }),
            capacity,
        }
    }

    /// Record a terminal failure. Returns the entry as recorded.
    pub fn record(
        &self,
        target: &str,
        sequence: u64,
        topic: &str,
        kind: DlqKind,
        error: impl Into<String>,
        attempts: u32,
    ) -> DeadLetterEntry {
        let now = epoch_ms();
        let key = (target.to_owned(), sequence);
        let mut inner = self.inner.lock();

        if let Some(existing) = inner.entries.get_mut(&key) {
            existing.kind = kind;
            existing.error = error.into();
            existing.attempts = existing.attempts.saturating_add(attempts);
            existing.last_attempt_ms = now;
            return existing.clone();
        }

        let entry = DeadLetterEntry {
            target: target.to_owned(),
            sequence,
            topic: topic.to_owned(),
            kind,
            error: error.into(),
            attempts,
            first_seen_ms: now,
            last_attempt_ms: now,
        };
        inner.order.push_back(key.clone());
        inner.entries.insert(key, entry.clone());

        while inner.order.len() > self.capacity {
            if let Some(old_key) = inner.order.pop_front() {
                inner.entries.remove(&old_key);
                inner.dropped += 1;
            }
        }
        entry
    }

    pub fn len(&self) -> usize {
        self.inner.lock().order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Entries evicted because the ring was full.
    pub fn dropped(&self) -> u64 {
        self.inner.lock().dropped
    }

    /// Oldest-first snapshot of current entries.
    pub fn snapshot(&self) -> Vec<DeadLetterEntry> {
        let inner = self.inner.lock();
        inner.order.iter().filter_map(|key| inner.entries.get(key).cloned()).collect()
    }

    /// Entry counts keyed by kind string, for the metrics snapshot.
    pub fn counts_by_kind(&self) -> HashMap<String, usize> {
        let inner = self.inner.lock();
        let mut counts = HashMap::new();
        for entry in inner.entries.values() {
            *counts.entry(entry.kind.as_str().to_owned()).or_insert(0) += 1;
        }
        counts
    }

    /// Drop entries whose last attempt is older than `cutoff_ms`. Returns how
    /// many were removed.
    pub fn sweep_older_than(&self, cutoff_ms: u64) -> usize {
        let mut inner = self.inner.lock();
        let before = inner.order.len();
        let stale: Vec<(String, u64)> = inner
            .order
            .iter()
            .filter(|key| {
                inner.entries.get(*key).map(|e| e.last_attempt_ms < cutoff_ms).unwrap_or(true)
            })
            .cloned()
            .collect();
        for key in stale {
            inner.entries.remove(&key);
            if let Some(pos) = inner.order.iter().position(|k| *k == key) {
                inner.order.remove(pos);
            }
        }
        before - inner.order.len()
    }
}

#[cfg(test)]
#[path = "dlq_tests.rs"]
mod tests;
