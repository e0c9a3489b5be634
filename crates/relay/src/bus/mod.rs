// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Typed topic pub/sub with pattern matching, bounded replay, and a DLQ.
//!
//! The subscription table is copy-on-write: `subscribe`/`unsubscribe` swap in
//! a new list, publication iterates the old one lock-free. Handler and filter
//! failures never propagate to publishers — a throwing handler is
//! dead-lettered, a throwing filter counts as "does not match".

pub mod dlq;
pub mod pattern;

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::error::BusError;
use crate::events::{epoch_ms, EventHub, RelayEvent};
use crate::window::RingWindow;

use dlq::{DeadLetterQueue, DlqKind};
use pattern::TopicPattern;

/// Metadata visible to filters and carried on every event.
#[derive(Debug, Clone, serde::Serialize)]
pub struct EventMeta {
    pub topic: String,
    /// Monotonic per topic, starting at 1.
    pub sequence: u64,
    pub timestamp_ms: u64,
    pub content_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    /// Trigger fan-out hop count; see the trigger engine's depth cap.
    pub hops: u32,
}

/// An immutable published event.
#[derive(Debug, Clone)]
pub struct Event {
    pub meta: EventMeta,
    pub payload: Bytes,
}

/// Publish-time options.
#[derive(Debug, Clone, Default)]
pub struct PublishOptions {
    pub content_type: Option<String>,
    pub correlation_id: Option<String>,
    pub hops: u32,
}

/// Subscription handler. Synchronous by contract: async work belongs in a
/// task the handler spawns itself.
pub type Handler = Arc<dyn Fn(&Event) -> Result<(), String> + Send + Sync>;

/// Pure predicate over event metadata.
pub type FilterFn = Arc<dyn Fn(&EventMeta) -> Result<bool, String> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryMode {
    /// Handler runs on the publisher's call stack.
    Sync,
    /// Events queue into a bounded per-subscription buffer drained by a
    /// dedicated worker task.
    Queued,
}

/// Options for [`EventBus::subscribe`].
#[derive(Clone, Default)]
pub struct SubscribeOptions {
    pub mode: Option<DeliveryMode>,
    pub filter: Option<FilterFn>,
    /// Queue depth override for [`DeliveryMode::Queued`].
    pub queue_depth: Option<usize>,
}

struct QueuedState {
    queue: Mutex<VecDeque<Arc<Event>>>,
    depth: usize,
    notify: Notify,
    cancel: CancellationToken,
}

struct Subscription {
    id: String,
    pattern: TopicPattern,
    handler: Handler,
    filter: Option<FilterFn>,
    queued: Option<Arc<QueuedState>>,
}

struct TopicLog {
    next_sequence: u64,
    ring: RingWindow<Arc<Event>>,
}

/// The event bus.
pub struct EventBus {
    subscriptions: ArcSwap<Vec<Arc<Subscription>>>,
    /// Serializes copy-on-write updates to the subscription table.
    subscribe_lock: Mutex<()>,
    topics: Mutex<HashMap<String, TopicLog>>,
    dlq: Arc<DeadLetterQueue>,
    events: EventHub,
    next_sub_id: AtomicU64,
    replay_ring_size: usize,
    default_queue_depth: usize,
    closed: AtomicBool,
    pub dropped_by_queue_pressure: AtomicU64,
    pub filter_errors: AtomicU64,
}

impl EventBus {
    pub fn new(
        replay_ring_size: usize,
        default_queue_depth: usize,
        dlq: Arc<DeadLetterQueue>,
        events: EventHub,
    ) -> Self {
        Self {
            subscriptions: ArcSwap::from_pointee(Vec::new()),
            subscribe_lock: Mutex::new(()),
            topics: Mutex::new(HashMap::new()),
            dlq,
            events,
            next_sub_id: AtomicU64::new(1),
            replay_ring_size,
            default_queue_depth,
            closed: AtomicBool::new(false),
            dropped_by_queue_pressure: AtomicU64::new(0),
            filter_errors: AtomicU64::new(0),
        }
    }

    pub fn dlq(&self) -> &Arc<DeadLetterQueue> {
        &self.dlq
    }

    /// Publish an event. Returns the topic-scoped sequence; delivery failures
    /// are surfaced via the DLQ and `bus-dlq` events, never here.
    pub fn publish(
        &self,
        topic: &str,
        payload: Bytes,
        options: PublishOptions,
    ) -> Result<u64, BusError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(BusError::Closed);
        }

        let event = {
            let mut topics = self.topics.lock();
            let log = topics.entry(topic.to_owned()).or_insert_with(|| TopicLog {
                next_sequence: 1,
                ring: RingWindow::new(self.replay_ring_size),
            });
            let sequence = log.next_sequence;
            log.next_sequence += 1;
            let event = Arc::new(Event {
                meta: EventMeta {
                    topic: topic.to_owned(),
                    sequence,
                    timestamp_ms: epoch_ms(),
                    content_type: options
                        .content_type
                        .unwrap_or_else(|| "application/octet-stream".to_owned()),
                    correlation_id: options.correlation_id,
                    hops: options.hops,
                },
                payload,
            });
            log.ring.push(Arc::clone(&event));
            event
        };

        // Lock-free iteration over the current subscriber snapshot.
        let subscriptions = self.subscriptions.load_full();
        for sub in subscriptions.iter() {
            if !sub.pattern.matches(topic) {
                continue;
            }
            if !self.passes_filter(sub, &event.meta) {
                continue;
            }
            match &sub.queued {
                None => self.deliver_sync(sub, &event),
                Some(queued) => self.enqueue(sub, queued, Arc::clone(&event)),
            }
        }

        Ok(event.meta.sequence)
    }

    fn passes_filter(&self, sub: &Subscription, meta: &EventMeta) -> bool {
        match &sub.filter {
            None => true,
            Some(filter) => match filter(meta) {
                Ok(matched) => matched,
                Err(e) => {
                    self.filter_errors.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!(subscription = %sub.id, err = %e, "filter error, treating as no match");
                    false
                }
            },
        }
    }

    fn deliver_sync(&self, sub: &Subscription, event: &Arc<Event>) {
        if let Err(e) = (sub.handler)(event) {
            self.dead_letter(&sub.id, event, e);
        }
    }

    fn enqueue(&self, sub: &Subscription, queued: &Arc<QueuedState>, event: Arc<Event>) {
        let mut queue = queued.queue.lock();
        if queue.len() >= queued.depth {
            // Overflow evicts the oldest entry; that is operator pressure,
            // not a delivery failure, so it is counted but not dead-lettered.
            queue.pop_front();
            self.dropped_by_queue_pressure.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(subscription = %sub.id, "subscription queue overflow, dropped oldest");
        }
        queue.push_back(event);
        drop(queue);
        queued.notify.notify_one();
    }

    fn dead_letter(&self, subscription_id: &str, event: &Arc<Event>, error: String) {
        self.dlq.record(
            subscription_id,
            event.meta.sequence,
            &event.meta.topic,
            DlqKind::HandlerError,
            &error,
            1,
        );
        self.events.emit(RelayEvent::BusDlq {
            subscription: subscription_id.to_owned(),
            sequence: event.meta.sequence,
            kind: DlqKind::HandlerError.as_str().to_owned(),
        });
        tracing::debug!(subscription = %subscription_id, sequence = event.meta.sequence, err = %error, "handler dead-lettered");
    }

    /// Register a subscription. Returns its id.
    pub fn subscribe(
        &self,
        pattern: &str,
        handler: Handler,
        options: SubscribeOptions,
    ) -> Result<String, String> {
        if self.closed.load(Ordering::Acquire) {
            return Err("bus is shut down".to_owned());
        }
        let pattern = TopicPattern::parse(pattern)?;
        let id = format!("sub-{}", self.next_sub_id.fetch_add(1, Ordering::Relaxed));

        let mode = options.mode.unwrap_or(DeliveryMode::Sync);
        let queued = match mode {
            DeliveryMode::Sync => None,
            DeliveryMode::Queued => {
                let state = Arc::new(QueuedState {
                    queue: Mutex::new(VecDeque::new()),
                    depth: options.queue_depth.unwrap_or(self.default_queue_depth).max(1),
                    notify: Notify::new(),
                    cancel: CancellationToken::new(),
                });
                self.spawn_worker(id.clone(), Arc::clone(&state), Arc::clone(&handler));
                Some(state)
            }
        };

        let subscription = Arc::new(Subscription {
            id: id.clone(),
            pattern,
            handler,
            filter: options.filter,
            queued,
        });

        let _guard = self.subscribe_lock.lock();
        let mut next = self.subscriptions.load_full().as_ref().clone();
        next.push(subscription);
        self.subscriptions.store(Arc::new(next));
        Ok(id)
    }

    fn spawn_worker(&self, sub_id: String, state: Arc<QueuedState>, handler: Handler) {
        let dlq = Arc::clone(&self.dlq);
        let events = self.events.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = state.cancel.cancelled() => break,
                    _ = state.notify.notified() => {}
                }
                loop {
                    let next = state.queue.lock().pop_front();
                    let Some(event) = next else { break };
                    if let Err(e) = handler(&event) {
                        dlq.record(
                            &sub_id,
                            event.meta.sequence,
                            &event.meta.topic,
                            DlqKind::HandlerError,
                            &e,
                            1,
                        );
                        events.emit(RelayEvent::BusDlq {
                            subscription: sub_id.clone(),
                            sequence: event.meta.sequence,
                            kind: DlqKind::HandlerError.as_str().to_owned(),
                        });
                    }
                }
            }
        });
    }

    /// Remove a subscription. The handler is unreachable once this returns;
    /// queued entries are discarded.
    pub fn unsubscribe(&self, subscription_id: &str) -> bool {
        let _guard = self.subscribe_lock.lock();
        let current = self.subscriptions.load_full();
        let Some(sub) = current.iter().find(|s| s.id == subscription_id).map(Arc::clone) else {
            return false;
        };
        let next: Vec<Arc<Subscription>> =
            current.iter().filter(|s| s.id != subscription_id).map(Arc::clone).collect();
        self.subscriptions.store(Arc::new(next));

        if let Some(queued) = &sub.queued {
            queued.cancel.cancel();
            queued.queue.lock().clear();
        }
        true
    }

    /// Events retained for `topic` with sequence in `[from, to]` (inclusive;
    /// `to = None` means "through the newest"). A `from` older than the
    /// retained window is an error rather than a silently short answer.
    pub fn replay(
        &self,
        topic: &str,
        from_sequence: u64,
        to_sequence: Option<u64>,
    ) -> Result<Vec<Arc<Event>>, BusError> {
        let topics = self.topics.lock();
        let Some(log) = topics.get(topic) else {
            return Ok(Vec::new());
        };
        let oldest_retained = match log.ring.iter().next() {
            Some(event) => event.meta.sequence,
            None => log.next_sequence,
        };
        if from_sequence < oldest_retained && oldest_retained > 1 {
            return Err(BusError::ReplayTruncated { oldest_retained });
        }
        let to = to_sequence.unwrap_or(u64::MAX);
        Ok(log
            .ring
            .iter()
            .filter(|e| e.meta.sequence >= from_sequence && e.meta.sequence <= to)
            .map(Arc::clone)
            .collect())
    }

    /// Current subscription count (diagnostics).
    pub fn subscription_count(&self) -> usize {
        self.subscriptions.load().len()
    }

    /// Stop delivery: cancel queued workers, drop all subscriptions, refuse
    /// further publishes.
    pub fn shutdown(&self) {
        self.closed.store(true, Ordering::Release);
        let _guard = self.subscribe_lock.lock();
        let current = self.subscriptions.load_full();
        for sub in current.iter() {
            if let Some(queued) = &sub.queued {
                queued.cancel.cancel();
                queued.queue.lock().clear();
            }
        }
        self.subscriptions.store(Arc::new(Vec::new()));
    }
}

#[cfg(test)]
#[path = "bus_tests.rs"]
mod tests;
