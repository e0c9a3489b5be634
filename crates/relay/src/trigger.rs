// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Declarative trigger rules: event pattern + predicate → action.
//!
//! Rules evaluate in insertion order. A predicate that fails disables its
//! rule and emits `rule-disabled`; the event continues through later rules.
//! Re-publishing actions carry a hop counter so a rule chain cannot loop
//! forever — events past the depth cap are dropped and counted.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use indexmap::IndexMap;
use parking_lot::RwLock;
use serde::Serialize;

use crate::bus::pattern::TopicPattern;
use crate::bus::{Event, EventBus, EventMeta, PublishOptions};
use crate::events::{epoch_ms, EventHub, RelayEvent};
use crate::webhook::WebhookDispatcher;

/// Pure predicate over an event. `None` on a rule means "always matches".
pub type Predicate = Arc<dyn Fn(&Event) -> Result<bool, String> + Send + Sync>;

/// Rewrites an event's payload before webhook handoff.
pub type PayloadTransform = Arc<dyn Fn(&Event) -> bytes::Bytes + Send + Sync>;

/// What to do with a matched event.
#[derive(Clone)]
pub enum TriggerAction {
    /// Hand off to a registered webhook by id, optionally rewriting the
    /// payload first.
    Webhook { id: String, transform: Option<PayloadTransform> },
    /// Re-publish onto the bus under a new topic, hop counter bumped.
    Bus { topic: String },
    /// Invoke an in-process handler.
    Handler(Arc<dyn Fn(&Event) + Send + Sync>),
}

impl TriggerAction {
    fn describe(&self) -> String {
        match self {
            Self::Webhook { id, .. } => format!("webhook:{id}"),
            Self::Bus { topic } => format!("bus:{topic}"),
            Self::Handler(_) => "handler".to_owned(),
        }
    }
}

pub struct TriggerRule {
    pub id: String,
    pub pattern: TopicPattern,
    predicate: Option<Predicate>,
    pub action: TriggerAction,
    enabled: AtomicBool,
}

/// Rule description for listing over HTTP.
#[derive(Debug, Clone, Serialize)]
pub struct TriggerRuleView {
    pub id: String,
    pub pattern: String,
    pub action: String,
    pub enabled: bool,
}

pub struct TriggerEngine {
    rules: RwLock<IndexMap<String, Arc<TriggerRule>>>,
    bus: Arc<EventBus>,
    webhooks: WebhookDispatcher,
    events: EventHub,
    max_fanout_depth: u32,
    pub fanout_depth_exceeded: AtomicU64,
}

impl TriggerEngine {
    pub fn new(
        bus: Arc<EventBus>,
        webhooks: WebhookDispatcher,
        events: EventHub,
        max_fanout_depth: u32,
    ) -> Self {
        Self {
            rules: RwLock::new(IndexMap::new()),
            bus,
            webhooks,
            events,
            max_fanout_depth,
            fanout_depth_exceeded: AtomicU64::new(0),
        }
    }

    /// Install a rule. Returns its id; a duplicate id is an error.
    pub fn install_rule(
        &self,
        id: Option<String>,
        pattern: &str,
        predicate: Option<Predicate>,
        action: TriggerAction,
    ) -> Result<String, String> {
        let pattern = TopicPattern::parse(pattern)?;
        let id = id.unwrap_or_else(|| format!("rule_{}", uuid::Uuid::new_v4()));
        let rule = Arc::new(TriggerRule {
            id: id.clone(),
            pattern,
            predicate,
            action,
            enabled: AtomicBool::new(true),
        });
        let mut rules = self.rules.write();
        if rules.contains_key(&id) {
            return Err(format!("rule already installed: {id}"));
        }
        rules.insert(id.clone(), rule);
        tracing::info!(rule = %id, "trigger rule installed");
        Ok(id)
    }

    pub fn remove_rule(&self, id: &str) -> bool {
        self.rules.write().shift_remove(id).is_some()
    }

    pub fn list_rules(&self) -> Vec<TriggerRuleView> {
        self.rules
            .read()
            .values()
            .map(|r| TriggerRuleView {
                id: r.id.clone(),
                pattern: r.pattern.as_str().to_owned(),
                action: r.action.describe(),
                enabled: r.enabled.load(Ordering::Relaxed),
            })
            .collect()
    }

    /// Evaluate an event against all rules, in insertion order.
    pub fn ingest(&self, event: &Arc<Event>) {
        if event.meta.hops > self.max_fanout_depth {
            self.fanout_depth_exceeded.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(
                topic = %event.meta.topic,
                hops = event.meta.hops,
                "event dropped: trigger fan-out depth exceeded"
            );
            return;
        }

        let rules: Vec<Arc<TriggerRule>> = self.rules.read().values().map(Arc::clone).collect();
        for rule in rules {
            if !rule.enabled.load(Ordering::Acquire) {
                continue;
            }
            if !rule.pattern.matches(&event.meta.topic) {
                continue;
            }
            if let Some(predicate) = &rule.predicate {
                match predicate(event) {
                    Ok(true) => {}
                    Ok(false) => continue,
                    Err(e) => {
                        rule.enabled.store(false, Ordering::Release);
                        self.events.emit(RelayEvent::RuleDisabled {
                            rule: rule.id.clone(),
                            error: e.clone(),
                        });
                        tracing::warn!(rule = %rule.id, err = %e, "predicate failed, rule disabled");
                        continue;
                    }
                }
            }
            self.run_action(&rule, event);
        }
    }

    fn run_action(&self, rule: &TriggerRule, event: &Arc<Event>) {
        match &rule.action {
            TriggerAction::Webhook { id, transform } => {
                let delivered = match transform {
                    Some(transform) => {
                        let rewritten =
                            Event { meta: event.meta.clone(), payload: transform(event) };
                        self.webhooks.dispatch_to(id, &rewritten)
                    }
                    None => self.webhooks.dispatch_to(id, event),
                };
                if !delivered {
                    tracing::warn!(rule = %rule.id, webhook = %id, "trigger action hit unknown webhook");
                }
            }
            TriggerAction::Bus { topic } => {
                let options = PublishOptions {
                    content_type: Some(event.meta.content_type.clone()),
                    correlation_id: event.meta.correlation_id.clone(),
                    hops: event.meta.hops + 1,
                };
                match self.bus.publish(topic, event.payload.clone(), options) {
                    Ok(sequence) => {
                        // The re-published event re-enters rule evaluation so
                        // chains compose; the hop counter bounds the chain.
                        let chained = Arc::new(Event {
                            meta: EventMeta {
                                topic: topic.clone(),
                                sequence,
                                timestamp_ms: epoch_ms(),
                                content_type: event.meta.content_type.clone(),
                                correlation_id: event.meta.correlation_id.clone(),
                                hops: event.meta.hops + 1,
                            },
                            payload: event.payload.clone(),
                        });
                        self.ingest(&chained);
                    }
                    Err(e) => {
                        tracing::warn!(rule = %rule.id, topic = %topic, err = %e, "trigger re-publish failed");
                    }
                }
            }
            TriggerAction::Handler(handler) => handler(event),
        }
    }
}

#[cfg(test)]
#[path = "trigger_tests.rs"]
mod tests;
