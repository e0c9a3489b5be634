// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Topic pattern matching for subscriptions, webhooks, and trigger rules.
//!
//! Three forms, no regex:
//! - literal: `a.b.c` matches only itself;
//! - suffix wildcard: `a.b.*` matches any topic sharing the dotted prefix
//!   `a.b.` (any depth below it);
//! - segment wildcard: `a.*.c` matches exactly one segment in that position.
//!
//! Matching is O(segments), evaluated per subscriber.

use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Any,
}

/// A parsed topic pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicPattern {
    raw: String,
    segments: Vec<Segment>,
    /// Pattern ended in `.*` (or was `*` alone): match any deeper suffix.
    trailing_any: bool,
}

impl TopicPattern {
    /// Parse a pattern. `*` must stand alone as a whole segment.
    pub fn parse(raw: &str) -> Result<Self, String> {
        if raw.is_empty() {
            return Err("empty pattern".to_owned());
        }
        let mut parts: Vec<&str> = raw.split('.').collect();
        if parts.iter().any(|p| p.is_empty()) {
            return Err(format!("empty segment in pattern: {raw}"));
        }
        let trailing_any = *parts.last().unwrap_or(&"") == "*";
        if trailing_any {
            parts.pop();
        }
        let mut segments = Vec::with_capacity(parts.len());
        for part in parts {
            if part == "*" {
                segments.push(Segment::Any);
            } else if part.contains('*') {
                return Err(format!("wildcard must be a whole segment: {raw}"));
            } else {
                segments.push(Segment::Literal(part.to_owned()));
            }
        }
        Ok(Self { raw: raw.to_owned(), segments, trailing_any })
    }

    /// Whether this pattern matches the given literal topic.
    pub fn matches(&self, topic: &str) -> bool {
        let topic_segments: Vec<&str> = topic.split('.').collect();
        if topic_segments.iter().any(|s| s.is_empty()) {
            return false;
        }
        if self.trailing_any {
            // Needs at least one segment beyond the fixed prefix.
            if topic_segments.len() <= self.segments.len() {
                return false;
            }
        } else if topic_segments.len() != self.segments.len() {
            return false;
        }
        self.segments.iter().zip(topic_segments.iter()).all(|(pattern, topic)| match pattern {
            Segment::Literal(lit) => lit == topic,
            Segment::Any => true,
        })
    }

    /// True when the pattern contains no wildcards at all.
    pub fn is_literal(&self) -> bool {
        !self.trailing_any && self.segments.iter().all(|s| matches!(s, Segment::Literal(_)))
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

impl fmt::Display for TopicPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl std::str::FromStr for TopicPattern {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

#[cfg(test)]
#[path = "pattern_tests.rs"]
mod tests;
