//! Counters of IR pipeline attempts, per callable kind.

use std::collections::HashMap;

use strum::IntoEnumIterator;

use crate::coordinator::CallableKind;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KindCounts {
    pub attempts: u32,
    pub successes: u32,
}

/// A body that went through the direct emitter instead.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fallback {
    pub callable: String,
    pub kind: CallableKind,
    pub reason: String,
}

#[derive(Debug, Default)]
pub struct IrMetrics {
    counts: HashMap<CallableKind, KindCounts>,
    fallbacks: Vec<Fallback>,
}

impl IrMetrics {
    pub fn record_success(&mut self, kind: CallableKind) {
        let counts = self.counts.entry(kind).or_default();
        counts.attempts += 1;
        counts.successes += 1;
    }

    pub fn record_failure(&mut self, kind: CallableKind, callable: &str, reason: &str) {
        self.counts.entry(kind).or_default().attempts += 1;
        self.fallbacks.push(Fallback {
            callable: callable.to_string(),
            kind,
            reason: reason.to_string(),
        });
    }

    pub fn counts(&self, kind: CallableKind) -> KindCounts {
        self.counts.get(&kind).copied().unwrap_or_default()
    }

    pub fn attempts(&self, kind: CallableKind) -> u32 {
        self.counts(kind).attempts
    }

    pub fn successes(&self, kind: CallableKind) -> u32 {
        self.counts(kind).successes
    }

    pub fn fallbacks(&self) -> &[Fallback] {
        &self.fallbacks
    }

    /// Fallback reasons, most frequent first.
    pub fn reason_histogram(&self) -> Vec<(&str, usize)> {
        let mut histogram: HashMap<&str, usize> = HashMap::new();
        for fallback in &self.fallbacks {
            *histogram.entry(fallback.reason.as_str()).or_default() += 1;
        }
        let mut histogram: Vec<_> = histogram.into_iter().collect();
        histogram.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(b.0)));
        histogram
    }

    pub fn to_json(&self) -> json::JsonValue {
        let mut kinds = json::JsonValue::new_object();
        for kind in CallableKind::iter() {
            let counts = self.counts(kind);
            kinds[kind.name()] = json::object! {
                attempts: counts.attempts,
                successes: counts.successes,
            };
        }

        let fallbacks: Vec<json::JsonValue> = self
            .fallbacks
            .iter()
            .map(|fallback| {
                json::object! {
                    callable: fallback.callable.as_str(),
                    kind: fallback.kind.name(),
                    reason: fallback.reason.as_str(),
                }
            })
            .collect();

        json::object! {
            kinds: kinds,
            fallbacks: fallbacks,
        }
    }
}
