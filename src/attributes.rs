//! # Span Attributes
//!
//! User-declared annotations (tags, metadata, metrics, feedback) pending
//! for a span name. Attributes are registered ahead of a call (usually
//! through [`Tracer::span`](crate::tracer::Tracer::span)) and consumed by the
//! component builder when the next matching invocation finishes. Consumption
//! is one-shot: the builder takes the entry out of the store, so a later call
//! under the same name starts clean.
//!
//! Metric declarations arrive as loose JSON values and are validated here:
//! `name` and `score` are required, everything else is optional. Invalid
//! entries are reported to the caller, who logs and skips them; a bad
//! annotation never fails an application call.

use std::collections::HashMap;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Result, TraceError};

/// A validated metric declared against a span.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MetricEntry {
    pub name: String,
    pub score: f64,
    #[serde(default)]
    pub reason: String,
    /// Who produced the metric; declared metrics are always `"user"`.
    #[serde(default = "MetricEntry::default_source")]
    pub source: String,
    pub cost: Option<f64>,
    pub latency: Option<f64>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    #[serde(default)]
    pub config: Map<String, Value>,
}

impl MetricEntry {
    fn default_source() -> String {
        "user".to_string()
    }

    pub fn new(name: impl Into<String>, score: f64) -> Self {
        Self {
            name: name.into(),
            score,
            reason: String::new(),
            source: Self::default_source(),
            cost: None,
            latency: None,
            metadata: Map::new(),
            config: Map::new(),
        }
    }

    /// Validates a loose metric declaration. `name` and `score` are
    /// required; unknown keys are ignored.
    pub fn from_value(value: &Value) -> Result<Self> {
        let object = value
            .as_object()
            .ok_or_else(|| TraceError::InvalidMetric(format!("expected object, got {value}")))?;

        let name = object
            .get("name")
            .and_then(Value::as_str)
            .ok_or_else(|| TraceError::InvalidMetric("missing `name`".to_string()))?;
        let score = object
            .get("score")
            .and_then(Value::as_f64)
            .ok_or_else(|| TraceError::InvalidMetric("missing `score`".to_string()))?;

        let mut entry = Self::new(name, score);
        if let Some(reason) = object.get("reasoning").and_then(Value::as_str) {
            entry.reason = reason.to_string();
        }
        entry.cost = object.get("cost").and_then(Value::as_f64);
        entry.latency = object.get("latency").and_then(Value::as_f64);
        if let Some(metadata) = object.get("metadata").and_then(Value::as_object) {
            entry.metadata = metadata.clone();
        }
        if let Some(config) = object.get("config").and_then(Value::as_object) {
            entry.config = config.clone();
        }
        Ok(entry)
    }
}

/// Picks a unique name for `base`, suffixing repeats in first-seen order:
/// `m`, `m_1`, `m_2`, …
pub(crate) fn suffixed_name(counts: &mut HashMap<String, usize>, base: &str) -> String {
    let seen = counts.entry(base.to_string()).or_insert(0);
    let name = if *seen == 0 {
        base.to_string()
    } else {
        format!("{base}_{seen}")
    };
    *seen += 1;
    name
}

/// Annotations pending for one span name.
#[derive(Debug, Clone, Default)]
pub struct SpanAttributes {
    pub name: String,
    pub tags: Vec<String>,
    pub metadata: Map<String, Value>,
    pub metrics: Vec<MetricEntry>,
    pub feedback: Option<Value>,
}

impl SpanAttributes {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn add_tags(&mut self, tags: impl IntoIterator<Item = String>) {
        self.tags.extend(tags);
    }

    pub fn add_metadata(&mut self, metadata: Map<String, Value>) {
        self.metadata.extend(metadata);
    }

    /// Validates and records one loose metric declaration.
    pub fn add_metric(&mut self, value: &Value) -> Result<()> {
        self.metrics.push(MetricEntry::from_value(value)?);
        Ok(())
    }

    pub fn add_feedback(&mut self, feedback: Value) {
        self.feedback = Some(feedback);
    }

    pub fn is_empty(&self) -> bool {
        self.tags.is_empty()
            && self.metadata.is_empty()
            && self.metrics.is_empty()
            && self.feedback.is_none()
    }
}

/// Store of pending attributes keyed by span name, shared by the tracer.
#[derive(Debug, Default)]
pub(crate) struct AttributeStore {
    entries: Mutex<HashMap<String, SpanAttributes>>,
}

impl AttributeStore {
    /// Runs `f` against the (possibly fresh) entry for `name`.
    pub fn with<R>(&self, name: &str, f: impl FnOnce(&mut SpanAttributes) -> R) -> R {
        let mut entries = self.entries.lock().unwrap();
        let attrs = entries
            .entry(name.to_string())
            .or_insert_with(|| SpanAttributes::new(name));
        f(attrs)
    }

    /// Removes and returns the entry for `name`. One-shot consumption: after
    /// this, the name has no pending attributes.
    pub fn take(&self, name: &str) -> Option<SpanAttributes> {
        self.entries.lock().unwrap().remove(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_metric_validation_requires_name_and_score() {
        let valid = json!({"name": "accuracy", "score": 0.9});
        assert!(MetricEntry::from_value(&valid).is_ok());

        let missing_score = json!({"name": "accuracy"});
        assert!(matches!(
            MetricEntry::from_value(&missing_score),
            Err(TraceError::InvalidMetric(_))
        ));

        let missing_name = json!({"score": 0.9});
        assert!(MetricEntry::from_value(&missing_name).is_err());

        let not_an_object = json!("accuracy");
        assert!(MetricEntry::from_value(&not_an_object).is_err());
    }

    #[test]
    fn test_metric_optional_fields() {
        let value = json!({
            "name": "relevance",
            "score": 0.5,
            "reasoning": "partial match",
            "cost": 0.01,
            "metadata": {"judge": "gpt-4o"}
        });
        let entry = MetricEntry::from_value(&value).unwrap();
        assert_eq!(entry.reason, "partial match");
        assert_eq!(entry.cost, Some(0.01));
        assert_eq!(entry.latency, None);
        assert_eq!(entry.source, "user");
        assert_eq!(entry.metadata.get("judge"), Some(&json!("gpt-4o")));
    }

    #[test]
    fn test_suffixed_name_first_seen_order() {
        let mut counts = HashMap::new();
        assert_eq!(suffixed_name(&mut counts, "m"), "m");
        assert_eq!(suffixed_name(&mut counts, "m"), "m_1");
        assert_eq!(suffixed_name(&mut counts, "m"), "m_2");
        // A different base name keeps its own count even when one prefixes
        // the other.
        assert_eq!(suffixed_name(&mut counts, "m_extra"), "m_extra");
        assert_eq!(suffixed_name(&mut counts, "m"), "m_3");
    }

    #[test]
    fn test_store_take_is_one_shot() {
        let store = AttributeStore::default();
        store.with("generate", |attrs| {
            attrs.add_tags(vec!["qa".to_string()]);
        });

        let taken = store.take("generate").unwrap();
        assert_eq!(taken.tags, vec!["qa".to_string()]);
        assert!(store.take("generate").is_none());
    }

    #[test]
    fn test_attributes_accumulate_before_take() {
        let store = AttributeStore::default();
        store.with("generate", |attrs| {
            attrs.add_tags(vec!["a".to_string()]);
        });
        store.with("generate", |attrs| {
            attrs.add_tags(vec!["b".to_string()]);
            attrs.add_metadata(
                json!({"env": "test"})
                    .as_object()
                    .cloned()
                    .unwrap_or_default(),
            );
        });

        let taken = store.take("generate").unwrap();
        assert_eq!(taken.tags, vec!["a".to_string(), "b".to_string()]);
        assert_eq!(taken.metadata.get("env"), Some(&json!("test")));
        assert!(!taken.is_empty());
    }
}
