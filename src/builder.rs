//! # Component Builder
//!
//! Pure assembly of the final [`Component`] record: raw measurement, the
//! extraction collaborators' outputs, the contents of the component's closed
//! buffers, and the span name's declared attributes go in; a finished record
//! comes out. Nothing here performs I/O or suspends: the builder runs on
//! the hot path between a call returning and its component being routed.
//!
//! Two projections happen during assembly:
//!
//! - **Parameter display projection**: only scalar parameters (string,
//!   integer, float, boolean; an explicit match over the JSON variants, not
//!   a stringly probe) make it into `parameters`, capped at a fixed maximum
//!   in first-seen order. The full set, structured values included, is kept
//!   in `extra_parameters`.
//! - **Metric de-duplication**: metric names within one component are made
//!   unique by suffixing repeats in first-seen order (`m`, `m_1`, `m_2`).

use std::collections::HashMap;

use chrono::Utc;
use serde_json::{Map, Value};

use crate::attributes::{suffixed_name, MetricEntry, SpanAttributes};
use crate::chain::OpenBuffers;
use crate::component::{
    Component, ComponentId, ComponentKind, ComponentStatus, CostBreakdown, ErrorEnvelope,
    OpenComponent, TokenUsage,
};

/// Default cap on the number of parameters kept in the display projection.
pub const MAX_DISPLAY_PARAMETERS: usize = 10;

/// Everything the builder needs to assemble one component.
pub(crate) struct Draft {
    pub open: OpenComponent,
    pub name: String,
    pub parent_id: Option<ComponentId>,
    pub model: Option<String>,
    pub usage: TokenUsage,
    pub cost: CostBreakdown,
    pub parameters: Map<String, Value>,
    pub input: Value,
    pub output: Option<Value>,
    pub error: Option<ErrorEnvelope>,
    pub memory_used: u64,
    pub buffers: OpenBuffers,
    /// Declared attributes already taken (one-shot) from the tracer's store.
    pub attributes: Option<SpanAttributes>,
    pub max_display_parameters: usize,
}

/// Assembles the finished record. The end timestamp is taken here, so the
/// builder must run immediately after the wrapped call completes.
pub(crate) fn assemble(draft: Draft) -> Component {
    let attributes = draft.attributes.unwrap_or_default();

    let status = if draft.error.is_some() {
        ComponentStatus::Error
    } else {
        ComponentStatus::Ok
    };

    Component {
        id: draft.open.id,
        hash_id: draft.open.hash_id,
        parent_id: draft.parent_id,
        kind: ComponentKind::Llm,
        name: draft.name,
        start_time: draft.open.started_at,
        end_time: Utc::now(),
        status,
        error: draft.error,
        model: draft.model,
        cost: draft.cost,
        tokens: draft.usage,
        memory_used: draft.memory_used,
        tags: attributes.tags,
        metadata: attributes.metadata,
        metrics: dedup_metrics(attributes.metrics),
        parameters: display_parameters(&draft.parameters, draft.max_display_parameters),
        extra_parameters: draft.parameters,
        input: draft.input,
        output: draft.output,
        feedback: attributes.feedback,
        network_calls: draft.buffers.network_calls,
        interactions: draft.buffers.interactions,
        children: draft.buffers.children,
    }
}

/// Scalar-only projection of `parameters`, capped at `max` entries in
/// first-seen order. Structured values (objects, arrays, nulls) are dropped.
pub(crate) fn display_parameters(parameters: &Map<String, Value>, max: usize) -> Map<String, Value> {
    let mut display = Map::new();
    for (key, value) in parameters {
        if display.len() >= max {
            break;
        }
        match value {
            Value::String(_) | Value::Number(_) | Value::Bool(_) => {
                display.insert(key.clone(), value.clone());
            }
            Value::Null | Value::Array(_) | Value::Object(_) => {}
        }
    }
    display
}

/// Makes metric names unique within one component.
pub(crate) fn dedup_metrics(metrics: Vec<MetricEntry>) -> Vec<MetricEntry> {
    let mut counts = HashMap::new();
    metrics
        .into_iter()
        .map(|mut metric| {
            metric.name = suffixed_name(&mut counts, &metric.name);
            metric
        })
        .collect()
}
