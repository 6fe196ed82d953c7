//! # Trace Component Data Model
//!
//! A **component** is one recorded unit of traced work: a single invocation
//! of an instrumented client method (or a manually annotated span) together
//! with its timing, memory, token usage, cost, user-declared tags and
//! metrics, and parent/child linkage. Components nest: calls intercepted
//! while another intercepted call is in flight on the same logical chain
//! become `children` of the outer component.
//!
//! The lifecycle of a component is split across two types:
//!
//! - [`OpenComponent`] is the in-flight half: created when the adapter
//!   enters an instrumented call, it carries the fresh id, the stable hash of
//!   the callee, the start timestamp, and the baseline resident memory.
//! - [`Component`] is the finished record produced by the builder once the
//!   call has returned or failed. Publishing consumes the value, so a record
//!   can never be mutated after it has been routed to a parent or a sink.
//!
//! Token and cost accounting use [`TokenUsage`] and [`CostBreakdown`];
//! failures are described by an [`ErrorEnvelope`] carried alongside the
//! record while the original fault travels back to the caller untouched.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::attributes::MetricEntry;
use crate::extract::{CallIdentity, MemoryProbe};

/// A unique identifier for a component, fresh per invocation.
pub type ComponentId = String;

/// Generates a new, unique component ID using UUIDv4.
pub fn gen_component_id() -> ComponentId {
    Uuid::new_v4().to_string()
}

/// Token usage for a single traced call.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TokenUsage {
    /// The number of tokens in the input prompt.
    pub prompt_tokens: u64,

    /// The number of tokens in the generated completion.
    pub completion_tokens: u64,

    /// The total number of tokens (prompt + completion).
    pub total_tokens: u64,
}

impl TokenUsage {
    /// Creates a new `TokenUsage` from the prompt and completion counts.
    pub fn new(prompt_tokens: u64, completion_tokens: u64) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
        }
    }
}

/// Cost attributed to a single traced call, in account currency units.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct CostBreakdown {
    pub input_cost: f64,
    pub output_cost: f64,
    pub total_cost: f64,
}

impl CostBreakdown {
    pub fn new(input_cost: f64, output_cost: f64) -> Self {
        Self {
            input_cost,
            output_cost,
            total_cost: input_cost + output_cost,
        }
    }
}

/// Terminal status of a component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComponentStatus {
    Ok,
    Error,
}

/// The kind of work a component records. Fixed to LLM calls in this core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComponentKind {
    Llm,
}

/// Structured copy of a fault raised by the wrapped call.
///
/// The original fault is always returned to the caller unchanged; this
/// envelope is what the trace record keeps.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorEnvelope {
    pub code: u16,
    #[serde(rename = "type")]
    pub kind: String,
    pub message: String,
}

impl ErrorEnvelope {
    /// Builds an envelope from any displayable error, deriving `kind` from
    /// the error's type name.
    pub fn from_error<E: std::fmt::Display>(err: &E) -> Self {
        Self {
            code: 500,
            kind: short_type_name::<E>().to_string(),
            message: err.to_string(),
        }
    }
}

/// Last path segment of a type name, with generic arguments stripped.
fn short_type_name<T: ?Sized>() -> &'static str {
    let full = std::any::type_name::<T>();
    let base = full.split('<').next().unwrap_or(full);
    base.rsplit("::").next().unwrap_or(base)
}

/// One outbound network call observed while a component was in flight.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NetworkCall {
    pub url: String,
    pub method: String,
    pub status_code: Option<u16>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub response_size_bytes: Option<u64>,
    pub error: Option<String>,
}

/// One user interaction observed while a component was in flight.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserInteraction {
    pub interaction_type: String,
    pub content: Value,
    pub timestamp: DateTime<Utc>,
}

impl UserInteraction {
    pub fn new(interaction_type: impl Into<String>, content: Value) -> Self {
        Self {
            interaction_type: interaction_type.into(),
            content,
            timestamp: Utc::now(),
        }
    }
}

/// The in-flight half of a component: everything captured at entry.
#[derive(Debug, Clone)]
pub struct OpenComponent {
    pub id: ComponentId,
    pub hash_id: String,
    /// Fallback component name when no span name was declared for the call.
    pub default_name: String,
    pub started_at: DateTime<Utc>,
    pub baseline_rss: u64,
}

impl OpenComponent {
    /// Captures entry-time state for an invocation of `identity`.
    pub fn begin(identity: &CallIdentity, probe: &dyn MemoryProbe) -> Self {
        Self {
            id: gen_component_id(),
            hash_id: identity.stable_hash(),
            default_name: identity.method.clone(),
            started_at: Utc::now(),
            baseline_rss: probe.resident_bytes(),
        }
    }
}

/// The finished record of one traced invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Component {
    /// Unique per invocation.
    pub id: ComponentId,
    /// Stable identity of the wrapped callable; repeated invocations of the
    /// same instrumented method share this value.
    pub hash_id: String,
    /// The component this one nests under, if any.
    pub parent_id: Option<ComponentId>,
    #[serde(rename = "type")]
    pub kind: ComponentKind,
    pub name: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub status: ComponentStatus,
    pub error: Option<ErrorEnvelope>,
    pub model: Option<String>,
    pub cost: CostBreakdown,
    pub tokens: TokenUsage,
    /// Resident memory growth over the call, clamped to zero.
    pub memory_used: u64,
    pub tags: Vec<String>,
    pub metadata: Map<String, Value>,
    /// De-duplicated metric entries declared for this span name.
    pub metrics: Vec<MetricEntry>,
    /// Scalar-only, display-limited projection of the call parameters.
    pub parameters: Map<String, Value>,
    /// The full parameter set, structured values included.
    pub extra_parameters: Map<String, Value>,
    /// Sanitized input payload.
    pub input: Value,
    /// Sanitized output payload; absent on the failure path.
    pub output: Option<Value>,
    pub feedback: Option<Value>,
    pub network_calls: Vec<NetworkCall>,
    pub interactions: Vec<UserInteraction>,
    pub children: Vec<Component>,
}

impl Component {
    /// Duration of the call in milliseconds.
    pub fn duration_ms(&self) -> i64 {
        (self.end_time - self.start_time).num_milliseconds()
    }

    pub fn is_error(&self) -> bool {
        self.status == ComponentStatus::Error
    }
}
