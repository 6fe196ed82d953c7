//! # Tower Middleware for Hierarchical LLM Call Tracing
//!
//! This crate instruments calls to generative-model client methods and
//! produces a hierarchical trace of structured records ([`Component`]s)
//! carrying timing, memory, token usage, cost, tags/metrics, and
//! parent/child linkage, without altering the semantics of the wrapped
//! calls in any way.
//!
//! ## Core Concepts
//!
//! - **[`Component`]**: one recorded unit of traced work. Components nest:
//!   a call intercepted while another intercepted call is in flight on the
//!   same logical chain becomes a child of the outer one.
//! - **[`MethodSlot`]** / **[`BlockingSlot`]**: the explicit interception
//!   points. The application calls a slot instead of the raw client method;
//!   [`PatchRegistry::install`] swaps in tracing, `uninstall` restores the
//!   recorded originals.
//! - **[`TraceLayer`]**: the Tower layer behind the slots. It can also be
//!   applied directly to any `Service` in an existing stack.
//! - **[`Tracer`]**: shared state (lifecycle flags, cost table, cumulative
//!   token/cost counters, pending span attributes) plus the entry point for
//!   manual span annotation via [`Tracer::span`].
//! - **[`Extraction`]**: the vendor seam. The core never inspects raw
//!   requests or responses itself; per-provider extraction of model name,
//!   token usage and payloads is injected, and every extraction method
//!   degrades to a default instead of failing.
//! - **[`TraceSink`]**: where finished chain-root components go.
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use serde_json::{json, Value};
//! use tower::{service_fn, BoxError};
//! use tower_llm_trace::{MethodSlot, NoExtraction, PatchRegistry, Tracer, VecSink};
//!
//! # async fn example() -> Result<(), BoxError> {
//! let sink = Arc::new(VecSink::new());
//! let tracer = Tracer::builder().sink(sink.clone()).build();
//!
//! // The application calls the slot instead of the raw client method.
//! let completions: MethodSlot<Value, Value> = MethodSlot::new(
//!     "openai.chat.completions",
//!     "create",
//!     service_fn(|_req: Value| async move {
//!         // ... the real client call ...
//!         Ok::<_, BoxError>(json!({"text": "hello"}))
//!     }),
//! );
//!
//! let registry = PatchRegistry::new(tracer.clone());
//! registry.install(&completions, Arc::new(NoExtraction))?;
//!
//! let _response = completions.call(json!({"model": "gpt-4o"})).await?;
//! assert_eq!(sink.len(), 1);
//!
//! registry.uninstall();
//! # Ok(())
//! # }
//! ```

pub mod adapter;
pub mod attributes;
pub mod builder;
pub mod chain;
pub mod component;
pub mod config;
pub mod cost;
pub mod error;
pub mod extract;
pub mod facade;
pub mod registry;
pub mod tracer;

// Public re-exports for convenience
pub use adapter::{trace_blocking, TraceLayer, Traced};
pub use attributes::{MetricEntry, SpanAttributes};
pub use chain::{Chain, NullSink, TraceSink, VecSink};
pub use component::{
    Component, ComponentId, ComponentKind, ComponentStatus, CostBreakdown, ErrorEnvelope,
    NetworkCall, TokenUsage, UserInteraction,
};
pub use config::{TracerConfig, TracerConfigBuilder};
pub use cost::{CostTable, ModelRate};
pub use error::{Result, TraceError};
pub use extract::{CallIdentity, Extraction, MemoryProbe, NoExtraction, NoProbe, RssProbe};
pub use facade::SpanBuilder;
pub use registry::{BlockingSlot, MethodSlot, PatchRegistry};
pub use tracer::{Totals, Tracer, TracerBuilder};

// Re-export Tower traits that users need
pub use tower::{BoxError, Layer, Service, ServiceExt};
