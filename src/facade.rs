//! # Span Annotation Facade
//!
//! Lets application code wrap arbitrary functions, suspending or blocking,
//! as named spans, reusing the same builder and propagation machinery as the
//! installed interceptors. Obtain a [`SpanBuilder`] from
//! [`Tracer::span`](crate::tracer::Tracer::span), declare tags, metadata,
//! metrics or feedback, then `run` the function:
//!
//! ```rust,no_run
//! # use std::sync::Arc;
//! # use tower_llm_trace::{Tracer, VecSink};
//! # async fn example() {
//! let tracer = Tracer::builder().sink(Arc::new(VecSink::new())).build();
//! let answer = tracer
//!     .span("generate-answer")
//!     .tag("qa")
//!     .metric(serde_json::json!({"name": "groundedness", "score": 0.8}))
//!     .run(|| async {
//!         // ... perform exactly one instrumented client call ...
//!         Ok::<_, std::convert::Infallible>("answer")
//!     })
//!     .await;
//! # }
//! ```
//!
//! The facade does not build its own component. It opens a capture frame on
//! the chain; the component the adapter builds for the instrumented call
//! inside is deposited there, and the facade adopts it: stamps the declared
//! name, attaches the error envelope if the wrapped function failed,
//! attaches the interactions accumulated under its span id, and publishes it.
//!
//! This adoption is single-flight: the frame keeps the most
//! recently deposited component, so a span whose function performs several
//! chain-root instrumented calls publishes only the last one. A span whose
//! function performs none publishes nothing (logged at warn level).

use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;

use serde_json::{Map, Value};
use tracing::{error, warn};

use crate::chain::{with_chain, with_chain_blocking, Chain, OpenBuffers};
use crate::component::{gen_component_id, Component, ComponentStatus, ErrorEnvelope};
use crate::tracer::Tracer;

/// Builder for a named span around an arbitrary function.
pub struct SpanBuilder {
    tracer: Arc<Tracer>,
    name: String,
    tags: Vec<String>,
    metadata: Map<String, Value>,
    metrics: Vec<Value>,
    feedback: Option<Value>,
}

impl SpanBuilder {
    pub(crate) fn new(tracer: Arc<Tracer>, name: String) -> Self {
        Self {
            tracer,
            name,
            tags: Vec::new(),
            metadata: Map::new(),
            metrics: Vec::new(),
            feedback: None,
        }
    }

    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    pub fn tags(mut self, tags: impl IntoIterator<Item = String>) -> Self {
        self.tags.extend(tags);
        self
    }

    pub fn metadata(mut self, metadata: Map<String, Value>) -> Self {
        self.metadata.extend(metadata);
        self
    }

    /// Declares one metric as a loose value; requires `name` and `score`.
    /// Invalid entries are logged and skipped at registration, never fatal.
    pub fn metric(mut self, metric: Value) -> Self {
        self.metrics.push(metric);
        self
    }

    pub fn metrics(mut self, metrics: impl IntoIterator<Item = Value>) -> Self {
        self.metrics.extend(metrics);
        self
    }

    pub fn feedback(mut self, feedback: Value) -> Self {
        self.feedback = Some(feedback);
        self
    }

    /// Registers the declared attributes against the span's name without
    /// wrapping a call. The next matching invocation consumes them.
    pub fn declare(&self) {
        self.tracer.with_span_attributes(&self.name, |attrs| {
            attrs.add_tags(self.tags.iter().cloned());
            attrs.add_metadata(self.metadata.clone());
            for metric in &self.metrics {
                if let Err(err) = attrs.add_metric(metric) {
                    error!(span = %self.name, %err, "skipping invalid metric");
                }
            }
            if let Some(feedback) = &self.feedback {
                attrs.add_feedback(feedback.clone());
            }
        });
    }

    /// Wraps a suspending function as this span.
    pub async fn run<F, Fut, T, E>(self, f: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
    {
        self.declare();
        let tracer = self.tracer;
        let name = self.name;

        if !tracer.is_active() {
            return f().await;
        }

        with_chain(tracer.sink(), move |chain| async move {
            let id = gen_component_id();
            chain.push_declared_name(name.clone());
            chain.start_component(id.clone());
            chain.push_capture();

            let result = f().await;

            let captured = chain.pop_capture();
            chain.pop_declared_name();
            let buffers = chain.end_component(&id);

            adopt(&chain, &name, captured, buffers, result.as_ref().err());
            result
        })
        .await
    }

    /// Wraps a blocking function as this span.
    pub fn run_blocking<F, T, E>(self, f: F) -> Result<T, E>
    where
        F: FnOnce() -> Result<T, E>,
        E: Display,
    {
        self.declare();
        let tracer = self.tracer;
        let name = self.name;

        if !tracer.is_active() {
            return f();
        }

        with_chain_blocking(tracer.sink(), move |chain| {
            let id = gen_component_id();
            chain.push_declared_name(name.clone());
            chain.start_component(id.clone());
            chain.push_capture();

            let result = f();

            let captured = chain.pop_capture();
            chain.pop_declared_name();
            let buffers = chain.end_component(&id);

            adopt(&chain, &name, captured, buffers, result.as_ref().err());
            result
        })
    }
}

/// Stamps and publishes the component the adapter deposited for this span.
fn adopt<E: Display>(
    chain: &Chain,
    name: &str,
    captured: Option<Component>,
    buffers: OpenBuffers,
    failure: Option<&E>,
) {
    let Some(mut component) = captured else {
        warn!(span = %name, "no instrumented call inside span; nothing to publish");
        return;
    };

    component.name = name.to_string();
    if let Some(err) = failure {
        component.status = ComponentStatus::Error;
        component.error = Some(ErrorEnvelope::from_error(err));
    }
    component.interactions.extend(buffers.interactions);
    chain.publish(component);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::TraceLayer;
    use crate::chain::VecSink;
    use crate::component::{TokenUsage, UserInteraction};
    use crate::cost::{CostTable, ModelRate};
    use crate::extract::{CallIdentity, Extraction};
    use serde_json::json;
    use std::collections::HashMap;
    use thiserror::Error;
    use tower::util::BoxCloneService;
    use tower::{service_fn, BoxError, Layer, Service, ServiceExt};

    #[derive(Debug, Error)]
    #[error("{0}")]
    struct ValueError(String);

    struct FakeExtraction;

    impl Extraction<Value, Value> for FakeExtraction {
        fn model_name(&self, req: &Value, _res: Option<&Value>) -> Option<String> {
            req.get("model").and_then(Value::as_str).map(String::from)
        }

        fn token_usage(&self, res: &Value) -> TokenUsage {
            TokenUsage::new(
                res["tokens"]["prompt"].as_u64().unwrap_or(0),
                res["tokens"]["completion"].as_u64().unwrap_or(0),
            )
        }
    }

    fn tracer_with_sink() -> (Arc<Tracer>, Arc<VecSink>) {
        let sink = Arc::new(VecSink::new());
        let mut rates = HashMap::new();
        rates.insert("model-x".to_string(), ModelRate::new(0.01, 0.02));
        let tracer = Tracer::builder()
            .sink(sink.clone())
            .cost_table(CostTable::new(rates))
            .build();
        (tracer, sink)
    }

    fn traced_client(
        tracer: &Arc<Tracer>,
    ) -> crate::adapter::Traced<BoxCloneService<Value, Value, BoxError>, Value, Value> {
        let layer = TraceLayer::with_extraction(
            tracer.clone(),
            CallIdentity::new("fake.chat.completions", "create"),
            Arc::new(FakeExtraction),
        );
        layer.layer(BoxCloneService::new(service_fn(|req: Value| async move {
            if req.get("fail").is_some() {
                return Err(BoxError::from("upstream unavailable"));
            }
            Ok(json!({"tokens": {"prompt": 10, "completion": 5}}))
        })))
    }

    #[tokio::test]
    async fn span_adopts_and_renames_the_inner_component() {
        let (tracer, sink) = tracer_with_sink();
        let client = traced_client(&tracer);

        let result: Result<&str, ValueError> = tracer
            .span("generate-answer")
            .tag("qa")
            .metric(json!({"name": "m", "score": 0.5}))
            .metric(json!({"name": "m", "score": 0.6}))
            .run(|| async {
                let mut client = client.clone();
                client
                    .ready()
                    .await
                    .unwrap()
                    .call(json!({"model": "model-x"}))
                    .await
                    .unwrap();
                Ok("answer")
            })
            .await;

        assert_eq!(result.unwrap(), "answer");
        let components = sink.drain();
        assert_eq!(components.len(), 1);
        let component = &components[0];
        assert_eq!(component.name, "generate-answer");
        assert_eq!(component.tags, vec!["qa".to_string()]);
        assert_eq!(component.model.as_deref(), Some("model-x"));
        let names: Vec<_> = component.metrics.iter().map(|m| m.name.as_str()).collect();
        assert_eq!(names, vec!["m", "m_1"]);
        assert_eq!(component.status, ComponentStatus::Ok);
    }

    #[tokio::test]
    async fn span_stamps_failure_of_the_wrapped_function() {
        let (tracer, sink) = tracer_with_sink();
        let client = traced_client(&tracer);

        let result: Result<(), ValueError> = tracer
            .span("generate-answer")
            .run(|| async {
                let mut client = client.clone();
                client
                    .ready()
                    .await
                    .unwrap()
                    .call(json!({"model": "model-x"}))
                    .await
                    .unwrap();
                Err(ValueError("postprocessing failed".to_string()))
            })
            .await;

        assert_eq!(result.unwrap_err().to_string(), "postprocessing failed");
        let components = sink.drain();
        assert_eq!(components.len(), 1);
        let component = &components[0];
        assert_eq!(component.status, ComponentStatus::Error);
        let envelope = component.error.as_ref().unwrap();
        assert_eq!(envelope.kind, "ValueError");
        assert_eq!(envelope.message, "postprocessing failed");
    }

    #[tokio::test]
    async fn span_without_instrumented_call_publishes_nothing() {
        let (tracer, sink) = tracer_with_sink();

        let result: Result<u32, ValueError> =
            tracer.span("pure-logic").run(|| async { Ok(42) }).await;

        assert_eq!(result.unwrap(), 42);
        assert!(sink.is_empty());
    }

    #[tokio::test]
    async fn inactive_tracer_passes_span_through() {
        let (tracer, sink) = tracer_with_sink();
        tracer.set_active(false);
        let client = traced_client(&tracer);

        let result: Result<(), ValueError> = tracer
            .span("generate-answer")
            .run(|| async {
                let mut client = client.clone();
                client
                    .ready()
                    .await
                    .unwrap()
                    .call(json!({"model": "model-x"}))
                    .await
                    .unwrap();
                Ok(())
            })
            .await;

        assert!(result.is_ok());
        assert!(sink.is_empty());
    }

    #[tokio::test]
    async fn invalid_metric_declarations_are_skipped() {
        let (tracer, sink) = tracer_with_sink();
        let client = traced_client(&tracer);

        let _: Result<(), ValueError> = tracer
            .span("generate-answer")
            .metric(json!({"name": "valid", "score": 1.0}))
            .metric(json!({"name": "no-score"}))
            .metric(json!("not an object"))
            .run(|| async {
                let mut client = client.clone();
                client
                    .ready()
                    .await
                    .unwrap()
                    .call(json!({"model": "model-x"}))
                    .await
                    .unwrap();
                Ok(())
            })
            .await;

        let components = sink.drain();
        assert_eq!(components[0].metrics.len(), 1);
        assert_eq!(components[0].metrics[0].name, "valid");
    }

    #[tokio::test]
    async fn capture_frame_keeps_most_recent_component() {
        // Single-flight assumption: with two chain-root instrumented calls
        // inside one span, the span adopts the second and the first is lost.
        let (tracer, sink) = tracer_with_sink();
        let client = traced_client(&tracer);

        let _: Result<(), ValueError> = tracer
            .span("double-call")
            .run(|| async {
                for _ in 0..2 {
                    let mut client = client.clone();
                    client
                        .ready()
                        .await
                        .unwrap()
                        .call(json!({"model": "model-x"}))
                        .await
                        .unwrap();
                }
                Ok(())
            })
            .await;

        let components = sink.drain();
        assert_eq!(components.len(), 1);
        assert_eq!(components[0].name, "double-call");
    }

    #[tokio::test]
    async fn span_attaches_interactions_recorded_inside() {
        let (tracer, sink) = tracer_with_sink();
        tracer.instrument_user_interactions();
        let client = traced_client(&tracer);
        let recorder = tracer.clone();

        let _: Result<(), ValueError> = tracer
            .span("generate-answer")
            .run(|| async {
                let mut client = client.clone();
                client
                    .ready()
                    .await
                    .unwrap()
                    .call(json!({"model": "model-x"}))
                    .await
                    .unwrap();
                recorder.record_interaction(UserInteraction::new("approval", json!("yes")));
                Ok(())
            })
            .await;

        let components = sink.drain();
        assert_eq!(components.len(), 1);
        assert_eq!(components[0].interactions.len(), 1);
        assert_eq!(components[0].interactions[0].interaction_type, "approval");
    }

    #[test]
    fn blocking_span_shares_the_machinery() {
        let (tracer, sink) = tracer_with_sink();
        let identity = CallIdentity::new("fake.completions", "complete");
        let inner_tracer = tracer.clone();

        let result: Result<&str, ValueError> =
            tracer.span("blocking-answer").run_blocking(|| {
                crate::adapter::trace_blocking(
                    &inner_tracer,
                    &identity,
                    &FakeExtraction,
                    json!({"model": "model-x"}),
                    |_req| Ok::<_, ValueError>(json!({"tokens": {"prompt": 1, "completion": 1}})),
                )?;
                Ok("done")
            });

        assert_eq!(result.unwrap(), "done");
        let components = sink.drain();
        assert_eq!(components.len(), 1);
        assert_eq!(components[0].name, "blocking-answer");
    }
}
