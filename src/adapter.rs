//! # Dual-Mode Invocation Adapter
//!
//! The measurement envelope around every instrumented call. Two entry points
//! share one protocol:
//!
//! - [`TraceLayer`] / [`Traced`]: a Tower `Layer`/`Service` pair for
//!   suspending calls. Awaiting the inner service is the only suspension
//!   point; all bookkeeping is synchronous.
//! - [`trace_blocking`]: the same protocol for blocking calls, executed on
//!   the calling thread.
//!
//! With the tracer inactive or LLM instrumentation disabled, the wrapped
//! call passes straight through: no component, no chain access.
//!
//! Otherwise each invocation captures its start timestamp, baseline resident
//! memory, a fresh component id and the callable's stable hash; opens its
//! buffers on the ambient chain (creating one when the task has none); and
//! becomes the current parent for any calls intercepted inside it. On
//! success the extraction collaborators and the cost table fill in the
//! component, the cumulative counters grow, and the original result is
//! returned unchanged. On failure a FAILED component carrying the error
//! envelope is still built and routed, and the original error is returned to
//! the caller untouched; tracing never alters the wrapped call's outcome.
//!
//! Exactly one component is produced per invocation on either path.

use std::fmt::Display;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tower::{Layer, Service};
use tracing::debug;

use crate::builder::{assemble, Draft};
use crate::chain::{with_chain, with_chain_blocking, Chain};
use crate::component::{ComponentId, CostBreakdown, ErrorEnvelope, OpenComponent, TokenUsage};
use crate::extract::{CallIdentity, Extraction, NoExtraction};
use crate::tracer::Tracer;

/// Layer that wraps a client method service with call tracing.
pub struct TraceLayer<Req, Res> {
    tracer: Arc<Tracer>,
    identity: CallIdentity,
    extraction: Arc<dyn Extraction<Req, Res>>,
}

impl<Req, Res> TraceLayer<Req, Res>
where
    Req: Send + 'static,
    Res: Send + 'static,
{
    /// A layer with no vendor extraction: components carry timing, memory
    /// and linkage but default usage and payloads.
    pub fn new(tracer: Arc<Tracer>, identity: CallIdentity) -> Self {
        Self::with_extraction(tracer, identity, Arc::new(NoExtraction))
    }

    pub fn with_extraction(
        tracer: Arc<Tracer>,
        identity: CallIdentity,
        extraction: Arc<dyn Extraction<Req, Res>>,
    ) -> Self {
        Self {
            tracer,
            identity,
            extraction,
        }
    }
}

impl<Req, Res> Clone for TraceLayer<Req, Res> {
    fn clone(&self) -> Self {
        Self {
            tracer: self.tracer.clone(),
            identity: self.identity.clone(),
            extraction: self.extraction.clone(),
        }
    }
}

impl<S, Req, Res> Layer<S> for TraceLayer<Req, Res> {
    type Service = Traced<S, Req, Res>;

    fn layer(&self, inner: S) -> Self::Service {
        Traced {
            inner,
            tracer: self.tracer.clone(),
            identity: self.identity.clone(),
            extraction: self.extraction.clone(),
        }
    }
}

/// Service wrapper produced by [`TraceLayer`].
pub struct Traced<S, Req, Res> {
    inner: S,
    tracer: Arc<Tracer>,
    identity: CallIdentity,
    extraction: Arc<dyn Extraction<Req, Res>>,
}

impl<S: Clone, Req, Res> Clone for Traced<S, Req, Res> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            tracer: self.tracer.clone(),
            identity: self.identity.clone(),
            extraction: self.extraction.clone(),
        }
    }
}

impl<S, Req, Res> Service<Req> for Traced<S, Req, Res>
where
    S: Service<Req, Response = Res> + Send + 'static,
    S::Future: Send + 'static,
    S::Error: Display + Send + 'static,
    Req: Clone + Send + 'static,
    Res: Send + 'static,
{
    type Response = Res;
    type Error = S::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Res, S::Error>> + Send>>;

    fn poll_ready(
        &mut self,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Req) -> Self::Future {
        if !self.tracer.should_trace_llm() {
            return Box::pin(self.inner.call(req));
        }

        let tracer = self.tracer.clone();
        let identity = self.identity.clone();
        let extraction = self.extraction.clone();
        let retained = req.clone();
        let fut = self.inner.call(req);

        Box::pin(async move {
            with_chain(tracer.sink(), move |chain| async move {
                let open = OpenComponent::begin(&identity, tracer.probe());
                let parent_id = chain.parent();
                chain.start_component(open.id.clone());

                let result = {
                    let _parent = chain.scope_parent(open.id.clone());
                    fut.await
                };

                match result {
                    Ok(res) => Ok(finish_success(
                        &tracer,
                        &chain,
                        extraction.as_ref(),
                        open,
                        parent_id,
                        &retained,
                        res,
                    )),
                    Err(err) => {
                        finish_failure(
                            &tracer,
                            &chain,
                            extraction.as_ref(),
                            open,
                            parent_id,
                            &retained,
                            &err,
                        );
                        Err(err)
                    }
                }
            })
            .await
        })
    }
}

/// Blocking counterpart of [`Traced`]: runs `call` on the current thread
/// under the same measurement protocol.
pub fn trace_blocking<Req, Res, E, F>(
    tracer: &Arc<Tracer>,
    identity: &CallIdentity,
    extraction: &dyn Extraction<Req, Res>,
    req: Req,
    call: F,
) -> Result<Res, E>
where
    Req: Clone,
    E: Display,
    F: FnOnce(Req) -> Result<Res, E>,
{
    if !tracer.should_trace_llm() {
        return call(req);
    }

    with_chain_blocking(tracer.sink(), |chain| {
        let open = OpenComponent::begin(identity, tracer.probe());
        let parent_id = chain.parent();
        chain.start_component(open.id.clone());

        let result = {
            let _parent = chain.scope_parent(open.id.clone());
            call(req.clone())
        };

        match result {
            Ok(res) => Ok(finish_success(
                tracer, &chain, extraction, open, parent_id, &req, res,
            )),
            Err(err) => {
                finish_failure(tracer, &chain, extraction, open, parent_id, &req, &err);
                Err(err)
            }
        }
    })
}

/// Success half of the shared protocol: extract, cost, build, merge totals,
/// route, hand the untouched result back.
fn finish_success<Req, Res>(
    tracer: &Tracer,
    chain: &Chain,
    extraction: &dyn Extraction<Req, Res>,
    open: OpenComponent,
    parent_id: Option<ComponentId>,
    req: &Req,
    res: Res,
) -> Res {
    let memory_used = tracer
        .probe()
        .resident_bytes()
        .saturating_sub(open.baseline_rss);

    let model = extraction.model_name(req, Some(&res));
    let usage = extraction.token_usage(&res);
    let cost = tracer
        .cost_table()
        .cost_of(&usage, model.as_deref().unwrap_or_default());
    let parameters = extraction.parameters(req);
    let input = extraction.redact(extraction.input_data(req, Some(&res)));
    let output = extraction.output(&res).map(|value| extraction.redact(value));

    let name = chain
        .declared_name()
        .unwrap_or_else(|| open.default_name.clone());
    let attributes = tracer.take_span_attributes(&name);
    let buffers = chain.end_component(&open.id);

    let component = assemble(Draft {
        open,
        name,
        parent_id,
        model,
        usage,
        cost,
        parameters,
        input,
        output,
        error: None,
        memory_used,
        buffers,
        attributes,
        max_display_parameters: tracer.max_display_parameters(),
    });

    tracer.record_usage(component.tokens, component.cost.total_cost);
    debug!(
        id = %component.id,
        name = %component.name,
        tokens = component.tokens.total_tokens,
        "traced llm call"
    );
    chain.route(component);

    res
}

/// Failure half of the shared protocol: envelope, build, route. The caller
/// re-surfaces the original error afterwards.
fn finish_failure<Req, Res, E>(
    tracer: &Tracer,
    chain: &Chain,
    extraction: &dyn Extraction<Req, Res>,
    open: OpenComponent,
    parent_id: Option<ComponentId>,
    req: &Req,
    err: &E,
) where
    E: Display,
{
    let memory_used = tracer
        .probe()
        .resident_bytes()
        .saturating_sub(open.baseline_rss);

    let envelope = ErrorEnvelope::from_error(err);
    let parameters = extraction.parameters(req);
    let input = extraction.redact(extraction.input_data(req, None));

    let name = chain
        .declared_name()
        .unwrap_or_else(|| open.default_name.clone());
    let attributes = tracer.take_span_attributes(&name);
    let buffers = chain.end_component(&open.id);

    let component = assemble(Draft {
        open,
        name,
        parent_id,
        model: None,
        usage: TokenUsage::default(),
        cost: CostBreakdown::default(),
        parameters,
        input,
        output: None,
        error: Some(envelope),
        memory_used,
        buffers,
        attributes,
        max_display_parameters: tracer.max_display_parameters(),
    });

    debug!(id = %component.id, name = %component.name, "traced failed llm call");
    chain.route(component);
}
