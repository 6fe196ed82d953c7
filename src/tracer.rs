//! # Tracer
//!
//! Shared state for one tracing installation: the lifecycle flags, the cost
//! table, the cumulative token/cost counters, the pending span attributes,
//! and the collaborators (sink, memory probe) every traced call consults.
//!
//! The tracer does not own the decision to trace: it consumes flags the
//! host sets: the master `active` switch and the per-feature auto-instrument
//! toggles. With the tracer inactive, instrumented calls behave exactly like
//! their un-instrumented originals.
//!
//! A `Tracer` is shared behind an [`Arc`] between the patch registry, the
//! installed layers, and application code that annotates spans or records
//! network calls and interactions.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, error};

use crate::attributes::{suffixed_name, AttributeStore, MetricEntry, SpanAttributes};
use crate::chain::{Chain, NullSink, TraceSink};
use crate::component::{NetworkCall, TokenUsage, UserInteraction};
use crate::config::TracerConfig;
use crate::cost::CostTable;
use crate::extract::{CallIdentity, Extraction, MemoryProbe, RssProbe};
use crate::facade::SpanBuilder;

/// Cumulative token and cost counters across the tracer's lifetime.
///
/// Monotonically non-decreasing: merges only ever add.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Totals {
    pub total_tokens: u64,
    pub total_cost: f64,
}

/// Shared tracing state. See the module docs.
pub struct Tracer {
    active: AtomicBool,
    instrument_llm: AtomicBool,
    instrument_network: AtomicBool,
    instrument_interactions: AtomicBool,
    max_display_parameters: usize,
    cost_table: CostTable,
    totals: Mutex<Totals>,
    attributes: AttributeStore,
    trace_metrics: Mutex<Vec<MetricEntry>>,
    trace_metric_counts: Mutex<HashMap<String, usize>>,
    sink: Arc<dyn TraceSink>,
    probe: Arc<dyn MemoryProbe>,
}

impl Tracer {
    pub fn builder() -> TracerBuilder {
        TracerBuilder::new()
    }

    /// Master switch. Inactive tracing is indistinguishable from calling the
    /// un-instrumented function.
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Relaxed)
    }

    pub fn set_active(&self, active: bool) {
        self.active.store(active, Ordering::Relaxed);
    }

    /// Enable LLM call instrumentation.
    pub fn instrument_llm_calls(&self) {
        self.instrument_llm.store(true, Ordering::Relaxed);
    }

    /// Enable network call capture for in-flight components.
    pub fn instrument_network_calls(&self) {
        self.instrument_network.store(true, Ordering::Relaxed);
    }

    /// Enable user interaction capture for in-flight components.
    pub fn instrument_user_interactions(&self) {
        self.instrument_interactions.store(true, Ordering::Relaxed);
    }

    /// Whether an instrumented LLM call should be traced at all.
    pub(crate) fn should_trace_llm(&self) -> bool {
        self.is_active() && self.instrument_llm.load(Ordering::Relaxed)
    }

    /// Snapshot of the cumulative counters.
    pub fn totals(&self) -> Totals {
        *self.totals.lock().unwrap()
    }

    /// Merges one finished call's usage into the cumulative counters.
    pub(crate) fn record_usage(&self, usage: TokenUsage, cost_total: f64) {
        let mut totals = self.totals.lock().unwrap();
        totals.total_tokens += usage.total_tokens;
        totals.total_cost += cost_total.max(0.0);
    }

    /// Starts annotating the span named `name`. See [`SpanBuilder`].
    pub fn span(self: &Arc<Self>, name: impl Into<String>) -> SpanBuilder {
        SpanBuilder::new(Arc::clone(self), name.into())
    }

    /// Adds a trace-level metric from a loose declaration. Requires `name`
    /// and `score`; invalid entries are logged and skipped. Duplicate names
    /// are suffixed in first-seen order.
    pub fn add_metric(&self, value: &Value) {
        match MetricEntry::from_value(value) {
            Ok(mut metric) => {
                let mut counts = self.trace_metric_counts.lock().unwrap();
                metric.name = suffixed_name(&mut counts, &metric.name);
                drop(counts);
                debug!(name = %metric.name, score = metric.score, "added trace metric");
                self.trace_metrics.lock().unwrap().push(metric);
            }
            Err(err) => error!(%err, "skipping invalid trace metric"),
        }
    }

    /// Drains the accumulated trace-level metrics.
    pub fn take_trace_metrics(&self) -> Vec<MetricEntry> {
        std::mem::take(&mut *self.trace_metrics.lock().unwrap())
    }

    /// Records a network call against the innermost in-flight component on
    /// this chain. Dropped unless network instrumentation is enabled and a
    /// component is open.
    pub fn record_network_call(&self, call: NetworkCall) {
        if !self.is_active() || !self.instrument_network.load(Ordering::Relaxed) {
            return;
        }
        let Some(chain) = Chain::try_current() else {
            debug!("network call recorded outside any chain; dropping");
            return;
        };
        if !chain.record_network_call(call) {
            debug!("network call recorded with no open component; dropping");
        }
    }

    /// Records a user interaction against the innermost in-flight component
    /// on this chain. Dropped unless interaction instrumentation is enabled
    /// and a component is open.
    pub fn record_interaction(&self, interaction: UserInteraction) {
        if !self.is_active() || !self.instrument_interactions.load(Ordering::Relaxed) {
            return;
        }
        let Some(chain) = Chain::try_current() else {
            debug!("interaction recorded outside any chain; dropping");
            return;
        };
        if !chain.record_interaction(interaction) {
            debug!("interaction recorded with no open component; dropping");
        }
    }

    /// Builds a [`TraceLayer`](crate::adapter::TraceLayer) bound to this
    /// tracer for the given method identity.
    pub fn layer<Req, Res>(
        self: &Arc<Self>,
        identity: CallIdentity,
        extraction: Arc<dyn Extraction<Req, Res>>,
    ) -> crate::adapter::TraceLayer<Req, Res>
    where
        Req: Send + 'static,
        Res: Send + 'static,
    {
        crate::adapter::TraceLayer::with_extraction(Arc::clone(self), identity, extraction)
    }

    pub(crate) fn with_span_attributes<R>(
        &self,
        name: &str,
        f: impl FnOnce(&mut SpanAttributes) -> R,
    ) -> R {
        self.attributes.with(name, f)
    }

    /// One-shot removal of the pending attributes for `name`.
    pub(crate) fn take_span_attributes(&self, name: &str) -> Option<SpanAttributes> {
        self.attributes.take(name)
    }

    pub(crate) fn max_display_parameters(&self) -> usize {
        self.max_display_parameters
    }

    pub(crate) fn cost_table(&self) -> &CostTable {
        &self.cost_table
    }

    pub(crate) fn probe(&self) -> &dyn MemoryProbe {
        self.probe.as_ref()
    }

    pub(crate) fn sink(&self) -> Arc<dyn TraceSink> {
        self.sink.clone()
    }
}

impl std::fmt::Debug for Tracer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tracer")
            .field("active", &self.is_active())
            .field("totals", &self.totals())
            .finish()
    }
}

/// Builder for [`Tracer`].
pub struct TracerBuilder {
    config: TracerConfig,
    sink: Option<Arc<dyn TraceSink>>,
    probe: Option<Arc<dyn MemoryProbe>>,
    cost_table: Option<CostTable>,
}

impl Default for TracerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl TracerBuilder {
    pub fn new() -> Self {
        Self {
            config: TracerConfig::default(),
            sink: None,
            probe: None,
            cost_table: None,
        }
    }

    pub fn config(mut self, config: TracerConfig) -> Self {
        self.config = config;
        self
    }

    /// Where chain-root components are published.
    pub fn sink(mut self, sink: Arc<dyn TraceSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn probe(mut self, probe: Arc<dyn MemoryProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    /// Overrides the cost table loaded from the config path.
    pub fn cost_table(mut self, table: CostTable) -> Self {
        self.cost_table = Some(table);
        self
    }

    pub fn build(self) -> Arc<Tracer> {
        let cost_table = self
            .cost_table
            .unwrap_or_else(|| CostTable::load_or_default(self.config.cost_table_path.as_deref()));

        Arc::new(Tracer {
            active: AtomicBool::new(self.config.active),
            instrument_llm: AtomicBool::new(self.config.instrument_llm),
            instrument_network: AtomicBool::new(self.config.instrument_network),
            instrument_interactions: AtomicBool::new(self.config.instrument_interactions),
            max_display_parameters: self.config.max_display_parameters,
            cost_table,
            totals: Mutex::new(Totals::default()),
            attributes: AttributeStore::default(),
            trace_metrics: Mutex::new(Vec::new()),
            trace_metric_counts: Mutex::new(HashMap::new()),
            sink: self.sink.unwrap_or_else(|| Arc::new(NullSink)),
            probe: self.probe.unwrap_or_else(|| Arc::new(RssProbe)),
        })
    }
}
