//! # Context Propagation Chain
//!
//! A [`Chain`] is the execution context of one logical call chain: it tracks
//! which component is the current parent, owns the open buffers of every
//! in-flight component on the chain, and routes finished components to their
//! parent's buffer or to the chain's root [`TraceSink`].
//!
//! The chain is what turns a flat sequence of interceptions into a nested
//! tree without any explicit parameter threading: an instrumented call
//! pushes its component id as the current parent for exactly the duration of
//! the wrapped call (an RAII [`ParentGuard`] pops it on every exit path), so
//! calls intercepted inside that window attach as children.
//!
//! ## Scoping
//!
//! The ambient chain is carried in a tokio task-local for suspending call
//! chains and a thread-local for blocking ones. Task-locals do not cross
//! `tokio::spawn`, so concurrently spawned work starts a fresh chain and
//! independent chains never observe each other's parent ids. Blocking code
//! running inside an instrumented async call still resolves the task-local
//! (it executes within the task), so cross-mode nesting links correctly.
//!
//! ## Capture frames
//!
//! The span facade opens a *capture frame* before invoking user code. A
//! component that finishes as a chain root while a frame is open is
//! deposited into the frame (last write wins) instead of reaching the
//! sink, which is how the facade adopts the component built by the adapter
//! without any tracer-global state.

use std::cell::RefCell;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};

use tracing::{debug, trace};

use crate::component::{Component, ComponentId, NetworkCall, UserInteraction};

tokio::task_local! {
    static ACTIVE_CHAIN: Arc<Chain>;
}

thread_local! {
    static BLOCKING_CHAIN: RefCell<Option<Arc<Chain>>> = RefCell::new(None);
}

/// Destination for components that finish at the root of a chain.
pub trait TraceSink: Send + Sync {
    fn publish(&self, component: Component);
}

/// Sink that collects published components into a vector. Useful for tests
/// and for hosts that export in batches.
#[derive(Debug, Default)]
pub struct VecSink {
    components: Mutex<Vec<Component>>,
}

impl VecSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn components(&self) -> Vec<Component> {
        self.components.lock().unwrap().clone()
    }

    pub fn drain(&self) -> Vec<Component> {
        std::mem::take(&mut *self.components.lock().unwrap())
    }

    pub fn len(&self) -> usize {
        self.components.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl TraceSink for VecSink {
    fn publish(&self, component: Component) {
        self.components.lock().unwrap().push(component);
    }
}

/// Sink that discards everything.
#[derive(Debug, Default)]
pub struct NullSink;

impl TraceSink for NullSink {
    fn publish(&self, component: Component) {
        trace!(id = %component.id, name = %component.name, "discarding component");
    }
}

/// Buffers owned by one in-flight component, valid between its start and
/// end. At end, the contents move into the published record and the buffer
/// is discarded.
#[derive(Debug, Default)]
pub(crate) struct OpenBuffers {
    pub network_calls: Vec<NetworkCall>,
    pub interactions: Vec<UserInteraction>,
    pub children: Vec<Component>,
}

#[derive(Default)]
struct ChainState {
    /// Current-parent stack; the top is the parent for newly intercepted calls.
    parents: Vec<ComponentId>,
    /// In-flight components in start order; the top receives recorded
    /// network calls and interactions.
    open: Vec<ComponentId>,
    buffers: HashMap<ComponentId, OpenBuffers>,
    /// Facade capture frames, innermost last.
    captures: Vec<Option<Component>>,
    /// Declared span names, innermost last.
    declared_names: Vec<String>,
}

/// Execution context of one logical call chain.
pub struct Chain {
    state: Mutex<ChainState>,
    sink: Arc<dyn TraceSink>,
}

impl Chain {
    pub fn new(sink: Arc<dyn TraceSink>) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(ChainState::default()),
            sink,
        })
    }

    /// The chain ambient to the calling task or thread, if any.
    pub fn try_current() -> Option<Arc<Chain>> {
        if let Ok(chain) = ACTIVE_CHAIN.try_with(Arc::clone) {
            return Some(chain);
        }
        BLOCKING_CHAIN.with(|slot| slot.borrow().clone())
    }

    /// The component id nested calls would currently attach under.
    pub fn parent(&self) -> Option<ComponentId> {
        self.state.lock().unwrap().parents.last().cloned()
    }

    /// Makes `id` the current parent until the returned guard drops.
    pub(crate) fn scope_parent(self: &Arc<Self>, id: ComponentId) -> ParentGuard {
        self.state.lock().unwrap().parents.push(id.clone());
        ParentGuard {
            chain: Arc::clone(self),
            id,
        }
    }

    /// Opens the buffers for a starting component.
    pub(crate) fn start_component(&self, id: ComponentId) {
        let mut state = self.state.lock().unwrap();
        state.buffers.insert(id.clone(), OpenBuffers::default());
        state.open.push(id);
    }

    /// Closes a component's buffers, transferring ownership of their
    /// contents to the caller.
    pub(crate) fn end_component(&self, id: &ComponentId) -> OpenBuffers {
        let mut state = self.state.lock().unwrap();
        state.open.retain(|open| open != id);
        state.buffers.remove(id).unwrap_or_default()
    }

    /// Appends a network call to the innermost open component's buffer.
    /// Returns false when nothing is open.
    pub(crate) fn record_network_call(&self, call: NetworkCall) -> bool {
        let mut state = self.state.lock().unwrap();
        let Some(id) = state.open.last().cloned() else {
            return false;
        };
        match state.buffers.get_mut(&id) {
            Some(buffers) => {
                buffers.network_calls.push(call);
                true
            }
            None => false,
        }
    }

    /// Appends an interaction to the innermost open component's buffer.
    /// Returns false when nothing is open.
    pub(crate) fn record_interaction(&self, interaction: UserInteraction) -> bool {
        let mut state = self.state.lock().unwrap();
        let Some(id) = state.open.last().cloned() else {
            return false;
        };
        match state.buffers.get_mut(&id) {
            Some(buffers) => {
                buffers.interactions.push(interaction);
                true
            }
            None => false,
        }
    }

    pub(crate) fn push_capture(&self) {
        self.state.lock().unwrap().captures.push(None);
    }

    pub(crate) fn pop_capture(&self) -> Option<Component> {
        self.state.lock().unwrap().captures.pop().flatten()
    }

    pub(crate) fn push_declared_name(&self, name: String) {
        self.state.lock().unwrap().declared_names.push(name);
    }

    pub(crate) fn pop_declared_name(&self) {
        self.state.lock().unwrap().declared_names.pop();
    }

    /// The innermost declared span name, if a facade span is in flight.
    pub(crate) fn declared_name(&self) -> Option<String> {
        self.state.lock().unwrap().declared_names.last().cloned()
    }

    /// Publishes a finished component: into the current parent's children
    /// buffer when a parent is set, otherwise to the chain's sink.
    pub fn publish(&self, component: Component) {
        let mut state = self.state.lock().unwrap();
        if let Some(parent) = state.parents.last().cloned() {
            if let Some(buffers) = state.buffers.get_mut(&parent) {
                buffers.children.push(component);
                return;
            }
            debug!(%parent, "parent buffer already closed; publishing to sink");
        }
        drop(state);
        self.sink.publish(component);
    }

    /// Routes a component built by the invocation adapter. Identical to
    /// [`publish`](Self::publish) except that a chain-root component is
    /// deposited into the innermost open capture frame, when one exists, so
    /// the facade can adopt it.
    pub(crate) fn route(&self, component: Component) {
        let mut state = self.state.lock().unwrap();
        if let Some(parent) = state.parents.last().cloned() {
            if let Some(buffers) = state.buffers.get_mut(&parent) {
                buffers.children.push(component);
                return;
            }
            debug!(%parent, "parent buffer already closed; publishing to sink");
        } else if let Some(frame) = state.captures.last_mut() {
            *frame = Some(component);
            return;
        }
        drop(state);
        self.sink.publish(component);
    }
}

impl std::fmt::Debug for Chain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Chain").finish()
    }
}

/// Pops the pushed parent id when dropped, on every exit path.
pub(crate) struct ParentGuard {
    chain: Arc<Chain>,
    id: ComponentId,
}

impl Drop for ParentGuard {
    fn drop(&mut self) {
        let mut state = self.chain.state.lock().unwrap();
        match state.parents.pop() {
            Some(popped) if popped == self.id => {}
            Some(popped) => {
                // Out-of-order drop; put it back and remove ours instead.
                state.parents.push(popped);
                state.parents.retain(|id| id != &self.id);
            }
            None => {}
        }
    }
}

/// Runs `f` with the ambient chain, creating and scoping a fresh one rooted
/// at `sink` when the task has none.
pub(crate) async fn with_chain<F, Fut, T>(sink: Arc<dyn TraceSink>, f: F) -> T
where
    F: FnOnce(Arc<Chain>) -> Fut,
    Fut: Future<Output = T>,
{
    if let Some(chain) = Chain::try_current() {
        f(chain).await
    } else {
        let chain = Chain::new(sink);
        ACTIVE_CHAIN.scope(chain.clone(), f(chain)).await
    }
}

/// Blocking counterpart of [`with_chain`], scoping via the thread-local.
pub(crate) fn with_chain_blocking<F, T>(sink: Arc<dyn TraceSink>, f: F) -> T
where
    F: FnOnce(Arc<Chain>) -> T,
{
    if let Some(chain) = Chain::try_current() {
        return f(chain);
    }
    let chain = Chain::new(sink);
    let _scope = BlockingScope::enter(chain.clone());
    f(chain)
}

/// Sets the thread-local chain, restoring the previous value on drop.
struct BlockingScope {
    previous: Option<Arc<Chain>>,
}

impl BlockingScope {
    fn enter(chain: Arc<Chain>) -> Self {
        let previous = BLOCKING_CHAIN.with(|slot| slot.borrow_mut().replace(chain));
        Self { previous }
    }
}

impl Drop for BlockingScope {
    fn drop(&mut self) {
        let previous = self.previous.take();
        BLOCKING_CHAIN.with(|slot| *slot.borrow_mut() = previous);
    }
}
