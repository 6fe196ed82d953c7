//! # Patch Registry
//!
//! The explicit interception point. Instead of mutating a third-party
//! client's methods in place, the host routes each client method through a
//! [`MethodSlot`] (or [`BlockingSlot`] for blocking clients): a named,
//! swappable binding holding the current implementation. Application code
//! calls the slot; what the slot holds decides whether the call is traced.
//!
//! [`PatchRegistry::install`] swaps a slot's service for the same service
//! wrapped in [`TraceLayer`](crate::adapter::TraceLayer) and records the
//! original. Cloned slot handles share the binding, so one install covers
//! every clone: the type-level case, where resolution happens at call time.
//! A separately constructed slot is a single-instance target.
//!
//! [`PatchRegistry::uninstall`] restores every recorded original in
//! installation order. One failed restore is logged and does not abort the
//! rest; the registry is empty afterwards, and uninstalling twice is a
//! no-op the second time.

use std::sync::{Arc, Mutex};

use tower::util::BoxCloneService;
use tower::{BoxError, Service, ServiceExt};
use tracing::{debug, error};

use crate::adapter::{trace_blocking, TraceLayer};
use crate::error::TraceError;
use crate::extract::{CallIdentity, Extraction};
use crate::tracer::Tracer;

/// The boxed service type a slot holds.
pub type SlotService<Req, Res> = BoxCloneService<Req, Res, BoxError>;

/// The boxed callable type a blocking slot holds.
pub type BlockingCall<Req, Res> = Arc<dyn Fn(Req) -> Result<Res, BoxError> + Send + Sync>;

/// A named, swappable binding for one suspending client method.
pub struct MethodSlot<Req, Res> {
    identity: CallIdentity,
    current: Arc<Mutex<SlotService<Req, Res>>>,
}

impl<Req, Res> Clone for MethodSlot<Req, Res> {
    fn clone(&self) -> Self {
        Self {
            identity: self.identity.clone(),
            current: self.current.clone(),
        }
    }
}

impl<Req, Res> MethodSlot<Req, Res>
where
    Req: Send + 'static,
    Res: Send + 'static,
{
    pub fn new<S>(target: impl Into<String>, method: impl Into<String>, service: S) -> Self
    where
        S: Service<Req, Response = Res, Error = BoxError> + Clone + Send + 'static,
        S::Future: Send + 'static,
    {
        Self {
            identity: CallIdentity::new(target, method),
            current: Arc::new(Mutex::new(BoxCloneService::new(service))),
        }
    }

    pub fn identity(&self) -> &CallIdentity {
        &self.identity
    }

    /// Invokes whatever the slot currently holds.
    pub async fn call(&self, req: Req) -> Result<Res, BoxError> {
        let mut service = self
            .current
            .lock()
            .map_err(|_| TraceError::PoisonedLock("method slot"))?
            .clone();
        service.ready().await?.call(req).await
    }

    fn swap(&self, service: SlotService<Req, Res>) -> Result<SlotService<Req, Res>, TraceError> {
        let mut current = self
            .current
            .lock()
            .map_err(|_| TraceError::PoisonedLock("method slot"))?;
        Ok(std::mem::replace(&mut *current, service))
    }
}

/// A named, swappable binding for one blocking client method.
pub struct BlockingSlot<Req, Res> {
    identity: CallIdentity,
    current: Arc<Mutex<BlockingCall<Req, Res>>>,
}

impl<Req, Res> Clone for BlockingSlot<Req, Res> {
    fn clone(&self) -> Self {
        Self {
            identity: self.identity.clone(),
            current: self.current.clone(),
        }
    }
}

impl<Req, Res> BlockingSlot<Req, Res>
where
    Req: Send + 'static,
    Res: Send + 'static,
{
    pub fn new<F>(target: impl Into<String>, method: impl Into<String>, call: F) -> Self
    where
        F: Fn(Req) -> Result<Res, BoxError> + Send + Sync + 'static,
    {
        Self {
            identity: CallIdentity::new(target, method),
            current: Arc::new(Mutex::new(Arc::new(call) as BlockingCall<Req, Res>)),
        }
    }

    pub fn identity(&self) -> &CallIdentity {
        &self.identity
    }

    /// Invokes whatever the slot currently holds, blocking the caller.
    pub fn call(&self, req: Req) -> Result<Res, BoxError> {
        let call = self
            .current
            .lock()
            .map_err(|_| TraceError::PoisonedLock("blocking slot"))?
            .clone();
        call(req)
    }

    fn swap(&self, call: BlockingCall<Req, Res>) -> Result<BlockingCall<Req, Res>, TraceError> {
        let mut current = self
            .current
            .lock()
            .map_err(|_| TraceError::PoisonedLock("blocking slot"))?;
        Ok(std::mem::replace(&mut *current, call))
    }
}

/// One installed patch: the addressed method plus a thunk that puts the
/// recorded original back.
struct PatchRecord {
    target: String,
    method: String,
    restore: Box<dyn FnMut() -> Result<(), TraceError> + Send>,
}

/// Ordered collection of installed patches.
pub struct PatchRegistry {
    tracer: Arc<Tracer>,
    records: Mutex<Vec<PatchRecord>>,
}

impl PatchRegistry {
    pub fn new(tracer: Arc<Tracer>) -> Self {
        Self {
            tracer,
            records: Mutex::new(Vec::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.records.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Redirects `slot` through the invocation adapter, recording the
    /// original for restoration.
    pub fn install<Req, Res>(
        &self,
        slot: &MethodSlot<Req, Res>,
        extraction: Arc<dyn Extraction<Req, Res>>,
    ) -> Result<(), TraceError>
    where
        Req: Clone + Send + 'static,
        Res: Send + 'static,
    {
        let layer = TraceLayer::with_extraction(
            self.tracer.clone(),
            slot.identity().clone(),
            extraction,
        );

        let original = slot
            .current
            .lock()
            .map_err(|_| TraceError::PoisonedLock("method slot"))?
            .clone();
        let traced = BoxCloneService::new(tower::Layer::layer(&layer, original.clone()));
        slot.swap(traced)?;
        debug!(identity = %slot.identity(), "installed call tracing");

        let restore_slot = slot.clone();
        self.push_record(slot.identity(), move || {
            restore_slot.swap(original.clone()).map(|_| ())
        });
        Ok(())
    }

    /// Blocking counterpart of [`install`](Self::install).
    pub fn install_blocking<Req, Res>(
        &self,
        slot: &BlockingSlot<Req, Res>,
        extraction: Arc<dyn Extraction<Req, Res>>,
    ) -> Result<(), TraceError>
    where
        Req: Clone + Send + Sync + 'static,
        Res: Send + 'static,
    {
        let original = slot
            .current
            .lock()
            .map_err(|_| TraceError::PoisonedLock("blocking slot"))?
            .clone();

        let tracer = self.tracer.clone();
        let identity = slot.identity().clone();
        let wrapped_original = original.clone();
        let wrapped: BlockingCall<Req, Res> = Arc::new(move |req: Req| {
            trace_blocking(&tracer, &identity, extraction.as_ref(), req, |r| {
                wrapped_original(r)
            })
        });
        slot.swap(wrapped)?;
        debug!(identity = %slot.identity(), "installed blocking call tracing");

        let restore_slot = slot.clone();
        self.push_record(slot.identity(), move || {
            restore_slot.swap(original.clone()).map(|_| ())
        });
        Ok(())
    }

    fn push_record(
        &self,
        identity: &CallIdentity,
        restore: impl FnMut() -> Result<(), TraceError> + Send + 'static,
    ) {
        self.records.lock().unwrap().push(PatchRecord {
            target: identity.target.clone(),
            method: identity.method.clone(),
            restore: Box::new(restore),
        });
    }

    /// Restores every recorded original. A failure to restore one entry is
    /// logged and does not abort restoring the rest. The registry is clear
    /// afterwards; calling this twice in a row is a no-op the second time.
    pub fn uninstall(&self) {
        let records = std::mem::take(&mut *self.records.lock().unwrap());
        for mut record in records {
            match (record.restore)() {
                Ok(()) => debug!(
                    target = %record.target,
                    method = %record.method,
                    "restored original method"
                ),
                Err(err) => error!(
                    target = %record.target,
                    method = %record.method,
                    %err,
                    "failed to restore original method"
                ),
            }
        }
    }
}

impl Drop for PatchRegistry {
    fn drop(&mut self) {
        self.uninstall();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::VecSink;
    use crate::extract::NoExtraction;
    use serde_json::{json, Value};
    use tower::service_fn;

    fn tracer_with_sink() -> (Arc<Tracer>, Arc<VecSink>) {
        let sink = Arc::new(VecSink::new());
        let tracer = Tracer::builder().sink(sink.clone()).build();
        (tracer, sink)
    }

    fn completion_slot() -> MethodSlot<Value, Value> {
        MethodSlot::new(
            "fake.chat.completions",
            "create",
            service_fn(|_req: Value| async move { Ok::<_, BoxError>(json!({"text": "hello"})) }),
        )
    }

    #[tokio::test]
    async fn install_redirects_calls_through_tracing() {
        let (tracer, sink) = tracer_with_sink();
        let registry = PatchRegistry::new(tracer);
        let slot = completion_slot();

        // Before install the slot is the raw original.
        slot.call(json!({})).await.unwrap();
        assert!(sink.is_empty());

        registry.install(&slot, Arc::new(NoExtraction)).unwrap();
        assert_eq!(registry.len(), 1);

        let res = slot.call(json!({})).await.unwrap();
        assert_eq!(res["text"], "hello");
        assert_eq!(sink.drain().len(), 1);
    }

    #[tokio::test]
    async fn cloned_slot_handles_share_the_patch() {
        let (tracer, sink) = tracer_with_sink();
        let registry = PatchRegistry::new(tracer);
        let slot = completion_slot();
        let clone = slot.clone();

        registry.install(&slot, Arc::new(NoExtraction)).unwrap();

        clone.call(json!({})).await.unwrap();
        assert_eq!(sink.drain().len(), 1);
    }

    #[tokio::test]
    async fn uninstall_restores_originals_and_is_idempotent() {
        let (tracer, sink) = tracer_with_sink();
        let registry = PatchRegistry::new(tracer);
        let slot = completion_slot();

        registry.install(&slot, Arc::new(NoExtraction)).unwrap();
        slot.call(json!({})).await.unwrap();
        assert_eq!(sink.drain().len(), 1);

        registry.uninstall();
        assert!(registry.is_empty());

        slot.call(json!({})).await.unwrap();
        assert!(sink.is_empty());

        // Second uninstall: still empty, no fault.
        registry.uninstall();
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn failed_restore_does_not_abort_the_rest() {
        let (tracer, sink) = tracer_with_sink();
        let registry = PatchRegistry::new(tracer);
        let poisoned = completion_slot();
        let healthy = completion_slot();

        registry.install(&poisoned, Arc::new(NoExtraction)).unwrap();
        registry.install(&healthy, Arc::new(NoExtraction)).unwrap();
        assert_eq!(registry.len(), 2);

        let cell = poisoned.current.clone();
        let _ = std::panic::catch_unwind(std::panic::AssertUnwindSafe(move || {
            let _guard = cell.lock().unwrap();
            panic!("poison the slot lock");
        }));

        registry.uninstall();
        assert!(registry.is_empty());

        // The healthy slot was restored despite the earlier failure.
        healthy.call(json!({})).await.unwrap();
        assert!(sink.is_empty());
    }

    #[test]
    fn blocking_slot_install_and_restore() {
        let (tracer, sink) = tracer_with_sink();
        let registry = PatchRegistry::new(tracer);
        let slot: BlockingSlot<Value, Value> = BlockingSlot::new(
            "fake.completions",
            "complete",
            |_req: Value| Ok(json!({"text": "hi"})),
        );

        registry.install_blocking(&slot, Arc::new(NoExtraction)).unwrap();

        let res = slot.call(json!({})).unwrap();
        assert_eq!(res["text"], "hi");
        assert_eq!(sink.drain().len(), 1);

        registry.uninstall();
        slot.call(json!({})).unwrap();
        assert!(sink.is_empty());
    }

    #[tokio::test]
    async fn dropping_the_registry_uninstalls() {
        let (tracer, sink) = tracer_with_sink();
        let slot = completion_slot();
        {
            let registry = PatchRegistry::new(tracer);
            registry.install(&slot, Arc::new(NoExtraction)).unwrap();
        }
        slot.call(json!({})).await.unwrap();
        assert!(sink.is_empty());
    }
}
