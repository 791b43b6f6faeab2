//! Scoped contexts bracketing one pipeline stage's GPU work.
//!
//! Each pipeline phase enters a scope that selects the current device,
//! obtains the stream for the scope's lifetime, and enforces the phase's
//! lifecycle contract on exit:
//!
//! - [`AcquireContext`] - entry of an asynchronous stage; on drop it
//!   binds the scheduler notification to completion of everything queued
//!   on its stream, exactly once.
//! - [`ProduceContext`] - publishes results; on drop it records the
//!   producer-done event exactly once.
//! - [`TaskContext`] - chained continuations reusing the acquire-time
//!   device and stream.
//! - [`AnalyzeContext`] - terminal, read-only consumers.
//!
//! Reads of [`Product`]s go through the synchronizing getter: per read it
//! decides whether the consuming stream must first wait on the
//! producer's event, without ever blocking the host.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::error;

use hetstream_core::error::{HetstreamError, Result};
use hetstream_core::lane::LaneId;
use hetstream_core::store::{GetToken, PutToken, ResultStore};
use hetstream_core::task::{TaskStatus, WaitingTaskHolder};

use crate::device::{bind_device, choose_device};
use crate::driver;
use crate::event::{event_cache, SharedEvent};
use crate::metrics::sync_metrics;
use crate::product::{Product, ProductBase};
use crate::stream::{stream_cache, SharedStream};

/// Device and stream captured when a stage is acquired, so later phases
/// can resume the same queue without re-deriving it from a product.
///
/// The captured stream has exactly one owner at a time: the acquiring
/// scope populates the state, task scopes borrow it read-only, and a
/// produce scope may take the stream out, after which the state is
/// spent.
#[derive(Debug, Default)]
pub struct ContextState {
    slot: Mutex<Option<StateSlot>>,
}

#[derive(Debug)]
struct StateSlot {
    device: usize,
    stream: Option<SharedStream>,
}

impl ContextState {
    /// Creates an empty state, to be populated by an acquiring scope.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Device captured at acquire time.
    pub fn device(&self) -> Result<usize> {
        self.slot
            .lock()
            .as_ref()
            .map(|s| s.device)
            .ok_or(HetstreamError::MissingContextState)
    }

    /// Whether the state still holds a usable stream.
    #[must_use]
    pub fn has_stream(&self) -> bool {
        self.slot
            .lock()
            .as_ref()
            .is_some_and(|s| s.stream.is_some())
    }

    fn set(&self, device: usize, stream: SharedStream) -> Result<()> {
        let mut slot = self.slot.lock();
        if slot.is_some() {
            return Err(HetstreamError::InvalidState {
                expected: "empty continuation state".to_string(),
                actual: "state already captured by another scope".to_string(),
            });
        }
        *slot = Some(StateSlot {
            device,
            stream: Some(stream),
        });
        Ok(())
    }

    /// Device and a clone of the stream, for read-only reuse.
    fn device_and_stream(&self) -> Result<(usize, SharedStream)> {
        let slot = self.slot.lock();
        let s = slot.as_ref().ok_or(HetstreamError::MissingContextState)?;
        let stream = s.stream.clone().ok_or(HetstreamError::InvalidState {
            expected: "state holding a stream".to_string(),
            actual: "stream already transferred to a produce scope".to_string(),
        })?;
        Ok((s.device, stream))
    }

    /// Transfers the captured stream out; the state holds no usable
    /// stream afterwards.
    fn release_stream(&self) -> Result<(usize, SharedStream)> {
        let mut slot = self.slot.lock();
        let s = slot.as_mut().ok_or(HetstreamError::MissingContextState)?;
        let stream = s.stream.take().ok_or(HetstreamError::InvalidState {
            expected: "state holding a stream".to_string(),
            actual: "stream already transferred to a produce scope".to_string(),
        })?;
        Ok((s.device, stream))
    }
}

/// What a consuming scope must do before using a product.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SyncAction {
    /// Producer work already completed; no ordering needed.
    AlreadyAvailable,
    /// Same queue: FIFO order already guarantees the value is ready
    /// before anything issued after this point executes.
    SameStream,
    /// Different queue with work still pending: the consumer stream must
    /// wait on the producer's event.
    WaitEvent,
}

/// The synchronization predicate. Evaluated fresh on every read.
fn sync_action(available: bool, same_stream: bool) -> SyncAction {
    if available {
        SyncAction::AlreadyAvailable
    } else if same_stream {
        SyncAction::SameStream
    } else {
        SyncAction::WaitEvent
    }
}

/// Device selection and stream acquisition shared by all scope types.
struct ContextBase {
    device: usize,
    stream: SharedStream,
}

impl ContextBase {
    /// Fresh stream from the pool; device chosen from the lane.
    fn from_lane(lane: LaneId) -> Result<Self> {
        let device = choose_device(lane)?;
        bind_device(device)?;
        let stream = stream_cache().get(device)?;
        Ok(Self { device, stream })
    }

    /// Adopts the device and stream a product was made on, so reads of
    /// that product need no synchronization.
    fn from_product(data: &ProductBase) -> Result<Self> {
        bind_device(data.device())?;
        Ok(Self {
            device: data.device(),
            stream: data.stream().clone(),
        })
    }

    /// Explicit device/stream pair (continuation-state reuse).
    fn from_parts(device: usize, stream: SharedStream) -> Result<Self> {
        bind_device(device)?;
        Ok(Self { device, stream })
    }

    fn synchronize_streams(&self, data: &ProductBase) -> Result<()> {
        if data.device() != self.device {
            return Err(HetstreamError::MixedDevices {
                data_device: data.device(),
                context_device: self.device,
            });
        }
        match sync_action(
            data.is_available()?,
            data.stream().same_stream(&self.stream),
        ) {
            SyncAction::AlreadyAvailable => sync_metrics().incr_already_available(),
            SyncAction::SameStream => sync_metrics().incr_same_stream(),
            SyncAction::WaitEvent => {
                let event = data.event().ok_or_else(|| HetstreamError::InvalidState {
                    expected: "pending product carrying an event".to_string(),
                    actual: "product with no event".to_string(),
                })?;
                driver::wait_event(&self.stream, event)?;
                sync_metrics().incr_event_waits();
            }
        }
        Ok(())
    }

    /// The synchronizing getter. The returned reference is valid for GPU
    /// operations queued on this scope's stream from here on; reading it
    /// on the host still requires a host-side synchronization.
    fn get<'p, T>(&self, product: &'p Product<T>) -> Result<&'p T> {
        self.synchronize_streams(product.base())?;
        Ok(product.value())
    }
}

/// Fires `holder` with the failure before surfacing a construction
/// error, so the scheduler hears back exactly once either way.
fn notify_on_err<T>(
    result: Result<T>,
    holder: WaitingTaskHolder,
) -> Result<(T, WaitingTaskHolder)> {
    match result {
        Ok(value) => Ok((value, holder)),
        Err(err) => {
            holder.done_waiting(TaskStatus::failed(err.clone()));
            Err(err)
        }
    }
}

/// Owns the single pending notification for a scope and knows how to
/// rebuild it around a new user callback.
struct HolderHelper {
    holder: Option<WaitingTaskHolder>,
}

impl HolderHelper {
    fn new(holder: WaitingTaskHolder) -> Self {
        Self {
            holder: Some(holder),
        }
    }

    /// Wraps the currently held target together with `f` into a new
    /// composed target. The old target still fires, as the tail of the
    /// new chain.
    fn push_next_task<F>(&mut self, f: F, state: Arc<ContextState>)
    where
        F: FnOnce(TaskContext) + Send + 'static,
    {
        if let Some(prev) = self.holder.take() {
            self.holder = Some(prev.chain(move |subsumed| {
                // On construction failure the subsumed holder has already
                // been notified inside TaskContext::new.
                if let Err(err) = TaskContext::new(state, subsumed).map(f) {
                    error!("Failed to build task scope for continuation: {err}");
                }
            }));
        }
    }

    /// Swaps the held notification primitive outright. The previous
    /// target is released (fires as complete) when its holder drops.
    fn replace(&mut self, holder: WaitingTaskHolder) {
        self.holder = Some(holder);
    }

    /// Binds the held notification to completion of all work queued so
    /// far on `stream`. Runs exactly once, from the owning scope's drop.
    fn enqueue_callback(&mut self, device: usize, stream: &SharedStream) {
        let Some(holder) = self.holder.take() else {
            return;
        };
        let slot = Arc::new(Mutex::new(Some(holder)));
        let fire_slot = Arc::clone(&slot);
        let result = driver::launch_host_callback(stream, move || {
            if let Some(h) = fire_slot.lock().take() {
                h.done_waiting(TaskStatus::Done);
            }
        });
        match result {
            Ok(()) => sync_metrics().incr_callbacks_enqueued(),
            Err(err) => {
                // Registration failed: nothing will fire from the
                // driver, so deliver the failure ourselves.
                error!(device, "Failed to enqueue completion callback: {err}");
                if let Some(h) = slot.lock().take() {
                    h.done_waiting(TaskStatus::failed(err));
                }
            }
        }
    }
}

/// Entry scope of an asynchronous pipeline stage.
///
/// On drop the scheduler notification is bound to completion of all work
/// queued on this scope's stream - exactly once, whether or not
/// continuations were pushed.
pub struct AcquireContext {
    base: ContextBase,
    holder: HolderHelper,
    state: Option<Arc<ContextState>>,
}

impl AcquireContext {
    /// Fresh stream for `lane`; no continuation state kept.
    pub fn new(lane: LaneId, holder: WaitingTaskHolder) -> Result<Self> {
        let (base, holder) = notify_on_err(ContextBase::from_lane(lane), holder)?;
        Ok(Self {
            base,
            holder: HolderHelper::new(holder),
            state: None,
        })
    }

    /// Fresh stream for `lane`, capturing device and stream into `state`
    /// so later phases can resume the same queue.
    pub fn with_state(
        lane: LaneId,
        holder: WaitingTaskHolder,
        state: Arc<ContextState>,
    ) -> Result<Self> {
        let built = ContextBase::from_lane(lane).and_then(|base| {
            state.set(base.device, base.stream.clone())?;
            Ok(base)
        });
        let (base, holder) = notify_on_err(built, holder)?;
        Ok(Self {
            base,
            holder: HolderHelper::new(holder),
            state: Some(state),
        })
    }

    /// Adopts the device and stream of `data`, so reads of that product
    /// need no synchronization.
    pub fn from_product(data: &ProductBase, holder: WaitingTaskHolder) -> Result<Self> {
        let (base, holder) = notify_on_err(ContextBase::from_product(data), holder)?;
        Ok(Self {
            base,
            holder: HolderHelper::new(holder),
            state: None,
        })
    }

    /// Adopts the device and stream of `data` and captures them into
    /// `state` for later phases.
    pub fn from_product_with_state(
        data: &ProductBase,
        holder: WaitingTaskHolder,
        state: Arc<ContextState>,
    ) -> Result<Self> {
        let built = ContextBase::from_product(data).and_then(|base| {
            state.set(base.device, base.stream.clone())?;
            Ok(base)
        });
        let (base, holder) = notify_on_err(built, holder)?;
        Ok(Self {
            base,
            holder: HolderHelper::new(holder),
            state: Some(state),
        })
    }

    /// Selected device ordinal.
    #[must_use]
    pub fn device(&self) -> usize {
        self.base.device
    }

    /// Queue for asynchronous work issued within this scope.
    #[must_use]
    pub fn stream(&self) -> &SharedStream {
        &self.base.stream
    }

    /// Synchronizing read of a product.
    pub fn get<'p, T>(&self, product: &'p Product<T>) -> Result<&'p T> {
        self.base.get(product)
    }

    /// Synchronizing read through the store.
    pub fn get_from<'s, T: Send + Sync + 'static>(
        &self,
        store: &'s ResultStore,
        token: GetToken<Product<T>>,
    ) -> Result<&'s T> {
        self.get(store.get(token)?)
    }

    /// Chains `f` to run under a task scope after the currently held
    /// notification target fires; the old target is subsumed, not
    /// dropped.
    ///
    /// Fails with [`HetstreamError::MissingContextState`] when the scope
    /// was built without continuation state - a defect in the calling
    /// stage, not a runtime condition.
    pub fn push_next_task<F>(&mut self, f: F) -> Result<()>
    where
        F: FnOnce(TaskContext) + Send + 'static,
    {
        let state = self
            .state
            .as_ref()
            .ok_or(HetstreamError::MissingContextState)?;
        self.holder.push_next_task(f, Arc::clone(state));
        Ok(())
    }

    /// Swaps the held notification primitive outright.
    pub fn replace_waiting_task_holder(&mut self, holder: WaitingTaskHolder) {
        self.holder.replace(holder);
    }
}

impl Drop for AcquireContext {
    fn drop(&mut self) {
        self.holder
            .enqueue_callback(self.base.device, &self.base.stream);
    }
}

/// Scope under which a stage publishes new results.
///
/// Exactly one event is allocated at construction - allocation failure
/// surfaces before any GPU work is queued - and recorded on the stream
/// at drop, marking the durable "producer done enqueuing" boundary that
/// consumers wait on. All asynchronous producer work must be queued
/// before the scope is dropped.
pub struct ProduceContext {
    base: ContextBase,
    event: SharedEvent,
}

impl ProduceContext {
    /// Fresh stream for `lane`.
    pub fn new(lane: LaneId) -> Result<Self> {
        let base = ContextBase::from_lane(lane)?;
        let event = event_cache().get(base.device)?;
        Ok(Self { base, event })
    }

    /// Adopts the device and stream of `data`.
    pub fn from_product(data: &ProductBase) -> Result<Self> {
        let base = ContextBase::from_product(data)?;
        let event = event_cache().get(base.device)?;
        Ok(Self { base, event })
    }

    /// Takes ownership of the stream captured in `state`; the state
    /// holds no usable stream afterwards.
    pub fn from_state(state: &ContextState) -> Result<Self> {
        let (device, stream) = state.release_stream()?;
        let base = ContextBase::from_parts(device, stream)?;
        let event = event_cache().get(device)?;
        Ok(Self { base, event })
    }

    /// Selected device ordinal.
    #[must_use]
    pub fn device(&self) -> usize {
        self.base.device
    }

    /// Queue for asynchronous work issued within this scope.
    #[must_use]
    pub fn stream(&self) -> &SharedStream {
        &self.base.stream
    }

    /// Synchronizing read of a product.
    pub fn get<'p, T>(&self, product: &'p Product<T>) -> Result<&'p T> {
        self.base.get(product)
    }

    /// Synchronizing read through the store.
    pub fn get_from<'s, T: Send + Sync + 'static>(
        &self,
        store: &'s ResultStore,
        token: GetToken<Product<T>>,
    ) -> Result<&'s T> {
        self.get(store.get(token)?)
    }

    /// Wraps `value` with this scope's provenance.
    pub fn wrap<T>(&self, value: T) -> Product<T> {
        Product::new(
            ProductBase::new(
                self.base.device,
                self.base.stream.clone(),
                Some(self.event.clone()),
            ),
            value,
        )
    }

    /// Wraps `value` and publishes it into `store` under `token`.
    pub fn emplace<T: Send + Sync + 'static>(
        &self,
        store: &mut ResultStore,
        token: PutToken<Product<T>>,
        value: T,
    ) -> Result<()> {
        store.put(token, self.wrap(value))
    }

    #[cfg(test)]
    fn for_testing(base: ContextBase, event: SharedEvent) -> Self {
        Self { base, event }
    }
}

impl Drop for ProduceContext {
    fn drop(&mut self) {
        // The durable producer-done boundary. A failure here cannot be
        // unwound; consumers would wait on an unrecorded event (which
        // the driver treats as complete), so the run is poisoned.
        if let Err(err) = self.event.record(&self.base.stream) {
            error!(
                device = self.base.device,
                "Failed to record producer-done event: {err}"
            );
        }
    }
}

/// Scope for chained continuations after the original acquire.
///
/// Reuses the acquire-time device and stream from a shared
/// [`ContextState`], never taking ownership of it; on drop the scheduler
/// notification is bound to stream completion exactly once, like an
/// acquiring scope.
pub struct TaskContext {
    base: ContextBase,
    holder: HolderHelper,
    state: Arc<ContextState>,
}

impl TaskContext {
    /// Builds a task scope resuming the acquire-time device and stream.
    ///
    /// On failure the holder is notified of the failure before the error
    /// is returned; the scheduler still hears back exactly once.
    pub fn new(state: Arc<ContextState>, holder: WaitingTaskHolder) -> Result<Self> {
        let (parts, holder) = notify_on_err(state.device_and_stream(), holder)?;
        let (device, stream) = parts;
        let (base, holder) = notify_on_err(ContextBase::from_parts(device, stream), holder)?;
        Ok(Self {
            base,
            holder: HolderHelper::new(holder),
            state,
        })
    }

    /// Selected device ordinal.
    #[must_use]
    pub fn device(&self) -> usize {
        self.base.device
    }

    /// Queue for asynchronous work issued within this scope.
    #[must_use]
    pub fn stream(&self) -> &SharedStream {
        &self.base.stream
    }

    /// Chains `f` to run under a further task scope after the currently
    /// held notification target fires.
    pub fn push_next_task<F>(&mut self, f: F)
    where
        F: FnOnce(TaskContext) + Send + 'static,
    {
        self.holder.push_next_task(f, Arc::clone(&self.state));
    }

    /// Swaps the held notification primitive outright.
    pub fn replace_waiting_task_holder(&mut self, holder: WaitingTaskHolder) {
        self.holder.replace(holder);
    }
}

impl Drop for TaskContext {
    fn drop(&mut self) {
        self.holder
            .enqueue_callback(self.base.device, &self.base.stream);
    }
}

/// Terminal, read-only consumer scope: only the synchronizing getter is
/// exposed. Stages using it neither publish products nor chain
/// continuations.
pub struct AnalyzeContext {
    base: ContextBase,
}

impl AnalyzeContext {
    /// Fresh stream for `lane`.
    pub fn new(lane: LaneId) -> Result<Self> {
        Ok(Self {
            base: ContextBase::from_lane(lane)?,
        })
    }

    /// Adopts the device and stream of `data`, so reads of that product
    /// need no synchronization.
    pub fn from_product(data: &ProductBase) -> Result<Self> {
        Ok(Self {
            base: ContextBase::from_product(data)?,
        })
    }

    /// Selected device ordinal.
    #[must_use]
    pub fn device(&self) -> usize {
        self.base.device
    }

    /// Queue for asynchronous work issued within this scope.
    #[must_use]
    pub fn stream(&self) -> &SharedStream {
        &self.base.stream
    }

    /// Synchronizing read of a product.
    pub fn get<'p, T>(&self, product: &'p Product<T>) -> Result<&'p T> {
        self.base.get(product)
    }

    /// Synchronizing read through the store.
    pub fn get_from<'s, T: Send + Sync + 'static>(
        &self,
        store: &'s ResultStore,
        token: GetToken<Product<T>>,
    ) -> Result<&'s T> {
        self.get(store.get(token)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::is_cuda_available;
    use crate::event::EventCache;
    use crate::stream::StreamCache;
    use std::sync::mpsc;
    use std::time::{Duration, Instant};

    #[test]
    fn test_sync_action_available_never_waits() {
        assert_eq!(sync_action(true, true), SyncAction::AlreadyAvailable);
        assert_eq!(sync_action(true, false), SyncAction::AlreadyAvailable);
    }

    #[test]
    fn test_sync_action_same_stream_never_waits() {
        assert_eq!(sync_action(false, true), SyncAction::SameStream);
    }

    #[test]
    fn test_sync_action_pending_cross_stream_waits() {
        assert_eq!(sync_action(false, false), SyncAction::WaitEvent);
    }

    #[test]
    fn test_empty_context_state() {
        let state = ContextState::new();
        assert_eq!(state.device(), Err(HetstreamError::MissingContextState));
        assert!(!state.has_stream());
        assert!(state.device_and_stream().is_err());
        assert!(state.release_stream().is_err());
    }

    #[test]
    fn test_acquire_without_cuda_notifies_failure() {
        // Needs a working driver stack that reports zero devices; a
        // missing driver library panics inside cudarc instead.
        match std::panic::catch_unwind(is_cuda_available) {
            Ok(false) => {}
            _ => return,
        }
        let (tx, rx) = mpsc::channel();
        let holder = WaitingTaskHolder::new(move |status| {
            tx.send(status.is_done()).unwrap();
        });
        assert!(AcquireContext::new(LaneId::new(0), holder).is_err());
        // The scheduler still heard back, as a failure.
        assert!(!rx.recv().unwrap());
    }

    // The hardware tests below assert exact call counts through the
    // process-wide metrics. Run with: cargo test -- --ignored --test-threads=1

    #[test]
    #[ignore] // Requires CUDA hardware
    fn test_acquire_drop_fires_holder_exactly_once() {
        let (tx, rx) = mpsc::channel();
        let holder = WaitingTaskHolder::new(move |status| {
            let _ = tx.send(status.is_done());
        });

        let scope = AcquireContext::new(LaneId::new(0), holder).unwrap();
        drop(scope);

        assert!(rx.recv_timeout(Duration::from_secs(5)).unwrap());
        std::thread::sleep(Duration::from_millis(50));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    #[ignore] // Requires CUDA hardware
    fn test_push_next_task_without_state_is_a_contract_violation() {
        let holder = WaitingTaskHolder::new(|_| {});
        let mut scope = AcquireContext::new(LaneId::new(0), holder).unwrap();
        let result = scope.push_next_task(|_task| {});
        assert_eq!(result, Err(HetstreamError::MissingContextState));
    }

    #[test]
    #[ignore] // Requires CUDA hardware
    fn test_continuation_chain_runs_then_signals() {
        // Continuations and holders fire on driver-managed threads;
        // report through the channel rather than panicking there.
        let (tx, rx) = mpsc::channel();
        let tx_done = tx.clone();
        let holder = WaitingTaskHolder::new(move |status| {
            let _ = tx_done.send(("scheduler", status.is_done()));
        });

        let state = Arc::new(ContextState::new());
        let mut scope =
            AcquireContext::with_state(LaneId::new(0), holder, Arc::clone(&state)).unwrap();
        let device = scope.device();

        let tx_task = tx.clone();
        scope
            .push_next_task(move |task| {
                let _ = tx_task.send(("continuation", task.device() == device));
                // Dropping `task` binds the subsumed notification to the
                // stream, which is idle, so it fires promptly.
            })
            .unwrap();
        drop(scope);

        assert_eq!(
            rx.recv_timeout(Duration::from_secs(5)).unwrap(),
            ("continuation", true)
        );
        assert_eq!(
            rx.recv_timeout(Duration::from_secs(5)).unwrap(),
            ("scheduler", true)
        );
    }

    #[test]
    #[ignore] // Requires CUDA hardware
    fn test_push_next_task_twice_fires_all_in_order() {
        let (tx, rx) = mpsc::channel();
        let tx_done = tx.clone();
        let holder = WaitingTaskHolder::new(move |_| {
            let _ = tx_done.send("scheduler");
        });

        let state = Arc::new(ContextState::new());
        let mut scope =
            AcquireContext::with_state(LaneId::new(0), holder, Arc::clone(&state)).unwrap();

        let tx_first = tx.clone();
        scope
            .push_next_task(move |_task| {
                let _ = tx_first.send("first");
            })
            .unwrap();
        let tx_second = tx.clone();
        scope
            .push_next_task(move |_task| {
                let _ = tx_second.send("second");
            })
            .unwrap();
        drop(scope);

        // The latest continuation runs first; the earlier one is still
        // honored as part of the composed chain, then the scheduler.
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), "second");
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), "first");
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), "scheduler");
    }

    #[test]
    #[ignore] // Requires CUDA hardware
    fn test_produce_records_exactly_one_event() {
        let before = sync_metrics().snapshot();
        let scope = ProduceContext::new(LaneId::new(0)).unwrap();

        let a = scope.wrap(vec![1u32, 2]);
        let b = scope.wrap(7u64);
        assert_eq!(sync_metrics().snapshot().since(&before).events_recorded, 0);

        drop(scope);
        assert_eq!(sync_metrics().snapshot().since(&before).events_recorded, 1);
        drop((a, b));
    }

    #[test]
    #[ignore] // Requires CUDA hardware
    fn test_produce_from_state_transfers_stream_ownership() {
        let state = Arc::new(ContextState::new());
        {
            let holder = WaitingTaskHolder::new(|_| {});
            let _scope =
                AcquireContext::with_state(LaneId::new(0), holder, Arc::clone(&state)).unwrap();
        }
        assert!(state.has_stream());

        let produce = ProduceContext::from_state(&state).unwrap();
        assert_eq!(produce.device(), state.device().unwrap());
        assert!(!state.has_stream());

        // A second transfer, or a task scope, finds the state spent.
        assert!(ProduceContext::from_state(&state).is_err());
        let (tx, rx) = mpsc::channel();
        let holder = WaitingTaskHolder::new(move |status| tx.send(status.is_done()).unwrap());
        assert!(TaskContext::new(Arc::clone(&state), holder).is_err());
        assert_eq!(rx.recv().unwrap(), false);
    }

    #[test]
    #[ignore] // Requires CUDA hardware
    fn test_same_stream_read_issues_no_wait() {
        let before = sync_metrics().snapshot();

        let produce = ProduceContext::new(LaneId::new(0)).unwrap();
        let product = produce.wrap(vec![1.0f32, 2.0]);
        drop(produce);

        let analyze = AnalyzeContext::from_product(product.base()).unwrap();
        assert_eq!(analyze.device(), product.device());
        assert_eq!(analyze.get(&product).unwrap(), &vec![1.0f32, 2.0]);

        let delta = sync_metrics().snapshot().since(&before);
        assert_eq!(delta.event_waits_issued, 0);
    }

    #[test]
    #[ignore] // Requires CUDA hardware
    fn test_pending_cross_stream_read_waits_once_without_blocking() {
        let streams = StreamCache::new();
        let events = EventCache::new();
        bind_device(0).unwrap();

        // Keep the producer stream busy so the product stays pending.
        let producer = streams.get(0).unwrap();
        let (gate_tx, gate_rx) = mpsc::channel::<()>();
        driver::launch_host_callback(&producer, move || {
            let _ = gate_rx.recv_timeout(Duration::from_secs(30));
        })
        .unwrap();

        let event = events.get(0).unwrap();
        event.record(&producer).unwrap();
        let base = ProductBase::new(0, producer.clone(), Some(event));
        let product = Product::new(base, 42u32);
        assert!(!product.is_available().unwrap());

        let before = sync_metrics().snapshot();
        // Lane 0 keeps the consumer on the producer's device; its stream
        // comes from the process-wide pool, distinct from `producer`.
        let consumer = AnalyzeContext::new(LaneId::new(0)).unwrap();
        assert!(!consumer.stream().same_stream(&producer));

        let start = Instant::now();
        let value = consumer.get(&product).unwrap();
        assert_eq!(*value, 42);
        // The wait is queued GPU-side; the host call returns immediately.
        assert!(start.elapsed() < Duration::from_millis(100));
        assert_eq!(sync_metrics().snapshot().since(&before).event_waits_issued, 1);

        gate_tx.send(()).unwrap();
        consumer.stream().synchronize().unwrap();
    }

    #[test]
    #[ignore] // Requires CUDA hardware
    fn test_produce_event_returns_to_pool_after_consumers_drop() {
        bind_device(0).unwrap();
        let streams = StreamCache::new();
        let events = EventCache::new();

        let base = ContextBase::from_parts(0, streams.get(0).unwrap()).unwrap();
        let scope = ProduceContext::for_testing(base, events.get(0).unwrap());
        let product = scope.wrap(1u8);
        drop(scope);
        assert_eq!(events.idle(0), 0);

        drop(product);
        assert_eq!(events.idle(0), 1);
    }
}
