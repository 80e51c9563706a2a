use super::builder::EngineBuilder;
use super::context;
use super::executor::Executor;
use super::run::{self, LoopKind};
use super::work::WorkGuard;
use crate::arena::PoolResource;
use crate::error::{Error, JoinError, Result};
use crate::operation::atomic_queue::AtomicQueue;
use crate::operation::queue::IntrusiveQueue;
use crate::operation::{self, Header, OperationResult, Unsubmitted};
use crate::source::{CompletionSource, Deadline, Tag};
use crate::task::{self, JoinHandle};

use parking_lot::Mutex;
use std::future::Future;
use std::mem;
use std::ptr::NonNull;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, trace};

/// State shared by an engine, its executors and its thread contexts.
pub(crate) struct Shared {
    pub(crate) source: Arc<dyn CompletionSource>,

    /// Local queue and remote-work flag carried between loop invocations
    /// in single-threaded mode.
    pub(crate) local: Mutex<LocalState>,

    /// Operations submitted from threads outside the loop.
    pub(crate) remote_queue: AtomicQueue,

    /// Set while a wake alarm is in flight, in multithreaded mode.
    pub(crate) check_remote_work: AtomicBool,

    outstanding_work: AtomicUsize,

    stopped: AtomicBool,

    /// Set once teardown began. No external completion may be registered
    /// afterwards.
    shutdown: AtomicBool,

    multithreaded: AtomicBool,

    /// Arenas not currently owned by a thread context.
    resources: Mutex<Vec<Box<PoolResource>>>,
}

#[derive(Default)]
pub(crate) struct LocalState {
    pub(crate) queue: IntrusiveQueue,
    pub(crate) check_remote_work: bool,
}

impl Shared {
    fn new(source: Arc<dyn CompletionSource>, concurrency_hint: usize) -> Self {
        let resources: Vec<Box<PoolResource>> =
            (0..concurrency_hint).map(|_| Box::default()).collect();

        Self {
            source,
            local: Mutex::new(LocalState::default()),
            remote_queue: AtomicQueue::new(false),
            check_remote_work: AtomicBool::new(false),
            outstanding_work: AtomicUsize::new(0),
            stopped: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
            multithreaded: AtomicBool::new(concurrency_hint > 1),
            resources: Mutex::new(resources),
        }
    }

    pub(crate) fn work_started(&self) {
        self.outstanding_work.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn work_finished(&self) {
        if self.outstanding_work.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.stop();
        }
    }

    pub(crate) fn outstanding_work(&self) -> usize {
        self.outstanding_work.load(Ordering::Acquire)
    }

    /// Requests the loop to stop. Only the first caller after a reset has
    /// any effect.
    ///
    /// Off the loop thread, the remote queue is reactivated and a wake
    /// alarm armed so a thread blocked on the completion source notices.
    /// If the queue was already active a wake is already on its way.
    pub(crate) fn stop(&self) {
        if !self.stopped.swap(true, Ordering::AcqRel) {
            debug!("engine stop requested");

            if !context::running_in_this_thread(self) && self.remote_queue.try_mark_active() {
                self.trigger_wake_alarm();
            }
        }
    }

    pub(crate) fn reset(&self) {
        self.stopped.store(false, Ordering::Release);
    }

    pub(crate) fn mark_stopped(&self) {
        self.stopped.store(true, Ordering::Release);
    }

    pub(crate) fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    pub(crate) fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    pub(crate) fn is_multithreaded(&self) -> bool {
        self.multithreaded.load(Ordering::Acquire)
    }

    pub(crate) fn set_multithreaded(&self, multithreaded: bool) {
        self.multithreaded.store(multithreaded, Ordering::Release);
    }

    /// Arms the wake alarm so the loop re-checks the remote queue.
    ///
    /// In multithreaded mode at most one wake alarm is in flight.
    pub(crate) fn trigger_wake_alarm(&self) {
        if !self.is_multithreaded() || !self.check_remote_work.swap(true, Ordering::AcqRel) {
            self.source.set_alarm(Deadline::Now, Tag::WAKE);
            trace!("wake alarm armed");
        }
    }

    /// Queues `op` locally when called from this engine's loop, remotely
    /// otherwise.
    pub(crate) fn add_operation(&self, op: NonNull<Header>) {
        if !context::push_local(self, op) {
            self.add_remote_operation(op);
        }
    }

    pub(crate) fn add_remote_operation(&self, op: NonNull<Header>) {
        if unsafe { self.remote_queue.enqueue(op) } {
            self.trigger_wake_alarm();
        }
    }

    /// Moves every operation of `queue` to the remote queue.
    ///
    /// Returns `true` if the remote queue was inactive.
    pub(crate) fn move_to_remote(&self, mut queue: IntrusiveQueue) -> bool {
        let mut was_inactive = false;

        while let Some(op) = queue.pop_front() {
            was_inactive |= unsafe { self.remote_queue.enqueue(op) };
        }

        was_inactive
    }

    /// Schedules `handler` to run on the loop, counting it as outstanding
    /// work.
    ///
    /// After teardown began the handler runs inline with
    /// [`OperationResult::ShutdownNotOk`].
    pub(crate) fn schedule<F>(&self, handler: F)
    where
        F: FnOnce(OperationResult) + Send + 'static,
    {
        if self.is_shutdown() {
            handler(OperationResult::ShutdownNotOk);
            return;
        }

        self.work_started();

        let op = operation::allocate(self, handler);
        self.add_operation(op);
    }

    pub(crate) fn execute<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.schedule(move |result| {
            if !result.is_shutdown() {
                f();
            }
        });
    }

    /// Registers an operation whose tag is handed to the completion source
    /// by `initiate`.
    ///
    /// If `initiate` unwinds, the operation is discarded without running
    /// `on_complete` and its unit of work is finished. `initiate` must not
    /// unwind once the source holds the tag.
    pub(crate) fn register_external_completion<I, F>(
        &self,
        initiate: I,
        on_complete: F,
    ) -> Result<()>
    where
        I: FnOnce(Tag),
        F: FnOnce(OperationResult) + Send + 'static,
    {
        if self.is_shutdown() {
            return Err(Error::Shutdown);
        }

        let op = Unsubmitted::new(self, on_complete);
        initiate(op.tag());
        op.submit();

        Ok(())
    }

    /// Takes an arena for a thread entering the loop.
    pub(crate) fn pop_resource(&self) -> Box<PoolResource> {
        self.resources.lock().pop().unwrap_or_default()
    }

    pub(crate) fn push_resource(&self, resource: Box<PoolResource>) {
        self.resources.lock().push(resource);
    }

    fn release_resources(&self) {
        let resources = mem::take(&mut *self.resources.lock());
        drop(resources);
    }
}

impl Drop for Shared {
    /// Dispatches operations submitted after teardown drained the engine.
    ///
    /// Only executors outliving the engine can submit them, and they always
    /// allocate from the heap.
    fn drop(&mut self) {
        let _ = self.remote_queue.try_mark_active();

        let mut leftover = mem::take(&mut self.local.get_mut().queue);
        let _ = self.remote_queue.dequeue_all_and_try_mark_inactive(&mut leftover);

        while let Some(op) = leftover.pop_front() {
            unsafe { Header::complete(op, OperationResult::ShutdownNotOk, self) };
        }
    }
}

/// An event loop driving a single completion source.
///
/// The engine turns the completion source into a general-purpose
/// scheduler: work can be submitted from any thread with
/// [`execute`](Self::execute), native actions are tracked with
/// [`register_external_completion`](Self::register_external_completion),
/// and futures run as tasks with [`spawn`](Self::spawn).
///
/// Work only runs while some thread drives the loop through [`run`],
/// [`poll`] or one of their variants. The loop returns on its own once
/// the outstanding work count drops to zero.
///
/// Dropping the engine stops it, shuts the completion source down and
/// dispatches every pending operation with a `Shutdown*` result before the
/// arenas are released.
///
/// [`run`]: Self::run
/// [`poll`]: Self::poll
///
/// # Examples
///
/// ```rust
/// use cqloop::Engine;
/// use std::sync::Arc;
/// use std::sync::atomic::{AtomicUsize, Ordering};
///
/// let engine = Engine::new();
/// let counter = Arc::new(AtomicUsize::new(0));
///
/// for _ in 0..3 {
///     let counter = counter.clone();
///     engine.execute(move || {
///         counter.fetch_add(1, Ordering::Relaxed);
///     });
/// }
///
/// assert!(engine.poll());
/// assert_eq!(counter.load(Ordering::Relaxed), 3);
/// ```
pub struct Engine {
    shared: Arc<Shared>,
}

impl Engine {
    /// Creates a single-threaded engine over a fresh
    /// [`CompletionQueue`](crate::source::CompletionQueue).
    pub fn new() -> Self {
        EngineBuilder::new().build()
    }

    pub fn builder() -> EngineBuilder {
        EngineBuilder::new()
    }

    pub(crate) fn from_parts(source: Arc<dyn CompletionSource>, concurrency_hint: usize) -> Self {
        debug!(concurrency_hint, "engine built");

        Self {
            shared: Arc::new(Shared::new(source, concurrency_hint)),
        }
    }

    /// Returns a handle that schedules work on this engine.
    pub fn executor(&self) -> Executor {
        Executor::new(self.shared.clone())
    }

    /// Returns a guard keeping the loop alive until dropped.
    pub fn work_guard(&self) -> WorkGuard {
        WorkGuard::new(self.shared.clone())
    }

    /// Schedules `f` to run on the loop.
    ///
    /// From inside this engine's loop the work is queued locally and runs
    /// on a later iteration. From any other thread it goes through the
    /// remote queue and wakes the loop if needed. Never blocks.
    ///
    /// After teardown began `f` is dropped without running.
    pub fn execute<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.shared.execute(f);
    }

    /// Registers an operation completed by the completion source.
    ///
    /// `initiate` receives the operation's tag and must hand it to the
    /// completion source, for instance through
    /// [`set_alarm`](CompletionSource::set_alarm) or by starting a native
    /// action that later reports it. `on_complete` is then called exactly
    /// once, on the loop, with the reported outcome. It receives a
    /// `Shutdown*` result if the engine is torn down first.
    ///
    /// # Panics
    ///
    /// A panic in `initiate` propagates to the caller. The operation is
    /// then dropped without calling `on_complete` and no work stays
    /// outstanding for it, provided the source never received the tag.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Shutdown`] once teardown began. Neither closure is
    /// called in that case.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use cqloop::{Engine, OperationResult};
    /// use cqloop::source::Deadline;
    ///
    /// let engine = Engine::new();
    /// let source = engine.completion_source().clone();
    ///
    /// engine
    ///     .register_external_completion(
    ///         move |tag| {
    ///             source.set_alarm(Deadline::Now, tag);
    ///         },
    ///         |result| assert_eq!(result, OperationResult::Ok),
    ///     )
    ///     .unwrap();
    ///
    /// assert!(engine.run());
    /// ```
    pub fn register_external_completion<I, F>(&self, initiate: I, on_complete: F) -> Result<()>
    where
        I: FnOnce(Tag),
        F: FnOnce(OperationResult) + Send + 'static,
    {
        self.shared.register_external_completion(initiate, on_complete)
    }

    /// Spawns `future` as a task driven by this engine.
    ///
    /// The task counts as outstanding work until it finishes.
    pub fn spawn<F>(&self, future: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        task::spawn(self.executor(), future)
    }

    /// Runs `future` to completion on this thread.
    ///
    /// The loop runs until the task finishes. If it stops first, the task
    /// is aborted.
    pub fn block_on<F>(&self, future: F) -> Result<F::Output, JoinError>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let handle = self.spawn(future);

        self.run_while(|| !handle.is_finished());

        if !handle.is_finished() {
            handle.abort();
        }

        handle.try_take().unwrap_or(Err(JoinError::Cancelled))
    }

    /// Runs the loop until stopped or out of work.
    ///
    /// Returns `true` if any work was processed.
    pub fn run(&self) -> bool {
        self.process(LoopKind::Full, Deadline::Forever, || true)
    }

    /// Processes all ready work without blocking.
    ///
    /// Returns `true` if any work was processed.
    pub fn poll(&self) -> bool {
        self.process(LoopKind::Full, Deadline::Now, || true)
    }

    /// Runs the loop until stopped, out of work, or `deadline` passes.
    pub fn run_until(&self, deadline: Instant) -> bool {
        self.process(LoopKind::Full, Deadline::At(deadline), || true)
    }

    /// Runs the loop for at most `duration`.
    pub fn run_for(&self, duration: Duration) -> bool {
        self.process(LoopKind::Full, Deadline::after(duration), || true)
    }

    /// Runs the loop while `condition` returns `true`.
    ///
    /// The condition is checked before every iteration.
    pub fn run_while<C>(&self, condition: C) -> bool
    where
        C: FnMut() -> bool,
    {
        self.process(LoopKind::Full, Deadline::Forever, condition)
    }

    /// Runs the loop, but only processes completion source events.
    ///
    /// Locally queued and cross-thread work is left untouched. Returns
    /// `true` if any event other than a wake-up was handled.
    pub fn run_completion_queue(&self) -> bool {
        self.process(LoopKind::CompletionQueueOnly, Deadline::Forever, || true)
    }

    /// Non-blocking variant of
    /// [`run_completion_queue`](Self::run_completion_queue).
    pub fn poll_completion_queue(&self) -> bool {
        self.process(LoopKind::CompletionQueueOnly, Deadline::Now, || true)
    }

    fn process<C>(&self, kind: LoopKind, deadline: Deadline, mut condition: C) -> bool
    where
        C: FnMut() -> bool,
    {
        let shared = &self.shared;
        run::process_work(shared, kind, deadline, || !shared.is_stopped() && condition())
    }

    /// Requests every thread running the loop to return.
    ///
    /// Idempotent and callable from any thread.
    pub fn stop(&self) {
        self.shared.stop();
    }

    /// Clears the stopped flag.
    pub fn reset(&self) {
        self.shared.reset();
    }

    pub fn is_stopped(&self) -> bool {
        self.shared.is_stopped()
    }

    /// Counts one unit of outstanding work.
    ///
    /// Must be balanced by [`work_finished`](Self::work_finished).
    pub fn work_started(&self) {
        self.shared.work_started();
    }

    /// Finishes one unit of outstanding work, stopping the engine when none
    /// is left.
    pub fn work_finished(&self) {
        self.shared.work_finished();
    }

    pub fn outstanding_work(&self) -> usize {
        self.shared.outstanding_work()
    }

    /// Returns `true` if the current thread is running this engine's loop.
    pub fn running_in_this_thread(&self) -> bool {
        context::running_in_this_thread(&self.shared)
    }

    pub fn completion_source(&self) -> &Arc<dyn CompletionSource> {
        &self.shared.source
    }
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Engine {
    /// Tears the engine down.
    ///
    /// 1. Stops the loop and refuses new external completions
    /// 2. Shuts the completion source down
    /// 3. Dispatches everything still queued or pending with a `Shutdown*`
    ///    result
    /// 4. Releases the arenas
    fn drop(&mut self) {
        self.shared.stop();
        self.shared.shutdown.store(true, Ordering::Release);
        self.shared.source.shutdown();

        let drained = run::drain(&self.shared);
        debug!(drained, "engine shut down");

        self.shared.release_resources();
    }
}
