use super::core::Shared;
use crate::arena::PoolResource;
use crate::operation::Header;
use crate::operation::queue::IntrusiveQueue;

use std::cell::{Cell, RefCell};
use std::mem;
use std::ptr::{self, NonNull};
use std::sync::Arc;

thread_local! {
    /// The context of the engine loop running on this thread, if any.
    ///
    /// Points into the stack frame of [`enter_context`] and is restored
    /// before that frame is left.
    static CURRENT_CONTEXT: Cell<*const ThreadContext> = const { Cell::new(ptr::null()) };
}

/// Per-thread state of a running engine loop.
pub(crate) struct ThreadContext {
    pub(crate) shared: Arc<Shared>,

    /// Operations ready to run on this thread.
    pub(crate) local_queue: RefCell<IntrusiveQueue>,

    /// Whether the remote queue may hold work.
    pub(crate) check_remote_work: Cell<bool>,

    /// The thread's arena. Only `None` while the context is dropped.
    resource: RefCell<Option<Box<PoolResource>>>,

    /// Mode snapshot taken on entry.
    pub(crate) multithreaded: bool,
}

impl ThreadContext {
    fn new(shared: &Arc<Shared>) -> Self {
        let multithreaded = shared.is_multithreaded();

        // A single-threaded engine picks up where the previous loop left.
        let (local_queue, check_remote_work) = if multithreaded {
            (IntrusiveQueue::new(), false)
        } else {
            let mut local = shared.local.lock();
            (mem::take(&mut local.queue), local.check_remote_work)
        };

        Self {
            shared: shared.clone(),
            local_queue: RefCell::new(local_queue),
            check_remote_work: Cell::new(check_remote_work),
            resource: RefCell::new(Some(shared.pop_resource())),
            multithreaded,
        }
    }
}

impl Drop for ThreadContext {
    fn drop(&mut self) {
        let queue = mem::take(self.local_queue.get_mut());
        let check_remote_work = self.check_remote_work.get();

        if self.multithreaded {
            // Hand leftovers to the other threads. A pending wake or a stop
            // must keep travelling to whoever still runs the loop.
            let had_local_work = !queue.is_empty();
            self.shared.move_to_remote(queue);

            if had_local_work || check_remote_work || self.shared.is_stopped() {
                self.shared.trigger_wake_alarm();
            }
        } else {
            let mut local = self.shared.local.lock();
            local.queue.append(queue);
            local.check_remote_work |= check_remote_work;
        }

        if let Some(resource) = self.resource.get_mut().take() {
            self.shared.push_resource(resource);
        }
    }
}

/// Restores the previously installed context on scope exit.
struct Restore(*const ThreadContext);

impl Drop for Restore {
    fn drop(&mut self) {
        CURRENT_CONTEXT.with(|current| current.set(self.0));
    }
}

/// Runs `f` inside a fresh loop context for `shared` on this thread.
///
/// The context is installed as the thread's current one for the duration
/// of `f` and the previous one is restored afterwards, also on unwind.
pub(crate) fn enter_context<R>(shared: &Arc<Shared>, f: impl FnOnce(&ThreadContext) -> R) -> R {
    let context = ThreadContext::new(shared);
    let _restore = Restore(CURRENT_CONTEXT.with(|current| current.replace(&context)));

    f(&context)
}

/// Calls `f` with the current context, if this thread runs a loop.
pub(crate) fn with_current<R>(f: impl FnOnce(&ThreadContext) -> R) -> Option<R> {
    let context = CURRENT_CONTEXT.with(|current| current.get());

    // Non-null pointers always refer to a live context further up the
    // stack of this thread.
    unsafe { context.as_ref() }.map(f)
}

/// Calls `f` with the current context if it belongs to `shared`.
pub(crate) fn with_context_of<R>(
    shared: &Shared,
    f: impl FnOnce(&ThreadContext) -> R,
) -> Option<R> {
    with_current(|context| ptr::eq(Arc::as_ptr(&context.shared), shared).then(|| f(context)))
        .flatten()
}

pub(crate) fn running_in_this_thread(shared: &Shared) -> bool {
    with_context_of(shared, |_| ()).is_some()
}

/// Pushes `op` onto the local queue if this thread runs `shared`'s loop.
///
/// Returns `false`, leaving `op` untouched, otherwise.
pub(crate) fn push_local(shared: &Shared, op: NonNull<Header>) -> bool {
    with_context_of(shared, |context| unsafe {
        context.local_queue.borrow_mut().push_back(op)
    })
    .is_some()
}

/// Calls `f` with this thread's arena if it runs `shared`'s loop.
pub(crate) fn with_resource<R>(
    shared: &Shared,
    f: impl FnOnce(&mut PoolResource) -> R,
) -> Option<R> {
    with_context_of(shared, |context| {
        context.resource.borrow_mut().as_deref_mut().map(f)
    })
    .flatten()
}
