//! The loop itself.
//!
//! Every iteration ("do one") first moves cross-thread work into the local
//! queue when a wake-up asked for it, then dispatches a snapshot of the
//! local queue, and finally polls the completion source once. The poll
//! does not block while more work is known to be ready.

use super::context::{self, ThreadContext};
use super::core::Shared;
use super::work::FinishOnExit;
use crate::operation::queue::IntrusiveQueue;
use crate::operation::{self, Header, Invoke, OperationResult};
use crate::source::{Deadline, NextEvent, Tag};

use std::mem;
use std::sync::Arc;
use std::sync::atomic::Ordering;

/// Which parts of the engine a loop drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LoopKind {
    /// Local queue, remote queue and completion source.
    Full,

    /// Completion source only.
    CompletionQueueOnly,
}

impl LoopKind {
    fn has_processed(self, result: DoOneResult) -> bool {
        match self {
            LoopKind::Full => result.any(),
            LoopKind::CompletionQueueOnly => result.event.handled && !result.event.wake,
        }
    }
}

/// Outcome of polling the completion source once.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct EventResult {
    /// An event was received.
    pub(crate) handled: bool,

    /// The event was the engine's own wake-up.
    pub(crate) wake: bool,
}

/// Outcome of one loop iteration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct DoOneResult {
    pub(crate) event: EventResult,
    pub(crate) processed_local: bool,
}

impl DoOneResult {
    pub(crate) fn any(self) -> bool {
        self.event.handled || self.processed_local
    }
}

/// Drives the loop of `shared` on this thread while `condition` holds and
/// iterations keep finding something to do.
///
/// A loop started from inside a running loop of the same engine reuses its
/// context. Otherwise a loop started without outstanding work marks the
/// engine stopped and returns immediately.
pub(crate) fn process_work<C>(
    shared: &Arc<Shared>,
    kind: LoopKind,
    deadline: Deadline,
    mut condition: C,
) -> bool
where
    C: FnMut() -> bool,
{
    let mut run = |context: &ThreadContext| {
        let mut processed = false;

        while condition() {
            let result = match kind {
                LoopKind::Full => do_one(context, deadline, Invoke::Yes),
                LoopKind::CompletionQueueOnly => DoOneResult {
                    event: handle_next_event(context, deadline, Invoke::Yes),
                    processed_local: false,
                },
            };

            if !result.any() {
                break;
            }

            processed |= kind.has_processed(result);
        }

        processed
    };

    if let Some(processed) = context::with_context_of(shared, |context| run(context)) {
        return processed;
    }

    // Reset first: a runner finishing the last unit of work in between
    // would otherwise have its stop cleared by this one.
    shared.reset();

    if shared.outstanding_work() == 0 {
        shared.mark_stopped();
        return false;
    }

    context::enter_context(shared, run)
}

/// Runs one iteration of the loop.
pub(crate) fn do_one(context: &ThreadContext, deadline: Deadline, invoke: Invoke) -> DoOneResult {
    let shared = &*context.shared;
    let mut check_remote_work = context.check_remote_work.get();

    if context.multithreaded {
        let mut old = context.local_queue.take();
        let mut fresh = IntrusiveQueue::new();

        if check_remote_work && !shared.remote_queue.dequeue_all_and_try_mark_inactive(&mut fresh) {
            // A producer raced the drain and skipped the wake-up.
            shared.trigger_wake_alarm();
        }

        // Keep one old and one fresh item, share everything else.
        let mut keep = IntrusiveQueue::new();
        if let Some(op) = old.pop_front() {
            unsafe { keep.push_back(op) };
        }
        if let Some(op) = fresh.pop_front() {
            unsafe { keep.push_back(op) };
        }

        fresh.append(old);
        if !fresh.is_empty() {
            shared.move_to_remote(fresh);
            shared.trigger_wake_alarm();
        }

        check_remote_work = false;
        context.check_remote_work.set(false);
        *context.local_queue.borrow_mut() = keep;
    } else {
        if check_remote_work {
            let mut local = context.local_queue.borrow_mut();
            check_remote_work = !shared.remote_queue.dequeue_all_and_try_mark_inactive(&mut local);
        }

        context.check_remote_work.set(check_remote_work);
    }

    let processed_local = process_local_queue(context, invoke) > 0;
    let more_work_pending = check_remote_work || !context.local_queue.borrow().is_empty();

    if !more_work_pending && shared.is_stopped() {
        return DoOneResult {
            event: EventResult::default(),
            processed_local,
        };
    }

    let deadline = if more_work_pending { Deadline::Now } else { deadline };

    DoOneResult {
        event: handle_next_event(context, deadline, invoke),
        processed_local,
    }
}

/// Operations of a local batch not dispatched yet.
///
/// If a handler unwinds, the remainder goes back to the front of the local
/// queue, ahead of anything the batch scheduled.
struct Batch<'a> {
    context: &'a ThreadContext,
    queue: IntrusiveQueue,
}

impl Drop for Batch<'_> {
    fn drop(&mut self) {
        if self.queue.is_empty() {
            return;
        }

        let mut rest = mem::take(&mut self.queue);
        rest.append(self.context.local_queue.take());
        *self.context.local_queue.borrow_mut() = rest;
    }
}

/// Dispatches the operations currently in the local queue.
///
/// Work they schedule lands in the now empty local queue and waits for
/// the next iteration. Returns the number of dispatched operations.
pub(crate) fn process_local_queue(context: &ThreadContext, invoke: Invoke) -> usize {
    let result = match invoke {
        Invoke::Yes => OperationResult::Ok,
        Invoke::No => OperationResult::ShutdownNotOk,
    };

    let mut batch = Batch {
        context,
        queue: context.local_queue.take(),
    };
    let mut processed = 0;

    while let Some(op) = batch.queue.pop_front() {
        processed += 1;

        let _finish = FinishOnExit::new(&context.shared);
        unsafe { Header::complete(op, result, &context.shared) };
    }

    processed
}

/// Polls the completion source once and dispatches what it reports.
pub(crate) fn handle_next_event(
    context: &ThreadContext,
    deadline: Deadline,
    invoke: Invoke,
) -> EventResult {
    let shared = &*context.shared;

    let event = match shared.source.next(deadline) {
        NextEvent::Ready(event) => event,
        NextEvent::Timeout | NextEvent::Shutdown => return EventResult::default(),
    };

    if event.tag == Tag::WAKE {
        let check = if context.multithreaded {
            shared.check_remote_work.swap(false, Ordering::AcqRel)
                || context.check_remote_work.get()
        } else {
            true
        };
        context.check_remote_work.set(check);

        return EventResult {
            handled: true,
            wake: true,
        };
    }

    let _finish = FinishOnExit::new(shared);
    unsafe {
        let op = operation::from_tag(event.tag);
        Header::complete(op, OperationResult::from_event(event.ok, invoke), shared);
    }

    EventResult {
        handled: true,
        wake: false,
    }
}

/// Dispatches everything left in the engine with a `Shutdown*` result.
///
/// Called once the completion source was shut down. Returns once the
/// source reports that every tag was delivered. Returns the number of
/// dispatched operations.
pub(crate) fn drain(shared: &Arc<Shared>) -> usize {
    shared.set_multithreaded(false);

    context::enter_context(shared, |context| {
        let _ = shared.remote_queue.try_mark_active();
        context.check_remote_work.set(true);

        let mut drained = 0;

        loop {
            if context.check_remote_work.get() {
                let mut local = context.local_queue.borrow_mut();
                let inactive = shared.remote_queue.dequeue_all_and_try_mark_inactive(&mut local);
                context.check_remote_work.set(!inactive);
            }

            let processed = process_local_queue(context, Invoke::No);
            if processed > 0 {
                drained += processed;
                continue;
            }

            let deadline = if context.check_remote_work.get() {
                Deadline::Now
            } else {
                Deadline::Forever
            };

            let event = handle_next_event(context, deadline, Invoke::No);
            if event.handled && !event.wake {
                drained += 1;
            }

            if !event.handled && deadline == Deadline::Forever {
                break;
            }
        }

        drained
    })
}
