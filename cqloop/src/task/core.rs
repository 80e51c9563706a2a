use super::JoinHandle;
use super::state::{CANCELLED, COMPLETED, IDLE, NOTIFIED, QUEUED, RUNNING};
use super::waker::make_waker;
use crate::engine::{Executor, WorkGuard};
use crate::error::JoinError;

use parking_lot::Mutex;
use std::cell::UnsafeCell;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::task::{Context, Poll, Waker};

type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

/// A future spawned onto an engine.
///
/// Each poll runs as one operation on the engine's loop. Waking the task
/// schedules another one through the engine, so a task woken from any
/// thread is always polled on a thread running the loop.
pub(crate) struct Task<T> {
    /// The underlying future, dropped as soon as the task is finalized.
    ///
    /// Only touched by the thread that moved the state to `RUNNING`, or by
    /// the one that cancelled the task while nobody was polling it.
    future: UnsafeCell<Option<BoxFuture<T>>>,

    /// Outcome waiting to be picked up by the `JoinHandle`.
    result: Mutex<Option<Result<T, JoinError>>>,

    pub(crate) state: AtomicUsize,

    executor: Executor,

    /// Keeps the engine's loop alive until the task is finalized.
    work: Mutex<Option<WorkGuard>>,

    /// Waker of the `JoinHandle` awaiting this task.
    waiter: Mutex<Option<Waker>>,
}

unsafe impl<T: Send> Send for Task<T> {}
unsafe impl<T: Send> Sync for Task<T> {}

impl<T: Send + 'static> Task<T> {
    fn new<F>(future: F, executor: Executor) -> Self
    where
        F: Future<Output = T> + Send + 'static,
    {
        let work = executor.work_guard();

        Self {
            future: UnsafeCell::new(Some(Box::pin(future))),
            result: Mutex::new(None),
            state: AtomicUsize::new(QUEUED),
            executor,
            work: Mutex::new(Some(work)),
            waiter: Mutex::new(None),
        }
    }

    /// Queues one poll of the task on the engine.
    ///
    /// If the engine is tearing down, the task is cancelled instead.
    fn schedule(self: Arc<Self>) {
        let executor = self.executor.clone();

        executor.shared().schedule(move |result| {
            if result.is_shutdown() {
                self.abort();
            } else {
                self.run();
            }
        });
    }

    /// Polls the future once.
    ///
    /// A panic inside the future is caught and becomes the task's outcome.
    fn run(self: Arc<Self>) {
        let current = self.state.load(Ordering::Acquire);

        if current != QUEUED && current != NOTIFIED {
            return;
        }

        if self
            .state
            .compare_exchange(current, RUNNING, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }

        let waker = make_waker(self.clone());
        let mut cx = Context::from_waker(&waker);

        // Safety: the RUNNING state gives this thread exclusive access.
        let poll = panic::catch_unwind(AssertUnwindSafe(|| {
            let future = unsafe { &mut *self.future.get() };

            match future {
                Some(future) => future.as_mut().poll(&mut cx),
                None => Poll::Pending,
            }
        }));

        match poll {
            Ok(Poll::Pending) => {
                match self
                    .state
                    .compare_exchange(RUNNING, IDLE, Ordering::AcqRel, Ordering::Acquire)
                {
                    Ok(_) => {}
                    Err(NOTIFIED) => {
                        self.state.store(QUEUED, Ordering::Release);
                        self.schedule();
                    }
                    // Aborted while running.
                    Err(_) => self.finish(Err(JoinError::Cancelled)),
                }
            }
            Ok(Poll::Ready(value)) => self.finish(Ok(value)),
            Err(payload) => self.finish(Err(JoinError::Panicked(payload))),
        }
    }

    /// Re-queues the task.
    ///
    /// An idle task is scheduled on the engine. A running one is marked so
    /// that it is re-queued once its current poll returns.
    pub(crate) fn wake(self: Arc<Self>) {
        loop {
            let state = self.state.load(Ordering::Acquire);

            match state {
                IDLE => {
                    if self
                        .state
                        .compare_exchange(IDLE, QUEUED, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                    {
                        self.schedule();
                        return;
                    }
                }
                RUNNING => {
                    if self
                        .state
                        .compare_exchange(RUNNING, NOTIFIED, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                    {
                        return;
                    }
                }
                _ => return,
            }
        }
    }

    /// Cancels the task.
    ///
    /// A task that is not being polled is finalized right away. A running
    /// task is finalized by its poller once the current poll returns.
    pub(crate) fn abort(&self) {
        loop {
            let state = self.state.load(Ordering::Acquire);

            if state == COMPLETED || state == CANCELLED {
                return;
            }

            if self
                .state
                .compare_exchange(state, CANCELLED, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                if state == IDLE || state == QUEUED {
                    self.finish(Err(JoinError::Cancelled));
                }
                return;
            }
        }
    }

    /// Stores the outcome, releases the future and the work guard, then
    /// wakes the joiner.
    fn finish(&self, outcome: Result<T, JoinError>) {
        // Safety: callers either hold RUNNING or cancelled an idle or
        // queued task, so nobody else is polling.
        drop(unsafe { (*self.future.get()).take() });

        *self.result.lock() = Some(outcome);
        self.state.store(COMPLETED, Ordering::Release);

        drop(self.work.lock().take());

        if let Some(waker) = self.waiter.lock().take() {
            waker.wake();
        }
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.state.load(Ordering::Acquire) == COMPLETED
    }

    pub(crate) fn take_result(&self) -> Option<Result<T, JoinError>> {
        self.result.lock().take()
    }

    pub(crate) fn register_waiter(&self, waker: &Waker) {
        let mut waiter = self.waiter.lock();

        match &*waiter {
            Some(current) if current.will_wake(waker) => {}
            _ => *waiter = Some(waker.clone()),
        }
    }
}

/// Spawns `future` as a task on the engine behind `executor`.
pub(crate) fn spawn<F, T>(executor: Executor, future: F) -> JoinHandle<T>
where
    T: Send + 'static,
    F: Future<Output = T> + Send + 'static,
{
    let task = Arc::new(Task::new(future, executor));
    task.clone().schedule();

    JoinHandle::new(task)
}
