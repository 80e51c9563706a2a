use crate::engine::Executor;
use crate::engine::core::Shared;
use crate::error::{Error, Result};
use crate::operation::OperationResult;
use crate::source::{AlarmKey, Deadline};

use parking_lot::Mutex;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, Waker};

/// A timer on an engine's completion source.
///
/// An alarm has at most one outstanding wait. The wait completes on the
/// engine's loop with `true` once the deadline passes, or with `false` if
/// it was cancelled first. Dropping the alarm cancels the outstanding wait.
///
/// # Examples
///
/// ```rust
/// use cqloop::{Alarm, Engine};
/// use cqloop::source::Deadline;
/// use std::time::Duration;
///
/// let engine = Engine::new();
/// let alarm = Alarm::new(&engine.executor());
///
/// alarm
///     .wait(Deadline::after(Duration::from_millis(5)), |expired| assert!(expired))
///     .unwrap();
///
/// engine.run();
/// ```
pub struct Alarm {
    shared: Arc<Shared>,
    state: Arc<Mutex<AlarmState>>,
}

#[derive(Default)]
struct AlarmState {
    /// Key of the armed alarm, once the source accepted it.
    key: Option<AlarmKey>,

    /// Whether a wait is outstanding.
    pending: bool,
}

impl Alarm {
    pub fn new(executor: &Executor) -> Self {
        Self {
            shared: executor.shared().clone(),
            state: Arc::new(Mutex::new(AlarmState::default())),
        }
    }

    /// Waits for `deadline`, then calls `handler` on the loop.
    ///
    /// `handler` receives `true` if the deadline passed and `false` if the
    /// wait was cancelled. It is dropped without being called if the engine
    /// is torn down first.
    ///
    /// # Errors
    ///
    /// - [`Error::AlarmPending`] if a wait is already outstanding.
    /// - [`Error::Shutdown`] if the engine is tearing down.
    pub fn wait<F>(&self, deadline: impl Into<Deadline>, handler: F) -> Result<()>
    where
        F: FnOnce(bool) + Send + 'static,
    {
        self.wait_raw(deadline.into(), move |result| {
            if !result.is_shutdown() {
                handler(result.is_ok());
            }
        })
    }

    /// Returns a future resolving once `deadline` passes.
    ///
    /// Resolves to `Ok(true)` if the deadline passed, `Ok(false)` if the
    /// wait was cancelled, and `Err(Error::Shutdown)` if the engine was torn
    /// down. Dropping the future before it resolves cancels the wait.
    pub fn wait_async(&self, deadline: impl Into<Deadline>) -> AlarmWait<'_> {
        AlarmWait {
            alarm: self,
            deadline: deadline.into(),
            slot: None,
            finished: false,
        }
    }

    /// Cancels the outstanding wait, if any.
    ///
    /// Returns `true` if a wait was cancelled. Its handler still runs, with
    /// `false`.
    ///
    /// A wait whose registration is still in progress on another thread is
    /// cancelled once the source accepted it.
    pub fn cancel(&self) -> bool {
        let state = self.state.lock();

        match state.key {
            Some(key) => self.shared.source.cancel_alarm(key),
            None => false,
        }
    }

    /// Returns `true` while a wait is outstanding.
    pub fn is_pending(&self) -> bool {
        self.state.lock().pending
    }

    fn wait_raw<F>(&self, deadline: Deadline, on_complete: F) -> Result<()>
    where
        F: FnOnce(OperationResult) + Send + 'static,
    {
        // Held until the key is stored, so neither `cancel` nor the
        // completion observes a pending wait without its key.
        let mut state = self.state.lock();
        if state.pending {
            return Err(Error::AlarmPending);
        }
        state.pending = true;

        let source = &self.shared.source;
        let completed = self.state.clone();

        let registered = self.shared.register_external_completion(
            |tag| state.key = Some(source.set_alarm(deadline, tag)),
            move |result| {
                {
                    let mut state = completed.lock();
                    state.key = None;
                    state.pending = false;
                }

                on_complete(result);
            },
        );

        if registered.is_err() {
            state.pending = false;
        }

        registered
    }
}

impl Drop for Alarm {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// Future returned by [`Alarm::wait_async`].
pub struct AlarmWait<'a> {
    alarm: &'a Alarm,
    deadline: Deadline,

    /// Shared with the completion handler once the wait is registered.
    slot: Option<Arc<Mutex<WaitSlot>>>,

    /// Set once the future resolved.
    finished: bool,
}

#[derive(Default)]
struct WaitSlot {
    outcome: Option<Result<bool>>,
    waker: Option<Waker>,
}

impl Future for AlarmWait<'_> {
    type Output = Result<bool>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();

        let slot = match &this.slot {
            Some(slot) => slot.clone(),
            None => {
                let slot = Arc::new(Mutex::new(WaitSlot::default()));
                let completed = slot.clone();

                let registered = this.alarm.wait_raw(this.deadline, move |result| {
                    let outcome = if result.is_shutdown() {
                        Err(Error::Shutdown)
                    } else {
                        Ok(result.is_ok())
                    };

                    let waker = {
                        let mut slot = completed.lock();
                        slot.outcome = Some(outcome);
                        slot.waker.take()
                    };

                    if let Some(waker) = waker {
                        waker.wake();
                    }
                });

                if let Err(error) = registered {
                    this.finished = true;
                    return Poll::Ready(Err(error));
                }

                this.slot = Some(slot.clone());
                slot
            }
        };

        let mut slot = slot.lock();

        match slot.outcome.take() {
            Some(outcome) => {
                this.finished = true;
                Poll::Ready(outcome)
            }
            None => {
                slot.waker = Some(cx.waker().clone());
                Poll::Pending
            }
        }
    }
}

impl Drop for AlarmWait<'_> {
    /// Cancels the wait if the future is dropped before it resolved.
    fn drop(&mut self) {
        if self.finished {
            return;
        }

        if let Some(slot) = &self.slot {
            if slot.lock().outcome.is_none() {
                self.alarm.cancel();
            }
        }
    }
}
