use super::core::Task;
use crate::error::JoinError;

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

/// A handle to a task spawned on an engine.
///
/// Awaiting the handle yields the task's output, or a [`JoinError`] if the
/// task was aborted, torn down with the engine, or panicked.
///
/// Dropping the handle does **not** cancel the task; it only discards the
/// ability to observe its outcome.
pub struct JoinHandle<T> {
    task: Arc<Task<T>>,

    /// Set once the outcome was handed out.
    done: bool,
}

impl<T: Send + 'static> JoinHandle<T> {
    pub(crate) fn new(task: Arc<Task<T>>) -> Self {
        Self { task, done: false }
    }

    /// Cancels the task.
    ///
    /// A task that is not being polled is dropped right away. A task in
    /// the middle of a poll is dropped once that poll returns. Aborting a
    /// finished task does nothing.
    pub fn abort(&self) {
        self.task.abort();
    }

    /// Returns `true` once the task produced its outcome.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Takes the outcome without waiting, if the task already finished.
    pub(crate) fn try_take(&self) -> Option<Result<T, JoinError>> {
        self.task.take_result()
    }
}

impl<T: Send + 'static> Future for JoinHandle<T> {
    type Output = Result<T, JoinError>;

    /// The waker is registered **before** re-checking the outcome to avoid
    /// missed wake-ups.
    ///
    /// # Panics
    ///
    /// Panics if polled again after returning `Poll::Ready`.
    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        assert!(!this.done, "JoinHandle polled after completion");

        if let Some(outcome) = this.task.take_result() {
            this.done = true;
            return Poll::Ready(outcome);
        }

        this.task.register_waiter(cx.waker());

        match this.task.take_result() {
            Some(outcome) => {
                this.done = true;
                Poll::Ready(outcome)
            }
            None => Poll::Pending,
        }
    }
}

impl<T> fmt::Debug for JoinHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JoinHandle").finish_non_exhaustive()
    }
}
