use super::context;
use super::core::Shared;
use super::work::WorkGuard;
use crate::error::Result;
use crate::operation::OperationResult;
use crate::source::{CompletionSource, Tag};
use crate::task::{self, JoinHandle};

use std::fmt;
use std::future::Future;
use std::sync::Arc;

/// A cheap, clonable handle that schedules work on an engine.
///
/// Executors may be sent to other threads and outlive the engine. Work
/// submitted after the engine was dropped never runs.
///
/// A *tracked* executor, obtained with [`tracked`](Self::tracked), also
/// holds a [`WorkGuard`]: the engine's loop keeps running while it exists.
#[derive(Clone)]
pub struct Executor {
    shared: Arc<Shared>,
    guard: Option<WorkGuard>,
}

impl Executor {
    pub(crate) fn new(shared: Arc<Shared>) -> Self {
        Self {
            shared,
            guard: None,
        }
    }

    pub(crate) fn shared(&self) -> &Arc<Shared> {
        &self.shared
    }

    /// Returns an executor that counts as outstanding work while alive.
    pub fn tracked(&self) -> Executor {
        Executor {
            shared: self.shared.clone(),
            guard: Some(WorkGuard::new(self.shared.clone())),
        }
    }

    /// Returns an executor that does not keep the loop alive.
    pub fn untracked(&self) -> Executor {
        Executor::new(self.shared.clone())
    }

    pub fn is_tracked(&self) -> bool {
        self.guard.is_some()
    }

    /// Returns a guard keeping the loop alive until dropped.
    pub fn work_guard(&self) -> WorkGuard {
        WorkGuard::new(self.shared.clone())
    }

    /// Schedules `f` to run on the engine's loop.
    ///
    /// Never runs `f` inline, even on the loop thread.
    pub fn execute<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.shared.execute(f);
    }

    /// Same as [`execute`](Self::execute).
    pub fn post<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.shared.execute(f);
    }

    /// Runs `f` immediately when called from the engine's loop, otherwise
    /// schedules it like [`execute`](Self::execute).
    pub fn dispatch<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if context::running_in_this_thread(&self.shared) {
            f();
        } else {
            self.shared.execute(f);
        }
    }

    /// See [`Engine::register_external_completion`](crate::Engine::register_external_completion).
    pub fn register_external_completion<I, F>(&self, initiate: I, on_complete: F) -> Result<()>
    where
        I: FnOnce(Tag),
        F: FnOnce(OperationResult) + Send + 'static,
    {
        self.shared.register_external_completion(initiate, on_complete)
    }

    /// Spawns `future` as a task on the engine.
    pub fn spawn<F>(&self, future: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        task::spawn(self.untracked(), future)
    }

    pub fn stop(&self) {
        self.shared.stop();
    }

    pub fn is_stopped(&self) -> bool {
        self.shared.is_stopped()
    }

    /// Returns `true` if the current thread is running the engine's loop.
    pub fn running_in_this_thread(&self) -> bool {
        context::running_in_this_thread(&self.shared)
    }

    pub fn completion_source(&self) -> &Arc<dyn CompletionSource> {
        &self.shared.source
    }
}

impl PartialEq for Executor {
    /// Executors are equal when they target the same engine.
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }
}

impl Eq for Executor {}

impl fmt::Debug for Executor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Executor")
            .field("tracked", &self.is_tracked())
            .finish_non_exhaustive()
    }
}
