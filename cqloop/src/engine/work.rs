use super::core::Shared;

use std::fmt;
use std::sync::Arc;

/// Keeps an engine's loop alive while held.
///
/// Creating a guard counts as one unit of outstanding work; dropping it
/// finishes that unit. Cloning starts a new one. When the last unit
/// finishes the engine stops, so a `run()` blocked on an otherwise idle
/// engine returns once every guard is gone.
///
/// # Examples
///
/// ```rust
/// use cqloop::Engine;
///
/// let engine = Engine::new();
/// let guard = engine.work_guard();
///
/// let executor = engine.executor();
/// executor.execute(move || drop(guard));
///
/// // Returns once the guard is dropped inside the loop.
/// assert!(engine.run());
/// ```
pub struct WorkGuard {
    shared: Arc<Shared>,
}

impl WorkGuard {
    pub(crate) fn new(shared: Arc<Shared>) -> Self {
        shared.work_started();

        Self { shared }
    }
}

impl Clone for WorkGuard {
    fn clone(&self) -> Self {
        Self::new(self.shared.clone())
    }
}

impl Drop for WorkGuard {
    fn drop(&mut self) {
        self.shared.work_finished();
    }
}

impl fmt::Debug for WorkGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkGuard").finish_non_exhaustive()
    }
}

/// Finishes one unit of work when dropped, including on unwind.
pub(crate) struct FinishOnExit<'a> {
    shared: &'a Shared,
}

impl<'a> FinishOnExit<'a> {
    pub(crate) fn new(shared: &'a Shared) -> Self {
        Self { shared }
    }
}

impl Drop for FinishOnExit<'_> {
    fn drop(&mut self) {
        self.shared.work_finished();
    }
}
