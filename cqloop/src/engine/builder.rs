use super::core::Engine;
use crate::source::{CompletionQueue, CompletionSource};

use std::sync::Arc;

/// Builder for configuring and creating an engine.
///
/// # Examples
///
/// ```rust
/// use cqloop::Engine;
/// use cqloop::source::CompletionQueue;
/// use std::sync::Arc;
///
/// let engine = Engine::builder()
///     .concurrency_hint(4)
///     .completion_source(Arc::new(CompletionQueue::new()))
///     .build();
/// # drop(engine);
/// ```
pub struct EngineBuilder {
    /// Number of threads expected to run the loop concurrently.
    concurrency_hint: usize,

    /// Source to drive. A fresh [`CompletionQueue`] when unset.
    source: Option<Arc<dyn CompletionSource>>,
}

impl EngineBuilder {
    /// Creates a builder for a single-threaded engine.
    pub fn new() -> Self {
        Self {
            concurrency_hint: 1,
            source: None,
        }
    }

    /// Sets how many threads will run the loop at the same time.
    ///
    /// A hint above one switches the engine to multithreaded mode: each
    /// running thread keeps its own local queue and hands surplus work to
    /// the others. The hint also sets how many arenas are created up
    /// front.
    ///
    /// # Panics
    ///
    /// Panics if `n == 0`.
    pub fn concurrency_hint(mut self, n: usize) -> Self {
        assert!(n > 0, "concurrency_hint must be > 0");

        self.concurrency_hint = n;
        self
    }

    /// Drives `source` instead of a fresh [`CompletionQueue`].
    ///
    /// The engine shuts the source down when dropped.
    pub fn completion_source(mut self, source: Arc<dyn CompletionSource>) -> Self {
        self.source = Some(source);
        self
    }

    pub fn build(self) -> Engine {
        let source: Arc<dyn CompletionSource> = match self.source {
            Some(source) => source,
            None => Arc::new(CompletionQueue::new()),
        };

        Engine::from_parts(source, self.concurrency_hint)
    }
}

impl Default for EngineBuilder {
    fn default() -> Self {
        Self::new()
    }
}
