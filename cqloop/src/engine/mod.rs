//! The event-loop engine.
//!
//! An [`Engine`] owns one completion source and turns it into a
//! scheduler. Its state is split between what every thread can see
//! (`core::Shared`: the remote queue, the work counter, the stop and
//! shutdown flags, the arena stack) and what only the thread currently
//! running the loop touches (`context::ThreadContext`: the local queue and
//! the thread's arena).
//!
//! Work submitted from inside the loop goes straight to the local queue.
//! Work submitted from anywhere else goes through the lock-free remote
//! queue; the first submission after the loop stopped watching it arms a
//! zero-deadline alarm on the completion source, which is the only way to
//! wake a thread blocked there.

pub(crate) mod context;
pub(crate) mod core;
pub(crate) mod run;

mod builder;
mod executor;
mod work;

pub use self::builder::EngineBuilder;
pub use self::core::Engine;
pub use self::executor::Executor;
pub use self::work::WorkGuard;
