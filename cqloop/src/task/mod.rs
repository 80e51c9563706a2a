//! Futures driven by an engine.
//!
//! A task is polled as ordinary engine work: spawning it and every wake-up
//! schedule one operation that polls the future once on the loop. While a
//! task is pending it counts as outstanding work, so `run()` does not
//! return before every spawned task has finished or been aborted.

mod core;
mod handle;
mod state;
mod waker;
mod yield_now;

pub(crate) use self::core::spawn;
pub use handle::JoinHandle;
pub use yield_now::yield_now;
