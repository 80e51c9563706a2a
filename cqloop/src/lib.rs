//! # cqloop
//!
//! **cqloop** turns a native completion source, a mechanism that only
//! reports "tag T finished with success flag F" one event at a time, into a
//! general-purpose scheduler.
//!
//! The [`Engine`] drives the source in a loop and lets work be scheduled on
//! it from any thread, even though the only cross-thread wake-up the source
//! offers is an alarm aimed at itself. It provides:
//!
//! - **Local and cross-thread scheduling** through [`Engine::execute`] and
//!   [`Executor`] handles, with a lock-free queue for submissions from
//!   other threads
//! - **External completions**: operations whose tag is handed to the
//!   source and whose handler runs exactly once with the reported result
//! - **Work tracking**: the loop returns once no work is outstanding, and
//!   teardown dispatches everything still pending with a shutdown result
//! - **Pooled operation records** carved out of per-thread arenas
//! - **Alarms and tasks** built on top: [`Alarm`] timers and futures
//!   spawned with [`Engine::spawn`]
//!
//! ## Quick Start
//!
//! ```rust
//! use cqloop::Engine;
//! use std::thread;
//!
//! let engine = Engine::new();
//! let executor = engine.executor().tracked();
//!
//! let worker = thread::spawn(move || {
//!     executor.execute(|| println!("running on the loop"));
//!     // Dropping the tracked executor lets `run` return.
//! });
//!
//! engine.run();
//! worker.join().unwrap();
//! ```
//!
//! ## Modules
//!
//! - [`source`]: the completion source abstraction and the in-process
//!   [`CompletionQueue`](source::CompletionQueue)
//! - [`arena`]: size-class pools backing operation records

mod alarm;
mod engine;
mod error;
mod operation;
mod task;

pub mod arena;
pub mod source;

pub use alarm::{Alarm, AlarmWait};
pub use engine::{Engine, EngineBuilder, Executor, WorkGuard};
pub use error::{Error, JoinError, Result};
pub use operation::OperationResult;
pub use task::{JoinHandle, yield_now};
