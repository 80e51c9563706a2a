//! The native completion source an engine drives.
//!
//! A completion source is the black box the engine sits on top of: it
//! accepts tagged asynchronous actions and reports, one event at a time,
//! that "tag T finished with success flag F". The only cross-thread wake-up
//! primitive it offers is an alarm that fires its tag at a deadline.
//!
//! [`CompletionQueue`] is the in-process implementation used by default.

mod queue;
mod timer;

pub use queue::CompletionQueue;

use std::time::{Duration, Instant};

/// Opaque identifier correlating a native action with its operation.
///
/// Engine-created tags are operation addresses. [`Tag::WAKE`] is reserved
/// for the engine's own wake-up alarm and is never an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Tag(usize);

impl Tag {
    /// The engine's wake-up tag.
    pub const WAKE: Tag = Tag(0);

    /// Rebuilds a tag from the value returned by [`into_raw`](Self::into_raw).
    pub const fn from_raw(raw: usize) -> Self {
        Tag(raw)
    }

    /// Returns the raw value, for sources that carry tags through native
    /// code.
    pub const fn into_raw(self) -> usize {
        self.0
    }
}

/// A single completion reported by a source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Event {
    pub tag: Tag,

    /// `false` when the action failed or was cancelled.
    pub ok: bool,
}

/// How long [`CompletionSource::next`] may block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Deadline {
    /// Do not block.
    Now,

    /// Block until the given instant at the latest.
    At(Instant),

    /// Block until an event arrives or the source shuts down.
    Forever,
}

impl Deadline {
    /// A deadline `duration` from now.
    pub fn after(duration: Duration) -> Self {
        Instant::now()
            .checked_add(duration)
            .map_or(Deadline::Forever, Deadline::At)
    }

    /// Returns the instant bounding the wait, if any.
    ///
    /// [`Deadline::Now`] maps to the current instant.
    pub fn instant(self) -> Option<Instant> {
        match self {
            Deadline::Now => Some(Instant::now()),
            Deadline::At(at) => Some(at),
            Deadline::Forever => None,
        }
    }
}

impl From<Instant> for Deadline {
    fn from(at: Instant) -> Self {
        Deadline::At(at)
    }
}

/// Outcome of [`CompletionSource::next`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NextEvent {
    Ready(Event),

    /// The deadline passed without an event.
    Timeout,

    /// The source has shut down and every pending tag was delivered.
    Shutdown,
}

/// Handle to an alarm armed with [`CompletionSource::set_alarm`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AlarmKey(pub u64);

/// A native completion mechanism.
///
/// Implementations must allow several threads to call [`next`] at once.
/// Every tag handed to the source must eventually be reported exactly once,
/// including after [`shutdown`], so the engine can reclaim the operation
/// behind it.
///
/// [`next`]: CompletionSource::next
/// [`shutdown`]: CompletionSource::shutdown
pub trait CompletionSource: Send + Sync {
    /// Waits for the next event, at most until `deadline`.
    fn next(&self, deadline: Deadline) -> NextEvent;

    /// Arms an alarm that reports `tag` with `ok = true` at `deadline`.
    ///
    /// After shutdown the tag is reported immediately with `ok = false`.
    fn set_alarm(&self, deadline: Deadline, tag: Tag) -> AlarmKey;

    /// Cancels an armed alarm, which then reports its tag with
    /// `ok = false`.
    ///
    /// Returns `false` if the alarm already fired or was cancelled.
    fn cancel_alarm(&self, key: AlarmKey) -> bool;

    /// Reports `tag` as finished.
    fn post(&self, tag: Tag, ok: bool);

    /// Stops accepting work and cancels every armed alarm.
    ///
    /// Once everything pending was delivered, `next` returns
    /// [`NextEvent::Shutdown`].
    fn shutdown(&self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wake_tag_is_null() {
        assert_eq!(Tag::WAKE.into_raw(), 0);
        assert_eq!(Tag::from_raw(0x1000).into_raw(), 0x1000);
    }

    #[test]
    fn deadline_after_is_in_the_future() {
        let before = Instant::now();

        match Deadline::after(Duration::from_millis(5)) {
            Deadline::At(at) => assert!(at > before),
            other => panic!("unexpected deadline {other:?}"),
        }

        assert_eq!(Deadline::after(Duration::MAX), Deadline::Forever);
        assert_eq!(Deadline::Forever.instant(), None);
    }
}
