use super::timer::TimerEntry;
use super::{AlarmKey, CompletionSource, Deadline, Event, NextEvent, Tag};

use parking_lot::{Condvar, Mutex};
use std::collections::{BTreeMap, BinaryHeap, VecDeque};
use std::time::Instant;

/// An in-process completion source.
///
/// Events are reported in the order they became ready. Alarms are kept in
/// a min-heap and moved to the ready FIFO once their deadline passes, by
/// whichever thread is polling at that moment.
///
/// Any number of threads may block in [`next`](CompletionSource::next) at
/// the same time.
///
/// # Examples
///
/// ```rust
/// use cqloop::source::{CompletionQueue, CompletionSource, Deadline, Event, NextEvent, Tag};
///
/// let queue = CompletionQueue::new();
/// queue.post(Tag::from_raw(8), true);
///
/// assert_eq!(
///     queue.next(Deadline::Now),
///     NextEvent::Ready(Event { tag: Tag::from_raw(8), ok: true })
/// );
/// assert_eq!(queue.next(Deadline::Now), NextEvent::Timeout);
/// ```
pub struct CompletionQueue {
    state: Mutex<State>,

    /// Signalled whenever an event becomes ready or the timer set changes.
    condvar: Condvar,
}

struct State {
    /// Events ready to be returned by `next`.
    ready: VecDeque<Event>,

    /// Pending alarm deadlines, earliest first.
    timers: BinaryHeap<TimerEntry>,

    /// Alarms that have neither fired nor been cancelled.
    armed: BTreeMap<AlarmKey, Tag>,

    next_key: u64,

    shutdown: bool,
}

impl State {
    fn allocate_key(&mut self) -> AlarmKey {
        let key = AlarmKey(self.next_key);
        self.next_key += 1;
        key
    }

    /// Moves every alarm due at `now` to the ready FIFO.
    fn fire_expired(&mut self, now: Instant) {
        while let Some(entry) = self.timers.peek() {
            if entry.deadline > now {
                break;
            }

            let key = entry.key;
            self.timers.pop();

            if let Some(tag) = self.armed.remove(&key) {
                self.ready.push_back(Event { tag, ok: true });
            }
        }
    }

    fn next_timer(&self) -> Option<Instant> {
        self.timers.peek().map(|entry| entry.deadline)
    }

    /// Drops heap entries of cancelled alarms.
    ///
    /// Stale entries at the top are popped right away so they never drive
    /// a wake-up. The rest are compacted once they outnumber the armed
    /// alarms, which bounds the heap at twice the armed count.
    fn prune_timers(&mut self) {
        while let Some(entry) = self.timers.peek() {
            if self.armed.contains_key(&entry.key) {
                break;
            }
            self.timers.pop();
        }

        if self.timers.len() > 2 * self.armed.len() {
            let armed = &self.armed;
            self.timers.retain(|entry| armed.contains_key(&entry.key));
        }
    }
}

impl CompletionQueue {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                ready: VecDeque::new(),
                timers: BinaryHeap::new(),
                armed: BTreeMap::new(),
                next_key: 0,
                shutdown: false,
            }),
            condvar: Condvar::new(),
        }
    }

    /// Returns `true` once [`shutdown`](CompletionSource::shutdown) was
    /// called.
    pub fn is_shutdown(&self) -> bool {
        self.state.lock().shutdown
    }

    /// Number of alarms that have neither fired nor been cancelled.
    pub fn armed_alarms(&self) -> usize {
        self.state.lock().armed.len()
    }

    #[cfg(test)]
    fn timer_entries(&self) -> usize {
        self.state.lock().timers.len()
    }
}

impl Default for CompletionQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl CompletionSource for CompletionQueue {
    fn next(&self, deadline: Deadline) -> NextEvent {
        let mut state = self.state.lock();

        loop {
            let now = Instant::now();
            state.fire_expired(now);

            if let Some(event) = state.ready.pop_front() {
                return NextEvent::Ready(event);
            }

            if state.shutdown && state.armed.is_empty() {
                return NextEvent::Shutdown;
            }

            let limit = match deadline {
                Deadline::Now => return NextEvent::Timeout,
                Deadline::At(at) if at <= now => return NextEvent::Timeout,
                Deadline::At(at) => Some(at),
                Deadline::Forever => None,
            };

            let wake_at = match (limit, state.next_timer()) {
                (Some(limit), Some(timer)) => Some(limit.min(timer)),
                (limit, timer) => limit.or(timer),
            };

            match wake_at {
                Some(at) => {
                    self.condvar.wait_until(&mut state, at);
                }
                None => self.condvar.wait(&mut state),
            }
        }
    }

    fn set_alarm(&self, deadline: Deadline, tag: Tag) -> AlarmKey {
        let mut state = self.state.lock();
        let key = state.allocate_key();

        if state.shutdown {
            state.ready.push_back(Event { tag, ok: false });
            self.condvar.notify_one();
            return key;
        }

        match deadline {
            Deadline::Now => {
                state.ready.push_back(Event { tag, ok: true });
                self.condvar.notify_one();
            }
            Deadline::At(at) => {
                state.armed.insert(key, tag);
                state.timers.push(TimerEntry { deadline: at, key });

                // Waiters may be sleeping past the new deadline.
                self.condvar.notify_all();
            }
            Deadline::Forever => {
                state.armed.insert(key, tag);
            }
        }

        key
    }

    fn cancel_alarm(&self, key: AlarmKey) -> bool {
        let mut state = self.state.lock();

        match state.armed.remove(&key) {
            Some(tag) => {
                state.ready.push_back(Event { tag, ok: false });
                state.prune_timers();
                self.condvar.notify_one();
                true
            }
            None => false,
        }
    }

    fn post(&self, tag: Tag, ok: bool) {
        self.state.lock().ready.push_back(Event { tag, ok });
        self.condvar.notify_one();
    }

    fn shutdown(&self) {
        let mut state = self.state.lock();
        state.shutdown = true;

        let armed = std::mem::take(&mut state.armed);
        for tag in armed.into_values() {
            state.ready.push_back(Event { tag, ok: false });
        }
        state.timers.clear();

        self.condvar.notify_all();
    }
}
