use super::AlarmKey;

use std::cmp::Ordering;
use std::time::Instant;

/// An alarm waiting in the completion queue's timer heap.
///
/// Cancelled alarms are not removed from the heap. Their entry is skipped
/// when it expires because its key is no longer armed.
pub(crate) struct TimerEntry {
    /// The time at which the alarm fires.
    pub(crate) deadline: Instant,

    pub(crate) key: AlarmKey,
}

impl Eq for TimerEntry {}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.key == other.key
    }
}

impl Ord for TimerEntry {
    /// Reversed so that a `BinaryHeap<TimerEntry>` pops the earliest
    /// deadline first. Alarms with equal deadlines fire in arming order.
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.key.cmp(&self.key))
    }
}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
