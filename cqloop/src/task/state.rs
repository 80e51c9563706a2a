/// Task is idle and not scheduled.
///
/// The future returned `Poll::Pending` and waits for its waker.
pub(crate) const IDLE: usize = 0;

/// Task is queued on the engine.
pub(crate) const QUEUED: usize = 1;

/// Task is being polled.
///
/// At most one thread may observe this state at a time.
pub(crate) const RUNNING: usize = 2;

/// Task has produced its outcome, whatever it was.
pub(crate) const COMPLETED: usize = 3;

/// Task was woken while running and must be re-queued once the current
/// poll returns.
pub(crate) const NOTIFIED: usize = 4;

/// Task was aborted and has not been finalized yet.
pub(crate) const CANCELLED: usize = 5;
