use super::Header;

use std::ptr::NonNull;

/// A single-threaded FIFO of operations linked through their headers.
///
/// The queue owns no memory of its own; it only threads the `next`
/// pointers of the operations it holds. It is not thread-safe and must only
/// be touched by the thread currently running the engine loop.
#[derive(Default)]
pub(crate) struct IntrusiveQueue {
    head: Option<NonNull<Header>>,
    tail: Option<NonNull<Header>>,
}

// Queued operations carry `Send` handlers; moving the queue moves them.
unsafe impl Send for IntrusiveQueue {}

impl IntrusiveQueue {
    /// Creates an empty queue.
    pub(crate) const fn new() -> Self {
        Self {
            head: None,
            tail: None,
        }
    }

    /// Builds a queue from a chain linked newest-first.
    ///
    /// Producers of the atomic queue push onto the front of a stack, so the
    /// chain handed over on dequeue is in reverse order. Reversing it here
    /// restores submission order.
    ///
    /// # Safety
    ///
    /// `head` must be null or the start of a well-formed, null-terminated
    /// chain of live operations owned by the caller.
    pub(crate) unsafe fn from_reversed(head: *mut Header) -> Self {
        let tail = NonNull::new(head);
        let mut previous: Option<NonNull<Header>> = None;
        let mut current = tail;

        while let Some(op) = current {
            let next = unsafe { (*op.as_ptr()).next };
            unsafe { (*op.as_ptr()).next = previous };
            previous = Some(op);
            current = next;
        }

        Self {
            head: previous,
            tail,
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    /// Appends `op` to the back of the queue.
    ///
    /// # Safety
    ///
    /// `op` must be a live operation that is not linked into any queue.
    pub(crate) unsafe fn push_back(&mut self, op: NonNull<Header>) {
        unsafe { (*op.as_ptr()).next = None };

        match self.tail {
            Some(tail) => unsafe { (*tail.as_ptr()).next = Some(op) },
            None => self.head = Some(op),
        }

        self.tail = Some(op);
    }

    /// Removes the operation at the front of the queue.
    pub(crate) fn pop_front(&mut self) -> Option<NonNull<Header>> {
        let op = self.head?;

        self.head = unsafe { (*op.as_ptr()).next.take() };
        if self.head.is_none() {
            self.tail = None;
        }

        Some(op)
    }

    /// Moves every operation of `other` to the back of this queue.
    pub(crate) fn append(&mut self, mut other: IntrusiveQueue) {
        let Some(other_head) = other.head.take() else {
            return;
        };

        match self.tail {
            Some(tail) => unsafe { (*tail.as_ptr()).next = Some(other_head) },
            None => self.head = Some(other_head),
        }

        self.tail = other.tail.take();
    }
}

impl Drop for IntrusiveQueue {
    fn drop(&mut self) {
        debug_assert!(
            self.head.is_none() || std::thread::panicking(),
            "intrusive queue dropped with pending operations"
        );
    }
}
