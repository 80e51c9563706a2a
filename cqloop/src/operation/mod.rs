//! Type-erased operation records.
//!
//! Everything the engine can run is an operation: a `#[repr(C)]` header
//! holding an intrusive `next` pointer and a single completion function
//! pointer, followed by the captured handler. The completion function is
//! chosen when the record is allocated, so it knows both the concrete
//! handler type and where the storage came from.
//!
//! Dispatching an operation consumes it: the handler is moved out, the
//! storage is released, and only then is the handler invoked. A panicking
//! handler therefore never leaks or double-frees its record.

pub(crate) mod atomic_queue;
pub(crate) mod queue;

use crate::arena;
use crate::engine::context;
use crate::engine::core::Shared;
use crate::source::Tag;

use std::alloc::Layout;
use std::marker::PhantomData;
use std::mem::{self, ManuallyDrop};
use std::ptr::NonNull;

/// Outcome delivered to an operation when it is dispatched.
///
/// The `Shutdown*` variants are only produced while the engine drains its
/// completion source during teardown. Handlers receiving them must release
/// their resources but skip any user-visible side effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationResult {
    /// The native action completed successfully.
    Ok,

    /// The native action failed or was cancelled.
    NotOk,

    /// The action succeeded, but the engine is shutting down.
    ShutdownOk,

    /// The action failed, or never ran, and the engine is shutting down.
    ShutdownNotOk,
}

impl OperationResult {
    /// Builds the result for a completion source event.
    pub(crate) fn from_event(ok: bool, invoke: Invoke) -> Self {
        match (invoke, ok) {
            (Invoke::Yes, true) => Self::Ok,
            (Invoke::Yes, false) => Self::NotOk,
            (Invoke::No, true) => Self::ShutdownOk,
            (Invoke::No, false) => Self::ShutdownNotOk,
        }
    }

    /// Returns `true` for `Ok` and `ShutdownOk`.
    pub fn is_ok(self) -> bool {
        matches!(self, Self::Ok | Self::ShutdownOk)
    }

    /// Returns `true` if the engine is tearing down.
    pub fn is_shutdown(self) -> bool {
        matches!(self, Self::ShutdownOk | Self::ShutdownNotOk)
    }
}

/// Whether dispatched handlers should act or only clean up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Invoke {
    Yes,
    No,
}

/// Completion entry point stored in every header.
pub(crate) type CompleteFn = unsafe fn(NonNull<Header>, OperationResult, &Shared);

/// The fixed-layout prefix shared by every operation.
#[repr(C)]
pub(crate) struct Header {
    /// Intrusive link used by both queue flavours.
    pub(crate) next: Option<NonNull<Header>>,

    complete: CompleteFn,
}

impl Header {
    /// Dispatches `op`, consuming it.
    ///
    /// # Safety
    ///
    /// `op` must point to a live operation that is not linked into any
    /// queue. It must not be used again afterwards.
    pub(crate) unsafe fn complete(op: NonNull<Header>, result: OperationResult, shared: &Shared) {
        let complete = unsafe { (*op.as_ptr()).complete };
        unsafe { complete(op, result, shared) }
    }

    /// Allocates a header that is never dispatched, for queue tests.
    #[cfg(test)]
    pub(crate) fn detached() -> NonNull<Header> {
        unsafe fn unreachable(_: NonNull<Header>, _: OperationResult, _: &Shared) {
            unreachable!("detached operations are never dispatched");
        }

        NonNull::from(Box::leak(Box::new(Header {
            next: None,
            complete: unreachable,
        })))
    }

    /// Frees a header created by [`detached`](Self::detached).
    ///
    /// # Safety
    ///
    /// `op` must come from `detached` and must not be linked anywhere.
    #[cfg(test)]
    pub(crate) unsafe fn free_detached(op: NonNull<Header>) {
        drop(unsafe { Box::from_raw(op.as_ptr()) });
    }
}

/// A header followed by the handler it dispatches to.
#[repr(C)]
struct Operation<F> {
    header: Header,
    handler: ManuallyDrop<F>,
}

/// Where an operation's storage came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Storage {
    Pooled,
    Boxed,
}

/// Allocates an operation for `handler` on behalf of `shared`.
///
/// When called from inside this engine's loop and the record fits a pool
/// size class, the storage comes from the thread's arena. Otherwise it is
/// boxed.
pub(crate) fn allocate<F>(shared: &Shared, handler: F) -> NonNull<Header>
where
    F: FnOnce(OperationResult) + Send + 'static,
{
    allocate_in(shared, handler).0
}

fn allocate_in<F>(shared: &Shared, handler: F) -> (NonNull<Header>, Storage)
where
    F: FnOnce(OperationResult) + Send + 'static,
{
    let layout = Layout::new::<Operation<F>>();

    if arena::is_poolable(layout) {
        let block = context::with_resource(shared, |resource| resource.allocate(layout.size()));

        if let Some(block) = block {
            let op = block.cast::<Operation<F>>();

            unsafe {
                op.as_ptr().write(Operation {
                    header: Header {
                        next: None,
                        complete: complete_pooled::<F>,
                    },
                    handler: ManuallyDrop::new(handler),
                });
            }

            return (op.cast(), Storage::Pooled);
        }
    }

    let op = Box::new(Operation {
        header: Header {
            next: None,
            complete: complete_boxed::<F>,
        },
        handler: ManuallyDrop::new(handler),
    });

    (NonNull::from(Box::leak(op)).cast(), Storage::Boxed)
}

/// An operation counted as outstanding work whose tag has not been handed
/// to the completion source yet.
///
/// Dropping it frees the record without calling the handler and finishes
/// the unit of work. [`submit`](Self::submit) gives up that ownership once
/// the source holds the tag.
pub(crate) struct Unsubmitted<'a, F> {
    shared: &'a Shared,
    op: NonNull<Header>,
    storage: Storage,
    _handler: PhantomData<F>,
}

impl<'a, F> Unsubmitted<'a, F>
where
    F: FnOnce(OperationResult) + Send + 'static,
{
    /// Starts one unit of work and allocates the record for `handler`.
    pub(crate) fn new(shared: &'a Shared, handler: F) -> Self {
        shared.work_started();

        let (op, storage) = allocate_in(shared, handler);

        Self {
            shared,
            op,
            storage,
            _handler: PhantomData,
        }
    }

    pub(crate) fn tag(&self) -> Tag {
        tag_of(self.op)
    }

    /// The completion source now owns the tag.
    pub(crate) fn submit(self) {
        mem::forget(self);
    }
}

impl<F> Drop for Unsubmitted<'_, F> {
    fn drop(&mut self) {
        let handler = unsafe {
            match self.storage {
                Storage::Boxed => release_boxed::<F>(self.op),
                Storage::Pooled => release_pooled::<F>(self.op, self.shared),
            }
        };
        drop(handler);

        self.shared.work_finished();
    }
}

/// Returns the completion source tag that identifies `op`.
pub(crate) fn tag_of(op: NonNull<Header>) -> Tag {
    Tag::from_raw(op.as_ptr() as usize)
}

/// Recovers the operation behind a tag produced by [`tag_of`].
///
/// # Safety
///
/// `tag` must come from `tag_of` for an operation that has not been
/// dispatched yet.
pub(crate) unsafe fn from_tag(tag: Tag) -> NonNull<Header> {
    debug_assert!(tag != Tag::WAKE, "the wake tag has no operation");
    unsafe { NonNull::new_unchecked(tag.into_raw() as *mut Header) }
}

/// Moves the handler out of a boxed record and frees the box.
unsafe fn release_boxed<F>(op: NonNull<Header>) -> F {
    let op = unsafe { *Box::from_raw(op.cast::<Operation<F>>().as_ptr()) };
    ManuallyDrop::into_inner(op.handler)
}

/// Moves the handler out of a pooled record and returns the block.
unsafe fn release_pooled<F>(op: NonNull<Header>, shared: &Shared) -> F {
    let op = op.cast::<Operation<F>>();
    let handler = unsafe { ManuallyDrop::take(&mut (*op.as_ptr()).handler) };

    // Without a context the block stays in its chunk until the arena is
    // released with the engine.
    context::with_resource(shared, |resource| unsafe {
        resource.deallocate(op.cast(), mem::size_of::<Operation<F>>());
    });

    handler
}

unsafe fn complete_boxed<F>(op: NonNull<Header>, result: OperationResult, _shared: &Shared)
where
    F: FnOnce(OperationResult),
{
    let handler = unsafe { release_boxed::<F>(op) };
    handler(result);
}

unsafe fn complete_pooled<F>(op: NonNull<Header>, result: OperationResult, shared: &Shared)
where
    F: FnOnce(OperationResult),
{
    let handler = unsafe { release_pooled::<F>(op, shared) };
    handler(result);
}
