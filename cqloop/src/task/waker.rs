use super::core::Task;

use std::mem::ManuallyDrop;
use std::sync::Arc;
use std::task::{RawWaker, RawWakerVTable, Waker};

/// Returns the vtable for wakers of a `Task<T>`.
///
/// The data pointer of every such waker comes from `Arc::into_raw` and
/// owns one strong reference.
fn vtable<T: Send + 'static>() -> &'static RawWakerVTable {
    &RawWakerVTable::new(
        clone_raw::<T>,
        wake_raw::<T>,
        wake_by_ref_raw::<T>,
        drop_raw::<T>,
    )
}

/// Creates a waker that re-queues `task` on its engine.
pub(crate) fn make_waker<T: Send + 'static>(task: Arc<Task<T>>) -> Waker {
    unsafe {
        Waker::from_raw(RawWaker::new(
            Arc::into_raw(task) as *const (),
            vtable::<T>(),
        ))
    }
}

/// Borrows the task behind `ptr` without touching its reference count.
unsafe fn borrow<T>(ptr: *const ()) -> ManuallyDrop<Arc<Task<T>>> {
    ManuallyDrop::new(unsafe { Arc::from_raw(ptr as *const Task<T>) })
}

unsafe fn clone_raw<T: Send + 'static>(ptr: *const ()) -> RawWaker {
    let task = unsafe { borrow::<T>(ptr) };
    let cloned = Arc::clone(&task);

    RawWaker::new(Arc::into_raw(cloned) as *const (), vtable::<T>())
}

unsafe fn wake_raw<T: Send + 'static>(ptr: *const ()) {
    let task = unsafe { Arc::<Task<T>>::from_raw(ptr as *const Task<T>) };
    task.wake();
}

unsafe fn wake_by_ref_raw<T: Send + 'static>(ptr: *const ()) {
    let task = unsafe { borrow::<T>(ptr) };
    Arc::clone(&task).wake();
}

unsafe fn drop_raw<T: Send + 'static>(ptr: *const ()) {
    drop(unsafe { Arc::<Task<T>>::from_raw(ptr as *const Task<T>) });
}
