//! The thread-local "current TaskGroup" pointer.
//!
//! Set when a worker thread enters its dispatch loop, cleared when it
//! leaves, never written from anywhere else. Everything that can suspend a
//! fiber re-reads this pointer after resuming: stealing may have moved the
//! fiber to another worker, so any group pointer cached across a switch is
//! stale.

use crate::group::TaskGroup;
use std::cell::Cell;
use std::ptr;

thread_local! {
    static CURRENT_GROUP: Cell<*const TaskGroup> = const { Cell::new(ptr::null()) };
}

pub(crate) fn set_current_group(group: *const TaskGroup) {
    CURRENT_GROUP.set(group);
}

pub(crate) fn clear_current_group() {
    CURRENT_GROUP.set(ptr::null());
}

/// Null when the calling thread is not a worker.
pub(crate) fn current_group() -> *const TaskGroup {
    CURRENT_GROUP.get()
}

/// The calling thread's group, when it is a worker.
pub(crate) fn with_current_group<F, R>(f: F) -> Option<R>
where
    F: FnOnce(&TaskGroup) -> R,
{
    let ptr = CURRENT_GROUP.get();
    // Safety: the pointer is installed by the worker that owns the group
    // and stays valid for the worker's lifetime.
    unsafe { ptr.as_ref() }.map(f)
}

pub(crate) fn is_worker_thread() -> bool {
    !CURRENT_GROUP.get().is_null()
}
