//! The public fiber API.
//!
//! Everything here is a thin errno-style wrapper over the scheduling core:
//! plain ids in, POSIX codes out. The process-wide scheduler starts with
//! default settings on first use; [`crate::Builder::init_global`] configures
//! it explicitly.

use crate::context;
use crate::control;
use crate::group::{ExitSignal, TaskGroup};
use crate::task::{TaskAttr, TaskFn, Tid};
use nix::errno::Errno;
use std::time::Duration;

/// Creates a fiber running `f(arg)` and schedules it near the caller: on
/// the calling worker's own queue, or through a remote inbox when the
/// caller is not a worker.
pub fn spawn(f: TaskFn, arg: usize, attr: TaskAttr) -> Result<Tid, Errno> {
    match context::with_current_group(|g| g.start_background(f, arg, attr)) {
        Some(result) => result,
        None => control::global().start_background_remote(f, arg, attr),
    }
}

/// Like [`spawn`], but a worker caller switches to the new fiber
/// immediately and requeues itself. Off-worker callers fall back to
/// [`spawn_remote`].
pub fn spawn_urgent(f: TaskFn, arg: usize, attr: TaskAttr) -> Result<Tid, Errno> {
    if context::is_worker_thread() {
        let mut g = context::current_group();
        unsafe { TaskGroup::start_foreground(&mut g, f, arg, attr) }
    } else {
        control::global().start_background_remote(f, arg, attr)
    }
}

/// Creates a fiber and hands it to its partition through a remote inbox,
/// regardless of where the caller runs.
pub fn spawn_remote(f: TaskFn, arg: usize, attr: TaskAttr) -> Result<Tid, Errno> {
    control::global().start_background_remote(f, arg, attr)
}

/// Lets another fiber run. A no-op worth of `sched_yield` outside a
/// suspendable fiber.
pub fn yield_now() {
    let suspendable =
        context::with_current_group(|g| !g.is_current_pthread_task()).unwrap_or(false);
    if suspendable {
        let mut g = context::current_group();
        unsafe { TaskGroup::yield_current(&mut g) };
    } else {
        std::thread::yield_now();
    }
}

/// Suspends the caller for at least `timeout_us` microseconds. While a
/// fiber sleeps its worker runs other fibers. `EINTR` when woken by
/// [`interrupt`] or with the fiber's stop flag raised.
pub fn usleep(timeout_us: u64) -> Result<(), Errno> {
    let suspendable =
        context::with_current_group(|g| !g.is_current_pthread_task()).unwrap_or(false);
    if suspendable {
        let mut g = context::current_group();
        unsafe { TaskGroup::usleep(&mut g, timeout_us) }
    } else {
        // Not a suspendable fiber: sleep the OS thread.
        std::thread::sleep(Duration::from_micros(timeout_us));
        Ok(())
    }
}

/// Waits until `tid` terminates and returns its exit value. Joining an
/// already-terminated fiber succeeds immediately. Fiber callers suspend;
/// other threads block. `EINVAL` for self-joins and main fibers.
pub fn join(tid: Tid) -> Result<usize, Errno> {
    TaskGroup::join(tid)
}

/// True if the fiber still exists right now, which may change before the
/// caller can act on it. Prefer [`join`] for synchronization.
pub fn exists(tid: Tid) -> bool {
    TaskGroup::exists(tid)
}

/// The creation attributes of a live fiber; `ESRCH` once it terminated.
pub fn get_attr(tid: Tid) -> Result<TaskAttr, Errno> {
    TaskGroup::get_attr(tid)
}

/// Raises the advisory stop flag. Blocking primitives of that fiber return
/// `EINTR` when they observe it; pair with [`interrupt`] to wake one that
/// is already blocked.
pub fn set_stopped(tid: Tid) {
    TaskGroup::set_stopped(tid);
}

/// Whether the stop flag is up; a terminated fiber reads as stopped.
pub fn is_stopped(tid: Tid) -> bool {
    TaskGroup::is_stopped(tid)
}

/// Wakes whatever blocking primitive `tid` is parked on and leaves a sticky
/// interrupt flag. Succeeds as a no-op when the fiber is not blocked or no
/// longer exists.
pub fn interrupt(tid: Tid) -> Result<(), Errno> {
    let control = context::with_current_group(|g| g.control() as *const _)
        .unwrap_or_else(|| control::global() as *const _);
    // Safety: either our own worker's control or the global one; both
    // outlive this call.
    TaskGroup::interrupt(tid, unsafe { &*control })
}

/// Terminates the calling fiber with `value`, unwinding its frames so scope
/// guards run. Joiners receive `value`.
///
/// # Panics
/// Outside a fiber.
pub fn fiber_exit(value: usize) -> ! {
    let on_fiber = context::with_current_group(|g| !g.is_current_main_task()).unwrap_or(false);
    assert!(on_fiber, "fiber_exit called outside a fiber");
    std::panic::panic_any(ExitSignal(value));
}

/// Delivers the worker wakeups deferred by `AttrFlags::NO_SIGNAL` spawns,
/// coalesced into one signal. Worker callers flush their own group's
/// pending counts; other threads flush through a group of partition 0.
pub fn flush() {
    let flushed = context::with_current_group(|g| g.flush_nosignal_tasks_general()).is_some();
    if !flushed {
        control::global()
            .choose_one_group(0)
            .flush_nosignal_tasks_remote();
    }
}

/// The calling fiber's id; None off the worker pool. The main fiber of a
/// worker reports its own id.
pub fn self_tid() -> Option<Tid> {
    context::with_current_group(|g| g.current_tid())
}

/// Wall-clock nanoseconds since the calling fiber was created; None off the
/// worker pool.
pub fn self_uptime_ns() -> Option<i64> {
    context::with_current_group(|g| g.current_uptime_ns())
}

/// Thread-CPU nanoseconds consumed by the calling fiber, when the scheduler
/// was built with `enable_cpu_clock_stat`; 0 otherwise, None off the worker
/// pool.
pub fn self_cpu_clock_ns() -> Option<i64> {
    context::with_current_group(|g| g.current_task_cpu_clock_ns())
}

/// Number of worker threads in the process-wide scheduler (starting it if
/// needed).
pub fn concurrency() -> usize {
    control::global().concurrency()
}

/// Live fibers in the process-wide scheduler: spawned and not yet
/// terminated.
pub fn fiber_count() -> i64 {
    control::global().nfibers()
}
