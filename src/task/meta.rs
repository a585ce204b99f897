use crate::stack::{ContextualStack, StackClass};
use crate::task::Tid;
use crate::task::butex::VersionButex;
use crate::timer::TimerHandle;
use bitflags::bitflags;
use parking_lot::Mutex;
use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicPtr, AtomicU64, Ordering};

/// Entry function of a fiber. The argument and return value are plain
/// machine words; anything richer is the caller's encoding to choose.
pub type TaskFn = fn(usize) -> usize;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct AttrFlags: u32 {
        /// Trace-log the fiber's start and finish.
        const LOG_START_AND_FINISH = 1;
        /// Set on the synthesized per-worker main fiber; never user-visible.
        const MAIN_FIBER = 1 << 1;
        /// Defer the worker wakeup for this spawn until a flush; batching
        /// producers turn N wakeups into one.
        const NO_SIGNAL = 1 << 2;
    }
}

/// Creation attributes of a fiber.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TaskAttr {
    pub stack_class: StackClass,
    pub flags: AttrFlags,
    /// Affinity partition to run in; None inherits the spawner's.
    pub tag: Option<usize>,
}

#[derive(Debug, Default)]
pub(crate) struct TaskStatistics {
    /// Thread-CPU nanoseconds consumed by this fiber, when clock accounting
    /// is enabled.
    pub(crate) cpu_usage_ns: AtomicI64,
    /// Times this fiber was switched in.
    pub(crate) nswitch: AtomicU64,
}

/// Where a fiber's frames live.
#[derive(Debug, Default)]
pub(crate) enum FiberStack {
    /// Not allocated yet; assigned lazily on first schedule.
    #[default]
    Unallocated,
    /// A stack of its own.
    Owned(Box<ContextualStack>),
    /// Runs on the worker's main stack and never suspends mid-run.
    Main,
}

/// Everything the scheduler knows about one fiber slot.
///
/// Slots live forever in the meta pool and are recycled by generation. The
/// single-owner fields (`entry`, `stack`, `attr`) are only touched by the
/// thread currently responsible for the fiber: its creator before the first
/// enqueue, then whichever worker has it as `cur_meta`. Cross-thread state
/// is atomic or locked.
#[derive(Debug, Default)]
pub(crate) struct TaskMeta {
    tid: AtomicU64,
    entry: UnsafeCell<Option<(TaskFn, usize)>>,
    stack: UnsafeCell<FiberStack>,
    attr: UnsafeCell<TaskAttr>,

    /// Advisory cancellation, sticky for this generation.
    stop: AtomicBool,
    /// Sticky until a blocking primitive consumes it.
    interrupted: AtomicBool,

    cpuwide_start_ns: AtomicI64,
    pub(crate) stat: TaskStatistics,

    /// Pending sleep registration, so interrupt/stop can cancel it.
    pub(crate) sleep_handle: Mutex<Option<TimerHandle>>,
    /// Which butex this fiber is parked on, if any; interrupt chases it.
    wait_butex: AtomicPtr<VersionButex>,

    pub(crate) version_butex: VersionButex,
}

// Safety: single-owner fields follow the ownership hand-off described
// above; the enqueue that publishes a fiber is the synchronization point,
// and everything else is atomic or behind a lock.
unsafe impl Send for TaskMeta {}
unsafe impl Sync for TaskMeta {}

impl TaskMeta {
    pub(crate) fn tid(&self) -> Tid {
        Tid::from_u64(self.tid.load(Ordering::Relaxed))
    }

    /// Called by the pool, under its allocation lock, before the slot is
    /// visible to anyone else.
    pub(crate) fn reset_for_spawn(&self, tid: Tid, f: TaskFn, arg: usize, attr: TaskAttr) {
        self.tid.store(tid.as_u64(), Ordering::Relaxed);
        self.stop.store(false, Ordering::Relaxed);
        self.interrupted.store(false, Ordering::Relaxed);
        self.wait_butex.store(std::ptr::null_mut(), Ordering::Relaxed);
        self.stat.cpu_usage_ns.store(0, Ordering::Relaxed);
        self.stat.nswitch.store(0, Ordering::Relaxed);
        // Safety: exclusive by the pool-lock contract above.
        unsafe {
            *self.entry.get() = Some((f, arg));
            *self.attr.get() = attr;
            debug_assert!(matches!(*self.stack.get(), FiberStack::Unallocated));
        }
    }

    /// Owner worker only.
    pub(crate) unsafe fn take_entry(&self) -> Option<(TaskFn, usize)> {
        unsafe { (*self.entry.get()).take() }
    }

    pub(crate) fn attr(&self) -> TaskAttr {
        // Safety: written once before publication, read-only afterwards.
        unsafe { *self.attr.get() }
    }

    pub(crate) fn is_main_fiber(&self) -> bool {
        self.attr().flags.contains(AttrFlags::MAIN_FIBER)
    }

    /// Owner worker only.
    pub(crate) unsafe fn stack(&self) -> &FiberStack {
        unsafe { &*self.stack.get() }
    }

    /// Owner worker only.
    pub(crate) unsafe fn set_stack(&self, stack: FiberStack) {
        unsafe { *self.stack.get() = stack };
    }

    /// Owner worker only.
    pub(crate) unsafe fn release_stack(&self) -> FiberStack {
        unsafe { std::mem::take(&mut *self.stack.get()) }
    }

    pub(crate) fn set_stopped(&self) {
        self.stop.store(true, Ordering::Release);
    }

    pub(crate) fn is_stopped(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    pub(crate) fn set_interrupted(&self) {
        self.interrupted.store(true, Ordering::Release);
    }

    /// Reads and clears the sticky interrupt flag.
    pub(crate) fn consume_interrupt(&self) -> bool {
        self.interrupted.swap(false, Ordering::AcqRel)
    }

    /// Peeks without consuming; blocking primitives use this before going
    /// to sleep, leaving the flag for their wakeup path.
    pub(crate) fn is_interrupted(&self) -> bool {
        self.interrupted.load(Ordering::Acquire)
    }

    pub(crate) fn set_cpuwide_start_ns(&self, ns: i64) {
        self.cpuwide_start_ns.store(ns, Ordering::Relaxed);
    }

    pub(crate) fn cpuwide_start_ns(&self) -> i64 {
        self.cpuwide_start_ns.load(Ordering::Relaxed)
    }

    pub(crate) fn set_wait_butex(&self, butex: Option<&VersionButex>) {
        let ptr = butex.map_or(std::ptr::null_mut(), |b| {
            b as *const VersionButex as *mut VersionButex
        });
        self.wait_butex.store(ptr, Ordering::Release);
    }

    /// The butex this fiber may be parked on. The pointer targets pool
    /// storage, which is never deallocated, so it is safe to chase even
    /// when it is stale.
    pub(crate) fn wait_butex(&self) -> Option<&'static VersionButex> {
        let ptr = self.wait_butex.load(Ordering::Acquire);
        // Safety: pool slots are never freed; see above.
        unsafe { ptr.cast_const().as_ref() }
    }
}
