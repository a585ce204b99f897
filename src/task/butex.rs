use crate::task::Tid;
use parking_lot::{Condvar, Mutex};
use smallvec::SmallVec;

/// Waiters woken by one generation advance. One joiner is the overwhelmingly
/// common case.
pub(crate) type Woken = SmallVec<[Tid; 2]>;

pub(crate) fn next_version(v: u32) -> u32 {
    let n = v.wrapping_add(1);
    if n == 0 { 1 } else { n }
}

/// The per-slot generation cell joiners block on.
///
/// The generation starts at 1 when the slot is created and advances once
/// per fiber exit; it never passes through 0. The exiting fiber's return
/// value is stored next to the generation, so a joiner that wakes on the
/// advance can read the value even after the slot itself has been recycled
/// for a new fiber (recycling does not touch this cell).
///
/// Two kinds of waiter: OS threads block on the condvar; fibers register
/// their id and are handed back to the scheduler on wake. Fiber
/// registration happens from a post-switch hook, after the waiting fiber's
/// stack is safely suspended.
#[derive(Debug)]
pub(crate) struct VersionButex {
    inner: Mutex<ButexInner>,
    cond: Condvar,
}

#[derive(Debug)]
struct ButexInner {
    version: u32,
    ret: usize,
    waiters: Woken,
}

impl Default for VersionButex {
    fn default() -> Self {
        Self {
            inner: Mutex::new(ButexInner {
                version: 1,
                ret: 0,
                waiters: SmallVec::new(),
            }),
            cond: Condvar::new(),
        }
    }
}

impl VersionButex {
    pub(crate) fn version(&self) -> u32 {
        self.inner.lock().version
    }

    pub(crate) fn has_advanced(&self, expected: u32) -> bool {
        self.inner.lock().version != expected
    }

    /// Records the return value, advances the generation, wakes thread
    /// waiters, and hands fiber waiters back to the caller for readying.
    pub(crate) fn advance_and_wake(&self, ret: usize) -> Woken {
        let woken = {
            let mut inner = self.inner.lock();
            inner.ret = ret;
            inner.version = next_version(inner.version);
            std::mem::take(&mut inner.waiters)
        };
        self.cond.notify_all();
        woken
    }

    /// Registers a fiber waiter. False means the generation already moved
    /// and the caller must ready the fiber itself instead of parking it.
    pub(crate) fn try_register_waiter(&self, expected: u32, waiter: Tid) -> bool {
        let mut inner = self.inner.lock();
        if inner.version != expected {
            return false;
        }
        inner.waiters.push(waiter);
        true
    }

    /// Used by interrupt delivery: true means the caller now owns waking
    /// the fiber (it was still parked here).
    pub(crate) fn remove_waiter(&self, waiter: Tid) -> bool {
        let mut inner = self.inner.lock();
        match inner.waiters.iter().position(|w| *w == waiter) {
            Some(idx) => {
                inner.waiters.swap_remove(idx);
                true
            }
            None => false,
        }
    }

    /// Blocks the calling OS thread until the generation moves past
    /// `expected`. Must never be called from a fiber.
    pub(crate) fn wait_thread(&self, expected: u32) {
        let mut inner = self.inner.lock();
        while inner.version == expected {
            self.cond.wait(&mut inner);
        }
    }

    /// The exit value of generation `expected`, if it is still the latest
    /// terminated one. None means the slot has since gone through another
    /// full lifetime and the value is gone.
    pub(crate) fn ret_for(&self, expected: u32) -> Option<usize> {
        let inner = self.inner.lock();
        (inner.version == next_version(expected)).then_some(inner.ret)
    }
}
