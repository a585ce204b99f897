use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicI32, Ordering};

/// Epoch a worker captured before deciding to sleep. The low bit is the
/// stop flag; signals bump the value by two so the epoch and the flag never
/// collide.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) struct ParkState(i32);

impl ParkState {
    pub(crate) fn stopped(self) -> bool {
        self.0 & 1 != 0
    }
}

/// Futex-style sleeping place shared by the workers of one tag.
///
/// The protocol closes the classic lost-wakeup window: a worker captures
/// `state()`, re-checks its queues, then calls `wait(captured)`. A producer
/// that signalled in between advanced the epoch, so the wait returns
/// immediately instead of parking past the wakeup.
#[derive(Debug, Default)]
pub(crate) struct ParkingLot {
    pending_signal: AtomicI32,
    mutex: Mutex<()>,
    cond: Condvar,
}

impl ParkingLot {
    /// Wakes up to `num` waiters and returns how many were actually woken.
    pub(crate) fn signal(&self, num: usize) -> usize {
        if num == 0 {
            return 0;
        }
        self.pending_signal.fetch_add(2 * num as i32, Ordering::Release);
        // The empty critical section orders the epoch bump against any
        // waiter between its re-check and its sleep.
        drop(self.mutex.lock());
        if num == 1 {
            self.cond.notify_one() as usize
        } else {
            self.cond.notify_all().min(num)
        }
    }

    pub(crate) fn state(&self) -> ParkState {
        ParkState(self.pending_signal.load(Ordering::Acquire))
    }

    /// Sleeps until the epoch moves past `expected`. Returns immediately if
    /// it already has.
    pub(crate) fn wait(&self, expected: ParkState) {
        let mut guard = self.mutex.lock();
        if self.pending_signal.load(Ordering::Acquire) != expected.0 {
            return;
        }
        self.cond.wait(&mut guard);
    }

    /// Marks the lot stopped and wakes everyone; `state()` reports stopped
    /// from now on.
    pub(crate) fn stop(&self) {
        self.pending_signal.fetch_or(1, Ordering::Release);
        drop(self.mutex.lock());
        self.cond.notify_all();
    }
}
