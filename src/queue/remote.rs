use crate::task::Tid;
use parking_lot::{Mutex, MutexGuard};
use std::collections::VecDeque;

/// Inbox for fibers made runnable from outside the owning worker: other
/// workers, the timer thread, plain user threads.
///
/// A locked bounded FIFO. Producers that find it full flush their pending
/// wakeups and retry; entries are never dropped. The deferred-signal
/// counters live inside the lock so a producer can batch wakeups and a
/// later producer (or the owner) can flush them in one coalesced signal.
#[derive(Debug)]
pub(crate) struct RemoteRunQueue {
    inner: Mutex<RemoteInner>,
}

#[derive(Debug)]
pub(crate) struct RemoteInner {
    queue: VecDeque<Tid>,
    capacity: usize,

    /// Entries pushed with `nosignal` whose wakeups are still owed.
    pub(crate) num_nosignal: i64,
    /// Wakeups issued so far, for monitoring.
    pub(crate) nsignaled: i64,
}

impl RemoteInner {
    pub(crate) fn push(&mut self, tid: Tid) -> bool {
        if self.queue.len() >= self.capacity {
            return false;
        }
        self.queue.push_back(tid);
        true
    }

    pub(crate) fn pop(&mut self) -> Option<Tid> {
        self.queue.pop_front()
    }

    /// Moves the owed-wakeup count into the issued count and returns how
    /// many signals the caller must now deliver.
    pub(crate) fn take_nosignal(&mut self) -> i64 {
        let n = self.num_nosignal;
        self.num_nosignal = 0;
        self.nsignaled += n;
        n
    }
}

impl RemoteRunQueue {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(RemoteInner {
                queue: VecDeque::with_capacity(capacity),
                capacity,
                num_nosignal: 0,
                nsignaled: 0,
            }),
        }
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, RemoteInner> {
        self.inner.lock()
    }

    /// Owner only.
    pub(crate) fn pop(&self) -> Option<Tid> {
        self.inner.lock().pop()
    }

    /// Used by stealers; backs off instead of contending with the owner.
    pub(crate) fn try_pop(&self) -> Option<Tid> {
        self.inner.try_lock()?.pop()
    }
}
