use crate::task::Tid;
use crossbeam_utils::CachePadded;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering, fence};

/// Bounded work-stealing deque of fiber ids.
///
/// One owner pushes and pops at the bottom; any number of peers steal from
/// the top. The buffer is a fixed power-of-two ring: `push_bottom` reports
/// full instead of growing, and the caller decides how to wait (a fiber id
/// must never be dropped: its stack and joiners would leak with it).
///
/// Ordering protocol: the owner publishes entries with a release store of
/// `bottom`; stealers claim entries by CASing `top` with seq_cst ordering,
/// and both sides separate their index read from the claim with a seq_cst
/// fence so an owner `pop_bottom` and a concurrent `steal_top` can never
/// both win the same entry.
///
/// `bottom` and `top` live on separate cache lines: stealers hammer `top`
/// and must not invalidate the owner's line.
#[derive(Debug)]
pub(crate) struct LocalRunQueue {
    bottom: CachePadded<AtomicUsize>,
    top: CachePadded<AtomicUsize>,
    buffer: Box<[AtomicU64]>,
}

impl LocalRunQueue {
    /// `capacity` must be a power of two.
    pub(crate) fn new(capacity: usize) -> Self {
        assert!(capacity.is_power_of_two(), "run queue capacity must be a power of two");
        let buffer = (0..capacity).map(|_| AtomicU64::new(0)).collect();
        Self {
            bottom: CachePadded::new(AtomicUsize::new(0)),
            top: CachePadded::new(AtomicUsize::new(0)),
            buffer,
        }
    }

    #[inline]
    fn mask(&self) -> usize {
        self.buffer.len() - 1
    }

    pub(crate) fn capacity(&self) -> usize {
        self.buffer.len()
    }

    /// Owner only. False means full; no entry is ever discarded.
    pub(crate) fn push_bottom(&self, tid: Tid) -> bool {
        let b = self.bottom.load(Ordering::Relaxed);
        let t = self.top.load(Ordering::Acquire);
        if b >= t + self.buffer.len() {
            return false;
        }
        self.buffer[b & self.mask()].store(tid.as_u64(), Ordering::Relaxed);
        self.bottom.store(b + 1, Ordering::Release);
        true
    }

    /// Owner only.
    pub(crate) fn pop_bottom(&self) -> Option<Tid> {
        let b = self.bottom.load(Ordering::Relaxed);
        let mut t = self.top.load(Ordering::Relaxed);
        if t >= b {
            // Empty. Not strictly accurate under concurrent steals, but the
            // owner is the only pusher so a non-empty queue is never missed.
            return None;
        }
        let new_b = b - 1;
        self.bottom.store(new_b, Ordering::Relaxed);
        fence(Ordering::SeqCst);
        t = self.top.load(Ordering::Relaxed);
        if t > new_b {
            // A stealer already took the last entry.
            self.bottom.store(b, Ordering::Relaxed);
            return None;
        }
        let value = self.buffer[new_b & self.mask()].load(Ordering::Relaxed);
        if t != new_b {
            // More than one entry left; the bottom one is ours alone.
            return Some(Tid::from_u64(value));
        }
        // Single entry left: race the stealers for it.
        let popped = self
            .top
            .compare_exchange(t, t + 1, Ordering::SeqCst, Ordering::Relaxed)
            .is_ok();
        self.bottom.store(b, Ordering::Relaxed);
        popped.then(|| Tid::from_u64(value))
    }

    /// Any thread. Returns the oldest entry, or None when the queue is (or
    /// transiently appears) empty.
    pub(crate) fn steal_top(&self) -> Option<Tid> {
        let mut t = self.top.load(Ordering::Acquire);
        let b = self.bottom.load(Ordering::Acquire);
        if t >= b {
            return None;
        }
        loop {
            fence(Ordering::SeqCst);
            let b = self.bottom.load(Ordering::Acquire);
            if t >= b {
                return None;
            }
            let value = self.buffer[t & self.mask()].load(Ordering::Relaxed);
            match self
                .top
                .compare_exchange(t, t + 1, Ordering::SeqCst, Ordering::Relaxed)
            {
                Ok(_) => return Some(Tid::from_u64(value)),
                Err(cur) => t = cur,
            }
        }
    }

    /// Racy by nature; only good for monitoring and heuristics.
    pub(crate) fn volatile_size(&self) -> usize {
        let b = self.bottom.load(Ordering::Relaxed);
        let t = self.top.load(Ordering::Relaxed);
        b.saturating_sub(t)
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.volatile_size() == 0
    }
}

// Safety: the index protocol above makes concurrent owner/stealer access
// sound; entries themselves are plain u64s behind atomics.
unsafe impl Send for LocalRunQueue {}
unsafe impl Sync for LocalRunQueue {}
