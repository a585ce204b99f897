use crossbeam_utils::CachePadded;
use std::cell::UnsafeCell;

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
use parking_lot::Mutex;

/// The two words moved by one 16-byte load or store.
#[repr(C, align(16))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) struct Pair {
    pub(crate) v1: i64,
    pub(crate) v2: i64,
}

/// A 16-byte cell readable and writable as one unit.
///
/// On x86_64 aligned SSE loads/stores are atomic on every microarchitecture
/// we care about (see https://rigtorp.se/isatomic/), and on aarch64 the
/// `ldp`/`stp`-class Neon accesses are architecturally single-copy atomic
/// from Armv8.4-A. Any other target takes a small mutex around the two
/// words. `load_relaxed` skips even that and must only be used by the one
/// thread that also performs the stores.
///
/// The cell is padded to a cache line so readers polling it do not contend
/// with whatever field the owner mutates next to it.
#[derive(Debug, Default)]
pub(crate) struct AtomicComposite128 {
    value: CachePadded<UnsafeCell<Pair>>,

    #[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
    mutex: Mutex<()>,
}

// Safety: concurrent access goes through 16-byte single-copy-atomic
// instructions (or the fallback mutex); `load_relaxed` is restricted to the
// single writer by contract.
unsafe impl Send for AtomicComposite128 {}
unsafe impl Sync for AtomicComposite128 {}

impl AtomicComposite128 {
    pub(crate) fn new(value: Pair) -> Self {
        Self {
            value: CachePadded::new(UnsafeCell::new(value)),

            #[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
            mutex: Mutex::new(()),
        }
    }

    /// Single writer only: the owning worker observing its own last store.
    #[inline]
    pub(crate) fn load_relaxed(&self) -> Pair {
        unsafe { *self.value.get() }
    }

    #[cfg(target_arch = "x86_64")]
    #[inline]
    pub(crate) fn load(&self) -> Pair {
        use std::arch::x86_64::{__m128i, _mm_load_si128};
        unsafe {
            let raw = _mm_load_si128(self.value.get() as *const __m128i);
            std::mem::transmute(raw)
        }
    }

    #[cfg(target_arch = "x86_64")]
    #[inline]
    pub(crate) fn store(&self, value: Pair) {
        use std::arch::x86_64::{__m128i, _mm_store_si128};
        unsafe {
            _mm_store_si128(self.value.get() as *mut __m128i, std::mem::transmute(value));
        }
    }

    #[cfg(target_arch = "aarch64")]
    #[inline]
    pub(crate) fn load(&self) -> Pair {
        use std::arch::aarch64::vld1q_s64;
        unsafe {
            let raw = vld1q_s64(self.value.get() as *const i64);
            std::mem::transmute(raw)
        }
    }

    #[cfg(target_arch = "aarch64")]
    #[inline]
    pub(crate) fn store(&self, value: Pair) {
        use std::arch::aarch64::vst1q_s64;
        unsafe {
            vst1q_s64(self.value.get() as *mut i64, std::mem::transmute(value));
        }
    }

    #[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
    pub(crate) fn load(&self) -> Pair {
        let _guard = self.mutex.lock();
        unsafe { *self.value.get() }
    }

    #[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
    pub(crate) fn store(&self, value: Pair) {
        let _guard = self.mutex.lock();
        unsafe { *self.value.get() = value };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use static_assertions::assert_impl_all;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    assert_impl_all!(AtomicComposite128: Send, Sync);

    #[test]
    fn load_round_trips_store() {
        let cell = AtomicComposite128::new(Pair { v1: 1, v2: 2 });
        assert_eq!(cell.load(), Pair { v1: 1, v2: 2 });

        cell.store(Pair { v1: -7, v2: i64::MAX });
        assert_eq!(cell.load(), Pair { v1: -7, v2: i64::MAX });
        assert_eq!(cell.load_relaxed(), Pair { v1: -7, v2: i64::MAX });
    }

    // One writer stores (k, k); readers must never observe a torn pair.
    #[test]
    fn no_torn_reads() {
        let cell = Arc::new(AtomicComposite128::new(Pair::default()));
        let done = Arc::new(AtomicBool::new(false));

        let readers = (0..3)
            .map(|_| {
                let cell = Arc::clone(&cell);
                let done = Arc::clone(&done);
                std::thread::spawn(move || {
                    while !done.load(Ordering::Relaxed) {
                        let v = cell.load();
                        assert_eq!(v.v1, v.v2, "torn 16-byte read");
                    }
                })
            })
            .collect::<Vec<_>>();

        for k in 1..=200_000i64 {
            cell.store(Pair { v1: k, v2: k });
        }
        done.store(true, Ordering::Relaxed);

        for r in readers {
            r.join().unwrap();
        }
    }
}
