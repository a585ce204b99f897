pub(crate) mod switch;
pub(crate) use switch::{StackEntry, spindle_switch_stack};

use anyhow::{Context, Result};
use nix::sys::mman::{MapFlags, ProtFlags, mmap_anonymous, mprotect, munmap};
use parking_lot::Mutex;
use std::cell::UnsafeCell;
use std::ffi::c_void;
use std::num::NonZeroUsize;
use std::ptr::NonNull;
use std::sync::OnceLock;

/// How much stack a fiber gets. `Pthread` means no stack of its own: the
/// fiber body runs directly on the worker's OS stack and never suspends
/// mid-run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StackClass {
    Pthread,
    Small,
    #[default]
    Normal,
    Large,
}

impl StackClass {
    fn stack_size(self) -> usize {
        match self {
            StackClass::Pthread => 0,
            StackClass::Small => 32 * 1024,
            StackClass::Normal => 1024 * 1024,
            StackClass::Large => 8 * 1024 * 1024,
        }
    }

    fn pool_index(self) -> Option<usize> {
        match self {
            StackClass::Pthread => None,
            StackClass::Small => Some(0),
            StackClass::Normal => Some(1),
            StackClass::Large => Some(2),
        }
    }
}

/// A switchable execution context: the saved stack pointer plus (for fiber
/// stacks) the mmap'd storage it points into. The per-worker main stack is
/// a `ContextualStack` with no storage of its own; its frames belong to
/// the OS thread.
#[derive(Debug)]
pub(crate) struct ContextualStack {
    /// Stack pointer while the context is suspended; garbage while running.
    sp: UnsafeCell<usize>,
    class: StackClass,
    storage: Option<StackStorage>,

    /// Debug guard: set while some thread executes on this stack. Switching
    /// to a running stack is undefined behavior; this catches it before the
    /// stack is corrupted.
    #[cfg(debug_assertions)]
    running: std::sync::atomic::AtomicBool,
}

// Safety: `sp` is only written by the switch executing on the thread that
// owns the context at that moment; the scheduler hands a context to at most
// one worker at a time.
unsafe impl Send for ContextualStack {}
unsafe impl Sync for ContextualStack {}

impl ContextualStack {
    pub(crate) fn new_main() -> Self {
        Self {
            sp: UnsafeCell::new(0),
            class: StackClass::Pthread,
            storage: None,

            #[cfg(debug_assertions)]
            running: std::sync::atomic::AtomicBool::new(false),
        }
    }

    pub(crate) fn class(&self) -> StackClass {
        self.class
    }

    pub(crate) fn sp_slot(&self) -> *mut usize {
        self.sp.get()
    }

    fn reseed(&self, entry: StackEntry) {
        let storage = self.storage.as_ref().expect("main stack cannot be seeded");
        unsafe { *self.sp.get() = switch::seed_stack(storage.top(), entry) };
    }
}

/// Suspends the calling context into `from` and resumes `to`.
///
/// # Safety
/// `to` must hold a valid suspended context (or a seeded one) and must not
/// be running anywhere; debug builds assert this via the running flag.
/// After this returns the caller may be on a different worker; any cached
/// per-worker state is stale.
pub(crate) unsafe fn jump_stack(from: &ContextualStack, to: &ContextualStack) {
    #[cfg(debug_assertions)]
    {
        use std::sync::atomic::Ordering;
        assert!(
            !to.running.swap(true, Ordering::AcqRel),
            "switch to a stack that is already running"
        );
        from.running.store(false, Ordering::Release);
    }
    unsafe {
        spindle_switch_stack(from.sp.get(), *to.sp.get(), 0);
    }
}

#[derive(Debug)]
struct StackStorage {
    base: NonNull<c_void>,
    len: usize,
    guard_len: usize,
}

// Safety: plain owned mapping.
unsafe impl Send for StackStorage {}
unsafe impl Sync for StackStorage {}

impl StackStorage {
    /// High end of the usable region; the stack grows down from here toward
    /// the guard page at the low end.
    fn top(&self) -> *mut u8 {
        unsafe { (self.base.as_ptr() as *mut u8).add(self.len) }
    }
}

impl Drop for StackStorage {
    fn drop(&mut self) {
        if let Err(e) = unsafe { munmap(self.base, self.len) } {
            tracing::warn!(error = %e, "failed to unmap fiber stack");
        }
    }
}

fn page_size() -> usize {
    static PAGE: OnceLock<usize> = OnceLock::new();
    *PAGE.get_or_init(|| {
        let page = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if page > 0 { page as usize } else { 4096 }
    })
}

fn allocate_storage(class: StackClass) -> Result<StackStorage> {
    let guard_len = page_size();
    let len = class.stack_size() + guard_len;
    let base = unsafe {
        mmap_anonymous(
            None,
            NonZeroUsize::new(len).expect("stack length is never zero"),
            ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
            MapFlags::MAP_PRIVATE | MapFlags::MAP_STACK,
        )
    }
    .context("mmap of fiber stack failed")?;

    // Guard page at the low end, where an overflowing stack lands.
    unsafe { mprotect(base, guard_len, ProtFlags::PROT_NONE) }
        .context("mprotect of stack guard page failed")?;

    Ok(StackStorage { base, len, guard_len })
}

/// Free stacks kept for reuse, per class. A stack that would push a pool
/// past its cap is unmapped instead.
const POOL_CAP: usize = 64;

static STACK_POOLS: [Mutex<Vec<Box<ContextualStack>>>; 3] =
    [Mutex::new(Vec::new()), Mutex::new(Vec::new()), Mutex::new(Vec::new())];

/// Takes a pooled or freshly mapped stack, seeded to run `entry` on first
/// switch. None means the mapping failed; the caller falls back to
/// pthread-mode rather than refusing to run the fiber.
pub(crate) fn get_stack(class: StackClass, entry: StackEntry) -> Option<Box<ContextualStack>> {
    let idx = class.pool_index()?;
    let pooled = STACK_POOLS[idx].lock().pop();
    let stack = match pooled {
        Some(stack) => stack,
        None => match allocate_storage(class) {
            Ok(storage) => Box::new(ContextualStack {
                sp: UnsafeCell::new(0),
                class,
                storage: Some(storage),

                #[cfg(debug_assertions)]
                running: std::sync::atomic::AtomicBool::new(false),
            }),
            Err(e) => {
                tracing::warn!(?class, error = %e, "fiber stack allocation failed");
                return None;
            }
        },
    };
    stack.reseed(entry);
    Some(stack)
}

pub(crate) fn return_stack(stack: Box<ContextualStack>) {
    let Some(idx) = stack.class.pool_index() else {
        return;
    };
    let mut pool = STACK_POOLS[idx].lock();
    if pool.len() < POOL_CAP {
        pool.push(stack);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use static_assertions::assert_impl_all;

    assert_impl_all!(ContextualStack: Send, Sync);

    extern "C" fn never_entry(_arg: usize) -> ! {
        unreachable!()
    }

    #[test]
    fn storage_has_guard_and_alignment() {
        let storage = allocate_storage(StackClass::Small).unwrap();
        assert_eq!(storage.len, StackClass::Small.stack_size() + storage.guard_len);
        assert_eq!(storage.top() as usize % page_size(), 0);
    }

    #[test]
    fn get_and_return_round_trip() {
        let stack = get_stack(StackClass::Small, never_entry).expect("allocation");
        let seeded = unsafe { *stack.sp_slot() };
        assert_ne!(seeded, 0);
        assert_eq!(seeded % 16, 0);
        return_stack(stack);

        // The pooled stack comes back re-seeded.
        let again = get_stack(StackClass::Small, never_entry).expect("pooled");
        assert_ne!(unsafe { *again.sp_slot() }, 0);
        return_stack(again);
    }

    #[test]
    fn pthread_class_has_no_stack() {
        assert!(get_stack(StackClass::Pthread, never_entry).is_none());
        assert_eq!(StackClass::Pthread.stack_size(), 0);
    }
}
