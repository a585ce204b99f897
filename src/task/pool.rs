use crate::task::Tid;
use crate::task::meta::{TaskAttr, TaskFn, TaskMeta};
use nix::errno::Errno;
use parking_lot::{Mutex, RwLock};
use std::sync::OnceLock;

const SEGMENT_SIZE: usize = 256;

/// Hard ceiling on live fiber slots; allocation past it reports ENOMEM.
const MAX_SLOTS: usize = 1 << 22;

/// Process-wide storage for fiber descriptors.
///
/// Slots are allocated in fixed segments that are never freed or moved, so
/// a `&TaskMeta` is valid for the life of the process and lock-free readers
/// (`address`) only need the generation check. Freed slots go back on a
/// free list and keep their generation; only fiber exit advances it.
#[derive(Debug, Default)]
pub(crate) struct MetaPool {
    free: Mutex<Vec<u32>>,
    segments: RwLock<Vec<Box<[TaskMeta]>>>,
}

pub(crate) fn pool() -> &'static MetaPool {
    static POOL: OnceLock<MetaPool> = OnceLock::new();
    POOL.get_or_init(MetaPool::default)
}

impl MetaPool {
    /// Reserves a slot and initializes it for a new fiber. The returned
    /// meta is not yet runnable; the caller enqueues it.
    pub(crate) fn alloc(
        &self,
        f: TaskFn,
        arg: usize,
        attr: TaskAttr,
    ) -> Result<(Tid, &'static TaskMeta), Errno> {
        let slot = {
            let mut free = self.free.lock();
            match free.pop() {
                Some(slot) => slot,
                None => {
                    let base = self.grow()?;
                    // Keep slot `base` for ourselves, pool the rest.
                    free.extend((base + 1)..(base + SEGMENT_SIZE as u32));
                    base
                }
            }
        };

        let meta = self.meta_at(slot).expect("allocated slot exists");
        let version = meta.version_butex.version();
        let tid = Tid::new(version, slot);
        meta.reset_for_spawn(tid, f, arg, attr);
        Ok((tid, meta))
    }

    /// Returns a slot whose fiber has terminated (generation already
    /// advanced) to the free list.
    pub(crate) fn free(&self, tid: Tid) {
        debug_assert!(self.address(tid).is_none(), "freeing a live fiber slot");
        self.free.lock().push(tid.slot());
    }

    /// Generation-checked lookup: None for terminated or never-issued ids.
    pub(crate) fn address(&self, tid: Tid) -> Option<&'static TaskMeta> {
        let meta = self.meta_at(tid.slot())?;
        (meta.version_butex.version() == tid.version()).then_some(meta)
    }

    /// The exit value recorded for `tid`, when the slot has terminated that
    /// exact generation and not yet completed another one.
    pub(crate) fn recorded_ret(&self, tid: Tid) -> Option<usize> {
        self.meta_at(tid.slot())?.version_butex.ret_for(tid.version())
    }

    fn meta_at(&self, slot: u32) -> Option<&'static TaskMeta> {
        let segments = self.segments.read();
        let segment = segments.get(slot as usize / SEGMENT_SIZE)?;
        let meta = &segment[slot as usize % SEGMENT_SIZE];
        // Safety: segments are append-only and their boxed storage is never
        // dropped or reallocated while the process lives.
        Some(unsafe { &*(meta as *const TaskMeta) })
    }

    /// Appends one segment and returns its first slot index. Caller holds
    /// the free-list lock, so growth is serialized.
    fn grow(&self) -> Result<u32, Errno> {
        let mut segments = self.segments.write();
        let base = segments.len() * SEGMENT_SIZE;
        if base + SEGMENT_SIZE > MAX_SLOTS {
            return Err(Errno::ENOMEM);
        }
        let segment = (0..SEGMENT_SIZE)
            .map(|_| TaskMeta::default())
            .collect::<Vec<_>>()
            .into_boxed_slice();
        segments.push(segment);
        Ok(base as u32)
    }

    #[cfg(test)]
    pub(crate) fn capacity(&self) -> usize {
        self.segments.read().len() * SEGMENT_SIZE
    }
}
