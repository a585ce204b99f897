use crate::config::{Builder, SchedConfig};
use crate::context;
use crate::group::TaskGroup;
use crate::parking::ParkingLot;
use crate::task::{TaskMeta, Tid};
use crate::timer::TimerThread;
use anyhow::{Context, Result, anyhow};
use parking_lot::Mutex;
use std::cell::Cell;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicPtr, AtomicUsize, Ordering};
use std::sync::{Arc, Barrier, OnceLock};
use std::thread;

pub(crate) const PARKING_LOT_COUNT: usize = 4;

/// Steal-walk strides. All larger than any plausible worker count, so every
/// stride is co-prime with the group count and one walk visits every peer
/// exactly once.
const STEAL_OFFSETS: [u64; 10] = [
    10007, 10009, 10037, 10039, 10061, 10067, 10069, 10079, 10091, 10093,
];

pub(crate) fn prime_offset(seed: u64) -> u64 {
    STEAL_OFFSETS[(seed % STEAL_OFFSETS.len() as u64) as usize]
}

/// Per-tag slice of the scheduler: the groups of that partition and the
/// parking lots their workers sleep on. Groups of one tag only signal and
/// (by default) steal within their own `TagRuntime`.
#[derive(Debug)]
struct TagRuntime {
    groups: Box<[AtomicPtr<TaskGroup>]>,
    ngroup: AtomicUsize,
    parking: [ParkingLot; PARKING_LOT_COUNT],
    next_pl: AtomicUsize,
}

impl TagRuntime {
    fn new(max_groups: usize) -> Self {
        Self {
            groups: (0..max_groups)
                .map(|_| AtomicPtr::new(std::ptr::null_mut()))
                .collect(),
            ngroup: AtomicUsize::new(0),
            parking: Default::default(),
            next_pl: AtomicUsize::new(0),
        }
    }
}

/// Owns the worker threads and every TaskGroup.
///
/// Groups are reachable from peers (for stealing) through raw pointers in
/// the per-tag index, so a removed group is never deleted in place: it goes
/// to the graveyard and is freed only when the control itself shuts down,
/// after every thread that could still hold a pointer has been joined.
pub(crate) struct TaskControl {
    cfg: SchedConfig,
    tagged: Box<[TagRuntime]>,
    timer: TimerThread,
    stopped: AtomicBool,
    workers: Mutex<Vec<thread::JoinHandle<()>>>,
    modify_group_lock: Mutex<()>,
    graveyard: Mutex<Vec<*mut TaskGroup>>,
    nfibers: AtomicI64,
}

// Safety: the raw group pointers are only dereferenced while the control is
// alive, and the graveyard is drained after all workers are joined.
unsafe impl Send for TaskControl {}
unsafe impl Sync for TaskControl {}

struct ControlPtr(*const TaskControl);
// Safety: the control outlives its worker threads (stop_and_join runs
// before the box is dropped).
unsafe impl Send for ControlPtr {}

impl TaskControl {
    pub(crate) fn new(cfg: SchedConfig) -> Result<Box<Self>> {
        crate::group::install_exit_panic_hook();

        let tagged = (0..cfg.tags)
            .map(|_| TagRuntime::new(cfg.worker_threads))
            .collect();

        let control = Box::new(Self {
            cfg,
            tagged,
            timer: TimerThread::start(),
            stopped: AtomicBool::new(false),
            workers: Mutex::new(Vec::new()),
            modify_group_lock: Mutex::new(()),
            graveyard: Mutex::new(Vec::new()),
            nfibers: AtomicI64::new(0),
        });
        control.start_workers()?;
        Ok(control)
    }

    pub(crate) fn config(&self) -> &SchedConfig {
        &self.cfg
    }

    pub(crate) fn timer(&self) -> &TimerThread {
        &self.timer
    }

    pub(crate) fn concurrency(&self) -> usize {
        self.cfg.worker_threads
    }

    pub(crate) fn nfibers(&self) -> i64 {
        self.nfibers.load(Ordering::Relaxed)
    }

    pub(crate) fn on_fiber_spawn(&self) {
        self.nfibers.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn on_fiber_exit(&self) {
        self.nfibers.fetch_sub(1, Ordering::Relaxed);
    }

    fn start_workers(&self) -> Result<()> {
        // Workers register their groups before anyone can spawn, so
        // choose_one_group never sees an empty tag.
        let barrier = Arc::new(Barrier::new(self.cfg.worker_threads + 1));
        let mut handles = self.workers.lock();

        for i in 0..self.cfg.worker_threads {
            let tag = i % self.cfg.tags;
            let ctl = ControlPtr(self);
            let barrier = Arc::clone(&barrier);
            let handle = thread::Builder::new()
                .name(format!("{}-{}", self.cfg.thread_name_prefix, i))
                .spawn(move || {
                    let ctl = ctl;
                    let control = unsafe { &*ctl.0 };
                    worker_main(control, tag, &barrier);
                })
                .context("failed to spawn worker thread")?;
            handles.push(handle);
        }
        drop(handles);

        barrier.wait();
        Ok(())
    }

    fn create_group(&self, tag: usize) -> Result<*mut TaskGroup> {
        let tr = &self.tagged[tag];
        let pl_idx = tr.next_pl.fetch_add(1, Ordering::Relaxed) % PARKING_LOT_COUNT;
        let pl = &tr.parking[pl_idx] as *const ParkingLot;

        let group = Box::new(TaskGroup::new(self, tag, pl, &self.cfg));
        group
            .init_main_fiber()
            .map_err(|e| anyhow!("failed to set up main fiber: {}", e))?;
        let ptr = Box::into_raw(group);

        let _guard = self.modify_group_lock.lock();
        let n = tr.ngroup.load(Ordering::Relaxed);
        tr.groups[n].store(ptr, Ordering::Relaxed);
        // Paired with the acquire in steal_task: a visible count means
        // visible slots.
        tr.ngroup.store(n + 1, Ordering::Release);
        Ok(ptr)
    }

    pub(crate) fn retire_group(&self, group: *mut TaskGroup) {
        let tag = unsafe { (*group).tag() };
        let tr = &self.tagged[tag];

        let _guard = self.modify_group_lock.lock();
        let n = tr.ngroup.load(Ordering::Relaxed);
        for i in 0..n {
            if tr.groups[i].load(Ordering::Relaxed) == group {
                let last = tr.groups[n - 1].load(Ordering::Relaxed);
                tr.groups[i].store(last, Ordering::Relaxed);
                tr.groups[n - 1].store(std::ptr::null_mut(), Ordering::Relaxed);
                tr.ngroup.store(n - 1, Ordering::Release);
                break;
            }
        }
        // Peers may still be dereferencing it for one more steal attempt;
        // deletion waits for shutdown.
        self.graveyard.lock().push(group);
    }

    /// Picks peers by walking `(seed + k * offset) mod ngroup`, a full cycle
    /// thanks to the co-prime stride. Same-tag peers first; other tags only
    /// when the config allows.
    pub(crate) fn steal_task(&self, seed: &mut u64, offset: u64, thief_tag: usize) -> Option<Tid> {
        if let Some(tid) = self.steal_from_tag(thief_tag, seed, offset) {
            return Some(tid);
        }
        if self.cfg.cross_tag_steal {
            for tag in 0..self.cfg.tags {
                if tag == thief_tag {
                    continue;
                }
                if let Some(tid) = self.steal_from_tag(tag, seed, offset) {
                    return Some(tid);
                }
            }
        }
        None
    }

    fn steal_from_tag(&self, tag: usize, seed: &mut u64, offset: u64) -> Option<Tid> {
        let tr = &self.tagged[tag];
        let ngroup = tr.ngroup.load(Ordering::Acquire);
        if ngroup == 0 {
            return None;
        }

        let mut s = *seed;
        let mut stolen = None;
        for _ in 0..ngroup {
            let ptr = tr.groups[(s % ngroup as u64) as usize].load(Ordering::Acquire);
            s = s.wrapping_add(offset);
            // Null when a concurrent destroy_group raced the walk.
            if let Some(g) = unsafe { ptr.as_ref() } {
                if let Some(tid) = g.steal_from() {
                    stolen = Some(tid);
                    break;
                }
            }
        }
        *seed = s;
        stolen
    }

    /// Some group of the tag, for remote pushes from off-worker threads.
    pub(crate) fn choose_one_group(&self, tag: usize) -> &TaskGroup {
        let tr = &self.tagged[tag];
        loop {
            let n = tr.ngroup.load(Ordering::Acquire);
            assert!(n > 0, "no workers registered for tag {}", tag);
            let ptr = tr.groups[fastrand::usize(..n)].load(Ordering::Acquire);
            if let Some(g) = unsafe { ptr.as_ref() } {
                return g;
            }
        }
    }

    /// Spawn path for callers that are not workers (or target another
    /// partition): allocates the fiber and pushes it through some group's
    /// remote inbox.
    pub(crate) fn start_background_remote(
        &self,
        f: crate::task::TaskFn,
        arg: usize,
        mut attr: crate::task::TaskAttr,
    ) -> std::result::Result<Tid, nix::errno::Errno> {
        let tag = attr.tag.unwrap_or(0);
        if tag >= self.cfg.tags {
            return Err(nix::errno::Errno::EINVAL);
        }
        attr.tag = Some(tag);

        let (tid, meta) = crate::task::pool().alloc(f, arg, attr)?;
        meta.set_cpuwide_start_ns(crate::time::cpuwide_time_ns());
        self.on_fiber_spawn();
        let nosignal = attr.flags.contains(crate::task::AttrFlags::NO_SIGNAL);
        self.choose_one_group(tag).ready_to_run_remote(meta, nosignal);
        Ok(tid)
    }

    /// Routes a runnable fiber: locally when the caller is a worker of the
    /// fiber's tag, remotely otherwise.
    pub(crate) fn ready_to_run_general(&self, meta: &TaskMeta, nosignal: bool) {
        let tag = meta.attr().tag.unwrap_or(0);
        let handled = context::with_current_group(|g| {
            if g.tag() == tag {
                g.ready_to_run(meta, nosignal);
                true
            } else {
                false
            }
        })
        .unwrap_or(false);

        if !handled {
            self.choose_one_group(tag).ready_to_run_remote(meta, nosignal);
        }
    }

    /// Wakes up to `num` sleeping workers of the tag. Waking more than two
    /// per call buys nothing: woken workers steal the rest of the batch
    /// faster than we can signal.
    pub(crate) fn signal_workers(&self, num: usize, tag: usize) {
        if num == 0 {
            return;
        }
        let mut num = num.min(2);
        let lots = &self.tagged[tag].parking;
        let start = parking_lot_start_index();
        for i in 0..PARKING_LOT_COUNT {
            num = num.saturating_sub(lots[(start + i) % PARKING_LOT_COUNT].signal(num));
            if num == 0 {
                break;
            }
        }
    }

    pub(crate) fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Stops every worker and waits for them. Fibers still queued when the
    /// workers notice the stop never run.
    pub(crate) fn stop_and_join(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::debug!("stopping scheduler");
        for tr in self.tagged.iter() {
            for pl in &tr.parking {
                pl.stop();
            }
        }
        let handles = std::mem::take(&mut *self.workers.lock());
        for handle in handles {
            let _ = handle.join();
        }
        self.timer.stop_and_join();
    }

    #[cfg(test)]
    pub(crate) fn group_at(&self, tag: usize, idx: usize) -> Option<&TaskGroup> {
        let tr = &self.tagged[tag];
        if idx >= tr.ngroup.load(Ordering::Acquire) {
            return None;
        }
        unsafe { tr.groups[idx].load(Ordering::Acquire).as_ref() }
    }
}

impl Drop for TaskControl {
    fn drop(&mut self) {
        self.stop_and_join();
        for ptr in self.graveyard.lock().drain(..) {
            drop(unsafe { Box::from_raw(ptr) });
        }
    }
}

fn worker_main(control: &TaskControl, tag: usize, barrier: &Barrier) {
    let group = match control.create_group(tag) {
        Ok(group) => group,
        Err(e) => {
            tracing::error!(tag, error = %e, "worker failed to create its group");
            barrier.wait();
            return;
        }
    };

    unsafe { (*group).publish_os_tid() };
    context::set_current_group(group);
    barrier.wait();

    tracing::debug!(tag, "worker running");
    unsafe { (*group).run_main_task() };

    context::clear_current_group();
    unsafe { (*group).destroy_self() };
}

/// Each signalling thread starts its lot walk somewhere stable but
/// different from its neighbors, spreading wakeups over the lots.
fn parking_lot_start_index() -> usize {
    thread_local! {
        static START: Cell<Option<usize>> = const { Cell::new(None) };
    }
    START.with(|s| match s.get() {
        Some(idx) => idx,
        None => {
            let idx = fastrand::usize(..PARKING_LOT_COUNT);
            s.set(Some(idx));
            idx
        }
    })
}

static GLOBAL: OnceLock<Box<TaskControl>> = OnceLock::new();

/// Installs `cfg` as the process-wide scheduler; fails if one is already
/// running.
pub(crate) fn install_global(cfg: SchedConfig) -> Result<()> {
    let mut created = false;
    GLOBAL.get_or_init(|| {
        created = true;
        TaskControl::new(cfg).expect("failed to start scheduler")
    });
    if created {
        Ok(())
    } else {
        Err(anyhow!("scheduler already initialized"))
    }
}

/// The process-wide scheduler, started with defaults on first use.
pub(crate) fn global() -> &'static TaskControl {
    let boxed = GLOBAL.get_or_init(|| {
        let cfg = Builder::new()
            .try_into()
            .expect("default scheduler config is valid");
        TaskControl::new(cfg).expect("failed to start scheduler")
    });
    boxed
}

#[cfg(test)]
mod tests {
    use super::*;
    use static_assertions::assert_impl_all;

    assert_impl_all!(TaskControl: Send, Sync);

    #[test]
    fn prime_offsets_exceed_worker_counts() {
        for offset in STEAL_OFFSETS {
            assert!(offset > 4096);
        }
        assert_ne!(prime_offset(0), 0);
    }

    #[test]
    fn workers_register_one_group_each() {
        let cfg = Builder::new()
            .worker_threads(3)
            .tags(1)
            .into_config()
            .unwrap();
        let control = TaskControl::new(cfg).unwrap();

        assert_eq!(control.tagged[0].ngroup.load(Ordering::Acquire), 3);
        for i in 0..3 {
            let g = control.group_at(0, i).unwrap();
            assert_eq!(g.tag(), 0);
            assert!(g.os_tid() > 0);
        }
        control.stop_and_join();
    }

    #[test]
    fn tags_partition_workers_round_robin() {
        let cfg = Builder::new()
            .worker_threads(4)
            .tags(2)
            .into_config()
            .unwrap();
        let control = TaskControl::new(cfg).unwrap();

        assert_eq!(control.tagged[0].ngroup.load(Ordering::Acquire), 2);
        assert_eq!(control.tagged[1].ngroup.load(Ordering::Acquire), 2);
        control.stop_and_join();
    }

    #[test]
    fn stop_is_idempotent() {
        let cfg = Builder::new().worker_threads(1).into_config().unwrap();
        let control = TaskControl::new(cfg).unwrap();
        control.stop_and_join();
        control.stop_and_join();
        assert!(control.is_stopped());
    }
}
