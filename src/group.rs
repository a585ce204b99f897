use crate::config::SchedConfig;
use crate::context;
use crate::control::{TaskControl, prime_offset};
use crate::parking::{ParkState, ParkingLot};
use crate::queue::{LocalRunQueue, RemoteRunQueue};
use crate::stack::{self, ContextualStack, StackClass, jump_stack};
use crate::task::meta::AttrFlags;
use crate::task::{FiberStack, TaskAttr, TaskFn, TaskMeta, Tid, VersionButex, pool};
use crate::time::{cpuwide_time_ns, cputhread_time_ns};
use crate::stat::{AtomicCpuTimeStat, CpuTimeStat};
use nix::errno::Errno;
use std::cell::Cell;
use std::ptr;
use std::sync::Once;
use std::sync::atomic::{AtomicI32, AtomicI64, Ordering};
use std::time::Duration;

/// Raised by `fiber_exit` and caught only at the fiber root. Any other
/// catcher must rethrow it, or joiners of the exiting fiber hang.
pub(crate) struct ExitSignal(pub(crate) usize);

/// Keeps `fiber_exit` unwinds out of the default panic hook's stderr spew.
pub(crate) fn install_exit_panic_hook() {
    static ONCE: Once = Once::new();
    ONCE.call_once(|| {
        let prev = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            if info.payload().downcast_ref::<ExitSignal>().is_none() {
                prev(info);
            }
        }));
    });
}

/// One-shot callback that runs on the next-run fiber, right after the
/// switch. The thing it acts on (usually the fiber that just switched out)
/// must not be touched before the switch completes: until then its stack is
/// live, and a peer that found it on a queue could resume it elsewhere.
#[derive(Debug)]
pub(crate) enum PostSwitchHook {
    /// Requeue the fiber that just suspended.
    ReadyToRun { meta: *const TaskMeta, nosignal: bool },
    /// Release the stack and slot of the fiber that just terminated.
    ReleaseMeta { meta: *const TaskMeta },
    /// Arm the sleep timer for the fiber that just suspended.
    AddSleepEvent { tid: Tid, deadline_ns: i64 },
    /// Park the fiber that just suspended on a generation cell.
    RegisterJoinWaiter {
        butex: *const VersionButex,
        expected: u32,
        waiter: Tid,
    },
}

/// Per-worker scheduler: the local run queue, the remote inbox, the context
/// switch machinery and the CPU accounting cell.
///
/// Exactly one OS thread owns a group for its whole life. Peers touch only
/// the stealable structures (`local_rq` top, `remote_rq` under its lock,
/// `cpu_time_stat` reads); every `Cell` field is owner-only.
///
/// Methods involving a context switch are associated functions taking
/// `pg: &mut *const TaskGroup` instead of `&self`: after a switch the
/// calling fiber may have been stolen to a different worker, so the cached
/// group pointer is re-read from the thread-local and written back through
/// `pg` before returning.
pub(crate) struct TaskGroup {
    cur_meta: Cell<*const TaskMeta>,
    control: *const TaskControl,

    // Wakeups owed for local pushes made with nosignal.
    num_nosignal: Cell<i64>,
    nsignaled: Cell<i64>,

    cpu_time_stat: AtomicCpuTimeStat,
    /// Thread-CPU clock at the last switch-in; 0 while accounting is off.
    last_cpu_clock_ns: Cell<i64>,

    nswitch: Cell<u64>,
    post_switch_hook: Cell<Option<PostSwitchHook>>,

    pl: *const ParkingLot,
    last_pl_state: Cell<ParkState>,

    steal_seed: Cell<u64>,
    steal_offset: u64,

    main_stack: ContextualStack,
    main_tid: Cell<Tid>,

    local_rq: LocalRunQueue,
    remote_rq: RemoteRunQueue,

    /// Non-zero while a switch is in flight; re-entry is a bug.
    sched_recursive_guard: Cell<i32>,

    tag: usize,
    os_tid: AtomicI32,

    last_rq_full_warn_ns: Cell<i64>,
    last_remote_full_warn_ns: AtomicI64,
}

// Safety: see the struct docs. Owner-only Cells are never touched by
// peers, and everything peers touch is independently synchronized.
unsafe impl Send for TaskGroup {}
unsafe impl Sync for TaskGroup {}

impl TaskGroup {
    pub(crate) fn new(
        control: *const TaskControl,
        tag: usize,
        pl: *const ParkingLot,
        cfg: &SchedConfig,
    ) -> Self {
        let seed = fastrand::u64(..);
        Self {
            cur_meta: Cell::new(ptr::null()),
            control,
            num_nosignal: Cell::new(0),
            nsignaled: Cell::new(0),
            cpu_time_stat: AtomicCpuTimeStat::default(),
            last_cpu_clock_ns: Cell::new(0),
            nswitch: Cell::new(0),
            post_switch_hook: Cell::new(None),
            pl,
            last_pl_state: Cell::new(ParkState::default()),
            steal_seed: Cell::new(seed),
            steal_offset: prime_offset(seed),
            main_stack: ContextualStack::new_main(),
            main_tid: Cell::new(Tid::NONE),
            local_rq: LocalRunQueue::new(cfg.runqueue_capacity),
            remote_rq: RemoteRunQueue::new(cfg.runqueue_capacity),
            sched_recursive_guard: Cell::new(0),
            tag,
            os_tid: AtomicI32::new(-1),
            last_rq_full_warn_ns: Cell::new(0),
            last_remote_full_warn_ns: AtomicI64::new(0),
        }
    }

    /// Synthesizes the fiber that runs the dispatch loop itself.
    pub(crate) fn init_main_fiber(&self) -> Result<(), Errno> {
        let attr = TaskAttr {
            stack_class: StackClass::Pthread,
            flags: AttrFlags::MAIN_FIBER,
            tag: Some(self.tag),
        };
        let (tid, meta) = pool().alloc(main_fiber_body, 0, attr)?;
        meta.set_cpuwide_start_ns(cpuwide_time_ns());
        // Safety: the group is not yet visible to any other thread.
        unsafe { meta.set_stack(FiberStack::Main) };

        self.main_tid.set(tid);
        self.cur_meta.set(meta);

        let mut stat = CpuTimeStat::default();
        stat.set_last_run_ns(cpuwide_time_ns(), true);
        self.cpu_time_stat.store(stat);
        Ok(())
    }

    pub(crate) fn publish_os_tid(&self) {
        self.os_tid
            .store(nix::unistd::gettid().as_raw(), Ordering::Release);
    }

    // --- owner / reader accessors ---

    pub(crate) fn control(&self) -> &TaskControl {
        // Safety: the control owns this group and outlives it.
        unsafe { &*self.control }
    }

    fn pl(&self) -> &ParkingLot {
        // Safety: parking lots live in the control, which outlives us.
        unsafe { &*self.pl }
    }

    pub(crate) fn tag(&self) -> usize {
        self.tag
    }

    pub(crate) fn os_tid(&self) -> i32 {
        self.os_tid.load(Ordering::Acquire)
    }

    pub(crate) fn main_tid(&self) -> Tid {
        self.main_tid.get()
    }

    pub(crate) fn nswitch(&self) -> u64 {
        self.nswitch.get()
    }

    pub(crate) fn rq_size(&self) -> usize {
        self.local_rq.volatile_size()
    }

    /// Owner only.
    pub(crate) fn current_task(&self) -> &TaskMeta {
        // Safety: set at init and on every switch by the owning worker.
        unsafe { &*self.cur_meta.get() }
    }

    pub(crate) fn current_tid(&self) -> Tid {
        self.current_task().tid()
    }

    pub(crate) fn current_uptime_ns(&self) -> i64 {
        cpuwide_time_ns() - self.current_task().cpuwide_start_ns()
    }

    pub(crate) fn is_current_main_task(&self) -> bool {
        self.current_tid() == self.main_tid.get()
    }

    /// True when the running fiber has no stack of its own: it shares the
    /// worker's OS stack and cannot be switched away from mid-run.
    pub(crate) fn is_current_pthread_task(&self) -> bool {
        matches!(unsafe { self.current_task().stack() }, FiberStack::Main)
    }

    /// Workload CPU time of this group; main-fiber time excluded. Readable
    /// from any thread.
    pub(crate) fn cumulated_cputime_ns(&self) -> i64 {
        self.cpu_time_stat.load().cumulated_cputime_ns()
    }

    /// Thread-CPU nanoseconds consumed by the running fiber so far; 0 when
    /// clock accounting is disabled.
    pub(crate) fn current_task_cpu_clock_ns(&self) -> i64 {
        let last = self.last_cpu_clock_ns.get();
        if last == 0 {
            return 0;
        }
        let used = self.current_task().stat.cpu_usage_ns.load(Ordering::Relaxed);
        used + (cputhread_time_ns() - last)
    }

    // --- run queues and signalling ---

    /// Pushes into the local queue, backing off while it is full. Dropping
    /// the id instead would leak its stack and strand its joiners.
    pub(crate) fn push_rq(&self, tid: Tid) {
        let mut backoff_us = 1u64;
        while !self.local_rq.push_bottom(tid) {
            // Make owed wakeups visible so sleeping peers come steal.
            self.flush_nosignal_tasks();
            let now = cpuwide_time_ns();
            if now - self.last_rq_full_warn_ns.get() > 1_000_000_000 {
                self.last_rq_full_warn_ns.set(now);
                tracing::warn!(
                    tag = self.tag,
                    size = self.rq_size(),
                    "local run queue full, retrying push"
                );
            }
            std::thread::sleep(Duration::from_micros(backoff_us));
            backoff_us = (backoff_us * 2).min(1000);
        }
    }

    /// Owner only: makes a fiber of this group runnable. With `nosignal`
    /// the wakeup is deferred until a flush, batching N wakeups into one.
    pub(crate) fn ready_to_run(&self, meta: &TaskMeta, nosignal: bool) {
        debug_assert_eq!(meta.attr().tag, Some(self.tag));
        self.push_rq(meta.tid());
        if nosignal {
            self.num_nosignal.set(self.num_nosignal.get() + 1);
        } else {
            let signals = self.num_nosignal.get() + 1;
            self.num_nosignal.set(0);
            self.nsignaled.set(self.nsignaled.get() + signals);
            self.control().signal_workers(signals as usize, self.tag);
        }
    }

    pub(crate) fn flush_nosignal_tasks(&self) {
        let owed = self.num_nosignal.replace(0);
        if owed > 0 {
            self.nsignaled.set(self.nsignaled.get() + owed);
            self.control().signal_workers(owed as usize, self.tag);
        }
    }

    /// Any thread: hands a fiber to this group through its remote inbox.
    pub(crate) fn ready_to_run_remote(&self, meta: &TaskMeta, nosignal: bool) {
        let tid = meta.tid();
        let mut backoff_us = 1u64;
        let mut inbox = self.remote_rq.lock();
        while !inbox.push(tid) {
            let owed = inbox.take_nosignal();
            drop(inbox);
            if owed > 0 {
                self.control().signal_workers(owed as usize, self.tag);
            }
            let now = cpuwide_time_ns();
            if now - self.last_remote_full_warn_ns.load(Ordering::Relaxed) > 1_000_000_000 {
                self.last_remote_full_warn_ns.store(now, Ordering::Relaxed);
                tracing::warn!(tag = self.tag, "remote run queue full, retrying push");
            }
            std::thread::sleep(Duration::from_micros(backoff_us));
            backoff_us = (backoff_us * 2).min(1000);
            inbox = self.remote_rq.lock();
        }
        if nosignal {
            inbox.num_nosignal += 1;
        } else {
            let signals = inbox.take_nosignal() + 1;
            drop(inbox);
            self.control().signal_workers(signals as usize, self.tag);
        }
    }

    pub(crate) fn flush_nosignal_tasks_remote(&self) {
        let owed = self.remote_rq.lock().take_nosignal();
        if owed > 0 {
            self.control().signal_workers(owed as usize, self.tag);
        }
    }

    /// One coalesced wake covering both deferred-signal paths.
    pub(crate) fn flush_nosignal_tasks_general(&self) {
        let local = self.num_nosignal.replace(0);
        if local > 0 {
            self.nsignaled.set(self.nsignaled.get() + local);
        }
        let remote = self.remote_rq.lock().take_nosignal();
        let owed = local + remote;
        if owed > 0 {
            self.control().signal_workers(owed as usize, self.tag);
        }
    }

    /// What peers may take from this group.
    pub(crate) fn steal_from(&self) -> Option<Tid> {
        self.local_rq.steal_top().or_else(|| self.remote_rq.try_pop())
    }

    // --- finding work ---

    /// Drains our own inbox first (cheap, keeps locality), then asks the
    /// control to walk peers. The parking epoch is captured in between so a
    /// push-and-signal racing the walk reruns it instead of being slept
    /// through.
    fn steal_task(&self) -> Option<Tid> {
        if let Some(tid) = self.remote_rq.pop() {
            return Some(tid);
        }
        self.last_pl_state.set(self.pl().state());
        let mut seed = self.steal_seed.get();
        let stolen = self
            .control()
            .steal_task(&mut seed, self.steal_offset, self.tag);
        self.steal_seed.set(seed);
        stolen
    }

    /// Blocks until there is a fiber to run; None means the scheduler
    /// stopped.
    fn wait_task(&self) -> Option<Tid> {
        loop {
            if self.last_pl_state.get().stopped() {
                return None;
            }
            self.pl().wait(self.last_pl_state.get());
            if let Some(tid) = self.steal_task() {
                return Some(tid);
            }
        }
    }

    /// The worker's dispatch loop; runs on a dedicated OS thread until the
    /// control stops.
    pub(crate) fn run_main_task(&self) {
        let mut g: *const TaskGroup = self;
        while let Some(tid) = unsafe { (*g).wait_task() } {
            unsafe {
                TaskGroup::sched_to_tid(&mut g, tid);
                debug_assert!(ptr::eq(g, self), "the main fiber never migrates");
                let gref = &*g;
                if !gref.is_current_main_task() && gref.is_current_pthread_task() {
                    // The switch landed a pthread-mode fiber on our stack;
                    // run it inline. Its hooks already ran in sched_to.
                    TaskGroup::task_runner(true);
                }
            }
        }
        tracing::debug!(
            tag = self.tag,
            nswitch = self.nswitch(),
            cputime_ns = self.cumulated_cputime_ns(),
            "worker dispatch loop ended"
        );
    }

    // --- switching ---

    pub(crate) fn set_post_switch_hook(&self, hook: PostSwitchHook) {
        let prev = self.post_switch_hook.replace(Some(hook));
        debug_assert!(prev.is_none(), "post-switch hook slot already armed");
    }

    fn resolve_stack<'a>(&'a self, meta: &'a TaskMeta) -> &'a ContextualStack {
        // Safety: owner access; the meta is ours for the duration.
        match unsafe { meta.stack() } {
            FiberStack::Owned(stk) => stk,
            FiberStack::Main => &self.main_stack,
            FiberStack::Unallocated => unreachable!("fiber scheduled without a stack"),
        }
    }

    /// Ensures `next_tid` has a stack and switches to it. On allocation
    /// failure the fiber is demoted to pthread-mode rather than dropped.
    ///
    /// # Safety
    /// Must run on the worker owning `*pg`; `next_tid` must be a live fiber
    /// owned by this worker's scheduling decision (popped or stolen once).
    pub(crate) unsafe fn sched_to_tid(pg: &mut *const TaskGroup, next_tid: Tid) {
        let next_meta = pool()
            .address(next_tid)
            .expect("a queued fiber terminated before running");
        unsafe {
            if matches!(next_meta.stack(), FiberStack::Unallocated) {
                match stack::get_stack(next_meta.attr().stack_class, fiber_entry) {
                    Some(stk) => next_meta.set_stack(FiberStack::Owned(stk)),
                    None => next_meta.set_stack(FiberStack::Main),
                }
            }
            Self::sched_to(pg, next_meta, false);
        }
    }

    /// The switch itself: one 16-byte store of the accounting record, the
    /// stack jump, then the post-switch hooks of whatever context we wake
    /// up in. `*pg` is rebound to the worker we resumed on.
    ///
    /// # Safety
    /// As `sched_to_tid`. `next_meta` must not be running anywhere.
    pub(crate) unsafe fn sched_to(
        pg: &mut *const TaskGroup,
        next_meta: &'static TaskMeta,
        cur_ending: bool,
    ) {
        let mut g = unsafe { &**pg };

        let depth = g.sched_recursive_guard.get();
        assert_eq!(depth, 0, "recursive switch; a post-switch hook may not suspend");
        g.sched_recursive_guard.set(depth + 1);

        let now = cpuwide_time_ns();
        let mut stat = g.cpu_time_stat.load_relaxed();
        let elapsed = now - stat.last_run_ns();
        let next_is_main = next_meta.tid() == g.main_tid.get();
        stat.add_cumulated_cputime_ns(elapsed, stat.is_main_task());
        stat.set_last_run_ns(now, next_is_main);
        g.cpu_time_stat.store(stat);

        let cur_meta = unsafe { &*g.cur_meta.get() };
        debug_assert!(
            !cur_ending || pool().address(cur_meta.tid()).is_none(),
            "ending switch from a fiber that has not terminated"
        );

        if g.control().config().enable_cpu_clock_stat {
            let clock = cputhread_time_ns();
            let last = g.last_cpu_clock_ns.get();
            if last != 0 {
                cur_meta
                    .stat
                    .cpu_usage_ns
                    .fetch_add(clock - last, Ordering::Relaxed);
            }
            g.last_cpu_clock_ns.set(clock);
        }

        g.nswitch.set(g.nswitch.get() + 1);
        next_meta.stat.nswitch.fetch_add(1, Ordering::Relaxed);

        if !ptr::eq(cur_meta, next_meta) {
            g.cur_meta.set(next_meta);
            let from = g.resolve_stack(cur_meta);
            let to = g.resolve_stack(next_meta);
            if !ptr::eq(from, to) {
                unsafe {
                    jump_stack(from, to);
                }
                // Running again, possibly on a different worker if a peer
                // stole us in between. Nothing cached above survives.
                g = unsafe { &*context::current_group() };
            }
        }

        while let Some(hook) = g.post_switch_hook.take() {
            run_post_switch_hook(hook);
            g = unsafe { &*context::current_group() };
        }

        let depth = g.sched_recursive_guard.get();
        g.sched_recursive_guard.set(depth - 1);
        *pg = g;
    }

    /// Picks the next fiber (local, then steal, then the main fiber) and
    /// switches to it.
    ///
    /// # Safety
    /// As `sched_to`.
    pub(crate) unsafe fn sched(pg: &mut *const TaskGroup) {
        let g = unsafe { &**pg };
        let next_tid = g
            .local_rq
            .pop_bottom()
            .or_else(|| g.steal_task())
            .unwrap_or_else(|| g.main_tid.get());
        unsafe { Self::sched_to_tid(pg, next_tid) }
    }

    /// `sched` for a terminating fiber: hands the dying stack to the next
    /// stackless fiber when the classes match, so back-to-back exits stay
    /// on one warm stack.
    ///
    /// # Safety
    /// As `sched_to`; the current fiber must have terminated (generation
    /// already advanced).
    pub(crate) unsafe fn ending_sched(pg: &mut *const TaskGroup) {
        let g = unsafe { &**pg };
        let next_tid = g
            .local_rq
            .pop_bottom()
            .or_else(|| g.steal_task())
            .unwrap_or_else(|| g.main_tid.get());
        let next_meta = pool()
            .address(next_tid)
            .expect("a queued fiber terminated before running");

        unsafe {
            let cur_meta = &*g.cur_meta.get();
            if matches!(next_meta.stack(), FiberStack::Unallocated) {
                let reusable = match cur_meta.stack() {
                    FiberStack::Owned(stk) => stk.class() == next_meta.attr().stack_class,
                    _ => false,
                };
                if reusable {
                    next_meta.set_stack(cur_meta.release_stack());
                } else {
                    match stack::get_stack(next_meta.attr().stack_class, fiber_entry) {
                        Some(stk) => next_meta.set_stack(FiberStack::Owned(stk)),
                        None => next_meta.set_stack(FiberStack::Main),
                    }
                }
            }
            Self::sched_to(pg, next_meta, true);
        }
    }

    /// Requeues the caller and runs something else.
    ///
    /// # Safety
    /// As `sched_to`; the caller must be a fiber with its own stack.
    pub(crate) unsafe fn yield_current(pg: &mut *const TaskGroup) {
        let g = unsafe { &**pg };
        g.set_post_switch_hook(PostSwitchHook::ReadyToRun {
            meta: g.cur_meta.get(),
            nosignal: false,
        });
        unsafe { Self::sched(pg) }
    }

    /// Suspends the caller for at least `timeout_us`. EINTR when woken by
    /// an interrupt, or when the fiber's stop flag is up on wakeup.
    ///
    /// # Safety
    /// As `sched_to`; the caller must be a fiber with its own stack.
    pub(crate) unsafe fn usleep(pg: &mut *const TaskGroup, timeout_us: u64) -> Result<(), Errno> {
        if timeout_us == 0 {
            return Ok(());
        }
        let g = unsafe { &**pg };
        let meta = g.current_task();
        let deadline_ns = cpuwide_time_ns() + timeout_us as i64 * 1000;
        g.set_post_switch_hook(PostSwitchHook::AddSleepEvent {
            tid: meta.tid(),
            deadline_ns,
        });
        unsafe { Self::sched(pg) };

        // Timer, interrupt or stop woke us.
        if meta.consume_interrupt() {
            return Err(Errno::EINTR);
        }
        if meta.is_stopped() {
            return Err(Errno::EINTR);
        }
        Ok(())
    }

    // --- starting fibers ---

    fn resolve_attr(&self, mut attr: TaskAttr) -> Result<TaskAttr, Errno> {
        let tag = attr.tag.unwrap_or(self.tag);
        if tag >= self.control().config().tags {
            return Err(Errno::EINVAL);
        }
        attr.tag = Some(tag);
        Ok(attr)
    }

    /// Creates a fiber and switches to it immediately, requeueing the
    /// caller. The strongest locality a spawn can get.
    ///
    /// # Safety
    /// Must run on a worker thread; `pg` as `sched_to`.
    pub(crate) unsafe fn start_foreground(
        pg: &mut *const TaskGroup,
        f: TaskFn,
        arg: usize,
        attr: TaskAttr,
    ) -> Result<Tid, Errno> {
        let g = unsafe { &**pg };
        let attr = g.resolve_attr(attr)?;
        let (tid, meta) = pool().alloc(f, arg, attr)?;
        meta.set_cpuwide_start_ns(cpuwide_time_ns());
        g.control().on_fiber_spawn();

        if attr.tag != Some(g.tag) {
            // Wrong partition for an immediate switch; hand it over.
            g.control()
                .choose_one_group(attr.tag.expect("resolved"))
                .ready_to_run_remote(meta, false);
        } else if g.is_current_pthread_task() {
            // Cannot switch away from the shared stack; queue and flush.
            g.ready_to_run(meta, true);
            g.flush_nosignal_tasks();
        } else {
            // The worker that resumes us will also handle the requeue, so
            // no wakeup is owed for it yet.
            g.set_post_switch_hook(PostSwitchHook::ReadyToRun {
                meta: g.cur_meta.get(),
                nosignal: true,
            });
            unsafe { Self::sched_to_tid(pg, tid) };
        }
        Ok(tid)
    }

    /// Creates a fiber and queues it on this group without switching.
    pub(crate) fn start_background(
        &self,
        f: TaskFn,
        arg: usize,
        attr: TaskAttr,
    ) -> Result<Tid, Errno> {
        let attr = self.resolve_attr(attr)?;
        let (tid, meta) = pool().alloc(f, arg, attr)?;
        meta.set_cpuwide_start_ns(cpuwide_time_ns());
        self.control().on_fiber_spawn();

        let nosignal = attr.flags.contains(AttrFlags::NO_SIGNAL);
        if attr.tag == Some(self.tag) {
            self.ready_to_run(meta, nosignal);
        } else {
            self.control()
                .choose_one_group(attr.tag.expect("resolved"))
                .ready_to_run_remote(meta, nosignal);
        }
        Ok(tid)
    }

    // --- blocking operations on other fibers ---

    /// Waits until `tid` terminates and returns its exit value. A stale id
    /// is already-terminated: success, with the recorded value when it is
    /// still available.
    pub(crate) fn join(tid: Tid) -> Result<usize, Errno> {
        if tid.is_none() {
            return Err(Errno::EINVAL);
        }
        let expected = tid.version();
        let Some(meta) = pool().address(tid) else {
            return Ok(pool().recorded_ret(tid).unwrap_or(0));
        };
        if meta.is_main_fiber() {
            return Err(Errno::EINVAL);
        }
        if context::with_current_group(|g| g.current_tid()) == Some(tid) {
            return Err(Errno::EINVAL);
        }

        let on_fiber =
            context::with_current_group(|g| !g.is_current_pthread_task()).unwrap_or(false);
        if on_fiber {
            let mut g = context::current_group();
            while !meta.version_butex.has_advanced(expected) {
                let waiter = unsafe { (*g).current_tid() };
                unsafe {
                    (*g).set_post_switch_hook(PostSwitchHook::RegisterJoinWaiter {
                        butex: &meta.version_butex,
                        expected,
                        waiter,
                    });
                    Self::sched(&mut g);
                }
                let self_meta = unsafe { (*g).current_task() };
                if self_meta.consume_interrupt() && !meta.version_butex.has_advanced(expected) {
                    return Err(Errno::EINTR);
                }
            }
        } else {
            meta.version_butex.wait_thread(expected);
        }
        Ok(meta.version_butex.ret_for(expected).unwrap_or(0))
    }

    /// Wakes whatever blocking primitive `tid` is parked on and leaves a
    /// sticky interrupt flag for it to consume. A missing or unblocked
    /// target is a successful no-op.
    pub(crate) fn interrupt(tid: Tid, control: &TaskControl) -> Result<(), Errno> {
        let Some(meta) = pool().address(tid) else {
            return Ok(());
        };
        meta.set_interrupted();

        // Asleep? Whoever takes the armed handle owns the single wakeup.
        if let Some(handle) = meta.sleep_handle.lock().take() {
            control.timer().unschedule(handle);
            control.ready_to_run_general(meta, false);
            return Ok(());
        }

        // Parked on a generation cell? Removal from the waiter list decides
        // ownership the same way.
        if let Some(butex) = meta.wait_butex() {
            if butex.remove_waiter(tid) {
                meta.set_wait_butex(None);
                control.ready_to_run_general(meta, false);
            }
        }
        Ok(())
    }

    pub(crate) fn exists(tid: Tid) -> bool {
        pool().address(tid).is_some()
    }

    pub(crate) fn get_attr(tid: Tid) -> Result<TaskAttr, Errno> {
        pool().address(tid).map(|m| m.attr()).ok_or(Errno::ESRCH)
    }

    pub(crate) fn set_stopped(tid: Tid) {
        if let Some(meta) = pool().address(tid) {
            meta.set_stopped();
        }
    }

    /// A terminated fiber reads as stopped.
    pub(crate) fn is_stopped(tid: Tid) -> bool {
        pool().address(tid).map_or(true, |m| m.is_stopped())
    }

    /// Hands the group back to the control instead of deleting it: a peer
    /// may still be dereferencing us for one last steal attempt.
    pub(crate) fn destroy_self(&self) {
        self.control().retire_group(self as *const TaskGroup as *mut TaskGroup);
    }

    // --- the fiber root ---

    /// Runs fiber bodies until the dispatch loop takes over again. Entered
    /// from a fresh fiber stack (hooks pending, `skip_post_switch_hook`
    /// false) or inline from the main stack for pthread-mode fibers (hooks
    /// already ran in `sched_to`).
    pub(crate) fn task_runner(skip_post_switch_hook: bool) {
        let mut g = context::current_group();
        if !skip_post_switch_hook {
            unsafe {
                while let Some(hook) = (*g).post_switch_hook.take() {
                    run_post_switch_hook(hook);
                    g = context::current_group();
                }
                // Balance the switch that landed on this fresh stack; its
                // suspended caller cannot reach its own decrement.
                let depth = (*g).sched_recursive_guard.get();
                (*g).sched_recursive_guard.set(depth - 1);
            }
        }

        loop {
            // Safety: we are the worker running this fiber.
            let meta = unsafe { &*(*g).cur_meta.get() };
            let (f, arg) = unsafe { meta.take_entry() }.expect("fiber scheduled without an entry");
            let log = meta.attr().flags.contains(AttrFlags::LOG_START_AND_FINISH);
            if log {
                tracing::trace!(tid = %meta.tid(), "fiber started");
            }

            let ret = run_fiber_body(f, arg);

            // The body may have yielded and been stolen meanwhile.
            g = context::current_group();
            if log {
                tracing::trace!(tid = %meta.tid(), ret, "fiber finished");
            }
            unsafe { (*g).control().on_fiber_exit() };

            // From here the fiber's id is stale, but its stack is ours
            // until the next switch completes.
            let woken = meta.version_butex.advance_and_wake(ret);
            for waiter in woken {
                if let Some(waiter_meta) = pool().address(waiter) {
                    waiter_meta.set_wait_butex(None);
                    unsafe { (*g).control().ready_to_run_general(waiter_meta, false) };
                }
            }

            unsafe {
                (*g).set_post_switch_hook(PostSwitchHook::ReleaseMeta { meta });
                Self::ending_sched(&mut g);
            }

            if unsafe { (*g).is_current_main_task() } {
                break;
            }
        }
    }
}

/// The seeded entry of every fiber stack. The switch argument is the
/// skip-hooks flag; the first jump onto a fresh stack always passes 0.
extern "C" fn fiber_entry(skip_post_switch_hook: usize) -> ! {
    TaskGroup::task_runner(skip_post_switch_hook != 0);
    unreachable!("a fiber stack outlived its final switch")
}

/// Entry recorded on the synthesized main fiber; never invoked, because the
/// dispatch loop breaks out of `task_runner` before taking it.
fn main_fiber_body(_arg: usize) -> usize {
    unreachable!("the main fiber runs the dispatch loop, not an entry")
}

fn run_fiber_body(f: TaskFn, arg: usize) -> usize {
    match std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| f(arg))) {
        Ok(ret) => ret,
        Err(payload) => match payload.downcast::<ExitSignal>() {
            Ok(signal) => signal.0,
            Err(payload) => {
                let msg = payload
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "non-string panic payload".into());
                tracing::error!(%msg, "fiber body panicked; recording exit value 0");
                0
            }
        },
    }
}

fn run_post_switch_hook(hook: PostSwitchHook) {
    // Safety throughout: hooks run on a worker thread with a valid current
    // group, and the metas they reference are kept alive by the scheduler
    // protocol (a suspended fiber cannot be freed, a terminated one is
    // freed only by its own ReleaseMeta hook).
    let g = unsafe { &*context::current_group() };
    match hook {
        PostSwitchHook::ReadyToRun { meta, nosignal } => {
            let meta = unsafe { &*meta };
            g.control().ready_to_run_general(meta, nosignal);
        }
        PostSwitchHook::ReleaseMeta { meta } => {
            let meta = unsafe { &*meta };
            // Safety: the terminated fiber is off-CPU now; we are the only
            // ones holding it.
            match unsafe { meta.release_stack() } {
                FiberStack::Owned(stk) => stack::return_stack(stk),
                FiberStack::Main | FiberStack::Unallocated => {}
            }
            pool().free(meta.tid());
        }
        PostSwitchHook::AddSleepEvent { tid, deadline_ns } => add_sleep_event(g, tid, deadline_ns),
        PostSwitchHook::RegisterJoinWaiter {
            butex,
            expected,
            waiter,
        } => {
            let butex = unsafe { &*butex };
            let Some(waiter_meta) = pool().address(waiter) else {
                return;
            };
            waiter_meta.set_wait_butex(Some(butex));
            if !butex.try_register_waiter(expected, waiter) {
                // Target already exited; do not park after all.
                waiter_meta.set_wait_butex(None);
                g.control().ready_to_run_general(waiter_meta, false);
            } else if waiter_meta.is_interrupted() && butex.remove_waiter(waiter) {
                // An interrupt raced the registration and missed it; honor
                // it now that the waiter is findable.
                waiter_meta.set_wait_butex(None);
                g.control().ready_to_run_general(waiter_meta, false);
            }
        }
    }
}

struct ControlPtrForTimer(*const TaskControl);
// Safety: timer callbacks are dropped when the control's timer joins, which
// happens before the control is freed.
unsafe impl Send for ControlPtrForTimer {}

/// Completes a sleep registration after the sleeper is off every runnable
/// list. Registering earlier would let the timer ready a fiber whose stack
/// is still live on this worker.
fn add_sleep_event(g: &TaskGroup, tid: Tid, deadline_ns: i64) {
    let Some(meta) = pool().address(tid) else {
        return;
    };
    let control = g.control();
    let control_ptr = ControlPtrForTimer(control as *const TaskControl);

    // Holding the slot lock across `schedule` means the callback (which
    // also locks it) observes the final armed/cancelled decision.
    let mut slot = meta.sleep_handle.lock();
    let handle = control.timer().schedule(deadline_ns, move || {
        let control_ptr = control_ptr;
        let Some(meta) = pool().address(tid) else {
            return;
        };
        if meta.sleep_handle.lock().take().is_some() {
            let control = unsafe { &*control_ptr.0 };
            control.ready_to_run_general(meta, false);
        }
    });

    if !meta.is_stopped() && !meta.is_interrupted() {
        *slot = Some(handle);
        return;
    }

    // Stopped or interrupted before the timer was armed: wake immediately.
    // The slot stays empty, so even a callback that already left the heap
    // finds nothing to take and never duplicates this wakeup; unschedule is
    // best-effort cleanup only. The flags stay up for the sleeper's own
    // wakeup check.
    drop(slot);
    control.timer().unschedule(handle);
    control.ready_to_run_general(meta, false);
}
