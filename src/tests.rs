//! End-to-end scheduling scenarios. Component-level cases live next to
//! their modules; everything here drives whole worker pools.

use crate::config::Builder;
use crate::control::TaskControl;
use crate::group::TaskGroup;
use crate::stack::StackClass;
use crate::task::{TaskAttr, Tid};
use nix::errno::Errno;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread::ThreadId;
use std::time::{Duration, Instant};

fn test_control(workers: usize, tags: usize) -> Box<TaskControl> {
    let cfg = Builder::new()
        .worker_threads(workers)
        .tags(tags)
        .into_config()
        .unwrap();
    TaskControl::new(cfg).unwrap()
}

/// Trampoline letting tests run closures as fiber bodies.
fn run_boxed(arg: usize) -> usize {
    let f: Box<Box<dyn FnOnce() -> usize + Send>> =
        unsafe { Box::from_raw(arg as *mut Box<dyn FnOnce() -> usize + Send>) };
    f()
}

fn closure_arg(f: impl FnOnce() -> usize + Send + 'static) -> usize {
    Box::into_raw(Box::new(Box::new(f) as Box<dyn FnOnce() -> usize + Send>)) as usize
}

fn spawn_closure_on(
    control: &TaskControl,
    f: impl FnOnce() -> usize + Send + 'static,
) -> Result<Tid, Errno> {
    control.start_background_remote(run_boxed, closure_arg(f), TaskAttr::default())
}

fn spawn_closure(f: impl FnOnce() -> usize + Send + 'static) -> Result<Tid, Errno> {
    crate::spawn(run_boxed, closure_arg(f), TaskAttr::default())
}

// Two fibers on one worker yield back and forth; both finish, the switch
// counter reflects the churn, and workload time accumulates.
#[test]
fn ping_pong_yield() {
    const YIELDS: u64 = 20_000;
    let control = test_control(1, 1);

    let spawn_pinger = |control: &TaskControl| {
        spawn_closure_on(control, || {
            for _ in 0..YIELDS {
                crate::yield_now();
            }
            1
        })
        .unwrap()
    };
    let a = spawn_pinger(&control);
    let b = spawn_pinger(&control);

    assert_eq!(TaskGroup::join(a).unwrap(), 1);
    assert_eq!(TaskGroup::join(b).unwrap(), 1);

    let group = control.group_at(0, 0).unwrap();
    assert!(group.nswitch() >= 2 * YIELDS);
    assert!(group.cumulated_cputime_ns() > 0);
    control.stop_and_join();
}

// Peers read the accounting cell while the owner churns; both words must
// move monotonically.
#[test]
fn accounting_is_monotone_under_load() {
    let control = test_control(1, 1);
    let group_ptr = control.group_at(0, 0).unwrap() as *const TaskGroup as usize;
    let done = Arc::new(AtomicBool::new(false));

    let sampler = {
        let done = Arc::clone(&done);
        std::thread::spawn(move || {
            let group = unsafe { &*(group_ptr as *const TaskGroup) };
            let mut last_cputime = 0;
            while !done.load(Ordering::Acquire) {
                let cputime = group.cumulated_cputime_ns();
                assert!(cputime >= last_cputime, "cumulated cputime went backwards");
                last_cputime = cputime;
            }
        })
    };

    let tids = (0..4)
        .map(|_| {
            spawn_closure_on(&control, || {
                for _ in 0..5_000 {
                    crate::yield_now();
                }
                0
            })
            .unwrap()
        })
        .collect::<Vec<_>>();
    for tid in tids {
        TaskGroup::join(tid).unwrap();
    }

    done.store(true, Ordering::Release);
    sampler.join().unwrap();
    control.stop_and_join();
}

// A single consumer drains its remote inbox in push order.
#[test]
fn remote_pushes_run_in_fifo_order() {
    const N: usize = 1000;
    let control = test_control(1, 1);
    let order = Arc::new(Mutex::new(Vec::with_capacity(N)));

    let tids = (0..N)
        .map(|i| {
            let order = Arc::clone(&order);
            spawn_closure_on(&control, move || {
                order.lock().push(i);
                0
            })
            .unwrap()
        })
        .collect::<Vec<_>>();
    for tid in tids {
        TaskGroup::join(tid).unwrap();
    }

    let order = order.lock();
    assert_eq!(*order, (0..N).collect::<Vec<_>>());
    control.stop_and_join();
}

// Work seeded onto one worker spreads to its peers, and no fiber runs
// twice.
#[test]
fn idle_peers_steal_seeded_work() {
    const N: usize = 1000;
    let control = test_control(4, 1);
    let runs = Arc::new((0..N).map(|_| AtomicUsize::new(0)).collect::<Vec<_>>());
    let threads = Arc::new(Mutex::new(std::collections::HashSet::<ThreadId>::new()));

    // Seed every fiber onto worker 0's inbox specifically.
    let seeded = control.group_at(0, 0).unwrap();
    let tids = (0..N)
        .map(|i| {
            let runs = Arc::clone(&runs);
            let threads = Arc::clone(&threads);
            let arg = closure_arg(move || {
                runs[i].fetch_add(1, Ordering::SeqCst);
                threads.lock().insert(std::thread::current().id());
                // Enough work that peers wake before the seeded worker
                // drains everything.
                let mut x = i as u64;
                for k in 0..20_000u64 {
                    x = x.wrapping_mul(6364136223846793005).wrapping_add(k);
                }
                std::hint::black_box(x);
                0
            });
            let (tid, meta) = crate::task::pool()
                .alloc(run_boxed, arg, TaskAttr { tag: Some(0), ..Default::default() })
                .unwrap();
            meta.set_cpuwide_start_ns(crate::time::cpuwide_time_ns());
            control.on_fiber_spawn();
            seeded.ready_to_run_remote(meta, false);
            tid
        })
        .collect::<Vec<_>>();

    for tid in tids {
        TaskGroup::join(tid).unwrap();
    }

    for (i, count) in runs.iter().enumerate() {
        assert_eq!(count.load(Ordering::SeqCst), 1, "fiber {} ran a wrong number of times", i);
    }
    assert!(
        threads.lock().len() >= 2,
        "peers never stole any of the seeded work"
    );
    control.stop_and_join();
}

// A sleeping fiber frees its worker for other fibers and wakes on time.
#[test]
fn usleep_yields_the_worker_and_wakes_on_time() {
    const SLEEP_US: u64 = 50_000;
    let control = test_control(1, 1);
    let other_ran = Arc::new(AtomicBool::new(false));

    let sleeper = {
        let other_ran = Arc::clone(&other_ran);
        spawn_closure_on(&control, move || {
            let start = Instant::now();
            crate::usleep(SLEEP_US).unwrap();
            let elapsed = start.elapsed();
            assert!(elapsed >= Duration::from_micros(SLEEP_US));
            assert!(elapsed < Duration::from_secs(2), "sleep drastically overshot");
            other_ran.load(Ordering::Acquire) as usize
        })
        .unwrap()
    };
    let filler = {
        let other_ran = Arc::clone(&other_ran);
        spawn_closure_on(&control, move || {
            other_ran.store(true, Ordering::Release);
            0
        })
        .unwrap()
    };

    TaskGroup::join(filler).unwrap();
    assert_eq!(
        TaskGroup::join(sleeper).unwrap(),
        1,
        "the worker sat idle instead of running the other fiber"
    );
    control.stop_and_join();
}

#[test]
fn interrupt_cuts_a_sleep_short() {
    let control = test_control(1, 1);
    let sleeper = spawn_closure_on(&control, || {
        match crate::usleep(10_000_000) {
            Err(Errno::EINTR) => 0xCAFE,
            other => panic!("expected EINTR, got {:?}", other),
        }
    })
    .unwrap();

    // Let it get to sleep, then interrupt.
    std::thread::sleep(Duration::from_millis(50));
    TaskGroup::interrupt(sleeper, &control).unwrap();

    let start = Instant::now();
    assert_eq!(TaskGroup::join(sleeper).unwrap(), 0xCAFE);
    assert!(start.elapsed() < Duration::from_secs(5));
    control.stop_and_join();
}

#[test]
fn stop_flag_is_visible_and_sleep_reports_it() {
    let control = test_control(1, 1);
    let saw_stop = Arc::new(AtomicBool::new(false));

    let tid = {
        let saw_stop = Arc::clone(&saw_stop);
        spawn_closure_on(&control, move || {
            let res = crate::usleep(10_000_000);
            let me = crate::self_tid().unwrap();
            saw_stop.store(crate::is_stopped(me), Ordering::Release);
            (res == Err(Errno::EINTR)) as usize
        })
        .unwrap()
    };

    std::thread::sleep(Duration::from_millis(50));
    TaskGroup::set_stopped(tid);
    TaskGroup::interrupt(tid, &control).unwrap();

    assert_eq!(TaskGroup::join(tid).unwrap(), 1);
    assert!(saw_stop.load(Ordering::Acquire), "stop flag was not visible in the fiber");
    assert!(crate::is_stopped(tid), "terminated fibers read as stopped");
    control.stop_and_join();
}

// Join returns the exit value, and the id's generation has moved exactly
// one step.
#[test]
fn join_returns_exit_value_once() {
    let control = test_control(2, 1);
    let tid = spawn_closure_on(&control, || 0xDEAD_BEEF).unwrap();

    assert_eq!(TaskGroup::join(tid).unwrap(), 0xDEAD_BEEF);
    assert!(!TaskGroup::exists(tid));
    // Exactly one generation ahead: the recorded value is still addressable.
    assert_eq!(crate::task::pool().recorded_ret(tid), Some(0xDEAD_BEEF));
    // Joining again succeeds immediately with the same value.
    assert_eq!(TaskGroup::join(tid).unwrap(), 0xDEAD_BEEF);
    control.stop_and_join();
}

// A fiber joining another fiber suspends instead of blocking its worker.
#[test]
fn fiber_joins_fiber() {
    let control = test_control(1, 1);

    let target = spawn_closure_on(&control, || {
        for _ in 0..100 {
            crate::yield_now();
        }
        77
    })
    .unwrap();
    let joiner = spawn_closure_on(&control, move || crate::join(target).unwrap()).unwrap();

    assert_eq!(TaskGroup::join(joiner).unwrap(), 77);
    control.stop_and_join();
}

#[test]
fn self_join_is_rejected() {
    let control = test_control(1, 1);
    let tid = spawn_closure_on(&control, || {
        let me = crate::self_tid().unwrap();
        (crate::join(me) == Err(Errno::EINVAL)) as usize
    })
    .unwrap();
    assert_eq!(TaskGroup::join(tid).unwrap(), 1);
    control.stop_and_join();
}

// fiber_exit unwinds through live frames: scope guards run, the joiner
// gets the value.
#[test]
fn fiber_exit_unwinds_scope_guards() {
    struct Guard(Arc<AtomicUsize>);
    impl Drop for Guard {
        fn drop(&mut self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn innermost(guards: &Arc<AtomicUsize>) {
        let _g = Guard(Arc::clone(guards));
        crate::fiber_exit(0x42);
    }
    fn middle(guards: &Arc<AtomicUsize>) {
        let _g = Guard(Arc::clone(guards));
        innermost(guards);
    }

    let control = test_control(1, 1);
    let guards = Arc::new(AtomicUsize::new(0));
    let tid = {
        let guards = Arc::clone(&guards);
        spawn_closure_on(&control, move || {
            let _g = Guard(Arc::clone(&guards));
            middle(&guards);
            unreachable!("fiber_exit returned");
        })
        .unwrap()
    };

    assert_eq!(TaskGroup::join(tid).unwrap(), 0x42);
    assert_eq!(guards.load(Ordering::SeqCst), 3, "a scope guard was skipped");
    control.stop_and_join();
}

// An urgent spawn on a single worker runs the child before the parent
// resumes.
#[test]
fn urgent_spawn_runs_child_first() {
    let control = test_control(1, 1);
    let log = Arc::new(Mutex::new(Vec::new()));

    let parent = {
        let log = Arc::clone(&log);
        spawn_closure_on(&control, move || {
            log.lock().push("before");
            let child = {
                let log = Arc::clone(&log);
                crate::spawn_urgent(
                    run_boxed,
                    closure_arg(move || {
                        log.lock().push("child");
                        0
                    }),
                    TaskAttr::default(),
                )
                .unwrap()
            };
            log.lock().push("after");
            crate::join(child).unwrap();
            0
        })
        .unwrap()
    };

    TaskGroup::join(parent).unwrap();
    assert_eq!(*log.lock(), vec!["before", "child", "after"]);
    control.stop_and_join();
}

// Pthread-mode fibers run inline on the worker's own stack.
#[test]
fn pthread_mode_fibers_complete() {
    let control = test_control(1, 1);
    let attr = TaskAttr {
        stack_class: StackClass::Pthread,
        ..Default::default()
    };
    let tids = (0..10)
        .map(|i| {
            control
                .start_background_remote(run_boxed, closure_arg(move || i * 3), attr)
                .unwrap()
        })
        .collect::<Vec<_>>();

    for (i, tid) in tids.into_iter().enumerate() {
        assert_eq!(TaskGroup::join(tid).unwrap(), i * 3);
    }
    control.stop_and_join();
}

// Fibers stay inside their partition unless cross-tag stealing is on.
#[test]
fn tags_partition_execution() {
    let control = test_control(2, 2);
    let tag_of = |control: &TaskControl, tag: usize| {
        let seen = Arc::new(Mutex::new(None::<ThreadId>));
        let seen2 = Arc::clone(&seen);
        let tid = control
            .start_background_remote(
                run_boxed,
                closure_arg(move || {
                    *seen2.lock() = Some(std::thread::current().id());
                    0
                }),
                TaskAttr {
                    tag: Some(tag),
                    ..Default::default()
                },
            )
            .unwrap();
        TaskGroup::join(tid).unwrap();
        seen.lock().expect("fiber ran")
    };

    // Repeated runs per tag always land on that tag's single worker.
    let t0 = tag_of(&control, 0);
    let t1 = tag_of(&control, 1);
    assert_ne!(t0, t1);
    for _ in 0..5 {
        assert_eq!(tag_of(&control, 0), t0);
        assert_eq!(tag_of(&control, 1), t1);
    }
    control.stop_and_join();
}

#[test]
fn invalid_tag_is_rejected() {
    let control = test_control(1, 1);
    let res = control.start_background_remote(
        run_boxed,
        closure_arg(|| 0),
        TaskAttr {
            tag: Some(7),
            ..Default::default()
        },
    );
    assert_eq!(res.unwrap_err(), Errno::EINVAL);
    control.stop_and_join();
}

#[test]
fn get_attr_reports_and_expires() {
    let control = test_control(1, 1);
    let gate = Arc::new(AtomicBool::new(false));
    let tid = {
        let gate = Arc::clone(&gate);
        spawn_closure_on(&control, move || {
            while !gate.load(Ordering::Acquire) {
                crate::yield_now();
            }
            0
        })
        .unwrap()
    };

    assert!(TaskGroup::exists(tid));
    let attr = TaskGroup::get_attr(tid).unwrap();
    assert_eq!(attr.tag, Some(0));

    gate.store(true, Ordering::Release);
    TaskGroup::join(tid).unwrap();
    assert_eq!(TaskGroup::get_attr(tid), Err(Errno::ESRCH));
    control.stop_and_join();
}

// Deferred-signal spawns still run once somebody flushes the owed wakeups.
#[test]
fn nosignal_spawns_complete_after_flush() {
    let control = test_control(1, 1);
    let attr = TaskAttr {
        flags: crate::AttrFlags::NO_SIGNAL,
        ..Default::default()
    };
    let counter = Arc::new(AtomicUsize::new(0));

    let tids = (0..8)
        .map(|_| {
            let counter = Arc::clone(&counter);
            control
                .start_background_remote(
                    run_boxed,
                    closure_arg(move || {
                        counter.fetch_add(1, Ordering::SeqCst);
                        0
                    }),
                    attr,
                )
                .unwrap()
        })
        .collect::<Vec<_>>();

    control.group_at(0, 0).unwrap().flush_nosignal_tasks_remote();
    for tid in tids {
        TaskGroup::join(tid).unwrap();
    }
    assert_eq!(counter.load(Ordering::SeqCst), 8);
    control.stop_and_join();
}

// The public API against the process-wide scheduler.
#[test]
fn global_api_spawn_join() {
    assert!(crate::concurrency() >= 1);

    let tid = spawn_closure(|| {
        crate::yield_now();
        crate::usleep(1_000).unwrap();
        crate::self_tid().map_or(0, |_| 123)
    })
    .unwrap();
    assert_eq!(crate::join(tid).unwrap(), 123);

    // Off-worker conveniences degrade to thread-level operations.
    crate::yield_now();
    crate::usleep(100).unwrap();
    assert!(crate::self_tid().is_none());
}
