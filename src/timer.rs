use crate::time::cpuwide_time_ns;
use parking_lot::{Condvar, Mutex};
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashSet};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Names one pending timer so it can be cancelled before it fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct TimerHandle(u64);

type TimerCallback = Box<dyn FnOnce() + Send + 'static>;

struct TimerEntry {
    deadline_ns: i64,
    id: u64,
    callback: TimerCallback,
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        (self.deadline_ns, self.id) == (other.deadline_ns, other.id)
    }
}
impl Eq for TimerEntry {}
impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.deadline_ns, self.id).cmp(&(other.deadline_ns, other.id))
    }
}

#[derive(Default)]
struct TimerState {
    heap: BinaryHeap<Reverse<TimerEntry>>,
    cancelled: HashSet<u64>,
    next_id: u64,
    stopped: bool,
}

/// One dedicated thread firing absolute-deadline callbacks.
///
/// Deadlines are on the monotonic clock from [`cpuwide_time_ns`]. Callbacks
/// run on the timer thread and must only do cheap scheduler work (in
/// practice: push a fiber onto a remote run queue).
pub(crate) struct TimerThread {
    shared: Arc<TimerShared>,
    handle: Mutex<Option<thread::JoinHandle<()>>>,
}

struct TimerShared {
    state: Mutex<TimerState>,
    cond: Condvar,
}

impl TimerThread {
    pub(crate) fn start() -> Self {
        let shared = Arc::new(TimerShared {
            state: Mutex::new(TimerState::default()),
            cond: Condvar::new(),
        });

        let thread_shared = Arc::clone(&shared);
        let handle = thread::Builder::new()
            .name("spindle-timer".into())
            .spawn(move || run_timer_loop(&thread_shared))
            .expect("failed to spawn timer thread");

        Self {
            shared,
            handle: Mutex::new(Some(handle)),
        }
    }

    /// Schedules `callback` to run at `deadline_ns` (monotonic). A deadline
    /// in the past fires on the next loop pass.
    pub(crate) fn schedule(
        &self,
        deadline_ns: i64,
        callback: impl FnOnce() + Send + 'static,
    ) -> TimerHandle {
        let mut state = self.shared.state.lock();
        let id = state.next_id;
        state.next_id += 1;
        state.heap.push(Reverse(TimerEntry {
            deadline_ns,
            id,
            callback: Box::new(callback),
        }));
        // Only the new head can shorten the wait; waking unconditionally is
        // cheaper than tracking that.
        self.shared.cond.notify_one();
        TimerHandle(id)
    }

    /// True if the timer was cancelled before its callback started.
    pub(crate) fn unschedule(&self, handle: TimerHandle) -> bool {
        let mut state = self.shared.state.lock();
        let pending = state.heap.iter().any(|Reverse(e)| e.id == handle.0);
        if pending {
            state.cancelled.insert(handle.0);
        }
        pending
    }

    pub(crate) fn stop_and_join(&self) {
        {
            let mut state = self.shared.state.lock();
            state.stopped = true;
        }
        self.shared.cond.notify_all();
        if let Some(handle) = self.handle.lock().take() {
            let _ = handle.join();
        }
    }
}

fn run_timer_loop(shared: &TimerShared) {
    tracing::debug!("timer thread running");
    let mut state = shared.state.lock();
    loop {
        if state.stopped {
            break;
        }
        let now = cpuwide_time_ns();
        let next_deadline = state.heap.peek().map(|Reverse(entry)| entry.deadline_ns);
        match next_deadline {
            None => {
                shared.cond.wait(&mut state);
            }
            Some(deadline) if deadline > now => {
                let wait = Duration::from_nanos((deadline - now) as u64);
                let _ = shared.cond.wait_for(&mut state, wait);
            }
            Some(_) => {
                let Reverse(entry) = state.heap.pop().expect("peeked entry");
                if state.cancelled.remove(&entry.id) {
                    continue;
                }
                // Run without the lock so callbacks may schedule more timers.
                drop(state);
                (entry.callback)();
                state = shared.state.lock();
            }
        }
    }
    tracing::debug!("timer thread exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn fires_in_deadline_order() {
        let timer = TimerThread::start();
        let log = Arc::new(Mutex::new(Vec::new()));
        let now = cpuwide_time_ns();

        for (label, offset_ms) in [(2u32, 20i64), (1, 10), (3, 30)] {
            let log = Arc::clone(&log);
            timer.schedule(now + offset_ms * 1_000_000, move || {
                log.lock().push(label);
            });
        }

        std::thread::sleep(Duration::from_millis(80));
        assert_eq!(*log.lock(), vec![1, 2, 3]);
        timer.stop_and_join();
    }

    #[test]
    fn unschedule_prevents_firing() {
        let timer = TimerThread::start();
        let fired = Arc::new(AtomicUsize::new(0));

        let f = Arc::clone(&fired);
        let handle = timer.schedule(cpuwide_time_ns() + 50_000_000, move || {
            f.fetch_add(1, Ordering::SeqCst);
        });
        assert!(timer.unschedule(handle));
        assert!(!timer.unschedule(handle));

        std::thread::sleep(Duration::from_millis(80));
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        timer.stop_and_join();
    }

    #[test]
    fn past_deadline_fires_immediately() {
        let timer = TimerThread::start();
        let fired = Arc::new(AtomicUsize::new(0));

        let f = Arc::clone(&fired);
        timer.schedule(cpuwide_time_ns() - 1, move || {
            f.fetch_add(1, Ordering::SeqCst);
        });

        let deadline = std::time::Instant::now() + Duration::from_secs(1);
        while fired.load(Ordering::SeqCst) == 0 && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        timer.stop_and_join();
    }
}
