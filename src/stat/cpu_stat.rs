use crate::stat::atomic128::{AtomicComposite128, Pair};

/// Last scheduling time, task kind and cumulated CPU time of one group,
/// packed so the whole record fits in a single 16-byte store.
///
/// Word one keeps the last scheduling timestamp in its low 63 bits and a
/// "currently running the main task" flag in the sign bit. Word two is the
/// CPU time accumulated by non-main tasks. Main-task time is dispatch-loop
/// bookkeeping, not workload, and is never added to the second word.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct CpuTimeStat {
    last_run_ns_and_kind: i64,
    cumulated_cputime_ns: i64,
}

const LAST_RUN_NS_MASK: i64 = 0x7FFF_FFFF_FFFF_FFFF;
const MAIN_TASK_MASK: i64 = i64::MIN;

impl CpuTimeStat {
    pub(crate) fn set_last_run_ns(&mut self, last_run_ns: i64, main_task: bool) {
        self.last_run_ns_and_kind =
            (last_run_ns & LAST_RUN_NS_MASK) | (i64::from(main_task) << 63);
    }

    pub(crate) fn last_run_ns(&self) -> i64 {
        self.last_run_ns_and_kind & LAST_RUN_NS_MASK
    }

    pub(crate) fn is_main_task(&self) -> bool {
        self.last_run_ns_and_kind & MAIN_TASK_MASK != 0
    }

    pub(crate) fn add_cumulated_cputime_ns(&mut self, cputime_ns: i64, main_task: bool) {
        if main_task {
            return;
        }
        self.cumulated_cputime_ns += cputime_ns;
    }

    pub(crate) fn cumulated_cputime_ns(&self) -> i64 {
        self.cumulated_cputime_ns
    }
}

impl From<Pair> for CpuTimeStat {
    fn from(value: Pair) -> Self {
        Self {
            last_run_ns_and_kind: value.v1,
            cumulated_cputime_ns: value.v2,
        }
    }
}

impl From<CpuTimeStat> for Pair {
    fn from(stat: CpuTimeStat) -> Self {
        Pair {
            v1: stat.last_run_ns_and_kind,
            v2: stat.cumulated_cputime_ns,
        }
    }
}

/// The group-resident cell. Written only by the owning worker (one store per
/// context switch), read by peers for steal heuristics and by metric
/// readers; the 128-bit cell keeps (timestamp, cumulated) pairs untorn.
#[derive(Debug, Default)]
pub(crate) struct AtomicCpuTimeStat {
    cell: AtomicComposite128,
}

impl AtomicCpuTimeStat {
    pub(crate) fn load(&self) -> CpuTimeStat {
        self.cell.load().into()
    }

    /// Owner only.
    pub(crate) fn load_relaxed(&self) -> CpuTimeStat {
        self.cell.load_relaxed().into()
    }

    pub(crate) fn store(&self, stat: CpuTimeStat) {
        self.cell.store(stat.into());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(0, false)]
    #[case(1_234_567_890, false)]
    #[case(1_234_567_890, true)]
    #[case(LAST_RUN_NS_MASK, true)]
    fn pack_unpack(#[case] ns: i64, #[case] main: bool) {
        let mut stat = CpuTimeStat::default();
        stat.set_last_run_ns(ns, main);
        assert_eq!(stat.last_run_ns(), ns);
        assert_eq!(stat.is_main_task(), main);
    }

    #[test]
    fn main_task_time_is_not_workload() {
        let mut stat = CpuTimeStat::default();
        stat.add_cumulated_cputime_ns(100, true);
        assert_eq!(stat.cumulated_cputime_ns(), 0);

        stat.add_cumulated_cputime_ns(100, false);
        stat.add_cumulated_cputime_ns(25, false);
        assert_eq!(stat.cumulated_cputime_ns(), 125);
    }

    #[test]
    fn atomic_round_trip() {
        let cell = AtomicCpuTimeStat::default();
        let mut stat = CpuTimeStat::default();
        stat.set_last_run_ns(42, true);
        stat.add_cumulated_cputime_ns(7, false);
        cell.store(stat);

        let back = cell.load();
        assert_eq!(back.last_run_ns(), 42);
        assert!(back.is_main_task());
        assert_eq!(back.cumulated_cputime_ns(), 7);
    }
}
