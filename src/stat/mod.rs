pub(crate) mod atomic128;

pub(crate) mod cpu_stat;
pub(crate) use cpu_stat::{AtomicCpuTimeStat, CpuTimeStat};
