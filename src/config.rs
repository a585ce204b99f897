use crate::stack::StackClass;
use anyhow::{Result, anyhow};
use std::thread;

const DEFAULT_RUNQUEUE_CAPACITY: usize = 4096;

/// Configures and installs the process-wide scheduler.
///
/// ```no_run
/// spindle::Builder::new()
///     .worker_threads(8)
///     .tags(2)
///     .init_global()
///     .unwrap();
/// ```
///
/// Calling any fiber API before `init_global` installs a scheduler with the
/// defaults below.
#[derive(Debug, Clone)]
pub struct Builder {
    /// Defaults to one worker per CPU core.
    worker_threads: Option<usize>,

    /// Number of affinity partitions; workers are distributed round-robin
    /// over them and fibers only run inside their own partition.
    tags: usize,

    /// Local run queue capacity per worker; rounded up to a power of two.
    runqueue_capacity: usize,

    /// Whether a worker out of local and same-tag work may steal across
    /// partitions.
    cross_tag_steal: bool,

    /// Per-fiber thread-CPU-clock accounting. Costs two clock reads per
    /// switch.
    enable_cpu_clock_stat: bool,

    thread_name_prefix: String,

    default_stack_class: StackClass,
}

impl Default for Builder {
    fn default() -> Self {
        Self::new()
    }
}

impl Builder {
    pub fn new() -> Self {
        Self {
            worker_threads: None,
            tags: 1,
            runqueue_capacity: DEFAULT_RUNQUEUE_CAPACITY,
            cross_tag_steal: false,
            enable_cpu_clock_stat: false,
            thread_name_prefix: "spindle-worker".into(),
            default_stack_class: StackClass::Normal,
        }
    }

    pub fn worker_threads(mut self, val: usize) -> Self {
        assert!(val > 0, "worker threads cannot be set to 0");
        self.worker_threads = Some(val);
        self
    }

    pub fn tags(mut self, val: usize) -> Self {
        assert!(val > 0, "at least one tag is required");
        self.tags = val;
        self
    }

    pub fn runqueue_capacity(mut self, val: usize) -> Self {
        assert!(val > 0, "run queue capacity cannot be 0");
        self.runqueue_capacity = val;
        self
    }

    pub fn cross_tag_steal(mut self, val: bool) -> Self {
        self.cross_tag_steal = val;
        self
    }

    pub fn enable_cpu_clock_stat(mut self, val: bool) -> Self {
        self.enable_cpu_clock_stat = val;
        self
    }

    pub fn thread_name_prefix(mut self, val: impl Into<String>) -> Self {
        self.thread_name_prefix = val.into();
        self
    }

    pub fn default_stack_class(mut self, val: StackClass) -> Self {
        self.default_stack_class = val;
        self
    }

    /// Installs the configured scheduler as the process-wide one. Fails if
    /// something (an earlier call, or a fiber API used with defaults)
    /// already installed it.
    pub fn init_global(self) -> Result<()> {
        let cfg = SchedConfig::try_from(self)?;
        crate::control::install_global(cfg)
    }

    #[cfg(test)]
    pub(crate) fn into_config(self) -> Result<SchedConfig> {
        SchedConfig::try_from(self)
    }
}

/// The validated form consumed by TaskControl.
#[derive(Debug, Clone)]
pub(crate) struct SchedConfig {
    pub(crate) worker_threads: usize,
    pub(crate) tags: usize,
    pub(crate) runqueue_capacity: usize,
    pub(crate) cross_tag_steal: bool,
    pub(crate) enable_cpu_clock_stat: bool,
    pub(crate) thread_name_prefix: String,
    pub(crate) default_stack_class: StackClass,
}

impl TryFrom<Builder> for SchedConfig {
    type Error = anyhow::Error;

    fn try_from(builder: Builder) -> Result<Self> {
        let worker_threads = match builder.worker_threads {
            Some(n) => n,
            None => thread::available_parallelism()?.get(),
        };

        if worker_threads < builder.tags {
            return Err(anyhow!(
                "{} tags need at least as many workers, got {}",
                builder.tags,
                worker_threads
            ));
        }

        Ok(SchedConfig {
            worker_threads,
            tags: builder.tags,
            runqueue_capacity: builder.runqueue_capacity.next_power_of_two(),
            cross_tag_steal: builder.cross_tag_steal,
            enable_cpu_clock_stat: builder.enable_cpu_clock_stat,
            thread_name_prefix: builder.thread_name_prefix,
            default_stack_class: builder.default_stack_class,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use static_assertions::assert_impl_all;

    // The config is cloned into every spawned worker thread.
    assert_impl_all!(SchedConfig: Send, Sync, Clone);

    #[test]
    fn capacity_rounds_to_power_of_two() {
        let cfg = Builder::new()
            .worker_threads(2)
            .runqueue_capacity(1000)
            .into_config()
            .unwrap();
        assert_eq!(cfg.runqueue_capacity, 1024);
    }

    #[test]
    fn more_tags_than_workers_is_rejected() {
        assert!(Builder::new().worker_threads(2).tags(3).into_config().is_err());
    }

    #[test]
    #[should_panic(expected = "worker threads cannot be set to 0")]
    fn zero_workers_panics() {
        let _ = Builder::new().worker_threads(0);
    }
}
