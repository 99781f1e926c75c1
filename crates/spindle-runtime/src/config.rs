//! Scheduler configuration.

use std::time::Duration;

/// Default stack size for spawned tasks (64 KiB).
pub const DEFAULT_STACK_SIZE: usize = 64 * 1024;

/// Smallest stack a task may be created with.
pub const MIN_STACK_SIZE: usize = 16 * 1024;

/// Default interval between monitor passes.
pub const DEFAULT_MONITOR_TICK: Duration = Duration::from_millis(1);

/// Configuration errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("thread count must be at least 1")]
    ZeroThreads,

    #[error("monitor tick must be non-zero")]
    ZeroTick,

    #[error("stack size {size} is below the minimum of {min} bytes")]
    StackTooSmall { size: usize, min: usize },

    #[error("invalid value {value:?} for {var}")]
    InvalidEnv { var: &'static str, value: String },
}

/// Parameters for a [`Scheduler`](crate::Scheduler).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerConfig {
    /// Number of OS threads running task loops (including the caller's)
    pub threads: usize,

    /// Interval between monitor passes (unused with a single thread)
    pub monitor_tick: Duration,

    /// Default stack size for tasks spawned without an explicit size
    pub stack_size: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            threads: num_cpus::get(),
            monitor_tick: DEFAULT_MONITOR_TICK,
            stack_size: DEFAULT_STACK_SIZE,
        }
    }
}

impl SchedulerConfig {
    /// Configuration with the given thread count and defaults elsewhere
    pub fn with_threads(threads: usize) -> Self {
        Self {
            threads,
            ..Self::default()
        }
    }

    pub fn monitor_tick(mut self, tick: Duration) -> Self {
        self.monitor_tick = tick;
        self
    }

    pub fn stack_size(mut self, size: usize) -> Self {
        self.stack_size = size;
        self
    }

    /// Defaults overridden by `SPINDLE_THREADS`, `SPINDLE_MONITOR_TICK_US`
    /// and `SPINDLE_STACK_SIZE` when set.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    fn from_lookup(lookup: impl Fn(&'static str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Some(threads) = parse_var(&lookup, "SPINDLE_THREADS")? {
            config.threads = threads;
        }
        if let Some(us) = parse_var(&lookup, "SPINDLE_MONITOR_TICK_US")? {
            config.monitor_tick = Duration::from_micros(us as u64);
        }
        if let Some(size) = parse_var(&lookup, "SPINDLE_STACK_SIZE")? {
            config.stack_size = size;
        }
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the scheduler cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.threads == 0 {
            return Err(ConfigError::ZeroThreads);
        }
        if self.monitor_tick.is_zero() {
            return Err(ConfigError::ZeroTick);
        }
        if self.stack_size < MIN_STACK_SIZE {
            return Err(ConfigError::StackTooSmall {
                size: self.stack_size,
                min: MIN_STACK_SIZE,
            });
        }
        Ok(())
    }
}

fn parse_var(
    lookup: &impl Fn(&'static str) -> Option<String>,
    var: &'static str,
) -> Result<Option<usize>, ConfigError> {
    match lookup(var) {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse::<usize>()
            .map(Some)
            .map_err(|_| ConfigError::InvalidEnv { var, value }),
    }
}
