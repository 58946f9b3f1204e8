//! Scheduler configuration
//!
//! Compile-time defaults with runtime environment overrides.
//!
//! # Priority (highest wins)
//!
//! 1. Builder calls
//! 2. Environment variables (`from_env()`)
//! 3. `VT_CONFIG_RS` file merged at build time
//! 4. Library defaults
//!
//! ```rust,ignore
//! use vthread_runtime::config::SchedulerConfig;
//!
//! let config = SchedulerConfig::from_env()
//!     .parallelism(8)
//!     .time_slice(Duration::from_millis(5));
//! ```

pub mod defaults;

use std::time::Duration;
use vthread_core::constants::{MAX_CARRIERS, MIN_STACK_SIZE};
use vthread_core::env::{env_flag, env_get, env_millis};
use vthread_core::SchedError;

/// Scheduler configuration with builder methods
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Core carrier threads started with the scheduler
    pub parallelism: usize,
    /// Hard cap on carriers, compensation included
    pub max_carriers: usize,
    /// Stack reserved per continuation
    pub stack_size: usize,
    /// Per-carrier local ready queue capacity
    pub local_queue_capacity: usize,
    /// Empty polls before an idle carrier parks
    pub idle_spins: u32,
    /// Longest single park of an idle carrier
    pub park_timeout: Duration,
    /// Idle time after which a compensating carrier retires
    pub keep_alive: Duration,
    /// Mount time after which the monitor preempts a virtual thread
    pub time_slice: Duration,
    /// Monitor scan period
    pub monitor_interval: Duration,
    /// How long a targeted preemption waits for its target's safepoint
    pub preempt_timeout: Duration,
    /// Run the preemption monitor
    pub enable_forced_preempt: bool,
    /// Return frozen stack pages to the OS while suspended
    pub release_frozen_stacks: bool,
    /// Raise log level to debug at scheduler start
    pub debug_logging: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

impl SchedulerConfig {
    /// Compile-time defaults with environment overrides
    ///
    /// Environment variables (all optional):
    /// - `VT_PARALLELISM` - core carrier threads
    /// - `VT_MAX_CARRIERS` - carrier hard cap
    /// - `VT_STACK_SIZE` - bytes per continuation stack
    /// - `VT_LOCAL_QUEUE_CAPACITY` - per-carrier queue size
    /// - `VT_IDLE_SPINS` - spins before parking
    /// - `VT_PARK_TIMEOUT_MS`, `VT_KEEP_ALIVE_MS`
    /// - `VT_TIME_SLICE_MS`, `VT_MONITOR_INTERVAL_MS`, `VT_PREEMPT_TIMEOUT_MS`
    /// - `VT_ENABLE_FORCED_PREEMPT`, `VT_RELEASE_FROZEN_STACKS`, `VT_DEBUG` (0/1)
    pub fn from_env() -> Self {
        let d = Self::new();
        Self {
            parallelism: env_get("VT_PARALLELISM", d.parallelism),
            max_carriers: env_get("VT_MAX_CARRIERS", d.max_carriers),
            stack_size: env_get("VT_STACK_SIZE", d.stack_size),
            local_queue_capacity: env_get("VT_LOCAL_QUEUE_CAPACITY", d.local_queue_capacity),
            idle_spins: env_get("VT_IDLE_SPINS", d.idle_spins),
            park_timeout: env_millis("VT_PARK_TIMEOUT_MS", d.park_timeout),
            keep_alive: env_millis("VT_KEEP_ALIVE_MS", d.keep_alive),
            time_slice: env_millis("VT_TIME_SLICE_MS", d.time_slice),
            monitor_interval: env_millis("VT_MONITOR_INTERVAL_MS", d.monitor_interval),
            preempt_timeout: env_millis("VT_PREEMPT_TIMEOUT_MS", d.preempt_timeout),
            enable_forced_preempt: env_flag("VT_ENABLE_FORCED_PREEMPT", d.enable_forced_preempt),
            release_frozen_stacks: env_flag("VT_RELEASE_FROZEN_STACKS", d.release_frozen_stacks),
            debug_logging: env_flag("VT_DEBUG", d.debug_logging),
        }
    }

    /// Compile-time defaults only, no environment lookup
    pub fn new() -> Self {
        Self {
            parallelism: defaults::PARALLELISM,
            max_carriers: defaults::MAX_CARRIERS,
            stack_size: defaults::STACK_SIZE,
            local_queue_capacity: defaults::LOCAL_QUEUE_CAPACITY,
            idle_spins: defaults::IDLE_SPINS,
            park_timeout: Duration::from_millis(defaults::PARK_TIMEOUT_MS),
            keep_alive: Duration::from_millis(defaults::KEEP_ALIVE_MS),
            time_slice: Duration::from_millis(defaults::TIME_SLICE_MS),
            monitor_interval: Duration::from_millis(defaults::MONITOR_INTERVAL_MS),
            preempt_timeout: Duration::from_millis(defaults::PREEMPT_TIMEOUT_MS),
            enable_forced_preempt: defaults::ENABLE_FORCED_PREEMPT,
            release_frozen_stacks: defaults::RELEASE_FROZEN_STACKS,
            debug_logging: defaults::DEBUG_LOGGING || cfg!(feature = "debug-logging"),
        }
    }

    // Builder methods

    pub fn parallelism(mut self, n: usize) -> Self {
        self.parallelism = n;
        self
    }

    pub fn max_carriers(mut self, n: usize) -> Self {
        self.max_carriers = n;
        self
    }

    pub fn stack_size(mut self, size: usize) -> Self {
        self.stack_size = size;
        self
    }

    pub fn local_queue_capacity(mut self, cap: usize) -> Self {
        self.local_queue_capacity = cap;
        self
    }

    pub fn idle_spins(mut self, spins: u32) -> Self {
        self.idle_spins = spins;
        self
    }

    pub fn park_timeout(mut self, d: Duration) -> Self {
        self.park_timeout = d;
        self
    }

    pub fn keep_alive(mut self, d: Duration) -> Self {
        self.keep_alive = d;
        self
    }

    pub fn time_slice(mut self, d: Duration) -> Self {
        self.time_slice = d;
        self
    }

    pub fn monitor_interval(mut self, d: Duration) -> Self {
        self.monitor_interval = d;
        self
    }

    pub fn preempt_timeout(mut self, d: Duration) -> Self {
        self.preempt_timeout = d;
        self
    }

    pub fn enable_forced_preempt(mut self, enable: bool) -> Self {
        self.enable_forced_preempt = enable;
        self
    }

    pub fn release_frozen_stacks(mut self, enable: bool) -> Self {
        self.release_frozen_stacks = enable;
        self
    }

    pub fn debug_logging(mut self, enable: bool) -> Self {
        self.debug_logging = enable;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.parallelism == 0 {
            return Err(ConfigError::InvalidValue("parallelism must be > 0"));
        }
        if self.max_carriers < self.parallelism {
            return Err(ConfigError::InvalidValue("max_carriers must be >= parallelism"));
        }
        if self.max_carriers > MAX_CARRIERS {
            return Err(ConfigError::InvalidValue("max_carriers must be <= 1024"));
        }
        if self.stack_size < MIN_STACK_SIZE {
            return Err(ConfigError::InvalidValue("stack_size must be >= 16KB"));
        }
        if self.local_queue_capacity == 0 {
            return Err(ConfigError::InvalidValue("local_queue_capacity must be > 0"));
        }
        Ok(())
    }

    pub fn print(&self) {
        eprintln!("vthread configuration:");
        eprintln!("  parallelism:            {}", self.parallelism);
        eprintln!("  max_carriers:           {}", self.max_carriers);
        eprintln!("  stack_size:             {}", self.stack_size);
        eprintln!("  local_queue_capacity:   {}", self.local_queue_capacity);
        eprintln!("  idle_spins:             {}", self.idle_spins);
        eprintln!("  park_timeout:           {:?}", self.park_timeout);
        eprintln!("  keep_alive:             {:?}", self.keep_alive);
        eprintln!("  time_slice:             {:?}", self.time_slice);
        eprintln!("  monitor_interval:       {:?}", self.monitor_interval);
        eprintln!("  preempt_timeout:        {:?}", self.preempt_timeout);
        eprintln!("  enable_forced_preempt:  {}", self.enable_forced_preempt);
        eprintln!("  release_frozen_stacks:  {}", self.release_frozen_stacks);
        eprintln!("  debug_logging:          {}", self.debug_logging);
    }
}

/// Configuration error
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    InvalidValue(&'static str),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::InvalidValue(msg) => write!(f, "invalid config: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<ConfigError> for SchedError {
    fn from(e: ConfigError) -> Self {
        match e {
            ConfigError::InvalidValue(msg) => SchedError::InvalidConfig(msg),
        }
    }
}
