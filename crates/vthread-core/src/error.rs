//! Error types for the vthread scheduler

use core::fmt;

/// Result type for scheduler operations
pub type SchedResult<T> = Result<T, SchedError>;

/// Errors that can occur in scheduler operations
///
/// Pinned preemption attempts are not errors; see `PreemptStatus`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchedError {
    /// Global scheduler not initialized
    NotInitialized,

    /// Global scheduler already initialized
    AlreadyInitialized,

    /// Scheduler has been shut down
    ShutDown,

    /// Configuration rejected by validation
    InvalidConfig(&'static str),

    /// Stack memory mapping failed
    Memory(MemoryError),

    /// Carrier thread error
    Carrier(CarrierError),

    /// Virtual thread body panicked (fault already dispatched to its handler)
    Faulted,
}

impl fmt::Display for SchedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SchedError::NotInitialized => write!(f, "scheduler not initialized"),
            SchedError::AlreadyInitialized => write!(f, "scheduler already initialized"),
            SchedError::ShutDown => write!(f, "scheduler shut down"),
            SchedError::InvalidConfig(msg) => write!(f, "invalid config: {}", msg),
            SchedError::Memory(e) => write!(f, "memory error: {}", e),
            SchedError::Carrier(e) => write!(f, "carrier error: {}", e),
            SchedError::Faulted => write!(f, "virtual thread faulted"),
        }
    }
}

impl std::error::Error for SchedError {}

/// Stack memory errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MemoryError {
    /// mmap failed
    MapFailed,

    /// mprotect failed
    ProtectFailed,

    /// madvise failed
    AdviseFailed,

    /// munmap failed
    UnmapFailed,

    /// Requested stack is below the minimum size
    StackTooSmall,
}

impl fmt::Display for MemoryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MemoryError::MapFailed => write!(f, "stack mapping failed"),
            MemoryError::ProtectFailed => write!(f, "stack protection change failed"),
            MemoryError::AdviseFailed => write!(f, "stack page release failed"),
            MemoryError::UnmapFailed => write!(f, "stack unmapping failed"),
            MemoryError::StackTooSmall => write!(f, "stack size below minimum"),
        }
    }
}

impl From<MemoryError> for SchedError {
    fn from(e: MemoryError) -> Self {
        SchedError::Memory(e)
    }
}

/// Carrier thread errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CarrierError {
    /// OS refused to spawn a carrier thread
    SpawnFailed,

    /// Every carrier slot up to the hard cap is in use
    PoolExhausted,
}

impl fmt::Display for CarrierError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CarrierError::SpawnFailed => write!(f, "failed to spawn carrier thread"),
            CarrierError::PoolExhausted => write!(f, "carrier pool at its hard cap"),
        }
    }
}

impl From<CarrierError> for SchedError {
    fn from(e: CarrierError) -> Self {
        SchedError::Carrier(e)
    }
}
