//! Virtual thread identifier type

use core::fmt;
use core::sync::atomic::{AtomicU64, Ordering};

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for a virtual thread
///
/// Ids are handed out from a process-wide counter and never reused.
/// Zero is reserved as the "no virtual thread" sentinel.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct VThreadId(u64);

impl VThreadId {
    /// Sentinel value indicating no virtual thread
    pub const NONE: VThreadId = VThreadId(0);

    /// Allocate the next unused id
    #[inline]
    pub fn next() -> Self {
        VThreadId(NEXT_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Create an id from a raw value
    #[inline]
    pub const fn new(id: u64) -> Self {
        VThreadId(id)
    }

    #[inline]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    #[inline]
    pub const fn is_none(self) -> bool {
        self.0 == 0
    }

    #[inline]
    pub const fn is_some(self) -> bool {
        self.0 != 0
    }
}

impl From<VThreadId> for u64 {
    #[inline]
    fn from(id: VThreadId) -> Self {
        id.0
    }
}

impl fmt::Debug for VThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_none() {
            write!(f, "VThreadId(NONE)")
        } else {
            write!(f, "VThreadId({})", self.0)
        }
    }
}

impl fmt::Display for VThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_none() {
            write!(f, "none")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

impl Default for VThreadId {
    fn default() -> Self {
        VThreadId::NONE
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_are_unique_and_nonzero() {
        let a = VThreadId::next();
        let b = VThreadId::next();
        assert_ne!(a, b);
        assert!(a.is_some());
        assert!(b.as_u64() > a.as_u64());
    }

    #[test]
    fn test_none_sentinel() {
        assert!(VThreadId::NONE.is_none());
        assert_eq!(VThreadId::default(), VThreadId::NONE);
        assert_eq!(format!("{}", VThreadId::NONE), "none");
        assert_eq!(format!("{:?}", VThreadId::new(7)), "VThreadId(7)");
    }
}
