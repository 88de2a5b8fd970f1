//! Position-independent addresses into the shared region.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Byte offset from the start of the shared region.
///
/// Every address stored inside the region (hashtable slots, back-pointers
/// during compaction, the heap top) is one of these rather than a raw
/// pointer, so each process may map the region at a different address.
///
/// Two values are reserved: `NULL` (0) and `SENTINEL` (1). Neither can name
/// a heap entry because the heap starts past the control page and entries
/// are 8-byte aligned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(transparent)]
pub struct RegionOffset(u64);

impl RegionOffset {
    /// Unclaimed or removed.
    pub const NULL: Self = Self(0);

    /// Claimed by a writer whose payload is not visible yet.
    pub const SENTINEL: Self = Self(1);

    /// Create a new region offset.
    #[must_use]
    pub const fn new(offset: u64) -> Self {
        Self(offset)
    }

    /// Get the raw offset value.
    #[must_use]
    pub const fn as_u64(&self) -> u64 {
        self.0
    }

    /// Get the offset as a `usize` for pointer arithmetic.
    #[must_use]
    pub const fn as_usize(&self) -> usize {
        self.0 as usize
    }

    /// Check if this is the null offset.
    #[must_use]
    pub const fn is_null(&self) -> bool {
        self.0 == 0
    }

    /// Check if this is the write-in-progress sentinel.
    #[must_use]
    pub const fn is_sentinel(&self) -> bool {
        self.0 == Self::SENTINEL.0
    }

    /// True when this names an actual heap entry.
    #[must_use]
    pub const fn is_entry(&self) -> bool {
        self.0 > Self::SENTINEL.0
    }

    /// Add a byte offset.
    #[must_use]
    pub const fn add(&self, bytes: u64) -> Self {
        Self(self.0 + bytes)
    }
}

impl fmt::Display for RegionOffset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:08x}", self.0)
    }
}

impl From<u64> for RegionOffset {
    fn from(offset: u64) -> Self {
        Self(offset)
    }
}

/// Round `value` up to a multiple of `align`, which must be a power of two.
#[must_use]
pub const fn align_up(value: u64, align: u64) -> u64 {
    (value + align - 1) & !(align - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserved_offsets() {
        assert!(RegionOffset::NULL.is_null());
        assert!(!RegionOffset::NULL.is_entry());
        assert!(RegionOffset::SENTINEL.is_sentinel());
        assert!(!RegionOffset::SENTINEL.is_entry());
        assert!(RegionOffset::new(4096).is_entry());
    }

    #[test]
    fn offset_display() {
        assert_eq!(RegionOffset::new(0x1000).to_string(), "0x00001000");
    }

    #[test]
    fn align_up_test() {
        assert_eq!(align_up(0, 8), 0);
        assert_eq!(align_up(1, 8), 8);
        assert_eq!(align_up(8, 8), 8);
        assert_eq!(align_up(9, 8), 16);
        assert_eq!(align_up(1, 2048), 2048);
        assert_eq!(align_up(4097, 4096), 8192);
    }
}
