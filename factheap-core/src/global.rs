//! Single-writer broadcast slot.
//!
//! The coordinator writes one length-prefixed blob; any process may read it
//! until the coordinator clears it. The length word is published last with
//! Release ordering, so a reader that sees a non-zero length sees the bytes.

use crate::error::{FactHeapError, Result};
use crate::region::Region;
use crate::types::RegionOffset;
use std::sync::atomic::{AtomicU64, Ordering};

/// View of the region's global blob section.
#[derive(Debug, Clone, Copy)]
pub struct GlobalSlot<'a> {
    region: &'a Region,
}

impl Region {
    /// The global broadcast slot.
    pub fn global(&self) -> GlobalSlot<'_> {
        GlobalSlot { region: self }
    }
}

impl<'a> GlobalSlot<'a> {
    fn len_word(&self) -> &'a AtomicU64 {
        self.region.atomic(self.region.layout().global.offset)
    }

    fn data_offset(&self) -> u64 {
        self.region.layout().global.offset + 8
    }

    /// Capacity in bytes.
    pub fn capacity(&self) -> u64 {
        self.region.config().global_size
    }

    /// True when no blob is stored.
    pub fn is_empty(&self) -> bool {
        self.len_word().load(Ordering::Acquire) == 0
    }

    /// Publish `bytes` to every process.
    ///
    /// # Panics
    /// Panics outside the coordinator or when the slot already holds a blob.
    pub fn store(&self, bytes: &[u8]) -> Result<()> {
        self.region.assert_coordinator("global store");
        assert!(self.is_empty(), "global slot already holds a blob");

        let size = bytes.len() as u64;
        if size > self.capacity() {
            return Err(FactHeapError::GlobalBlobTooLarge {
                size,
                capacity: self.capacity(),
            });
        }

        self.region
            .reserve(RegionOffset::new(self.data_offset()), size)?;
        // SAFETY: the range lies inside the global section and only the
        // coordinator writes it while the length word is zero.
        unsafe {
            std::ptr::copy_nonoverlapping(
                bytes.as_ptr(),
                self.region.ptr(self.data_offset()),
                bytes.len(),
            );
        }
        self.len_word().store(size, Ordering::Release);
        tracing::debug!(bytes = size, "Stored global blob");
        Ok(())
    }

    /// Copy the stored blob out.
    ///
    /// # Panics
    /// Panics when the slot is empty.
    pub fn load(&self) -> Result<Vec<u8>> {
        self.region.check_should_exit()?;
        let size = self.len_word().load(Ordering::Acquire);
        assert!(size != 0, "global slot is empty");

        let mut out = vec![0u8; size as usize];
        // SAFETY: the writer published `size` bytes before the length word.
        unsafe {
            std::ptr::copy_nonoverlapping(
                self.region.ptr(self.data_offset()),
                out.as_mut_ptr(),
                out.len(),
            );
        }
        Ok(out)
    }

    /// Empty the slot so it may be stored again.
    pub fn clear(&self) {
        self.region.assert_coordinator("global clear");
        self.len_word().store(0, Ordering::Release);
    }
}
