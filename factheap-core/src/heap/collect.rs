//! Sliding compaction of the heap.
//!
//! Live entries are the ones some hashtable slot points at. Compaction:
//!
//! 1. For every slot with an entry, park the entry's header in the slot's
//!    address field and leave a [`HeapWord::BackPointer`] to that field at
//!    the entry.
//! 2. Walk the heap bottom to top. A [`HeapWord::Header`] is a dead entry
//!    and is skipped. A back-pointer is a live entry: restore its header,
//!    slide it down to the write cursor and point its slot at the new spot.
//!
//! Entries keep their relative order, so the walk never overwrites an entry
//! it has not visited yet. The bytes between the new and old top are left
//! mapped for reuse rather than returned to the OS.
//!
//! Before pass 1 the heap is walked once read-only. A word that is not a
//! header (an allocation whose header was never written) makes compaction
//! fail with [`FactHeapError::HeapCorrupt`] and leaves the heap untouched.

use super::header::HeapWord;
use super::store::HashStore;
use crate::error::{FactHeapError, Result};
use crate::region::Cell;
use crate::types::RegionOffset;
use std::sync::atomic::Ordering;
use std::time::Instant;

/// When compaction is worth running.
#[derive(Debug, Clone)]
pub struct CollectPolicy {
    /// Minimum wasted/used ratio (0.0 to 1.0).
    pub wasted_ratio: f64,
    /// Minimum wasted bytes.
    pub min_reclaimable_bytes: u64,
}

impl Default for CollectPolicy {
    fn default() -> Self {
        Self {
            wasted_ratio: 0.5,
            min_reclaimable_bytes: 1024 * 1024, // 1 MB
        }
    }
}

impl CollectPolicy {
    /// Compact whenever anything is wasted.
    pub fn aggressive() -> Self {
        Self {
            wasted_ratio: 0.0,
            min_reclaimable_bytes: 1,
        }
    }

    /// Set the wasted ratio threshold.
    pub fn with_wasted_ratio(mut self, ratio: f64) -> Self {
        self.wasted_ratio = ratio.clamp(0.0, 1.0);
        self
    }

    /// Set the minimum reclaimable bytes.
    pub fn with_min_reclaimable_bytes(mut self, bytes: u64) -> Self {
        self.min_reclaimable_bytes = bytes;
        self
    }
}

/// Result of a compaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectionReport {
    /// Heap bytes in use before.
    pub bytes_before: u64,
    /// Heap bytes in use after.
    pub bytes_after: u64,
    /// Live entries found.
    pub entries_live: u64,
    /// Live entries that changed address.
    pub entries_moved: u64,
    /// Whether compaction ran.
    pub performed: bool,
}

impl CollectionReport {
    /// A report for a skipped compaction.
    pub fn not_performed() -> Self {
        Self {
            bytes_before: 0,
            bytes_after: 0,
            entries_live: 0,
            entries_moved: 0,
            performed: false,
        }
    }

    /// Bytes given back to the allocator.
    #[must_use]
    pub fn bytes_reclaimed(&self) -> u64 {
        self.bytes_before - self.bytes_after
    }
}

impl<'a> HashStore<'a> {
    /// Check whether `policy` calls for compaction now.
    pub fn should_collect(&self, policy: &CollectPolicy) -> bool {
        let used = self.used_heap_size();
        let wasted = self.wasted_heap_size();
        if used == 0 || wasted < policy.min_reclaimable_bytes {
            return false;
        }
        wasted as f64 / used as f64 >= policy.wasted_ratio
    }

    /// Compact if `policy` says so.
    pub fn collect_if_needed(&self, policy: &CollectPolicy) -> Result<CollectionReport> {
        if !self.should_collect(policy) {
            return Ok(CollectionReport::not_performed());
        }
        self.collect()
    }

    /// Slide every live entry to the bottom of the heap.
    ///
    /// # Errors
    /// [`FactHeapError::HeapCorrupt`] if the heap cannot be walked from
    /// header to header. Nothing is moved in that case.
    ///
    /// # Panics
    /// Panics outside the coordinator, while removes are disabled, or if a
    /// slot is still mid-publish. No other process may touch the hashtable
    /// while this runs.
    pub fn collect(&self) -> Result<CollectionReport> {
        self.region.assert_coordinator("collect");
        assert!(self.region.allow_removes(), "removes are disabled");
        let started = Instant::now();

        let heap = self.region.layout().heap;
        let top = self
            .region
            .cell(Cell::HeapTop)
            .load(Ordering::Acquire)
            .min(heap.end());
        let bytes_before = top - heap.offset;
        self.verify_walkable(heap.offset, top)?;

        // Pass 1: swap headers into slots and leave back-pointers behind.
        for index in 0..self.capacity() {
            let addr = self.addr_word(index);
            let entry = RegionOffset::new(addr.load(Ordering::Acquire));
            assert!(!entry.is_sentinel(), "collect while slot {index} is mid-publish");
            if !entry.is_entry() {
                continue;
            }
            let word = self.region.atomic(entry.as_u64());
            addr.store(word.load(Ordering::Relaxed), Ordering::Relaxed);
            let back = HeapWord::BackPointer(RegionOffset::new(self.addr_offset(index)));
            word.store(back.to_raw(), Ordering::Relaxed);
        }

        // Pass 2: slide live entries down.
        let mut src = heap.offset;
        let mut dest = heap.offset;
        let mut entries_live = 0;
        let mut entries_moved = 0;
        while src < top {
            match HeapWord::from_raw(self.region.atomic(src).load(Ordering::Relaxed)) {
                HeapWord::Header(dead) => src += dead.slot_size(),
                HeapWord::BackPointer(slot) if slot.is_null() => {
                    unreachable!("unwritten heap word at {src} after verification")
                }
                HeapWord::BackPointer(slot) => {
                    let slot_word = self.region.atomic(slot.as_u64());
                    let header = match HeapWord::from_raw(slot_word.load(Ordering::Relaxed)) {
                        HeapWord::Header(header) => header,
                        HeapWord::BackPointer(other) => {
                            panic!("slot field {slot} holds {other} instead of a parked header")
                        }
                    };
                    self.region
                        .atomic(src)
                        .store(header.encode(), Ordering::Relaxed);

                    let size = header.slot_size();
                    if dest != src {
                        // SAFETY: both ranges are inside the heap; `dest < src`
                        // and `ptr::copy` handles the overlap.
                        unsafe {
                            std::ptr::copy(
                                self.region.ptr(src),
                                self.region.ptr(dest),
                                size as usize,
                            );
                        }
                        entries_moved += 1;
                    }
                    slot_word.store(dest, Ordering::Release);
                    entries_live += 1;
                    dest += size;
                    src += size;
                }
            }
        }

        self.region.cell(Cell::HeapTop).store(dest, Ordering::Release);
        self.region.cell(Cell::WastedHeap).store(0, Ordering::Release);

        let report = CollectionReport {
            bytes_before,
            bytes_after: dest - heap.offset,
            entries_live,
            entries_moved,
            performed: true,
        };
        tracing::info!(
            bytes_before = report.bytes_before,
            bytes_after = report.bytes_after,
            entries_live,
            entries_moved,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Heap compacted"
        );
        Ok(report)
    }

    /// Walk `[start, top)` header by header without changing anything.
    fn verify_walkable(&self, start: u64, top: u64) -> Result<()> {
        let mut at = start;
        while at < top {
            let cause = match HeapWord::from_raw(self.region.atomic(at).load(Ordering::Relaxed)) {
                HeapWord::Header(header) if header.slot_size() == 0 => "zero-sized entry".to_string(),
                HeapWord::Header(header) if at + header.slot_size() > top => {
                    format!("entry of {} bytes runs past top {top}", header.slot_size())
                }
                HeapWord::Header(header) => {
                    at += header.slot_size();
                    continue;
                }
                HeapWord::BackPointer(word) => format!("expected an entry header, found {word}"),
            };
            let offset = RegionOffset::new(at);
            tracing::error!(%offset, %cause, "Refusing to compact unwalkable heap");
            return Err(FactHeapError::HeapCorrupt { offset, cause });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::{EntryHeader, RawBytes};
    use crate::region::{Region, RegionConfig};
    use crate::types::Fingerprint;

    fn fp(n: u64) -> Fingerprint {
        Fingerprint::new(n)
    }

    /// Every word the walk visits after compaction must be a header.
    fn heap_words(store: &HashStore<'_>) -> Vec<EntryHeader> {
        let heap = store.region.layout().heap;
        let top = store.region.cell(Cell::HeapTop).load(Ordering::Acquire);
        let mut out = Vec::new();
        let mut at = heap.offset;
        while at < top {
            match HeapWord::from_raw(store.region.atomic(at).load(Ordering::Relaxed)) {
                HeapWord::Header(header) => {
                    at += header.slot_size();
                    out.push(header);
                }
                HeapWord::BackPointer(p) => panic!("back-pointer {p} left at {at}"),
            }
        }
        out
    }

    #[test]
    fn collect_preserves_live_entries() {
        let region = Region::init(RegionConfig::testing()).unwrap();
        let heap = region.heap();
        for n in 1..=10u64 {
            heap.put(&RawBytes, fp(n), &vec![n as u8; n as usize * 3]).unwrap();
        }
        for n in [2u64, 5, 6, 9] {
            heap.remove(fp(n)).unwrap();
        }
        let used_before = heap.used_heap_size();
        let wasted = heap.wasted_heap_size();

        let report = heap.collect().unwrap();
        assert!(report.performed);
        assert_eq!(report.entries_live, 6);
        assert_eq!(report.bytes_reclaimed(), wasted);
        assert_eq!(heap.used_heap_size(), used_before - wasted);
        assert_eq!(heap.wasted_heap_size(), 0);

        for n in 1..=10u64 {
            let expected = (![2, 5, 6, 9].contains(&n)).then(|| vec![n as u8; n as usize * 3]);
            assert_eq!(heap.get(&RawBytes, fp(n)).unwrap(), expected, "key {n}");
        }
        assert_eq!(heap_words(&heap).len(), 6);
    }

    #[test]
    fn collect_without_garbage_moves_nothing() {
        let region = Region::init(RegionConfig::testing()).unwrap();
        let heap = region.heap();
        heap.put(&RawBytes, fp(1), &b"a".to_vec()).unwrap();
        heap.put(&RawBytes, fp(2), &b"b".to_vec()).unwrap();
        let report = heap.collect().unwrap();
        assert_eq!(report.entries_moved, 0);
        assert_eq!(report.bytes_reclaimed(), 0);
    }

    #[test]
    fn allocation_resumes_at_new_top() {
        let region = Region::init(RegionConfig::testing()).unwrap();
        let heap = region.heap();
        heap.put(&RawBytes, fp(1), &vec![1; 64]).unwrap();
        heap.put(&RawBytes, fp(2), &vec![2; 64]).unwrap();
        heap.remove(fp(1)).unwrap();
        heap.collect().unwrap();

        heap.put(&RawBytes, fp(3), &vec![3; 8]).unwrap();
        assert_eq!(heap.get(&RawBytes, fp(2)).unwrap(), Some(vec![2; 64]));
        assert_eq!(heap.get(&RawBytes, fp(3)).unwrap(), Some(vec![3; 8]));
        assert_eq!(heap.used_heap_size(), 72 + 16);
    }

    #[test]
    fn policy_thresholds() {
        let region = Region::init(RegionConfig::testing()).unwrap();
        let heap = region.heap();
        heap.put(&RawBytes, fp(1), &vec![1; 56]).unwrap();
        heap.put(&RawBytes, fp(2), &vec![2; 56]).unwrap();
        assert!(!heap.should_collect(&CollectPolicy::aggressive()));

        heap.remove(fp(1)).unwrap();
        assert!(heap.should_collect(&CollectPolicy::aggressive()));
        assert!(!heap.should_collect(&CollectPolicy::default()));
        assert!(heap.should_collect(
            &CollectPolicy::default()
                .with_min_reclaimable_bytes(64)
                .with_wasted_ratio(0.5)
        ));

        let skipped = heap.collect_if_needed(&CollectPolicy::default()).unwrap();
        assert!(!skipped.performed);
        let done = heap.collect_if_needed(&CollectPolicy::aggressive()).unwrap();
        assert!(done.performed);
        assert_eq!(done.bytes_reclaimed(), 64);
    }

    #[test]
    fn collect_skips_filler_after_heap_full() {
        let region = Region::init(RegionConfig::testing().with_heap_size(128)).unwrap();
        let heap = region.heap();
        heap.put(&RawBytes, fp(1), &vec![1; 40]).unwrap();
        heap.put(&RawBytes, fp(2), &vec![2; 24]).unwrap();
        assert!(heap.put(&RawBytes, fp(3), &vec![3; 64]).is_err());

        heap.remove(fp(1)).unwrap();
        let report = heap.collect().unwrap();
        assert_eq!(report.entries_live, 1);
        assert_eq!(heap.get(&RawBytes, fp(2)).unwrap(), Some(vec![2; 24]));
        assert!(heap.put(&RawBytes, fp(3), &vec![3; 64]).unwrap().is_stored());
    }

    #[test]
    fn collect_refuses_heap_with_unwritten_gap() {
        let region = Region::init(RegionConfig::testing()).unwrap();
        let heap = region.heap();
        heap.put(&RawBytes, fp(1), &vec![1; 8]).unwrap();
        // A reservation that never got a header.
        region.cell(Cell::HeapTop).fetch_add(16, Ordering::AcqRel);
        heap.put(&RawBytes, fp(2), &vec![2; 8]).unwrap();
        heap.remove(fp(1)).unwrap();
        let used = heap.used_heap_size();

        let err = heap.collect().unwrap_err();
        assert_eq!(err.code(), "E207");
        assert!(err.is_fatal());
        assert!(matches!(
            err,
            FactHeapError::HeapCorrupt { offset, .. } if offset.as_u64() == region.layout().heap.offset + 16
        ));
        assert_eq!(heap.used_heap_size(), used);
        assert_eq!(heap.get(&RawBytes, fp(2)).unwrap(), Some(vec![2; 8]));
        assert_eq!(heap.get(&RawBytes, fp(1)).unwrap(), None);
    }

    #[test]
    fn collect_skips_filled_failed_reservation() {
        let region = Region::init(RegionConfig::testing()).unwrap();
        let heap = region.heap();
        heap.put(&RawBytes, fp(1), &vec![1; 8]).unwrap();
        let gap = region.cell(Cell::HeapTop).fetch_add(16, Ordering::AcqRel);
        heap.fill_gap(gap, 16);
        heap.put(&RawBytes, fp(2), &vec![2; 8]).unwrap();
        heap.remove(fp(1)).unwrap();

        let report = heap.collect().unwrap();
        assert_eq!(report.entries_live, 1);
        assert_eq!(report.bytes_after, 16);
        assert_eq!(heap.get(&RawBytes, fp(2)).unwrap(), Some(vec![2; 8]));
        assert_eq!(heap_words(&heap).len(), 1);
    }

    #[test]
    #[should_panic(expected = "mid-publish")]
    fn collect_refuses_pending_writes() {
        let region = Region::init(RegionConfig::testing()).unwrap();
        let heap = region.heap();
        heap.put(&RawBytes, fp(1), &vec![1]).unwrap();
        heap.remove(fp(1)).unwrap();
        heap.addr_word(fp(1).as_u64() & (heap.capacity() - 1))
            .store(RegionOffset::SENTINEL.as_u64(), Ordering::Release);
        let _ = heap.collect();
    }
}
