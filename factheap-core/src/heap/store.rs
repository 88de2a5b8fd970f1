//! The fingerprint → entry hashtable and its bump heap.

use super::codec::{Payload, PayloadSerializer};
use super::header::{EntryHeader, HEADER_SIZE, MAX_PAYLOAD_SIZE};
use crate::error::{FactHeapError, Result};
use crate::region::{Cell, Region};
use crate::types::{Fingerprint, RegionOffset};
use byteorder::{ByteOrder, LittleEndian};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Result of a `put`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    /// This call wrote the entry.
    Stored(StoredSize),
    /// Another writer holds or published the slot; nothing was written.
    AlreadyPresent,
}

impl PutOutcome {
    /// True when this call wrote the entry.
    #[must_use]
    pub fn is_stored(&self) -> bool {
        matches!(self, Self::Stored(_))
    }
}

/// Sizes of a stored entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoredSize {
    /// Payload bytes in the heap (after compression).
    pub stored: u64,
    /// Payload bytes before compression.
    pub original: u64,
    /// Heap bytes consumed, header and padding included.
    pub total: u64,
}

/// Heap and hashtable occupancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapStats {
    /// Heap bytes below the top pointer.
    pub heap_used: u64,
    /// Heap bytes held by removed entries.
    pub heap_wasted: u64,
    /// Heap size.
    pub heap_capacity: u64,
    /// Slots with a fingerprint.
    pub slots_occupied: u64,
    /// Slots with a live entry.
    pub slots_filled: u64,
    /// Hashtable size.
    pub slot_capacity: u64,
    /// Entries removed through this handle.
    pub removed: u64,
}

/// An encoded payload ready to copy into the heap.
struct Encoded {
    header: EntryHeader,
    bytes: Vec<u8>,
    original: u64,
}

/// View of the region's key-value store.
#[derive(Debug, Clone, Copy)]
pub struct HashStore<'a> {
    pub(super) region: &'a Region,
}

impl Region {
    /// The key-value heap store.
    pub fn heap(&self) -> HashStore<'_> {
        HashStore { region: self }
    }
}

impl<'a> HashStore<'a> {
    /// Number of hashtable slots.
    pub fn capacity(&self) -> u64 {
        self.region.config().hash_table_slots()
    }

    fn mask(&self) -> u64 {
        self.capacity() - 1
    }

    pub(super) fn hash_word(&self, index: u64) -> &'a AtomicU64 {
        self.region.atomic(self.region.layout().hash_slot(index))
    }

    pub(super) fn addr_offset(&self, index: u64) -> u64 {
        self.region.layout().hash_slot(index) + 8
    }

    pub(super) fn addr_word(&self, index: u64) -> &'a AtomicU64 {
        self.region.atomic(self.addr_offset(index))
    }

    fn full(&self) -> FactHeapError {
        FactHeapError::HashTableFull {
            capacity: self.capacity(),
        }
    }

    // =========================================================================
    // Probing
    // =========================================================================

    /// Slot holding `key`, or `None` once an empty slot or a full wrap is hit.
    fn find(&self, key: Fingerprint) -> Option<u64> {
        let init = key.as_u64() & self.mask();
        let mut index = init;
        loop {
            match self.hash_word(index).load(Ordering::Acquire) {
                h if h == key.as_u64() => return Some(index),
                0 => return None,
                _ => {}
            }
            index = (index + 1) & self.mask();
            if index == init {
                return None;
            }
        }
    }

    /// Slot holding `key`, claiming an empty one if needed.
    fn claim(&self, key: Fingerprint) -> Result<u64> {
        let init = key.as_u64() & self.mask();
        let mut index = init;
        let occupied = self.region.cell(Cell::HashOccupied);

        loop {
            let current = self.hash_word(index).load(Ordering::Acquire);
            if current == key.as_u64() {
                return Ok(index);
            }
            if occupied.load(Ordering::Relaxed) >= self.capacity() {
                return Err(self.full());
            }
            if current == 0 {
                match self.hash_word(index).compare_exchange(
                    0,
                    key.as_u64(),
                    Ordering::AcqRel,
                    Ordering::Acquire,
                ) {
                    Ok(_) => {
                        occupied.fetch_add(1, Ordering::Relaxed);
                        tracing::trace!(
                            fingerprint = %key,
                            slot = index,
                            probes = index.wrapping_sub(init) & self.mask(),
                            "Claimed hashtable slot"
                        );
                        return Ok(index);
                    }
                    Err(actual) if actual == key.as_u64() => return Ok(index),
                    Err(_) => {}
                }
            }
            index = (index + 1) & self.mask();
            if index == init {
                return Err(self.full());
            }
        }
    }

    /// Address of `key`'s entry, waiting out an in-progress write.
    fn resolve(&self, key: Fingerprint) -> Result<Option<RegionOffset>> {
        let Some(index) = self.find(key) else {
            return Ok(None);
        };
        let addr = self.addr_word(index);
        let timeout = self.region.config().publish_timeout;
        let started = Instant::now();
        let mut backoff = Backoff::new();

        loop {
            let offset = RegionOffset::new(addr.load(Ordering::Acquire));
            if !offset.is_sentinel() {
                return Ok((!offset.is_null()).then_some(offset));
            }
            let waited = started.elapsed();
            if waited >= timeout {
                tracing::error!(
                    fingerprint = %key,
                    waited_ms = waited.as_millis() as u64,
                    "Entry never published"
                );
                return Err(FactHeapError::PublishTimeout {
                    fingerprint: key,
                    waited_ms: waited.as_millis() as u64,
                });
            }
            backoff.snooze();
        }
    }

    // =========================================================================
    // Heap
    // =========================================================================

    /// Bump-allocate `size` aligned bytes.
    fn alloc(&self, size: u64) -> Result<RegionOffset> {
        let heap = self.region.layout().heap;
        let top = self.region.cell(Cell::HeapTop).fetch_add(size, Ordering::AcqRel);
        if top + size > heap.end() {
            if top < heap.end() {
                self.fill_gap(top, heap.end() - top);
            }
            return Err(FactHeapError::HeapFull {
                requested: size,
                available: heap.end().saturating_sub(top),
            });
        }
        let offset = RegionOffset::new(top);
        if let Err(e) = self.region.reserve(offset, size) {
            self.fill_gap(top, size);
            return Err(e);
        }
        Ok(offset)
    }

    /// Mark `[start, start + len)` as a dead entry so compaction can walk it.
    pub(super) fn fill_gap(&self, start: u64, len: u64) {
        if self.region.reserve(RegionOffset::new(start), HEADER_SIZE).is_ok() {
            self.region
                .atomic(start)
                .store(EntryHeader::filler(len).encode(), Ordering::Relaxed);
        }
    }

    fn encode(&self, payload: Payload) -> Result<Encoded> {
        let original = payload.bytes.len() as u64;
        if original > MAX_PAYLOAD_SIZE {
            return Err(FactHeapError::PayloadTooLarge {
                size: original,
                limit: MAX_PAYLOAD_SIZE,
            });
        }

        if self.region.compression() > 0 {
            if let Some(compressed) = self.region.codec().compress(&payload.bytes) {
                if compressed.len() < payload.bytes.len() {
                    return Ok(Encoded {
                        header: EntryHeader::new(
                            compressed.len() as u64,
                            payload.kind,
                            Some(original),
                        ),
                        bytes: compressed,
                        original,
                    });
                }
            }
        }

        Ok(Encoded {
            header: EntryHeader::new(original, payload.kind, None),
            bytes: payload.bytes,
            original,
        })
    }

    fn decode(&self, header: EntryHeader, bytes: Vec<u8>) -> Result<Vec<u8>> {
        match header.original_size() {
            Some(original) => self.region.codec().decompress(&bytes, original as usize),
            None => Ok(bytes),
        }
    }

    /// Header and payload of the entry at `offset`.
    pub(super) fn read_header(&self, offset: RegionOffset) -> EntryHeader {
        let word = self.region.atomic(offset.as_u64()).load(Ordering::Relaxed);
        match EntryHeader::decode(word) {
            Ok(header) => header,
            Err(cause) => panic!("corrupt heap entry at {offset}: {cause}"),
        }
    }

    pub(super) fn read_entry(&self, offset: RegionOffset) -> (EntryHeader, Vec<u8>) {
        let header = self.read_header(offset);
        let mut bytes = vec![0u8; header.size() as usize];
        // SAFETY: a published entry is immutable and lies inside the heap.
        unsafe {
            std::ptr::copy_nonoverlapping(
                self.region.ptr(offset.as_u64() + HEADER_SIZE),
                bytes.as_mut_ptr(),
                bytes.len(),
            );
        }
        (header, bytes)
    }

    /// Claim the address of slot `index` and publish an entry into it.
    ///
    /// `produce` only runs for the writer that wins the claim.
    fn write_at(
        &self,
        index: u64,
        key: Fingerprint,
        produce: impl FnOnce() -> Result<Encoded>,
    ) -> Result<PutOutcome> {
        let addr = self.addr_word(index);
        if addr
            .compare_exchange(
                RegionOffset::NULL.as_u64(),
                RegionOffset::SENTINEL.as_u64(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return Ok(PutOutcome::AlreadyPresent);
        }

        let written = produce().and_then(|encoded| {
            let total = encoded.header.slot_size();
            let offset = self.alloc(total)?;
            // SAFETY: `offset..offset + total` was just allocated to this
            // writer and is invisible to readers until the address store.
            unsafe {
                let dst = self.region.ptr(offset.as_u64());
                dst.cast::<u64>().write(encoded.header.encode());
                std::ptr::copy_nonoverlapping(
                    encoded.bytes.as_ptr(),
                    dst.add(HEADER_SIZE as usize),
                    encoded.bytes.len(),
                );
            }
            Ok((
                offset,
                StoredSize {
                    stored: encoded.header.size(),
                    original: encoded.original,
                    total,
                },
            ))
        });

        match written {
            Ok((offset, size)) => {
                addr.store(offset.as_u64(), Ordering::Release);
                self.region
                    .cell(Cell::HashFilled)
                    .fetch_add(1, Ordering::Relaxed);
                if self.region.should_sample() {
                    tracing::debug!(
                        fingerprint = %key,
                        stored = size.stored,
                        original = size.original,
                        total = size.total,
                        "Sampled put"
                    );
                }
                Ok(PutOutcome::Stored(size))
            }
            Err(e) => {
                // Release the claim so readers do not wait for a write that
                // will never happen.
                addr.store(RegionOffset::NULL.as_u64(), Ordering::Release);
                Err(e)
            }
        }
    }

    #[track_caller]
    fn assert_writable(&self) {
        assert!(
            self.region.hashtable_writes_allowed(),
            "hashtable writes are disabled for this process"
        );
    }

    // =========================================================================
    // Public operations
    // =========================================================================

    /// Store `value` under `key` unless the key already holds an entry.
    ///
    /// When several writers race on the same key exactly one stores; the
    /// rest get [`PutOutcome::AlreadyPresent`]. A key whose entry was
    /// removed may be stored again.
    pub fn put<S: PayloadSerializer>(
        &self,
        serializer: &S,
        key: Fingerprint,
        value: &S::Value,
    ) -> Result<PutOutcome> {
        self.region.check_should_exit()?;
        self.assert_writable();
        let index = self.claim(key)?;
        self.write_at(index, key, || self.encode(serializer.serialize(value)?))
    }

    /// Fetch and decode the value under `key`.
    pub fn get<S: PayloadSerializer>(
        &self,
        serializer: &S,
        key: Fingerprint,
    ) -> Result<Option<S::Value>> {
        self.region.check_should_exit()?;
        let Some(offset) = self.resolve(key)? else {
            return Ok(None);
        };
        let (header, bytes) = self.read_entry(offset);
        if self.region.should_sample() {
            tracing::debug!(fingerprint = %key, stored = header.size(), "Sampled get");
        }
        let bytes = self.decode(header, bytes)?;
        serializer.deserialize(&bytes, header.kind()).map(Some)
    }

    /// True when `key` holds a published entry.
    pub fn contains(&self, key: Fingerprint) -> Result<bool> {
        self.region.check_should_exit()?;
        Ok(self.resolve(key)?.is_some())
    }

    /// Stored (possibly compressed) payload size of `key`'s entry.
    pub fn entry_size(&self, key: Fingerprint) -> Result<Option<u64>> {
        self.region.check_should_exit()?;
        Ok(self
            .resolve(key)?
            .map(|offset| self.read_entry(offset).0.size()))
    }

    /// The whole entry under `key`, header included, as stored.
    ///
    /// Lets a process ship an entry elsewhere without decoding it.
    pub fn get_raw(&self, key: Fingerprint) -> Result<Option<Vec<u8>>> {
        self.region.check_should_exit()?;
        Ok(self.resolve(key)?.map(|offset| {
            let (header, payload) = self.read_entry(offset);
            let mut entry = vec![0u8; HEADER_SIZE as usize];
            LittleEndian::write_u64(&mut entry, header.encode());
            entry.extend_from_slice(&payload);
            entry
        }))
    }

    /// Store an entry produced by [`HashStore::get_raw`] verbatim.
    pub fn put_raw(&self, key: Fingerprint, entry: &[u8]) -> Result<PutOutcome> {
        self.region.check_should_exit()?;
        self.assert_writable();
        let (header, payload) = split_raw(entry)?;
        let index = self.claim(key)?;
        self.write_at(index, key, || {
            Ok(Encoded {
                header,
                bytes: payload.to_vec(),
                original: header.original_size().unwrap_or(header.size()),
            })
        })
    }

    /// Decode an entry produced by [`HashStore::get_raw`].
    pub fn decode_raw<S: PayloadSerializer>(&self, serializer: &S, entry: &[u8]) -> Result<S::Value> {
        let (header, payload) = split_raw(entry)?;
        let bytes = self.decode(header, payload.to_vec())?;
        serializer.deserialize(&bytes, header.kind())
    }

    /// Drop `key`'s entry, returning its stored size.
    ///
    /// The fingerprint stays in the slot; the heap bytes are counted as
    /// wasted until the next [`HashStore::collect`].
    ///
    /// # Panics
    /// Panics outside the coordinator, while removes are disabled, or if
    /// `key` holds no entry.
    pub fn remove(&self, key: Fingerprint) -> Result<u64> {
        self.region.assert_coordinator("remove");
        assert!(self.region.allow_removes(), "removes are disabled");
        let Some(index) = self.find(key) else {
            panic!("remove of absent key {key}");
        };
        let offset = RegionOffset::new(self.addr_word(index).load(Ordering::Acquire));
        assert!(offset.is_entry(), "remove of absent key {key}");

        let header = self.read_header(offset);
        self.region
            .cell(Cell::WastedHeap)
            .fetch_add(header.slot_size(), Ordering::Relaxed);
        self.addr_word(index)
            .store(RegionOffset::NULL.as_u64(), Ordering::Release);
        self.region
            .cell(Cell::HashFilled)
            .fetch_sub(1, Ordering::Relaxed);
        self.region.removed_counter().fetch_add(1, Ordering::Relaxed);
        Ok(header.size())
    }

    /// Re-key the entry under `from` to `to`.
    ///
    /// # Panics
    /// Panics outside the coordinator, if `from` holds no entry, or if `to`
    /// already holds one.
    pub fn move_entry(&self, from: Fingerprint, to: Fingerprint) -> Result<()> {
        self.region.assert_coordinator("move");
        let source = self
            .find(from)
            .filter(|&i| RegionOffset::new(self.addr_word(i).load(Ordering::Acquire)).is_entry());
        let Some(source) = source else {
            panic!("move from absent key {from}");
        };

        let target = self.claim(to)?;
        let target_addr = self.addr_word(target);
        assert!(
            target_addr.load(Ordering::Acquire) == RegionOffset::NULL.as_u64(),
            "move target {to} already holds an entry"
        );

        let entry = self.addr_word(source).load(Ordering::Acquire);
        target_addr.store(entry, Ordering::Release);
        self.addr_word(source)
            .store(RegionOffset::NULL.as_u64(), Ordering::Release);
        Ok(())
    }

    // =========================================================================
    // Statistics
    // =========================================================================

    /// Heap bytes below the top pointer.
    pub fn used_heap_size(&self) -> u64 {
        let heap = self.region.layout().heap;
        let top = self.region.cell(Cell::HeapTop).load(Ordering::Acquire);
        top.min(heap.end()) - heap.offset
    }

    /// Heap bytes held by removed entries.
    pub fn wasted_heap_size(&self) -> u64 {
        self.region.cell(Cell::WastedHeap).load(Ordering::Acquire)
    }

    /// True once an allocation has pushed the top past the heap's end.
    pub fn check_heap_overflow(&self) -> bool {
        self.region.cell(Cell::HeapTop).load(Ordering::Acquire) >= self.region.layout().heap.end()
    }

    /// Occupancy summary.
    pub fn stats(&self) -> HeapStats {
        HeapStats {
            heap_used: self.used_heap_size(),
            heap_wasted: self.wasted_heap_size(),
            heap_capacity: self.region.layout().heap.len,
            slots_occupied: self
                .region
                .cell(Cell::HashOccupied)
                .load(Ordering::Relaxed),
            slots_filled: self.region.cell(Cell::HashFilled).load(Ordering::Relaxed),
            slot_capacity: self.capacity(),
            removed: self.region.removed_counter().load(Ordering::Relaxed),
        }
    }
}

/// Split a raw entry into its header and payload.
fn split_raw(entry: &[u8]) -> Result<(EntryHeader, &[u8])> {
    if entry.len() < HEADER_SIZE as usize {
        return Err(FactHeapError::Serialization(format!(
            "raw entry of {} bytes has no header",
            entry.len()
        )));
    }
    let (word, payload) = entry.split_at(HEADER_SIZE as usize);
    let header = EntryHeader::decode(LittleEndian::read_u64(word))
        .map_err(|cause| FactHeapError::Serialization(cause.to_string()))?;
    if header.size() != payload.len() as u64 {
        return Err(FactHeapError::Serialization(format!(
            "raw entry header claims {} bytes, {} present",
            header.size(),
            payload.len()
        )));
    }
    Ok((header, payload))
}

/// Spin, then yield, then sleep between polls of a contended word.
struct Backoff {
    step: u32,
}

impl Backoff {
    const SPIN_LIMIT: u32 = 6;
    const YIELD_LIMIT: u32 = 10;

    fn new() -> Self {
        Self { step: 0 }
    }

    fn snooze(&mut self) {
        if self.step <= Self::SPIN_LIMIT {
            for _ in 0..(1 << self.step) {
                std::hint::spin_loop();
            }
        } else if self.step <= Self::YIELD_LIMIT {
            std::thread::yield_now();
        } else {
            std::thread::sleep(Duration::from_micros(100));
        }
        self.step = self.step.saturating_add(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::{JsonSerializer, RawBytes};
    use crate::region::RegionConfig;
    use crate::types::WorkerId;

    fn region() -> Region {
        Region::init(RegionConfig::testing()).unwrap()
    }

    fn fp(n: u64) -> Fingerprint {
        Fingerprint::new(n)
    }

    #[test]
    fn put_then_get() {
        let region = region();
        let heap = region.heap();
        let outcome = heap.put(&RawBytes, fp(42), &b"hello".to_vec()).unwrap();
        assert_eq!(
            outcome,
            PutOutcome::Stored(StoredSize {
                stored: 5,
                original: 5,
                total: 16
            })
        );
        assert_eq!(heap.get(&RawBytes, fp(42)).unwrap(), Some(b"hello".to_vec()));
        assert_eq!(heap.get(&RawBytes, fp(43)).unwrap(), None);
        assert!(heap.contains(fp(42)).unwrap());
        assert_eq!(heap.entry_size(fp(42)).unwrap(), Some(5));
    }

    #[test]
    fn second_put_is_a_no_op() {
        let region = region();
        let heap = region.heap();
        assert!(heap.put(&RawBytes, fp(7), &b"first".to_vec()).unwrap().is_stored());
        assert_eq!(
            heap.put(&RawBytes, fp(7), &b"second".to_vec()).unwrap(),
            PutOutcome::AlreadyPresent
        );
        assert_eq!(heap.get(&RawBytes, fp(7)).unwrap(), Some(b"first".to_vec()));
        assert_eq!(heap.stats().slots_filled, 1);
    }

    #[test]
    fn json_values() {
        let region = region();
        let heap = region.heap();
        let serializer = JsonSerializer::<Vec<String>>::new();
        let value = vec!["a".to_string(), "b".to_string()];
        heap.put(&serializer, Fingerprint::of("k"), &value).unwrap();
        assert_eq!(heap.get(&serializer, Fingerprint::of("k")).unwrap(), Some(value));
    }

    #[test]
    fn worker_sees_coordinator_entries() {
        let region = region();
        let worker = Region::attach(&region.connector(), WorkerId::new(1)).unwrap();
        worker.heap().put(&RawBytes, fp(5), &vec![9; 100]).unwrap();
        assert_eq!(region.heap().get(&RawBytes, fp(5)).unwrap(), Some(vec![9; 100]));
    }

    #[test]
    fn remove_then_reinsert() {
        let region = region();
        let heap = region.heap();
        heap.put(&RawBytes, fp(3), &vec![1; 20]).unwrap();
        assert_eq!(heap.remove(fp(3)).unwrap(), 20);

        let stats = heap.stats();
        assert_eq!(stats.heap_wasted, 32);
        assert_eq!(stats.slots_filled, 0);
        assert_eq!(stats.slots_occupied, 1);
        assert_eq!(stats.removed, 1);
        assert!(!heap.contains(fp(3)).unwrap());

        assert!(heap.put(&RawBytes, fp(3), &vec![2; 4]).unwrap().is_stored());
        assert_eq!(heap.get(&RawBytes, fp(3)).unwrap(), Some(vec![2; 4]));
        assert_eq!(heap.stats().slots_occupied, 1);
    }

    #[test]
    fn remove_accounts_large_entry_from_header() {
        let region = region();
        let heap = region.heap();
        heap.put(&RawBytes, fp(4), &vec![7; 64 * 1024]).unwrap();
        assert_eq!(heap.remove(fp(4)).unwrap(), 64 * 1024);
        assert_eq!(heap.wasted_heap_size(), 64 * 1024 + HEADER_SIZE);
    }

    #[test]
    #[should_panic(expected = "corrupt heap entry")]
    fn remove_rejects_missing_header() {
        let region = region();
        let heap = region.heap();
        heap.put(&RawBytes, fp(4), &vec![7; 8]).unwrap();
        region.atomic(region.layout().heap.offset).store(0, Ordering::Relaxed);
        let _ = heap.remove(fp(4));
    }

    #[test]
    #[should_panic(expected = "removes are disabled")]
    fn remove_requires_permission() {
        let region = region();
        region.heap().put(&RawBytes, fp(3), &vec![1]).unwrap();
        region.set_allow_removes(false);
        let _ = region.heap().remove(fp(3));
    }

    #[test]
    #[should_panic(expected = "coordinator-only")]
    fn worker_cannot_remove() {
        let region = region();
        let worker = Region::attach(&region.connector(), WorkerId::new(1)).unwrap();
        worker.heap().put(&RawBytes, fp(3), &vec![1]).unwrap();
        let _ = worker.heap().remove(fp(3));
    }

    #[test]
    fn move_entry_rekeys() {
        let region = region();
        let heap = region.heap();
        heap.put(&RawBytes, fp(10), &b"payload".to_vec()).unwrap();
        heap.move_entry(fp(10), fp(11)).unwrap();

        assert_eq!(heap.get(&RawBytes, fp(10)).unwrap(), None);
        assert_eq!(heap.get(&RawBytes, fp(11)).unwrap(), Some(b"payload".to_vec()));
        assert_eq!(heap.stats().slots_occupied, 2);
    }

    #[test]
    #[should_panic(expected = "already holds an entry")]
    fn move_onto_live_key_panics() {
        let region = region();
        let heap = region.heap();
        heap.put(&RawBytes, fp(10), &b"a".to_vec()).unwrap();
        heap.put(&RawBytes, fp(11), &b"b".to_vec()).unwrap();
        let _ = heap.move_entry(fp(10), fp(11));
    }

    #[test]
    fn raw_entries_roundtrip_between_regions() {
        let source = region();
        let target = region();
        let serializer = JsonSerializer::<(u32, String)>::new();
        source
            .heap()
            .put(&serializer, fp(1), &(4, "four".to_string()))
            .unwrap();

        let entry = source.heap().get_raw(fp(1)).unwrap().unwrap();
        assert_eq!(
            source.heap().decode_raw(&serializer, &entry).unwrap(),
            (4, "four".to_string())
        );
        target.heap().put_raw(fp(1), &entry).unwrap();
        assert_eq!(
            target.heap().get(&serializer, fp(1)).unwrap(),
            Some((4, "four".to_string()))
        );
    }

    #[test]
    fn malformed_raw_entry_is_rejected() {
        let region = region();
        let err = region.heap().put_raw(fp(1), &[1, 2, 3]).unwrap_err();
        assert_eq!(err.code(), "E205");
        // Nothing was claimed.
        assert_eq!(region.heap().stats().slots_occupied, 0);
    }

    #[test]
    fn hashtable_full_keeps_prior_entries() {
        let region = Region::init(RegionConfig::testing().with_hash_table_pow(4)).unwrap();
        let heap = region.heap();
        for n in 1..=16 {
            heap.put(&RawBytes, fp(n), &n.to_le_bytes().to_vec()).unwrap();
        }
        let err = heap.put(&RawBytes, fp(17), &vec![0]).unwrap_err();
        assert!(matches!(err, FactHeapError::HashTableFull { capacity: 16 }));
        for n in 1..=16 {
            assert_eq!(heap.get(&RawBytes, fp(n)).unwrap(), Some(n.to_le_bytes().to_vec()));
        }
    }

    #[test]
    fn heap_full_releases_claim() {
        let region = Region::init(RegionConfig::testing().with_heap_size(64)).unwrap();
        let heap = region.heap();
        heap.put(&RawBytes, fp(1), &vec![0; 40]).unwrap();
        let err = heap.put(&RawBytes, fp(2), &vec![0; 40]).unwrap_err();
        assert!(matches!(err, FactHeapError::HeapFull { .. }));
        assert!(heap.check_heap_overflow());

        // The failed key reads as absent rather than stuck mid-publish.
        assert_eq!(heap.get(&RawBytes, fp(2)).unwrap(), None);
        assert_eq!(heap.get(&RawBytes, fp(1)).unwrap(), Some(vec![0; 40]));
    }

    #[test]
    fn stuck_writer_times_out() {
        let region = Region::init(
            RegionConfig::testing().with_publish_timeout(Duration::from_millis(20)),
        )
        .unwrap();
        let heap = region.heap();
        let index = heap.claim(fp(9)).unwrap();
        heap.addr_word(index)
            .store(RegionOffset::SENTINEL.as_u64(), Ordering::Release);

        let err = heap.get(&RawBytes, fp(9)).unwrap_err();
        assert!(err.is_fatal());
        assert!(matches!(err, FactHeapError::PublishTimeout { .. }));
    }

    #[test]
    #[should_panic(expected = "hashtable writes are disabled")]
    fn per_process_write_switch() {
        let region = region();
        region.set_allow_hashtable_writes_by_current_process(false);
        let _ = region.heap().put(&RawBytes, fp(1), &vec![1]);
    }

    #[test]
    fn exit_flag_interrupts_workers() {
        let region = region();
        let worker = Region::attach(&region.connector(), WorkerId::new(1)).unwrap();
        region.stop_workers();
        let err = worker.heap().put(&RawBytes, fp(1), &vec![1]).unwrap_err();
        assert!(matches!(err, FactHeapError::WorkerShouldExit));
        region.resume_workers();
        assert!(worker.heap().put(&RawBytes, fp(1), &vec![1]).unwrap().is_stored());
    }
}
