//! The shared memory region and its fixed section layout.
//!
//! One coordinator creates the region with [`Region::init`]; workers map the
//! same object with [`Region::attach`] using the [`ConnectorRecord`] the
//! coordinator hands them. Nothing about the layout is stored in the region
//! itself: both sides compute it from the same [`RegionConfig`].
//!
//! # Layout
//!
//! ```text
//! ┌────────────────────────────────────────────────┐ 0
//! │ Control page: one 64-byte line per cell        │
//! │   heap top │ hash occupied │ dep edges │ ...    │
//! ├────────────────────────────────────────────────┤
//! │ Worker locals: one 64-byte line per worker     │
//! ├────────────────────────────────────────────────┤
//! │ Filename page: loaded dependency database path │
//! ├────────────────────────────────────────────────┤
//! │ Global blob: u64 length │ bytes ...            │
//! ├────────────────────────────────────────────────┤
//! │ Dependency table: 2^dep_table_pow × u64        │
//! ├────────────────────────────────────────────────┤
//! │ Dedup table:      2^dep_table_pow × u64        │
//! ├────────────────────────────────────────────────┤
//! │ Hashtable: 2^hash_table_pow × (hash, addr)     │
//! ├────────────────────────────────────────────────┤
//! │ Heap: bump allocated, compacted by `collect`   │
//! └────────────────────────────────────────────────┘ total
//! ```
//!
//! All addresses stored inside the region are [`RegionOffset`]s relative to
//! its base, so processes may map it anywhere.

mod backing;
mod config;
mod control;
mod layout;

pub use backing::BackingKind;
pub use config::{
    ConnectorRecord, RegionConfig, DEFAULT_GLOBAL_SIZE, DEFAULT_HEAP_SIZE,
    DEFAULT_PUBLISH_TIMEOUT, MAX_DEP_TABLE_POW, MAX_HASH_TABLE_POW,
};
pub use control::COUNTER_RANGE;
pub use layout::{RegionLayout, Section, CACHE_LINE, DEP_SLOT_SIZE, HASH_SLOT_SIZE};

pub(crate) use layout::Cell;

use crate::error::Result;
use crate::heap::{CompressionCodec, NoCompression};
use crate::types::{align_up, RegionOffset, WorkerId};
use backing::Backing;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// A process's handle to the shared region.
///
/// Holds the mapping and every derived offset. All engine operations take a
/// `&Region`; the handle is `Send + Sync` so threads of one process may
/// share it.
pub struct Region {
    backing: Backing,
    base: std::ptr::NonNull<u8>,
    layout: RegionLayout,
    config: RegionConfig,
    worker: WorkerId,
    coordinator_pid: u32,
    /// Entries removed through this handle.
    removed: AtomicU64,
    /// Process-local switch for hashtable writes.
    hashtable_writes: AtomicBool,
    /// Process-local switch for honouring the exit flag.
    can_stop: AtomicBool,
    codec: Arc<dyn CompressionCodec>,
}

// SAFETY: the mapping is process-wide shared memory. Every mutable access
// goes through atomics or through heap ranges owned by one writer between
// claim and publish.
unsafe impl Send for Region {}
// SAFETY: see above.
unsafe impl Sync for Region {}

impl Region {
    /// Create and initialize a region. The calling process becomes the
    /// coordinator.
    pub fn init(config: RegionConfig) -> Result<Self> {
        config.validate()?;
        let started = Instant::now();

        let layout = RegionLayout::for_host(&config);
        let mut backing = Backing::create(&config, layout.total)?;
        let base = backing.base();

        let region = Self {
            backing,
            base,
            layout,
            worker: WorkerId::COORDINATOR,
            coordinator_pid: std::process::id(),
            removed: AtomicU64::new(0),
            hashtable_writes: AtomicBool::new(true),
            can_stop: AtomicBool::new(true),
            codec: Arc::new(NoCompression),
            config,
        };

        // Everything but the global blob data and the heap is touched
        // eagerly, so reserve it up front.
        region.reserve(
            RegionOffset::new(0),
            region.layout.global.offset + region.layout.page_size,
        )?;
        region.reserve(
            RegionOffset::new(region.layout.dep_table.offset),
            region.layout.hash_table.end() - region.layout.dep_table.offset,
        )?;

        region.cell(Cell::HeapTop).store(layout.heap.offset, Ordering::Relaxed);
        region
            .cell(Cell::Counter)
            .store(align_up(1, COUNTER_RANGE), Ordering::Relaxed);
        region
            .cell(Cell::CoordinatorPid)
            .store(u64::from(region.coordinator_pid), Ordering::Relaxed);
        region
            .cell(Cell::LogLevel)
            .store(region.config.log_level, Ordering::Relaxed);
        region
            .cell(Cell::SampleRate)
            .store(region.config.sample_rate.to_bits(), Ordering::Relaxed);
        region
            .cell(Cell::Compression)
            .store(region.config.compression, Ordering::Relaxed);
        region.cell(Cell::AllowRemoves).store(1, Ordering::Relaxed);
        region.cell(Cell::AllowDepReads).store(1, Ordering::Release);

        tracing::info!(
            total_bytes = layout.total,
            heap_bytes = layout.heap.len,
            hash_slots = region.config.hash_table_slots(),
            dep_slots = region.config.dep_table_slots(),
            backing = ?region.backing.kind(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Initialized shared region"
        );

        Ok(region)
    }

    /// Map a region created by another process as worker `worker`.
    pub fn attach(connector: &ConnectorRecord, worker: WorkerId) -> Result<Self> {
        connector.check_worker(worker)?;
        connector.config.validate()?;

        let layout = RegionLayout::for_host(&connector.config);
        let mut backing = Backing::attach(connector.fd, layout.total)?;
        let base = backing.base();

        tracing::info!(
            worker = %worker,
            fd = connector.fd,
            total_bytes = layout.total,
            "Attached to shared region"
        );

        Ok(Self {
            backing,
            base,
            layout,
            config: connector.config.clone(),
            worker,
            coordinator_pid: connector.coordinator_pid,
            removed: AtomicU64::new(0),
            hashtable_writes: AtomicBool::new(true),
            can_stop: AtomicBool::new(true),
            codec: Arc::new(NoCompression),
        })
    }

    /// Replace the compression codec used by this process's heap operations.
    ///
    /// Every process attached to a region must use codecs that agree on the
    /// byte format.
    pub fn with_codec(mut self, codec: Arc<dyn CompressionCodec>) -> Self {
        self.codec = codec;
        self
    }

    /// The record a worker needs to attach.
    pub fn connector(&self) -> ConnectorRecord {
        ConnectorRecord {
            config: self.config.clone(),
            fd: self.backing.fd(),
            coordinator_pid: self.coordinator_pid,
        }
    }

    /// Configuration the region was created with.
    pub fn config(&self) -> &RegionConfig {
        &self.config
    }

    /// Computed section offsets.
    pub fn layout(&self) -> &RegionLayout {
        &self.layout
    }

    /// This handle's slot in the worker array.
    pub fn worker(&self) -> WorkerId {
        self.worker
    }

    /// What backs this process's mapping.
    pub fn backing_kind(&self) -> BackingKind {
        self.backing.kind()
    }

    /// Process id of the coordinator.
    pub fn coordinator_pid(&self) -> u32 {
        self.coordinator_pid
    }

    /// True for the handle returned by [`Region::init`].
    pub fn is_coordinator(&self) -> bool {
        self.worker.is_coordinator()
    }

    /// Panic unless this handle belongs to the coordinator.
    ///
    /// Removal, move, compaction and global-slot writes have no locking;
    /// calling them anywhere else would corrupt the tables.
    #[track_caller]
    pub fn assert_coordinator(&self, operation: &str) {
        assert!(
            self.is_coordinator(),
            "{operation} is coordinator-only, called from {}",
            self.worker
        );
    }

    pub(crate) fn codec(&self) -> &dyn CompressionCodec {
        self.codec.as_ref()
    }

    pub(crate) fn removed_counter(&self) -> &AtomicU64 {
        &self.removed
    }

    pub(crate) fn hashtable_writes_allowed(&self) -> bool {
        self.hashtable_writes.load(Ordering::Relaxed)
    }

    pub(crate) fn hashtable_writes_flag(&self) -> &AtomicBool {
        &self.hashtable_writes
    }

    pub(crate) fn can_stop_flag(&self) -> &AtomicBool {
        &self.can_stop
    }

    /// Reserve backing pages for `len` bytes at `offset`.
    pub(crate) fn reserve(&self, offset: RegionOffset, len: u64) -> Result<()> {
        self.backing.reserve(offset, len)
    }

    /// The control cell `cell`.
    pub(crate) fn cell(&self, cell: Cell) -> &AtomicU64 {
        self.atomic(cell.offset())
    }

    /// The 8-byte word at `offset` viewed as an atomic.
    pub(crate) fn atomic(&self, offset: u64) -> &AtomicU64 {
        debug_assert!(offset % 8 == 0, "unaligned word at {offset}");
        debug_assert!(offset + 8 <= self.layout.total, "word {offset} out of range");
        // SAFETY: in bounds and 8-byte aligned (the mapping is page
        // aligned). AtomicU64 has the same layout as u64, and the mapping
        // lives as long as `self`.
        unsafe { &*self.base.as_ptr().add(offset as usize).cast::<AtomicU64>() }
    }

    /// Raw pointer to the byte at `offset`.
    pub(crate) fn ptr(&self, offset: u64) -> *mut u8 {
        debug_assert!(offset <= self.layout.total, "offset {offset} out of range");
        // SAFETY: in bounds of the mapping.
        unsafe { self.base.as_ptr().add(offset as usize) }
    }
}

impl std::fmt::Debug for Region {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Region")
            .field("worker", &self.worker)
            .field("total", &self.layout.total)
            .field("backing", &self.backing.kind())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_sets_control_cells() {
        let region = Region::init(RegionConfig::testing().with_sampling(1, 0.25)).unwrap();
        assert!(region.is_coordinator());
        assert_eq!(
            region.cell(Cell::HeapTop).load(Ordering::Relaxed),
            region.layout().heap.offset
        );
        assert_eq!(region.cell(Cell::Counter).load(Ordering::Relaxed), COUNTER_RANGE);
        assert_eq!(
            f64::from_bits(region.cell(Cell::SampleRate).load(Ordering::Relaxed)),
            0.25
        );
        assert_eq!(region.coordinator_pid(), std::process::id());
    }

    #[test]
    fn attach_shares_memory() {
        let region = Region::init(RegionConfig::testing()).unwrap();
        let worker = Region::attach(&region.connector(), WorkerId::new(1)).unwrap();
        assert!(!worker.is_coordinator());
        assert_eq!(worker.layout(), region.layout());

        region.cell(Cell::Counter).store(99, Ordering::Release);
        assert_eq!(worker.cell(Cell::Counter).load(Ordering::Acquire), 99);
    }

    #[test]
    fn attach_rejects_unknown_worker() {
        let region = Region::init(RegionConfig::testing().with_workers(1)).unwrap();
        let err = Region::attach(&region.connector(), WorkerId::new(2)).unwrap_err();
        assert_eq!(err.code(), "E802");
    }

    #[test]
    #[should_panic(expected = "coordinator-only")]
    fn worker_fails_coordinator_assertion() {
        let region = Region::init(RegionConfig::testing()).unwrap();
        let worker = Region::attach(&region.connector(), WorkerId::new(1)).unwrap();
        worker.assert_coordinator("remove");
    }
}
