//! Section offsets derived from a [`RegionConfig`].

use super::config::RegionConfig;
use crate::types::align_up;
use serde::Serialize;

/// Each control cell and worker-local counter sits on its own cache line.
pub const CACHE_LINE: u64 = 64;

/// Bytes per dependency table or dedup table slot.
pub const DEP_SLOT_SIZE: u64 = 8;

/// Bytes per hashtable slot: fingerprint then address.
pub const HASH_SLOT_SIZE: u64 = 16;

/// Scalar cells in the control page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u64)]
pub(crate) enum Cell {
    /// Offset of the next free heap byte.
    HeapTop = 0,
    /// Hashtable slots with a non-zero fingerprint.
    HashOccupied,
    /// Distinct edges in the dependency graph.
    DepEdges,
    /// Global request counter, handed out in batches.
    Counter,
    /// Process id of the coordinator.
    CoordinatorPid,
    /// Sampled logging level.
    LogLevel,
    /// Sample rate as f64 bits.
    SampleRate,
    /// Compression level.
    Compression,
    /// Non-zero asks workers to stop.
    WorkersShouldExit,
    /// Bytes freed by `remove` and not yet compacted.
    WastedHeap,
    /// Non-zero permits `remove` and compaction.
    AllowRemoves,
    /// Non-zero permits dependency table reads.
    AllowDepReads,
    /// Hashtable slots holding a live address.
    HashFilled,
}

impl Cell {
    /// Number of control cells.
    pub const COUNT: u64 = 13;

    /// Byte offset of the cell within the region.
    pub const fn offset(self) -> u64 {
        self as u64 * CACHE_LINE
    }
}

/// A contiguous section of the region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Section {
    /// Byte offset from the region base.
    pub offset: u64,
    /// Length in bytes.
    pub len: u64,
}

impl Section {
    /// First byte past the section.
    #[must_use]
    pub const fn end(&self) -> u64 {
        self.offset + self.len
    }
}

/// Byte offsets of every region section.
///
/// Computed, never stored: the coordinator and every worker derive it from
/// the same configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RegionLayout {
    /// Page size the layout was computed with.
    pub page_size: u64,
    /// Scalar control cells.
    pub control: Section,
    /// Per-worker counter cache lines.
    pub locals: Section,
    /// NUL-terminated path of the loaded dependency database.
    pub filename: Section,
    /// Length word followed by the global blob bytes.
    pub global: Section,
    /// Adjacency lists of the dependency graph.
    pub dep_table: Section,
    /// Edge dedup table.
    pub bindings: Section,
    /// Fingerprint to heap address table.
    pub hash_table: Section,
    /// Bump-allocated heap.
    pub heap: Section,
    /// Total region size.
    pub total: u64,
}

impl RegionLayout {
    /// Compute the layout for `config`.
    #[must_use]
    pub fn compute(config: &RegionConfig, page_size: u64) -> Self {
        let control = Section {
            offset: 0,
            len: align_up(Cell::COUNT * CACHE_LINE, page_size),
        };
        let locals = Section {
            offset: control.end(),
            len: align_up((1 + u64::from(config.num_workers)) * CACHE_LINE, page_size),
        };
        let filename = Section {
            offset: locals.end(),
            len: page_size,
        };
        let global = Section {
            offset: filename.end(),
            len: align_up(8 + config.global_size, page_size),
        };
        let dep_table = Section {
            offset: global.end(),
            len: config.dep_table_slots() * DEP_SLOT_SIZE,
        };
        let bindings = Section {
            offset: dep_table.end(),
            len: config.dep_table_slots() * DEP_SLOT_SIZE,
        };
        let hash_table = Section {
            offset: bindings.end(),
            len: config.hash_table_slots() * HASH_SLOT_SIZE,
        };
        let heap = Section {
            offset: align_up(hash_table.end(), page_size),
            len: config.heap_size,
        };

        Self {
            page_size,
            control,
            locals,
            filename,
            global,
            dep_table,
            bindings,
            hash_table,
            heap,
            total: heap.end(),
        }
    }

    /// Compute the layout for `config` with this host's page size.
    #[must_use]
    pub fn for_host(config: &RegionConfig) -> Self {
        Self::compute(config, rustix::param::page_size() as u64)
    }

    /// Offset of a worker's local counter.
    #[must_use]
    pub const fn local_counter(&self, worker: u32) -> u64 {
        self.locals.offset + worker as u64 * CACHE_LINE
    }

    /// Offset of a hashtable slot's fingerprint word.
    #[must_use]
    pub const fn hash_slot(&self, index: u64) -> u64 {
        self.hash_table.offset + index * HASH_SLOT_SIZE
    }

    /// Offset of a dependency table slot.
    #[must_use]
    pub const fn dep_slot(&self, index: u64) -> u64 {
        self.dep_table.offset + index * DEP_SLOT_SIZE
    }

    /// Offset of a dedup table slot.
    #[must_use]
    pub const fn binding_slot(&self, index: u64) -> u64 {
        self.bindings.offset + index * DEP_SLOT_SIZE
    }
}
