//! Error types for factheap.
//!
//! Every failure that can reach a caller is a `FactHeapError` with a stable
//! code. Protocol violations (coordinator-only calls from a worker, vertex ids
//! out of range, reads with dependency reads disabled) are not represented
//! here: they panic, because no caller can recover from them.

use crate::types::{Fingerprint, RegionOffset};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// The main error type for factheap operations.
#[derive(Error, Debug)]
pub enum FactHeapError {
    // =========================================================================
    // Region Errors (E001-E099)
    // =========================================================================
    /// Failed to create the backing memory object.
    #[error("E001: Failed to create shared region {name}: {cause}")]
    RegionCreate {
        /// Name or directory of the backing object.
        name: String,
        /// Reason for the failure.
        cause: String,
    },

    /// Failed to map the backing memory object.
    #[error("E002: Failed to mmap shared region of {size} bytes: {cause}")]
    RegionMap {
        /// Requested mapping size.
        size: u64,
        /// Reason for the mmap failure.
        cause: String,
    },

    /// Failed to attach to a region created by another process.
    #[error("E003: Failed to attach to shared region (fd {fd}): {cause}")]
    RegionAttach {
        /// File descriptor carried by the connector record.
        fd: i32,
        /// Reason for the failure.
        cause: String,
    },

    /// Backing storage could not reserve pages for an allocation.
    #[error("E004: Out of shared memory reserving {len} bytes at {offset}: {cause}")]
    OutOfSharedMemory {
        /// Start of the range being reserved.
        offset: RegionOffset,
        /// Length of the range being reserved.
        len: u64,
        /// Reason reported by the operating system.
        cause: String,
    },

    /// No candidate shm directory had enough free space.
    #[error("E005: Not enough free space in {dir}: {available} bytes available, {required} required")]
    InsufficientShm {
        /// The directory that was checked.
        dir: PathBuf,
        /// Bytes available to unprivileged users.
        available: u64,
        /// Configured minimum.
        required: u64,
    },

    // =========================================================================
    // Dependency Graph Errors (E100-E199)
    // =========================================================================
    /// The dependency table has no room for another edge.
    #[error("E101: Dependency table full: {edges} edges stored, capacity {capacity}")]
    DepTableFull {
        /// Edges stored when the insert failed.
        edges: u64,
        /// Slot capacity of the table.
        capacity: u64,
    },

    // =========================================================================
    // Heap Errors (E200-E299)
    // =========================================================================
    /// The bump heap has no room for an entry.
    #[error("E201: Heap full: requested {requested} bytes, available {available} bytes")]
    HeapFull {
        /// Aligned bytes requested.
        requested: u64,
        /// Bytes left below the heap ceiling.
        available: u64,
    },

    /// Every hashtable slot is occupied.
    #[error("E202: Hash table full: {capacity} slots occupied")]
    HashTableFull {
        /// Slot capacity of the table.
        capacity: u64,
    },

    /// A payload exceeds the largest encodable entry size.
    #[error("E203: Payload of {size} bytes exceeds the {limit} byte entry limit")]
    PayloadTooLarge {
        /// Size of the rejected payload.
        size: u64,
        /// Largest size a header can describe.
        limit: u64,
    },

    /// A slot stayed in the write-in-progress state past the deadline.
    #[error("E204: Entry {fingerprint} not published after {waited_ms}ms; writer presumed dead")]
    PublishTimeout {
        /// Key being read.
        fingerprint: Fingerprint,
        /// How long the reader waited.
        waited_ms: u64,
    },

    /// Payload serialization or deserialization failed.
    #[error("E205: Payload serialization failed: {0}")]
    Serialization(String),

    /// Payload compression or decompression failed.
    #[error("E206: Payload compression failed: {cause}")]
    Compression {
        /// Reason reported by the codec.
        cause: String,
    },

    /// The heap holds a word that is neither an entry header nor padding.
    #[error("E207: Heap is not walkable at {offset}: {cause}")]
    HeapCorrupt {
        /// Offset of the offending word.
        offset: RegionOffset,
        /// What was found there.
        cause: String,
    },

    // =========================================================================
    // Global Slot Errors (E300-E399)
    // =========================================================================
    /// Blob does not fit in the global slot.
    #[error("E301: Global blob of {size} bytes exceeds slot capacity {capacity}")]
    GlobalBlobTooLarge {
        /// Size of the rejected blob.
        size: u64,
        /// Configured slot capacity.
        capacity: u64,
    },

    // =========================================================================
    // Control Errors (E400-E499)
    // =========================================================================
    /// The coordinator asked workers to stop.
    #[error("E401: Workers were asked to exit")]
    WorkerShouldExit,

    // =========================================================================
    // Persistence Errors (E500-E599)
    // =========================================================================
    /// Reading or writing a snapshot file failed.
    #[error("E501: Snapshot I/O failed for {path}: {cause}")]
    SnapshotIo {
        /// The snapshot path.
        path: PathBuf,
        /// Reason for the failure.
        cause: String,
    },

    /// Snapshot contents are malformed.
    #[error("E502: Snapshot {path} is corrupt: {cause}")]
    SnapshotCorrupt {
        /// The snapshot path.
        path: PathBuf,
        /// Description of the corruption.
        cause: String,
    },

    /// A fresh save targeted an existing file.
    #[error("E503: Snapshot {path} already exists")]
    SnapshotExists {
        /// The snapshot path.
        path: PathBuf,
    },

    /// The snapshot was written by a different build.
    #[error("E504: Snapshot {path} was built by '{found}', expected '{expected}'")]
    StaleSnapshot {
        /// The snapshot path.
        path: PathBuf,
        /// Build info of the running process.
        expected: String,
        /// Build info recorded in the snapshot.
        found: String,
    },

    /// The SQL layer reported an error.
    #[error("E505: SQLite error on {path}: {cause}")]
    Sqlite {
        /// The database path.
        path: PathBuf,
        /// Reason for the failure.
        cause: String,
        /// True when SQLite reported BUSY or LOCKED.
        busy: bool,
    },

    /// A database-backed query ran before any database was loaded.
    #[error("E506: No dependency database has been loaded")]
    DatabaseNotLoaded,

    /// The background update queue has shut down.
    #[error("E507: Update queue for {path} is closed")]
    QueueClosed {
        /// The database path.
        path: PathBuf,
    },

    // =========================================================================
    // Configuration Errors (E800-E899)
    // =========================================================================
    /// A configuration value is out of range.
    #[error("E802: Invalid configuration for '{field}': {cause}")]
    ConfigValue {
        /// Name of the offending field.
        field: String,
        /// Why the value was rejected.
        cause: String,
    },
}

impl FactHeapError {
    /// Get the error code (e.g., "E001").
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::RegionCreate { .. } => "E001",
            Self::RegionMap { .. } => "E002",
            Self::RegionAttach { .. } => "E003",
            Self::OutOfSharedMemory { .. } => "E004",
            Self::InsufficientShm { .. } => "E005",
            Self::DepTableFull { .. } => "E101",
            Self::HeapFull { .. } => "E201",
            Self::HashTableFull { .. } => "E202",
            Self::PayloadTooLarge { .. } => "E203",
            Self::PublishTimeout { .. } => "E204",
            Self::Serialization(_) => "E205",
            Self::Compression { .. } => "E206",
            Self::HeapCorrupt { .. } => "E207",
            Self::GlobalBlobTooLarge { .. } => "E301",
            Self::WorkerShouldExit => "E401",
            Self::SnapshotIo { .. } => "E501",
            Self::SnapshotCorrupt { .. } => "E502",
            Self::SnapshotExists { .. } => "E503",
            Self::StaleSnapshot { .. } => "E504",
            Self::Sqlite { .. } => "E505",
            Self::DatabaseNotLoaded => "E506",
            Self::QueueClosed { .. } => "E507",
            Self::ConfigValue { .. } => "E802",
        }
    }

    /// Check if this error reports an exhausted fixed-size resource.
    #[must_use]
    pub fn is_capacity_error(&self) -> bool {
        matches!(
            self,
            Self::DepTableFull { .. }
                | Self::HeapFull { .. }
                | Self::HashTableFull { .. }
                | Self::GlobalBlobTooLarge { .. }
                | Self::OutOfSharedMemory { .. }
        )
    }

    /// Check if the region can no longer be trusted after this error.
    ///
    /// A publish timeout means some writer died between claiming a slot and
    /// publishing it; that slot will never resolve. A corrupt heap cannot be
    /// compacted again.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::PublishTimeout { .. } | Self::HeapCorrupt { .. })
    }

    /// Check if this error is retriable.
    #[must_use]
    pub fn is_retriable(&self) -> bool {
        matches!(self, Self::Sqlite { busy: true, .. })
    }

    pub(crate) fn sqlite(path: &Path, err: rusqlite::Error) -> Self {
        let busy = matches!(
            err.sqlite_error_code(),
            Some(rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked)
        );
        Self::Sqlite {
            path: path.to_path_buf(),
            cause: err.to_string(),
            busy,
        }
    }
}

/// Result type alias using `FactHeapError`.
pub type Result<T> = std::result::Result<T, FactHeapError>;

/// Extension trait for attaching a snapshot path to foreign errors.
pub trait ResultExt<T> {
    /// Map the error into `SnapshotIo` for `path`.
    fn snapshot_io(self, path: &Path) -> Result<T>;

    /// Map the error into `SnapshotCorrupt` for `path`.
    fn snapshot_corrupt(self, path: &Path) -> Result<T>;
}

impl<T, E: std::fmt::Display> ResultExt<T> for std::result::Result<T, E> {
    fn snapshot_io(self, path: &Path) -> Result<T> {
        self.map_err(|e| FactHeapError::SnapshotIo {
            path: path.to_path_buf(),
            cause: e.to_string(),
        })
    }

    fn snapshot_corrupt(self, path: &Path) -> Result<T> {
        self.map_err(|e| FactHeapError::SnapshotCorrupt {
            path: path.to_path_buf(),
            cause: e.to_string(),
        })
    }
}
