//! Prelude for convenient imports.
//!
//! # Example
//!
//! ```ignore
//! use factheap_core::prelude::*;
//! ```

// Core types
pub use crate::types::{Fingerprint, RegionOffset, Vertex, WorkerId};

// Error handling
pub use crate::error::{FactHeapError, Result, ResultExt};

// Region
pub use crate::region::{BackingKind, ConnectorRecord, Region, RegionConfig, RegionLayout};

// Shared tables
pub use crate::deps::{DepGraph, DepStats};
pub use crate::global::GlobalSlot;
pub use crate::heap::{
    CollectPolicy, CollectionReport, CompressionCodec, EntryKind, HashStore, HeapStats,
    JsonSerializer, NoCompression, Payload, PayloadSerializer, PutOutcome, RawBytes, StoredSize,
};

// Persistence
pub use crate::persist::{
    load_blob, load_dep_table, save_blob, save_dep_table, DepDatabase, DepLookup, EdgeBatch,
    SaveMode, SqliteDeps, UpdateQueue, VersionCheck,
};
