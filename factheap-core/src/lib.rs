//! factheap core library
//!
//! A shared-memory fact store for cooperating processes: one coordinator
//! creates a region, workers attach to it by file descriptor, and all of them
//! read and write the same tables without locks.
//!
//! # Key Components
//!
//! - **Region**: the mapping, its layout, and the control cells
//! - **Global**: a single broadcast blob written once by the coordinator
//! - **Deps**: a lock-free multimap of `u32` vertices
//! - **Heap**: a fingerprint-keyed store over a bump heap with a compacting collector
//! - **Persist**: flat and SQLite snapshots of the dependency graph
//!
//! # Example
//!
//! ```ignore
//! use factheap_core::prelude::*;
//!
//! let region = Region::init(RegionConfig::default().with_workers(4))?;
//! let connector = region.connector().to_json()?;
//!
//! // In a worker process:
//! let record = ConnectorRecord::from_json(&connector)?;
//! let worker = Region::attach(&record, WorkerId::new(1))?;
//! worker.deps().add_edge(Vertex::new(1), Vertex::new(2))?;
//! worker.heap().put(&RawBytes, Fingerprint::of(b"key"), &b"value".to_vec())?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod deps;
pub mod error;
pub mod global;
pub mod heap;
pub mod persist;
pub mod prelude;
pub mod region;
pub mod types;

// Re-export key types at crate root for convenience
pub use deps::{DepGraph, DepStats};
pub use error::{FactHeapError, Result};
pub use global::GlobalSlot;
pub use heap::{CollectPolicy, HashStore, PutOutcome};
pub use region::{ConnectorRecord, Region, RegionConfig};
pub use types::{Fingerprint, RegionOffset, Vertex, WorkerId};
