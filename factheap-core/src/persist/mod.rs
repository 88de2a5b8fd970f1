//! On-disk formats for the dependency graph.
//!
//! - [`blob`]: headerless flat dump, fast to write and replay.
//! - [`sqlite`]: keyed database that workers can query without loading it
//!   into the shared table, plus a background [`queue`] that merges new
//!   edges into it.
//!
//! Neither format stores heap entries.

pub mod blob;
mod lookup;
pub mod queue;
pub mod sqlite;

pub use blob::{load_blob, save_blob, BlobSummary};
pub use lookup::DepLookup;
pub use queue::{EdgeBatch, QueueStats, UpdateQueue};
pub use sqlite::{
    load_dep_table, save_dep_table, DepDatabase, SaveMode, SaveSummary, SqliteDeps, VersionCheck,
    MAGIC,
};
