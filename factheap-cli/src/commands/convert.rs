//! Convert command - turn a flat blob into a SQLite dependency database.

use anyhow::{Context, Result};
use factheap_core::persist::{self, SaveMode};
use factheap_core::{Region, RegionConfig};
use std::path::Path;

const SCRATCH_HEAP_SIZE: u64 = 64 * 1024;
const SCRATCH_GLOBAL_SIZE: u64 = 4096;

/// Run the convert command.
pub fn run(blob: &Path, db: &Path, build_info: &str, dep_table_pow: u32, merge: bool) -> Result<()> {
    let config = RegionConfig::default()
        .with_dep_table_pow(dep_table_pow)
        .with_hash_table_pow(1)
        .with_heap_size(SCRATCH_HEAP_SIZE)
        .with_global_size(SCRATCH_GLOBAL_SIZE);
    let region = Region::init(config).context("Failed to create scratch region")?;

    let loaded = persist::load_blob(&region.deps(), blob)
        .with_context(|| format!("Failed to load blob: {}", blob.display()))?;
    let mode = if merge { SaveMode::Merge } else { SaveMode::Fresh };
    let saved = persist::save_dep_table(&region.deps(), db, build_info, mode)
        .with_context(|| format!("Failed to write database: {}", db.display()))?;

    println!(
        "Converted {} keys / {} edges from {} into {}",
        loaded.keys,
        loaded.edges,
        blob.display(),
        db.display()
    );
    println!(
        "Rows written: {}, new edges: {}",
        saved.keys_written, saved.edges_added
    );
    Ok(())
}
