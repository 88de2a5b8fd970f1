//! Query command - print the stored edges of one vertex.

use anyhow::{Context, Result};
use factheap_core::persist::{DepDatabase, VersionCheck};
use factheap_core::Vertex;
use std::path::Path;

/// Run the query command.
pub fn run(db: &Path, vertex: u32, ignore_version: bool, build_info: Option<String>) -> Result<()> {
    let key = Vertex::try_new(vertex)
        .with_context(|| format!("Vertex {vertex} does not fit in 31 bits"))?;
    let check = match build_info {
        Some(build) if !ignore_version => VersionCheck::Require(build),
        _ => VersionCheck::Ignore,
    };

    let database = DepDatabase::open_read_only(db, &check)
        .with_context(|| format!("Failed to open database: {}", db.display()))?;
    let edges = database.get_edges(key)?;
    tracing::info!(vertex = %key, edges = edges.len(), "Queried dependency database");

    if edges.is_empty() {
        println!("{key}: no edges");
        return Ok(());
    }
    let rendered: Vec<String> = edges.iter().map(ToString::to_string).collect();
    println!("{key}: {}", rendered.join(" "));
    Ok(())
}
