//! Flat binary dump of the dependency graph.
//!
//! The file is a sequence of little-endian `u32` words, one run per key:
//!
//! ```text
//! key|TAG  value|TAG  value|TAG ... value
//! ```
//!
//! The key and every value but the last carry the tag bit (bit 31); the
//! untagged value ends the run. There is no header; loading replays each
//! run through [`DepGraph::add_edge`].

use crate::deps::DepGraph;
use crate::error::{FactHeapError, Result, ResultExt};
use crate::types::Vertex;
use byteorder::{ByteOrder, LittleEndian, WriteBytesExt};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::time::Instant;

const TAG: u32 = 1 << 31;

/// What a blob save or load covered.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BlobSummary {
    /// Runs (keys) in the file.
    pub keys: u64,
    /// Values in the file. On load, only values that were new edges.
    pub edges: u64,
    /// File size in bytes.
    pub bytes: u64,
}

/// Write every edge list to `path`, optionally clearing the graph afterwards.
pub fn save_blob(graph: &DepGraph<'_>, path: &Path, reset_after: bool) -> Result<BlobSummary> {
    let started = Instant::now();
    let file = File::create(path).snapshot_io(path)?;
    let mut out = BufWriter::new(file);
    let mut summary = BlobSummary::default();

    graph.for_each_list(|key, values| {
        out.write_u32::<LittleEndian>(key.as_u32() | TAG)
            .snapshot_io(path)?;
        let last = values.len().saturating_sub(1);
        for (i, value) in values.iter().enumerate() {
            let word = if i == last {
                value.as_u32()
            } else {
                value.as_u32() | TAG
            };
            out.write_u32::<LittleEndian>(word).snapshot_io(path)?;
        }
        summary.keys += 1;
        summary.edges += values.len() as u64;
        Ok(())
    })?;
    out.flush().snapshot_io(path)?;
    summary.bytes = (summary.keys + summary.edges) * 4;

    if reset_after {
        graph.reset();
    }

    tracing::info!(
        path = %path.display(),
        keys = summary.keys,
        edges = summary.edges,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "Saved dependency blob"
    );
    Ok(summary)
}

/// Replay a blob written by [`save_blob`] into `graph`.
pub fn load_blob(graph: &DepGraph<'_>, path: &Path) -> Result<BlobSummary> {
    let started = Instant::now();
    let data = std::fs::read(path).snapshot_io(path)?;
    let corrupt = |cause: String| FactHeapError::SnapshotCorrupt {
        path: path.to_path_buf(),
        cause,
    };
    if data.len() % 4 != 0 {
        return Err(corrupt(format!("length {} is not a multiple of 4", data.len())));
    }

    let mut summary = BlobSummary {
        bytes: data.len() as u64,
        ..BlobSummary::default()
    };
    let mut key: Option<Vertex> = None;
    for (index, chunk) in data.chunks_exact(4).enumerate() {
        let word = LittleEndian::read_u32(chunk);
        let vertex = Vertex::new(word & !TAG);
        let tagged = word & TAG != 0;
        match key {
            None if tagged => key = Some(vertex),
            None => {
                return Err(corrupt(format!("word {index} should start a run but is untagged")));
            }
            Some(k) => {
                if graph.add_edge(k, vertex)? {
                    summary.edges += 1;
                }
                if !tagged {
                    key = None;
                    summary.keys += 1;
                }
            }
        }
    }
    if let Some(k) = key {
        return Err(corrupt(format!("run for {k} is truncated")));
    }

    tracing::info!(
        path = %path.display(),
        keys = summary.keys,
        edges = summary.edges,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "Loaded dependency blob"
    );
    Ok(summary)
}
