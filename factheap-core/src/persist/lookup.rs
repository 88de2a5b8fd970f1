//! Combined view of in-memory and stored dependency edges.

use super::sqlite::{SqliteDeps, VersionCheck};
use crate::error::{FactHeapError, Result};
use crate::region::Region;
use crate::types::Vertex;
use std::collections::HashSet;

/// Edges from the shared table and the loaded database, as one view.
///
/// In-memory values come first (newest first), then database values not
/// already seen. Without a loaded database only the in-memory edges are
/// returned.
pub struct DepLookup<'a> {
    region: &'a Region,
    sqlite: SqliteDeps<'a>,
}

impl<'a> DepLookup<'a> {
    /// Create a lookup over `region`.
    pub fn new(region: &'a Region, check: VersionCheck) -> Self {
        Self {
            region,
            sqlite: SqliteDeps::new(region, check),
        }
    }

    /// Union of in-memory and stored values for `key`.
    pub fn get_edges(&self, key: Vertex) -> Result<Vec<Vertex>> {
        let mut values = self.region.deps().get_edges(key)?;
        let stored = match self.sqlite.get_edges(key) {
            Ok(stored) => stored,
            Err(FactHeapError::DatabaseNotLoaded) => return Ok(values),
            Err(e) => return Err(e),
        };
        let mut seen: HashSet<Vertex> = values.iter().copied().collect();
        values.extend(stored.into_iter().filter(|v| seen.insert(*v)));
        Ok(values)
    }
}
