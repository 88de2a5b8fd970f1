//! SQLite dependency database.
//!
//! Two tables: a one-row `HEADER` carrying the magic constant and the build
//! that wrote the file, and `DEPTABLE` mapping each key vertex to a blob of
//! little-endian `u32` values.

use crate::deps::DepGraph;
use crate::error::{FactHeapError, Result, ResultExt};
use crate::region::Region;
use crate::types::Vertex;
use byteorder::{ByteOrder, LittleEndian};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OpenFlags, OptionalExtension, Transaction};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Instant;

/// Magic constant in the `HEADER` table.
pub const MAGIC: u64 = 0xface_face_face_b000;

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS HEADER (
        MAGIC_CONSTANT INTEGER PRIMARY KEY NOT NULL,
        BUILDINFO      TEXT NOT NULL
    );
    CREATE TABLE IF NOT EXISTS DEPTABLE (
        KEY_VERTEX   INTEGER PRIMARY KEY NOT NULL,
        VALUE_VERTEX BLOB NOT NULL
    );
";

/// How `save_dep_table` treats an existing file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveMode {
    /// Refuse to touch an existing file.
    Fresh,
    /// Union the graph into whatever the file already holds.
    Merge,
}

/// Whether opening a database checks the build that wrote it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VersionCheck {
    /// Reject files written by any other build.
    Require(String),
    /// Accept any build.
    Ignore,
}

/// Rows and edges written by a save.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SaveSummary {
    /// Keys whose row was inserted or rewritten.
    pub keys_written: u64,
    /// Values that were not already stored.
    pub edges_added: u64,
}

/// Write the graph to `path` in one transaction.
pub fn save_dep_table(
    graph: &DepGraph<'_>,
    path: &Path,
    build_info: &str,
    mode: SaveMode,
) -> Result<SaveSummary> {
    let started = Instant::now();
    if mode == SaveMode::Fresh && path.exists() {
        return Err(FactHeapError::SnapshotExists {
            path: path.to_path_buf(),
        });
    }

    let mut conn = Connection::open(path).map_err(|e| FactHeapError::sqlite(path, e))?;
    conn.execute_batch(
        "PRAGMA synchronous = OFF;
         PRAGMA journal_mode = MEMORY;",
    )
    .map_err(|e| FactHeapError::sqlite(path, e))?;
    init_schema(&conn, path, build_info)?;

    let mut rows = Vec::new();
    graph.for_each_list(|key, values| {
        rows.push((key, values.to_vec()));
        Ok(())
    })?;

    let tx = conn.transaction().map_err(|e| FactHeapError::sqlite(path, e))?;
    let summary = merge_rows(&tx, path, rows, mode)?;
    tx.commit().map_err(|e| FactHeapError::sqlite(path, e))?;

    tracing::info!(
        path = %path.display(),
        keys = summary.keys_written,
        edges_added = summary.edges_added,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "Saved dependency database"
    );
    Ok(summary)
}

/// Create the tables if needed and stamp the header.
pub(crate) fn init_schema(conn: &Connection, path: &Path, build_info: &str) -> Result<()> {
    conn.execute_batch(SCHEMA)
        .map_err(|e| FactHeapError::sqlite(path, e))?;
    conn.execute(
        "INSERT OR REPLACE INTO HEADER (MAGIC_CONSTANT, BUILDINFO) VALUES (?1, ?2)",
        params![MAGIC as i64, build_info],
    )
    .map_err(|e| FactHeapError::sqlite(path, e))?;
    Ok(())
}

/// Write `rows` inside `tx`.
///
/// `Fresh` inserts each row as given. `Merge` appends only the values a row
/// does not already hold, keeping the stored order first.
pub(crate) fn merge_rows(
    tx: &Transaction<'_>,
    path: &Path,
    rows: impl IntoIterator<Item = (Vertex, Vec<Vertex>)>,
    mode: SaveMode,
) -> Result<SaveSummary> {
    let sql = |e| FactHeapError::sqlite(path, e);
    let mut select = tx
        .prepare_cached("SELECT VALUE_VERTEX FROM DEPTABLE WHERE KEY_VERTEX = ?1")
        .map_err(sql)?;
    let mut upsert = tx
        .prepare_cached("INSERT OR REPLACE INTO DEPTABLE (KEY_VERTEX, VALUE_VERTEX) VALUES (?1, ?2)")
        .map_err(sql)?;

    let mut summary = SaveSummary::default();
    for (key, values) in rows {
        let mut merged = match mode {
            SaveMode::Fresh => Vec::new(),
            SaveMode::Merge => {
                let existing: Option<Vec<u8>> = select
                    .query_row(params![i64::from(key.as_u32())], |row| row.get(0))
                    .optional()
                    .map_err(sql)?;
                match existing {
                    Some(blob) => decode_blob(&blob).snapshot_corrupt(path)?,
                    None => Vec::new(),
                }
            }
        };

        let mut seen: HashSet<Vertex> = merged.iter().copied().collect();
        let before = merged.len();
        for value in values {
            if seen.insert(value) {
                merged.push(value);
            }
        }
        let added = (merged.len() - before) as u64;
        if added == 0 {
            continue;
        }

        upsert
            .execute(params![i64::from(key.as_u32()), encode_blob(&merged)])
            .map_err(sql)?;
        summary.keys_written += 1;
        summary.edges_added += added;
    }
    Ok(summary)
}

fn encode_blob(values: &[Vertex]) -> Vec<u8> {
    let mut out = vec![0u8; values.len() * 4];
    for (chunk, value) in out.chunks_exact_mut(4).zip(values) {
        LittleEndian::write_u32(chunk, value.as_u32());
    }
    out
}

fn decode_blob(blob: &[u8]) -> std::result::Result<Vec<Vertex>, String> {
    if blob.len() % 4 != 0 {
        return Err(format!("value blob of {} bytes is not a multiple of 4", blob.len()));
    }
    blob.chunks_exact(4)
        .map(|chunk| {
            let raw = LittleEndian::read_u32(chunk);
            Vertex::try_new(raw).ok_or_else(|| format!("value {raw:#x} is not a vertex"))
        })
        .collect()
}

/// A read-only handle on a dependency database.
pub struct DepDatabase {
    conn: Connection,
    path: PathBuf,
    build_info: String,
}

impl DepDatabase {
    /// Open `path` and verify its header.
    pub fn open_read_only(path: &Path, check: &VersionCheck) -> Result<Self> {
        if !path.exists() {
            return Err(FactHeapError::SnapshotIo {
                path: path.to_path_buf(),
                cause: "file does not exist".to_string(),
            });
        }
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .map_err(|e| FactHeapError::sqlite(path, e))?;

        let header: Option<(i64, String)> = conn
            .query_row("SELECT MAGIC_CONSTANT, BUILDINFO FROM HEADER", [], |row| {
                Ok((row.get(0)?, row.get(1)?))
            })
            .optional()
            .snapshot_corrupt(path)?;
        let Some((magic, build_info)) = header else {
            return Err(FactHeapError::SnapshotCorrupt {
                path: path.to_path_buf(),
                cause: "missing header row".to_string(),
            });
        };
        if magic as u64 != MAGIC {
            return Err(FactHeapError::SnapshotCorrupt {
                path: path.to_path_buf(),
                cause: format!("bad magic {:#x}", magic as u64),
            });
        }
        if let VersionCheck::Require(expected) = check {
            if *expected != build_info {
                return Err(FactHeapError::StaleSnapshot {
                    path: path.to_path_buf(),
                    expected: expected.clone(),
                    found: build_info,
                });
            }
        }

        tracing::debug!(path = %path.display(), build_info = %build_info, "Opened dependency database");
        Ok(Self {
            conn,
            path: path.to_path_buf(),
            build_info,
        })
    }

    /// Path the database was opened from.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Build info recorded in the header.
    pub fn build_info(&self) -> &str {
        &self.build_info
    }

    /// Stored values for `key`, in stored order.
    pub fn get_edges(&self, key: Vertex) -> Result<Vec<Vertex>> {
        let mut stmt = self
            .conn
            .prepare_cached("SELECT VALUE_VERTEX FROM DEPTABLE WHERE KEY_VERTEX = ?1")
            .map_err(|e| FactHeapError::sqlite(&self.path, e))?;
        let blob: Option<Vec<u8>> = stmt
            .query_row(params![i64::from(key.as_u32())], |row| row.get(0))
            .optional()
            .map_err(|e| FactHeapError::sqlite(&self.path, e))?;
        match blob {
            Some(blob) => decode_blob(&blob).snapshot_corrupt(&self.path),
            None => Ok(Vec::new()),
        }
    }

    /// Number of key rows.
    pub fn key_count(&self) -> Result<u64> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM DEPTABLE", [], |row| row.get(0))
            .map_err(|e| FactHeapError::sqlite(&self.path, e))?;
        Ok(count as u64)
    }

    /// Number of stored values across all keys.
    pub fn edge_count(&self) -> Result<u64> {
        let bytes: i64 = self
            .conn
            .query_row(
                "SELECT COALESCE(SUM(LENGTH(VALUE_VERTEX)), 0) FROM DEPTABLE",
                [],
                |row| row.get(0),
            )
            .map_err(|e| FactHeapError::sqlite(&self.path, e))?;
        Ok(bytes as u64 / 4)
    }
}

impl std::fmt::Debug for DepDatabase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DepDatabase")
            .field("path", &self.path)
            .field("build_info", &self.build_info)
            .finish()
    }
}

/// Verify `path` and publish it as the region's dependency database.
pub fn load_dep_table(region: &Region, path: &Path, check: &VersionCheck) -> Result<DepDatabase> {
    region.assert_coordinator("load_dep_table");
    let db = DepDatabase::open_read_only(path, check)?;
    region.set_loaded_dep_table_filename(path)?;
    tracing::info!(
        path = %path.display(),
        keys = db.key_count()?,
        "Loaded dependency database"
    );
    Ok(db)
}

/// Per-process reader of the database named in the region.
///
/// The connection is opened on first use and reopened when the coordinator
/// publishes a different file.
pub struct SqliteDeps<'a> {
    region: &'a Region,
    check: VersionCheck,
    db: Mutex<Option<DepDatabase>>,
}

impl<'a> SqliteDeps<'a> {
    /// Create a reader; nothing is opened yet.
    pub fn new(region: &'a Region, check: VersionCheck) -> Self {
        Self {
            region,
            check,
            db: Mutex::new(None),
        }
    }

    /// Stored values for `key` in the loaded database.
    pub fn get_edges(&self, key: Vertex) -> Result<Vec<Vertex>> {
        self.region.check_should_exit()?;
        let path = self
            .region
            .loaded_dep_table_filename()
            .ok_or(FactHeapError::DatabaseNotLoaded)?;

        let mut guard = self.db.lock();
        let stale = guard.as_ref().map_or(true, |db| db.path() != path);
        if stale {
            *guard = Some(DepDatabase::open_read_only(&path, &self.check)?);
        }
        match guard.as_ref() {
            Some(db) => db.get_edges(key),
            None => Err(FactHeapError::DatabaseNotLoaded),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::region::RegionConfig;
    use tempfile::tempdir;

    fn v(n: u32) -> Vertex {
        Vertex::new(n)
    }

    fn region_with(edges: &[(u32, u32)]) -> Region {
        let region = Region::init(RegionConfig::testing()).unwrap();
        for &(k, val) in edges {
            region.deps().add_edge(v(k), v(val)).unwrap();
        }
        region
    }

    #[test]
    fn save_and_query() {
        let region = region_with(&[(1, 2), (1, 3), (9, 1)]);
        let dir = tempdir().unwrap();
        let path = dir.path().join("deps.db");

        let summary = save_dep_table(&region.deps(), &path, "build-1", SaveMode::Fresh).unwrap();
        assert_eq!(summary, SaveSummary { keys_written: 2, edges_added: 3 });

        let db = DepDatabase::open_read_only(&path, &VersionCheck::Require("build-1".into())).unwrap();
        assert_eq!(db.build_info(), "build-1");
        assert_eq!(db.get_edges(v(1)).unwrap(), vec![v(3), v(2)]);
        assert_eq!(db.get_edges(v(9)).unwrap(), vec![v(1)]);
        assert!(db.get_edges(v(5)).unwrap().is_empty());
        assert_eq!(db.key_count().unwrap(), 2);
        assert_eq!(db.edge_count().unwrap(), 3);
    }

    #[test]
    fn fresh_refuses_existing_file() {
        let region = region_with(&[(1, 2)]);
        let dir = tempdir().unwrap();
        let path = dir.path().join("deps.db");
        save_dep_table(&region.deps(), &path, "b", SaveMode::Fresh).unwrap();
        let err = save_dep_table(&region.deps(), &path, "b", SaveMode::Fresh).unwrap_err();
        assert_eq!(err.code(), "E503");
    }

    #[test]
    fn merge_appends_unseen_values() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("deps.db");
        save_dep_table(&region_with(&[(1, 2)]).deps(), &path, "b", SaveMode::Fresh).unwrap();

        let summary =
            save_dep_table(&region_with(&[(1, 2), (1, 4)]).deps(), &path, "b", SaveMode::Merge).unwrap();
        assert_eq!(summary, SaveSummary { keys_written: 1, edges_added: 1 });

        let db = DepDatabase::open_read_only(&path, &VersionCheck::Ignore).unwrap();
        assert_eq!(db.get_edges(v(1)).unwrap(), vec![v(2), v(4)]);
    }

    #[test]
    fn stale_build_is_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("deps.db");
        save_dep_table(&region_with(&[(1, 2)]).deps(), &path, "old", SaveMode::Fresh).unwrap();

        let err = DepDatabase::open_read_only(&path, &VersionCheck::Require("new".into())).unwrap_err();
        assert!(matches!(err, FactHeapError::StaleSnapshot { ref found, .. } if found == "old"));
        assert!(DepDatabase::open_read_only(&path, &VersionCheck::Ignore).is_ok());
    }

    #[test]
    fn bad_magic_is_corrupt() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("deps.db");
        let conn = Connection::open(&path).unwrap();
        conn.execute_batch(SCHEMA).unwrap();
        conn.execute("INSERT INTO HEADER VALUES (42, 'b')", []).unwrap();
        drop(conn);

        let err = DepDatabase::open_read_only(&path, &VersionCheck::Ignore).unwrap_err();
        assert_eq!(err.code(), "E502");
    }

    #[test]
    fn sqlite_deps_follows_region_filename() {
        let region = region_with(&[(3, 4)]);
        let dir = tempdir().unwrap();
        let path = dir.path().join("deps.db");
        save_dep_table(&region.deps(), &path, "b", SaveMode::Fresh).unwrap();

        let reader = SqliteDeps::new(&region, VersionCheck::Ignore);
        assert!(matches!(reader.get_edges(v(3)), Err(FactHeapError::DatabaseNotLoaded)));

        load_dep_table(&region, &path, &VersionCheck::Require("b".into())).unwrap();
        assert_eq!(region.loaded_dep_table_filename().as_deref(), Some(path.as_path()));
        assert_eq!(reader.get_edges(v(3)).unwrap(), vec![v(4)]);
    }
}
