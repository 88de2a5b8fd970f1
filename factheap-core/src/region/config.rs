//! Region sizing and runtime configuration.

use crate::error::{FactHeapError, Result};
use crate::types::WorkerId;
use serde::{Deserialize, Serialize};
use std::os::fd::RawFd;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default heap size: 1 GB.
pub const DEFAULT_HEAP_SIZE: u64 = 1024 * 1024 * 1024;

/// Default global blob capacity: 16 MB.
pub const DEFAULT_GLOBAL_SIZE: u64 = 16 * 1024 * 1024;

/// Largest dependency table exponent. Slot indices must fit in 31 bits.
pub const MAX_DEP_TABLE_POW: u32 = 31;

/// Largest hashtable exponent.
pub const MAX_HASH_TABLE_POW: u32 = 40;

/// Default time a reader waits for a claimed slot to be published.
pub const DEFAULT_PUBLISH_TIMEOUT: Duration = Duration::from_secs(60);

/// Configuration for region creation.
///
/// Every section offset is a pure function of these values, which is what
/// lets an attaching worker reproduce the coordinator's layout from the
/// connector record alone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegionConfig {
    /// Capacity of the global broadcast blob in bytes.
    pub global_size: u64,
    /// Size of the bump heap in bytes.
    pub heap_size: u64,
    /// Dependency table holds `2^dep_table_pow` slots.
    pub dep_table_pow: u32,
    /// Hashtable holds `2^hash_table_pow` slots.
    pub hash_table_pow: u32,
    /// Number of worker processes that may attach.
    pub num_workers: u32,
    /// 0 disables sampled operation logging.
    pub log_level: u64,
    /// Fraction of operations logged when `log_level > 0`.
    pub sample_rate: f64,
    /// 0 disables payload compression.
    pub compression: u64,
    /// Directory for a file-backed region; an anonymous memfd when unset.
    pub shm_dir: Option<PathBuf>,
    /// Bytes that must be free in `shm_dir` before the region is created.
    pub shm_min_avail: u64,
    /// How long readers wait on a slot that is mid-publish.
    pub publish_timeout: Duration,
}

impl Default for RegionConfig {
    fn default() -> Self {
        Self {
            global_size: DEFAULT_GLOBAL_SIZE,
            heap_size: DEFAULT_HEAP_SIZE,
            dep_table_pow: 17,
            hash_table_pow: 18,
            num_workers: 0,
            log_level: 0,
            sample_rate: 0.0,
            compression: 0,
            shm_dir: None,
            shm_min_avail: 0,
            publish_timeout: DEFAULT_PUBLISH_TIMEOUT,
        }
    }
}

impl RegionConfig {
    /// Small tables for tests.
    pub fn testing() -> Self {
        Self {
            global_size: 16 * 1024,
            heap_size: 4 * 1024 * 1024, // 4 MB for tests
            dep_table_pow: 12,
            hash_table_pow: 10,
            num_workers: 4,
            ..Self::default()
        }
    }

    /// Load a configuration from a JSON file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| FactHeapError::ConfigValue {
            field: path.display().to_string(),
            cause: e.to_string(),
        })?;
        let config: Self =
            serde_json::from_str(&text).map_err(|e| FactHeapError::ConfigValue {
                field: path.display().to_string(),
                cause: e.to_string(),
            })?;
        config.validate()?;
        Ok(config)
    }

    /// Set the global blob capacity.
    pub fn with_global_size(mut self, bytes: u64) -> Self {
        self.global_size = bytes;
        self
    }

    /// Set the heap size.
    pub fn with_heap_size(mut self, bytes: u64) -> Self {
        self.heap_size = bytes;
        self
    }

    /// Set the dependency table exponent.
    pub fn with_dep_table_pow(mut self, pow: u32) -> Self {
        self.dep_table_pow = pow;
        self
    }

    /// Set the hashtable exponent.
    pub fn with_hash_table_pow(mut self, pow: u32) -> Self {
        self.hash_table_pow = pow;
        self
    }

    /// Set the number of workers.
    pub fn with_workers(mut self, num_workers: u32) -> Self {
        self.num_workers = num_workers;
        self
    }

    /// Enable sampled logging.
    pub fn with_sampling(mut self, log_level: u64, sample_rate: f64) -> Self {
        self.log_level = log_level;
        self.sample_rate = sample_rate.clamp(0.0, 1.0);
        self
    }

    /// Set the compression level.
    pub fn with_compression(mut self, level: u64) -> Self {
        self.compression = level;
        self
    }

    /// Back the region with a file in `dir` that must have `min_avail` bytes free.
    pub fn with_shm_dir(mut self, dir: impl Into<PathBuf>, min_avail: u64) -> Self {
        self.shm_dir = Some(dir.into());
        self.shm_min_avail = min_avail;
        self
    }

    /// Set the publish timeout.
    pub fn with_publish_timeout(mut self, timeout: Duration) -> Self {
        self.publish_timeout = timeout;
        self
    }

    /// Number of dependency table slots.
    #[must_use]
    pub const fn dep_table_slots(&self) -> u64 {
        1 << self.dep_table_pow
    }

    /// Number of hashtable slots.
    #[must_use]
    pub const fn hash_table_slots(&self) -> u64 {
        1 << self.hash_table_pow
    }

    /// Reject values that cannot produce a usable layout.
    pub fn validate(&self) -> Result<()> {
        if self.dep_table_pow == 0 || self.dep_table_pow > MAX_DEP_TABLE_POW {
            return Err(invalid(
                "dep_table_pow",
                format!("must be in 1..={MAX_DEP_TABLE_POW}, got {}", self.dep_table_pow),
            ));
        }
        if self.hash_table_pow == 0 || self.hash_table_pow > MAX_HASH_TABLE_POW {
            return Err(invalid(
                "hash_table_pow",
                format!("must be in 1..={MAX_HASH_TABLE_POW}, got {}", self.hash_table_pow),
            ));
        }
        if self.heap_size == 0 || self.heap_size % 8 != 0 {
            return Err(invalid(
                "heap_size",
                format!("must be a non-zero multiple of 8, got {}", self.heap_size),
            ));
        }
        if !(0.0..=1.0).contains(&self.sample_rate) {
            return Err(invalid(
                "sample_rate",
                format!("must be within [0, 1], got {}", self.sample_rate),
            ));
        }
        if self.publish_timeout.is_zero() {
            return Err(invalid("publish_timeout", "must be non-zero".to_string()));
        }
        Ok(())
    }
}

fn invalid(field: &str, cause: String) -> FactHeapError {
    FactHeapError::ConfigValue {
        field: field.to_string(),
        cause,
    }
}

/// Everything a worker needs to attach to an existing region.
///
/// Passed out-of-band (environment, pipe, command line) from the
/// coordinator to each worker. The fd must be inherited by, or sent to, the
/// worker process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectorRecord {
    /// The coordinator's configuration; layout is recomputed from it.
    pub config: RegionConfig,
    /// File descriptor of the backing memory object.
    pub fd: RawFd,
    /// Process id of the coordinator.
    pub coordinator_pid: u32,
}

impl ConnectorRecord {
    /// Serialize for handoff to a worker.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| FactHeapError::Serialization(e.to_string()))
    }

    /// Parse a record produced by [`ConnectorRecord::to_json`].
    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| FactHeapError::Serialization(e.to_string()))
    }

    /// Check that `worker` fits the local counter array.
    pub(crate) fn check_worker(&self, worker: WorkerId) -> Result<()> {
        if worker.is_coordinator() || worker.as_u32() > self.config.num_workers {
            return Err(invalid(
                "worker_id",
                format!(
                    "must be in 1..={}, got {}",
                    self.config.num_workers,
                    worker.as_u32()
                ),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn testing_config_is_valid() {
        RegionConfig::testing().validate().unwrap();
        RegionConfig::default().validate().unwrap();
    }

    #[test]
    fn builder_chain() {
        let config = RegionConfig::testing()
            .with_heap_size(1 << 20)
            .with_dep_table_pow(4)
            .with_hash_table_pow(6)
            .with_sampling(1, 2.0);
        assert_eq!(config.dep_table_slots(), 16);
        assert_eq!(config.hash_table_slots(), 64);
        assert_eq!(config.sample_rate, 1.0);
    }

    #[test]
    fn rejects_bad_values() {
        let err = RegionConfig::testing()
            .with_dep_table_pow(32)
            .validate()
            .unwrap_err();
        assert_eq!(err.code(), "E802");
        assert!(err.to_string().contains("dep_table_pow"));

        assert!(RegionConfig::testing().with_heap_size(12).validate().is_err());
        assert!(RegionConfig::testing().with_hash_table_pow(0).validate().is_err());
    }

    #[test]
    fn connector_json_roundtrip() {
        let record = ConnectorRecord {
            config: RegionConfig::testing(),
            fd: 7,
            coordinator_pid: 1234,
        };
        let json = record.to_json().unwrap();
        assert_eq!(ConnectorRecord::from_json(&json).unwrap(), record);
    }

    #[test]
    fn connector_checks_worker_range() {
        let record = ConnectorRecord {
            config: RegionConfig::testing().with_workers(2),
            fd: 3,
            coordinator_pid: 1,
        };
        assert!(record.check_worker(WorkerId::new(1)).is_ok());
        assert!(record.check_worker(WorkerId::new(2)).is_ok());
        assert!(record.check_worker(WorkerId::new(3)).is_err());
        assert!(record.check_worker(WorkerId::COORDINATOR).is_err());
    }

    #[test]
    fn config_from_json_file_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("region.json");
        std::fs::write(&path, r#"{"heap_size": 65536, "hash_table_pow": 8}"#).unwrap();

        let config = RegionConfig::from_json_file(&path).unwrap();
        assert_eq!(config.heap_size, 65536);
        assert_eq!(config.hash_table_pow, 8);
        assert_eq!(config.dep_table_pow, RegionConfig::default().dep_table_pow);
    }
}
