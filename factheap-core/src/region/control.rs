//! Runtime switches, the request counter and the loaded-database filename.

use super::{Cell, Region};
use crate::error::{FactHeapError, Result};
use std::ffi::OsStr;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;

/// Counter values reserved by a worker per trip to the shared cell.
pub const COUNTER_RANGE: u64 = 2048;

impl Region {
    /// Ask every worker to abandon its current operation.
    pub fn stop_workers(&self) {
        self.assert_coordinator("stop_workers");
        self.cell(Cell::WorkersShouldExit).store(1, Ordering::Release);
        tracing::info!("Workers asked to exit");
    }

    /// Clear the exit request.
    pub fn resume_workers(&self) {
        self.assert_coordinator("resume_workers");
        self.cell(Cell::WorkersShouldExit).store(0, Ordering::Release);
    }

    /// True while workers are asked to exit.
    pub fn workers_should_exit(&self) -> bool {
        self.cell(Cell::WorkersShouldExit).load(Ordering::Acquire) != 0
    }

    /// Fail with [`FactHeapError::WorkerShouldExit`] while the exit flag is
    /// raised, unless this process opted out with
    /// [`Region::set_can_worker_stop`].
    ///
    /// Polled at the entry of every public table operation, on coordinator
    /// and worker handles alike.
    pub fn check_should_exit(&self) -> Result<()> {
        if self.can_stop_flag().load(Ordering::Relaxed) && self.workers_should_exit() {
            return Err(FactHeapError::WorkerShouldExit);
        }
        Ok(())
    }

    /// Permit or forbid `remove` and compaction.
    pub fn set_allow_removes(&self, allow: bool) {
        self.assert_coordinator("set_allow_removes");
        self.cell(Cell::AllowRemoves)
            .store(u64::from(allow), Ordering::Release);
    }

    /// Whether `remove` and compaction are permitted.
    pub fn allow_removes(&self) -> bool {
        self.cell(Cell::AllowRemoves).load(Ordering::Acquire) != 0
    }

    /// Permit or forbid dependency table reads, returning the old setting.
    ///
    /// Reads are forbidden while the coordinator rebuilds the graph.
    pub fn set_allow_dependency_table_reads(&self, allow: bool) -> bool {
        self.assert_coordinator("set_allow_dependency_table_reads");
        self.cell(Cell::AllowDepReads)
            .swap(u64::from(allow), Ordering::AcqRel)
            != 0
    }

    /// Whether dependency table reads are permitted.
    pub fn dependency_table_reads_allowed(&self) -> bool {
        self.cell(Cell::AllowDepReads).load(Ordering::Acquire) != 0
    }

    /// Enable or disable hashtable writes from this process only.
    pub fn set_allow_hashtable_writes_by_current_process(&self, allow: bool) {
        self.hashtable_writes_flag().store(allow, Ordering::Relaxed);
    }

    /// Choose whether this process honours the exit flag.
    ///
    /// A process that clears this keeps working through `stop_workers`,
    /// e.g. the coordinator while it tears the workers down.
    pub fn set_can_worker_stop(&self, allow: bool) {
        self.can_stop_flag().store(allow, Ordering::Relaxed);
    }

    /// Sampled logging level; 0 disables sampling.
    pub fn log_level(&self) -> u64 {
        self.cell(Cell::LogLevel).load(Ordering::Relaxed)
    }

    /// Change the sampled logging level for every process.
    pub fn set_log_level(&self, level: u64) {
        self.assert_coordinator("set_log_level");
        self.cell(Cell::LogLevel).store(level, Ordering::Relaxed);
    }

    /// Fraction of operations logged when sampling is enabled.
    pub fn sample_rate(&self) -> f64 {
        f64::from_bits(self.cell(Cell::SampleRate).load(Ordering::Relaxed))
    }

    /// Change the sample rate for every process.
    pub fn set_sample_rate(&self, rate: f64) {
        self.assert_coordinator("set_sample_rate");
        self.cell(Cell::SampleRate)
            .store(rate.clamp(0.0, 1.0).to_bits(), Ordering::Relaxed);
    }

    /// Payload compression level; 0 disables compression.
    pub fn compression(&self) -> u64 {
        self.cell(Cell::Compression).load(Ordering::Relaxed)
    }

    /// Change the compression level for every process.
    pub fn set_compression(&self, level: u64) {
        self.assert_coordinator("set_compression");
        self.cell(Cell::Compression).store(level, Ordering::Relaxed);
    }

    /// Roll the dice for sampled logging.
    pub(crate) fn should_sample(&self) -> bool {
        self.log_level() > 0 && rand::random::<f64>() < self.sample_rate()
    }

    /// Next value of the region-wide request counter.
    ///
    /// Values are unique across processes and increase within a process.
    /// Each worker reserves [`COUNTER_RANGE`] values at a time from the
    /// shared cell so the cell's cache line is touched rarely.
    pub fn next_counter(&self) -> u64 {
        let local = self.atomic(self.layout.local_counter(self.worker.as_u32()));
        let mut value = local.load(Ordering::Relaxed);
        if value % COUNTER_RANGE == 0 {
            value = self
                .cell(Cell::Counter)
                .fetch_add(COUNTER_RANGE, Ordering::Relaxed);
        }
        value += 1;
        local.store(value, Ordering::Relaxed);
        value
    }

    /// Record the dependency database workers should query.
    pub fn set_loaded_dep_table_filename(&self, path: &Path) -> Result<()> {
        self.assert_coordinator("set_loaded_dep_table_filename");
        let bytes = path.as_os_str().as_bytes();
        let capacity = self.layout.filename.len as usize - 1;
        if bytes.is_empty() || bytes.len() > capacity {
            return Err(FactHeapError::ConfigValue {
                field: "dep_table_filename".to_string(),
                cause: format!("path length must be in 1..={capacity}, got {}", bytes.len()),
            });
        }
        let dst = self.ptr(self.layout.filename.offset);
        // SAFETY: the filename page is only written by the coordinator, and
        // `bytes.len() + 1` fits in it.
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), dst, bytes.len());
            dst.add(bytes.len()).write(0);
        }
        Ok(())
    }

    /// The dependency database recorded by the coordinator, if any.
    pub fn loaded_dep_table_filename(&self) -> Option<PathBuf> {
        let len = self.layout.filename.len as usize;
        // SAFETY: the page is inside the mapping and read as plain bytes.
        let page = unsafe { std::slice::from_raw_parts(self.ptr(self.layout.filename.offset), len) };
        let end = page.iter().position(|&b| b == 0).unwrap_or(len);
        if end == 0 {
            return None;
        }
        Some(PathBuf::from(OsStr::from_bytes(&page[..end])))
    }

    /// Forget the loaded dependency database.
    pub fn clear_loaded_dep_table_filename(&self) {
        self.assert_coordinator("clear_loaded_dep_table_filename");
        // SAFETY: first byte of the filename page.
        unsafe { self.ptr(self.layout.filename.offset).write(0) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::region::RegionConfig;
    use crate::types::WorkerId;

    #[test]
    fn stop_and_resume_workers() {
        let region = Region::init(RegionConfig::testing()).unwrap();
        let worker = Region::attach(&region.connector(), WorkerId::new(1)).unwrap();

        assert!(worker.check_should_exit().is_ok());
        region.stop_workers();
        assert!(matches!(
            worker.check_should_exit(),
            Err(FactHeapError::WorkerShouldExit)
        ));
        assert!(matches!(
            region.check_should_exit(),
            Err(FactHeapError::WorkerShouldExit)
        ));

        region.resume_workers();
        assert!(worker.check_should_exit().is_ok());
        assert!(region.check_should_exit().is_ok());
    }

    #[test]
    fn opted_out_process_ignores_exit_flag() {
        let region = Region::init(RegionConfig::testing()).unwrap();
        let worker = Region::attach(&region.connector(), WorkerId::new(1)).unwrap();
        region.set_can_worker_stop(false);
        region.stop_workers();

        assert!(region.check_should_exit().is_ok());
        assert!(worker.check_should_exit().is_err());

        region.set_can_worker_stop(true);
        assert!(region.check_should_exit().is_err());
    }

    #[test]
    fn counter_is_unique_across_workers() {
        let region = Region::init(RegionConfig::testing()).unwrap();
        let worker = Region::attach(&region.connector(), WorkerId::new(1)).unwrap();

        let a: Vec<u64> = (0..3000).map(|_| region.next_counter()).collect();
        let b: Vec<u64> = (0..3000).map(|_| worker.next_counter()).collect();

        assert!(a.windows(2).all(|w| w[0] < w[1]));
        assert!(b.windows(2).all(|w| w[0] < w[1]));
        let mut all: Vec<u64> = a.iter().chain(b.iter()).copied().collect();
        all.sort_unstable();
        all.dedup();
        assert_eq!(all.len(), 6000);
        assert_eq!(a[0], COUNTER_RANGE + 1);
    }

    #[test]
    fn dependency_read_switch_returns_previous() {
        let region = Region::init(RegionConfig::testing()).unwrap();
        assert!(region.dependency_table_reads_allowed());
        assert!(region.set_allow_dependency_table_reads(false));
        assert!(!region.set_allow_dependency_table_reads(true));
    }

    #[test]
    fn filename_roundtrip() {
        let region = Region::init(RegionConfig::testing()).unwrap();
        let worker = Region::attach(&region.connector(), WorkerId::new(2)).unwrap();
        assert!(worker.loaded_dep_table_filename().is_none());

        region
            .set_loaded_dep_table_filename(Path::new("/var/tmp/deps.sql"))
            .unwrap();
        assert_eq!(
            worker.loaded_dep_table_filename(),
            Some(PathBuf::from("/var/tmp/deps.sql"))
        );

        region.clear_loaded_dep_table_filename();
        assert!(worker.loaded_dep_table_filename().is_none());
    }

    #[test]
    fn filename_too_long_is_rejected() {
        let region = Region::init(RegionConfig::testing()).unwrap();
        let long = "x".repeat(region.layout().filename.len as usize);
        assert!(region.set_loaded_dep_table_filename(Path::new(&long)).is_err());
    }

    #[test]
    fn runtime_knobs() {
        let region = Region::init(RegionConfig::testing()).unwrap();
        region.set_log_level(2);
        region.set_sample_rate(3.0);
        region.set_compression(1);
        assert_eq!(region.log_level(), 2);
        assert_eq!(region.sample_rate(), 1.0);
        assert_eq!(region.compression(), 1);
        assert!(region.should_sample());
    }
}
