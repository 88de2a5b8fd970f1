//! Background writer that merges edge batches into a dependency database.
//!
//! Producers hand batches to [`UpdateQueue::submit`] and never block on the
//! database. A single worker thread owns the connection and applies each
//! batch in its own `IMMEDIATE` transaction. When another process holds the
//! write lock the batch goes back to the front of the backlog and is retried
//! after an exponential backoff.

use super::sqlite::{init_schema, merge_rows, SaveMode, SaveSummary};
use crate::error::{FactHeapError, Result};
use crate::types::Vertex;
use rusqlite::{Connection, TransactionBehavior};
use std::collections::{BTreeMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

const BUSY_TIMEOUT: Duration = Duration::from_millis(50);
const MIN_RETRY_DELAY: Duration = Duration::from_millis(10);
const MAX_RETRY_DELAY: Duration = Duration::from_secs(2);

/// Edges to merge as one transaction.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EdgeBatch {
    /// `(key, value)` pairs.
    pub edges: Vec<(Vertex, Vertex)>,
}

impl EdgeBatch {
    /// Create an empty batch.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an edge.
    pub fn push(&mut self, key: Vertex, value: Vertex) {
        self.edges.push((key, value));
    }

    /// Number of edges in the batch.
    pub fn len(&self) -> usize {
        self.edges.len()
    }

    /// True when the batch has no edges.
    pub fn is_empty(&self) -> bool {
        self.edges.is_empty()
    }

    fn rows(&self) -> BTreeMap<Vertex, Vec<Vertex>> {
        let mut rows: BTreeMap<Vertex, Vec<Vertex>> = BTreeMap::new();
        for &(key, value) in &self.edges {
            rows.entry(key).or_default().push(value);
        }
        rows
    }
}

impl FromIterator<(Vertex, Vertex)> for EdgeBatch {
    fn from_iter<I: IntoIterator<Item = (Vertex, Vertex)>>(iter: I) -> Self {
        Self {
            edges: iter.into_iter().collect(),
        }
    }
}

/// Counters kept by the worker thread.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    /// Batches committed.
    pub batches_applied: u64,
    /// Values that were new to the database.
    pub edges_added: u64,
    /// Attempts that hit a locked database and were re-queued.
    pub busy_retries: u64,
    /// Batches dropped after a non-retriable error.
    pub failures: u64,
}

#[derive(Default)]
struct Counters {
    batches_applied: AtomicU64,
    edges_added: AtomicU64,
    busy_retries: AtomicU64,
    failures: AtomicU64,
}

enum Message {
    Batch(EdgeBatch),
    Flush(Sender<()>),
}

/// Handle to the background update thread.
pub struct UpdateQueue {
    path: PathBuf,
    sender: Option<Sender<Message>>,
    handle: Option<JoinHandle<()>>,
    counters: Arc<Counters>,
}

impl UpdateQueue {
    /// Open `path`, stamp its header with `build_info`, and start the worker.
    pub fn spawn(path: &Path, build_info: &str) -> Result<Self> {
        let conn = Connection::open(path).map_err(|e| FactHeapError::sqlite(path, e))?;
        conn.busy_timeout(BUSY_TIMEOUT)
            .map_err(|e| FactHeapError::sqlite(path, e))?;
        init_schema(&conn, path, build_info)?;

        let (sender, receiver) = mpsc::channel();
        let counters = Arc::new(Counters::default());
        let worker = Worker {
            conn,
            path: path.to_path_buf(),
            receiver,
            counters: Arc::clone(&counters),
            backlog: VecDeque::new(),
            waiters: Vec::new(),
            open: true,
        };
        let handle = std::thread::Builder::new()
            .name("factheap-updates".to_string())
            .spawn(move || worker.run())
            .map_err(|e| FactHeapError::SnapshotIo {
                path: path.to_path_buf(),
                cause: format!("failed to spawn update thread: {e}"),
            })?;

        tracing::info!(path = %path.display(), "Started dependency update queue");
        Ok(Self {
            path: path.to_path_buf(),
            sender: Some(sender),
            handle: Some(handle),
            counters,
        })
    }

    /// Queue a batch. Empty batches are ignored.
    pub fn submit(&self, batch: EdgeBatch) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        self.send(Message::Batch(batch))
    }

    /// Block until every batch submitted so far has been applied or dropped.
    pub fn flush(&self) -> Result<()> {
        let (ack, done) = mpsc::channel();
        self.send(Message::Flush(ack))?;
        done.recv().map_err(|_| self.closed())
    }

    /// Snapshot of the worker's counters.
    pub fn stats(&self) -> QueueStats {
        QueueStats {
            batches_applied: self.counters.batches_applied.load(Ordering::Relaxed),
            edges_added: self.counters.edges_added.load(Ordering::Relaxed),
            busy_retries: self.counters.busy_retries.load(Ordering::Relaxed),
            failures: self.counters.failures.load(Ordering::Relaxed),
        }
    }

    /// Drain the backlog and stop the worker.
    pub fn shutdown(mut self) -> QueueStats {
        self.stop();
        self.stats()
    }

    fn send(&self, message: Message) -> Result<()> {
        match &self.sender {
            Some(sender) => sender.send(message).map_err(|_| self.closed()),
            None => Err(self.closed()),
        }
    }

    fn closed(&self) -> FactHeapError {
        FactHeapError::QueueClosed {
            path: self.path.clone(),
        }
    }

    fn stop(&mut self) {
        self.sender = None;
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                tracing::error!(path = %self.path.display(), "Update thread panicked");
            }
        }
    }
}

impl Drop for UpdateQueue {
    fn drop(&mut self) {
        self.stop();
    }
}

struct Worker {
    conn: Connection,
    path: PathBuf,
    receiver: Receiver<Message>,
    counters: Arc<Counters>,
    backlog: VecDeque<EdgeBatch>,
    waiters: Vec<Sender<()>>,
    open: bool,
}

impl Worker {
    fn run(mut self) {
        let mut delay = MIN_RETRY_DELAY;
        loop {
            if self.backlog.is_empty() {
                for waiter in self.waiters.drain(..) {
                    let _ = waiter.send(());
                }
                if !self.open {
                    break;
                }
                match self.receiver.recv() {
                    Ok(message) => self.accept(message),
                    Err(_) => self.open = false,
                }
            }
            loop {
                match self.receiver.try_recv() {
                    Ok(message) => self.accept(message),
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Disconnected) => {
                        self.open = false;
                        break;
                    }
                }
            }

            let Some(batch) = self.backlog.pop_front() else {
                continue;
            };
            match self.apply(&batch) {
                Ok(summary) => {
                    self.counters.batches_applied.fetch_add(1, Ordering::Relaxed);
                    self.counters
                        .edges_added
                        .fetch_add(summary.edges_added, Ordering::Relaxed);
                    tracing::debug!(
                        edges = batch.len(),
                        added = summary.edges_added,
                        "Applied dependency batch"
                    );
                    delay = MIN_RETRY_DELAY;
                }
                Err(e) if e.is_retriable() => {
                    self.counters.busy_retries.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(
                        path = %self.path.display(),
                        retry_in_ms = delay.as_millis() as u64,
                        error = %e,
                        "Dependency database busy, re-queueing batch"
                    );
                    self.backlog.push_front(batch);
                    match self.receiver.recv_timeout(delay) {
                        Ok(message) => self.accept(message),
                        Err(RecvTimeoutError::Timeout) => {}
                        Err(RecvTimeoutError::Disconnected) => self.open = false,
                    }
                    delay = (delay * 2).min(MAX_RETRY_DELAY);
                }
                Err(e) => {
                    self.counters.failures.fetch_add(1, Ordering::Relaxed);
                    tracing::error!(
                        path = %self.path.display(),
                        code = e.code(),
                        error = %e,
                        edges = batch.len(),
                        "Dropping dependency batch"
                    );
                }
            }
        }
        tracing::info!(path = %self.path.display(), "Dependency update queue stopped");
    }

    fn accept(&mut self, message: Message) {
        match message {
            Message::Batch(batch) => self.backlog.push_back(batch),
            Message::Flush(ack) => self.waiters.push(ack),
        }
    }

    fn apply(&mut self, batch: &EdgeBatch) -> Result<SaveSummary> {
        let path = &self.path;
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|e| FactHeapError::sqlite(path, e))?;
        let summary = merge_rows(&tx, path, batch.rows(), SaveMode::Merge)?;
        tx.commit().map_err(|e| FactHeapError::sqlite(path, e))?;
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persist::{DepDatabase, VersionCheck};
    use std::time::Instant;
    use tempfile::tempdir;

    fn v(n: u32) -> Vertex {
        Vertex::new(n)
    }

    #[test]
    fn applies_batches_in_order() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("deps.db");
        let queue = UpdateQueue::spawn(&path, "b").unwrap();

        queue.submit([(v(1), v(2)), (v(1), v(3))].into_iter().collect()).unwrap();
        queue.submit([(v(1), v(3)), (v(5), v(6))].into_iter().collect()).unwrap();
        queue.submit(EdgeBatch::new()).unwrap();
        queue.flush().unwrap();

        let stats = queue.shutdown();
        assert_eq!(stats.batches_applied, 2);
        assert_eq!(stats.edges_added, 3);
        assert_eq!(stats.failures, 0);

        let db = DepDatabase::open_read_only(&path, &VersionCheck::Require("b".into())).unwrap();
        assert_eq!(db.get_edges(v(1)).unwrap(), vec![v(2), v(3)]);
        assert_eq!(db.get_edges(v(5)).unwrap(), vec![v(6)]);
    }

    #[test]
    fn busy_database_is_retried() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("deps.db");
        let queue = UpdateQueue::spawn(&path, "b").unwrap();

        let blocker = Connection::open(&path).unwrap();
        blocker.execute_batch("BEGIN EXCLUSIVE;").unwrap();

        queue.submit([(v(7), v(8))].into_iter().collect()).unwrap();
        let deadline = Instant::now() + Duration::from_secs(10);
        while queue.stats().busy_retries == 0 {
            assert!(Instant::now() < deadline, "queue never saw a busy database");
            std::thread::sleep(Duration::from_millis(5));
        }

        blocker.execute_batch("COMMIT;").unwrap();
        queue.flush().unwrap();
        let stats = queue.stats();
        assert_eq!(stats.batches_applied, 1);
        assert!(stats.busy_retries >= 1);

        let db = DepDatabase::open_read_only(&path, &VersionCheck::Ignore).unwrap();
        assert_eq!(db.get_edges(v(7)).unwrap(), vec![v(8)]);
    }
}
