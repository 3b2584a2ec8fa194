//! The LSM engine: orchestrates the memtables, the WAL, the SSTable set,
//! the block cache, and the background compaction worker.
//!
//! # Locking
//!
//! - The engine lock (`RwLock<Inner>`) guards the memtable pointers, the
//!   WAL (append order == lock acquisition order), the ordered table set,
//!   and the timestamp clock. Every foreground operation takes it;
//!   compaction takes it only for the atomic swap.
//! - The cache has its own mutex, always acquired *inside* the engine lock
//!   and never held across an engine operation.
//! - A condvar signals the compaction worker after each flush; `close()`
//!   sets a stop flag and joins the thread.

pub mod compaction;
pub mod iterator;

use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, RwLock};
use std::thread::JoinHandle;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::cache::LruCache;
use crate::config::Config;
use crate::entry::Lookup;
use crate::error::{Error, Result};
use crate::flock::FileLock;
use crate::invariant;
use crate::memtable::Memtable;
use crate::sstable::table::TableOptions;
use crate::sstable::SsTable;
use crate::wal::{Wal, WalOp};

use self::iterator::{EntryMerge, EntryStream};

/// Deepest level a table can reach.
pub const MAX_LEVEL: u8 = 7;

const LOCK_FILE: &str = "LOCK";
const WAL_FILE: &str = "wal.log";

/// Counters exposed by [`Engine::stats`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineStats {
    pub memtable_size: usize,
    pub num_sstables: usize,
    pub total_disk_bytes: u64,
    pub approx_num_keys: usize,
    pub cache_hits: u64,
    pub cache_misses: u64,
}

/// State guarded by the engine lock.
pub(crate) struct Inner {
    pub active: Memtable,
    pub immutable: Option<Memtable>,
    pub wal: Wal,
    /// Table set in read order: level ascending, newest id first within a
    /// level. The newest-data table always sorts first.
    pub tables: Vec<Arc<SsTable>>,
    /// Last assigned write timestamp; the clock never moves backwards.
    pub last_timestamp: u64,
    /// Held for the lifetime of the engine; released by `close()`.
    pub lock: Option<FileLock>,
}

pub(crate) struct WorkerState {
    pub shutdown: bool,
    pub pending: bool,
}

/// State shared between the engine handle and the compaction worker.
pub(crate) struct Shared {
    pub config: Config,
    pub inner: RwLock<Inner>,
    pub cache: Mutex<LruCache>,
    pub next_table_id: AtomicU64,
    pub work: Mutex<WorkerState>,
    pub work_cv: Condvar,
    /// Serializes background and forced compaction.
    pub compaction_mutex: Mutex<()>,
}

impl Shared {
    pub(crate) fn table_options(&self) -> TableOptions {
        TableOptions {
            bloom_filter: self.config.enable_bloom_filter,
            false_positive_rate: self.config.target_false_positive_rate,
            compression: self.config.enable_compression,
        }
    }

    pub(crate) fn next_table_id(&self) -> u64 {
        self.next_table_id.fetch_add(1, Ordering::SeqCst)
    }

    pub(crate) fn notify_compaction(&self) {
        if let Ok(mut work) = self.work.lock() {
            work.pending = true;
            self.work_cv.notify_one();
        }
    }
}

/// Orders a table set for reading: level ascending, id descending within a
/// level. Within level 0 a greater id means newer data; within deeper
/// levels tables do not overlap, so only the level order matters.
pub(crate) fn sort_read_order(tables: &mut [Arc<SsTable>]) {
    tables.sort_by(|a, b| {
        a.level()
            .cmp(&b.level())
            .then(b.id().cmp(&a.id()))
    });
}

pub struct Engine {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl Engine {
    /// Open a store at `dir` with default configuration.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        Self::open_with_config(Config::new(dir))
    }

    /// Open a store with custom configuration.
    ///
    /// Startup sequence: create the directory, take the exclusive `LOCK`
    /// file, delete orphaned `.sst.tmp` files, open every durable SSTable
    /// (corrupt ones are skipped with a warning), replay the WAL into a
    /// fresh memtable, then start the compaction worker.
    pub fn open_with_config(config: Config) -> Result<Self> {
        let dir = config.data_dir.clone();
        fs::create_dir_all(&dir)?;

        let lock = FileLock::lock(dir.join(LOCK_FILE))?;

        let mut tables = Vec::new();
        for dir_entry in fs::read_dir(&dir)? {
            let path = dir_entry?.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if name.ends_with(".sst.tmp") {
                tracing::warn!(path = ?path, "Removing orphaned temporary SSTable");
                fs::remove_file(&path)?;
            } else if name.ends_with(".sst") {
                match SsTable::open(&path) {
                    Ok(table) => tables.push(Arc::new(table)),
                    Err(e) => {
                        tracing::warn!(path = ?path, error = %e, "Skipping corrupt SSTable");
                    }
                }
            }
        }

        tables.sort_by_key(|t| t.id());
        for pair in tables.windows(2) {
            if pair[0].id() == pair[1].id() {
                return invariant!("two SSTables share id {}", pair[0].id());
            }
        }
        let next_table_id = tables.iter().map(|t| t.id()).max().map_or(1, |max| max + 1);
        let max_created = tables.iter().map(|t| t.created_ms()).max().unwrap_or(0);
        sort_read_order(&mut tables);

        // Replay the WAL: after this the memtable is the authoritative
        // in-memory state of every write not yet in an SSTable.
        let wal = Wal::open(dir.join(WAL_FILE))?;
        let active = Memtable::new();
        let mut last_timestamp = 0;
        let records = wal.recover()?;
        if !records.is_empty() {
            tracing::info!(records = records.len(), "Recovering WAL");
        }
        for record in records {
            last_timestamp = last_timestamp.max(record.timestamp);
            match record.op {
                WalOp::Put => active.put(record.key, record.value, record.timestamp),
                WalOp::Delete => active.delete(record.key, record.timestamp),
            }
        }
        last_timestamp = last_timestamp.max(max_created).max(now_ms());

        tracing::info!(
            dir = ?dir,
            tables = tables.len(),
            memtable_entries = active.len(),
            "Opened store"
        );

        let shared = Arc::new(Shared {
            cache: Mutex::new(LruCache::new(config.cache_capacity_bytes)),
            config,
            inner: RwLock::new(Inner {
                active,
                immutable: None,
                wal,
                tables,
                last_timestamp,
                lock: Some(lock),
            }),
            next_table_id: AtomicU64::new(next_table_id),
            work: Mutex::new(WorkerState {
                shutdown: false,
                pending: false,
            }),
            work_cv: Condvar::new(),
            compaction_mutex: Mutex::new(()),
        });

        let worker_shared = Arc::clone(&shared);
        let handle = std::thread::Builder::new()
            .name("strata-compaction".to_string())
            .spawn(move || compaction::run_worker(worker_shared))
            .map_err(|e| Error::Io(format!("failed to spawn compaction worker: {e}")))?;

        Ok(Self {
            shared,
            worker: Mutex::new(Some(handle)),
            closed: AtomicBool::new(false),
        })
    }

    /// Store a value. The write is durable from the caller's viewpoint once
    /// the WAL append succeeds (and is synced when `sync_on_write` is set).
    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.write(key, value, WalOp::Put)
    }

    /// Delete a key by recording a tombstone. Succeeds whether or not the
    /// key exists.
    pub fn delete(&self, key: &[u8]) -> Result<()> {
        self.write(key, b"", WalOp::Delete)
    }

    fn write(&self, key: &[u8], value: &[u8], op: WalOp) -> Result<()> {
        self.check_open()?;
        if key.is_empty() {
            return invariant!("keys must be non-empty");
        }

        let mut inner = self.shared.inner.write()?;
        let timestamp = next_timestamp(&mut inner);

        inner.wal.append(op, key, value, timestamp)?;
        if self.shared.config.sync_on_write {
            inner.wal.sync()?;
        }

        match op {
            WalOp::Put => inner.active.put(key.to_vec(), value.to_vec(), timestamp),
            WalOp::Delete => inner.active.delete(key.to_vec(), timestamp),
        }
        self.shared.cache.lock()?.invalidate(key);

        if inner.active.size_bytes() >= self.shared.config.memtable_threshold_bytes {
            self.rotate_and_flush(&mut inner)?;
        }
        Ok(())
    }

    /// Point lookup across all tiers, newest first. A tombstone at any tier
    /// terminates the search.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.check_open()?;
        let inner = self.shared.inner.read()?;

        // Cache population happens while the read lock is held, so a
        // concurrent write cannot slip in between the lookup and the
        // insert and leave a stale cached value behind.
        if let Some(value) = self.shared.cache.lock()?.get(key) {
            return Ok(Some(value));
        }

        match inner.active.get(key) {
            Lookup::Found(value) => {
                self.shared.cache.lock()?.put(key, value.clone());
                return Ok(Some(value));
            }
            Lookup::Tombstone => return Ok(None),
            Lookup::Absent => {}
        }

        if let Some(immutable) = &inner.immutable {
            match immutable.get(key) {
                Lookup::Found(value) => {
                    self.shared.cache.lock()?.put(key, value.clone());
                    return Ok(Some(value));
                }
                Lookup::Tombstone => return Ok(None),
                Lookup::Absent => {}
            }
        }

        for table in &inner.tables {
            if !table.might_contain(key) {
                continue;
            }
            match table.get(key)? {
                Lookup::Found(value) => {
                    self.shared.cache.lock()?.put(key, value.clone());
                    return Ok(Some(value));
                }
                Lookup::Tombstone => return Ok(None),
                Lookup::Absent => {}
            }
        }

        Ok(None)
    }

    /// Ordered scan of live pairs with `start <= key <= end`, newest
    /// version per key, tombstoned keys filtered out, at most `limit`
    /// results.
    pub fn scan(&self, start: &[u8], end: &[u8], limit: usize) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        self.check_open()?;
        if start > end {
            return Ok(Vec::new());
        }
        let inner = self.shared.inner.read()?;

        let mut sources: Vec<EntryStream> = Vec::with_capacity(inner.tables.len() + 2);
        sources.push(Box::new(inner.active.range(start, end).into_iter().map(Ok)));
        if let Some(immutable) = &inner.immutable {
            sources.push(Box::new(immutable.range(start, end).into_iter().map(Ok)));
        }
        for table in &inner.tables {
            if table.overlaps(start, end) {
                sources.push(Box::new(table.range(start, end)?));
            }
        }

        let mut results = Vec::new();
        for item in EntryMerge::new(sources) {
            if results.len() >= limit {
                break;
            }
            let entry = item?;
            if entry.deleted {
                continue;
            }
            results.push((entry.key, entry.value));
        }
        Ok(results)
    }

    /// Force the active memtable out to a level-0 SSTable.
    pub fn flush(&self) -> Result<()> {
        self.check_open()?;
        let mut inner = self.shared.inner.write()?;
        if inner.active.is_empty() && inner.immutable.is_none() {
            return Ok(());
        }
        self.rotate_and_flush(&mut inner)
    }

    /// Force a full compaction: every table merged down to one level.
    pub fn compact(&self) -> Result<()> {
        self.check_open()?;
        compaction::compact_full(&self.shared)
    }

    pub fn stats(&self) -> Result<EngineStats> {
        self.check_open()?;
        let inner = self.shared.inner.read()?;
        let cache = self.shared.cache.lock()?;

        let memtable_size = inner.active.size_bytes()
            + inner
                .immutable
                .as_ref()
                .map_or(0, |immutable| immutable.size_bytes());
        let approx_num_keys = inner.active.len()
            + inner.immutable.as_ref().map_or(0, |immutable| immutable.len())
            + inner.tables.iter().map(|t| t.num_entries()).sum::<usize>();

        Ok(EngineStats {
            memtable_size,
            num_sstables: inner.tables.len(),
            total_disk_bytes: inner.tables.iter().map(|t| t.file_size()).sum(),
            approx_num_keys,
            cache_hits: cache.hits(),
            cache_misses: cache.misses(),
        })
    }

    /// Close the engine: stop the compaction worker, flush remaining
    /// memtables, sync the WAL and release the directory lock. Idempotent.
    pub fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.stop_worker()?;

        let mut inner = self.shared.inner.write()?;
        if inner.immutable.is_some() {
            self.flush_immutable(&mut inner)?;
        }
        if !inner.active.is_empty() {
            let full = std::mem::replace(&mut inner.active, Memtable::new());
            inner.immutable = Some(full);
            self.flush_immutable(&mut inner)?;
        }
        inner.wal.sync()?;
        inner.lock.take();

        tracing::info!("Closed store");
        Ok(())
    }

    fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Closed);
        }
        Ok(())
    }

    fn stop_worker(&self) -> Result<()> {
        {
            let mut work = self.shared.work.lock()?;
            work.shutdown = true;
            self.shared.work_cv.notify_all();
        }
        if let Some(handle) = self.worker.lock()?.take() {
            handle
                .join()
                .map_err(|_| Error::Io("compaction worker panicked".to_string()))?;
        }
        Ok(())
    }

    /// Rotate the active memtable into the immutable slot and flush it. If
    /// a previous flush failed, its memtable is retried before rotating.
    fn rotate_and_flush(&self, inner: &mut Inner) -> Result<()> {
        if inner.immutable.is_some() {
            self.flush_immutable(inner)?;
        }
        let full = std::mem::replace(&mut inner.active, Memtable::new());
        inner.immutable = Some(full);
        self.flush_immutable(inner)
    }

    /// Flush the immutable memtable to a new level-0 SSTable, then truncate
    /// the WAL and release the memtable. On failure both the WAL and the
    /// immutable memtable stay in place, so the flush can be retried and
    /// recovery can replay the log.
    fn flush_immutable(&self, inner: &mut Inner) -> Result<()> {
        let Some(immutable) = &inner.immutable else {
            return Ok(());
        };

        let entries = immutable.entries();
        if entries.is_empty() {
            inner.immutable = None;
            if inner.active.is_empty() {
                inner.wal.clear()?;
            }
            return Ok(());
        }

        let id = self.shared.next_table_id();
        let table = SsTable::create(
            &self.shared.config.data_dir,
            id,
            0,
            &entries,
            &self.shared.table_options(),
        )?;
        inner.tables.push(Arc::new(table));
        sort_read_order(&mut inner.tables);

        // The WAL covers both the immutable and the active memtable.
        // Truncating is only safe once the active memtable is empty; until
        // then the WAL stays, and a redundant WAL replays harmlessly
        // (timestamps break the ties).
        inner.immutable = None;
        if inner.active.is_empty() {
            inner.wal.sync()?;
            inner.wal.clear()?;
        }

        tracing::info!(table_id = id, entries = entries.len(), "Flushed memtable");
        self.shared.notify_compaction();
        Ok(())
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        // Dropping without close() does not flush; the WAL replays the
        // unflushed writes on the next open.
        let _ = self.stop_worker();
    }
}

/// Assigns the next write timestamp: wall-clock milliseconds, bumped past
/// the previous value so timestamps are strictly increasing.
fn next_timestamp(inner: &mut Inner) -> u64 {
    let timestamp = now_ms().max(inner.last_timestamp + 1);
    inner.last_timestamp = timestamp;
    timestamp
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
