//! In-memory sorted table of recent writes, including tombstones.
//!
//! The memtable is the first tier of the store: every write lands here
//! (after the WAL) and stays until a flush turns the table into a level-0
//! SSTable. A `crossbeam_skiplist::SkipMap` keeps keys in lexicographic
//! order and supports concurrent readers while the engine holds its read
//! lock; writers are serialized by the engine's write lock.
//!
//! Deletes are stored as tombstone records so that a deleted key shadows
//! older occurrences in deeper tiers until compaction can drop it.

use std::ops::Bound;
use std::sync::atomic::{AtomicUsize, Ordering};

use crossbeam_skiplist::SkipMap;

use crate::entry::{Entry, Lookup};

/// Fixed per-entry overhead added to `key.len + value.len` for the
/// flush-threshold footprint.
pub const ENTRY_OVERHEAD: usize = 32;

#[derive(Debug, Clone)]
struct Record {
    value: Vec<u8>,
    deleted: bool,
    timestamp: u64,
}

#[derive(Debug)]
pub struct Memtable {
    data: SkipMap<Vec<u8>, Record>,
    size: AtomicUsize,
}

impl Memtable {
    pub fn new() -> Self {
        Self {
            data: SkipMap::new(),
            size: AtomicUsize::new(0),
        }
    }

    /// Inserts or overwrites a live entry for `key`.
    pub fn put(&self, key: Vec<u8>, value: Vec<u8>, timestamp: u64) {
        self.insert(
            key,
            Record {
                value,
                deleted: false,
                timestamp,
            },
        );
    }

    /// Inserts a tombstone for `key`, overwriting any prior live entry.
    pub fn delete(&self, key: Vec<u8>, timestamp: u64) {
        self.insert(
            key,
            Record {
                value: Vec::new(),
                deleted: true,
                timestamp,
            },
        );
    }

    fn insert(&self, key: Vec<u8>, record: Record) {
        // Writers are serialized by the engine lock, so the footprint
        // adjustment cannot race with another insert for the same key.
        if let Some(old) = self.data.get(&key) {
            let old_size = key.len() + old.value().value.len() + ENTRY_OVERHEAD;
            self.size.fetch_sub(old_size, Ordering::SeqCst);
        }
        let new_size = key.len() + record.value.len() + ENTRY_OVERHEAD;
        self.data.insert(key, record);
        self.size.fetch_add(new_size, Ordering::SeqCst);
    }

    /// Three-valued lookup: `Tombstone` means the key was deleted in this
    /// memtable's lifetime and must not be searched in older tiers.
    pub fn get(&self, key: &[u8]) -> Lookup {
        match self.data.get(key) {
            Some(entry) => {
                let record = entry.value();
                if record.deleted {
                    Lookup::Tombstone
                } else {
                    Lookup::Found(record.value.clone())
                }
            }
            None => Lookup::Absent,
        }
    }

    /// Snapshot of every entry in ascending key order, tombstones included.
    /// Used by flush.
    pub fn entries(&self) -> Vec<Entry> {
        self.data
            .iter()
            .map(|e| {
                let record = e.value();
                Entry {
                    key: e.key().clone(),
                    value: record.value.clone(),
                    deleted: record.deleted,
                    timestamp: record.timestamp,
                }
            })
            .collect()
    }

    /// Entries with `start <= key <= end` in ascending order, tombstones
    /// included. Used by the engine's scan merge.
    pub fn range(&self, start: &[u8], end: &[u8]) -> Vec<Entry> {
        let bounds = (
            Bound::Included(start.to_vec()),
            Bound::Included(end.to_vec()),
        );
        self.data
            .range(bounds)
            .map(|e| {
                let record = e.value();
                Entry {
                    key: e.key().clone(),
                    value: record.value.clone(),
                    deleted: record.deleted,
                    timestamp: record.timestamp,
                }
            })
            .collect()
    }

    /// Approximate byte footprint; readable without locking.
    pub fn size_bytes(&self) -> usize {
        self.size.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}
