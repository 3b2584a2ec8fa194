//! K-way merge across sorted entry streams.
//!
//! The engine's scan and the compactor both face the same problem: several
//! sorted sources (memtables, SSTables) may each hold a version of the same
//! key, and only the newest version must win. A min-heap keyed
//! on `(key, timestamp)` yields entries in ascending key order and, within
//! a key, newest first; the merge emits the first occurrence of each key
//! and drops the rest.
//!
//! Timestamps are strictly increasing per engine, so the greatest timestamp
//! alone identifies the newest version. Source order (newest tier first)
//! only breaks the tie for entries with equal timestamps, which cannot
//! occur for entries written by a single engine.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use crate::entry::Entry;
use crate::error::Result;

/// A sorted stream of entries feeding the merge.
pub type EntryStream = Box<dyn Iterator<Item = Result<Entry>>>;

struct HeapEntry {
    entry: Entry,
    source: usize,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap pops the greatest element, so "greatest" must mean:
        // smallest key, then newest timestamp, then newest source.
        other
            .entry
            .key
            .cmp(&self.entry.key)
            .then(self.entry.timestamp.cmp(&other.entry.timestamp))
            .then(other.source.cmp(&self.source))
    }
}

/// Merges N sorted streams into one ascending stream with exactly one entry
/// per key (the newest version, tombstones included).
pub struct EntryMerge {
    sources: Vec<EntryStream>,
    heap: BinaryHeap<HeapEntry>,
    last_key: Option<Vec<u8>>,
    init_error: Option<crate::Error>,
}

impl EntryMerge {
    /// `sources` must each be sorted ascending by key. Order them
    /// newest-tier-first; the index is the timestamp tie-breaker.
    pub fn new(sources: Vec<EntryStream>) -> Self {
        let mut merge = Self {
            sources,
            heap: BinaryHeap::new(),
            last_key: None,
            init_error: None,
        };
        for source in 0..merge.sources.len() {
            if let Err(e) = merge.refill(source) {
                merge.init_error = Some(e);
                break;
            }
        }
        merge
    }

    /// Pulls the next entry from a source into the heap.
    fn refill(&mut self, source: usize) -> Result<()> {
        if let Some(item) = self.sources[source].next() {
            let entry = item?;
            self.heap.push(HeapEntry { entry, source });
        }
        Ok(())
    }
}

impl Iterator for EntryMerge {
    type Item = Result<Entry>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(e) = self.init_error.take() {
            return Some(Err(e));
        }

        while let Some(top) = self.heap.pop() {
            if let Err(e) = self.refill(top.source) {
                return Some(Err(e));
            }

            // The first occurrence of a key is the newest; later ones are
            // shadowed versions from older tiers.
            if self.last_key.as_deref() == Some(top.entry.key.as_slice()) {
                continue;
            }
            self.last_key = Some(top.entry.key.clone());
            return Some(Ok(top.entry));
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stream(entries: Vec<Entry>) -> EntryStream {
        Box::new(entries.into_iter().map(Ok))
    }

    fn put(key: &[u8], value: &[u8], timestamp: u64) -> Entry {
        Entry::put(key.to_vec(), value.to_vec(), timestamp)
    }

    #[test]
    fn test_merge_disjoint_sources() {
        let merge = EntryMerge::new(vec![
            stream(vec![put(b"a", b"1", 1), put(b"d", b"4", 4)]),
            stream(vec![put(b"b", b"2", 2), put(b"c", b"3", 3)]),
        ]);

        let keys: Vec<_> = merge.map(|r| r.unwrap().key).collect();
        assert_eq!(
            keys,
            vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec(), b"d".to_vec()]
        );
    }

    #[test]
    fn test_newest_timestamp_wins() {
        let merge = EntryMerge::new(vec![
            stream(vec![put(b"k", b"old", 5)]),
            stream(vec![put(b"k", b"new", 9)]),
            stream(vec![put(b"k", b"oldest", 1)]),
        ]);

        let entries: Vec<_> = merge.map(|r| r.unwrap()).collect();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].value, b"new");
        assert_eq!(entries[0].timestamp, 9);
    }

    #[test]
    fn test_equal_timestamps_prefer_earlier_source() {
        let merge = EntryMerge::new(vec![
            stream(vec![put(b"k", b"newer_tier", 5)]),
            stream(vec![put(b"k", b"older_tier", 5)]),
        ]);

        let entries: Vec<_> = merge.map(|r| r.unwrap()).collect();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].value, b"newer_tier");
    }

    #[test]
    fn test_tombstones_flow_through() {
        let merge = EntryMerge::new(vec![
            stream(vec![Entry::tombstone(b"k".to_vec(), 9)]),
            stream(vec![put(b"k", b"shadowed", 3)]),
        ]);

        let entries: Vec<_> = merge.map(|r| r.unwrap()).collect();
        assert_eq!(entries.len(), 1);
        assert!(entries[0].deleted);
    }

    #[test]
    fn test_empty_sources() {
        let merge = EntryMerge::new(vec![stream(vec![]), stream(vec![])]);
        assert_eq!(merge.count(), 0);
    }

    #[test]
    fn test_interleaved_duplicates() {
        let merge = EntryMerge::new(vec![
            stream(vec![put(b"a", b"a2", 10), put(b"b", b"b1", 2)]),
            stream(vec![put(b"a", b"a1", 1), put(b"b", b"b2", 20), put(b"c", b"c1", 3)]),
        ]);

        let entries: Vec<_> = merge.map(|r| r.unwrap()).collect();
        let pairs: Vec<_> = entries.iter().map(|e| (e.key.clone(), e.value.clone())).collect();
        assert_eq!(
            pairs,
            vec![
                (b"a".to_vec(), b"a2".to_vec()),
                (b"b".to_vec(), b"b2".to_vec()),
                (b"c".to_vec(), b"c1".to_vec()),
            ]
        );
    }
}
