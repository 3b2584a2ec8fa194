//! Sparse index for efficient SSTable record lookup.

use std::io::Read;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::error::Result;

/// A single index record: the key of a data record together with its file
/// offset and encoded size.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexEntry {
    pub key: Vec<u8>,
    pub offset: u64,
    pub size: u32,
}

/// The sparse index of an SSTable: one record per `INDEX_INTERVAL` data
/// records, in ascending key order. Every offset points at the start of a
/// data record, so a lookup seeks to the greatest index key at or below the
/// target and scans forward from there.
///
/// Wire format (little-endian):
/// `u32 entry_count` followed by `u32 key_len | key | u64 offset | u32 size`
/// per record.
#[derive(Debug, Clone, Default)]
pub struct SparseIndex {
    entries: Vec<IndexEntry>,
}

impl SparseIndex {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Appends an index record. Keys must arrive in ascending order; the
    /// table writer guarantees this.
    pub fn push(&mut self, key: Vec<u8>, offset: u64, size: u32) {
        self.entries.push(IndexEntry { key, offset, size });
    }

    /// Finds the index record with the greatest key `<=` the search key.
    /// Returns `None` when the search key sorts before every indexed key.
    pub fn find(&self, key: &[u8]) -> Option<&IndexEntry> {
        match self
            .entries
            .binary_search_by(|entry| entry.key.as_slice().cmp(key))
        {
            Ok(idx) => Some(&self.entries[idx]),
            Err(0) => None,
            Err(idx) => Some(&self.entries[idx - 1]),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn first_key(&self) -> Option<&[u8]> {
        self.entries.first().map(|e| e.key.as_slice())
    }

    pub fn last_entry(&self) -> Option<&IndexEntry> {
        self.entries.last()
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        buf.write_u32::<LittleEndian>(self.entries.len() as u32)?;
        for entry in &self.entries {
            buf.write_u32::<LittleEndian>(entry.key.len() as u32)?;
            buf.extend_from_slice(&entry.key);
            buf.write_u64::<LittleEndian>(entry.offset)?;
            buf.write_u32::<LittleEndian>(entry.size)?;
        }
        Ok(buf)
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut cursor = std::io::Cursor::new(data);
        let count = cursor.read_u32::<LittleEndian>()? as usize;

        let mut entries = Vec::with_capacity(count);
        for _ in 0..count {
            let key_len = cursor.read_u32::<LittleEndian>()? as usize;
            let mut key = vec![0u8; key_len];
            cursor.read_exact(&mut key)?;
            let offset = cursor.read_u64::<LittleEndian>()?;
            let size = cursor.read_u32::<LittleEndian>()?;
            entries.push(IndexEntry { key, offset, size });
        }

        Ok(Self { entries })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_index() -> SparseIndex {
        let mut index = SparseIndex::new();
        index.push(b"apple".to_vec(), 0, 100);
        index.push(b"banana".to_vec(), 100, 100);
        index.push(b"cherry".to_vec(), 200, 100);
        index
    }

    #[test]
    fn test_find_exact_match() {
        let index = create_test_index();
        let entry = index.find(b"banana").unwrap();
        assert_eq!(entry.key, b"banana");
        assert_eq!(entry.offset, 100);
    }

    #[test]
    fn test_find_between_entries() {
        let index = create_test_index();
        let entry = index.find(b"apricot").unwrap();
        assert_eq!(entry.key, b"apple");
        assert_eq!(entry.offset, 0);
    }

    #[test]
    fn test_find_smaller_than_all() {
        let index = create_test_index();
        assert!(index.find(b"ant").is_none());
    }

    #[test]
    fn test_find_larger_than_all() {
        let index = create_test_index();
        let entry = index.find(b"date").unwrap();
        assert_eq!(entry.key, b"cherry");
    }

    #[test]
    fn test_find_empty_index() {
        let index = SparseIndex::new();
        assert!(index.find(b"any").is_none());
    }

    #[test]
    fn test_serialization_roundtrip() {
        let original = create_test_index();
        let buffer = original.encode().unwrap();
        let decoded = SparseIndex::decode(&buffer).unwrap();

        assert_eq!(decoded.len(), 3);
        assert_eq!(decoded.find(b"banana").unwrap().offset, 100);
        assert_eq!(decoded.first_key(), Some(b"apple".as_slice()));
        assert_eq!(decoded.last_entry().unwrap().key, b"cherry");
    }

    #[test]
    fn test_empty_serialization_roundtrip() {
        let original = SparseIndex::new();
        let buffer = original.encode().unwrap();
        let decoded = SparseIndex::decode(&buffer).unwrap();
        assert!(decoded.is_empty());
    }
}
