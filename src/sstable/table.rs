//! SSTable writing and reading.
//!
//! ## File layout
//!
//! ```text
//! +--------------------------+
//! | Header                   |  magic, entry count, flags, level, id, created
//! +--------------------------+
//! | Data records             |  key-ascending, framed entries
//! +--------------------------+
//! | Index block              |  sparse: one record per INDEX_INTERVAL entries
//! +--------------------------+
//! | Bloom block (optional)   |  u32 length | serialized filter
//! +--------------------------+
//! | Footer                   |  index offset, bloom offset, magic
//! +--------------------------+
//! ```
//!
//! Each data record is framed as
//! `u32 key_len | key | u32 value_len | value | u8 deleted | u64 timestamp`,
//! all integers little-endian. Data records are strictly ascending by key
//! and every index offset points at the start of a data record.
//!
//! Creation is crash-atomic: the table is written to `<id>.sst.tmp`, synced,
//! and renamed into place. A leftover `.tmp` file (or a file without footer
//! magic) is the residue of a crash and is discarded at engine startup.

use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::bloom::BloomFilter;
use crate::entry::{Entry, Lookup};
use crate::error::Result;
use crate::sstable::index::SparseIndex;
use crate::{corrupt, invariant};

/// `SST1` in ASCII; written in the header and repeated in the footer.
pub const MAGIC: u32 = 0x5353_5401;

const FLAG_COMPRESSION: u8 = 0b0000_0001;
const FLAG_BLOOM: u8 = 0b0000_0010;

/// One sparse-index record per this many data records.
pub const INDEX_INTERVAL: usize = 16;

/// magic + entry count + flags + level + id + created_ms
const HEADER_LEN: u64 = 4 + 4 + 1 + 1 + 8 + 8;
/// index offset + bloom offset + magic
const FOOTER_LEN: u64 = 8 + 8 + 4;

/// Options controlling what `SsTable::create` writes.
#[derive(Debug, Clone)]
pub struct TableOptions {
    pub bloom_filter: bool,
    pub false_positive_rate: f64,
    pub compression: bool,
}

impl Default for TableOptions {
    fn default() -> Self {
        Self {
            bloom_filter: true,
            false_positive_rate: 0.01,
            compression: true,
        }
    }
}

/// An immutable on-disk table. Open tables keep their index and bloom
/// filter fully in memory; data records are read on demand through a cloned
/// file handle, so concurrent readers never contend on a seek position.
pub struct SsTable {
    file: File,
    path: PathBuf,
    id: u64,
    level: u8,
    flags: u8,
    num_entries: u32,
    created_ms: u64,
    file_size: u64,
    /// Offset one past the last data record (== index offset).
    data_end: u64,
    index: SparseIndex,
    bloom: Option<BloomFilter>,
    first_key: Vec<u8>,
    last_key: Vec<u8>,
    doomed: AtomicBool,
}

impl SsTable {
    /// Filename for a table id: zero-padded decimal, `.sst` extension.
    pub fn file_name(id: u64) -> String {
        format!("{id:08}.sst")
    }

    /// Writes a new table into `dir` and reopens it for reading.
    ///
    /// `entries` must be strictly ascending by key with no duplicates; the
    /// callers (flush and compaction) both produce sorted, deduplicated
    /// runs, so a violation here is a programmer error.
    pub fn create(
        dir: &Path,
        id: u64,
        level: u8,
        entries: &[Entry],
        options: &TableOptions,
    ) -> Result<Self> {
        if entries.is_empty() {
            return invariant!("cannot create an empty SSTable");
        }
        for pair in entries.windows(2) {
            if pair[0].key >= pair[1].key {
                return invariant!(
                    "unsorted or duplicate keys handed to SSTable::create (table {id})"
                );
            }
        }

        let final_path = dir.join(Self::file_name(id));
        let tmp_path = dir.join(format!("{}.tmp", Self::file_name(id)));

        let created_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);

        let mut flags = 0u8;
        if options.compression {
            flags |= FLAG_COMPRESSION;
        }
        if options.bloom_filter {
            flags |= FLAG_BLOOM;
        }

        let file = File::create(&tmp_path)?;
        let mut writer = BufWriter::new(file);

        writer.write_u32::<LittleEndian>(MAGIC)?;
        writer.write_u32::<LittleEndian>(entries.len() as u32)?;
        writer.write_u8(flags)?;
        writer.write_u8(level)?;
        writer.write_u64::<LittleEndian>(id)?;
        writer.write_u64::<LittleEndian>(created_ms)?;

        let mut index = SparseIndex::new();
        let mut bloom = options
            .bloom_filter
            .then(|| BloomFilter::new(entries.len(), options.false_positive_rate));

        let mut offset = HEADER_LEN;
        for (i, entry) in entries.iter().enumerate() {
            let record_len = entry.encoded_len() as u64;
            if i % INDEX_INTERVAL == 0 {
                index.push(entry.key.clone(), offset, record_len as u32);
            }
            if let Some(bloom) = bloom.as_mut() {
                bloom.add(&entry.key);
            }

            writer.write_u32::<LittleEndian>(entry.key.len() as u32)?;
            writer.write_all(&entry.key)?;
            writer.write_u32::<LittleEndian>(entry.value.len() as u32)?;
            writer.write_all(&entry.value)?;
            writer.write_u8(entry.deleted as u8)?;
            writer.write_u64::<LittleEndian>(entry.timestamp)?;
            offset += record_len;
        }

        let index_offset = offset;
        let index_block = index.encode()?;
        writer.write_all(&index_block)?;
        offset += index_block.len() as u64;

        let bloom_offset = match bloom.as_ref() {
            Some(bloom) => {
                let bloom_block = bloom.to_bytes();
                writer.write_u32::<LittleEndian>(bloom_block.len() as u32)?;
                writer.write_all(&bloom_block)?;
                offset
            }
            None => 0,
        };

        writer.write_u64::<LittleEndian>(index_offset)?;
        writer.write_u64::<LittleEndian>(bloom_offset)?;
        writer.write_u32::<LittleEndian>(MAGIC)?;

        writer.flush()?;
        writer.get_ref().sync_all()?;
        drop(writer);

        fs::rename(&tmp_path, &final_path)?;
        // Make the rename itself durable.
        File::open(dir)?.sync_all()?;

        Self::open(&final_path)
    }

    /// Opens an existing table, validating both magics and loading the
    /// index and bloom filter into memory.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut file = File::open(&path)?;
        let file_size = file.metadata()?.len();

        if file_size < HEADER_LEN + FOOTER_LEN {
            return corrupt!("SSTable {path:?} too short ({file_size} bytes)");
        }

        let magic = file.read_u32::<LittleEndian>()?;
        if magic != MAGIC {
            return corrupt!("SSTable {path:?} has bad header magic {magic:#x}");
        }
        let num_entries = file.read_u32::<LittleEndian>()?;
        let flags = file.read_u8()?;
        let level = file.read_u8()?;
        let id = file.read_u64::<LittleEndian>()?;
        let created_ms = file.read_u64::<LittleEndian>()?;

        file.seek(SeekFrom::End(-(FOOTER_LEN as i64)))?;
        let index_offset = file.read_u64::<LittleEndian>()?;
        let bloom_offset = file.read_u64::<LittleEndian>()?;
        let footer_magic = file.read_u32::<LittleEndian>()?;
        if footer_magic != MAGIC {
            return corrupt!("SSTable {path:?} has bad footer magic {footer_magic:#x}");
        }
        if index_offset < HEADER_LEN || index_offset > file_size - FOOTER_LEN {
            return corrupt!("SSTable {path:?} index offset {index_offset} out of bounds");
        }
        if bloom_offset != 0 && (bloom_offset < index_offset || bloom_offset > file_size - FOOTER_LEN)
        {
            return corrupt!("SSTable {path:?} bloom offset {bloom_offset} out of bounds");
        }

        let index_end = if bloom_offset != 0 {
            bloom_offset
        } else {
            file_size - FOOTER_LEN
        };
        let mut index_block = vec![0u8; (index_end - index_offset) as usize];
        file.seek(SeekFrom::Start(index_offset))?;
        file.read_exact(&mut index_block)?;
        let index = SparseIndex::decode(&index_block)?;

        let bloom = if flags & FLAG_BLOOM != 0 && bloom_offset != 0 {
            file.seek(SeekFrom::Start(bloom_offset))?;
            let len = file.read_u32::<LittleEndian>()? as usize;
            let mut bloom_block = vec![0u8; len];
            file.read_exact(&mut bloom_block)?;
            Some(BloomFilter::from_bytes(&bloom_block)?)
        } else {
            None
        };

        let first_key = match index.first_key() {
            Some(key) => key.to_vec(),
            None => return corrupt!("SSTable {path:?} has an empty index"),
        };

        // The last key is not indexed; scan the final index interval for it.
        let last_start = index.last_entry().map(|e| e.offset).unwrap_or(HEADER_LEN);
        let mut last_key = first_key.clone();
        {
            let mut reader = BufReader::new(file.try_clone()?);
            reader.seek(SeekFrom::Start(last_start))?;
            let mut pos = last_start;
            while pos < index_offset {
                let entry = read_record(&mut reader)?;
                pos += entry.encoded_len() as u64;
                last_key = entry.key;
            }
        }

        Ok(Self {
            file,
            path,
            id,
            level,
            flags,
            num_entries,
            created_ms,
            file_size,
            data_end: index_offset,
            index,
            bloom,
            first_key,
            last_key,
            doomed: AtomicBool::new(false),
        })
    }

    /// Fast negative check: key-range first, then the bloom filter. A table
    /// without a bloom block can only answer "maybe".
    pub fn might_contain(&self, key: &[u8]) -> bool {
        if key < self.first_key.as_slice() || key > self.last_key.as_slice() {
            return false;
        }
        match &self.bloom {
            Some(bloom) => bloom.might_contain(key),
            None => true,
        }
    }

    /// Point lookup: binary-search the sparse index, then scan at most one
    /// index interval of data records.
    pub fn get(&self, key: &[u8]) -> Result<Lookup> {
        let Some(index_entry) = self.index.find(key) else {
            return Ok(Lookup::Absent);
        };

        let mut reader = BufReader::new(self.file.try_clone()?);
        reader.seek(SeekFrom::Start(index_entry.offset))?;
        let mut pos = index_entry.offset;

        while pos < self.data_end {
            let entry = read_record(&mut reader)?;
            pos += entry.encoded_len() as u64;
            match entry.key.as_slice().cmp(key) {
                std::cmp::Ordering::Less => continue,
                std::cmp::Ordering::Equal => {
                    return Ok(if entry.deleted {
                        Lookup::Tombstone
                    } else {
                        Lookup::Found(entry.value)
                    });
                }
                std::cmp::Ordering::Greater => break,
            }
        }
        Ok(Lookup::Absent)
    }

    /// Streaming iterator over entries with `start <= key <= end`,
    /// tombstones included.
    pub fn range(&self, start: &[u8], end: &[u8]) -> Result<TableIter> {
        let from = match self.index.find(start) {
            Some(entry) => entry.offset,
            // Search key sorts before the first indexed key; the first data
            // record sits right after the header.
            None => HEADER_LEN,
        };
        TableIter::new(
            self.file.try_clone()?,
            from,
            self.data_end,
            Some(start.to_vec()),
            Some(end.to_vec()),
        )
    }

    /// Streaming iterator over every entry. Used by compaction.
    pub fn iter(&self) -> Result<TableIter> {
        TableIter::new(self.file.try_clone()?, HEADER_LEN, self.data_end, None, None)
    }

    /// Bounded range scan, collecting at most `limit` entries.
    pub fn scan(&self, start: &[u8], end: &[u8], limit: usize) -> Result<Vec<Entry>> {
        let mut results = Vec::new();
        for entry in self.range(start, end)? {
            if results.len() >= limit {
                break;
            }
            results.push(entry?);
        }
        Ok(results)
    }

    /// Marks the backing file for deletion once the last reference to this
    /// table drops. In-flight reads keep their open handle until then.
    pub fn doom(&self) {
        self.doomed.store(true, Ordering::SeqCst);
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn level(&self) -> u8 {
        self.level
    }

    pub fn num_entries(&self) -> usize {
        self.num_entries as usize
    }

    pub fn created_ms(&self) -> u64 {
        self.created_ms
    }

    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    pub fn first_key(&self) -> &[u8] {
        &self.first_key
    }

    pub fn last_key(&self) -> &[u8] {
        &self.last_key
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn has_bloom(&self) -> bool {
        self.bloom.is_some()
    }

    pub fn compression_flag(&self) -> bool {
        self.flags & FLAG_COMPRESSION != 0
    }

    /// True when this table's key range intersects `[first, last]`.
    pub fn overlaps(&self, first: &[u8], last: &[u8]) -> bool {
        self.first_key.as_slice() <= last && self.last_key.as_slice() >= first
    }
}

impl Drop for SsTable {
    fn drop(&mut self) {
        if self.doomed.load(Ordering::SeqCst) {
            if let Err(e) = fs::remove_file(&self.path) {
                tracing::warn!(path = ?self.path, error = %e, "Failed to delete obsolete SSTable");
            }
        }
    }
}

impl std::fmt::Debug for SsTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SsTable")
            .field("id", &self.id)
            .field("level", &self.level)
            .field("num_entries", &self.num_entries)
            .field("path", &self.path)
            .finish()
    }
}

fn read_record(reader: &mut impl Read) -> Result<Entry> {
    let key_len = reader.read_u32::<LittleEndian>()? as usize;
    let mut key = vec![0u8; key_len];
    reader.read_exact(&mut key)?;

    let value_len = reader.read_u32::<LittleEndian>()? as usize;
    let mut value = vec![0u8; value_len];
    reader.read_exact(&mut value)?;

    let deleted = reader.read_u8()? != 0;
    let timestamp = reader.read_u64::<LittleEndian>()?;

    Ok(Entry {
        key,
        value,
        deleted,
        timestamp,
    })
}

/// Streaming iterator over a table's data records, optionally bounded on
/// both ends (inclusive).
pub struct TableIter {
    reader: BufReader<File>,
    pos: u64,
    data_end: u64,
    start: Option<Vec<u8>>,
    end: Option<Vec<u8>>,
    done: bool,
}

impl TableIter {
    fn new(
        file: File,
        from: u64,
        data_end: u64,
        start: Option<Vec<u8>>,
        end: Option<Vec<u8>>,
    ) -> Result<Self> {
        let mut reader = BufReader::new(file);
        reader.seek(SeekFrom::Start(from))?;
        Ok(Self {
            reader,
            pos: from,
            data_end,
            start,
            end,
            done: false,
        })
    }
}

impl Iterator for TableIter {
    type Item = Result<Entry>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.done || self.pos >= self.data_end {
                return None;
            }

            let entry = match read_record(&mut self.reader) {
                Ok(entry) => entry,
                Err(e) => {
                    self.done = true;
                    return Some(Err(e));
                }
            };
            self.pos += entry.encoded_len() as u64;

            // Records below the start bound live in the same index interval
            // as the first in-range record; skip past them.
            if let Some(start) = &self.start {
                if entry.key.as_slice() < start.as_slice() {
                    continue;
                }
            }
            if let Some(end) = &self.end {
                if entry.key.as_slice() > end.as_slice() {
                    self.done = true;
                    return None;
                }
            }

            return Some(Ok(entry));
        }
    }
}
