//! Write-Ahead Log for durability and recovery.
//!
//! Every mutation is appended here before it reaches the memtable, so a
//! crash can never lose a write the engine acknowledged under
//! `sync_on_write`. One WAL file is live at a time; it is truncated after
//! the corresponding memtable has been durably flushed to an SSTable.
//!
//! # Record format
//!
//! Each record is variable-length (all integers little-endian):
//!
//! ```text
//! +---------+-------------+-------+-------------+-------+---------------+--------------+
//! | type:u8 | key_len:u32 |  key  | val_len:u32 | value | timestamp:u64 | checksum:u32 |
//! +---------+-------------+-------+-------------+-------+---------------+--------------+
//! ```
//!
//! - `type`: 1 = PUT, 2 = DELETE (deletes carry an empty value)
//! - the CRC-32 checksum covers type, key, value and timestamp
//!
//! Recovery reads records from the start of the file in order. A record
//! with a bad checksum or one cut short at EOF ends recovery silently:
//! partial tail records are the expected residue of a crash, not
//! corruption.

use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use crc::{Crc, CRC_32_ISCSI};

use crate::error::Result;

pub const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

const RECORD_PUT: u8 = 1;
const RECORD_DELETE: u8 = 2;

/// The operation a WAL record describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalOp {
    Put,
    Delete,
}

/// A recovered WAL record, in file order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalRecord {
    pub op: WalOp,
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    pub timestamp: u64,
}

#[derive(Debug)]
pub struct Wal {
    file: File,
    path: PathBuf,
    size: u64,
}

impl Wal {
    /// Opens the WAL file, creating it if missing. Appends go to the end of
    /// any existing content.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut file = File::options()
            .create(true)
            .read(true)
            .append(true)
            .open(&path)?;
        let size = file.seek(SeekFrom::End(0))?;
        Ok(Self { file, path, size })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current size of the WAL in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Appends one record. The write is a single `write_all`; durability is
    /// the caller's business via `sync()`.
    pub fn append(&mut self, op: WalOp, key: &[u8], value: &[u8], timestamp: u64) -> Result<()> {
        let record_type = match op {
            WalOp::Put => RECORD_PUT,
            WalOp::Delete => RECORD_DELETE,
        };

        let mut buf = Vec::with_capacity(1 + 4 + key.len() + 4 + value.len() + 8 + 4);
        buf.push(record_type);
        buf.write_u32::<LittleEndian>(key.len() as u32)?;
        buf.extend_from_slice(key);
        buf.write_u32::<LittleEndian>(value.len() as u32)?;
        buf.extend_from_slice(value);
        buf.write_u64::<LittleEndian>(timestamp)?;

        let checksum = Self::checksum(record_type, key, value, timestamp);
        buf.write_u32::<LittleEndian>(checksum)?;

        self.file.write_all(&buf)?;
        self.size += buf.len() as u64;
        Ok(())
    }

    /// Flushes to persistent media.
    pub fn sync(&mut self) -> Result<()> {
        self.file.sync_data()?;
        Ok(())
    }

    /// Replays the log from the beginning, returning records in exactly the
    /// order they were appended. Stops silently at the first bad checksum
    /// or truncated record.
    pub fn recover(&self) -> Result<Vec<WalRecord>> {
        let file = File::open(&self.path)?;
        let mut reader = BufReader::new(file);
        let mut records = Vec::new();

        loop {
            match Self::read_record(&mut reader) {
                Ok(Some(record)) => records.push(record),
                Ok(None) => break,
                Err(_) => {
                    // Partial or corrupt tail record: drop it and everything
                    // after it.
                    break;
                }
            }
        }

        Ok(records)
    }

    /// Truncates the log. Called after a successful flush has made the
    /// memtable durable in an SSTable.
    pub fn clear(&mut self) -> Result<()> {
        self.file.set_len(0)?;
        self.file.seek(SeekFrom::Start(0))?;
        self.size = 0;
        Ok(())
    }

    fn checksum(record_type: u8, key: &[u8], value: &[u8], timestamp: u64) -> u32 {
        let mut digest = CRC32.digest();
        digest.update(&[record_type]);
        digest.update(key);
        digest.update(value);
        digest.update(&timestamp.to_le_bytes());
        digest.finalize()
    }

    fn read_record(reader: &mut impl Read) -> Result<Option<WalRecord>> {
        let record_type = match reader.read_u8() {
            Ok(t) => t,
            // Clean EOF at a record boundary.
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let op = match record_type {
            RECORD_PUT => WalOp::Put,
            RECORD_DELETE => WalOp::Delete,
            other => return crate::corrupt!("unknown WAL record type {other}"),
        };

        let key_len = reader.read_u32::<LittleEndian>()? as usize;
        let mut key = vec![0u8; key_len];
        reader.read_exact(&mut key)?;

        let value_len = reader.read_u32::<LittleEndian>()? as usize;
        let mut value = vec![0u8; value_len];
        reader.read_exact(&mut value)?;

        let timestamp = reader.read_u64::<LittleEndian>()?;
        let stored_checksum = reader.read_u32::<LittleEndian>()?;

        if stored_checksum != Self::checksum(record_type, &key, &value, timestamp) {
            return crate::corrupt!("WAL record checksum mismatch");
        }

        Ok(Some(WalRecord {
            op,
            key,
            value,
            timestamp,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Seek as _, Write as _};

    fn open_temp_wal(dir: &tempfile::TempDir) -> Wal {
        Wal::open(dir.path().join("wal.log")).expect("Failed to open WAL")
    }

    #[test]
    fn test_append_and_recover() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let mut wal = open_temp_wal(&dir);

        wal.append(WalOp::Put, b"key1", b"value1", 1).unwrap();
        wal.append(WalOp::Put, b"key2", b"value2", 2).unwrap();
        wal.append(WalOp::Delete, b"key1", b"", 3).unwrap();
        wal.sync().unwrap();

        let records = wal.recover().unwrap();
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].op, WalOp::Put);
        assert_eq!(records[0].key, b"key1");
        assert_eq!(records[0].value, b"value1");
        assert_eq!(records[0].timestamp, 1);
        assert_eq!(records[2].op, WalOp::Delete);
        assert_eq!(records[2].key, b"key1");
        assert!(records[2].value.is_empty());
    }

    #[test]
    fn test_recover_preserves_append_order() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let mut wal = open_temp_wal(&dir);

        for i in 0..100u64 {
            wal.append(WalOp::Put, format!("key_{i}").as_bytes(), b"v", i)
                .unwrap();
        }

        let records = wal.recover().unwrap();
        assert_eq!(records.len(), 100);
        for (i, record) in records.iter().enumerate() {
            assert_eq!(record.key, format!("key_{i}").into_bytes());
            assert_eq!(record.timestamp, i as u64);
        }
    }

    #[test]
    fn test_truncated_tail_is_dropped() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let path = dir.path().join("wal.log");

        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(WalOp::Put, b"good", b"value", 1).unwrap();
            wal.append(WalOp::Put, b"partial", b"value", 2).unwrap();
            wal.sync().unwrap();
        }

        // Chop the last few bytes off, simulating a crash mid-write.
        let len = std::fs::metadata(&path).unwrap().len();
        let file = File::options().write(true).open(&path).unwrap();
        file.set_len(len - 5).unwrap();

        let wal = Wal::open(&path).unwrap();
        let records = wal.recover().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].key, b"good");
    }

    #[test]
    fn test_corrupt_record_stops_recovery() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let path = dir.path().join("wal.log");

        let first_len = {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(WalOp::Put, b"first", b"ok", 1).unwrap();
            let len = wal.size();
            wal.append(WalOp::Put, b"second", b"flipped", 2).unwrap();
            wal.append(WalOp::Put, b"third", b"unreachable", 3).unwrap();
            wal.sync().unwrap();
            len
        };

        // Flip a byte inside the second record's value.
        let mut file = File::options().write(true).open(&path).unwrap();
        file.seek(SeekFrom::Start(first_len + 12)).unwrap();
        file.write_all(&[0xff]).unwrap();

        let wal = Wal::open(&path).unwrap();
        let records = wal.recover().unwrap();
        // Parsing stops at the first bad record; only the intact prefix
        // survives.
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].key, b"first");
    }

    #[test]
    fn test_clear() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let mut wal = open_temp_wal(&dir);

        wal.append(WalOp::Put, b"key", b"value", 1).unwrap();
        assert!(wal.size() > 0);

        wal.clear().unwrap();
        assert_eq!(wal.size(), 0);
        assert!(wal.recover().unwrap().is_empty());

        // The log accepts appends again after truncation.
        wal.append(WalOp::Put, b"key2", b"value2", 2).unwrap();
        let records = wal.recover().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].key, b"key2");
    }

    #[test]
    fn test_empty_wal_recovers_empty() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let wal = open_temp_wal(&dir);
        assert!(wal.recover().unwrap().is_empty());
    }
}
