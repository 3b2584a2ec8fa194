/// The unit stored in every tier: memtable, WAL, and SSTables.
///
/// A deletion is an entry with `deleted` set and an empty value (a
/// tombstone). Timestamps are milliseconds since the Unix epoch and are
/// strictly increasing per engine, so the entry with the greatest timestamp
/// for a key is always the newest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    pub deleted: bool,
    pub timestamp: u64,
}

impl Entry {
    pub fn put(key: Vec<u8>, value: Vec<u8>, timestamp: u64) -> Self {
        Self {
            key,
            value,
            deleted: false,
            timestamp,
        }
    }

    pub fn tombstone(key: Vec<u8>, timestamp: u64) -> Self {
        Self {
            key,
            value: Vec::new(),
            deleted: true,
            timestamp,
        }
    }

    /// On-disk size of this entry in the data-record framing:
    /// `u32 key_len | key | u32 value_len | value | u8 deleted | u64 timestamp`.
    pub fn encoded_len(&self) -> usize {
        4 + self.key.len() + 4 + self.value.len() + 1 + 8
    }
}

/// Three-valued lookup result.
///
/// Every tier distinguishes "deleted here" from "never seen here": a
/// `Tombstone` shadows older occurrences of the key and must stop the
/// search, while `Absent` sends the reader on to the next tier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup {
    Found(Vec<u8>),
    Tombstone,
    Absent,
}

impl Lookup {
    /// Collapse to the binary view callers of the engine API see.
    pub fn into_option(self) -> Option<Vec<u8>> {
        match self {
            Lookup::Found(value) => Some(value),
            Lookup::Tombstone | Lookup::Absent => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encoded_len() {
        let entry = Entry::put(b"key".to_vec(), b"value".to_vec(), 1);
        assert_eq!(entry.encoded_len(), 4 + 3 + 4 + 5 + 1 + 8);

        let tombstone = Entry::tombstone(b"key".to_vec(), 2);
        assert!(tombstone.deleted);
        assert!(tombstone.value.is_empty());
        assert_eq!(tombstone.encoded_len(), 4 + 3 + 4 + 1 + 8);
    }

    #[test]
    fn test_lookup_into_option() {
        assert_eq!(
            Lookup::Found(b"v".to_vec()).into_option(),
            Some(b"v".to_vec())
        );
        assert_eq!(Lookup::Tombstone.into_option(), None);
        assert_eq!(Lookup::Absent.into_option(), None);
    }
}
