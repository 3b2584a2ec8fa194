//! Per-SSTable bloom filter.
//!
//! A compact probabilistic set used to short-circuit table reads: a negative
//! answer is definitive, a positive answer means the key must be looked up.
//! Sized from an expected element count `n` and a target false-positive
//! rate `p`:
//!
//! ```text
//! m = ceil(-n * ln(p) / ln(2)^2)     bits
//! k = ceil((m / n) * ln(2))          hash functions
//! ```
//!
//! The `k` probe positions are derived by double hashing
//! (`h_i = h1 + i * h2 mod m`) from two CRC-64 checksums of the key. CRC
//! output does not depend on platform byte order, so serialized filters are
//! portable across machines.
//!
//! Wire format (little-endian): `u64 m | u64 k | ceil(m/8) bytes`.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use crc::{Crc, CRC_64_ECMA_182, CRC_64_XZ};

use crate::corrupt;
use crate::error::Result;

const HASH1: Crc<u64> = Crc::<u64>::new(&CRC_64_ECMA_182);
const HASH2: Crc<u64> = Crc::<u64>::new(&CRC_64_XZ);

#[derive(Debug, Clone)]
pub struct BloomFilter {
    bits: Vec<u8>,
    num_bits: u64,
    num_hashes: u64,
}

impl BloomFilter {
    /// Creates a filter sized for `expected` elements at the given target
    /// false-positive rate.
    pub fn new(expected: usize, false_positive_rate: f64) -> Self {
        let n = expected.max(1) as f64;
        let p = false_positive_rate.clamp(1e-9, 0.5);

        let ln2 = std::f64::consts::LN_2;
        let num_bits = (-n * p.ln() / (ln2 * ln2)).ceil() as u64;
        let num_bits = num_bits.max(8);
        let num_hashes = ((num_bits as f64 / n) * ln2).ceil() as u64;
        let num_hashes = num_hashes.max(1);

        Self {
            bits: vec![0u8; num_bits.div_ceil(8) as usize],
            num_bits,
            num_hashes,
        }
    }

    /// Inserts a key. A key that has been added always tests positive.
    pub fn add(&mut self, key: &[u8]) {
        let (h1, h2) = Self::hash_pair(key);
        for i in 0..self.num_hashes {
            let bit = h1.wrapping_add(i.wrapping_mul(h2)) % self.num_bits;
            self.bits[(bit / 8) as usize] |= 1 << (bit % 8);
        }
    }

    /// Tests a key. False means the key was never added; true means it
    /// probably was.
    pub fn might_contain(&self, key: &[u8]) -> bool {
        let (h1, h2) = Self::hash_pair(key);
        for i in 0..self.num_hashes {
            let bit = h1.wrapping_add(i.wrapping_mul(h2)) % self.num_bits;
            if self.bits[(bit / 8) as usize] & (1 << (bit % 8)) == 0 {
                return false;
            }
        }
        true
    }

    pub fn num_bits(&self) -> u64 {
        self.num_bits
    }

    pub fn num_hashes(&self) -> u64 {
        self.num_hashes
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(16 + self.bits.len());
        buf.write_u64::<LittleEndian>(self.num_bits).unwrap();
        buf.write_u64::<LittleEndian>(self.num_hashes).unwrap();
        buf.extend_from_slice(&self.bits);
        buf
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let mut cursor = std::io::Cursor::new(data);
        let num_bits = cursor.read_u64::<LittleEndian>()?;
        let num_hashes = cursor.read_u64::<LittleEndian>()?;
        if num_bits == 0 || num_hashes == 0 {
            return corrupt!("bloom filter with zero bits or hashes");
        }

        let expected_len = num_bits.div_ceil(8) as usize;
        let bits = data[16..].to_vec();
        if bits.len() != expected_len {
            return corrupt!(
                "bloom filter bit array length {} does not match m={}",
                bits.len(),
                num_bits
            );
        }

        Ok(Self {
            bits,
            num_bits,
            num_hashes,
        })
    }

    fn hash_pair(key: &[u8]) -> (u64, u64) {
        let h1 = HASH1.checksum(key);
        // Force h2 odd so consecutive probes never collapse onto one bit.
        let h2 = HASH2.checksum(key) | 1;
        (h1, h2)
    }
}
