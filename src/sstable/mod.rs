//! Immutable sorted on-disk segments.
//!
//! An SSTable holds a run of entries in strictly ascending key order,
//! together with a sparse index for point lookups and an optional bloom
//! filter for read short-circuiting. Tables are written once (by a memtable
//! flush or by compaction) and never modified; they are retired by marking
//! them doomed after a compaction swap, at which point the file is unlinked
//! when the last reference drops.

pub mod index;
pub mod table;

pub use index::SparseIndex;
pub use table::{SsTable, TableOptions, MAGIC};
