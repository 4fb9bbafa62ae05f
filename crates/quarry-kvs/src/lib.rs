//! Typed contract for the `blocks` store.
//!
//! Records are keyed by `(name, index, version)`. The version column is an
//! `i64` where **smaller means newer** — an ascending scan over one
//! `(name, index)` pair yields the newest version first, which is what lets
//! the read path resolve "newest version visible at `v`" with a single
//! half-open range probe and no secondary index.
//!
//! The synthetic purge record uses the [`BlockIndex::Purge`] index, which
//! orders after every page index (the substrate this models keys it with a
//! string, and numbers sort before strings there). Ranged page deletes
//! therefore never touch it, while whole-file deletes do.

pub mod batch;
pub mod memory;

use std::collections::BTreeMap;

pub use batch::{BlocksTxn, KvsBatcher, TxnMode};
pub use memory::MemoryKvs;

/// Current schema version of the `blocks` store.
///
/// Version 1 predates purge records; the v1 → v2 upgrade is metadata-only
/// (no record rewrite), so it qualifies as a one-step upgrade. Anything else
/// fails open with a schema-mismatch error.
pub const SCHEMA_VERSION: u32 = 2;

/// Index column of a block key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum BlockIndex {
    /// A block of file data at this index.
    Page(u32),
    /// The file's purge bookkeeping record. Orders after every `Page(_)`.
    Purge,
}

impl BlockIndex {
    /// The page number, if this is a page index.
    #[must_use]
    pub const fn page(self) -> Option<u32> {
        match self {
            Self::Page(index) => Some(index),
            Self::Purge => None,
        }
    }
}

/// Composite primary key of a block record.
///
/// Ordering is the derived lexicographic ordering of `(name, index, version)`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BlockKey {
    pub name: String,
    pub index: BlockIndex,
    pub version: i64,
}

impl BlockKey {
    /// Key for a specific record.
    #[must_use]
    pub fn new(name: impl Into<String>, index: BlockIndex, version: i64) -> Self {
        Self {
            name: name.into(),
            index,
            version,
        }
    }

    /// Lowest possible key for `(name, index)`: the newest conceivable
    /// version. Use as the low bound of a newest-first probe.
    #[must_use]
    pub fn lowest(name: impl Into<String>, index: BlockIndex) -> Self {
        Self::new(name, index, i64::MIN)
    }

    /// Exclusive upper bound covering every real version of `(name, index)`.
    /// `i64::MAX` is a sentinel no record ever carries (versions start at 0
    /// and decrease).
    #[must_use]
    pub fn beyond(name: impl Into<String>, index: BlockIndex) -> Self {
        Self::new(name, index, i64::MAX)
    }

    /// Exclusive upper bound covering every record of `name`, the purge
    /// record included.
    #[must_use]
    pub fn beyond_name(name: impl Into<String>) -> Self {
        Self::new(name, BlockIndex::Purge, i64::MAX)
    }
}

/// Payload of a block record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    /// Raw block bytes.
    Block(Vec<u8>),
    /// Purge bookkeeping: page index → obsolete-version threshold. Versions
    /// strictly older (larger) than the threshold are reclaimable.
    PurgeMap(BTreeMap<u32, i64>),
}

impl Payload {
    /// Block bytes, if this is a data payload.
    #[must_use]
    pub fn as_block(&self) -> Option<&[u8]> {
        match self {
            Self::Block(data) => Some(data),
            Self::PurgeMap(_) => None,
        }
    }

    /// The purge map, if this is a purge payload.
    #[must_use]
    pub const fn as_purge_map(&self) -> Option<&BTreeMap<u32, i64>> {
        match self {
            Self::Block(_) => None,
            Self::PurgeMap(map) => Some(map),
        }
    }
}

/// One record of the `blocks` store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockRecord {
    pub key: BlockKey,
    pub payload: Payload,
    /// Logical file size; carried only by block 0 of a database file.
    pub file_size: Option<u64>,
}

/// A staged operation inside an open transaction.
#[derive(Debug, Clone)]
pub(crate) enum Op {
    Put(BlockRecord),
    Delete,
}
