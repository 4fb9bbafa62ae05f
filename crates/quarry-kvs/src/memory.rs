//! In-memory transactional substrate for the `blocks` store.
//!
//! Models the host key/value store closely enough for the storage engine and
//! its recovery tests: atomic multi-key commits, a committed/durable split
//! (commit applies atomically; the durability barrier is a separate step, so
//! a simulated crash rolls back to the last barrier), and deterministic fault
//! hooks in the style of a fault-injecting test VFS.

use std::collections::BTreeMap;
use std::ops::Bound::{Excluded, Included};
use std::sync::{Arc, Mutex};

use quarry_error::{QuarryError, Result};
use tracing::{debug, info};

use crate::{BlockKey, BlockRecord, Op, SCHEMA_VERSION};

#[derive(Debug, Default)]
struct MemoryInner {
    schema_version: u32,
    /// State visible to readers: every committed transaction has applied here.
    committed: BTreeMap<BlockKey, BlockRecord>,
    /// State that survives a simulated crash: committed as of the last
    /// durability barrier.
    durable: BTreeMap<BlockKey, BlockRecord>,
    /// One-shot fault: abort the next commit.
    fail_next_commit: bool,
}

/// Handle to the process-wide block store. Clones share state.
#[derive(Debug, Clone)]
pub struct MemoryKvs {
    inner: Arc<Mutex<MemoryInner>>,
}

impl Default for MemoryKvs {
    fn default() -> Self {
        Self::new()
    }
}

fn lock_err() -> QuarryError {
    QuarryError::internal("MemoryKvs lock poisoned")
}

impl MemoryKvs {
    /// Create an empty store at the current schema version.
    #[must_use]
    pub fn new() -> Self {
        Self::with_schema_version(SCHEMA_VERSION)
    }

    /// Create an empty store stamped with an arbitrary schema version.
    #[must_use]
    pub fn with_schema_version(version: u32) -> Self {
        Self {
            inner: Arc::new(Mutex::new(MemoryInner {
                schema_version: version,
                ..MemoryInner::default()
            })),
        }
    }

    /// Validate the store schema, applying the one-step upgrade if the store
    /// is exactly one version behind.
    pub fn open_blocks(&self) -> Result<()> {
        let mut inner = self.inner.lock().map_err(|_| lock_err())?;
        match inner.schema_version {
            SCHEMA_VERSION => Ok(()),
            v if v + 1 == SCHEMA_VERSION => {
                // v1 stored no purge records; nothing to rewrite.
                inner.schema_version = SCHEMA_VERSION;
                info!(from = v, to = SCHEMA_VERSION, "upgraded blocks store schema");
                Ok(())
            }
            v => Err(QuarryError::SchemaMismatch {
                found: v,
                expected: SCHEMA_VERSION,
            }),
        }
    }

    pub(crate) fn get(&self, key: &BlockKey) -> Option<BlockRecord> {
        let inner = self.inner.lock().ok()?;
        inner.committed.get(key).cloned()
    }

    /// First committed record with `lo <= key < hi`, skipping keys shadowed
    /// by the supplied overlay.
    pub(crate) fn first_in_range_shadowed(
        &self,
        lo: &BlockKey,
        hi: &BlockKey,
        overlay: Option<&BTreeMap<BlockKey, Op>>,
    ) -> Option<BlockRecord> {
        let inner = self.inner.lock().ok()?;
        inner
            .committed
            .range((Included(lo.clone()), Excluded(hi.clone())))
            .find(|(key, _)| overlay.map_or(true, |ov| !ov.contains_key(key)))
            .map(|(_, record)| record.clone())
    }

    /// Committed keys with `lo <= key < hi`.
    pub(crate) fn keys_in_range(&self, lo: &BlockKey, hi: &BlockKey) -> Vec<BlockKey> {
        let Ok(inner) = self.inner.lock() else {
            return Vec::new();
        };
        inner
            .committed
            .range((Included(lo.clone()), Excluded(hi.clone())))
            .map(|(key, _)| key.clone())
            .collect()
    }

    /// Secondary `(name, version)` scan: committed keys of `name` whose
    /// version is strictly newer (smaller) than `published`.
    pub(crate) fn keys_newer_than(&self, name: &str, published: i64) -> Vec<BlockKey> {
        let lo = BlockKey::lowest(name, crate::BlockIndex::Page(0));
        let hi = BlockKey::beyond_name(name);
        let Ok(inner) = self.inner.lock() else {
            return Vec::new();
        };
        inner
            .committed
            .range((Included(lo), Excluded(hi)))
            .filter(|(key, _)| key.version < published)
            .map(|(key, _)| key.clone())
            .collect()
    }

    /// Apply a transaction's staged operations atomically.
    ///
    /// An injected abort discards every staged operation and surfaces as an
    /// I/O error; the store is unchanged.
    pub(crate) fn apply(&self, ops: &BTreeMap<BlockKey, Op>) -> Result<()> {
        let mut inner = self.inner.lock().map_err(|_| lock_err())?;
        if inner.fail_next_commit {
            inner.fail_next_commit = false;
            return Err(QuarryError::io("blocks transaction aborted"));
        }
        for (key, op) in ops {
            match op {
                Op::Put(record) => {
                    inner.committed.insert(key.clone(), record.clone());
                }
                Op::Delete => {
                    inner.committed.remove(key);
                }
            }
        }
        debug!(ops = ops.len(), "committed blocks transaction");
        Ok(())
    }

    /// Durability barrier: everything committed so far survives a crash.
    pub(crate) fn flush_durable(&self) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.durable = inner.committed.clone();
        }
    }

    /// Fault hook: abort the next commit (one-shot).
    pub fn fail_next_commit(&self) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.fail_next_commit = true;
        }
    }

    /// Fault hook: simulate a crash, discarding every commit since the last
    /// durability barrier.
    pub fn crash(&self) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.committed = inner.durable.clone();
        }
    }

    /// Number of committed records under `name` (inspection for tests).
    #[must_use]
    pub fn record_count(&self, name: &str) -> usize {
        let lo = BlockKey::lowest(name, crate::BlockIndex::Page(0));
        let hi = BlockKey::beyond_name(name);
        self.keys_in_range(&lo, &hi).len()
    }

    /// Number of committed versions of `(name, index)` (inspection for tests).
    #[must_use]
    pub fn version_count(&self, name: &str, index: crate::BlockIndex) -> usize {
        let lo = BlockKey::lowest(name, index);
        let hi = BlockKey::beyond(name, index);
        self.keys_in_range(&lo, &hi).len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{BlockIndex, Payload};

    fn record(name: &str, index: BlockIndex, version: i64, byte: u8) -> BlockRecord {
        BlockRecord {
            key: BlockKey::new(name, index, version),
            payload: Payload::Block(vec![byte; 8]),
            file_size: None,
        }
    }

    fn put_all(kvs: &MemoryKvs, records: &[BlockRecord]) {
        let ops: BTreeMap<BlockKey, Op> = records
            .iter()
            .map(|r| (r.key.clone(), Op::Put(r.clone())))
            .collect();
        kvs.apply(&ops).unwrap();
    }

    #[test]
    fn first_in_range_returns_newest_version() {
        let kvs = MemoryKvs::new();
        put_all(
            &kvs,
            &[
                record("/db", BlockIndex::Page(1), 0, 0xAA),
                record("/db", BlockIndex::Page(1), -1, 0xBB),
                record("/db", BlockIndex::Page(1), -2, 0xCC),
            ],
        );

        // Newest no newer than version -1.
        let lo = BlockKey::new("/db", BlockIndex::Page(1), -1);
        let hi = BlockKey::beyond("/db", BlockIndex::Page(1));
        let hit = kvs.first_in_range_shadowed(&lo, &hi, None).unwrap();
        assert_eq!(hit.key.version, -1);

        // Newest overall.
        let lo = BlockKey::lowest("/db", BlockIndex::Page(1));
        let hit = kvs.first_in_range_shadowed(&lo, &hi, None).unwrap();
        assert_eq!(hit.key.version, -2);
    }

    #[test]
    fn keys_newer_than_spares_published_and_purge() {
        let kvs = MemoryKvs::new();
        put_all(
            &kvs,
            &[
                record("/db", BlockIndex::Page(0), -1, 1),
                record("/db", BlockIndex::Page(0), -2, 2),
                record("/db", BlockIndex::Page(3), -2, 3),
                BlockRecord {
                    key: BlockKey::new("/db", BlockIndex::Purge, 0),
                    payload: Payload::PurgeMap(BTreeMap::new()),
                    file_size: None,
                },
            ],
        );

        let stale = kvs.keys_newer_than("/db", -1);
        assert_eq!(stale.len(), 2);
        assert!(stale.iter().all(|k| k.version == -2));
    }

    #[test]
    fn injected_abort_leaves_store_unchanged() {
        let kvs = MemoryKvs::new();
        put_all(&kvs, &[record("/db", BlockIndex::Page(0), 0, 1)]);

        kvs.fail_next_commit();
        let ops: BTreeMap<BlockKey, Op> = BTreeMap::from([(
            BlockKey::new("/db", BlockIndex::Page(0), -1),
            Op::Put(record("/db", BlockIndex::Page(0), -1, 9)),
        )]);
        let err = kvs.apply(&ops).unwrap_err();
        assert!(matches!(err, QuarryError::Io { .. }));
        assert_eq!(kvs.record_count("/db"), 1);

        // One-shot: the next commit goes through.
        kvs.apply(&ops).unwrap();
        assert_eq!(kvs.record_count("/db"), 2);
    }

    #[test]
    fn crash_rolls_back_to_last_barrier() {
        let kvs = MemoryKvs::new();
        put_all(&kvs, &[record("/db", BlockIndex::Page(0), 0, 1)]);
        kvs.flush_durable();
        put_all(&kvs, &[record("/db", BlockIndex::Page(1), 0, 2)]);

        kvs.crash();
        assert_eq!(kvs.record_count("/db"), 1);
    }

    #[test]
    fn schema_upgrade_and_mismatch() {
        let kvs = MemoryKvs::with_schema_version(SCHEMA_VERSION - 1);
        kvs.open_blocks().unwrap();
        // Idempotent after upgrade.
        kvs.open_blocks().unwrap();

        let kvs = MemoryKvs::with_schema_version(SCHEMA_VERSION + 1);
        let err = kvs.open_blocks().unwrap_err();
        assert!(matches!(err, QuarryError::SchemaMismatch { .. }));
    }
}
