//! Write-coalescing transaction batcher.
//!
//! The storage engine emits many tiny writes per page; opening a substrate
//! transaction per operation would be prohibitive. The batcher keeps at most
//! one transaction open per connection: `run` calls whose mode is satisfied
//! by the open transaction join it, so a fast-path write followed by a read
//! of the same block observes the staged bytes. [`KvsBatcher::sync`] is the
//! single point where staged operations commit; the durability option decides
//! whether the commit is followed by the substrate's durability barrier.
//!
//! A substrate abort discards every staged operation and surfaces as an I/O
//! error from the enclosing VFS operation. The batcher never retries.

use std::collections::BTreeMap;
use std::sync::Mutex;

use quarry_error::{QuarryError, Result};
use quarry_types::Durability;
use quarry_types::cx::Cx;
use tracing::debug;

use crate::{BlockKey, BlockRecord, MemoryKvs, Op};

/// Transaction mode requested by a `run` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnMode {
    ReadOnly,
    ReadWrite,
}

#[derive(Debug, Default)]
struct ActiveTxn {
    overlay: BTreeMap<BlockKey, Op>,
}

/// Per-connection batcher over the shared block store.
#[derive(Debug)]
pub struct KvsBatcher {
    kvs: MemoryKvs,
    durability: Durability,
    active: Mutex<Option<ActiveTxn>>,
}

fn lock_err() -> QuarryError {
    QuarryError::internal("KvsBatcher lock poisoned")
}

impl KvsBatcher {
    /// Create a batcher for one connection.
    #[must_use]
    pub fn new(kvs: MemoryKvs, durability: Durability) -> Self {
        Self {
            kvs,
            durability,
            active: Mutex::new(None),
        }
    }

    /// The shared substrate handle.
    #[must_use]
    pub fn kvs(&self) -> &MemoryKvs {
        &self.kvs
    }

    /// Run `f` against the block store within a transaction.
    ///
    /// A `ReadWrite` request opens a transaction if none is open and joins
    /// the open one otherwise. A `ReadOnly` request joins an open transaction
    /// (read-your-writes) or reads the committed state directly.
    ///
    /// `run` must not be re-entered from inside `f`.
    pub fn run<R>(
        &self,
        cx: &Cx,
        mode: TxnMode,
        f: impl FnOnce(&mut BlocksTxn<'_>) -> Result<R>,
    ) -> Result<R> {
        if cx.is_interrupted() {
            return Err(QuarryError::io("operation interrupted"));
        }
        let mut active = self.active.lock().map_err(|_| lock_err())?;
        match mode {
            TxnMode::ReadWrite => {
                let txn = active.get_or_insert_with(ActiveTxn::default);
                let mut view = BlocksTxn {
                    kvs: &self.kvs,
                    overlay: Some(&mut txn.overlay),
                    writable: true,
                };
                f(&mut view)
            }
            TxnMode::ReadOnly => {
                let mut view = BlocksTxn {
                    kvs: &self.kvs,
                    overlay: active.as_mut().map(|txn| &mut txn.overlay),
                    writable: false,
                };
                f(&mut view)
            }
        }
    }

    /// Commit the open transaction, if any, and establish durability unless
    /// the connection runs relaxed.
    pub fn sync(&self, cx: &Cx) -> Result<()> {
        if cx.is_interrupted() {
            return Err(QuarryError::io("operation interrupted"));
        }
        let staged = self.active.lock().map_err(|_| lock_err())?.take();
        if let Some(txn) = staged {
            debug!(ops = txn.overlay.len(), "syncing blocks transaction");
            self.kvs.apply(&txn.overlay)?;
        }
        if self.durability != Durability::Relaxed {
            self.kvs.flush_durable();
        }
        Ok(())
    }

    /// Whether a transaction is currently open.
    #[must_use]
    pub fn has_open_txn(&self) -> bool {
        self.active
            .lock()
            .map(|active| active.is_some())
            .unwrap_or(false)
    }
}

/// Handle to the block store within one transaction.
///
/// Reads merge the transaction's staged operations over the committed state;
/// mutations stage into the transaction and become visible to other
/// connections only after [`KvsBatcher::sync`].
pub struct BlocksTxn<'a> {
    kvs: &'a MemoryKvs,
    overlay: Option<&'a mut BTreeMap<BlockKey, Op>>,
    writable: bool,
}

impl BlocksTxn<'_> {
    /// Fetch one record by exact key.
    #[must_use]
    pub fn get(&self, key: &BlockKey) -> Option<BlockRecord> {
        if let Some(overlay) = self.overlay.as_deref() {
            if let Some(op) = overlay.get(key) {
                return match op {
                    Op::Put(record) => Some(record.clone()),
                    Op::Delete => None,
                };
            }
        }
        self.kvs.get(key)
    }

    /// First record with `lo <= key < hi` in ascending key order.
    ///
    /// With versions encoded smaller-is-newer this resolves "the newest
    /// version no newer than `lo.version`" in a single probe.
    #[must_use]
    pub fn first_in_range(&self, lo: &BlockKey, hi: &BlockKey) -> Option<BlockRecord> {
        use std::ops::Bound::{Excluded, Included};

        let overlay = self.overlay.as_deref();
        let committed = self.kvs.first_in_range_shadowed(lo, hi, overlay);
        let staged = overlay.and_then(|ov| {
            ov.range((Included(lo.clone()), Excluded(hi.clone())))
                .find_map(|(_, op)| match op {
                    Op::Put(record) => Some(record.clone()),
                    Op::Delete => None,
                })
        });
        match (committed, staged) {
            (Some(a), Some(b)) => Some(if a.key <= b.key { a } else { b }),
            (hit, None) | (None, hit) => hit,
        }
    }

    /// Stage a put.
    pub fn put(&mut self, record: BlockRecord) -> Result<()> {
        let overlay = self.writable_overlay()?;
        overlay.insert(record.key.clone(), Op::Put(record));
        Ok(())
    }

    /// Stage deletion of one record.
    pub fn delete(&mut self, key: &BlockKey) -> Result<()> {
        let overlay = self.writable_overlay()?;
        overlay.insert(key.clone(), Op::Delete);
        Ok(())
    }

    /// Stage deletion of every record with `lo <= key < hi`.
    pub fn delete_range(&mut self, lo: &BlockKey, hi: &BlockKey) -> Result<()> {
        use std::ops::Bound::{Excluded, Included};

        let committed = self.kvs.keys_in_range(lo, hi);
        let overlay = self.writable_overlay()?;
        let staged: Vec<BlockKey> = overlay
            .range((Included(lo.clone()), Excluded(hi.clone())))
            .map(|(key, _)| key.clone())
            .collect();
        for key in staged {
            overlay.insert(key, Op::Delete);
        }
        for key in committed {
            overlay.insert(key, Op::Delete);
        }
        Ok(())
    }

    /// Stage deletion of every record of `name` whose version is strictly
    /// newer (smaller) than `published`. Returns how many were staged.
    ///
    /// This is the reserved-lock cleanup sweep over the `(name, version)`
    /// secondary index.
    pub fn delete_newer_than(&mut self, name: &str, published: i64) -> Result<usize> {
        let committed = self.kvs.keys_newer_than(name, published);
        let overlay = self.writable_overlay()?;
        let staged: Vec<BlockKey> = overlay
            .keys()
            .filter(|key| key.name == name && key.version < published)
            .cloned()
            .collect();
        let mut count = 0;
        for key in staged {
            overlay.insert(key, Op::Delete);
            count += 1;
        }
        for key in committed {
            if !matches!(overlay.get(&key), Some(Op::Delete)) {
                count += 1;
            }
            overlay.insert(key, Op::Delete);
        }
        Ok(count)
    }

    fn writable_overlay(&mut self) -> Result<&mut BTreeMap<BlockKey, Op>> {
        if !self.writable {
            return Err(QuarryError::internal(
                "write attempted in a readonly blocks transaction",
            ));
        }
        self.overlay
            .as_deref_mut()
            .ok_or_else(|| QuarryError::internal("readwrite transaction has no overlay"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{BlockIndex, Payload};

    fn record(name: &str, index: BlockIndex, version: i64, byte: u8) -> BlockRecord {
        BlockRecord {
            key: BlockKey::new(name, index, version),
            payload: Payload::Block(vec![byte; 4]),
            file_size: None,
        }
    }

    #[test]
    fn staged_writes_visible_before_sync() {
        let cx = Cx::new();
        let kvs = MemoryKvs::new();
        let batcher = KvsBatcher::new(kvs.clone(), Durability::Default);

        batcher
            .run(&cx, TxnMode::ReadWrite, |txn| {
                txn.put(record("/db", BlockIndex::Page(1), 0, 0xAB))
            })
            .unwrap();

        // Read joins the open transaction and sees the staged record.
        let hit = batcher
            .run(&cx, TxnMode::ReadOnly, |txn| {
                Ok(txn.get(&BlockKey::new("/db", BlockIndex::Page(1), 0)))
            })
            .unwrap();
        assert!(hit.is_some());

        // Another connection sees nothing until sync.
        assert_eq!(kvs.record_count("/db"), 0);
        batcher.sync(&cx).unwrap();
        assert_eq!(kvs.record_count("/db"), 1);
        assert!(!batcher.has_open_txn());
    }

    #[test]
    fn consecutive_writes_coalesce_into_one_txn() {
        let cx = Cx::new();
        let batcher = KvsBatcher::new(MemoryKvs::new(), Durability::Default);

        for index in 0..4_u32 {
            batcher
                .run(&cx, TxnMode::ReadWrite, |txn| {
                    txn.put(record("/db", BlockIndex::Page(index), 0, index as u8))
                })
                .unwrap();
        }
        assert!(batcher.has_open_txn());
        batcher.sync(&cx).unwrap();
        assert_eq!(batcher.kvs().record_count("/db"), 4);
    }

    #[test]
    fn abort_discards_every_staged_op() {
        let cx = Cx::new();
        let kvs = MemoryKvs::new();
        let batcher = KvsBatcher::new(kvs.clone(), Durability::Default);

        batcher
            .run(&cx, TxnMode::ReadWrite, |txn| {
                txn.put(record("/db", BlockIndex::Page(0), 0, 1))?;
                txn.put(record("/db", BlockIndex::Page(1), 0, 2))
            })
            .unwrap();
        kvs.fail_next_commit();
        let err = batcher.sync(&cx).unwrap_err();
        assert!(matches!(err, QuarryError::Io { .. }));

        // Nothing applied, nothing retried.
        assert_eq!(kvs.record_count("/db"), 0);
        assert!(!batcher.has_open_txn());
        batcher.sync(&cx).unwrap();
        assert_eq!(kvs.record_count("/db"), 0);
    }

    #[test]
    fn relaxed_durability_skips_the_barrier() {
        let cx = Cx::new();
        let kvs = MemoryKvs::new();
        let relaxed = KvsBatcher::new(kvs.clone(), Durability::Relaxed);

        relaxed
            .run(&cx, TxnMode::ReadWrite, |txn| {
                txn.put(record("/db", BlockIndex::Page(0), 0, 1))
            })
            .unwrap();
        relaxed.sync(&cx).unwrap();
        assert_eq!(kvs.record_count("/db"), 1);

        // Committed but not durable: a crash loses it.
        kvs.crash();
        assert_eq!(kvs.record_count("/db"), 0);
    }

    #[test]
    fn default_durability_survives_crash() {
        let cx = Cx::new();
        let kvs = MemoryKvs::new();
        let batcher = KvsBatcher::new(kvs.clone(), Durability::Default);

        batcher
            .run(&cx, TxnMode::ReadWrite, |txn| {
                txn.put(record("/db", BlockIndex::Page(0), 0, 1))
            })
            .unwrap();
        batcher.sync(&cx).unwrap();
        kvs.crash();
        assert_eq!(kvs.record_count("/db"), 1);
    }

    #[test]
    fn first_in_range_merges_overlay_and_committed() {
        let cx = Cx::new();
        let kvs = MemoryKvs::new();
        let batcher = KvsBatcher::new(kvs.clone(), Durability::Default);

        // Commit version 0, stage the newer version -1.
        batcher
            .run(&cx, TxnMode::ReadWrite, |txn| {
                txn.put(record("/db", BlockIndex::Page(2), 0, 0x01))
            })
            .unwrap();
        batcher.sync(&cx).unwrap();
        batcher
            .run(&cx, TxnMode::ReadWrite, |txn| {
                txn.put(record("/db", BlockIndex::Page(2), -1, 0x02))
            })
            .unwrap();

        let newest = batcher
            .run(&cx, TxnMode::ReadOnly, |txn| {
                Ok(txn.first_in_range(
                    &BlockKey::lowest("/db", BlockIndex::Page(2)),
                    &BlockKey::beyond("/db", BlockIndex::Page(2)),
                ))
            })
            .unwrap()
            .unwrap();
        assert_eq!(newest.key.version, -1);
    }

    #[test]
    fn delete_range_covers_staged_and_committed() {
        let cx = Cx::new();
        let kvs = MemoryKvs::new();
        let batcher = KvsBatcher::new(kvs.clone(), Durability::Default);

        batcher
            .run(&cx, TxnMode::ReadWrite, |txn| {
                txn.put(record("/db", BlockIndex::Page(1), 0, 1))
            })
            .unwrap();
        batcher.sync(&cx).unwrap();
        batcher
            .run(&cx, TxnMode::ReadWrite, |txn| {
                txn.put(record("/db", BlockIndex::Page(2), 0, 2))?;
                txn.delete_range(
                    &BlockKey::lowest("/db", BlockIndex::Page(1)),
                    &BlockKey::beyond("/db", BlockIndex::Page(2)),
                )
            })
            .unwrap();
        batcher.sync(&cx).unwrap();
        assert_eq!(kvs.record_count("/db"), 0);
    }

    #[test]
    fn interrupt_checkpoint_stops_new_work() {
        let cx = Cx::new();
        let batcher = KvsBatcher::new(MemoryKvs::new(), Durability::Default);
        cx.interrupt();
        let err = batcher
            .run(&cx, TxnMode::ReadOnly, |_| Ok(()))
            .unwrap_err();
        assert!(matches!(err, QuarryError::Io { .. }));
        assert!(batcher.sync(&cx).is_err());

        cx.clear_interrupt();
        batcher.run(&cx, TxnMode::ReadOnly, |_| Ok(())).unwrap();
        batcher.sync(&cx).unwrap();
    }

    #[test]
    fn readonly_txn_rejects_writes() {
        let cx = Cx::new();
        let batcher = KvsBatcher::new(MemoryKvs::new(), Durability::Default);
        let err = batcher
            .run(&cx, TxnMode::ReadOnly, |txn| {
                txn.put(record("/db", BlockIndex::Page(0), 0, 1))
            })
            .unwrap_err();
        assert!(matches!(err, QuarryError::Internal(_)));
    }
}
