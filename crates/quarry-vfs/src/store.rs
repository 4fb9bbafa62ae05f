//! Versioned block store for database files.
//!
//! Every database file is a set of `(name, index, version)` records. Only
//! block 0 is versioned-in-place: it carries the logical file size and the
//! file's published version, and re-publishing it at a new (smaller) version
//! during `sync` is the atomic commit point. Indices >= 1 accumulate
//! versions during a journalled transaction and are reclaimed by the purge
//! scheduler afterwards.
//!
//! The cached block 0 is owned by the opened-file entry; the journal
//! emulator reads it through the same shared state (see `journal.rs`) to
//! size entries and locate pre-transaction pages.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use quarry_error::{QuarryError, Result};
use quarry_kvs::{BlockIndex, BlockKey, BlockRecord, KvsBatcher, Payload, TxnMode};
use quarry_types::StoreOptions;
use quarry_types::cx::Cx;
use quarry_types::flags::VfsOpenFlags;
use tracing::debug;

use crate::codec::block_spans;
use crate::purge::PurgeScheduler;

/// Cached block 0 of a database file: the first block of payload plus the
/// file's logical size and current version.
#[derive(Debug, Clone)]
pub(crate) struct Block0 {
    pub data: Vec<u8>,
    pub file_size: u64,
    pub version: i64,
}

impl Block0 {
    /// Fresh zero-filled block 0 for a newly created file.
    pub(crate) fn fresh(block_size: usize) -> Self {
        Self {
            data: vec![0; block_size],
            file_size: 0,
            version: 0,
        }
    }
}

/// Bookkeeping of the active journalled transaction, if any.
#[derive(Debug, Default)]
pub(crate) struct JournalledTxn {
    /// Entry index -> 0-based page index, captured from journal writes.
    pub journal_pages: Vec<Option<u32>>,
    /// Block indices written since the journal header was initialized.
    pub changed_pages: HashSet<u32>,
}

impl JournalledTxn {
    /// Page indices that are both journalled and changed: the pages whose
    /// older versions become reclaimable once this transaction publishes.
    pub(crate) fn reclaimable_pages(&self) -> Vec<u32> {
        self.journal_pages
            .iter()
            .copied()
            .flatten()
            .filter(|index| self.changed_pages.contains(index))
            .collect()
    }
}

/// In-memory state of one opened database file.
#[derive(Debug)]
pub(crate) struct DbFileState {
    pub name: String,
    pub flags: VfsOpenFlags,
    pub block0: Block0,
    pub txn: Option<JournalledTxn>,
}

/// Shared handles every file operation needs.
#[derive(Clone)]
pub(crate) struct StoreHandles {
    pub kvs: Arc<KvsBatcher>,
    pub options: StoreOptions,
    pub purge: Arc<PurgeScheduler>,
}

pub(crate) type SharedDbState = Arc<Mutex<DbFileState>>;

pub(crate) fn state_lock_err() -> QuarryError {
    QuarryError::internal("opened-file state poisoned")
}

/// The block-0 record publishing the file's current cached state.
fn block0_record(state: &DbFileState) -> BlockRecord {
    BlockRecord {
        key: BlockKey::new(&state.name, BlockIndex::Page(0), state.block0.version),
        payload: Payload::Block(state.block0.data.clone()),
        file_size: Some(state.block0.file_size),
    }
}

/// Load the newest block 0 of `name`, if the file exists.
pub(crate) fn load_block0(
    cx: &Cx,
    kvs: &KvsBatcher,
    name: &str,
    block_size: usize,
) -> Result<Option<Block0>> {
    kvs.run(cx, TxnMode::ReadOnly, |txn| {
        let lo = BlockKey::lowest(name, BlockIndex::Page(0));
        let hi = BlockKey::beyond(name, BlockIndex::Page(0));
        Ok(txn.first_in_range(&lo, &hi).map(|record| {
            let mut data = record
                .payload
                .as_block()
                .map_or_else(Vec::new, <[u8]>::to_vec);
            data.resize(block_size, 0);
            Block0 {
                data,
                file_size: record.file_size.unwrap_or(0),
                version: record.key.version,
            }
        }))
    })
}

/// Blockwise read. Returns the number of bytes actually read; the caller's
/// buffer tail past the logical file size is zero-filled.
pub(crate) fn read(
    cx: &Cx,
    handles: &StoreHandles,
    state: &mut DbFileState,
    buf: &mut [u8],
    offset: u64,
) -> Result<usize> {
    if buf.is_empty() {
        return Ok(0);
    }
    let block_size = state.block0.data.len();
    handles.kvs.run(cx, TxnMode::ReadOnly, |txn| {
        let mut filled = 0_usize;
        for span in block_spans(offset, buf.len(), block_size) {
            let dst = &mut buf[filled..filled + span.len];
            if span.index == 0 {
                // Block 0 is served from the cache; reconcile with the
                // stored copy in case another connection published.
                let lo = BlockKey::lowest(&state.name, BlockIndex::Page(0));
                let hi = BlockKey::beyond(&state.name, BlockIndex::Page(0));
                if let Some(stored) = txn.first_in_range(&lo, &hi) {
                    if stored.key.version < state.block0.version {
                        let mut data = stored
                            .payload
                            .as_block()
                            .map_or_else(Vec::new, <[u8]>::to_vec);
                        data.resize(block_size, 0);
                        state.block0 = Block0 {
                            data,
                            file_size: stored.file_size.unwrap_or(0),
                            version: stored.key.version,
                        };
                    }
                }
                dst.copy_from_slice(
                    &state.block0.data[span.offset_in_block..span.offset_in_block + span.len],
                );
            } else {
                let lo = BlockKey::new(
                    &state.name,
                    BlockIndex::Page(span.index),
                    state.block0.version,
                );
                let hi = BlockKey::beyond(&state.name, BlockIndex::Page(span.index));
                match txn.first_in_range(&lo, &hi) {
                    Some(record) => {
                        let data = record.payload.as_block().unwrap_or(&[]);
                        let end = (span.offset_in_block + span.len).min(data.len());
                        let have = end.saturating_sub(span.offset_in_block);
                        dst[..have]
                            .copy_from_slice(&data[span.offset_in_block..span.offset_in_block + have]);
                        dst[have..].fill(0);
                    }
                    // A hole: the range was extended past this block without
                    // writing it.
                    None => dst.fill(0),
                }
            }
            filled += span.len;
        }
        Ok(())
    })?;

    let file_size = state.block0.file_size;
    if offset >= file_size {
        buf.fill(0);
        return Ok(0);
    }
    #[allow(clippy::cast_possible_truncation)]
    let got = ((file_size - offset) as usize).min(buf.len());
    buf[got..].fill(0);
    Ok(got)
}

/// Blockwise write.
///
/// The fast path (a single aligned full block) puts one record at the
/// current version without reading anything — except block 0, which only
/// mutates in memory until `sync` publishes it. Everything else falls back
/// to read-modify-write over each touched block within one transaction.
pub(crate) fn write(
    cx: &Cx,
    handles: &StoreHandles,
    state: &mut DbFileState,
    buf: &[u8],
    offset: u64,
) -> Result<()> {
    if buf.is_empty() {
        return Ok(());
    }
    let block_size = state.block0.data.len();
    let aligned = offset % block_size as u64 == 0 && buf.len() == block_size;
    if aligned {
        #[allow(clippy::cast_possible_truncation)]
        let index = (offset / block_size as u64) as u32;
        if index == 0 {
            state.block0.data.copy_from_slice(buf);
        } else {
            let record = BlockRecord {
                key: BlockKey::new(&state.name, BlockIndex::Page(index), state.block0.version),
                payload: Payload::Block(buf.to_vec()),
                file_size: None,
            };
            handles.kvs.run(cx, TxnMode::ReadWrite, |txn| txn.put(record))?;
        }
        if let Some(txn_state) = &mut state.txn {
            txn_state.changed_pages.insert(index);
        }
    } else {
        handles.kvs.run(cx, TxnMode::ReadWrite, |txn| {
            let mut consumed = 0_usize;
            for span in block_spans(offset, buf.len(), block_size) {
                let src = &buf[consumed..consumed + span.len];
                if span.index == 0 {
                    state.block0.data[span.offset_in_block..span.offset_in_block + span.len]
                        .copy_from_slice(src);
                } else {
                    let lo = BlockKey::new(
                        &state.name,
                        BlockIndex::Page(span.index),
                        state.block0.version,
                    );
                    let hi = BlockKey::beyond(&state.name, BlockIndex::Page(span.index));
                    let mut data = txn
                        .first_in_range(&lo, &hi)
                        .and_then(|record| record.payload.as_block().map(<[u8]>::to_vec))
                        .unwrap_or_default();
                    data.resize(block_size, 0);
                    data[span.offset_in_block..span.offset_in_block + span.len]
                        .copy_from_slice(src);
                    txn.put(BlockRecord {
                        key: BlockKey::new(
                            &state.name,
                            BlockIndex::Page(span.index),
                            state.block0.version,
                        ),
                        payload: Payload::Block(data),
                        file_size: None,
                    })?;
                }
                if let Some(txn_state) = &mut state.txn {
                    txn_state.changed_pages.insert(span.index);
                }
                consumed += span.len;
            }
            Ok(())
        })?;
    }
    state.block0.file_size = state.block0.file_size.max(offset + buf.len() as u64);
    Ok(())
}

/// Resize the file to `size` bytes. Shrinking drops every block record past
/// the new last block; growing only moves the logical size, creating no
/// blocks. The updated block 0 is published immediately.
pub(crate) fn truncate(
    cx: &Cx,
    handles: &StoreHandles,
    state: &mut DbFileState,
    size: u64,
) -> Result<()> {
    if size == state.block0.file_size {
        return Ok(());
    }
    if size > state.block0.file_size {
        state.block0.file_size = size;
        let record = block0_record(state);
        return handles
            .kvs
            .run(cx, TxnMode::ReadWrite, |txn| txn.put(record));
    }
    state.block0.file_size = size;
    let block_size = state.block0.data.len() as u64;
    #[allow(clippy::cast_possible_truncation)]
    let last_index = if size == 0 { 0 } else { ((size - 1) / block_size) as u32 };
    let record = block0_record(state);
    let name = state.name.clone();
    handles.kvs.run(cx, TxnMode::ReadWrite, |txn| {
        txn.put(record)?;
        if let Some(first_dropped) = last_index.checked_add(1) {
            txn.delete_range(
                &BlockKey::lowest(&name, BlockIndex::Page(first_dropped)),
                // Stop short of the purge record.
                &BlockKey::lowest(&name, BlockIndex::Purge),
            )?;
        }
        Ok(())
    })?;
    debug!(name = %state.name, size, "truncated");
    Ok(())
}

/// Publish the cached block 0 — the commit point — then record purge
/// bookkeeping for the transaction that just ended and hand the file to the
/// purge scheduler.
pub(crate) fn sync(cx: &Cx, handles: &StoreHandles, state: &mut DbFileState) -> Result<()> {
    let record = block0_record(state);
    let name = state.name.clone();
    let version = state.block0.version;
    let ending = state.txn.take();
    let mut purge_entries = 0_usize;
    handles.kvs.run(cx, TxnMode::ReadWrite, |txn| {
        txn.put(record)?;
        if let Some(journalled) = &ending {
            let reclaimable = journalled.reclaimable_pages();
            if !reclaimable.is_empty() {
                let purge_key = BlockKey::new(&name, BlockIndex::Purge, 0);
                let mut map = txn
                    .get(&purge_key)
                    .and_then(|record| record.payload.as_purge_map().cloned())
                    .unwrap_or_default();
                for index in reclaimable {
                    map.insert(index, version);
                }
                purge_entries = map.len();
                txn.put(BlockRecord {
                    key: purge_key,
                    payload: Payload::PurgeMap(map),
                    file_size: None,
                })?;
            }
        }
        Ok(())
    })?;
    handles.kvs.sync(cx)?;
    debug!(name = %name, version, purge_entries, "published block 0");
    handles.purge.note_sync(&name, purge_entries);
    Ok(())
}

/// Reserved-lock cleanup: drop every record whose version is newer than the
/// published block 0 — leftovers of an abandoned transaction by this or any
/// other connection — after reconciling the cache with the stored block 0.
pub(crate) fn on_reserved(cx: &Cx, handles: &StoreHandles, state: &mut DbFileState) -> Result<()> {
    let block_size = state.block0.data.len();
    handles.kvs.run(cx, TxnMode::ReadWrite, |txn| {
        let lo = BlockKey::lowest(&state.name, BlockIndex::Page(0));
        let hi = BlockKey::beyond(&state.name, BlockIndex::Page(0));
        if let Some(stored) = txn.first_in_range(&lo, &hi) {
            if stored.key.version < state.block0.version {
                let mut data = stored
                    .payload
                    .as_block()
                    .map_or_else(Vec::new, <[u8]>::to_vec);
                data.resize(block_size, 0);
                state.block0 = Block0 {
                    data,
                    file_size: stored.file_size.unwrap_or(0),
                    version: stored.key.version,
                };
            }
        }
        let removed = txn.delete_newer_than(&state.name, state.block0.version)?;
        if removed > 0 {
            debug!(name = %state.name, removed, "swept stale versions at reserved");
        }
        Ok(())
    })
}
