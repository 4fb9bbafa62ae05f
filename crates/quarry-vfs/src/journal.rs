//! Zero-store rollback-journal emulator.
//!
//! No byte of the journal file is ever persisted. The header (one sector,
//! sized by bytes 20..23 of the header itself) is kept in RAM; everything
//! after it is a stream of page entries of `page_size + 8` bytes — 4 bytes
//! of 1-based page number, the page bytes, 4 bytes of checksum — whose
//! content is reconstructed on demand from the pre-transaction versions of
//! the sibling database file's blocks.
//!
//! Writing a header whose first byte is non-zero starts a fresh journalled
//! transaction on the database: its in-memory block-0 version is decremented
//! so subsequent writes land at a new version, and the journalled/changed
//! page bookkeeping is reset. Writes at entry boundaries capture the page
//! number; page data and checksums are discarded.

use std::sync::Arc;

use quarry_error::{QuarryError, Result};
use quarry_kvs::{BlockIndex, BlockKey, TxnMode};
use quarry_types::cx::Cx;
use quarry_types::flags::VfsOpenFlags;
use tracing::debug;

use crate::codec::{
    JOURNAL_ENTRY_OVERHEAD, JOURNAL_NONCE_OFFSET, JOURNAL_SECTOR_SIZE_OFFSET, journal_page_checksum,
    read_be_u32_at,
};
use crate::store::{JournalledTxn, SharedDbState, StoreHandles, state_lock_err};

/// In-memory state of one opened journal file.
///
/// The read-cache fields live here, per file — a cache shared across journal
/// files would serve one journal's entry to another.
pub(crate) struct JournalFileState {
    pub name: String,
    #[allow(dead_code)]
    pub flags: VfsOpenFlags,
    /// Header bytes as written by the engine. Never persisted.
    pub header: Vec<u8>,
    /// Logical journal size: the high-water mark of engine writes.
    pub file_size: u64,
    /// The sibling database file's opened-file entry.
    pub db: SharedDbState,
    /// Read cache: the page index of `cached_entry`, if valid.
    pub cached_page_index: Option<u32>,
    /// Read cache: one fully built page entry.
    pub cached_entry: Vec<u8>,
}

impl JournalFileState {
    pub(crate) fn new(name: String, flags: VfsOpenFlags, db: SharedDbState) -> Self {
        Self {
            name,
            flags,
            header: Vec::new(),
            file_size: 0,
            db,
            cached_page_index: None,
            cached_entry: Vec::new(),
        }
    }

    /// Header sector size, read from the header itself; `fallback` (the
    /// database block size) applies while the field is unwritten.
    fn sector_size(&self, fallback: usize) -> usize {
        let parsed = read_be_u32_at(&self.header, JOURNAL_SECTOR_SIZE_OFFSET) as usize;
        if parsed == 0 { fallback } else { parsed }
    }
}

/// Journal write: remember the header, capture page numbers at entry
/// boundaries, discard everything else. Always advances the logical size.
pub(crate) fn write(state: &mut JournalFileState, buf: &[u8], offset: u64) -> Result<()> {
    if buf.is_empty() {
        return Ok(());
    }
    if offset == 0 {
        if state.header.len() < buf.len() {
            state.header.resize(buf.len(), 0);
        }
        state.header[..buf.len()].copy_from_slice(buf);
        if buf[0] != 0 {
            // A fresh transaction opens: reset bookkeeping and move the
            // database to a new in-memory version.
            let mut db = state.db.lock().map_err(|_| state_lock_err())?;
            db.txn = Some(JournalledTxn::default());
            db.block0.version -= 1;
            debug!(
                journal = %state.name,
                db_version = db.block0.version,
                "journal header initialized, transaction opened"
            );
            state.cached_page_index = None;
            state.cached_entry.clear();
        }
    } else {
        let mut db = state.db.lock().map_err(|_| state_lock_err())?;
        let block_size = db.block0.data.len();
        let entry_size = (block_size + JOURNAL_ENTRY_OVERHEAD) as u64;
        let sector = state.sector_size(block_size) as u64;
        if offset >= sector && (offset - sector) % entry_size == 0 && buf.len() >= 4 {
            let page_number = read_be_u32_at(buf, 0);
            #[allow(clippy::cast_possible_truncation)]
            let entry_index = ((offset - sector) / entry_size) as usize;
            let txn = db
                .txn
                .as_mut()
                .expect("journal entry written with no open journalled transaction");
            if txn.journal_pages.len() <= entry_index {
                txn.journal_pages.resize(entry_index + 1, None);
            }
            // Page numbers on the wire are 1-based.
            txn.journal_pages[entry_index] = Some(page_number.saturating_sub(1));
        }
        // Page data and checksum bytes are discarded; reads reconstruct them.
    }
    state.file_size = state.file_size.max(offset + buf.len() as u64);
    Ok(())
}

/// Journal read: serve the header from RAM and rebuild page entries from the
/// pre-transaction versions of the database blocks.
pub(crate) fn read(
    cx: &Cx,
    handles: &StoreHandles,
    state: &mut JournalFileState,
    buf: &mut [u8],
    offset: u64,
) -> Result<usize> {
    if buf.is_empty() {
        return Ok(0);
    }
    let (db_name, db_version, block_size) = {
        let db = state.db.lock().map_err(|_| state_lock_err())?;
        (db.name.clone(), db.block0.version, db.block0.data.len())
    };
    let sector = state.sector_size(block_size);

    #[allow(clippy::cast_possible_truncation)]
    if (offset as usize) < sector {
        let start = offset as usize;
        let have = state.header.len().saturating_sub(start).min(buf.len());
        buf[..have].copy_from_slice(&state.header[start..start + have]);
        buf[have..].fill(0);
    } else {
        let entry_size = block_size + JOURNAL_ENTRY_OVERHEAD;
        let rel = offset as usize - sector;
        let entry_index = rel / entry_size;
        let pos_in_entry = rel % entry_size;

        let page_index = {
            let db = state.db.lock().map_err(|_| state_lock_err())?;
            db.txn
                .as_ref()
                .and_then(|txn| txn.journal_pages.get(entry_index).copied().flatten())
        }
        .ok_or_else(|| {
            QuarryError::io(format!(
                "journal entry {entry_index} of '{name}' was never written",
                name = state.name
            ))
        })?;

        if state.cached_page_index != Some(page_index) {
            // Rebuild the entry: the pre-transaction page is the newest
            // version strictly older than the database's current version.
            let nonce = read_be_u32_at(&state.header, JOURNAL_NONCE_OFFSET);
            let page = handles
                .kvs
                .run(cx, TxnMode::ReadOnly, |txn| {
                    let lo = BlockKey::new(&db_name, BlockIndex::Page(page_index), db_version + 1);
                    let hi = BlockKey::beyond(&db_name, BlockIndex::Page(page_index));
                    Ok(txn
                        .first_in_range(&lo, &hi)
                        .and_then(|record| record.payload.as_block().map(<[u8]>::to_vec)))
                })?
                .unwrap_or_else(|| vec![0; block_size]);
            let mut page = page;
            page.resize(block_size, 0);

            let mut entry = Vec::with_capacity(entry_size);
            entry.extend_from_slice(&(page_index + 1).to_be_bytes());
            let checksum = journal_page_checksum(nonce, &page);
            entry.extend_from_slice(&page);
            entry.extend_from_slice(&checksum.to_be_bytes());
            state.cached_entry = entry;
            state.cached_page_index = Some(page_index);
            debug!(
                journal = %state.name,
                entry_index,
                page_index,
                "reconstructed journal entry"
            );
        }

        let have = state
            .cached_entry
            .len()
            .saturating_sub(pos_in_entry)
            .min(buf.len());
        buf[..have].copy_from_slice(&state.cached_entry[pos_in_entry..pos_in_entry + have]);
        buf[have..].fill(0);
    }

    let file_size = state.file_size;
    if offset >= file_size {
        buf.fill(0);
        return Ok(0);
    }
    #[allow(clippy::cast_possible_truncation)]
    let got = ((file_size - offset) as usize).min(buf.len());
    buf[got..].fill(0);
    Ok(got)
}

/// Journal truncate: only the logical size moves; there is nothing stored.
pub(crate) fn truncate(state: &mut JournalFileState, size: u64) {
    if size < state.file_size {
        state.file_size = size;
    }
}
