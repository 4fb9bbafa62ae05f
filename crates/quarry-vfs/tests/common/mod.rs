//! Scripted engine driver for integration tests.
//!
//! Reproduces the I/O sequence the embedded engine performs in rollback-
//! journal mode: lock escalation, journal header + page pre-images, page
//! writes, the commit-point sync, and journal invalidation — or, on the
//! other path, journal playback for rollback.

#![allow(dead_code)]

use quarry_error::Result;
use quarry_kvs::MemoryKvs;
use quarry_types::cx::Cx;
use quarry_types::flags::{SyncFlags, VfsOpenFlags};
use quarry_types::{LockLevel, PurgePolicy, StoreOptions};
use quarry_vfs::codec::{
    JOURNAL_NONCE_OFFSET, JOURNAL_SECTOR_SIZE_OFFSET, journal_page_checksum, read_be_u32_at,
    write_be_u32_at,
};
use quarry_vfs::{InProcessLocks, QuarryFile, QuarryVfs, Vfs, VfsFile};
use std::sync::Arc;

/// Small blocks keep test files readable.
pub const BLOCK: usize = 64;
/// The journal header occupies one sector; the engine sizes it from
/// `sector_size()`, which this VFS reports as the block size.
pub const SECTOR: usize = BLOCK;
const ENTRY: usize = BLOCK + 8;
const NONCE: u32 = 0x5EED_CAFE;

pub fn options(purge: PurgePolicy) -> StoreOptions {
    StoreOptions {
        block_size: BLOCK,
        purge,
        purge_at_least: 1,
        ..StoreOptions::default()
    }
}

/// A connection: one VFS over the shared store and lock table.
pub fn connect(kvs: &MemoryKvs, locks: &Arc<InProcessLocks>, purge: PurgePolicy) -> QuarryVfs {
    QuarryVfs::with_options(kvs.clone(), options(purge), Arc::clone(locks)).unwrap()
}

pub fn open_db(cx: &Cx, vfs: &QuarryVfs, name: &str) -> QuarryFile {
    let flags = VfsOpenFlags::MAIN_DB | VfsOpenFlags::CREATE | VfsOpenFlags::READWRITE;
    vfs.open(cx, Some(name), flags).unwrap().0
}

/// Read one page (1-based) straight from the database file.
pub fn read_page(cx: &Cx, db: &mut QuarryFile, page: u32) -> Vec<u8> {
    let mut buf = vec![0_u8; BLOCK];
    db.read(cx, &mut buf, u64::from(page - 1) * BLOCK as u64)
        .unwrap();
    buf
}

/// An in-flight journalled transaction driven the way the engine drives it.
pub struct EngineTxn<'a> {
    cx: &'a Cx,
    vfs: &'a QuarryVfs,
    journal_path: String,
    journal: QuarryFile,
    entries: usize,
}

impl<'a> EngineTxn<'a> {
    /// Lock for writing and initialize a fresh journal header.
    pub fn begin(cx: &'a Cx, vfs: &'a QuarryVfs, db: &mut QuarryFile, db_path: &str) -> Self {
        db.lock(cx, LockLevel::Shared).unwrap();
        db.lock(cx, LockLevel::Reserved).unwrap();

        let journal_path = format!("{db_path}-journal");
        let flags = VfsOpenFlags::MAIN_JOURNAL | VfsOpenFlags::CREATE | VfsOpenFlags::READWRITE;
        let (mut journal, _) = vfs.open(cx, Some(journal_path.as_str()), flags).unwrap();

        let mut header = vec![0_u8; SECTOR];
        header[..8].copy_from_slice(&[0xD9, 0xD5, 0x05, 0xF9, 0x20, 0xA1, 0x63, 0xD7]);
        write_be_u32_at(&mut header, JOURNAL_NONCE_OFFSET, NONCE);
        write_be_u32_at(&mut header, JOURNAL_SECTOR_SIZE_OFFSET, SECTOR as u32);
        write_be_u32_at(&mut header, 24, BLOCK as u32);
        journal.write(cx, &header, 0).unwrap();

        Self {
            cx,
            vfs,
            journal_path,
            journal,
            entries: 0,
        }
    }

    /// Journal the pre-image of `page` (1-based): page number, old bytes,
    /// checksum — three writes, the way the engine issues them.
    pub fn journal_page(&mut self, db: &mut QuarryFile, page: u32) {
        let pre_image = read_page(self.cx, db, page);
        let base = (SECTOR + self.entries * ENTRY) as u64;
        self.journal
            .write(self.cx, &page.to_be_bytes(), base)
            .unwrap();
        self.journal.write(self.cx, &pre_image, base + 4).unwrap();
        let checksum = journal_page_checksum(NONCE, &pre_image);
        self.journal
            .write(self.cx, &checksum.to_be_bytes(), base + 4 + BLOCK as u64)
            .unwrap();
        self.entries += 1;
    }

    /// Overwrite `page` (1-based) with new content.
    pub fn write_page(&self, db: &mut QuarryFile, page: u32, data: &[u8]) {
        assert_eq!(data.len(), BLOCK);
        db.write(self.cx, data, u64::from(page - 1) * BLOCK as u64)
            .unwrap();
    }

    /// Commit: sync the journal, escalate, publish, invalidate the journal.
    pub fn commit(mut self, db: &mut QuarryFile) -> Result<()> {
        self.journal.sync(self.cx, SyncFlags::NORMAL)?;
        db.lock(self.cx, LockLevel::Exclusive)?;
        db.sync(self.cx, SyncFlags::NORMAL)?;
        self.vfs.delete(self.cx, &self.journal_path, false)?;
        self.journal.close(self.cx)?;
        db.unlock(self.cx, LockLevel::None)?;
        Ok(())
    }

    /// Roll back: replay every journalled pre-image through journal reads,
    /// verifying checksums, then invalidate the journal.
    pub fn rollback(mut self, db: &mut QuarryFile) -> Result<()> {
        let mut header = vec![0_u8; SECTOR];
        self.journal.read(self.cx, &mut header, 0)?;
        let nonce = read_be_u32_at(&header, JOURNAL_NONCE_OFFSET);

        for entry_index in 0..self.entries {
            let base = (SECTOR + entry_index * ENTRY) as u64;
            let mut entry = vec![0_u8; ENTRY];
            let got = self.journal.read(self.cx, &mut entry, base)?;
            assert_eq!(got, ENTRY, "torn journal entry {entry_index}");

            let page = read_be_u32_at(&entry, 0);
            let content = &entry[4..4 + BLOCK];
            let checksum = read_be_u32_at(&entry, 4 + BLOCK);
            assert_eq!(
                checksum,
                journal_page_checksum(nonce, content),
                "journal checksum mismatch on page {page}"
            );
            db.write(self.cx, content, u64::from(page - 1) * BLOCK as u64)?;
        }

        self.vfs.delete(self.cx, &self.journal_path, false)?;
        self.journal.close(self.cx)?;
        db.unlock(self.cx, LockLevel::None)?;
        Ok(())
    }

    /// Walk away mid-transaction: locks and journal state evaporate with
    /// the process; staged store writes were never published.
    pub fn abandon(self, db: &mut QuarryFile) {
        drop(self.journal);
        db.unlock(self.cx, LockLevel::None).unwrap();
    }

    /// Read `len` journal bytes at `offset`, the way the engine reads them:
    /// one region at a time.
    pub fn read_journal(&mut self, offset: u64, len: usize) -> Vec<u8> {
        let mut buf = vec![0_u8; len];
        self.journal.read(self.cx, &mut buf, offset).unwrap();
        buf
    }
}

/// One whole committed transaction over `pages` (1-based) with `fill`
/// patterns.
pub fn commit_pages(
    cx: &Cx,
    vfs: &QuarryVfs,
    db: &mut QuarryFile,
    db_path: &str,
    pages: &[(u32, u8)],
) {
    let mut txn = EngineTxn::begin(cx, vfs, db, db_path);
    for &(page, _) in pages {
        txn.journal_page(db, page);
    }
    for &(page, fill) in pages {
        txn.write_page(db, page, &vec![fill; BLOCK]);
    }
    txn.commit(db).unwrap();
}
