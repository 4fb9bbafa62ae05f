//! Engine-facing VFS façade.
//!
//! Dispatches database files to the versioned store and journal files to the
//! journal emulator. A journal handle shares its sibling database's
//! opened-file entry: the journal is opened while the database is open, and
//! its emulation reads and mutates the database's cached block 0 and
//! transaction bookkeeping.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use quarry_error::{QuarryError, Result};
use quarry_kvs::{BlockIndex, BlockKey, BlockRecord, KvsBatcher, MemoryKvs, Payload, TxnMode};
use quarry_types::cx::Cx;
use quarry_types::flags::{AccessFlags, DeviceCharacteristics, SyncFlags, VfsOpenFlags};
use quarry_types::{LockLevel, StoreOptions};
use tracing::{debug, warn};

use crate::journal::{self, JournalFileState};
use crate::lock::{FileLock, HostLockService, InProcessLocks, reserved_lock_name};
use crate::purge::PurgeScheduler;
use crate::store::{self, Block0, DbFileState, SharedDbState, StoreHandles, state_lock_err};
use crate::traits::{Vfs, VfsFile};

/// The suffix distinguishing a rollback-journal path from its database path.
const JOURNAL_SUFFIX: &str = "-journal";

/// Canonicalize an engine-supplied name to its `/name` path form.
///
/// Names are parsed the way URL paths are: query and fragment suffixes are
/// dropped, a `file://` scheme and authority are stripped, and relative
/// names gain a leading slash — so relative and absolute forms of the same
/// name address the same file.
#[must_use]
pub fn canonical_path(name: &str) -> String {
    let base = name.split(['?', '#']).next().unwrap_or_default();
    let base = base.strip_prefix("file://").map_or(base, |rest| {
        rest.find('/').map_or("/", |slash| &rest[slash..])
    });
    if base.starts_with('/') {
        base.to_owned()
    } else {
        format!("/{base}")
    }
}

#[derive(Default)]
struct VfsInner {
    /// Open database entries by canonical path; journal opens pair with the
    /// sibling entry registered here.
    open_dbs: HashMap<String, SharedDbState>,
    next_temp_id: u64,
}

/// A VFS backed by versioned block records in a key/value store.
///
/// One instance per connection; instances sharing the same [`MemoryKvs`] and
/// host lock service model separate connections to the same origin.
pub struct QuarryVfs<H: HostLockService = InProcessLocks> {
    handles: StoreHandles,
    host: Arc<H>,
    inner: Arc<Mutex<VfsInner>>,
}

impl QuarryVfs<InProcessLocks> {
    /// Open a VFS over `kvs` with default options and in-process locks.
    pub fn new(kvs: MemoryKvs) -> Result<Self> {
        Self::with_options(kvs, StoreOptions::default(), Arc::new(InProcessLocks::new()))
    }
}

impl<H: HostLockService> QuarryVfs<H> {
    /// Open a VFS over `kvs` with explicit options and lock service.
    ///
    /// Validates the store schema; a store one version behind is upgraded in
    /// place, anything else is a cannot-open failure.
    pub fn with_options(kvs: MemoryKvs, options: StoreOptions, host: Arc<H>) -> Result<Self> {
        kvs.open_blocks()?;
        let batcher = Arc::new(KvsBatcher::new(kvs, options.durability));
        let purge = Arc::new(PurgeScheduler::new(
            Arc::clone(&batcher),
            options.purge,
            options.purge_at_least,
        ));
        Ok(Self {
            handles: StoreHandles {
                kvs: batcher,
                options,
                purge,
            },
            host,
            inner: Arc::new(Mutex::new(VfsInner::default())),
        })
    }

    /// The purge scheduler; the host drives its idle hook.
    #[must_use]
    pub fn purge_scheduler(&self) -> Arc<PurgeScheduler> {
        Arc::clone(&self.handles.purge)
    }

    /// Recovery: unconditionally release every lock on `name`, including
    /// locks held by other connections.
    pub fn force_clear_lock(&self, cx: &Cx, name: &str) -> Result<()> {
        let path = canonical_path(name);
        warn!(name = %path, "force-clearing file locks");
        self.host.force_clear(cx, &path)?;
        self.host.force_clear(cx, &reserved_lock_name(&path))
    }

    fn vfs_lock_err() -> QuarryError {
        QuarryError::internal("QuarryVfs registry poisoned")
    }

    fn open_database(
        &self,
        cx: &Cx,
        path: String,
        flags: VfsOpenFlags,
    ) -> Result<QuarryFile<H>> {
        let block_size = self.handles.options.block_size;
        let block0 = match store::load_block0(cx, &self.handles.kvs, &path, block_size)? {
            Some(block0) => block0,
            None if flags.contains(VfsOpenFlags::CREATE) => {
                let block0 = Block0::fresh(block_size);
                // Persist the fresh block 0 so the file exists for access
                // probes and other connections.
                let record = BlockRecord {
                    key: BlockKey::new(&path, BlockIndex::Page(0), block0.version),
                    payload: Payload::Block(block0.data.clone()),
                    file_size: Some(block0.file_size),
                };
                self.handles
                    .kvs
                    .run(cx, TxnMode::ReadWrite, |txn| txn.put(record))?;
                self.handles.kvs.sync(cx)?;
                debug!(name = %path, "created database file");
                block0
            }
            None => return Err(QuarryError::cannot_open(path)),
        };

        let state = Arc::new(Mutex::new(DbFileState {
            name: path.clone(),
            flags,
            block0,
            txn: None,
        }));
        self.inner
            .lock()
            .map_err(|_| Self::vfs_lock_err())?
            .open_dbs
            .insert(path.clone(), Arc::clone(&state));

        Ok(QuarryFile {
            handles: self.handles.clone(),
            registry: Arc::clone(&self.inner),
            kind: FileKind::Database {
                state,
                lock: FileLock::new(Arc::clone(&self.host), &path),
            },
        })
    }

    fn open_journal(&self, path: String, flags: VfsOpenFlags) -> Result<QuarryFile<H>> {
        if !flags.contains(VfsOpenFlags::CREATE) {
            // Journal bytes are never stored, so a journal only "exists"
            // while this connection is writing it.
            return Err(QuarryError::cannot_open(path));
        }
        let db_path = path
            .strip_suffix(JOURNAL_SUFFIX)
            .unwrap_or(path.as_str())
            .to_owned();
        let db = self
            .inner
            .lock()
            .map_err(|_| Self::vfs_lock_err())?
            .open_dbs
            .get(&db_path)
            .cloned()
            .ok_or_else(|| QuarryError::cannot_open(path.clone()))?;
        Ok(QuarryFile {
            handles: self.handles.clone(),
            registry: Arc::clone(&self.inner),
            kind: FileKind::Journal {
                state: JournalFileState::new(path, flags, db),
            },
        })
    }
}

impl<H: HostLockService> Vfs for QuarryVfs<H> {
    type File = QuarryFile<H>;

    fn name(&self) -> &'static str {
        "quarry"
    }

    fn open(
        &self,
        cx: &Cx,
        name: Option<&str>,
        flags: VfsOpenFlags,
    ) -> Result<(Self::File, VfsOpenFlags)> {
        let path = match name {
            Some(name) => canonical_path(name),
            None => {
                let mut inner = self.inner.lock().map_err(|_| Self::vfs_lock_err())?;
                let id = inner.next_temp_id;
                inner.next_temp_id += 1;
                format!("/.temp-{id}")
            }
        };

        let file = if flags.is_journal() {
            self.open_journal(path, flags)
        } else {
            self.open_database(cx, path, flags)
        }
        .map_err(|err| {
            warn!(error = %err, "open failed");
            err
        })?;

        let mut out_flags = flags;
        if flags.contains(VfsOpenFlags::CREATE) {
            out_flags |= VfsOpenFlags::READWRITE;
        }
        Ok((file, out_flags))
    }

    fn delete(&self, cx: &Cx, name: &str, sync_dir: bool) -> Result<()> {
        let path = canonical_path(name);
        self.handles.kvs.run(cx, TxnMode::ReadWrite, |txn| {
            txn.delete_range(
                &BlockKey::lowest(&path, BlockIndex::Page(0)),
                &BlockKey::beyond_name(&path),
            )
        })?;
        if sync_dir {
            self.handles.kvs.sync(cx)?;
        }
        debug!(name = %path, sync_dir, "deleted file records");
        Ok(())
    }

    fn access(&self, cx: &Cx, name: &str, _flags: AccessFlags) -> Result<bool> {
        let path = canonical_path(name);
        self.handles.kvs.run(cx, TxnMode::ReadOnly, |txn| {
            Ok(txn
                .first_in_range(
                    &BlockKey::lowest(&path, BlockIndex::Page(0)),
                    &BlockKey::beyond(&path, BlockIndex::Page(0)),
                )
                .is_some())
        })
    }

    fn full_pathname(&self, _cx: &Cx, name: &str) -> Result<String> {
        Ok(canonical_path(name))
    }
}

enum FileKind<H: HostLockService> {
    Database {
        state: SharedDbState,
        lock: FileLock<H>,
    },
    Journal {
        state: JournalFileState,
    },
}

/// A file handle opened by [`QuarryVfs`].
pub struct QuarryFile<H: HostLockService = InProcessLocks> {
    handles: StoreHandles,
    registry: Arc<Mutex<VfsInner>>,
    kind: FileKind<H>,
}

impl<H: HostLockService> std::fmt::Debug for QuarryFile<H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QuarryFile").finish_non_exhaustive()
    }
}

impl<H: HostLockService> VfsFile for QuarryFile<H> {
    fn close(&mut self, cx: &Cx) -> Result<()> {
        match &mut self.kind {
            FileKind::Database { state, lock } => {
                lock.release_all();
                let (name, delete_on_close) = {
                    let locked = state.lock().map_err(|_| state_lock_err())?;
                    (
                        locked.name.clone(),
                        locked.flags.contains(VfsOpenFlags::DELETEONCLOSE),
                    )
                };
                if let Ok(mut inner) = self.registry.lock() {
                    if let Some(registered) = inner.open_dbs.get(&name) {
                        if Arc::ptr_eq(registered, state) {
                            inner.open_dbs.remove(&name);
                        }
                    }
                }
                if delete_on_close {
                    self.handles.kvs.run(cx, TxnMode::ReadWrite, |txn| {
                        txn.delete_range(
                            &BlockKey::lowest(&name, BlockIndex::Page(0)),
                            &BlockKey::beyond_name(&name),
                        )
                    })?;
                    self.handles.kvs.sync(cx)?;
                }
                Ok(())
            }
            FileKind::Journal { state } => {
                // Nothing is stored for a journal; drop the in-memory view.
                state.cached_page_index = None;
                state.cached_entry.clear();
                Ok(())
            }
        }
    }

    fn read(&mut self, cx: &Cx, buf: &mut [u8], offset: u64) -> Result<usize> {
        match &mut self.kind {
            FileKind::Database { state, .. } => {
                let mut locked = state.lock().map_err(|_| state_lock_err())?;
                store::read(cx, &self.handles, &mut locked, buf, offset)
            }
            FileKind::Journal { state } => journal::read(cx, &self.handles, state, buf, offset),
        }
        .map_err(|err| {
            warn!(error = %err, offset, "read failed");
            err
        })
    }

    fn write(&mut self, cx: &Cx, buf: &[u8], offset: u64) -> Result<()> {
        match &mut self.kind {
            FileKind::Database { state, .. } => {
                let mut locked = state.lock().map_err(|_| state_lock_err())?;
                store::write(cx, &self.handles, &mut locked, buf, offset)
            }
            FileKind::Journal { state } => journal::write(state, buf, offset),
        }
        .map_err(|err| {
            warn!(error = %err, offset, "write failed");
            err
        })
    }

    fn truncate(&mut self, cx: &Cx, size: u64) -> Result<()> {
        match &mut self.kind {
            FileKind::Database { state, .. } => {
                let mut locked = state.lock().map_err(|_| state_lock_err())?;
                store::truncate(cx, &self.handles, &mut locked, size)
            }
            FileKind::Journal { state } => {
                journal::truncate(state, size);
                Ok(())
            }
        }
    }

    fn sync(&mut self, cx: &Cx, _flags: SyncFlags) -> Result<()> {
        match &mut self.kind {
            FileKind::Database { state, .. } => {
                let mut locked = state.lock().map_err(|_| state_lock_err())?;
                store::sync(cx, &self.handles, &mut locked).map_err(|err| {
                    warn!(error = %err, "sync failed");
                    err
                })
            }
            // The journal is never stored; syncing it is a no-op.
            FileKind::Journal { .. } => Ok(()),
        }
    }

    fn file_size(&self, _cx: &Cx) -> Result<u64> {
        match &self.kind {
            FileKind::Database { state, .. } => {
                let locked = state.lock().map_err(|_| state_lock_err())?;
                Ok(locked.block0.file_size)
            }
            FileKind::Journal { state } => Ok(state.file_size),
        }
    }

    fn lock(&mut self, cx: &Cx, level: LockLevel) -> Result<()> {
        match &mut self.kind {
            FileKind::Database { state, lock } => {
                let before = lock.level();
                lock.lock(cx, level)?;
                if before < LockLevel::Reserved && lock.level() >= LockLevel::Reserved {
                    // A writer is starting: sweep leftovers of any abandoned
                    // transaction before it observes or writes versions.
                    let mut locked = state.lock().map_err(|_| state_lock_err())?;
                    store::on_reserved(cx, &self.handles, &mut locked)?;
                }
                Ok(())
            }
            FileKind::Journal { .. } => Ok(()),
        }
    }

    fn unlock(&mut self, cx: &Cx, level: LockLevel) -> Result<()> {
        match &mut self.kind {
            FileKind::Database { lock, .. } => lock.unlock(cx, level),
            FileKind::Journal { .. } => Ok(()),
        }
    }

    fn check_reserved_lock(&self, cx: &Cx) -> Result<bool> {
        match &self.kind {
            FileKind::Database { lock, .. } => lock.check_reserved(cx),
            FileKind::Journal { .. } => Ok(false),
        }
    }

    fn sector_size(&self) -> u32 {
        #[allow(clippy::cast_possible_truncation)]
        let size = self.handles.options.block_size as u32;
        size
    }

    fn device_characteristics(&self) -> DeviceCharacteristics {
        DeviceCharacteristics::SAFE_APPEND
            | DeviceCharacteristics::SEQUENTIAL
            | DeviceCharacteristics::UNDELETABLE_WHEN_OPEN
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_paths() {
        assert_eq!(canonical_path("main.db"), "/main.db");
        assert_eq!(canonical_path("/main.db"), "/main.db");
        assert_eq!(canonical_path("main.db?vfs=quarry&cache=shared"), "/main.db");
        assert_eq!(canonical_path("main.db#frag"), "/main.db");
        assert_eq!(canonical_path("file://localhost/main.db"), "/main.db");
        assert_eq!(canonical_path("file://host"), "/");
    }

    #[test]
    fn journal_suffix_pairs_with_the_database() {
        assert_eq!(canonical_path("main.db-journal"), "/main.db-journal");
        assert!(canonical_path("main.db-journal").ends_with(JOURNAL_SUFFIX));
    }
}
