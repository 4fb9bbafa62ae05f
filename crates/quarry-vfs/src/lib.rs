//! Versioned-block VFS over a transactional key/value store.
//!
//! The engine sees ordinary files with byte-range reads and writes, a
//! five-state locking protocol, and a rollback journal it can freely write
//! and replay. Underneath, database files live as versioned block records in
//! a key/value store whose only atomic primitive is a multi-key transaction,
//! and the journal is never stored at all: its bytes are reconstructed on
//! demand from the pre-transaction versions of the database blocks.
//!
//! The commit point is the block-0 record of the database file: a
//! transaction's writes land at a new (smaller) version, and publishing
//! block 0 at that version during `sync` is what makes them visible.

pub mod codec;
pub mod journal;
pub mod lock;
pub mod purge;
pub mod store;
pub mod traits;
pub mod vfs;

pub use lock::{HostLockMode, HostLockService, InProcessLocks};
pub use purge::PurgeScheduler;
pub use traits::{Vfs, VfsFile};
pub use vfs::{QuarryFile, QuarryVfs, canonical_path};
