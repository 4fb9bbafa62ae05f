pub mod cx;
pub mod flags;

use serde::{Deserialize, Serialize};

/// Default payload size of one block record, in bytes.
pub const DEFAULT_BLOCK_SIZE: usize = 4096;

/// Default number of purge-record entries that triggers an opportunistic
/// purge after a successful sync.
pub const DEFAULT_PURGE_AT_LEAST: usize = 16;

/// Lock level for database file locking (the engine's five-state lock).
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum LockLevel {
    /// No lock held.
    #[default]
    None = 0,
    /// Shared lock (reading).
    Shared = 1,
    /// Reserved lock (intending to write).
    Reserved = 2,
    /// Pending lock (waiting for shared locks to clear).
    Pending = 3,
    /// Exclusive lock (writing).
    Exclusive = 4,
}

/// Durability hint forwarded to the key/value substrate.
///
/// `Relaxed` suppresses the post-commit durability barrier; commits still
/// apply atomically but may be lost on a crash before the substrate's own
/// flush.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Durability {
    /// Force a durability barrier on every sync.
    Strict,
    /// Let the substrate choose; still await the barrier on sync.
    #[default]
    Default,
    /// Skip awaiting the durability barrier after commit.
    Relaxed,
}

/// When obsolete block versions are reclaimed.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PurgePolicy {
    /// Schedule a purge for idle time after a qualifying sync.
    #[default]
    Deferred,
    /// Never purge automatically; the host calls `purge(path)` explicitly.
    Manual,
}

/// Configuration for a versioned block store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreOptions {
    /// Payload size of one block record.
    pub block_size: usize,
    /// Durability hint for substrate commits.
    pub durability: Durability,
    /// Automatic purge behavior.
    pub purge: PurgePolicy,
    /// Minimum purge-record entries before an automatic purge is scheduled.
    pub purge_at_least: usize,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            durability: Durability::Default,
            purge: PurgePolicy::Deferred,
            purge_at_least: DEFAULT_PURGE_AT_LEAST,
        }
    }
}
