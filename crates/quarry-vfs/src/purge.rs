//! Opportunistic reclamation of obsolete block versions.
//!
//! Each successful sync that recorded purge bookkeeping hands the file to
//! the scheduler. Once the purge record has accumulated `purge_at_least`
//! entries, a purge is scheduled for idle time — idleness is cooperative:
//! the host drives [`PurgeScheduler::run_idle`], and a deferred zero-delay
//! task degenerates to "the next idle call". At most one purge is pending
//! per file. The `Manual` policy suppresses scheduling entirely and leaves
//! reclamation to explicit [`PurgeScheduler::purge`] calls.
//!
//! A purge reads the purge record and, for each `(page index, threshold)`
//! entry, deletes every version strictly older (larger) than the threshold,
//! then drops the purge record — all within one store transaction.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};

use quarry_error::Result;
use quarry_kvs::{BlockIndex, BlockKey, KvsBatcher, TxnMode};
use quarry_types::PurgePolicy;
use quarry_types::cx::Cx;
use tracing::{debug, info};

/// Scheduler for idle-time version reclamation.
pub struct PurgeScheduler {
    kvs: Arc<KvsBatcher>,
    policy: PurgePolicy,
    purge_at_least: usize,
    pending: Mutex<BTreeSet<String>>,
}

impl PurgeScheduler {
    pub(crate) fn new(kvs: Arc<KvsBatcher>, policy: PurgePolicy, purge_at_least: usize) -> Self {
        Self {
            kvs,
            policy,
            purge_at_least,
            pending: Mutex::new(BTreeSet::new()),
        }
    }

    /// Called after a sync published block 0; `purge_entries` is the size of
    /// the file's purge record afterwards.
    pub(crate) fn note_sync(&self, name: &str, purge_entries: usize) {
        if self.policy == PurgePolicy::Manual || purge_entries < self.purge_at_least {
            return;
        }
        let Ok(mut pending) = self.pending.lock() else {
            return;
        };
        if pending.insert(name.to_owned()) {
            debug!(name, purge_entries, "scheduled purge for idle time");
        }
    }

    /// Names with a purge currently scheduled.
    #[must_use]
    pub fn pending(&self) -> Vec<String> {
        self.pending
            .lock()
            .map(|pending| pending.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Cooperative idle hook: run every scheduled purge. Returns how many
    /// files were purged.
    pub fn run_idle(&self, cx: &Cx) -> Result<usize> {
        let drained: Vec<String> = {
            let Ok(mut pending) = self.pending.lock() else {
                return Ok(0);
            };
            std::mem::take(&mut *pending).into_iter().collect()
        };
        for name in &drained {
            self.purge_file(cx, name)?;
        }
        Ok(drained.len())
    }

    /// Purge one file now, regardless of policy.
    pub fn purge(&self, cx: &Cx, name: &str) -> Result<()> {
        if let Ok(mut pending) = self.pending.lock() {
            pending.remove(name);
        }
        self.purge_file(cx, name)
    }

    fn purge_file(&self, cx: &Cx, name: &str) -> Result<()> {
        let mut dropped = 0_usize;
        self.kvs.run(cx, TxnMode::ReadWrite, |txn| {
            let purge_key = BlockKey::new(name, BlockIndex::Purge, 0);
            let Some(record) = txn.get(&purge_key) else {
                return Ok(());
            };
            let Some(map) = record.payload.as_purge_map().cloned() else {
                return Ok(());
            };
            for (&index, &threshold) in &map {
                txn.delete_range(
                    &BlockKey::new(name, BlockIndex::Page(index), threshold + 1),
                    &BlockKey::beyond(name, BlockIndex::Page(index)),
                )?;
            }
            dropped = map.len();
            txn.delete(&purge_key)
        })?;
        self.kvs.sync(cx)?;
        if dropped > 0 {
            info!(name, entries = dropped, "purged obsolete block versions");
        }
        Ok(())
    }
}
