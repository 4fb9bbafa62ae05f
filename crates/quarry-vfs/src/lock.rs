//! Five-state lock escalation over the host's cross-tab lock primitive.
//!
//! The host primitive offers shared/exclusive scopes with a non-blocking
//! try-acquire and releases a grant when it is dropped (scope exit). The
//! escalation maps onto two named locks per file:
//!
//! - `{path}` — held shared by readers, exclusive by the active writer;
//! - `{path}-reserved` — held exclusive by a connection intending to write.
//!
//! Key invariants:
//! - `lock` is idempotent when the current state already satisfies the target
//! - `unlock` only downgrades
//! - a denied escalation reports busy without blocking; the upgrade to
//!   EXCLUSIVE that fails re-takes its shared grant and parks at PENDING so
//!   a later attempt retries from there
//! - `force_clear` unconditionally releases every grant on a name (recovery)

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use quarry_error::{QuarryError, Result};
use quarry_types::LockLevel;
use quarry_types::cx::Cx;
use tracing::{debug, warn};

/// Scope of a host lock grant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostLockMode {
    Shared,
    Exclusive,
}

/// The host's cross-tab lock primitive.
///
/// Grants are released on drop. This in-process contract is always
/// non-blocking; `if_available` is forwarded for hosts that can queue.
pub trait HostLockService: Send + Sync {
    type Grant: Send + Sync;

    /// Try to acquire `name` in `mode`. Returns `None` when the lock cannot
    /// be granted without blocking.
    fn acquire(
        &self,
        cx: &Cx,
        name: &str,
        mode: HostLockMode,
        if_available: bool,
    ) -> Result<Option<Self::Grant>>;

    /// Unconditionally release every grant on `name`, including grants held
    /// by other connections. Outstanding grant handles become inert.
    fn force_clear(&self, cx: &Cx, name: &str) -> Result<()>;
}

// ---------------------------------------------------------------------------
// In-process host lock service
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct LockSlot {
    shared: u32,
    exclusive: bool,
    /// Bumped by `force_clear` so stale grants do not release newer state.
    epoch: u64,
}

type SlotTable = Arc<Mutex<HashMap<String, LockSlot>>>;

/// Table-backed lock service for a single process.
#[derive(Debug, Clone, Default)]
pub struct InProcessLocks {
    slots: SlotTable,
}

impl InProcessLocks {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

/// A held lock; dropping it releases the grant.
#[derive(Debug)]
pub struct InProcessGrant {
    slots: SlotTable,
    name: String,
    mode: HostLockMode,
    epoch: u64,
}

impl Drop for InProcessGrant {
    fn drop(&mut self) {
        let Ok(mut slots) = self.slots.lock() else {
            return;
        };
        let Some(slot) = slots.get_mut(&self.name) else {
            return;
        };
        if slot.epoch != self.epoch {
            // force_clear already released this grant.
            return;
        }
        match self.mode {
            HostLockMode::Shared => slot.shared = slot.shared.saturating_sub(1),
            HostLockMode::Exclusive => slot.exclusive = false,
        }
    }
}

fn lock_err() -> QuarryError {
    QuarryError::internal("lock table poisoned")
}

impl HostLockService for InProcessLocks {
    type Grant = InProcessGrant;

    fn acquire(
        &self,
        _cx: &Cx,
        name: &str,
        mode: HostLockMode,
        _if_available: bool,
    ) -> Result<Option<InProcessGrant>> {
        let mut slots = self.slots.lock().map_err(|_| lock_err())?;
        let slot = slots.entry(name.to_owned()).or_default();
        let granted = match mode {
            HostLockMode::Shared => {
                if slot.exclusive {
                    false
                } else {
                    slot.shared += 1;
                    true
                }
            }
            HostLockMode::Exclusive => {
                if slot.exclusive || slot.shared > 0 {
                    false
                } else {
                    slot.exclusive = true;
                    true
                }
            }
        };
        if !granted {
            return Ok(None);
        }
        Ok(Some(InProcessGrant {
            slots: Arc::clone(&self.slots),
            name: name.to_owned(),
            mode,
            epoch: slot.epoch,
        }))
    }

    fn force_clear(&self, _cx: &Cx, name: &str) -> Result<()> {
        let mut slots = self.slots.lock().map_err(|_| lock_err())?;
        if let Some(slot) = slots.get_mut(name) {
            warn!(name, shared = slot.shared, exclusive = slot.exclusive, "force-clearing lock");
            slot.shared = 0;
            slot.exclusive = false;
            slot.epoch += 1;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Per-file lock state machine
// ---------------------------------------------------------------------------

/// The five-state lock of one opened database file.
pub(crate) struct FileLock<H: HostLockService> {
    host: Arc<H>,
    name: String,
    reserved_name: String,
    level: LockLevel,
    shared: Option<H::Grant>,
    reserved: Option<H::Grant>,
    exclusive: Option<H::Grant>,
}

/// The `-reserved` companion lock name of a file.
pub(crate) fn reserved_lock_name(name: &str) -> String {
    format!("{name}-reserved")
}

impl<H: HostLockService> FileLock<H> {
    pub(crate) fn new(host: Arc<H>, name: &str) -> Self {
        Self {
            host,
            name: name.to_owned(),
            reserved_name: reserved_lock_name(name),
            level: LockLevel::None,
            shared: None,
            reserved: None,
            exclusive: None,
        }
    }

    pub(crate) fn level(&self) -> LockLevel {
        self.level
    }

    /// Escalate to `target`. Idempotent when already satisfied; `Busy` when
    /// the escalation cannot complete without blocking.
    pub(crate) fn lock(&mut self, cx: &Cx, target: LockLevel) -> Result<()> {
        if self.level >= target {
            return Ok(());
        }
        match target {
            LockLevel::None => Ok(()),
            LockLevel::Shared => {
                match self
                    .host
                    .acquire(cx, &self.name, HostLockMode::Shared, true)?
                {
                    Some(grant) => {
                        self.shared = Some(grant);
                        self.level = LockLevel::Shared;
                        debug!(name = %self.name, "lock: none -> shared");
                        Ok(())
                    }
                    None => Err(QuarryError::Busy),
                }
            }
            LockLevel::Reserved => self.take_reserved(cx),
            LockLevel::Pending | LockLevel::Exclusive => {
                if self.level < LockLevel::Reserved {
                    self.take_reserved(cx)?;
                }
                // Trade the shared grant for an exclusive one. Writers must
                // hold the reserved lock first, so nobody else can slip an
                // exclusive grant in between.
                self.shared = None;
                match self
                    .host
                    .acquire(cx, &self.name, HostLockMode::Exclusive, true)?
                {
                    Some(grant) => {
                        self.exclusive = Some(grant);
                        self.level = LockLevel::Exclusive;
                        debug!(name = %self.name, "lock: reserved -> exclusive");
                        Ok(())
                    }
                    None => {
                        // Readers are still active. Re-take the shared grant
                        // and park at PENDING for the retry.
                        self.shared = self
                            .host
                            .acquire(cx, &self.name, HostLockMode::Shared, true)?;
                        self.level = LockLevel::Pending;
                        debug!(name = %self.name, "lock: exclusive denied, parked at pending");
                        Err(QuarryError::Busy)
                    }
                }
            }
        }
    }

    fn take_reserved(&mut self, cx: &Cx) -> Result<()> {
        debug_assert!(self.level >= LockLevel::Shared, "reserved requires shared");
        match self
            .host
            .acquire(cx, &self.reserved_name, HostLockMode::Exclusive, true)?
        {
            Some(grant) => {
                self.reserved = Some(grant);
                self.level = LockLevel::Reserved;
                debug!(name = %self.name, "lock: shared -> reserved");
                Ok(())
            }
            None => Err(QuarryError::Busy),
        }
    }

    /// Downgrade to `target`. Never upgrades.
    pub(crate) fn unlock(&mut self, cx: &Cx, target: LockLevel) -> Result<()> {
        if target >= self.level {
            return Ok(());
        }
        if target < LockLevel::Exclusive {
            self.exclusive = None;
        }
        if target >= LockLevel::Shared && self.shared.is_none() {
            // Holding exclusive implied holding the write intent, so the
            // shared grant is immediately available again.
            self.shared = self
                .host
                .acquire(cx, &self.name, HostLockMode::Shared, true)?;
        }
        if target < LockLevel::Reserved {
            self.reserved = None;
        }
        if target < LockLevel::Shared {
            self.shared = None;
        }
        debug!(name = %self.name, from = ?self.level, to = ?target, "unlock");
        self.level = target;
        Ok(())
    }

    /// Whether a RESERVED or higher lock is held on this file, by this
    /// connection or any other.
    pub(crate) fn check_reserved(&self, cx: &Cx) -> Result<bool> {
        if self.level >= LockLevel::Reserved {
            return Ok(true);
        }
        match self
            .host
            .acquire(cx, &self.reserved_name, HostLockMode::Exclusive, true)?
        {
            Some(grant) => {
                drop(grant);
                Ok(false)
            }
            None => Ok(true),
        }
    }

    /// Release everything (file close).
    pub(crate) fn release_all(&mut self) {
        self.exclusive = None;
        self.reserved = None;
        self.shared = None;
        self.level = LockLevel::None;
    }
}
