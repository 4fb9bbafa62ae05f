//! Capability context (`Cx`) threaded through every VFS operation.
//!
//! Carries the interrupt flag checked at operation entry points and a
//! deterministic clock override so tests never read ambient time. Cloning a
//! `Cx` shares the underlying state; a clone observes interrupts set through
//! any other clone.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Debug, Default)]
struct CxState {
    interrupted: AtomicBool,
    /// Non-zero value overrides the ambient clock (tests only).
    unix_millis_override: AtomicU64,
}

/// Shared operation context.
#[derive(Debug, Clone, Default)]
pub struct Cx {
    state: Arc<CxState>,
}

impl Cx {
    /// Create a fresh context with no interrupt pending.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Request that in-flight operations stop at their next checkpoint.
    pub fn interrupt(&self) {
        self.state.interrupted.store(true, Ordering::Release);
    }

    /// Whether an interrupt has been requested.
    #[must_use]
    pub fn is_interrupted(&self) -> bool {
        self.state.interrupted.load(Ordering::Acquire)
    }

    /// Clear a pending interrupt.
    pub fn clear_interrupt(&self) {
        self.state.interrupted.store(false, Ordering::Release);
    }

    /// Current time in milliseconds since the Unix epoch.
    ///
    /// Returns the test override when one is set.
    #[must_use]
    pub fn unix_millis(&self) -> u64 {
        let forced = self.state.unix_millis_override.load(Ordering::Acquire);
        if forced != 0 {
            return forced;
        }
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
            .unwrap_or(0)
    }

    /// Pin the clock for deterministic tests.
    pub fn set_unix_millis_for_testing(&self, millis: u64) {
        self.state
            .unix_millis_override
            .store(millis, Ordering::Release);
    }
}
