//! Exclusive Spin Lock
//!
//! A minimal test-and-set spin lock for the per-context memo critical
//! sections. Those sections are a handful of loads and stores, so a full
//! parking lock is overkill; the busy-wait here is bounded by the shortest
//! path through [`crate::context::Context::get`].

use std::sync::atomic::{AtomicBool, Ordering};

/// Lock with exclusive use semantics.
///
/// Cloning a structure that embeds one produces a fresh, unlocked lock.
pub struct ExclusiveLock {
    lock: AtomicBool,
}

impl ExclusiveLock {
    /// Create an unlocked lock.
    pub const fn new() -> Self {
        Self {
            lock: AtomicBool::new(false),
        }
    }

    /// Obtain exclusive use, spinning until available.
    pub fn set(&self) {
        // Spin, setting the lock true until its old value comes back false.
        while self.lock.swap(true, Ordering::Acquire) {
            std::hint::spin_loop();
        }
    }

    /// Release exclusive use.
    pub fn unset(&self) {
        self.lock.store(false, Ordering::Release);
    }

    /// Obtain exclusive use for the lifetime of the returned guard.
    pub fn guard(&self) -> ExclusiveGuard<'_> {
        self.set();
        ExclusiveGuard { lock: self }
    }
}

impl Default for ExclusiveLock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for ExclusiveLock {
    fn clone(&self) -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ExclusiveLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExclusiveLock")
            .field("locked", &self.lock.load(Ordering::Relaxed))
            .finish()
    }
}

/// RAII guard for [`ExclusiveLock`].
pub struct ExclusiveGuard<'a> {
    lock: &'a ExclusiveLock,
}

impl Drop for ExclusiveGuard<'_> {
    fn drop(&mut self) {
        self.lock.unset();
    }
}
