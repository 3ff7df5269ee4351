//! Reference-Count Header
//!
//! Every clonable runtime object carries a [`Counted`] header with three
//! nested reference counts driving a staged release protocol:
//!
//! - **shared** — owning handles. Reaching zero runs the destructor (drops
//!   the payload) and releases the weak self-reference.
//! - **weak** — one self-reference plus observer handles and memo keyings.
//!   Reaching zero releases the memo self-reference.
//! - **memo** — one self-reference plus the number of memo tables keying
//!   this object. Reaching zero returns the cell to its owner thread's
//!   pool.
//!
//! The counts only ever release in that order, so `memo == 0` implies
//! `weak == 0` implies `shared == 0`.
//!
//! A `size` of zero marks an object still under construction: a shared
//! count that reaches zero while `size == 0` must *not* destroy the object,
//! which is what lets a constructor create and drop handles to the object
//! it is building (see [`crate::object::create_with`]).
//!
//! All operations are lock-free atomics. Underflow is a programming error
//! and asserts; none of this surface returns recoverable errors.

use std::sync::atomic::{fence, AtomicBool, AtomicU32, Ordering};

use crate::thread::{thread_id, ThreadId};

/// Reference-count header embedded in every heap cell.
pub struct Counted {
    /// Owning-handle count. The object is live while nonzero.
    shared: AtomicU32,

    /// One plus the number of weak observers. The plus one is a
    /// self-reference released when the shared count reaches zero.
    weak: AtomicU32,

    /// One plus the number of memo tables keying this object. The plus one
    /// is a self-reference released when the weak count reaches zero.
    memo: AtomicU32,

    /// Byte size of the cell allocation. Zero while the object is under
    /// construction; stamped once construction completes.
    size: AtomicU32,

    /// Thread whose pool reclaims the allocation.
    tid: ThreadId,

    /// Set once the object is shared with a forked context; writes must
    /// go through a private clone from then on.
    frozen: AtomicBool,
}

impl Counted {
    /// Fresh header for an object under construction on this thread.
    pub fn new() -> Self {
        Self {
            shared: AtomicU32::new(0),
            weak: AtomicU32::new(1),
            memo: AtomicU32::new(1),
            size: AtomicU32::new(0),
            tid: thread_id(),
            frozen: AtomicBool::new(false),
        }
    }

    /// Set the shared count to one for a brand-new object that no handle
    /// has seen yet. Not an atomic read-modify-write; the object is still
    /// private to the creating thread.
    pub fn init(&self) {
        debug_assert_eq!(self.shared.load(Ordering::Relaxed), 0);
        self.shared.store(1, Ordering::Relaxed);
    }

    /// Increment the shared count.
    #[inline]
    pub fn inc_shared(&self) {
        self.shared.fetch_add(1, Ordering::Relaxed);
    }

    /// Decrement the shared count, returning the new value. At zero the
    /// caller must run the destruction step if construction has completed.
    #[inline]
    pub fn dec_shared(&self) -> u32 {
        let old = self.shared.fetch_sub(1, Ordering::Release);
        assert!(old > 0, "shared count underflow");
        if old == 1 {
            // Synchronize with all prior releases before destruction.
            fence(Ordering::Acquire);
        }
        old - 1
    }

    /// Increment the shared count by two as one operation. Used by memo
    /// tables, which hold a double count per value to halve the atomic
    /// traffic of entry churn.
    #[inline]
    pub fn double_inc_shared(&self) {
        self.shared.fetch_add(2, Ordering::Relaxed);
    }

    /// Decrement the shared count by two as one operation, returning the
    /// new value.
    #[inline]
    pub fn double_dec_shared(&self) -> u32 {
        let old = self.shared.fetch_sub(2, Ordering::Release);
        assert!(old >= 2, "shared count underflow");
        if old == 2 {
            fence(Ordering::Acquire);
        }
        old - 2
    }

    /// Increment the weak count.
    #[inline]
    pub fn inc_weak(&self) {
        debug_assert!(self.weak.load(Ordering::Relaxed) > 0);
        self.weak.fetch_add(1, Ordering::Relaxed);
    }

    /// Decrement the weak count, returning the new value. At zero the
    /// caller releases the memo self-reference.
    #[inline]
    pub fn dec_weak(&self) -> u32 {
        let old = self.weak.fetch_sub(1, Ordering::Release);
        assert!(old > 0, "weak count underflow");
        if old == 1 {
            fence(Ordering::Acquire);
            debug_assert_eq!(self.shared.load(Ordering::Relaxed), 0);
        }
        old - 1
    }

    /// Increment the memo count. A memo keying can still trigger a lookup
    /// of this object, so it also counts as a weak observer.
    #[inline]
    pub fn inc_memo(&self) {
        self.weak.fetch_add(1, Ordering::Relaxed);
        self.memo.fetch_add(1, Ordering::Relaxed);
    }

    /// Decrement only the memo counter, returning the new value. Used for
    /// the self-reference release at weak-zero; keying releases pair this
    /// with [`Counted::dec_weak`].
    #[inline]
    pub fn dec_memo(&self) -> u32 {
        let old = self.memo.fetch_sub(1, Ordering::Release);
        assert!(old > 0, "memo count underflow");
        if old == 1 {
            fence(Ordering::Acquire);
            debug_assert_eq!(self.shared.load(Ordering::Relaxed), 0);
            debug_assert_eq!(self.weak.load(Ordering::Relaxed), 0);
        }
        old - 1
    }

    /// Attempt to acquire a shared count on a possibly-dead object.
    /// Fails once the count has reached zero; used to upgrade weak
    /// handles.
    pub fn try_inc_shared(&self) -> bool {
        let mut current = self.shared.load(Ordering::Acquire);
        loop {
            if current == 0 {
                return false;
            }
            match self.shared.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    /// Current shared count.
    pub fn num_shared(&self) -> u32 {
        self.shared.load(Ordering::Relaxed)
    }

    /// Current weak count.
    pub fn num_weak(&self) -> u32 {
        self.weak.load(Ordering::Relaxed)
    }

    /// Current memo count.
    pub fn num_memo(&self) -> u32 {
        self.memo.load(Ordering::Relaxed)
    }

    /// Is this object reachable?
    ///
    /// An object is reachable if it has a shared count of one or more, or
    /// a weak count greater than the memo count. When the weak count
    /// equals the memo count, the object is held only by memo keyings
    /// that nothing live can ever look up again, and the entry can be
    /// pruned.
    pub fn is_reachable(&self) -> bool {
        self.num_shared() > 0 || self.num_weak() > self.num_memo()
    }

    /// Byte size of the allocation; zero while under construction.
    pub fn size(&self) -> u32 {
        self.size.load(Ordering::Acquire)
    }

    /// Stamp the allocation size, marking construction complete.
    pub fn set_size(&self, size: u32) {
        debug_assert!(size > 0);
        self.size.store(size, Ordering::Release);
    }

    /// Has construction completed?
    pub fn is_constructed(&self) -> bool {
        self.size() > 0
    }

    /// Thread whose pool reclaims this allocation.
    pub fn owner(&self) -> ThreadId {
        self.tid
    }

    /// Mark frozen; returns whether this call did the marking (false if
    /// the object was already frozen). Doubles as the visited check for
    /// freeze traversals.
    pub fn freeze(&self) -> bool {
        !self.frozen.swap(true, Ordering::AcqRel)
    }

    /// Is this object frozen?
    #[inline]
    pub fn is_frozen(&self) -> bool {
        self.frozen.load(Ordering::Acquire)
    }

    /// Clear the frozen mark.
    pub fn thaw(&self) {
        self.frozen.store(false, Ordering::Release);
    }
}

impl Default for Counted {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Counted {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Counted")
            .field("shared", &self.num_shared())
            .field("weak", &self.num_weak())
            .field("memo", &self.num_memo())
            .field("size", &self.size())
            .field("tid", &self.tid)
            .field("frozen", &self.is_frozen())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fresh_header() {
        let h = Counted::new();
        assert_eq!(h.num_shared(), 0);
        assert_eq!(h.num_weak(), 1);
        assert_eq!(h.num_memo(), 1);
        assert!(!h.is_constructed());
        assert!(!h.is_frozen());
        assert_eq!(h.owner(), thread_id());
    }

    #[test]
    fn test_init_and_shared() {
        let h = Counted::new();
        h.init();
        assert_eq!(h.num_shared(), 1);
        h.inc_shared();
        assert_eq!(h.num_shared(), 2);
        assert_eq!(h.dec_shared(), 1);
        assert_eq!(h.dec_shared(), 0);
    }

    #[test]
    fn test_double_shared() {
        let h = Counted::new();
        h.double_inc_shared();
        assert_eq!(h.num_shared(), 2);
        assert_eq!(h.double_dec_shared(), 0);
    }

    #[test]
    fn test_memo_keying_counts_as_weak() {
        let h = Counted::new();
        h.inc_memo();
        assert_eq!(h.num_memo(), 2);
        assert_eq!(h.num_weak(), 2);
    }

    #[test]
    fn test_reachability() {
        let h = Counted::new();
        h.init();
        // Alive: reachable regardless of weak/memo balance.
        assert!(h.is_reachable());
        h.inc_memo();
        assert!(h.is_reachable());
        // Dead with weak == memo: only memo keyings remain.
        h.dec_shared();
        assert!(!h.is_reachable());
        // A live weak observer tips the balance.
        h.inc_weak();
        assert!(h.is_reachable());
    }

    #[test]
    fn test_freeze_once() {
        let h = Counted::new();
        assert!(h.freeze());
        assert!(!h.freeze());
        assert!(h.is_frozen());
        h.thaw();
        assert!(!h.is_frozen());
        assert!(h.freeze());
    }

    #[test]
    fn test_size_stamp() {
        let h = Counted::new();
        assert!(!h.is_constructed());
        h.set_size(96);
        assert!(h.is_constructed());
        assert_eq!(h.size(), 96);
    }

    #[test]
    #[should_panic(expected = "shared count underflow")]
    fn test_shared_underflow_asserts() {
        let h = Counted::new();
        h.dec_shared();
    }
}
