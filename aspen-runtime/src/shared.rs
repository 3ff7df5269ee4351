//! Shared Pointers
//!
//! [`Shared<T>`] is the owning handle: it holds one shared count and keeps
//! the object alive. No cloning semantics live here; this is the primitive
//! the cloning pointer families build on.
//!
//! [`Init<T>`] is the count-free handle a constructor sees for the object
//! it is building (see [`crate::object::create_with`]). It can mint real
//! handles to the half-built object; the under-construction size sentinel
//! keeps those from destroying it prematurely.

use std::marker::PhantomData;

use crate::object::{Clonable, SlotRef};

/// Owning pointer to a counted object.
///
/// Copying the handle increments the shared count; dropping it decrements,
/// which at zero runs the destruction cascade. Mutation of the pointee
/// flows through interior-mutable fields of `T` — the runtime trusts its
/// generated callers rather than policing aliasing at this level.
pub struct Shared<T: Clonable> {
    object: Option<SlotRef>,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Clonable> Shared<T> {
    /// The null handle.
    pub fn nil() -> Self {
        Self {
            object: None,
            _marker: PhantomData,
        }
    }

    /// Wrap a freshly initialized slot whose first count this handle
    /// owns.
    ///
    /// # Safety
    ///
    /// `slot` must hold a constructed `T` and a shared count of exactly
    /// one that no other handle owns.
    pub(crate) unsafe fn from_new(slot: SlotRef) -> Self {
        debug_assert_eq!(slot.header().num_shared(), 1);
        Self {
            object: Some(slot),
            _marker: PhantomData,
        }
    }

    /// Wrap a slot whose shared count has already been incremented on
    /// this handle's behalf.
    pub(crate) fn adopt(slot: SlotRef) -> Self {
        Self {
            object: Some(slot),
            _marker: PhantomData,
        }
    }

    /// Is the pointer not null?
    pub fn query(&self) -> bool {
        self.object.is_some()
    }

    /// Borrow the pointee.
    ///
    /// # Panics
    ///
    /// Panics on a null handle; dereferencing nil is caller error, not a
    /// recoverable condition.
    pub fn get(&self) -> &T {
        let slot = self.object.expect("null pointer dereference");
        debug_assert!(slot.header().num_shared() > 0);
        match slot.payload().as_any().downcast_ref::<T>() {
            Some(v) => v,
            None => panic!("pointer type confusion"),
        }
    }

    /// Release the handle, resetting it to nil.
    pub fn reset(&mut self) {
        if let Some(slot) = self.object.take() {
            slot.dec_shared();
        }
    }

    /// Current shared count, for diagnostics.
    pub fn num_shared(&self) -> u32 {
        self.object.map(|s| s.header().num_shared()).unwrap_or(0)
    }

    /// The underlying slot; panics on nil.
    pub(crate) fn slot(&self) -> SlotRef {
        self.object.expect("null pointer dereference")
    }

    /// The underlying slot, if any.
    pub(crate) fn slot_opt(&self) -> Option<SlotRef> {
        self.object
    }
}

impl<T: Clonable> Clone for Shared<T> {
    fn clone(&self) -> Self {
        if let Some(slot) = self.object {
            slot.inc_shared();
        }
        Self {
            object: self.object,
            _marker: PhantomData,
        }
    }
}

impl<T: Clonable> Drop for Shared<T> {
    fn drop(&mut self) {
        if let Some(slot) = self.object.take() {
            slot.dec_shared();
        }
    }
}

impl<T: Clonable> Default for Shared<T> {
    fn default() -> Self {
        Self::nil()
    }
}

impl<T: Clonable> std::ops::Deref for Shared<T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.get()
    }
}

impl<T: Clonable> PartialEq for Shared<T> {
    fn eq(&self, other: &Self) -> bool {
        self.object == other.object
    }
}

impl<T: Clonable> Eq for Shared<T> {}

impl<T: Clonable> std::fmt::Debug for Shared<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.object {
            Some(slot) => write!(f, "Shared({:#x})", slot.addr()),
            None => write!(f, "Shared(nil)"),
        }
    }
}

/// Handle to an object under construction.
///
/// Only visible inside [`crate::object::create_with`] closures. Holds no
/// count of its own; the handles it mints are real and safe to drop even
/// mid-construction.
pub struct Init<T: Clonable> {
    slot: SlotRef,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Clonable> Init<T> {
    /// # Safety
    ///
    /// `slot` must be a freshly reserved, under-construction slot that
    /// outlives this handle.
    pub(crate) unsafe fn new(slot: SlotRef) -> Self {
        debug_assert!(!slot.header().is_constructed());
        Self {
            slot,
            _marker: PhantomData,
        }
    }

    /// Mint a shared handle to the object under construction.
    ///
    /// The payload is not accessible until construction completes;
    /// handles minted here exist to be stored or dropped, not
    /// dereferenced inside the constructor.
    pub fn shared(&self) -> Shared<T> {
        self.slot.inc_shared();
        Shared::adopt(self.slot)
    }

    /// Mint a weak handle to the object under construction. The usual
    /// shape for back-references in cyclic structures.
    pub fn weak(&self) -> crate::weak::Weak<T> {
        self.slot.inc_weak();
        crate::weak::Weak::adopt(self.slot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::testutil::Leaf;
    use crate::object::create;

    #[test]
    fn test_nil_query() {
        let p: Shared<Leaf> = Shared::nil();
        assert!(!p.query());
        assert_eq!(p.num_shared(), 0);
    }

    #[test]
    #[should_panic(expected = "null pointer dereference")]
    fn test_nil_deref_panics() {
        let p: Shared<Leaf> = Shared::nil();
        let _ = p.get();
    }

    #[test]
    fn test_clone_counts() {
        let a = create(Leaf::new(1));
        assert_eq!(a.num_shared(), 1);
        let b = a.clone();
        assert_eq!(a.num_shared(), 2);
        assert_eq!(a, b);
        drop(b);
        assert_eq!(a.num_shared(), 1);
    }

    #[test]
    fn test_reset() {
        let mut a = create(Leaf::new(1));
        let b = a.clone();
        a.reset();
        assert!(!a.query());
        assert_eq!(b.num_shared(), 1);
    }

    #[test]
    fn test_deref() {
        let a = create(Leaf::new(41));
        a.set(a.get().get() + 1);
        assert_eq!(a.get().get(), 42);
    }
}
