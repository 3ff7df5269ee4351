//! Eager Cloning Pointers
//!
//! [`Eager<T>`] is the immediate-cloning counterpart of
//! [`crate::lazy::Lazy`]: `deep_clone` walks the whole reachable graph
//! right away, through a throwaway context whose memo preserves shared
//! structure and cycles, and returns a pointer to the finished copy. No
//! freeze machinery, no per-access checks — the clone cost is paid
//! upfront.
//!
//! Systems that clone rarely but access constantly select this family
//! through [`crate::config::CloneMode::Eager`].

use std::marker::PhantomData;

use crate::context::Context;
use crate::object::{Clonable, CloneSession, SlotRef};
use crate::shared::Shared;

/// Immediate-cloning pointer.
pub struct Eager<T: Clonable> {
    object: Option<SlotRef>,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Clonable> Eager<T> {
    /// The null pointer.
    pub fn nil() -> Self {
        Self {
            object: None,
            _marker: PhantomData,
        }
    }

    /// Point at `shared`'s object.
    pub fn new(shared: &Shared<T>) -> Self {
        match shared.slot_opt() {
            None => Self::nil(),
            Some(slot) => {
                slot.inc_shared();
                Self {
                    object: Some(slot),
                    _marker: PhantomData,
                }
            }
        }
    }

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

    /// Borrow the pointee. No cloning semantics on access.
    pub fn get(&self) -> &T {
        let slot = self.object.expect("null pointer dereference");
        debug_assert!(slot.header().num_shared() > 0);
        match slot.payload().as_any().downcast_ref::<T>() {
            Some(v) => v,
            None => panic!("pointer type confusion"),
        }
    }

    /// Deep clone: copy the entire reachable graph now.
    ///
    /// The copy runs through a fresh context so that objects reached
    /// more than once are copied once, and cycles terminate. The context
    /// is discarded when the copy completes; only the new objects
    /// survive.
    pub fn deep_clone(&self) -> Eager<T> {
        match self.object {
            None => Self::nil(),
            Some(raw) => {
                let context = Context::new_root();
                let copied = context.copy(raw);
                copied.inc_shared();
                // `context` drops here, releasing the memo's counts; the
                // copies live on through the handles made during cloning.
                Eager::adopt(copied)
            }
        }
    }

    /// Re-establish this field for a clone being made in `session`,
    /// copying the referent into the destination now.
    pub fn rebind(&self, session: &mut CloneSession<'_>) -> Eager<T> {
        match self.object {
            None => Eager::nil(),
            Some(raw) => {
                let copied = session.resolve(raw);
                copied.inc_shared();
                Eager::adopt(copied)
            }
        }
    }

    /// Checked cast to a more specific payload type; nil when the
    /// payload is not a `U`.
    pub fn downcast<U: Clonable>(&self) -> Eager<U> {
        match self.object {
            Some(raw) if raw.is_live() && raw.payload().as_any().is::<U>() => {
                raw.inc_shared();
                Eager::adopt(raw)
            }
            _ => Eager::nil(),
        }
    }

    /// Current shared count of the referent, for diagnostics.
    pub fn num_shared(&self) -> u32 {
        self.object.map(|s| s.header().num_shared()).unwrap_or(0)
    }

    pub(crate) fn slot_ref(&self) -> Option<SlotRef> {
        self.object
    }
}

impl<T: Clonable> Clone for Eager<T> {
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

impl<T: Clonable> Drop for Eager<T> {
    fn drop(&mut self) {
        if let Some(slot) = self.object.take() {
            slot.dec_shared();
        }
    }
}

impl<T: Clonable> Default for Eager<T> {
    fn default() -> Self {
        Self::nil()
    }
}

impl<T: Clonable> PartialEq for Eager<T> {
    fn eq(&self, other: &Self) -> bool {
        self.object == other.object
    }
}

impl<T: Clonable> Eq for Eager<T> {}

impl<T: Clonable> std::fmt::Debug for Eager<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.object {
            Some(slot) => write!(f, "Eager({:#x})", slot.addr()),
            None => write!(f, "Eager(nil)"),
        }
    }
}
