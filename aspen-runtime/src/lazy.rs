//! Lazy Cloning Pointers
//!
//! [`Lazy<T>`] is the copy-on-write pointer: a counted object reference
//! bound to the context in which it resolves. While the referent is
//! unfrozen, access is a plain dereference. Once the referent has been
//! frozen — shared with a fork — the first mutating access resolves it
//! through the context, forcing a private clone that the pointer then
//! caches. Unmodified subgraphs are never copied.
//!
//! `deep_clone` is what makes forked state look independent: it freezes
//! the reachable graph and returns a pointer bound to a forked child
//! context. Both sides keep reading the shared frozen objects until one of
//! them writes, at which point exactly the touched objects diverge.

use std::marker::PhantomData;
use std::sync::Arc;

use crate::config::clone_config;
use crate::context::Context;
use crate::freeze;
use crate::object::{Clonable, CloneSession, SlotRef};
use crate::shared::Shared;

/// Copy-on-write pointer bound to a clone context.
pub struct Lazy<T: Clonable> {
    object: Option<SlotRef>,
    /// Context to which the object is mapped.
    to: Option<Arc<Context>>,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Clonable> Lazy<T> {
    /// The null pointer.
    pub fn nil() -> Self {
        Self {
            object: None,
            to: None,
            _marker: PhantomData,
        }
    }

    /// Point at `shared`'s object, resolving in `context`.
    pub fn new(shared: &Shared<T>, context: &Arc<Context>) -> Self {
        match shared.slot_opt() {
            None => Self::nil(),
            Some(slot) => {
                debug_assert!(
                    slot.header().is_constructed(),
                    "lazy pointer to an object still under construction"
                );
                slot.inc_shared();
                Self {
                    object: Some(slot),
                    to: Some(Arc::clone(context)),
                    _marker: PhantomData,
                }
            }
        }
    }

    /// Point at `shared`'s object in the process root context.
    pub fn from_shared(shared: &Shared<T>) -> Self {
        Self::new(shared, Context::root())
    }

    /// Is the pointer not null?
    pub fn query(&self) -> bool {
        self.object.is_some()
    }

    /// The context this pointer resolves in.
    pub fn context(&self) -> Option<&Arc<Context>> {
        self.to.as_ref()
    }

    /// Current raw referent, for traversals. No resolution.
    pub(crate) fn slot_ref(&self) -> Option<SlotRef> {
        self.object
    }

    /// Resolve for writing: map through the context when frozen, forcing
    /// a private clone, and cache the result.
    fn resolve_raw(&mut self) -> SlotRef {
        let raw = self.object.expect("null pointer dereference");
        if !raw.is_frozen() {
            return raw;
        }
        let to = self.to.as_ref().expect("lazy pointer without context");
        let resolved = to.get(raw);
        if resolved != raw {
            resolved.inc_shared();
            raw.dec_shared();
            self.object = Some(resolved);
        }
        resolved
    }

    /// Resolve for reading: map through the context when frozen without
    /// forcing a clone, and cache the result.
    fn pull_raw(&mut self) -> SlotRef {
        let raw = self.object.expect("null pointer dereference");
        if !raw.is_frozen() {
            return raw;
        }
        let to = self.to.as_ref().expect("lazy pointer without context");
        let pulled = to.pull(raw);
        if pulled != raw {
            pulled.inc_shared();
            raw.dec_shared();
            self.object = Some(pulled);
        }
        pulled
    }

    /// Resolve and return the slot, for finish traversals.
    pub(crate) fn resolve_slot(&mut self) -> Option<SlotRef> {
        self.object?;
        Some(self.resolve_raw())
    }

    /// Borrow the pointee for mutation, cloning it into this pointer's
    /// context first if it is frozen.
    pub fn get(&mut self) -> &T {
        let slot = self.resolve_raw();
        downcast::<T>(slot)
    }

    /// Mutably borrow the pointee, cloning it into this pointer's context
    /// first if it is frozen.
    ///
    /// The resolved object is private to this context, so the borrow is
    /// exclusive under the generated-caller contract (one mutator per
    /// context branch).
    pub fn get_mut(&mut self) -> &mut T {
        let slot = self.resolve_raw();
        match slot.payload_mut().as_any_mut().downcast_mut::<T>() {
            Some(v) => v,
            None => panic!("pointer type confusion"),
        }
    }

    /// Borrow the pointee for reading without forcing a clone.
    ///
    /// May return the shared frozen source. The borrow is stale in the
    /// narrow sense that a later `get` on the same logical value — here
    /// or in another pointer — can introduce a private clone this borrow
    /// knows nothing about; see the staleness test below for the exact
    /// window.
    pub fn pull(&mut self) -> &T {
        let slot = self.pull_raw();
        downcast::<T>(slot)
    }

    /// Borrow for an ordinary read: [`Lazy::pull`] when the read-only
    /// optimization is configured, [`Lazy::get`] otherwise.
    pub fn read_only(&mut self) -> &T {
        if clone_config().read_only_optimization {
            self.pull()
        } else {
            self.get()
        }
    }

    /// Deep clone: freeze the reachable graph and return a pointer bound
    /// to a forked child context.
    ///
    /// Cost is the fork's memo copy plus the freeze marks — no object is
    /// copied here. Copies happen later, one object at a time, on first
    /// write in whichever branch writes.
    pub fn deep_clone(&self) -> Lazy<T> {
        let raw = self.object.expect("clone of a null pointer");
        let to = self.to.as_ref().expect("lazy pointer without context");

        // Clone the current image, not a stale pre-fork one.
        let pulled = to.pull(raw);
        freeze::freeze_graph(pulled, to);
        let child = to.fork();
        pulled.inc_shared();
        Lazy {
            object: Some(pulled),
            to: Some(child),
            _marker: PhantomData,
        }
    }

    /// Force resolution of pending cross-context references reachable
    /// from this pointer. Serialized by the global finish lock.
    pub fn finish(&mut self) {
        if self.object.is_some() {
            freeze::finish_ptr(self);
        }
    }

    /// Re-establish this field for a clone being made in `session`.
    ///
    /// Lazy sessions keep the referent and rebind the context — that is
    /// the whole point of lazy cloning. Eager sessions resolve through
    /// the session immediately.
    pub fn rebind(&self, session: &mut CloneSession<'_>) -> Lazy<T> {
        match self.object {
            None => Lazy::nil(),
            Some(raw) => {
                let target = if session.is_eager() {
                    session.resolve(raw)
                } else {
                    raw
                };
                target.inc_shared();
                Lazy {
                    object: Some(target),
                    to: Some(Arc::clone(session.context())),
                    _marker: PhantomData,
                }
            }
        }
    }

    /// Checked cast to a more specific payload type. Preserves the
    /// context binding; yields nil when the payload is not a `U`.
    pub fn downcast<U: Clonable>(&self) -> Lazy<U> {
        match self.object {
            Some(raw) if raw.is_live() && raw.payload().as_any().is::<U>() => {
                raw.inc_shared();
                Lazy {
                    object: Some(raw),
                    to: self.to.clone(),
                    _marker: PhantomData,
                }
            }
            _ => Lazy::nil(),
        }
    }

    /// Current shared count of the referent, for diagnostics.
    pub fn num_shared(&self) -> u32 {
        self.object.map(|s| s.header().num_shared()).unwrap_or(0)
    }
}

fn downcast<'a, T: Clonable>(slot: SlotRef) -> &'a T {
    match slot.payload().as_any().downcast_ref::<T>() {
        Some(v) => v,
        None => panic!("pointer type confusion"),
    }
}

impl<T: Clonable> Clone for Lazy<T> {
    fn clone(&self) -> Self {
        if let Some(slot) = self.object {
            slot.inc_shared();
        }
        Self {
            object: self.object,
            to: self.to.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T: Clonable> Drop for Lazy<T> {
    fn drop(&mut self) {
        if let Some(slot) = self.object.take() {
            slot.dec_shared();
        }
    }
}

impl<T: Clonable> Default for Lazy<T> {
    fn default() -> Self {
        Self::nil()
    }
}

impl<T: Clonable> std::fmt::Debug for Lazy<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.object {
            Some(slot) => write!(f, "Lazy({:#x})", slot.addr()),
            None => write!(f, "Lazy(nil)"),
        }
    }
}
