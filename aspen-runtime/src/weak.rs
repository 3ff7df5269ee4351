//! Weak Pointers
//!
//! [`Weak<T>`] observes a counted object without keeping it alive. It owns
//! one weak count, which defers *deallocation* but never destruction: the
//! payload dies when the last shared handle drops, while the slot lingers
//! until the last weak observer lets go.
//!
//! Cyclic graphs must route one direction of every cycle through weak
//! handles — typically the child-to-parent back-reference — since nothing
//! here collects cycles of shared counts.

use std::marker::PhantomData;

use crate::object::{Clonable, CloneSession, SlotRef};
use crate::shared::Shared;

/// Non-owning observer pointer.
pub struct Weak<T: Clonable> {
    object: Option<SlotRef>,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Clonable> Weak<T> {
    /// The null handle.
    pub fn nil() -> Self {
        Self {
            object: None,
            _marker: PhantomData,
        }
    }

    /// Wrap a slot whose weak count has already been incremented on this
    /// handle's behalf.
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

    /// Is the target still live (not yet destroyed)?
    pub fn is_alive(&self) -> bool {
        self.object
            .map(|s| s.header().num_shared() > 0)
            .unwrap_or(false)
    }

    /// Borrow the pointee.
    ///
    /// The target must still be live; observing a destroyed object
    /// through a weak handle is a use-after-free guarded by assertion,
    /// not a recoverable error. Callers that cannot prove liveness use
    /// [`Weak::upgrade`].
    pub fn get(&self) -> &T {
        let slot = self.object.expect("null pointer dereference");
        debug_assert!(
            slot.header().num_shared() > 0,
            "weak dereference of destroyed object"
        );
        match slot.payload().as_any().downcast_ref::<T>() {
            Some(v) => v,
            None => panic!("pointer type confusion"),
        }
    }

    /// Try to promote to an owning handle; fails once the target has been
    /// destroyed.
    pub fn upgrade(&self) -> Option<Shared<T>> {
        let slot = self.object?;
        if slot.header().try_inc_shared() {
            Some(Shared::adopt(slot))
        } else {
            None
        }
    }

    /// Re-establish this back-reference for a clone being made in
    /// `session`.
    ///
    /// Maps through the session's memo without forcing a copy: when the
    /// target has already been reserved in the destination (parents are
    /// published before their fields are cloned), the new weak handle
    /// lands on the copy; otherwise it stays on the original.
    pub fn rebind(&self, session: &mut CloneSession<'_>) -> Weak<T> {
        match self.object {
            None => Weak::nil(),
            Some(raw) => {
                let mapped = session.peek(raw);
                mapped.inc_weak();
                Weak::adopt(mapped)
            }
        }
    }

    /// Current weak count of the target, for diagnostics.
    pub fn num_weak(&self) -> u32 {
        self.object.map(|s| s.header().num_weak()).unwrap_or(0)
    }
}

impl<T: Clonable> Clone for Weak<T> {
    fn clone(&self) -> Self {
        if let Some(slot) = self.object {
            slot.inc_weak();
        }
        Self {
            object: self.object,
            _marker: PhantomData,
        }
    }
}

impl<T: Clonable> Drop for Weak<T> {
    fn drop(&mut self) {
        if let Some(slot) = self.object.take() {
            slot.dec_weak();
        }
    }
}

impl<T: Clonable> Default for Weak<T> {
    fn default() -> Self {
        Self::nil()
    }
}

impl<T: Clonable> From<&Shared<T>> for Weak<T> {
    fn from(shared: &Shared<T>) -> Self {
        match shared.slot_opt() {
            None => Weak::nil(),
            Some(slot) => {
                slot.inc_weak();
                Weak::adopt(slot)
            }
        }
    }
}

impl<T: Clonable> PartialEq for Weak<T> {
    fn eq(&self, other: &Self) -> bool {
        self.object == other.object
    }
}

impl<T: Clonable> Eq for Weak<T> {}

impl<T: Clonable> std::fmt::Debug for Weak<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.object {
            Some(slot) => write!(f, "Weak({:#x})", slot.addr()),
            None => write!(f, "Weak(nil)"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::testutil::Leaf;
    use crate::object::{create, create_with};
    use crate::shared::Init;

    #[test]
    fn test_weak_counts() {
        let a = create(Leaf::new(1));
        assert_eq!(a.slot().header().num_weak(), 1);
        let w = Weak::from(&a);
        assert_eq!(w.num_weak(), 2);
        drop(w);
        assert_eq!(a.slot().header().num_weak(), 1);
    }

    #[test]
    fn test_upgrade_while_alive() {
        let a = create(Leaf::new(2));
        let w = Weak::from(&a);
        let b = w.upgrade().unwrap();
        assert_eq!(a.num_shared(), 2);
        assert_eq!(b.get().get(), 2);
    }

    #[test]
    fn test_upgrade_after_destruction() {
        let a = create(Leaf::new(3));
        let w = Weak::from(&a);
        drop(a);
        assert!(!w.is_alive());
        assert!(w.upgrade().is_none());
    }

    #[test]
    fn test_weak_does_not_prevent_destruction() {
        let a = create(Leaf::new(4));
        let slot = a.slot();
        let w = Weak::from(&a);
        drop(a);
        // Destroyed but not deallocated: the slot survives on the weak
        // count with its payload gone.
        assert!(!slot.is_live());
        assert_eq!(slot.header().num_weak(), 1);
        drop(w);
    }

    #[test]
    fn test_cyclic_back_reference() {
        // Parent-to-child owns, child-to-parent observes; dropping the
        // parent tears the cycle down without a collector.
        struct Parent {
            child: Shared<Child>,
        }
        struct Child {
            parent: Weak<Parent>,
        }
        impl Clonable for Parent {
            fn as_any(&self) -> &dyn std::any::Any {
                self
            }
            fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
                self
            }
            fn clone_in(&self, _s: &mut CloneSession<'_>) -> Box<dyn Clonable> {
                unimplemented!("not cloned in this test")
            }
        }
        impl Clonable for Child {
            fn as_any(&self) -> &dyn std::any::Any {
                self
            }
            fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
                self
            }
            fn clone_in(&self, _s: &mut CloneSession<'_>) -> Box<dyn Clonable> {
                unimplemented!("not cloned in this test")
            }
        }

        let parent = create_with(|init: &Init<Parent>| {
            let child = create(Child {
                parent: init.weak(),
            });
            Parent { child }
        });

        assert!(parent.get().child.get().parent.is_alive());
        let child = parent.get().child.clone();
        drop(parent);
        // The parent died even though the child still observes it.
        assert!(!child.get().parent.is_alive());
    }
}
