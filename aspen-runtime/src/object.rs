//! Heap Slots and Clonable Objects
//!
//! A runtime object lives in a [`Slot`]: a fixed-size heap cell holding the
//! [`Counted`] header next to the boxed payload. Pointer wrappers traffic in
//! [`SlotRef`]s, thin references to slots; the wrapper types own the counts,
//! the `SlotRef` itself is just an address.
//!
//! Slots go through the staged release protocol:
//!
//! 1. shared count reaches zero (with construction complete) — the payload
//!    box is dropped, running field destructors and cascading releases;
//! 2. weak count reaches zero — the memo self-reference is released;
//! 3. memo count reaches zero — the empty slot returns to the owner
//!    thread's pool.
//!
//! Cloning an object is two-phase: the destination slot is reserved and its
//! mapping published in the memo *before* the payload is produced, so that
//! cyclic field references resolve to the reservation instead of recursing.

use std::any::Any;
use std::cell::UnsafeCell;
use std::mem::size_of;
use std::ptr::NonNull;
use std::sync::Arc;

use crate::alloc;
use crate::context::Context;
use crate::counted::Counted;
use crate::freeze::{FinishWalk, FreezeWalk};
use crate::memo::Memo;
use crate::shared::{Init, Shared};

/// A clonable runtime object.
///
/// Implemented by every type the managed program can place on the clonable
/// heap. `clone_in` deep-copies the *immediate* fields only: value fields
/// are copied, pointer fields are re-established through the
/// [`CloneSession`] so that the clone's references resolve in the
/// destination context.
pub trait Clonable: Any + Send + Sync {
    /// Upcast for checked downcasting.
    fn as_any(&self) -> &dyn Any;

    /// Mutable upcast for checked downcasting.
    fn as_any_mut(&mut self) -> &mut dyn Any;

    /// Copy-construct this object for the session's destination context.
    fn clone_in(&self, session: &mut CloneSession<'_>) -> Box<dyn Clonable>;

    /// Push pointer fields onto a freeze traversal. Leaf types keep the
    /// default no-op.
    fn freeze_fields(&self, walk: &mut FreezeWalk) {
        let _ = walk;
    }

    /// Resolve pointer fields during a finish traversal. Leaf types keep
    /// the default no-op.
    fn finish_fields(&mut self, walk: &mut FinishWalk) {
        let _ = walk;
    }
}

/// Heap cell: header plus payload.
pub(crate) struct Slot {
    header: Counted,
    payload: UnsafeCell<Option<Box<dyn Clonable>>>,
}

/// Thin reference to a slot. Carries no count; the wrapper types do.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct SlotRef(NonNull<Slot>);

// Safety: all slot state is either atomic (header) or guarded by the
// count/lock protocol (payload); SlotRef itself is just an address.
unsafe impl Send for SlotRef {}
unsafe impl Sync for SlotRef {}

impl SlotRef {
    /// Reserve a fresh, under-construction slot (size zero, no payload).
    pub(crate) fn reserve() -> SlotRef {
        let size = size_of::<Slot>();
        let ptr = alloc::allocate(size).cast::<Slot>();
        unsafe {
            ptr.as_ptr().write(Slot {
                header: Counted::new(),
                payload: UnsafeCell::new(None),
            });
        }
        SlotRef(ptr)
    }

    /// The slot's count header.
    #[inline]
    pub(crate) fn header(&self) -> &Counted {
        unsafe { &self.0.as_ref().header }
    }

    /// Address for hashing and identity.
    #[inline]
    pub(crate) fn addr(self) -> usize {
        self.0.as_ptr() as usize
    }

    /// Install the payload and stamp the size, completing construction.
    pub(crate) fn fill(self, payload: Box<dyn Clonable>) {
        unsafe {
            let slot = self.0.as_ref();
            debug_assert!((*slot.payload.get()).is_none());
            *slot.payload.get() = Some(payload);
        }
        self.header().set_size(size_of::<Slot>() as u32);
    }

    /// Borrow the payload.
    ///
    /// The returned borrow is unbound from `self` (a `SlotRef` is `Copy`);
    /// callers must hold a count that keeps the object alive for the
    /// borrow, which every pointer wrapper does.
    #[inline]
    pub(crate) fn payload<'a>(self) -> &'a dyn Clonable {
        unsafe {
            match &*self.0.as_ref().payload.get() {
                Some(b) => &**b,
                None => panic!("access to a destroyed or unconstructed object"),
            }
        }
    }

    /// Mutably borrow the payload. Caller must guarantee exclusivity
    /// (private clone, or a traversal holding the relevant global lock).
    #[inline]
    #[allow(clippy::mut_from_ref)]
    pub(crate) fn payload_mut<'a>(self) -> &'a mut dyn Clonable {
        unsafe {
            match &mut *self.0.as_ref().payload.get() {
                Some(b) => &mut **b,
                None => panic!("access to a destroyed or unconstructed object"),
            }
        }
    }

    /// Is the payload still present?
    pub(crate) fn is_live(self) -> bool {
        unsafe { (*self.0.as_ref().payload.get()).is_some() }
    }

    // --- count protocol -----------------------------------------------

    pub(crate) fn init(self) {
        self.header().init();
    }

    #[inline]
    pub(crate) fn inc_shared(self) {
        self.header().inc_shared();
    }

    /// Release one shared count, destroying at zero (once constructed).
    pub(crate) fn dec_shared(self) {
        if self.header().dec_shared() == 0 && self.header().is_constructed() {
            // size == 0 means still under construction; never destroy then.
            self.destroy();
            self.dec_weak(); // release weak self-reference
        }
    }

    #[inline]
    pub(crate) fn double_inc_shared(self) {
        self.header().double_inc_shared();
    }

    /// Release a memo table's double shared count on a value.
    pub(crate) fn double_dec_shared(self) {
        if self.header().double_dec_shared() == 0 && self.header().is_constructed() {
            self.destroy();
            self.dec_weak();
        }
    }

    #[inline]
    pub(crate) fn inc_weak(self) {
        self.header().inc_weak();
    }

    /// Release one weak count, cascading to the memo self-reference at
    /// zero.
    pub(crate) fn dec_weak(self) {
        if self.header().dec_weak() == 0 {
            // Release the memo self-reference.
            if self.header().dec_memo() == 0 {
                self.deallocate();
            }
        }
    }

    /// Acquire a memo keying (one memo count, one weak count).
    #[inline]
    pub(crate) fn inc_memo(self) {
        self.header().inc_memo();
    }

    /// Release a memo keying.
    pub(crate) fn dec_memo(self) {
        // The keying's weak count is still held, so the memo
        // self-reference has not been released and this cannot reach zero.
        let remaining = self.header().dec_memo();
        debug_assert!(remaining > 0);
        self.dec_weak();
    }

    /// Drop the payload, running the destructor cascade.
    fn destroy(self) {
        let payload = unsafe { (*self.0.as_ref().payload.get()).take() };
        debug_assert!(payload.is_some(), "double destruction");
        drop(payload);
    }

    /// Return the empty slot to its owner thread's pool.
    fn deallocate(self) {
        let header = self.header();
        debug_assert_eq!(header.num_shared(), 0);
        debug_assert_eq!(header.num_weak(), 0);
        debug_assert_eq!(header.num_memo(), 0);
        debug_assert!(!self.is_live());
        let size = header.size().max(size_of::<Slot>() as u32) as usize;
        let owner = header.owner();
        unsafe { alloc::deallocate(self.0.cast::<u8>(), size, owner) };
    }

    // --- freeze state --------------------------------------------------

    #[inline]
    pub(crate) fn is_frozen(self) -> bool {
        self.header().is_frozen()
    }

    pub(crate) fn freeze(self) -> bool {
        self.header().freeze()
    }
}

impl std::fmt::Debug for SlotRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SlotRef({:#x})", self.addr())
    }
}

/// Create an object on the clonable heap.
///
/// The value is moved into a fresh slot and the returned handle owns the
/// first shared count.
pub fn create<T: Clonable>(value: T) -> Shared<T> {
    let slot = SlotRef::reserve();
    slot.fill(Box::new(value));
    slot.init();
    unsafe { Shared::from_new(slot) }
}

/// Create an object whose constructor needs a handle to the object under
/// construction.
///
/// The closure receives an [`Init`] handle for the slot being built and may
/// mint shared, weak or lazy pointers from it. While the closure runs the
/// slot's size is zero, so a shared count that drops to zero does not
/// destroy the half-built object; destruction can only happen after the
/// closure returns and construction is stamped complete.
pub fn create_with<T, F>(f: F) -> Shared<T>
where
    T: Clonable,
    F: FnOnce(&Init<T>) -> T,
{
    let slot = SlotRef::reserve();
    let init = unsafe { Init::new(slot) };
    let value = f(&init);
    slot.fill(Box::new(value));
    slot.init();
    unsafe { Shared::from_new(slot) }
}

/// An in-progress clone bound to a destination context.
///
/// Threaded explicitly through every [`Clonable::clone_in`] call; there is
/// no ambient "current context" state. Holds the destination context and
/// its locked memo for the duration of the top-level clone.
pub struct CloneSession<'a> {
    context: Arc<Context>,
    memo: &'a mut Memo,
    /// Copy unconditionally (eager deep clone) rather than only when the
    /// source is frozen.
    force: bool,
}

impl<'a> CloneSession<'a> {
    pub(crate) fn new(context: Arc<Context>, memo: &'a mut Memo, force: bool) -> Self {
        Self {
            context,
            memo,
            force,
        }
    }

    /// The destination context of this clone.
    pub fn context(&self) -> &Arc<Context> {
        &self.context
    }

    /// Is this an eager (copy-everything-now) session?
    pub fn is_eager(&self) -> bool {
        self.force
    }

    /// Map `o` to its image in the destination context, copying if needed.
    ///
    /// The memo chase finds the most recent image of `o`; a copy is made
    /// when that image is frozen (lazy mode) or has simply not been copied
    /// yet (eager mode). The mapping is published before the payload is
    /// produced, which keeps cyclic graphs from recursing and makes the
    /// first insertion the canonical clone.
    pub(crate) fn resolve(&mut self, o: SlotRef) -> SlotRef {
        let p = self.memo.chase(o);
        let needs_copy = if self.force {
            // Eager: anything not yet mapped gets copied now.
            p == o
        } else {
            p.is_frozen()
        };
        if !needs_copy {
            return p;
        }

        let dst = SlotRef::reserve();
        self.memo.put(p, dst);
        let payload = p.payload().clone_in(self);
        dst.fill(payload);
        dst
    }

    /// Map `o` through the memo without ever copying.
    pub(crate) fn peek(&mut self, o: SlotRef) -> SlotRef {
        self.memo.chase(o)
    }
}


#[cfg(test)]
mod tests {
    use super::testutil::Leaf;
    use super::*;
    use crate::weak::Weak;

    #[test]
    fn test_create_counts() {
        let a = create(Leaf::new(7));
        let slot = a.slot();
        assert_eq!(slot.header().num_shared(), 1);
        assert_eq!(slot.header().num_weak(), 1);
        assert_eq!(slot.header().num_memo(), 1);
        assert!(slot.header().is_constructed());
        assert_eq!(a.get().get(), 7);
    }

    #[test]
    fn test_shared_drop_destroys() {
        let a = create(Leaf::new(1));
        let slot = a.slot();
        drop(a);
        // No handle remains; reading the payload through a fresh count
        // would be a bug. The slot memory itself is back in the pool, so
        // only the protocol's observable effects can be asserted here:
        // this test exercises the full drop ladder without crashing.
        let _ = slot; // address may already be recycled
    }

    #[test]
    fn test_weak_then_shared_drop() {
        let a = create(Leaf::new(3));
        let w = Weak::from(&a);
        let slot = a.slot();
        assert_eq!(slot.header().num_weak(), 2);
        drop(a);
        // Destructor ran; the slot survives on the weak count.
        assert_eq!(slot.header().num_shared(), 0);
        assert_eq!(slot.header().num_weak(), 1);
        assert!(!slot.is_live());
        assert!(w.upgrade().is_none());
        drop(w); // releases the slot entirely
    }

    #[test]
    fn test_create_with_self_reference() {
        // A constructor that takes and releases a shared pointer to the
        // object being built must not destroy it mid-construction.
        let a = create_with(|init: &Init<Leaf>| {
            let tmp: Shared<Leaf> = init.shared();
            drop(tmp); // shared count returns to zero while size == 0
            Leaf::new(42)
        });
        assert_eq!(a.get().get(), 42);
        assert_eq!(a.slot().header().num_shared(), 1);
    }

    #[test]
    fn test_payload_downcast() {
        let a = create(Leaf::new(9));
        let payload = a.slot().payload();
        assert!(payload.as_any().is::<Leaf>());
        assert!(!payload.as_any().is::<super::testutil::Node>());
    }
}
