//! Clone Contexts
//!
//! A [`Context`] is a node in the fork tree. It owns the memo mapping
//! originals to their images in this branch of cloned state, a reference to
//! the context it was forked from, and a frozen flag inherited across
//! forks.
//!
//! Forking copies the parent's (compacted) memo into the child, so every
//! mapping the parent had at fork time is visible in the child without
//! walking ancestors at lookup time; mappings either context adds after the
//! fork stay private to it, which is exactly the divergence the fork is
//! for.
//!
//! Resolution chases mapping chains to a fixed point and clones when the
//! endpoint is frozen. Both the chase and the insert happen under the
//! context's spin lock, so at most one clone of a given object can ever be
//! published per context, even under concurrent callers.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, Weak as ArcWeak};

use crate::lock::ExclusiveLock;
use crate::log::{would_log, LogBuilder, LogLevel};
use crate::memo::Memo;
use crate::object::{CloneSession, SlotRef};

/// A node in the fork tree, owning the memo for one branch of cloned
/// state.
pub struct Context {
    /// Original → clone mappings for this branch. Guarded by `lock`.
    memo: UnsafeCell<Memo>,

    /// Exclusive lock over memo access. Critical sections are short
    /// (probe, insert, fork-copy); see [`ExclusiveLock`].
    lock: ExclusiveLock,

    /// The context this one was forked from; `None` for roots.
    parent: Option<Arc<Context>>,

    /// Set when this context's state has been shared with a fork. A
    /// frozen context can still accept new memo entries (each new clone
    /// adds one); the flag marks the *values* as immutable-in-place.
    frozen: AtomicBool,

    /// Back-reference to our own `Arc`, so clone sessions can carry a
    /// counted handle to the context they resolve in.
    weak_self: ArcWeak<Context>,
}

// Safety: the memo is only touched under `lock`; everything else is
// atomic or immutable.
unsafe impl Send for Context {}
unsafe impl Sync for Context {}

impl Context {
    /// Create a root context (no parent).
    pub fn new_root() -> Arc<Context> {
        let min_size = crate::config::clone_config().initial_memo_size;
        Arc::new_cyclic(|weak| Context {
            memo: UnsafeCell::new(Memo::new(min_size)),
            lock: ExclusiveLock::new(),
            parent: None,
            frozen: AtomicBool::new(false),
            weak_self: weak.clone(),
        })
    }

    /// The process-wide root context, created on first use.
    pub fn root() -> &'static Arc<Context> {
        static ROOT: OnceLock<Arc<Context>> = OnceLock::new();
        ROOT.get_or_init(Context::new_root)
    }

    /// Counted handle to this context.
    fn arc(&self) -> Arc<Context> {
        self.weak_self
            .upgrade()
            .expect("context used after release")
    }

    /// Fork a child context.
    ///
    /// The parent's memo is compacted and copied under its lock; the
    /// child starts with every mapping the parent had, plus the parent's
    /// frozen flag.
    pub fn fork(&self) -> Arc<Context> {
        let child_memo = {
            let _g = self.lock.guard();
            let memo = unsafe { &mut *self.memo.get() };
            let mut copy = Memo::new(memo.min_size());
            copy.copy_from(memo);
            copy
        };

        if would_log(LogLevel::Trace) {
            LogBuilder::new(LogLevel::Trace)
                .message("context fork")
                .field_int("inherited_entries", child_memo.len() as i64)
                .field_bool("frozen", self.is_frozen())
                .emit();
        }

        let parent = self.arc();
        Arc::new_cyclic(|weak| Context {
            memo: UnsafeCell::new(child_memo),
            lock: ExclusiveLock::new(),
            parent: Some(parent),
            frozen: AtomicBool::new(self.is_frozen()),
            weak_self: weak.clone(),
        })
    }

    /// Map an object into this context, cloning it if necessary.
    ///
    /// Returns the image of `o`: the object itself when it is not frozen
    /// here, the already-published clone when one exists, or a freshly
    /// made private clone otherwise. Idempotent per `(context, object)`
    /// pair, including under concurrent callers.
    pub(crate) fn get(&self, o: SlotRef) -> SlotRef {
        let _g = self.lock.guard();
        let memo = unsafe { &mut *self.memo.get() };
        CloneSession::new(self.arc(), memo, false).resolve(o)
    }

    /// Map an object into this context without cloning.
    ///
    /// Read-only counterpart of [`Context::get`]: returns the existing
    /// image, which may still be the frozen source when no clone has been
    /// forced yet.
    pub(crate) fn pull(&self, o: SlotRef) -> SlotRef {
        let _g = self.lock.guard();
        let memo = unsafe { &*self.memo.get() };
        memo.chase(o)
    }

    /// Copy an object into this context unconditionally (eager deep
    /// clone), memoized so shared structure and cycles copy once.
    pub(crate) fn copy(&self, o: SlotRef) -> SlotRef {
        let _g = self.lock.guard();
        let memo = unsafe { &mut *self.memo.get() };
        CloneSession::new(self.arc(), memo, true).resolve(o)
    }

    /// Mark this context frozen and push its memo values onto a freeze
    /// traversal. Called with the global freeze lock held.
    pub(crate) fn freeze_into(&self, walk: &mut crate::freeze::FreezeWalk) {
        self.frozen.store(true, Ordering::Release);
        let _g = self.lock.guard();
        let memo = unsafe { &*self.memo.get() };
        memo.freeze_values(walk);
    }

    /// Clear the frozen flag, marking the memo as privately mutable
    /// again.
    pub fn thaw(&self) {
        self.frozen.store(false, Ordering::Release);
    }

    /// Has this context been frozen for sharing?
    pub fn is_frozen(&self) -> bool {
        self.frozen.load(Ordering::Acquire)
    }

    /// The context this one was forked from.
    pub fn parent(&self) -> Option<&Arc<Context>> {
        self.parent.as_ref()
    }

    /// Does this context have `other` as a fork ancestor (or is it
    /// `other` itself)?
    pub fn has_ancestor(&self, other: &Arc<Context>) -> bool {
        let mut current: Option<&Context> = Some(self);
        while let Some(ctx) = current {
            if std::ptr::eq(ctx, Arc::as_ptr(other)) {
                return true;
            }
            current = ctx.parent.as_deref();
        }
        false
    }

    /// Number of mappings currently memoized.
    pub fn memo_len(&self) -> usize {
        let _g = self.lock.guard();
        unsafe { &*self.memo.get() }.len()
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("root", &self.parent.is_none())
            .field("frozen", &self.is_frozen())
            .finish()
    }
}
