//! Freeze and Finish Traversals
//!
//! Before an object graph is shared with a forked context it is *frozen*:
//! every reachable object gets its frozen mark set, which is what diverts
//! later writes through the copy-on-write path. The traversal here is an
//! explicit worklist — the frozen mark doubles as the visited set, so
//! cyclic graphs terminate and stack depth stays bounded regardless of
//! graph shape.
//!
//! *Finish* is the companion traversal that forces resolution of pending
//! cross-context references after a freeze, materializing any outstanding
//! clones so the structure is stable before it is handed off.
//!
//! Each top-level traversal is serialized by its own process-wide lock;
//! two threads never interleave partial freezes of overlapping graphs.

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::context::Context;
use crate::lazy::Lazy;
use crate::log::{would_log, LogBuilder, LogLevel};
use crate::object::{Clonable, SlotRef};
use crate::shared::Shared;

/// Serializes top-level freeze traversals.
static FREEZE_LOCK: Mutex<()> = Mutex::new(());

/// Serializes top-level finish traversals.
static FINISH_LOCK: Mutex<()> = Mutex::new(());

/// Worklist traversal marking a subgraph immutable.
pub struct FreezeWalk {
    stack: Vec<SlotRef>,
    marked: usize,
}

impl FreezeWalk {
    pub(crate) fn new() -> Self {
        Self {
            stack: Vec::new(),
            marked: 0,
        }
    }

    /// Queue an object for freezing.
    pub(crate) fn push(&mut self, o: SlotRef) {
        self.stack.push(o);
    }

    /// Queue the referent of a lazy pointer field.
    pub fn visit_lazy<T: Clonable>(&mut self, ptr: &Lazy<T>) {
        if let Some(slot) = ptr.slot_ref() {
            self.push(slot);
        }
    }

    /// Queue the referent of a shared pointer field.
    pub fn visit_shared<T: Clonable>(&mut self, ptr: &Shared<T>) {
        if let Some(slot) = ptr.slot_opt() {
            self.push(slot);
        }
    }

    /// Drain the worklist. The frozen mark is set before an object's
    /// fields are expanded, so cycles terminate.
    pub(crate) fn run(&mut self) {
        while let Some(o) = self.stack.pop() {
            if o.freeze() {
                self.marked += 1;
                if o.is_live() {
                    o.payload().freeze_fields(self);
                }
            }
        }
    }
}

/// Freeze the graph reachable from `start`, then the context's memoized
/// clones.
///
/// Serialized by the global freeze lock; the context memo values are
/// frozen too because they are reachable only through the memo and must
/// not be mutated in place once the context is shared.
pub(crate) fn freeze_graph(start: SlotRef, context: &Arc<Context>) {
    let _g = FREEZE_LOCK.lock();
    let mut walk = FreezeWalk::new();
    walk.push(start);
    walk.run();
    context.freeze_into(&mut walk);
    walk.run();

    if would_log(LogLevel::Trace) {
        LogBuilder::new(LogLevel::Trace)
            .message("freeze")
            .field_int("marked", walk.marked as i64)
            .emit();
    }
}

/// Worklist traversal resolving pending cross-context references.
pub struct FinishWalk {
    stack: Vec<SlotRef>,
    seen: HashSet<usize>,
}

impl FinishWalk {
    pub(crate) fn new() -> Self {
        Self {
            stack: Vec::new(),
            seen: HashSet::new(),
        }
    }

    pub(crate) fn push(&mut self, o: SlotRef) {
        self.stack.push(o);
    }

    /// Force a lazy pointer field to its resolved image and queue the
    /// result.
    pub fn resolve_lazy<T: Clonable>(&mut self, ptr: &mut Lazy<T>) {
        if let Some(slot) = ptr.resolve_slot() {
            self.push(slot);
        }
    }

    /// Drain the worklist. An explicit visited set bounds the traversal;
    /// unlike freezing there is no per-object mark to reuse.
    pub(crate) fn run(&mut self) {
        while let Some(o) = self.stack.pop() {
            if self.seen.insert(o.addr()) && o.is_live() {
                o.payload_mut().finish_fields(self);
            }
        }
    }
}

/// Resolve every pending reference reachable from `ptr`, including the
/// pointer's own binding.
///
/// Serialized by the global finish lock.
pub(crate) fn finish_ptr<T: Clonable>(ptr: &mut Lazy<T>) {
    let _g = FINISH_LOCK.lock();
    let mut walk = FinishWalk::new();
    walk.resolve_lazy(ptr);
    walk.run();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Context;
    use crate::object::testutil::{Leaf, Node};
    use crate::object::create;

    #[test]
    fn test_freeze_marks_graph() {
        let ctx = Context::new_root();
        let leaf = create(Leaf::new(1));
        let node = create(Node::new(2, Lazy::new(&leaf, &ctx)));

        assert!(!node.slot().is_frozen());
        assert!(!leaf.slot().is_frozen());

        freeze_graph(node.slot(), &ctx);

        assert!(node.slot().is_frozen());
        assert!(leaf.slot().is_frozen());
        assert!(ctx.is_frozen());
    }

    #[test]
    fn test_freeze_idempotent() {
        let ctx = Context::new_root();
        let leaf = create(Leaf::new(1));
        freeze_graph(leaf.slot(), &ctx);
        // A second freeze finds everything already marked and is a no-op.
        freeze_graph(leaf.slot(), &ctx);
        assert!(leaf.slot().is_frozen());
    }

    #[test]
    fn test_freeze_covers_memo_values() {
        let ctx = Context::new_root();
        let a = create(Leaf::new(5));
        a.slot().freeze();
        let image = ctx.get(a.slot());
        assert!(!image.is_frozen());

        // Freezing any graph through this context also freezes the
        // context's memoized clones.
        let other = create(Leaf::new(6));
        freeze_graph(other.slot(), &ctx);
        assert!(image.is_frozen());
    }

    #[test]
    fn test_freeze_cyclic_terminates() {
        // A self-referential graph: node's lazy child points back at a
        // leaf that is also the walk start. The frozen mark stops the
        // walk from looping.
        let ctx = Context::new_root();
        let leaf = create(Leaf::new(0));
        let node = create(Node::new(1, Lazy::new(&leaf, &ctx)));
        freeze_graph(node.slot(), &ctx);
        freeze_graph(leaf.slot(), &ctx);
        assert!(node.slot().is_frozen());
    }
}
