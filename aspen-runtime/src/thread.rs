//! Thread Bookkeeping
//!
//! Dense thread identifiers for the runtime.
//!
//! Every allocation records the thread it was made on so that its memory can
//! be returned to the correct per-thread pool, even when released by a
//! different thread. OS thread ids are neither dense nor bounded, so the
//! runtime assigns its own: the first time a thread touches the allocator it
//! receives the next id from an atomic counter, cached in a thread-local for
//! the life of the thread.
//!
//! The maximum thread count is fixed at process start (see
//! [`crate::config::MemoryConfig`]) and sizes the pool table once.

use std::cell::Cell;
use std::sync::atomic::{AtomicU16, AtomicUsize, Ordering};

/// Runtime-assigned thread id, dense in `0..max_threads()`.
pub type ThreadId = u16;

/// Next id to hand out.
static NEXT_THREAD_ID: AtomicU16 = AtomicU16::new(0);

/// Fixed thread ceiling, latched on first use.
static MAX_THREADS: AtomicUsize = AtomicUsize::new(0);

thread_local! {
    static THREAD_ID: Cell<Option<ThreadId>> = const { Cell::new(None) };
}

/// The maximum number of threads the runtime will track.
///
/// Latched on first call: either the configured value or the machine's
/// available parallelism with headroom for short-lived helper threads.
pub fn max_threads() -> usize {
    let current = MAX_THREADS.load(Ordering::Acquire);
    if current != 0 {
        return current;
    }
    let configured = crate::config::runtime_config()
        .map(|c| c.memory.max_threads)
        .unwrap_or_else(default_max_threads);
    // First store wins; later readers see a consistent value.
    match MAX_THREADS.compare_exchange(0, configured, Ordering::AcqRel, Ordering::Acquire) {
        Ok(_) => configured,
        Err(existing) => existing,
    }
}

/// Default ceiling: 4x hardware parallelism, at least 64.
pub(crate) fn default_max_threads() -> usize {
    let cpus = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    (4 * cpus).max(64)
}

/// The calling thread's dense runtime id.
///
/// # Panics
///
/// Panics if more than [`max_threads`] distinct threads register. The
/// ceiling is fixed at startup; exceeding it is a deployment error, not a
/// recoverable condition.
pub fn thread_id() -> ThreadId {
    THREAD_ID.with(|slot| match slot.get() {
        Some(id) => id,
        None => {
            let id = NEXT_THREAD_ID.fetch_add(1, Ordering::Relaxed);
            assert!(
                (id as usize) < max_threads(),
                "thread count exceeded the configured maximum of {}",
                max_threads()
            );
            slot.set(Some(id));
            id
        }
    })
}
