//! Pooled Allocation
//!
//! Thread-tagged, size-binned allocation for runtime objects.
//!
//! Allocations are rounded up to power-of-two bins. Each (thread, bin) pair
//! has its own free list, so the common allocate/deallocate cycle touches no
//! cross-thread state. Memory released by a *different* thread than the one
//! that allocated it is pushed back onto the owner thread's pool, which is
//! why every object records its owner (see [`crate::counted::Counted`]);
//! that push is the one mutex-protected operation in the scheme.
//!
//! Exhaustion is fatal: the runtime has no recoverable out-of-memory path,
//! so a failed system allocation aborts through
//! [`std::alloc::handle_alloc_error`].

use std::alloc::{self, Layout};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::OnceLock;

use parking_lot::Mutex;

use crate::thread::{max_threads, thread_id, ThreadId};

/// Smallest bin, in bytes.
const MIN_BIN: usize = 16;

/// Number of size bins per thread: covers 16 B through 16 B << 47.
const NBINS: usize = 48;

/// Alignment for all pooled allocations.
const ALIGN: usize = 16;

/// Global count of live allocated bytes (requested, not binned).
static MEMORY_USE: AtomicUsize = AtomicUsize::new(0);

/// Allocator statistics.
#[derive(Debug, Default)]
pub struct AllocStats {
    /// Total allocations served.
    pub allocations: AtomicU64,
    /// Total deallocations.
    pub deallocations: AtomicU64,
    /// Allocations satisfied from a pool free list.
    pub pool_hits: AtomicU64,
    /// Allocations that fell through to the system allocator.
    pub pool_misses: AtomicU64,
}

static STATS: AllocStats = AllocStats {
    allocations: AtomicU64::new(0),
    deallocations: AtomicU64::new(0),
    pool_hits: AtomicU64::new(0),
    pool_misses: AtomicU64::new(0),
};

/// Allocator statistics counters.
pub fn stats() -> &'static AllocStats {
    &STATS
}

/// Live allocated bytes.
pub fn memory_use() -> usize {
    MEMORY_USE.load(Ordering::Relaxed)
}

/// A free list of previously-allocated blocks of one bin size.
struct Pool {
    stack: Mutex<Vec<usize>>,
}

impl Pool {
    const fn new() -> Self {
        Self {
            stack: Mutex::new(Vec::new()),
        }
    }

    fn pop(&self) -> Option<usize> {
        self.stack.lock().pop()
    }

    fn push(&self, addr: usize) {
        self.stack.lock().push(addr);
    }
}

/// Pool table, one entry per (thread, bin). Sized once from the fixed
/// thread ceiling.
static POOLS: OnceLock<Vec<Pool>> = OnceLock::new();

/// Whether pooling is enabled; latched from config on first use.
static POOLED: OnceLock<bool> = OnceLock::new();

fn pooled() -> bool {
    *POOLED.get_or_init(|| {
        crate::config::runtime_config()
            .map(|c| c.memory.pooled)
            .unwrap_or(true)
    })
}

fn pool(tid: ThreadId, bin: usize) -> &'static Pool {
    let pools = POOLS.get_or_init(|| {
        let n = max_threads() * NBINS;
        let mut v = Vec::with_capacity(n);
        v.resize_with(n, Pool::new);
        v
    });
    &pools[tid as usize * NBINS + bin]
}

/// Bin index for a request of `size` bytes.
#[inline]
pub(crate) fn bin(size: usize) -> usize {
    let rounded = size.max(MIN_BIN).next_power_of_two();
    let i = (rounded.trailing_zeros() - MIN_BIN.trailing_zeros()) as usize;
    debug_assert!(i < NBINS);
    i
}

/// Block size of bin `i`.
#[inline]
pub(crate) fn unbin(i: usize) -> usize {
    MIN_BIN << i
}

fn layout_for(bin: usize) -> Layout {
    // Bin sizes are powers of two >= ALIGN's requirement, always valid.
    Layout::from_size_align(unbin(bin), ALIGN).expect("bin layout")
}

/// Allocate `size` bytes, tagged to the calling thread.
///
/// The returned block is at least `size` bytes (rounded up to the bin
/// size) and 16-byte aligned. Aborts the process if the system allocator
/// fails.
pub fn allocate(size: usize) -> NonNull<u8> {
    debug_assert!(size > 0);
    MEMORY_USE.fetch_add(size, Ordering::Relaxed);
    STATS.allocations.fetch_add(1, Ordering::Relaxed);

    let i = bin(size);
    if pooled() {
        if let Some(addr) = pool(thread_id(), i).pop() {
            STATS.pool_hits.fetch_add(1, Ordering::Relaxed);
            // Pool entries originate from successful allocations.
            return unsafe { NonNull::new_unchecked(addr as *mut u8) };
        }
    }
    STATS.pool_misses.fetch_add(1, Ordering::Relaxed);

    let layout = layout_for(i);
    let ptr = unsafe { alloc::alloc(layout) };
    match NonNull::new(ptr) {
        Some(ptr) => ptr,
        None => alloc::handle_alloc_error(layout),
    }
}

/// Release a block of `size` bytes back to its owner thread's pool.
///
/// `owner` must be the thread id the block was allocated on; with pooling
/// disabled it is ignored and the block goes straight back to the system
/// allocator.
///
/// # Safety
///
/// `ptr` must have come from [`allocate`] with the same `size`, and must
/// not be used afterwards.
pub unsafe fn deallocate(ptr: NonNull<u8>, size: usize, owner: ThreadId) {
    debug_assert!(size > 0);
    debug_assert!((owner as usize) < max_threads());
    MEMORY_USE.fetch_sub(size, Ordering::Relaxed);
    STATS.deallocations.fetch_add(1, Ordering::Relaxed);

    let i = bin(size);
    if pooled() {
        pool(owner, i).push(ptr.as_ptr() as usize);
    } else {
        alloc::dealloc(ptr.as_ptr(), layout_for(i));
    }
}

/// Resize a block, preserving contents up to the smaller of the two sizes.
///
/// Blocks that stay within their bin are returned unchanged; otherwise a
/// new block is allocated, contents copied, and the old block released to
/// `owner`'s pool.
///
/// # Safety
///
/// `ptr` must have come from [`allocate`] with size `old_size`; on return
/// the old pointer must not be used if a new one was produced.
pub unsafe fn reallocate(
    ptr: NonNull<u8>,
    old_size: usize,
    owner: ThreadId,
    new_size: usize,
) -> NonNull<u8> {
    debug_assert!(old_size > 0);
    debug_assert!(new_size > 0);

    if bin(old_size) == bin(new_size) {
        // Same bin, same block; only the accounting changes.
        if new_size > old_size {
            MEMORY_USE.fetch_add(new_size - old_size, Ordering::Relaxed);
        } else {
            MEMORY_USE.fetch_sub(old_size - new_size, Ordering::Relaxed);
        }
        return ptr;
    }

    let fresh = allocate(new_size);
    std::ptr::copy_nonoverlapping(ptr.as_ptr(), fresh.as_ptr(), old_size.min(new_size));
    deallocate(ptr, old_size, owner);
    fresh
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bin_rounding() {
        assert_eq!(bin(1), 0);
        assert_eq!(bin(16), 0);
        assert_eq!(bin(17), 1);
        assert_eq!(bin(32), 1);
        assert_eq!(bin(33), 2);
        assert_eq!(unbin(bin(100)), 128);
    }

    #[test]
    fn test_unbin_inverse() {
        for i in 0..20 {
            assert_eq!(bin(unbin(i)), i);
        }
    }

    #[test]
    fn test_allocate_round_trip() {
        let ptr = allocate(64);
        assert_eq!(ptr.as_ptr() as usize % ALIGN, 0);
        unsafe {
            // The block must be writable across its full binned extent.
            std::ptr::write_bytes(ptr.as_ptr(), 0xAB, 64);
            deallocate(ptr, 64, thread_id());
        }
    }

    // The pool-determinism tests below each use a bin size no other test
    // touches, so LIFO reuse is observable even with the harness running
    // tests in parallel.

    #[test]
    fn test_pool_reuse() {
        let size = 3000;
        let ptr = allocate(size);
        let addr = ptr.as_ptr() as usize;
        unsafe { deallocate(ptr, size, thread_id()) };
        let again = allocate(size);
        assert_eq!(again.as_ptr() as usize, addr);
        unsafe { deallocate(again, size, thread_id()) };
    }

    #[test]
    fn test_cross_thread_deallocate() {
        let size = 6000;
        let owner = thread_id();
        let ptr = allocate(size);
        let addr = ptr.as_ptr() as usize;
        std::thread::spawn(move || unsafe {
            let ptr = NonNull::new_unchecked(addr as *mut u8);
            deallocate(ptr, size, owner);
        })
        .join()
        .unwrap();
        // The block went back to this thread's pool, so a same-bin
        // allocation here reuses it.
        let again = allocate(size);
        assert_eq!(again.as_ptr() as usize, addr);
        unsafe { deallocate(again, size, owner) };
    }

    #[test]
    fn test_reallocate_preserves_contents() {
        let ptr = allocate(24);
        unsafe {
            for i in 0..24 {
                *ptr.as_ptr().add(i) = i as u8;
            }
            let grown = reallocate(ptr, 24, thread_id(), 200);
            for i in 0..24 {
                assert_eq!(*grown.as_ptr().add(i), i as u8);
            }
            deallocate(grown, 200, thread_id());
        }
    }

    #[test]
    fn test_reallocate_same_bin_keeps_block() {
        let ptr = allocate(20);
        let addr = ptr.as_ptr() as usize;
        unsafe {
            let same = reallocate(ptr, 20, thread_id(), 30);
            assert_eq!(same.as_ptr() as usize, addr);
            deallocate(same, 30, thread_id());
        }
    }
}
