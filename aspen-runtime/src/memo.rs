//! Clone Memoization Table
//!
//! Maps original objects to their clones within one context. The table is
//! open addressing with linear probing over a power-of-two capacity;
//! deletion only happens wholesale during rehash, so there are no
//! tombstones to skip on lookup.
//!
//! Ownership is baked into the entry counts: holding an entry means the
//! table owns one memo count on the key and a double shared count on the
//! value. The double count halves the atomic traffic of entry churn
//! against the table's own lifetime.
//!
//! Rehashing does three jobs in one pass over the table: path compression
//! (a chain a→b, b→c becomes a→c, letting b's entry die sooner),
//! reachability pruning (entries whose key can never be looked up again
//! are dropped), and resizing in either direction. The correctness of the
//! whole cloning model leans on these count adjustments being exact.

use crate::log::{would_log, LogBuilder, LogLevel};
use crate::object::SlotRef;

/// Original-to-clone mapping for one context.
pub(crate) struct Memo {
    keys: Vec<Option<SlotRef>>,
    values: Vec<Option<SlotRef>>,
    /// Live entries, counted eagerly during `reserve` so the rehash
    /// decision sees the insert about to happen.
    occupied: usize,
    /// Entries added since the last rehash; a rehash with nothing new to
    /// compact is skipped.
    fresh: usize,
    /// Smallest capacity the table will shrink to.
    min_size: usize,
}

impl Memo {
    /// Create an empty table. `min_size` must be a power of two.
    pub(crate) fn new(min_size: usize) -> Self {
        debug_assert!(min_size.is_power_of_two());
        Self {
            keys: Vec::new(),
            values: Vec::new(),
            occupied: 0,
            fresh: 0,
            min_size,
        }
    }

    /// Current capacity (a power of two, or zero before first insert).
    pub(crate) fn capacity(&self) -> usize {
        self.keys.len()
    }

    /// Live entry count.
    pub(crate) fn len(&self) -> usize {
        self.occupied
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.occupied == 0
    }

    pub(crate) fn min_size(&self) -> usize {
        self.min_size
    }

    /// Occupancy threshold above which the table rehashes: 3/8 of
    /// capacity.
    fn crowd(capacity: usize) -> usize {
        3 * capacity / 8
    }

    /// Home bucket for a key. Slot addresses are at least 16-byte
    /// aligned, so the low bits carry no entropy; a Fibonacci multiply
    /// spreads the rest and the top bits select the bucket.
    fn bucket(key: SlotRef, capacity: usize) -> usize {
        debug_assert!(capacity.is_power_of_two());
        let h = ((key.addr() >> 4) as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15);
        (h >> (64 - capacity.trailing_zeros())) as usize
    }

    /// Look up the clone previously memoized for `key`.
    pub(crate) fn get(&self, key: SlotRef) -> Option<SlotRef> {
        if self.capacity() == 0 {
            return None;
        }
        let mask = self.capacity() - 1;
        let mut i = Self::bucket(key, self.capacity());
        while let Some(k) = self.keys[i] {
            if k == key {
                return self.values[i];
            }
            i = (i + 1) & mask;
        }
        None
    }

    /// Look up `key`, returning `failed` when absent.
    pub(crate) fn get_or(&self, key: SlotRef, failed: SlotRef) -> SlotRef {
        self.get(key).unwrap_or(failed)
    }

    /// Resolve `o` through mapping chains to its fixed point.
    pub(crate) fn chase(&self, o: SlotRef) -> SlotRef {
        let mut prev = o;
        loop {
            let next = self.get_or(prev, prev);
            if next == prev {
                return next;
            }
            prev = next;
        }
    }

    /// Insert a mapping. The key must not already be present.
    ///
    /// Takes one memo count on `key` and a double shared count on
    /// `value`; both are released when the entry is dropped or pruned.
    pub(crate) fn put(&mut self, key: SlotRef, value: SlotRef) {
        key.inc_memo();
        value.double_inc_shared();

        self.reserve();
        let mask = self.capacity() - 1;
        let mut i = Self::bucket(key, self.capacity());
        while let Some(k) = self.keys[i] {
            debug_assert!(k != key, "memo key inserted twice");
            i = (i + 1) & mask;
        }
        self.keys[i] = Some(key);
        self.values[i] = Some(value);
    }

    /// Account for an incoming entry, rehashing if the table would get
    /// too crowded.
    fn reserve(&mut self) {
        self.fresh += 1;
        self.occupied += 1;
        if self.occupied > Self::crowd(self.capacity()) {
            self.rehash();
        }
    }

    /// Compact and resize the table.
    pub(crate) fn rehash(&mut self) {
        if self.fresh == 0 {
            // Nothing new since the last rehash; already compact.
            return;
        }
        self.fresh = 0;
        let old_capacity = self.capacity();

        // First pass: apply the table to itself. A chain a→b, b→c
        // becomes a→c and b→c, which lets b be collected sooner. The
        // skipped intermediate loses its double count to the endpoint.
        for i in 0..old_capacity {
            if self.keys[i].is_some() {
                let first = self.values[i].expect("entry without value");
                let fixed = self.chase(first);
                if fixed != first {
                    fixed.double_inc_shared();
                    first.double_dec_shared();
                    self.values[i] = Some(fixed);
                }
            }
        }

        // Second pass: drop entries whose key is no longer reachable.
        // From this point the buffers are no longer a valid hash table.
        let mut pruned = 0usize;
        for i in 0..old_capacity {
            if let Some(key) = self.keys[i] {
                if !key.header().is_reachable() {
                    let value = self.values[i].expect("entry without value");
                    self.keys[i] = None;
                    self.values[i] = None;
                    self.occupied -= 1;
                    pruned += 1;
                    key.dec_memo();
                    value.double_dec_shared();
                }
            }
        }

        // Choose the new capacity: double, then halve back down while
        // mostly empty, never below the configured minimum.
        let old_keys = std::mem::take(&mut self.keys);
        let old_values = std::mem::take(&mut self.values);

        if self.occupied == 0 {
            // New table will be empty.
            if would_log(LogLevel::Debug) && old_capacity != 0 {
                LogBuilder::new(LogLevel::Debug)
                    .message("memo rehash")
                    .field_int("old_capacity", old_capacity as i64)
                    .field_int("new_capacity", 0)
                    .field_int("pruned", pruned as i64)
                    .emit();
            }
            return;
        }

        let mut capacity = (2 * old_capacity).max(self.min_size);
        while self.min_size < capacity && self.occupied <= Self::crowd(capacity) / 2 {
            capacity /= 2;
        }

        self.keys = vec![None; capacity];
        self.values = vec![None; capacity];

        // Re-insert surviving entries. Ownership is already accounted;
        // no count changes here.
        let mask = capacity - 1;
        for i in 0..old_capacity {
            if let Some(key) = old_keys[i] {
                let mut j = Self::bucket(key, capacity);
                while self.keys[j].is_some() {
                    j = (j + 1) & mask;
                }
                self.keys[j] = Some(key);
                self.values[j] = old_values[i];
            }
        }

        if would_log(LogLevel::Debug) {
            LogBuilder::new(LogLevel::Debug)
                .message("memo rehash")
                .field_int("old_capacity", old_capacity as i64)
                .field_int("new_capacity", capacity as i64)
                .field_int("occupied", self.occupied as i64)
                .field_int("pruned", pruned as i64)
                .emit();
        }
    }

    /// Populate this empty table as a copy of `other`'s reachable
    /// entries.
    ///
    /// `other` is compacted in place first, so the copy is minimal and
    /// needs no rehashing of its own. Every copied entry takes its own
    /// counts; the two tables then own their entries independently.
    pub(crate) fn copy_from(&mut self, other: &mut Memo) {
        debug_assert!(self.is_empty() && self.capacity() == 0);

        other.rehash();
        if other.capacity() == 0 {
            return;
        }

        self.keys = other.keys.clone();
        self.values = other.values.clone();
        self.occupied = other.occupied;
        self.fresh = other.fresh;

        for i in 0..self.capacity() {
            if let Some(key) = self.keys[i] {
                key.inc_memo();
                self.values[i].expect("entry without value").double_inc_shared();
            }
        }
    }

    /// Push every value onto a freeze traversal.
    pub(crate) fn freeze_values(&self, walk: &mut crate::freeze::FreezeWalk) {
        for value in self.values.iter().flatten() {
            walk.push(*value);
        }
    }
}

impl Drop for Memo {
    fn drop(&mut self) {
        for i in 0..self.keys.len() {
            if let Some(key) = self.keys[i] {
                let value = self.values[i].expect("entry without value");
                key.dec_memo();
                value.double_dec_shared();
            }
        }
    }
}

impl std::fmt::Debug for Memo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Memo")
            .field("capacity", &self.capacity())
            .field("occupied", &self.occupied)
            .field("fresh", &self.fresh)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::testutil::Leaf;
    use crate::object::create;
    use crate::shared::Shared;

    fn fresh_pair() -> (Shared<Leaf>, Shared<Leaf>) {
        (create(Leaf::new(0)), create(Leaf::new(1)))
    }

    #[test]
    fn test_empty_lookup() {
        let memo = Memo::new(8);
        let (a, _b) = fresh_pair();
        assert_eq!(memo.capacity(), 0);
        assert!(memo.get(a.slot()).is_none());
        assert_eq!(memo.chase(a.slot()), a.slot());
    }

    #[test]
    fn test_put_get() {
        let mut memo = Memo::new(8);
        let (a, b) = fresh_pair();
        memo.put(a.slot(), b.slot());
        assert_eq!(memo.get(a.slot()), Some(b.slot()));
        assert_eq!(memo.capacity(), 8);
        // Entry counts: one memo keying on the key, double shared on the
        // value.
        assert_eq!(a.slot().header().num_memo(), 2);
        assert_eq!(b.slot().header().num_shared(), 3);
        drop(memo);
        assert_eq!(a.slot().header().num_memo(), 1);
        assert_eq!(b.slot().header().num_shared(), 1);
    }

    #[test]
    fn test_rehash_triggered_by_fourth_insert() {
        // With a minimum size of 8 the crowd threshold is 3; the fourth
        // insert must double the table to 16 before probing.
        let mut memo = Memo::new(8);
        let keys: Vec<_> = (0..4).map(|i| create(Leaf::new(i))).collect();
        let values: Vec<_> = (0..4).map(|i| create(Leaf::new(100 + i))).collect();

        for (k, v) in keys.iter().zip(&values).take(3) {
            memo.put(k.slot(), v.slot());
        }
        assert_eq!(memo.capacity(), 8);

        memo.put(keys[3].slot(), values[3].slot());
        assert_eq!(memo.capacity(), 16);

        for (k, v) in keys.iter().zip(&values) {
            assert_eq!(memo.get(k.slot()), Some(v.slot()));
        }
    }

    #[test]
    fn test_capacity_always_power_of_two() {
        let mut memo = Memo::new(8);
        let mut handles = Vec::new();
        for i in 0..40 {
            let k = create(Leaf::new(i));
            let v = create(Leaf::new(1000 + i));
            memo.put(k.slot(), v.slot());
            assert!(memo.capacity().is_power_of_two());
            assert!(memo.len() <= memo.capacity());
            handles.push((k, v));
        }
        for (k, v) in &handles {
            assert_eq!(memo.get(k.slot()), Some(v.slot()));
        }
    }

    #[test]
    fn test_path_compression() {
        let mut memo = Memo::new(8);
        let a = create(Leaf::new(0));
        let b = create(Leaf::new(1));
        let c = create(Leaf::new(2));
        memo.put(a.slot(), b.slot());
        memo.put(b.slot(), c.slot());
        assert_eq!(memo.chase(a.slot()), c.slot());

        // Force a compaction pass; a's entry must now point straight at
        // the endpoint and the double count must have moved with it.
        let shared_c_before = c.slot().header().num_shared();
        memo.rehash();
        assert_eq!(memo.get(a.slot()), Some(c.slot()));
        assert_eq!(c.slot().header().num_shared(), shared_c_before + 2);
        // b lost the double count it held as a's value.
        assert_eq!(b.slot().header().num_shared(), 1);
    }

    #[test]
    fn test_reachability_pruning() {
        let mut memo = Memo::new(8);
        let value = create(Leaf::new(5));

        // A key that dies with no weak observers is reachable only
        // through the memo keying and must be pruned by the next rehash.
        let key = create(Leaf::new(4));
        memo.put(key.slot(), value.slot());
        let key_slot = key.slot();
        drop(key);
        assert!(!key_slot.header().is_reachable());

        // Live keys survive.
        let live = create(Leaf::new(6));
        memo.put(live.slot(), value.slot());

        memo.rehash();
        assert_eq!(memo.len(), 1);
        assert_eq!(memo.get(live.slot()), Some(value.slot()));
        assert_eq!(value.slot().header().num_shared(), 1 + 2);
    }

    #[test]
    fn test_shrink_when_mostly_empty() {
        let mut memo = Memo::new(8);
        let value = create(Leaf::new(9));

        // Grow the table with keys that die immediately after insertion.
        let mut dead = Vec::new();
        for i in 0..30 {
            let k = create(Leaf::new(i));
            memo.put(k.slot(), value.slot());
            dead.push(k);
        }
        assert!(memo.capacity() > 8);
        drop(dead);

        // One live entry keeps the table nonempty; everything else is
        // pruned and the capacity collapses back to the minimum.
        let live = create(Leaf::new(99));
        memo.put(live.slot(), value.slot());
        memo.rehash();
        assert_eq!(memo.len(), 1);
        assert_eq!(memo.capacity(), 8);
        assert_eq!(memo.get(live.slot()), Some(value.slot()));
    }

    proptest::proptest! {
        #![proptest_config(proptest::prelude::ProptestConfig::with_cases(32))]

        /// Interleaved inserts, key deaths and rehashes never break the
        /// table shape, and every key whose handle survives still
        /// resolves to its value.
        #[test]
        fn prop_memo_invariants(ops in proptest::collection::vec(proptest::prelude::any::<(u8, u8)>(), 1..100)) {
            let mut memo = Memo::new(8);
            let mut live: Vec<(Shared<Leaf>, Shared<Leaf>)> = Vec::new();
            for (op, sel) in ops {
                match op % 3 {
                    0 => {
                        let k = create(Leaf::new(0));
                        let v = create(Leaf::new(1));
                        memo.put(k.slot(), v.slot());
                        live.push((k, v));
                    }
                    1 => {
                        if !live.is_empty() {
                            // Dropping the handles makes the key
                            // unreachable; the next rehash may prune it.
                            let i = sel as usize % live.len();
                            live.remove(i);
                        }
                    }
                    _ => memo.rehash(),
                }
                proptest::prop_assert!(
                    memo.capacity() == 0 || memo.capacity().is_power_of_two()
                );
                proptest::prop_assert!(memo.len() <= memo.capacity());
            }
            for (k, v) in &live {
                proptest::prop_assert_eq!(memo.get(k.slot()), Some(v.slot()));
            }
        }
    }

    #[test]
    fn test_copy_from_compacts_source() {
        let mut parent = Memo::new(8);
        let value = create(Leaf::new(1));
        let dead = create(Leaf::new(2));
        parent.put(dead.slot(), value.slot());
        let live = create(Leaf::new(3));
        parent.put(live.slot(), value.slot());
        drop(dead);

        let mut child = Memo::new(8);
        child.copy_from(&mut parent);

        // The dead key was pruned from the parent before copying.
        assert_eq!(parent.len(), 1);
        assert_eq!(child.len(), 1);
        assert_eq!(child.get(live.slot()), Some(value.slot()));
        // Both tables now hold counts independently.
        assert_eq!(live.slot().header().num_memo(), 3);
        assert_eq!(value.slot().header().num_shared(), 1 + 2 + 2);
        drop(child);
        assert_eq!(value.slot().header().num_shared(), 1 + 2);
    }
}
