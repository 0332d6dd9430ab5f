//! Sparse binary-counter accumulator for per-tile partials.
//!
//! Tile `i` completes a block of `2^cache_id(i)` tiles, where
//! `cache_id(i) = popcount(i ^ (i + 1)) - 1` (the trailing ones of `i`).
//! Merging folds the partial together with slots `0..id` into slot `id`,
//! exactly like carry propagation when incrementing a binary counter. After
//! `k` merges the occupied slots are the set bits of `k`, so at most
//! `floor(log2(k)) + 1` partials are live.

use tracing::trace;

use crate::traits::Combine;
use crate::types::Element;

/// Slot index that tile `index` writes.
#[inline]
pub fn cache_id(index: u64) -> usize {
    ((index ^ (index.wrapping_add(1))).count_ones() - 1) as usize
}

/// Slot count needed for `max_tiles` tiles (`ceil(log2(max_tiles)) + 1`).
pub fn slots_for(max_tiles: u64) -> usize {
    if max_tiles <= 1 {
        1
    } else {
        (u64::BITS - (max_tiles - 1).leading_zeros()) as usize + 1
    }
}

/// Running total of per-group partials, one vector per binary-counter slot.
#[derive(Debug, Clone)]
pub struct PartialResultCache<T> {
    groups: usize,
    merged: u64,
    slots: Vec<Vec<T>>,
}

impl<T: Element> PartialResultCache<T> {
    /// Cache for `groups` values per tile, pre-sized for `max_tiles` tiles.
    pub fn new(groups: usize, max_tiles: u64) -> Self {
        Self {
            groups,
            merged: 0,
            slots: (0..slots_for(max_tiles)).map(|_| vec![T::ZERO; groups]).collect(),
        }
    }

    /// Values per tile.
    pub fn groups(&self) -> usize {
        self.groups
    }

    /// Tiles merged since the last reset.
    pub fn merged(&self) -> u64 {
        self.merged
    }

    /// Forget every partial, keeping the allocation.
    pub fn reset(&mut self, groups: usize) {
        self.merged = 0;
        if groups != self.groups {
            self.groups = groups;
            for slot in &mut self.slots {
                slot.resize(groups, T::ZERO);
            }
        }
    }

    /// Merge the partial of tile `index`.
    ///
    /// Tiles must be merged in order `0, 1, 2, ...` with no gaps; a wrong
    /// order silently corrupts the total. Only `partial[..groups]` is read.
    pub fn merge<C: Combine<T>>(&mut self, op: &C, index: u64, partial: &[T]) {
        debug_assert_eq!(index, self.merged, "tiles must be merged in order");
        let id = cache_id(index);
        while self.slots.len() <= id {
            self.slots.push(vec![T::ZERO; self.groups]);
        }
        let (lower, upper) = self.slots.split_at_mut(id);
        let target = &mut upper[0];
        for g in 0..self.groups {
            let mut acc = partial[g];
            for slot in lower.iter() {
                acc = op.combine(acc, slot[g]);
            }
            target[g] = acc;
        }
        self.merged += 1;
        trace!(index, cache_id = id, "partial merged");
    }

    /// Slot ids currently holding a partial (the set bits of `merged`).
    pub fn occupied(&self) -> Vec<usize> {
        (0..self.slots.len())
            .filter(|&b| b < 64 && self.merged & (1u64 << b) != 0)
            .collect()
    }

    /// Contents of slot `id` if it is occupied.
    pub fn slot(&self, id: usize) -> Option<&[T]> {
        if id < 64 && self.merged & (1u64 << id) != 0 {
            self.slots.get(id).map(Vec::as_slice)
        } else {
            None
        }
    }

    /// Combine every occupied slot into `out[..groups]`.
    ///
    /// Returns `false` (and leaves `out` untouched) if nothing was merged.
    pub fn finalize_into<C: Combine<T>>(&self, op: &C, out: &mut [T]) -> bool {
        let occupied = self.occupied();
        let Some((&first, rest)) = occupied.split_first() else {
            return false;
        };
        out[..self.groups].copy_from_slice(&self.slots[first]);
        for &id in rest {
            for (o, &v) in out.iter_mut().zip(&self.slots[id]) {
                *o = op.combine(*o, v);
            }
        }
        true
    }

    /// Combined total, or `None` if nothing was merged.
    pub fn finalize<C: Combine<T>>(&self, op: &C) -> Option<Vec<T>> {
        let mut out = vec![T::ZERO; self.groups];
        self.finalize_into(op, &mut out).then_some(out)
    }
}
