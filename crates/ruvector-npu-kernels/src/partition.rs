//! Tile partitioner.
//!
//! [`TilePlan`] turns `(total, budget)` into a lazy sequence of
//! [`TileDescriptor`]s; [`CoreSplit`] assigns each core its contiguous range
//! with the two-tier block rule (the first `tail_block_num` cores take one
//! extra item). Both are plain values: iterating a plan twice yields the same
//! tiles.

use std::ops::Range;

use crate::config::TilingConfig;
use crate::error::ConfigError;
use crate::types::TileDescriptor;

// ---------------------------------------------------------------------------
// TilePlan
// ---------------------------------------------------------------------------

/// `ceil(total / budget)` tiles of `budget` elements, the last one ragged.
///
/// # Example
///
/// ```rust
/// use ruvector_npu_kernels::partition::TilePlan;
///
/// let plan = TilePlan::new(100, 32).unwrap();
/// let spans: Vec<_> = plan.tiles().map(|t| t.range()).collect();
/// assert_eq!(spans, vec![0..32, 32..64, 64..96, 96..100]);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TilePlan {
    base: u64,
    total: u64,
    budget: u32,
    buffer_num: u32,
}

impl TilePlan {
    /// Plan `total` elements in tiles of at most `budget`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::ZeroBudget`] if `budget == 0`.
    pub fn new(total: u64, budget: u32) -> Result<Self, ConfigError> {
        if budget == 0 {
            return Err(ConfigError::ZeroBudget("tile budget"));
        }
        Ok(Self {
            base: 0,
            total,
            budget,
            buffer_num: 1,
        })
    }

    /// Shift every tile offset by `base` (the owning core's range start).
    pub fn with_base(mut self, base: u64) -> Self {
        self.base = base;
        self
    }

    /// Cycle `buffer_slot` through `buffer_num` slots.
    pub fn with_buffers(mut self, buffer_num: u32) -> Self {
        self.buffer_num = buffer_num.max(1);
        self
    }

    /// Number of tiles.
    #[inline]
    pub fn len(&self) -> u64 {
        self.total.div_ceil(self.budget as u64)
    }

    /// `true` when `total == 0`.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.total == 0
    }

    /// Elements covered by the plan.
    #[inline]
    pub fn total(&self) -> u64 {
        self.total
    }

    /// The `index`-th tile, or `None` past the end.
    pub fn get(&self, index: u64) -> Option<TileDescriptor> {
        let count = self.len();
        if index >= count {
            return None;
        }
        let start = index * self.budget as u64;
        let length = (self.total - start).min(self.budget as u64) as u32;
        Some(TileDescriptor {
            index,
            offset: self.base + start,
            length,
            is_last: index + 1 == count,
            buffer_slot: (index % self.buffer_num as u64) as u32,
        })
    }

    /// Iterate the tiles from the first.
    pub fn tiles(&self) -> Tiles {
        Tiles {
            plan: *self,
            next: 0,
        }
    }
}

impl IntoIterator for &TilePlan {
    type Item = TileDescriptor;
    type IntoIter = Tiles;

    fn into_iter(self) -> Tiles {
        self.tiles()
    }
}

/// Forward iterator over a [`TilePlan`].
#[derive(Debug, Clone)]
pub struct Tiles {
    plan: TilePlan,
    next: u64,
}

impl Iterator for Tiles {
    type Item = TileDescriptor;

    fn next(&mut self) -> Option<TileDescriptor> {
        let tile = self.plan.get(self.next)?;
        self.next += 1;
        Some(tile)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let left = (self.plan.len() - self.next.min(self.plan.len())) as usize;
        (left, Some(left))
    }
}

impl ExactSizeIterator for Tiles {}

// ---------------------------------------------------------------------------
// CoreSplit
// ---------------------------------------------------------------------------

/// Balanced assignment of `total` items to `used_core_num` cores.
///
/// Core `c` receives `block_factor + 1` items when `c < tail_block_num`,
/// `block_factor` otherwise; its range starts at
/// `c * block_factor + min(c, tail_block_num)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoreSplit {
    used_core_num: u32,
    block_factor: u64,
    tail_block_num: u32,
}

impl CoreSplit {
    /// Split `total` items evenly over `cores` cores.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::ZeroBudget`] if `cores == 0`.
    pub fn balanced(total: u64, cores: u32) -> Result<Self, ConfigError> {
        if cores == 0 {
            return Err(ConfigError::ZeroBudget("used_core_num"));
        }
        Ok(Self {
            used_core_num: cores,
            block_factor: total / cores as u64,
            tail_block_num: (total % cores as u64) as u32,
        })
    }

    /// Take the split recorded by the planner.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::ZeroBudget`] for zero cores and
    /// [`ConfigError::ParameterOutOfRange`] when `tail_block_num` is not
    /// below the core count.
    pub fn from_config(tiling: &TilingConfig) -> Result<Self, ConfigError> {
        if tiling.used_core_num == 0 {
            return Err(ConfigError::ZeroBudget("used_core_num"));
        }
        if tiling.tail_block_num >= tiling.used_core_num {
            return Err(ConfigError::ParameterOutOfRange {
                name: "tail_block_num".into(),
                value: tiling.tail_block_num.to_string(),
                expected: format!("< used_core_num ({})", tiling.used_core_num),
            });
        }
        Ok(Self {
            used_core_num: tiling.used_core_num,
            block_factor: tiling.block_factor,
            tail_block_num: tiling.tail_block_num,
        })
    }

    /// Number of cores.
    #[inline]
    pub fn cores(&self) -> usize {
        self.used_core_num as usize
    }

    /// Items covered by all cores together.
    pub fn total(&self) -> u64 {
        self.block_factor * self.used_core_num as u64 + self.tail_block_num as u64
    }

    /// Items assigned to `core`.
    pub fn share(&self, core: usize) -> u64 {
        if core >= self.cores() {
            0
        } else if core < self.tail_block_num as usize {
            self.block_factor + 1
        } else {
            self.block_factor
        }
    }

    /// First item of `core`.
    pub fn offset(&self, core: usize) -> u64 {
        let core = core.min(self.cores()) as u64;
        core * self.block_factor + core.min(self.tail_block_num as u64)
    }

    /// `[offset, offset + share)` of `core`.
    pub fn range(&self, core: usize) -> Range<u64> {
        let start = self.offset(core);
        start..start + self.share(core)
    }

    /// Tile plan over `core`'s range.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::ZeroBudget`] if `budget == 0`.
    pub fn core_plan(&self, core: usize, budget: u32, buffer_num: u32) -> Result<TilePlan, ConfigError> {
        Ok(TilePlan::new(self.share(core), budget)?
            .with_base(self.offset(core))
            .with_buffers(buffer_num))
    }
}
