//! Axis reduction of an `[A, R]` tensor.
//!
//! Each of the `A` rows is reduced over its `R` elements with any
//! [`Combine`] operator (sum, max, min, mean). Rows may be strided; the
//! reduction axis may be non-contiguous.

use std::ops::Range;

use tracing::debug;

use crate::config::TilingConfig;
use crate::engine::TiledEngine;
use crate::error::{ConfigError, KernelError};
use crate::reducer::BinaryTreeReducer;
use crate::traits::{Combine, ReduceKernel};
use crate::types::{Element, GlobalTensor, TileDescriptor};

/// Rows reduced together per A-chunk at most.
pub const MAX_GROUP_FACTOR: u32 = 16;

/// [`ReduceKernel`] reducing every row of a 2-D tensor.
pub struct AxisReduce<'a, T, C> {
    input: &'a GlobalTensor<T>,
    op: C,
}

impl<'a, T: Element, C: Combine<T>> AxisReduce<'a, T, C> {
    /// Kernel over `input`, which must be 2-D.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::DimensionMismatch`] for any other rank.
    pub fn new(input: &'a GlobalTensor<T>, op: C) -> Result<Self, ConfigError> {
        if input.view().ndim() != 2 {
            return Err(ConfigError::DimensionMismatch(format!(
                "axis reduction expects [A, R], got shape {:?}",
                input.shape()
            )));
        }
        Ok(Self { input, op })
    }
}

impl<T: Element, C: Combine<T>> ReduceKernel<T> for AxisReduce<'_, T, C> {
    type Op = C;

    fn op(&self) -> &C {
        &self.op
    }

    fn input_streams(&self) -> &'static [&'static str] {
        &["x"]
    }

    fn load(
        &self,
        _stream: usize,
        groups: Range<usize>,
        tile: &TileDescriptor,
        dst: &mut [T],
    ) -> Result<(), KernelError> {
        let view = self.input.view();
        let len = tile.length as usize;
        for (row, g) in groups.enumerate() {
            let start = view.offset + g * view.strides[0] + tile.offset as usize * view.strides[1];
            self.input
                .read_run("x", start, view.strides[1], &mut dst[row * len..(row + 1) * len])?;
        }
        Ok(())
    }

    fn partials(
        &self,
        inputs: &[&[T]],
        groups: Range<usize>,
        tile: &TileDescriptor,
        reducer: &BinaryTreeReducer,
        _work: &mut [T],
        out: &mut [Vec<T>],
    ) -> Result<(), KernelError> {
        let len = tile.length as usize;
        reducer.reduce_groups(&self.op, inputs[0], len, len, groups.len(), &mut out[0])?;
        Ok(())
    }
}

/// Tiling for reducing an `[A, R]` tensor on up to `max_cores` cores.
///
/// # Errors
///
/// Returns [`KernelError::InvalidConfig`] for a non-2-D shape, an empty
/// reduction axis, or a scratch budget too small for one tile.
pub fn plan_reduce<T: Element>(
    engine: &TiledEngine,
    shape: &[usize],
    max_cores: u32,
) -> Result<TilingConfig, KernelError> {
    let [a, r] = shape else {
        return Err(ConfigError::DimensionMismatch(format!("expected [A, R], got {shape:?}")).into());
    };
    if *r == 0 {
        return Err(ConfigError::EmptyReduction.into());
    }
    let group_factor = (*a).min(MAX_GROUP_FACTOR as usize).max(1) as u32;
    let buffer_num = engine.config().buffer_num;
    // one input stream double-buffered plus the work slot
    let units = group_factor as usize * (buffer_num + 1);
    let tile_factor = engine.tile_for::<T>(units, *r as u64)?;
    Ok(TilingConfig::plan(*r as u64, *a as u64, max_cores, tile_factor, group_factor)?)
}

/// Reduce every row of `input` with `op`.
///
/// # Errors
///
/// Returns [`KernelError::ArgumentMismatch`] if `tiling` does not describe
/// `input`, plus any configuration or transfer error of the launch.
pub fn reduce_rows<T, C>(
    engine: &TiledEngine,
    input: &GlobalTensor<T>,
    op: C,
    tiling: &TilingConfig,
) -> Result<Vec<T>, KernelError>
where
    T: Element,
    C: Combine<T>,
{
    let kernel = AxisReduce::new(input, op)?;
    let shape = input.shape();
    if tiling.groups != shape[0] as u64 || tiling.total != shape[1] as u64 {
        return Err(KernelError::ArgumentMismatch(format!(
            "tiling describes [{}, {}], tensor is {shape:?}",
            tiling.groups, tiling.total
        )));
    }
    if tiling.total == 0 {
        return Err(ConfigError::EmptyReduction.into());
    }
    debug!(op = kernel.op().name(), rows = shape[0], len = shape[1], "axis reduction");
    let mut out = engine.launch_reduce(&kernel, tiling)?;
    Ok(out.values.swap_remove(0))
}
