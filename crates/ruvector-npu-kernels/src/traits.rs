//! Capability traits consumed by the tiled engine.
//!
//! A kernel variant is the composition of a [`Combine`] operator (how two
//! partials merge, how the total is finalized) with a [`ReduceKernel`] or
//! [`MapKernel`] that knows how to load its tiles and turn loaded data into
//! partials or outputs. Per-dtype behaviour lives in
//! [`Element`](crate::types::Element); per-layout behaviour lives in the
//! kernel's `load`.

use std::cmp::Ordering;
use std::ops::Range;

use crate::error::KernelError;
use crate::reducer::BinaryTreeReducer;
use crate::types::{Element, TileDescriptor};

// ---------------------------------------------------------------------------
// Combine
// ---------------------------------------------------------------------------

/// Associative binary operator with an identity.
pub trait Combine<T: Element>: Send + Sync {
    /// Identity element; also the pad value of gathers for this operator.
    fn identity(&self) -> T;

    /// Merge two partials.
    fn combine(&self, a: T, b: T) -> T;

    /// Turn the fully combined value of `count` elements into the result.
    fn finalize(&self, acc: T, _count: u64) -> T {
        acc
    }

    /// Short operator name for logs.
    fn name(&self) -> &'static str;
}

#[inline]
fn is_nan<T: PartialOrd>(v: T) -> bool {
    v.partial_cmp(&v).is_none()
}

/// Summation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Sum;

/// Maximum.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Max;

/// Minimum.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Min;

/// Arithmetic mean: a sum finalized by the element count.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Mean;

impl<T: Element> Combine<T> for Sum {
    #[inline]
    fn identity(&self) -> T {
        T::ZERO
    }
    #[inline]
    fn combine(&self, a: T, b: T) -> T {
        a + b
    }
    fn name(&self) -> &'static str {
        "sum"
    }
}

impl<T: Element> Combine<T> for Max {
    #[inline]
    fn identity(&self) -> T {
        T::LOWEST
    }
    #[inline]
    fn combine(&self, a: T, b: T) -> T {
        // NaN wins so a poisoned window is not silently hidden.
        match a.partial_cmp(&b) {
            Some(Ordering::Less) => b,
            Some(_) => a,
            None if is_nan(a) => a,
            None => b,
        }
    }
    fn name(&self) -> &'static str {
        "max"
    }
}

impl<T: Element> Combine<T> for Min {
    #[inline]
    fn identity(&self) -> T {
        T::HIGHEST
    }
    #[inline]
    fn combine(&self, a: T, b: T) -> T {
        match a.partial_cmp(&b) {
            Some(Ordering::Greater) => b,
            Some(_) => a,
            None if is_nan(a) => a,
            None => b,
        }
    }
    fn name(&self) -> &'static str {
        "min"
    }
}

impl<T: Element> Combine<T> for Mean {
    #[inline]
    fn identity(&self) -> T {
        T::ZERO
    }
    #[inline]
    fn combine(&self, a: T, b: T) -> T {
        a + b
    }
    fn finalize(&self, acc: T, count: u64) -> T {
        if count == 0 {
            acc
        } else {
            acc / T::from_f64(count as f64)
        }
    }
    fn name(&self) -> &'static str {
        "mean"
    }
}

// ---------------------------------------------------------------------------
// ReduceKernel
// ---------------------------------------------------------------------------

/// A reduction of a `[groups, total]` index space down to one value per
/// output per group.
///
/// The engine drives the kernel tile by tile: for each input stream it
/// issues [`load`](Self::load) into a scratch slot laid out as
/// `groups.len()` rows of `tile.length` elements, then hands the loaded
/// slots to [`partials`](Self::partials).
pub trait ReduceKernel<T: Element>: Sync {
    /// Operator used for every merge of this kernel's partials.
    type Op: Combine<T>;

    /// The kernel's combine operator.
    fn op(&self) -> &Self::Op;

    /// Names of the input streams, one transfer queue each.
    fn input_streams(&self) -> &'static [&'static str];

    /// Number of independent outputs per group.
    fn outputs(&self) -> usize {
        1
    }

    /// Copy the tile of `stream` for `groups` into `dst`
    /// (`groups.len() * tile.length` elements, group-major).
    ///
    /// # Errors
    ///
    /// Returns [`KernelError::TransferFault`] if the source run is invalid.
    fn load(
        &self,
        stream: usize,
        groups: Range<usize>,
        tile: &TileDescriptor,
        dst: &mut [T],
    ) -> Result<(), KernelError>;

    /// Reduce one loaded tile into `out[output][group - groups.start]`.
    ///
    /// `work` is an intermediate scratch slot of the same size as an input
    /// slot.
    ///
    /// # Errors
    ///
    /// Propagates reducer errors.
    fn partials(
        &self,
        inputs: &[&[T]],
        groups: Range<usize>,
        tile: &TileDescriptor,
        reducer: &BinaryTreeReducer,
        work: &mut [T],
        out: &mut [Vec<T>],
    ) -> Result<(), KernelError>;

    /// Final per-group value of `output` after every core has been merged.
    fn finalize(&self, _output: usize, _group: usize, acc: T, total: u64) -> T {
        self.op().finalize(acc, total)
    }
}

// ---------------------------------------------------------------------------
// MapKernel / TileSink
// ---------------------------------------------------------------------------

/// A streaming kernel producing one output element per index of a flat
/// `total` index space.
pub trait MapKernel<T: Element>: Sync {
    /// Names of the input streams.
    fn input_streams(&self) -> &'static [&'static str];

    /// Name of the output stream.
    fn output_stream(&self) -> &'static str {
        "out"
    }

    /// Elements of `stream` needed for one tile of `tile_len` outputs.
    fn input_len(&self, _stream: usize, tile_len: usize) -> usize {
        tile_len
    }

    /// Copy the inputs of `tile` for `stream` into `dst`.
    ///
    /// # Errors
    ///
    /// Returns [`KernelError::TransferFault`] if the source run is invalid.
    fn load(&self, stream: usize, tile: &TileDescriptor, dst: &mut [T]) -> Result<(), KernelError>;

    /// Produce `tile.length` outputs from the loaded inputs.
    ///
    /// # Errors
    ///
    /// Propagates reducer errors.
    fn compute(
        &self,
        inputs: &[&[T]],
        tile: &TileDescriptor,
        reducer: &BinaryTreeReducer,
        out: &mut [T],
    ) -> Result<(), KernelError>;
}

/// Destination of a map kernel's stores.
pub trait TileSink<T: Element> {
    /// Write the outputs of `tile`.
    ///
    /// # Errors
    ///
    /// Returns [`KernelError::TransferFault`] if the tile falls outside the
    /// sink.
    fn store(&mut self, tile: &TileDescriptor, data: &[T]) -> Result<(), KernelError>;
}

/// A [`TileSink`] over a core's slice of a flat output buffer.
#[derive(Debug)]
pub struct SliceSink<'a, T> {
    base: u64,
    dst: &'a mut [T],
}

impl<'a, T> SliceSink<'a, T> {
    /// Sink covering global indices `[base, base + dst.len())`.
    pub fn new(base: u64, dst: &'a mut [T]) -> Self {
        Self { base, dst }
    }
}

impl<T: Element> TileSink<T> for SliceSink<'_, T> {
    fn store(&mut self, tile: &TileDescriptor, data: &[T]) -> Result<(), KernelError> {
        let start = tile.offset.checked_sub(self.base).map(|s| s as usize);
        match start {
            Some(start) if start + data.len() <= self.dst.len() => {
                self.dst[start..start + data.len()].copy_from_slice(data);
                Ok(())
            }
            _ => Err(KernelError::TransferFault {
                stream: "out",
                tile_offset: tile.offset,
                detail: format!(
                    "store of {} elements outside sink [{}, {})",
                    data.len(),
                    self.base,
                    self.base + self.dst.len() as u64
                ),
            }),
        }
    }
}
