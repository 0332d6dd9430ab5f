//! Core data types shared by every kernel stage.
//!
//! Provides the [`Element`] numeric adapter, the [`TileDescriptor`] unit of
//! work, and [`TensorView`] / [`GlobalTensor`] for strided tensors living in
//! global memory.

use std::fmt::Debug;
use std::ops::{Add, Div, Mul, Sub};

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, KernelError};

// ---------------------------------------------------------------------------
// Element
// ---------------------------------------------------------------------------

/// Numeric element type the kernels can stream and reduce.
///
/// This is the per-dtype adapter: everything dtype-specific (identity
/// values, conversions used for divisors) lives here so that the engine is
/// written once.
pub trait Element:
    Copy
    + Debug
    + Default
    + PartialOrd
    + Send
    + Sync
    + Add<Output = Self>
    + Sub<Output = Self>
    + Mul<Output = Self>
    + Div<Output = Self>
    + 'static
{
    /// Additive identity.
    const ZERO: Self;
    /// Multiplicative identity.
    const ONE: Self;
    /// Smallest representable value; the pad value for max reductions.
    const LOWEST: Self;
    /// Largest representable value; the pad value for min reductions.
    const HIGHEST: Self;

    /// Lossy conversion from `f64`.
    fn from_f64(v: f64) -> Self;
    /// Widening conversion to `f64`.
    fn to_f64(self) -> f64;
}

impl Element for f32 {
    const ZERO: Self = 0.0;
    const ONE: Self = 1.0;
    const LOWEST: Self = f32::NEG_INFINITY;
    const HIGHEST: Self = f32::INFINITY;

    #[inline]
    fn from_f64(v: f64) -> Self {
        v as f32
    }

    #[inline]
    fn to_f64(self) -> f64 {
        self as f64
    }
}

impl Element for f64 {
    const ZERO: Self = 0.0;
    const ONE: Self = 1.0;
    const LOWEST: Self = f64::NEG_INFINITY;
    const HIGHEST: Self = f64::INFINITY;

    #[inline]
    fn from_f64(v: f64) -> Self {
        v
    }

    #[inline]
    fn to_f64(self) -> f64 {
        self
    }
}

/// Number of lanes of `T` in a vector register of `vector_bytes` bytes.
#[inline]
pub fn lanes_for<T: Element>(vector_bytes: usize) -> usize {
    (vector_bytes / std::mem::size_of::<T>()).max(1)
}

// ---------------------------------------------------------------------------
// TileDescriptor
// ---------------------------------------------------------------------------

/// One unit of work produced by the partitioner.
///
/// Lives for a single loop iteration: the transfer pipeline uses `offset`,
/// `length` and `buffer_slot`, the accumulator uses `index`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TileDescriptor {
    /// Position of this tile within its pass (0-based).
    pub index: u64,
    /// First element covered by the tile, in the coordinates of the axis
    /// being partitioned.
    pub offset: u64,
    /// Number of elements covered.
    pub length: u32,
    /// `true` for the final (possibly ragged) tile of the pass.
    pub is_last: bool,
    /// Scratch slot this tile cycles through (`index mod buffer_num`).
    pub buffer_slot: u32,
}

impl TileDescriptor {
    /// One past the last element covered.
    #[inline]
    pub fn end(&self) -> u64 {
        self.offset + self.length as u64
    }

    /// The tile's element range as `usize` bounds.
    #[inline]
    pub fn range(&self) -> std::ops::Range<usize> {
        self.offset as usize..self.end() as usize
    }
}

// ---------------------------------------------------------------------------
// TensorView
// ---------------------------------------------------------------------------

/// Shape and strides of an N-dimensional tensor over a flat storage buffer.
///
/// The view may be non-contiguous. Indices are in elements, not bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TensorView {
    /// Storage index of element `[0, 0, ..., 0]`.
    pub offset: usize,
    /// Extent of each dimension.
    pub shape: Vec<usize>,
    /// Storage step of each dimension.
    pub strides: Vec<usize>,
}

impl TensorView {
    /// Row-major contiguous view starting at storage index 0.
    pub fn contiguous(shape: &[usize]) -> Self {
        let mut strides = vec![1usize; shape.len()];
        for d in (0..shape.len().saturating_sub(1)).rev() {
            strides[d] = strides[d + 1] * shape[d + 1];
        }
        Self {
            offset: 0,
            shape: shape.to_vec(),
            strides,
        }
    }

    /// Arbitrary strided view.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::DimensionMismatch`] if `shape` and `strides`
    /// have different ranks.
    pub fn strided(offset: usize, shape: &[usize], strides: &[usize]) -> Result<Self, ConfigError> {
        if shape.len() != strides.len() {
            return Err(ConfigError::DimensionMismatch(format!(
                "shape rank {} does not match strides rank {}",
                shape.len(),
                strides.len(),
            )));
        }
        Ok(Self {
            offset,
            shape: shape.to_vec(),
            strides: strides.to_vec(),
        })
    }

    /// Number of dimensions.
    #[inline]
    pub fn ndim(&self) -> usize {
        self.shape.len()
    }

    /// Total number of logical elements.
    #[inline]
    pub fn numel(&self) -> usize {
        self.shape.iter().product()
    }

    /// `true` if the view is row-major contiguous.
    pub fn is_contiguous(&self) -> bool {
        let mut expected = 1usize;
        for d in (0..self.ndim()).rev() {
            if self.shape[d] > 1 && self.strides[d] != expected {
                return false;
            }
            expected *= self.shape[d];
        }
        true
    }

    /// Minimum storage length required to back this view.
    pub fn required_len(&self) -> usize {
        if self.shape.iter().any(|&s| s == 0) {
            return self.offset;
        }
        self.offset
            + self
                .shape
                .iter()
                .zip(&self.strides)
                .map(|(&s, &st)| (s - 1) * st)
                .sum::<usize>()
            + 1
    }

    /// Storage index of a logical multi-index, or `None` if out of bounds.
    pub fn linear_index(&self, index: &[usize]) -> Option<usize> {
        if index.len() != self.ndim() {
            return None;
        }
        let mut at = self.offset;
        for ((&i, &s), &st) in index.iter().zip(&self.shape).zip(&self.strides) {
            if i >= s {
                return None;
            }
            at += i * st;
        }
        Some(at)
    }
}

// ---------------------------------------------------------------------------
// GlobalTensor
// ---------------------------------------------------------------------------

/// A tensor in global memory: a caller-owned storage buffer plus its view.
///
/// The kernels only ever read and write through bounds-checked runs, the
/// software analogue of a DMA descriptor.
#[derive(Debug, Clone)]
pub struct GlobalTensor<T> {
    data: Vec<T>,
    view: TensorView,
}

impl<T: Element> GlobalTensor<T> {
    /// Wrap a row-major contiguous buffer.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::DimensionMismatch`] if `data.len()` does not
    /// equal the product of `shape`.
    pub fn from_vec(shape: &[usize], data: Vec<T>) -> Result<Self, ConfigError> {
        let view = TensorView::contiguous(shape);
        if view.numel() != data.len() {
            return Err(ConfigError::DimensionMismatch(format!(
                "shape {:?} holds {} elements but buffer has {}",
                shape,
                view.numel(),
                data.len(),
            )));
        }
        Ok(Self { data, view })
    }

    /// Wrap a buffer with an explicit (possibly strided) view.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::DimensionMismatch`] if the view reaches past
    /// the end of `data`.
    pub fn with_view(data: Vec<T>, view: TensorView) -> Result<Self, ConfigError> {
        if view.required_len() > data.len() {
            return Err(ConfigError::DimensionMismatch(format!(
                "view needs {} storage elements but buffer has {}",
                view.required_len(),
                data.len(),
            )));
        }
        Ok(Self { data, view })
    }

    /// The tensor's view.
    #[inline]
    pub fn view(&self) -> &TensorView {
        &self.view
    }

    /// Logical shape.
    #[inline]
    pub fn shape(&self) -> &[usize] {
        &self.view.shape
    }

    /// Raw storage.
    #[inline]
    pub fn storage(&self) -> &[T] {
        &self.data
    }

    /// Read one element by logical index.
    pub fn get(&self, index: &[usize]) -> Option<T> {
        self.view.linear_index(index).map(|i| self.data[i])
    }

    /// Copy `dst.len()` elements starting at storage index `start`, stepping
    /// by `stride`, into `dst`.
    ///
    /// # Errors
    ///
    /// Returns [`KernelError::TransferFault`] if the run leaves the storage
    /// buffer. The copy is not attempted in that case.
    pub fn read_run(
        &self,
        stream: &'static str,
        start: usize,
        stride: usize,
        dst: &mut [T],
    ) -> Result<(), KernelError> {
        check_run(stream, start, stride, dst.len(), self.data.len())?;
        if stride == 1 {
            dst.copy_from_slice(&self.data[start..start + dst.len()]);
        } else {
            for (i, d) in dst.iter_mut().enumerate() {
                *d = self.data[start + i * stride];
            }
        }
        Ok(())
    }

    /// Copy the logical (row-major) elements `[start, start + dst.len())`
    /// into `dst`, one innermost-dimension run at a time.
    ///
    /// # Errors
    ///
    /// Returns [`KernelError::TransferFault`] if the range exceeds the
    /// tensor.
    pub fn read_logical(&self, stream: &'static str, start: usize, dst: &mut [T]) -> Result<(), KernelError> {
        let numel = self.view.numel();
        if start + dst.len() > numel {
            return Err(KernelError::TransferFault {
                stream,
                tile_offset: start as u64,
                detail: format!("logical range of {} exceeds {numel} elements", dst.len()),
            });
        }
        if self.view.ndim() == 0 {
            if let Some(d) = dst.first_mut() {
                *d = self.data[self.view.offset];
            }
            return Ok(());
        }
        let inner = self.view.ndim() - 1;
        let inner_len = self.view.shape[inner];
        let inner_stride = self.view.strides[inner];
        let mut index = vec![0usize; self.view.ndim()];
        let mut done = 0;
        while done < dst.len() {
            let mut rem = start + done;
            for d in (0..self.view.ndim()).rev() {
                index[d] = rem % self.view.shape[d];
                rem /= self.view.shape[d];
            }
            let seg = (inner_len - index[inner]).min(dst.len() - done);
            let at = self
                .view
                .linear_index(&index)
                .ok_or_else(|| KernelError::TransferFault {
                    stream,
                    tile_offset: (start + done) as u64,
                    detail: "index outside view".into(),
                })?;
            self.read_run(stream, at, inner_stride, &mut dst[done..done + seg])?;
            done += seg;
        }
        Ok(())
    }
}

fn check_run(
    stream: &'static str,
    start: usize,
    stride: usize,
    len: usize,
    storage_len: usize,
) -> Result<(), KernelError> {
    if len == 0 {
        return Ok(());
    }
    let last = stride
        .checked_mul(len - 1)
        .and_then(|span| span.checked_add(start));
    match last {
        Some(last) if last < storage_len => Ok(()),
        _ => Err(KernelError::TransferFault {
            stream,
            tile_offset: start as u64,
            detail: format!(
                "run of {len} elements with stride {stride} exceeds storage of {storage_len}"
            ),
        }),
    }
}
