//! Cross-core workspace.
//!
//! `num_arrays` parallel arrays of `num_cores * a_dim_aligned` elements.
//! Array `j` starts at `j * num_cores * a_dim_aligned`; core `c` owns
//! `[c * a_dim_aligned, (c + 1) * a_dim_aligned)` of every array. Cores only
//! ever receive mutable views of their own slices, so per-core writes cannot
//! race; the designated core reads whole columns after the barrier.

use crate::error::ConfigError;
use crate::types::Element;

/// Alignment of each core's slice, in bytes.
pub const WORKSPACE_ALIGN_BYTES: usize = 32;

/// Shared scratch memory for cross-core partial results.
#[derive(Debug, Clone)]
pub struct Workspace<T> {
    data: Vec<T>,
    num_arrays: usize,
    num_cores: usize,
    a_dim: usize,
    a_dim_aligned: usize,
}

/// A core's view of its slice of every workspace array.
#[derive(Debug)]
pub struct CoreSlices<'a, T> {
    /// Owning core.
    pub core: usize,
    /// One slice of `a_dim_aligned` elements per array.
    pub arrays: Vec<&'a mut [T]>,
}

impl<T: Element> Workspace<T> {
    /// Allocate a zeroed workspace for `a_dim` values per core and array.
    pub fn new(num_arrays: usize, num_cores: usize, a_dim: usize) -> Self {
        let a_dim_aligned = Self::aligned_dim(a_dim);
        Self {
            data: vec![T::ZERO; num_arrays * num_cores * a_dim_aligned],
            num_arrays,
            num_cores,
            a_dim,
            a_dim_aligned,
        }
    }

    /// Wrap a caller-allocated buffer.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::DimensionMismatch`] if `data` is shorter than
    /// [`required_len`](Self::required_len).
    pub fn from_vec(
        data: Vec<T>,
        num_arrays: usize,
        num_cores: usize,
        a_dim: usize,
    ) -> Result<Self, ConfigError> {
        let need = Self::required_len(num_arrays, num_cores, a_dim);
        if data.len() < need {
            return Err(ConfigError::DimensionMismatch(format!(
                "workspace needs {need} elements, got {}",
                data.len()
            )));
        }
        Ok(Self {
            data,
            num_arrays,
            num_cores,
            a_dim,
            a_dim_aligned: Self::aligned_dim(a_dim),
        })
    }

    /// Elements needed for the given layout.
    pub fn required_len(num_arrays: usize, num_cores: usize, a_dim: usize) -> usize {
        num_arrays * num_cores * Self::aligned_dim(a_dim)
    }

    fn aligned_dim(a_dim: usize) -> usize {
        let per_block = (WORKSPACE_ALIGN_BYTES / std::mem::size_of::<T>()).max(1);
        a_dim.div_ceil(per_block) * per_block
    }

    /// Number of arrays.
    pub fn num_arrays(&self) -> usize {
        self.num_arrays
    }

    /// Number of cores.
    pub fn num_cores(&self) -> usize {
        self.num_cores
    }

    /// Logical values per core slice.
    pub fn a_dim(&self) -> usize {
        self.a_dim
    }

    /// Per-core stride in elements.
    pub fn a_dim_aligned(&self) -> usize {
        self.a_dim_aligned
    }

    /// Start of array `j`.
    pub fn array_offset(&self, j: usize) -> usize {
        j * self.num_cores * self.a_dim_aligned
    }

    /// Start of core `c`'s slice of array `j`.
    pub fn slice_offset(&self, j: usize, c: usize) -> usize {
        self.array_offset(j) + c * self.a_dim_aligned
    }

    /// Core `c`'s slice of array `j` (`a_dim` elements).
    pub fn slice(&self, j: usize, c: usize) -> &[T] {
        let at = self.slice_offset(j, c);
        &self.data[at..at + self.a_dim]
    }

    /// Raw backing buffer.
    pub fn as_slice(&self) -> &[T] {
        &self.data
    }

    /// Split into disjoint per-core views for the parallel stage.
    pub fn core_slices_mut(&mut self) -> Vec<CoreSlices<'_, T>> {
        let mut views: Vec<CoreSlices<'_, T>> = (0..self.num_cores)
            .map(|core| CoreSlices {
                core,
                arrays: Vec::with_capacity(self.num_arrays),
            })
            .collect();
        let stride = self.num_cores * self.a_dim_aligned;
        if stride == 0 {
            // no groups: every core still sees one (empty) slice per array
            for view in views.iter_mut() {
                view.arrays.resize_with(self.num_arrays, Default::default);
            }
            return views;
        }
        let a_dim_aligned = self.a_dim_aligned;
        for array in self.data.chunks_mut(stride).take(self.num_arrays) {
            for (view, slice) in views.iter_mut().zip(array.chunks_mut(a_dim_aligned)) {
                view.arrays.push(slice);
            }
        }
        views
    }

    /// Gather element `g` of array `j` across every core into `out`.
    pub fn column(&self, j: usize, g: usize, out: &mut [T]) {
        for (c, o) in out.iter_mut().take(self.num_cores).enumerate() {
            *o = self.data[self.slice_offset(j, c) + g];
        }
    }
}
