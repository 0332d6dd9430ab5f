//! 3-D max and average pooling over NCDHW tensors.
//!
//! The output index space `N * C * Do * Ho * Wo` is split across cores and
//! tiled. For every output in a tile the kernel gathers its window into the
//! scratch slot with copy-pad semantics (out-of-bounds taps take the
//! operator's pad value), then the binary-tree reducer folds each window.
//! Average pooling divides by `divisor_override`, or by the window volume
//! with or without the padded taps.

use std::sync::atomic::{AtomicI64, Ordering};

use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::config::TilingConfig;
use crate::engine::{CoreReport, TiledEngine};
use crate::error::{ConfigError, KernelError};
use crate::reducer::BinaryTreeReducer;
use crate::traits::{Combine, MapKernel, Max, Sum};
use crate::types::{Element, GlobalTensor, TileDescriptor};

/// Pooling reduction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PoolMode {
    /// Window maximum.
    Max,
    /// Window average.
    Avg,
}

/// Window geometry and averaging policy, per `[D, H, W]` axis.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pool3dParams {
    /// Window extent.
    pub kernel: [usize; 3],
    /// Window step.
    pub stride: [usize; 3],
    /// Padding before the first element (front, top, left).
    pub pad_front: [usize; 3],
    /// Padding after the last element (back, bottom, right).
    pub pad_back: [usize; 3],
    /// Tap spacing. Max pooling only.
    pub dilation: [usize; 3],
    /// Round the output extent up instead of down.
    pub ceil_mode: bool,
    /// Count padded taps in the average divisor.
    pub count_include_pad: bool,
    /// Fixed average divisor.
    pub divisor_override: Option<i64>,
}

impl Pool3dParams {
    /// Window of `kernel` with stride equal to the kernel, no padding.
    pub fn new(kernel: [usize; 3]) -> Self {
        Self {
            kernel,
            stride: kernel,
            pad_front: [0; 3],
            pad_back: [0; 3],
            dilation: [1; 3],
            ceil_mode: false,
            count_include_pad: true,
            divisor_override: None,
        }
    }

    /// Builder-style stride.
    pub fn with_stride(mut self, stride: [usize; 3]) -> Self {
        self.stride = stride;
        self
    }

    /// Builder-style symmetric padding.
    pub fn with_padding(mut self, pad: [usize; 3]) -> Self {
        self.pad_front = pad;
        self.pad_back = pad;
        self
    }

    /// Builder-style dilation.
    pub fn with_dilation(mut self, dilation: [usize; 3]) -> Self {
        self.dilation = dilation;
        self
    }

    /// Builder-style ceil mode.
    pub fn with_ceil_mode(mut self, ceil_mode: bool) -> Self {
        self.ceil_mode = ceil_mode;
        self
    }

    /// Taps per window.
    pub fn window_volume(&self) -> usize {
        self.kernel.iter().product()
    }

    /// Validate against `mode` and an NCDHW `input` shape and return the
    /// NCDHW output shape.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::ParameterOutOfRange`] for zero kernels,
    /// strides or dilations, padding wider than half the kernel, dilation
    /// with average pooling, a zero divisor override, or a window larger
    /// than the padded input; [`ConfigError::DimensionMismatch`] for a
    /// non-5-D input.
    pub fn output_shape(&self, mode: PoolMode, input: &[usize]) -> Result<[usize; 5], ConfigError> {
        let [n, c, d, h, w] = input else {
            return Err(ConfigError::DimensionMismatch(format!(
                "pooling expects [N, C, D, H, W], got {input:?}"
            )));
        };
        if self.divisor_override == Some(0) {
            return Err(out_of_range("divisor_override", 0, "non-zero"));
        }
        let extent = [*d, *h, *w];
        let mut out = [0usize; 3];
        for axis in 0..3 {
            let (k, s, dil) = (self.kernel[axis], self.stride[axis], self.dilation[axis]);
            let (pf, pb) = (self.pad_front[axis], self.pad_back[axis]);
            if k == 0 || s == 0 || dil == 0 {
                return Err(out_of_range("kernel/stride/dilation", 0, "> 0"));
            }
            if mode == PoolMode::Avg && dil != 1 {
                return Err(out_of_range("dilation", dil, "1 for average pooling"));
            }
            if pf > k / 2 || pb > k / 2 {
                return Err(out_of_range("padding", pf.max(pb), format!("<= kernel / 2 ({})", k / 2)));
            }
            let span = dil * (k - 1) + 1;
            let padded = extent[axis] + pf + pb;
            if padded < span {
                return Err(out_of_range("kernel", span, format!("<= padded input ({padded})")));
            }
            let round = if self.ceil_mode { s - 1 } else { 0 };
            let mut o = (padded - span + round) / s + 1;
            // the last window must start inside the input or front padding
            if self.ceil_mode && (o - 1) * s >= extent[axis] + pf {
                o -= 1;
            }
            out[axis] = o;
        }
        Ok([*n, *c, out[0], out[1], out[2]])
    }
}

fn out_of_range(name: &str, value: impl ToString, expected: impl Into<String>) -> ConfigError {
    ConfigError::ParameterOutOfRange {
        name: name.into(),
        value: value.to_string(),
        expected: expected.into(),
    }
}

/// Pooled values, and argmax indices for max pooling with indices.
#[derive(Debug, Clone)]
pub struct Pool3dOutput<T> {
    /// NCDHW output.
    pub values: GlobalTensor<T>,
    /// Flat `d * H * W + h * W + w` position of each maximum within its
    /// input plane.
    pub indices: Option<Vec<i64>>,
    /// Per-core reports.
    pub reports: Vec<CoreReport>,
}

// ---------------------------------------------------------------------------
// Window geometry
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct Geometry {
    input: [usize; 5],
    output: [usize; 5],
    params: Pool3dParams,
}

impl Geometry {
    /// `(n, c, [od, oh, ow])` of flat output index `o`.
    fn unravel(&self, o: usize) -> (usize, usize, [usize; 3]) {
        let [_, c, od, oh, ow] = self.output;
        let w = o % ow;
        let h = (o / ow) % oh;
        let d = (o / (ow * oh)) % od;
        let ch = (o / (ow * oh * od)) % c;
        let n = o / (ow * oh * od * c);
        (n, ch, [d, h, w])
    }

    /// First input coordinate of the window along `axis` (may be negative).
    fn start(&self, axis: usize, out: usize) -> isize {
        (out * self.params.stride[axis]) as isize - self.params.pad_front[axis] as isize
    }

    /// Input coordinate of tap `t` along `axis`; only valid for taps in
    /// [`valid_taps`](Self::valid_taps).
    fn tap(&self, axis: usize, out: usize, t: usize) -> usize {
        (self.start(axis, out) + (t * self.params.dilation[axis]) as isize) as usize
    }

    /// Range of kernel taps along `axis` that land inside the input.
    fn valid_taps(&self, axis: usize, out: usize) -> std::ops::Range<usize> {
        let start = self.start(axis, out);
        let dil = self.params.dilation[axis] as isize;
        let extent = self.input[2 + axis] as isize;
        let k = self.params.kernel[axis];
        let lo = (0..k).find(|&t| start + t as isize * dil >= 0).unwrap_or(k);
        let hi = (lo..k).find(|&t| start + t as isize * dil >= extent).unwrap_or(k);
        lo..hi
    }

    /// Average divisor of the window at `pos`.
    fn divisor(&self, pos: [usize; 3]) -> f64 {
        if let Some(d) = self.params.divisor_override {
            return d as f64;
        }
        let mut size = 1isize;
        for (axis, &p) in pos.iter().enumerate() {
            let extent = self.input[2 + axis] as isize;
            let start = self.start(axis, p);
            let end = start + self.params.kernel[axis] as isize;
            size *= if self.params.count_include_pad {
                end.min(extent + self.params.pad_back[axis] as isize) - start
            } else {
                end.min(extent) - start.max(0)
            };
        }
        size.max(1) as f64
    }
}

// ---------------------------------------------------------------------------
// Kernel
// ---------------------------------------------------------------------------

struct PoolKernel<'a, T> {
    input: &'a GlobalTensor<T>,
    geom: Geometry,
    mode: PoolMode,
    /// Argmax of every output, written by `compute` when requested. Each
    /// slot belongs to exactly one tile.
    indices: Option<Vec<AtomicI64>>,
}

impl<T: Element> PoolKernel<'_, T> {
    fn pad_value(&self) -> T {
        match self.mode {
            PoolMode::Max => Combine::<T>::identity(&Max),
            PoolMode::Avg => Combine::<T>::identity(&Sum),
        }
    }

    /// Copy-pad the window of output `o` into `dst` (`kD * kH * kW` taps).
    fn gather(&self, o: usize, dst: &mut [T]) -> Result<(), KernelError> {
        let (n, ch, pos) = self.geom.unravel(o);
        let p = &self.geom.params;
        let view = self.input.view();
        let [_, kh, kw] = p.kernel;
        dst.fill(self.pad_value());

        let (vd, vh, vw) = (
            self.geom.valid_taps(0, pos[0]),
            self.geom.valid_taps(1, pos[1]),
            self.geom.valid_taps(2, pos[2]),
        );
        if vw.is_empty() {
            return Ok(());
        }
        let base = view.offset + n * view.strides[0] + ch * view.strides[1];
        for td in vd {
            let id = self.geom.tap(0, pos[0], td);
            for th in vh.clone() {
                let ih = self.geom.tap(1, pos[1], th);
                let iw = self.geom.tap(2, pos[2], vw.start);
                let at = base + id * view.strides[2] + ih * view.strides[3] + iw * view.strides[4];
                let row = (td * kh + th) * kw;
                self.input.read_run(
                    "x",
                    at,
                    p.dilation[2] * view.strides[4],
                    &mut dst[row + vw.start..row + vw.end],
                )?;
            }
        }
        Ok(())
    }

    /// Flat `d * H * W + h * W + w` position of the first maximum in the
    /// gathered `window` of output `o`, scanning in `d, h, w` order. Pad
    /// taps never win and a NaN tap beats any number. `-1` when the window
    /// has no tap inside the input.
    fn window_argmax(&self, o: usize, window: &[T]) -> i64 {
        let (_, _, pos) = self.geom.unravel(o);
        let [_, _, _, h_in, w_in] = self.geom.input;
        let [_, kh, kw] = self.geom.params.kernel;
        let vw = self.geom.valid_taps(2, pos[2]);
        let is_nan = |v: T| v.partial_cmp(&v).is_none();

        let mut best: Option<(T, i64)> = None;
        for td in self.geom.valid_taps(0, pos[0]) {
            let id = self.geom.tap(0, pos[0], td);
            for th in self.geom.valid_taps(1, pos[1]) {
                let ih = self.geom.tap(1, pos[1], th);
                for tw in vw.clone() {
                    let iw = self.geom.tap(2, pos[2], tw);
                    let v = window[(td * kh + th) * kw + tw];
                    let take = match best {
                        None => true,
                        Some((b, _)) => v > b || (is_nan(v) && !is_nan(b)),
                    };
                    if take {
                        best = Some((v, (id * h_in * w_in + ih * w_in + iw) as i64));
                    }
                }
            }
        }
        best.map_or(-1, |(_, i)| i)
    }
}

impl<T: Element> MapKernel<T> for PoolKernel<'_, T> {
    fn input_streams(&self) -> &'static [&'static str] {
        &["window"]
    }

    fn output_stream(&self) -> &'static str {
        "y"
    }

    fn input_len(&self, _stream: usize, tile_len: usize) -> usize {
        tile_len * self.geom.params.window_volume()
    }

    fn load(&self, _stream: usize, tile: &TileDescriptor, dst: &mut [T]) -> Result<(), KernelError> {
        let vol = self.geom.params.window_volume();
        for (k, window) in dst.chunks_exact_mut(vol).enumerate() {
            self.gather(tile.offset as usize + k, window)?;
        }
        Ok(())
    }

    fn compute(
        &self,
        inputs: &[&[T]],
        tile: &TileDescriptor,
        reducer: &BinaryTreeReducer,
        out: &mut [T],
    ) -> Result<(), KernelError> {
        let vol = self.geom.params.window_volume();
        let len = tile.length as usize;
        match self.mode {
            PoolMode::Max => {
                reducer.reduce_groups(&Max, inputs[0], vol, vol, len, out)?;
                if let Some(indices) = &self.indices {
                    for (k, window) in inputs[0].chunks_exact(vol).take(len).enumerate() {
                        let o = tile.offset as usize + k;
                        indices[o].store(self.window_argmax(o, window), Ordering::Relaxed);
                    }
                }
            }
            PoolMode::Avg => {
                reducer.reduce_groups(&Sum, inputs[0], vol, vol, len, out)?;
                for (k, o) in out.iter_mut().enumerate() {
                    let (_, _, pos) = self.geom.unravel(tile.offset as usize + k);
                    *o = *o / T::from_f64(self.geom.divisor(pos));
                }
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Entry points
// ---------------------------------------------------------------------------

/// Tiling for pooling `input_shape` with `params` on up to `max_cores`.
///
/// # Errors
///
/// Returns [`KernelError::InvalidConfig`] for invalid parameters or a
/// scratch budget too small for one window.
pub fn plan_pool3d<T: Element>(
    engine: &TiledEngine,
    mode: PoolMode,
    input_shape: &[usize],
    params: &Pool3dParams,
    max_cores: u32,
) -> Result<TilingConfig, KernelError> {
    let output = params.output_shape(mode, input_shape)?;
    let total: usize = output.iter().product();
    let buffer_num = engine.config().buffer_num;
    // window slots plus output slots, per output element
    let units = buffer_num * (params.window_volume() + 1);
    let tile = engine.tile_for::<T>(units, total as u64)?;
    Ok(TilingConfig::plan(total as u64, 1, max_cores, tile, 1)?)
}

/// Pool `input` with `params`.
///
/// # Errors
///
/// Returns [`KernelError::InvalidConfig`] for invalid parameters,
/// [`KernelError::ArgumentMismatch`] if `tiling` does not cover the output,
/// and any error of the launch.
#[instrument(skip(engine, input, params, tiling), fields(shape = ?input.shape()))]
pub fn pool3d<T: Element>(
    engine: &TiledEngine,
    mode: PoolMode,
    input: &GlobalTensor<T>,
    params: &Pool3dParams,
    tiling: &TilingConfig,
) -> Result<Pool3dOutput<T>, KernelError> {
    run_pool(engine, mode, input, params, tiling, false)
}

/// Max pooling that also returns the argmax of every window.
///
/// Values and indices come out of the same pass over each gathered window.
/// The index is the first position holding the maximum, in `d, h, w`
/// scan order; a NaN tap counts as the maximum.
///
/// # Errors
///
/// See [`pool3d`].
#[instrument(skip(engine, input, params, tiling), fields(shape = ?input.shape()))]
pub fn max_pool3d_with_indices<T: Element>(
    engine: &TiledEngine,
    input: &GlobalTensor<T>,
    params: &Pool3dParams,
    tiling: &TilingConfig,
) -> Result<Pool3dOutput<T>, KernelError> {
    run_pool(engine, PoolMode::Max, input, params, tiling, true)
}

fn run_pool<T: Element>(
    engine: &TiledEngine,
    mode: PoolMode,
    input: &GlobalTensor<T>,
    params: &Pool3dParams,
    tiling: &TilingConfig,
    with_indices: bool,
) -> Result<Pool3dOutput<T>, KernelError> {
    let output = params.output_shape(mode, input.shape())?;
    let total: usize = output.iter().product();
    if tiling.total != total as u64 {
        return Err(KernelError::ArgumentMismatch(format!(
            "tiling covers {} outputs, pooling produces {total}",
            tiling.total
        )));
    }
    let mut input_shape = [0usize; 5];
    input_shape.copy_from_slice(input.shape());
    let kernel = PoolKernel {
        input,
        geom: Geometry {
            input: input_shape,
            output,
            params: params.clone(),
        },
        mode,
        indices: with_indices.then(|| (0..total).map(|_| AtomicI64::new(-1)).collect()),
    };
    debug!(?mode, ?output, window = params.window_volume(), with_indices, "pool3d launch");
    let mapped = engine.launch_map(&kernel, tiling)?;
    Ok(Pool3dOutput {
        values: GlobalTensor::from_vec(&output, mapped.values)?,
        indices: kernel
            .indices
            .map(|v| v.into_iter().map(AtomicI64::into_inner).collect()),
        reports: mapped.reports,
    })
}
