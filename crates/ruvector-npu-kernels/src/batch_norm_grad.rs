//! Batch-norm backward on an `[N, C, L]` tensor.
//!
//! Training mode runs three stages, each a launch of the tiled engine:
//!
//! 1. **Channel statistics.** Each core reduces its share of the `N * L`
//!    positions for every channel into `dbeta = sum(dy)` and
//!    `dgamma = sum(dy * (x - mean) * rstd)`, merging tiles through two
//!    partial-result caches and writing the two per-core vectors into a
//!    two-array workspace.
//! 2. **Cross-core merge.** After the barrier core 0 binary-tree reduces
//!    each workspace column into the final `dbeta`, `dgamma`.
//! 3. **Input gradient.** After a second barrier every core streams its
//!    range of elements through
//!    `dx = (dy - ((x - mean) * rstd * dgamma + dbeta) / M) * rstd * gamma`
//!    with `M = N * L`.
//!
//! Inference mode normalizes with the running statistics, which do not
//! depend on the batch. `rstd = 1 / sqrt(running_var + epsilon)`, the
//! statistics stages are the same and the input gradient reduces to
//! `dx = dy * gamma * rstd`, a single-stream map.

use std::ops::Range;

use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::config::{TilingConfig, TILING_BLOB_LEN};
use crate::engine::{CoreReport, TiledEngine};
use crate::error::{ConfigError, KernelError};
use crate::reducer::BinaryTreeReducer;
use crate::reduce::MAX_GROUP_FACTOR;
use crate::traits::{MapKernel, ReduceKernel, Sum};
use crate::types::{Element, GlobalTensor, TileDescriptor};

/// Bytes of a [`BatchNormGradTiling`] blob: two tiling records and a
/// 16-byte mode trailer.
pub const BATCH_NORM_BLOB_LEN: usize = 2 * TILING_BLOB_LEN + 16;

/// Inputs of the backward pass.
#[derive(Debug, Clone, Copy)]
pub struct BatchNormGradArgs<'a, T> {
    /// Upstream gradient, `[N, C, L]`.
    pub dy: &'a GlobalTensor<T>,
    /// Forward input, `[N, C, L]`.
    pub x: &'a GlobalTensor<T>,
    /// Saved per-channel mean, `[C]`.
    pub mean: &'a [T],
    /// Saved per-channel reciprocal standard deviation, `[C]`.
    pub rstd: &'a [T],
    /// Scale, `[C]`.
    pub gamma: &'a [T],
}

/// Inputs of the inference-mode backward pass.
#[derive(Debug, Clone, Copy)]
pub struct BatchNormGradInferArgs<'a, T> {
    /// Upstream gradient, `[N, C, L]`.
    pub dy: &'a GlobalTensor<T>,
    /// Forward input, `[N, C, L]`.
    pub x: &'a GlobalTensor<T>,
    /// Running mean, `[C]`.
    pub running_mean: &'a [T],
    /// Running variance, `[C]`.
    pub running_var: &'a [T],
    /// Scale, `[C]`.
    pub gamma: &'a [T],
}

/// Outputs of the backward pass.
#[derive(Debug, Clone)]
pub struct BatchNormGradOutput<T> {
    /// Input gradient, `[N, C, L]`.
    pub dx: GlobalTensor<T>,
    /// Scale gradient, `[C]`.
    pub dgamma: Vec<T>,
    /// Shift gradient, `[C]`.
    pub dbeta: Vec<T>,
    /// Per-core reports of the statistics stage.
    pub reduce_reports: Vec<CoreReport>,
    /// Per-core reports of the gradient stage.
    pub apply_reports: Vec<CoreReport>,
}

/// Which statistics the forward pass normalized with.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum BatchNormMode {
    /// Batch statistics; `mean` and `rstd` are the saved batch values.
    Training,
    /// Running statistics, regularized by `epsilon`.
    Inference {
        /// Added to the running variance before the square root.
        epsilon: f64,
    },
}

/// Planner record for both engine launches.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchNormGradTiling {
    /// Backward formula.
    pub mode: BatchNormMode,
    /// Statistics stage: `groups = C`, `total = N * L`.
    pub reduce: TilingConfig,
    /// Gradient stage: `total = N * C * L`.
    pub apply: TilingConfig,
}

impl BatchNormGradTiling {
    /// Plan both training-mode stages for `shape = [N, C, L]`.
    ///
    /// # Errors
    ///
    /// Returns [`KernelError::InvalidConfig`] for a non-3-D shape, an empty
    /// `N * L`, or a scratch budget too small for one tile.
    pub fn plan<T: Element>(
        engine: &TiledEngine,
        shape: &[usize],
        max_cores: u32,
    ) -> Result<Self, KernelError> {
        // dy, x and dx double-buffered
        let (reduce, apply) = plan_stages::<T>(engine, shape, max_cores, 3)?;
        let divisor = reduce.total as f64;
        Ok(Self {
            mode: BatchNormMode::Training,
            reduce,
            apply: apply.with_divisor(divisor),
        })
    }

    /// Plan both inference-mode stages for `shape = [N, C, L]`.
    ///
    /// # Errors
    ///
    /// As [`plan`](Self::plan), plus [`ConfigError::ParameterOutOfRange`]
    /// for a negative or non-finite `epsilon`.
    pub fn plan_inference<T: Element>(
        engine: &TiledEngine,
        shape: &[usize],
        max_cores: u32,
        epsilon: f64,
    ) -> Result<Self, KernelError> {
        check_epsilon(epsilon)?;
        // only dy and dx stream in the gradient stage
        let (reduce, apply) = plan_stages::<T>(engine, shape, max_cores, 2)?;
        Ok(Self {
            mode: BatchNormMode::Inference { epsilon },
            reduce,
            apply,
        })
    }

    /// Encode both records followed by the mode trailer.
    ///
    /// | offset | type | field |
    /// |--------|------|-------|
    /// | 0 | [`TilingConfig`] | `reduce` |
    /// | 48 | [`TilingConfig`] | `apply` |
    /// | 96 | u32 | `1` for training, `0` for inference |
    /// | 100 | u32 | reserved |
    /// | 104 | f64 | `epsilon` (0 in training mode) |
    pub fn to_blob(&self) -> Vec<u8> {
        let (training, epsilon) = match self.mode {
            BatchNormMode::Training => (1u32, 0.0f64),
            BatchNormMode::Inference { epsilon } => (0, epsilon),
        };
        let mut out = Vec::with_capacity(BATCH_NORM_BLOB_LEN);
        out.extend_from_slice(&self.reduce.to_blob());
        out.extend_from_slice(&self.apply.to_blob());
        out.extend_from_slice(&training.to_le_bytes());
        out.extend_from_slice(&0u32.to_le_bytes());
        out.extend_from_slice(&epsilon.to_le_bytes());
        out
    }

    /// Decode the layout written by [`to_blob`](Self::to_blob).
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MalformedBlob`] if `blob` is too short or the
    /// mode flag is neither 0 nor 1.
    pub fn from_blob(blob: &[u8]) -> Result<Self, ConfigError> {
        if blob.len() < BATCH_NORM_BLOB_LEN {
            return Err(ConfigError::MalformedBlob(format!(
                "batch-norm tiling needs {BATCH_NORM_BLOB_LEN} bytes, got {}",
                blob.len()
            )));
        }
        let trailer = 2 * TILING_BLOB_LEN;
        let mut flag = [0u8; 4];
        flag.copy_from_slice(&blob[trailer..trailer + 4]);
        let mut eps = [0u8; 8];
        eps.copy_from_slice(&blob[trailer + 8..trailer + 16]);
        let mode = match u32::from_le_bytes(flag) {
            1 => BatchNormMode::Training,
            0 => BatchNormMode::Inference {
                epsilon: f64::from_le_bytes(eps),
            },
            other => {
                return Err(ConfigError::MalformedBlob(format!(
                    "batch-norm mode flag must be 0 or 1, got {other}"
                )))
            }
        };
        Ok(Self {
            mode,
            reduce: TilingConfig::from_blob(&blob[..TILING_BLOB_LEN])?,
            apply: TilingConfig::from_blob(&blob[TILING_BLOB_LEN..trailer])?,
        })
    }
}

/// Statistics and gradient records; the gradient stage streams
/// `apply_streams` slots of `buffer_num` each.
fn plan_stages<T: Element>(
    engine: &TiledEngine,
    shape: &[usize],
    max_cores: u32,
    apply_streams: usize,
) -> Result<(TilingConfig, TilingConfig), KernelError> {
    let (n, c, l) = dims(shape)?;
    if n * l == 0 {
        return Err(ConfigError::EmptyReduction.into());
    }
    let buffer_num = engine.config().buffer_num;

    let group_factor = c.min(MAX_GROUP_FACTOR as usize).max(1) as u32;
    // dy and x double-buffered plus the work slot
    let units = group_factor as usize * (2 * buffer_num + 1);
    let r = (n * l) as u64;
    let tile = engine.tile_for::<T>(units, r)?;
    let reduce = TilingConfig::plan(r, c as u64, max_cores, tile, group_factor)?;

    let total = (n * c * l) as u64;
    let tile = engine.tile_for::<T>(apply_streams * buffer_num, total)?;
    let apply = TilingConfig::plan(total, 1, max_cores, tile, 1)?;
    Ok((reduce, apply))
}

fn check_epsilon(epsilon: f64) -> Result<(), ConfigError> {
    if epsilon.is_finite() && epsilon >= 0.0 {
        Ok(())
    } else {
        Err(ConfigError::ParameterOutOfRange {
            name: "epsilon".into(),
            value: epsilon.to_string(),
            expected: "finite and >= 0".into(),
        })
    }
}

fn dims(shape: &[usize]) -> Result<(usize, usize, usize), ConfigError> {
    match shape {
        [n, c, l] => Ok((*n, *c, *l)),
        _ => Err(ConfigError::DimensionMismatch(format!(
            "batch-norm grad expects [N, C, L], got {shape:?}"
        ))),
    }
}

// ---------------------------------------------------------------------------
// Stage 0: channel statistics
// ---------------------------------------------------------------------------

/// Reduces `dy` and `dy * xhat` per channel over the `N * L` positions.
struct ChannelStats<'a, T> {
    args: BatchNormGradArgs<'a, T>,
    c: usize,
    l: usize,
}

impl<T: Element> ChannelStats<'_, T> {
    /// Copy positions `[r0, r0 + dst.len())` of channel `ch` of `t`.
    fn read_channel(
        &self,
        stream: &'static str,
        t: &GlobalTensor<T>,
        ch: usize,
        r0: usize,
        dst: &mut [T],
    ) -> Result<(), KernelError> {
        let view = t.view();
        let mut done = 0;
        while done < dst.len() {
            let r = r0 + done;
            let (n, pos) = (r / self.l, r % self.l);
            let seg = (self.l - pos).min(dst.len() - done);
            let start = view.offset + n * view.strides[0] + ch * view.strides[1] + pos * view.strides[2];
            t.read_run(stream, start, view.strides[2], &mut dst[done..done + seg])?;
            done += seg;
        }
        Ok(())
    }
}

impl<T: Element> ReduceKernel<T> for ChannelStats<'_, T> {
    type Op = Sum;

    fn op(&self) -> &Sum {
        &Sum
    }

    fn input_streams(&self) -> &'static [&'static str] {
        &["dy", "x"]
    }

    fn outputs(&self) -> usize {
        2
    }

    fn load(
        &self,
        stream: usize,
        groups: Range<usize>,
        tile: &TileDescriptor,
        dst: &mut [T],
    ) -> Result<(), KernelError> {
        let (name, t) = if stream == 0 {
            ("dy", self.args.dy)
        } else {
            ("x", self.args.x)
        };
        let len = tile.length as usize;
        for (row, ch) in groups.enumerate() {
            self.read_channel(name, t, ch, tile.offset as usize, &mut dst[row * len..(row + 1) * len])?;
        }
        Ok(())
    }

    fn partials(
        &self,
        inputs: &[&[T]],
        groups: Range<usize>,
        tile: &TileDescriptor,
        reducer: &BinaryTreeReducer,
        work: &mut [T],
        out: &mut [Vec<T>],
    ) -> Result<(), KernelError> {
        let len = tile.length as usize;
        let (dy, x) = (inputs[0], inputs[1]);
        let rows = groups.len();
        reducer.reduce_groups(&Sum, dy, len, len, rows, &mut out[0])?;

        for (row, ch) in groups.enumerate() {
            let (mean, rstd) = (self.args.mean[ch], self.args.rstd[ch]);
            let span = row * len..(row + 1) * len;
            for ((w, &g), &v) in work[span.clone()].iter_mut().zip(&dy[span.clone()]).zip(&x[span]) {
                *w = g * (v - mean) * rstd;
            }
        }
        reducer.reduce_groups(&Sum, work, len, len, rows, &mut out[1])?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Stage 2: input gradient
// ---------------------------------------------------------------------------

struct InputGrad<'a, T> {
    args: BatchNormGradArgs<'a, T>,
    dgamma: &'a [T],
    dbeta: &'a [T],
    c: usize,
    l: usize,
    inv_m: T,
}

impl<T: Element> MapKernel<T> for InputGrad<'_, T> {
    fn input_streams(&self) -> &'static [&'static str] {
        &["dy", "x"]
    }

    fn output_stream(&self) -> &'static str {
        "dx"
    }

    fn load(&self, stream: usize, tile: &TileDescriptor, dst: &mut [T]) -> Result<(), KernelError> {
        if stream == 0 {
            self.args.dy.read_logical("dy", tile.offset as usize, dst)
        } else {
            self.args.x.read_logical("x", tile.offset as usize, dst)
        }
    }

    fn compute(
        &self,
        inputs: &[&[T]],
        tile: &TileDescriptor,
        _reducer: &BinaryTreeReducer,
        out: &mut [T],
    ) -> Result<(), KernelError> {
        let (dy, x) = (inputs[0], inputs[1]);
        for (k, o) in out.iter_mut().enumerate() {
            let ch = ((tile.offset as usize + k) / self.l) % self.c;
            let a = &self.args;
            let xhat = (x[k] - a.mean[ch]) * a.rstd[ch];
            *o = (dy[k] - (xhat * self.dgamma[ch] + self.dbeta[ch]) * self.inv_m) * a.rstd[ch] * a.gamma[ch];
        }
        Ok(())
    }
}

/// Inference-mode input gradient: `dx = dy * scale[ch]` with
/// `scale = gamma * rstd`.
struct InferInputGrad<'a, T> {
    dy: &'a GlobalTensor<T>,
    scale: Vec<T>,
    c: usize,
    l: usize,
}

impl<T: Element> MapKernel<T> for InferInputGrad<'_, T> {
    fn input_streams(&self) -> &'static [&'static str] {
        &["dy"]
    }

    fn output_stream(&self) -> &'static str {
        "dx"
    }

    fn load(&self, _stream: usize, tile: &TileDescriptor, dst: &mut [T]) -> Result<(), KernelError> {
        self.dy.read_logical("dy", tile.offset as usize, dst)
    }

    fn compute(
        &self,
        inputs: &[&[T]],
        tile: &TileDescriptor,
        _reducer: &BinaryTreeReducer,
        out: &mut [T],
    ) -> Result<(), KernelError> {
        for (k, (o, &g)) in out.iter_mut().zip(inputs[0]).enumerate() {
            let ch = ((tile.offset as usize + k) / self.l) % self.c;
            *o = g * self.scale[ch];
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Entry points
// ---------------------------------------------------------------------------

fn check_shapes<T: Element>(
    dy: &GlobalTensor<T>,
    x: &GlobalTensor<T>,
    per_channel: &[(&str, &[T])],
) -> Result<(usize, usize, usize), ConfigError> {
    let (n, c, l) = dims(dy.shape())?;
    if x.shape() != dy.shape() {
        return Err(ConfigError::DimensionMismatch(format!(
            "x shape {:?} differs from dy shape {:?}",
            x.shape(),
            dy.shape()
        )));
    }
    for (name, v) in per_channel {
        if v.len() != c {
            return Err(ConfigError::DimensionMismatch(format!(
                "{name} has {} channels, expected {c}",
                v.len()
            )));
        }
    }
    Ok((n, c, l))
}

fn check_tiling(tiling: &BatchNormGradTiling, (n, c, l): (usize, usize, usize)) -> Result<(), KernelError> {
    let m = (n * l) as u64;
    if tiling.reduce.groups != c as u64 || tiling.reduce.total != m || tiling.apply.total != (n * c * l) as u64 {
        return Err(KernelError::ArgumentMismatch(format!(
            "tiling describes C={} M={} total={}, inputs are [{n}, {c}, {l}]",
            tiling.reduce.groups, tiling.reduce.total, tiling.apply.total
        )));
    }
    if m == 0 {
        return Err(ConfigError::EmptyReduction.into());
    }
    Ok(())
}

/// Stages 0 and 1: per-channel `(dbeta, dgamma)` and the stage reports.
fn channel_stats<T: Element>(
    engine: &TiledEngine,
    args: BatchNormGradArgs<'_, T>,
    c: usize,
    l: usize,
    tiling: &TilingConfig,
) -> Result<(Vec<T>, Vec<T>, Vec<CoreReport>), KernelError> {
    let stats = ChannelStats { args, c, l };
    let reduced = engine.launch_reduce(&stats, tiling)?;
    let mut values = reduced.values.into_iter();
    let (Some(dbeta), Some(dgamma)) = (values.next(), values.next()) else {
        return Err(KernelError::ArgumentMismatch("statistics stage produced no output".into()));
    };
    debug!(channels = c, "channel statistics reduced");
    Ok((dbeta, dgamma, reduced.reports))
}

/// Run the three-stage training-mode backward pass.
///
/// # Errors
///
/// Returns [`KernelError::InvalidConfig`] for inconsistent shapes,
/// [`KernelError::ArgumentMismatch`] if `tiling` does not describe the
/// inputs or is an inference tiling, and any error of the two launches.
#[instrument(skip(engine, args, tiling), fields(shape = ?args.dy.shape()))]
pub fn batch_norm_grad<T: Element>(
    engine: &TiledEngine,
    args: BatchNormGradArgs<'_, T>,
    tiling: &BatchNormGradTiling,
) -> Result<BatchNormGradOutput<T>, KernelError> {
    let (n, c, l) = check_shapes(
        args.dy,
        args.x,
        &[("mean", args.mean), ("rstd", args.rstd), ("gamma", args.gamma)],
    )?;
    if tiling.mode != BatchNormMode::Training {
        return Err(KernelError::ArgumentMismatch(
            "training backward pass given an inference tiling".into(),
        ));
    }
    check_tiling(tiling, (n, c, l))?;

    let (dbeta, dgamma, reduce_reports) = channel_stats(engine, args, c, l, &tiling.reduce)?;

    // stage 2
    let divisor = tiling.apply.divisor.unwrap_or((n * l) as f64);
    let grad = InputGrad {
        args,
        dgamma: &dgamma,
        dbeta: &dbeta,
        c,
        l,
        inv_m: T::ONE / T::from_f64(divisor),
    };
    let applied = engine.launch_map(&grad, &tiling.apply)?;
    let dx = GlobalTensor::from_vec(&[n, c, l], applied.values)?;

    Ok(BatchNormGradOutput {
        dx,
        dgamma,
        dbeta,
        reduce_reports,
        apply_reports: applied.reports,
    })
}

/// Run the inference-mode backward pass.
///
/// `rstd` is derived from `running_var` and the tiling's `epsilon`; the
/// channel statistics are reduced exactly as in training mode and
/// `dx = dy * gamma * rstd`.
///
/// # Errors
///
/// Returns [`KernelError::InvalidConfig`] for inconsistent shapes or an
/// invalid `epsilon`, [`KernelError::ArgumentMismatch`] if `tiling` does
/// not describe the inputs or is a training tiling, and any error of the
/// two launches.
#[instrument(skip(engine, args, tiling), fields(shape = ?args.dy.shape()))]
pub fn batch_norm_grad_infer<T: Element>(
    engine: &TiledEngine,
    args: BatchNormGradInferArgs<'_, T>,
    tiling: &BatchNormGradTiling,
) -> Result<BatchNormGradOutput<T>, KernelError> {
    let (n, c, l) = check_shapes(
        args.dy,
        args.x,
        &[
            ("running_mean", args.running_mean),
            ("running_var", args.running_var),
            ("gamma", args.gamma),
        ],
    )?;
    let BatchNormMode::Inference { epsilon } = tiling.mode else {
        return Err(KernelError::ArgumentMismatch(
            "inference backward pass given a training tiling".into(),
        ));
    };
    check_epsilon(epsilon)?;
    check_tiling(tiling, (n, c, l))?;

    let rstd: Vec<T> = args
        .running_var
        .iter()
        .map(|&v| T::from_f64(1.0 / (v.to_f64() + epsilon).sqrt()))
        .collect();
    let stats_args = BatchNormGradArgs {
        dy: args.dy,
        x: args.x,
        mean: args.running_mean,
        rstd: &rstd,
        gamma: args.gamma,
    };
    let (dbeta, dgamma, reduce_reports) = channel_stats(engine, stats_args, c, l, &tiling.reduce)?;

    let grad = InferInputGrad {
        dy: args.dy,
        scale: args.gamma.iter().zip(&rstd).map(|(&g, &r)| g * r).collect(),
        c,
        l,
    };
    let applied = engine.launch_map(&grad, &tiling.apply)?;
    let dx = GlobalTensor::from_vec(&[n, c, l], applied.values)?;

    Ok(BatchNormGradOutput {
        dx,
        dgamma,
        dbeta,
        reduce_reports,
        apply_reports: applied.reports,
    })
}
