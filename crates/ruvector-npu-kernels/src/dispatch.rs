//! Kernel variant selection by tiling key.
//!
//! The planner hands every launch a numeric tiling key and an opaque tiling
//! blob. [`KernelDispatcher`] decodes the key into a [`TilingKey`], decodes
//! the blob into the matching tiling record, checks the caller's argument
//! record is the kind the variant expects, and runs it.
//!
//! # Key table
//!
//! | Key | Variant | Blob | Args |
//! |-----|---------|------|------|
//! | 100 | `ReduceSum` | [`TilingConfig`] | `Reduce` |
//! | 101 | `ReduceMax` | [`TilingConfig`] | `Reduce` |
//! | 102 | `ReduceMin` | [`TilingConfig`] | `Reduce` |
//! | 103 | `ReduceMean` | [`TilingConfig`] | `Reduce` |
//! | 200 | `BatchNormGrad` | [`BatchNormGradTiling`] | `BatchNormGrad` |
//! | 201 | `BatchNormGradInfer` | [`BatchNormGradTiling`] | `BatchNormGradInfer` |
//! | 300 | `MaxPool3d` | [`TilingConfig`] | `Pool3d` |
//! | 301 | `MaxPool3dWithIndices` | [`TilingConfig`] | `Pool3d` |
//! | 310 | `AvgPool3d` | [`TilingConfig`] | `Pool3d` |
//!
//! A key outside the table is reported as
//! [`KernelError::UnsupportedTilingKey`]; nothing is launched.

use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::batch_norm_grad::{
    batch_norm_grad, batch_norm_grad_infer, BatchNormGradArgs, BatchNormGradInferArgs, BatchNormGradOutput,
    BatchNormGradTiling,
};
use crate::config::TilingConfig;
use crate::engine::TiledEngine;
use crate::error::KernelError;
use crate::pool3d::{max_pool3d_with_indices, pool3d, Pool3dOutput, Pool3dParams, PoolMode};
use crate::reduce::reduce_rows;
use crate::traits::{Max, Mean, Min, Sum};
use crate::types::{Element, GlobalTensor};

/// Every kernel variant the dispatcher can launch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TilingKey {
    ReduceSum,
    ReduceMax,
    ReduceMin,
    ReduceMean,
    BatchNormGrad,
    BatchNormGradInfer,
    MaxPool3d,
    MaxPool3dWithIndices,
    AvgPool3d,
}

impl TilingKey {
    /// All variants, in key order.
    pub const ALL: [TilingKey; 9] = [
        TilingKey::ReduceSum,
        TilingKey::ReduceMax,
        TilingKey::ReduceMin,
        TilingKey::ReduceMean,
        TilingKey::BatchNormGrad,
        TilingKey::BatchNormGradInfer,
        TilingKey::MaxPool3d,
        TilingKey::MaxPool3dWithIndices,
        TilingKey::AvgPool3d,
    ];

    /// Numeric key as written by the planner.
    pub fn value(self) -> u64 {
        match self {
            TilingKey::ReduceSum => 100,
            TilingKey::ReduceMax => 101,
            TilingKey::ReduceMin => 102,
            TilingKey::ReduceMean => 103,
            TilingKey::BatchNormGrad => 200,
            TilingKey::BatchNormGradInfer => 201,
            TilingKey::MaxPool3d => 300,
            TilingKey::MaxPool3dWithIndices => 301,
            TilingKey::AvgPool3d => 310,
        }
    }

    /// Variant for a numeric key, if any.
    pub fn from_value(key: u64) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.value() == key)
    }
}

impl TryFrom<u64> for TilingKey {
    type Error = KernelError;

    fn try_from(key: u64) -> Result<Self, Self::Error> {
        Self::from_value(key).ok_or(KernelError::UnsupportedTilingKey { key })
    }
}

impl fmt::Display for TilingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TilingKey::ReduceSum => "reduce-sum",
            TilingKey::ReduceMax => "reduce-max",
            TilingKey::ReduceMin => "reduce-min",
            TilingKey::ReduceMean => "reduce-mean",
            TilingKey::BatchNormGrad => "batch-norm-grad",
            TilingKey::BatchNormGradInfer => "batch-norm-grad-infer",
            TilingKey::MaxPool3d => "max-pool3d",
            TilingKey::MaxPool3dWithIndices => "max-pool3d-with-indices",
            TilingKey::AvgPool3d => "avg-pool3d",
        };
        write!(f, "{name}({})", self.value())
    }
}

/// Argument record of a launch.
#[derive(Debug, Clone, Copy)]
pub enum KernelArgs<'a, T> {
    /// `[A, R]` input of an axis reduction.
    Reduce { input: &'a GlobalTensor<T> },
    /// Training-mode batch-norm backward inputs.
    BatchNormGrad(BatchNormGradArgs<'a, T>),
    /// Inference-mode batch-norm backward inputs.
    BatchNormGradInfer(BatchNormGradInferArgs<'a, T>),
    /// NCDHW pooling input and window parameters.
    Pool3d {
        input: &'a GlobalTensor<T>,
        params: &'a Pool3dParams,
    },
}

impl<T> KernelArgs<'_, T> {
    fn kind(&self) -> &'static str {
        match self {
            KernelArgs::Reduce { .. } => "Reduce",
            KernelArgs::BatchNormGrad(_) => "BatchNormGrad",
            KernelArgs::BatchNormGradInfer(_) => "BatchNormGradInfer",
            KernelArgs::Pool3d { .. } => "Pool3d",
        }
    }
}

/// Result of a launch.
#[derive(Debug, Clone)]
pub enum KernelOutput<T> {
    /// One value per reduced row.
    Reduce(Vec<T>),
    /// Batch-norm gradients.
    BatchNormGrad(BatchNormGradOutput<T>),
    /// Pooled tensor and optional indices.
    Pool3d(Pool3dOutput<T>),
}

/// Selects and runs kernel variants on one [`TiledEngine`].
#[derive(Debug, Clone, Default)]
pub struct KernelDispatcher {
    engine: TiledEngine,
}

impl KernelDispatcher {
    /// Dispatcher running on `engine`.
    pub fn new(engine: TiledEngine) -> Self {
        Self { engine }
    }

    /// The engine launches run on.
    pub fn engine(&self) -> &TiledEngine {
        &self.engine
    }

    /// Launch the variant named by `key` with tiling `blob` and `args`.
    ///
    /// # Errors
    ///
    /// - [`KernelError::UnsupportedTilingKey`] if `key` names no variant.
    /// - [`KernelError::InvalidConfig`] if `blob` does not decode.
    /// - [`KernelError::ArgumentMismatch`] if `args` is not the record the
    ///   variant takes, or does not match the tiling.
    /// - Any error of the launch itself.
    pub fn dispatch<T: Element>(
        &self,
        key: u64,
        blob: &[u8],
        args: KernelArgs<'_, T>,
    ) -> Result<KernelOutput<T>, KernelError> {
        let Some(variant) = TilingKey::from_value(key) else {
            warn!(key, "no kernel variant for tiling key");
            return Err(KernelError::UnsupportedTilingKey { key });
        };
        debug!(%variant, args = args.kind(), "dispatch");
        let engine = &self.engine;

        match (variant, args) {
            (TilingKey::BatchNormGrad, KernelArgs::BatchNormGrad(bn)) => {
                let tiling = BatchNormGradTiling::from_blob(blob)?;
                Ok(KernelOutput::BatchNormGrad(batch_norm_grad(engine, bn, &tiling)?))
            }
            (TilingKey::BatchNormGradInfer, KernelArgs::BatchNormGradInfer(bn)) => {
                let tiling = BatchNormGradTiling::from_blob(blob)?;
                Ok(KernelOutput::BatchNormGrad(batch_norm_grad_infer(engine, bn, &tiling)?))
            }
            (
                TilingKey::ReduceSum | TilingKey::ReduceMax | TilingKey::ReduceMin | TilingKey::ReduceMean,
                KernelArgs::Reduce { input },
            ) => {
                let tiling = TilingConfig::from_blob(blob)?;
                let values = match variant {
                    TilingKey::ReduceSum => reduce_rows(engine, input, Sum, &tiling)?,
                    TilingKey::ReduceMax => reduce_rows(engine, input, Max, &tiling)?,
                    TilingKey::ReduceMin => reduce_rows(engine, input, Min, &tiling)?,
                    _ => reduce_rows(engine, input, Mean, &tiling)?,
                };
                Ok(KernelOutput::Reduce(values))
            }
            (TilingKey::MaxPool3dWithIndices, KernelArgs::Pool3d { input, params }) => {
                let tiling = TilingConfig::from_blob(blob)?;
                Ok(KernelOutput::Pool3d(max_pool3d_with_indices(engine, input, params, &tiling)?))
            }
            (TilingKey::MaxPool3d | TilingKey::AvgPool3d, KernelArgs::Pool3d { input, params }) => {
                let tiling = TilingConfig::from_blob(blob)?;
                let mode = if variant == TilingKey::MaxPool3d {
                    PoolMode::Max
                } else {
                    PoolMode::Avg
                };
                Ok(KernelOutput::Pool3d(pool3d(engine, mode, input, params, &tiling)?))
            }
            (variant, args) => Err(KernelError::ArgumentMismatch(format!(
                "{variant} does not take {} arguments",
                args.kind()
            ))),
        }
    }
}
