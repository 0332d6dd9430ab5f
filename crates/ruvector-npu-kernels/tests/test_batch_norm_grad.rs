//! Integration tests for the batch-norm backward operator.
//!
//! Tests compare all three gradients against a naive reference over several
//! shapes and core counts in both training and inference mode, and cover the
//! blob-driven tiling path and empty channel axes.

mod helpers;

use approx::assert_relative_eq;
use helpers::{
    max_abs_diff, naive_batch_norm_grad, naive_batch_norm_grad_infer, random_tensor, random_vector, Lcg,
};
use ruvector_npu_kernels::batch_norm_grad::{
    batch_norm_grad, batch_norm_grad_infer, BatchNormGradArgs, BatchNormGradInferArgs, BatchNormGradTiling,
    BatchNormMode,
};
use ruvector_npu_kernels::config::EngineConfig;
use ruvector_npu_kernels::engine::TiledEngine;
use ruvector_npu_kernels::error::KernelError;
use ruvector_npu_kernels::types::{GlobalTensor, TensorView};

fn channel_params(c: usize, seed: u64) -> (Vec<f64>, Vec<f64>, Vec<f64>) {
    let mut rng = Lcg::new(seed);
    let mean = (0..c).map(|_| rng.next_f64_range(-0.5, 0.5)).collect();
    let rstd = (0..c).map(|_| rng.next_f64_range(0.5, 2.0)).collect();
    let gamma = (0..c).map(|_| rng.next_f64_range(0.5, 1.5)).collect();
    (mean, rstd, gamma)
}

fn check_shape(engine: &TiledEngine, shape: [usize; 3], max_cores: u32, seed: u64) {
    let dy = random_tensor(&shape, seed);
    let x = random_tensor(&shape, seed + 1);
    let (mean, rstd, gamma) = channel_params(shape[1], seed + 2);
    let args = BatchNormGradArgs {
        dy: &dy,
        x: &x,
        mean: &mean,
        rstd: &rstd,
        gamma: &gamma,
    };
    let tiling = BatchNormGradTiling::plan::<f64>(engine, &shape, max_cores).unwrap();
    let out = batch_norm_grad(engine, args, &tiling).unwrap();

    let (dx, dgamma, dbeta) = naive_batch_norm_grad(dy.storage(), x.storage(), &mean, &rstd, &gamma, shape);
    assert!(max_abs_diff(&out.dbeta, &dbeta) < 1e-9, "dbeta {shape:?}");
    assert!(max_abs_diff(&out.dgamma, &dgamma) < 1e-9, "dgamma {shape:?}");
    assert!(max_abs_diff(out.dx.storage(), &dx) < 1e-9, "dx {shape:?}");
    assert_eq!(out.dx.shape(), &shape);
}

#[test]
fn test_matches_reference_across_shapes() {
    let engine = TiledEngine::default();
    for (i, (shape, cores)) in [
        ([1, 1, 1], 1),
        ([2, 3, 5], 4),
        ([4, 20, 33], 8),
        ([8, 2, 1_000], 16),
        ([3, 17, 64], 48),
    ]
    .into_iter()
    .enumerate()
    {
        check_shape(&engine, shape, cores, 10 * i as u64);
    }
}

#[test]
fn test_small_scratch_forces_many_tiles() {
    let engine = TiledEngine::new(EngineConfig {
        scratch_bytes: 8 * 1024,
        buffer_num: 2,
        ..Default::default()
    })
    .unwrap();
    check_shape(&engine, [6, 5, 300], 3, 77);
}

#[test]
fn test_single_buffer() {
    let engine = TiledEngine::new(EngineConfig {
        buffer_num: 1,
        ..Default::default()
    })
    .unwrap();
    check_shape(&engine, [2, 4, 50], 2, 5);
}

#[test]
fn test_strided_inputs() {
    // dy stored as [C, N, L] and viewed as [N, C, L]
    let (n, c, l) = (3, 2, 4);
    let storage = random_vector(n * c * l, 31);
    let view = TensorView::strided(0, &[n, c, l], &[l, n * l, 1]).unwrap();
    let dy = GlobalTensor::with_view(storage.clone(), view).unwrap();
    let mut packed = vec![0.0; n * c * l];
    for ni in 0..n {
        for ci in 0..c {
            for li in 0..l {
                packed[(ni * c + ci) * l + li] = dy.get(&[ni, ci, li]).unwrap();
            }
        }
    }
    let x = random_tensor(&[n, c, l], 32);
    let (mean, rstd, gamma) = channel_params(c, 33);
    let engine = TiledEngine::default();
    let tiling = BatchNormGradTiling::plan::<f64>(&engine, &[n, c, l], 2).unwrap();
    let out = batch_norm_grad(
        &engine,
        BatchNormGradArgs {
            dy: &dy,
            x: &x,
            mean: &mean,
            rstd: &rstd,
            gamma: &gamma,
        },
        &tiling,
    )
    .unwrap();
    let (dx, dgamma, dbeta) = naive_batch_norm_grad(&packed, x.storage(), &mean, &rstd, &gamma, [n, c, l]);
    for (g, w) in out.dbeta.iter().zip(&dbeta) {
        assert_relative_eq!(*g, *w, epsilon = 1e-12);
    }
    assert!(max_abs_diff(&out.dgamma, &dgamma) < 1e-12);
    assert!(max_abs_diff(out.dx.storage(), &dx) < 1e-12);
}

#[test]
fn test_tiling_from_blob() {
    let engine = TiledEngine::default();
    let shape = [2, 3, 7];
    let blob = BatchNormGradTiling::plan::<f64>(&engine, &shape, 4).unwrap().to_blob();
    let tiling = BatchNormGradTiling::from_blob(&blob).unwrap();
    assert_eq!(tiling.apply.divisor, Some(14.0));

    let dy = random_tensor(&shape, 1);
    let (mean, rstd, gamma) = channel_params(3, 2);
    let out = batch_norm_grad(
        &engine,
        BatchNormGradArgs {
            dy: &dy,
            x: &dy,
            mean: &mean,
            rstd: &rstd,
            gamma: &gamma,
        },
        &tiling,
    )
    .unwrap();
    assert_eq!(out.reduce_reports.len(), tiling.reduce.used_core_num as usize);
    assert_eq!(out.apply_reports.len(), tiling.apply.used_core_num as usize);
}

#[test]
fn test_tiling_for_other_shape_rejected() {
    let engine = TiledEngine::default();
    let dy = random_tensor(&[2, 3, 4], 1);
    let (mean, rstd, gamma) = channel_params(3, 2);
    let tiling = BatchNormGradTiling::plan::<f64>(&engine, &[2, 3, 5], 2).unwrap();
    let err = batch_norm_grad(
        &engine,
        BatchNormGradArgs {
            dy: &dy,
            x: &dy,
            mean: &mean,
            rstd: &rstd,
            gamma: &gamma,
        },
        &tiling,
    )
    .unwrap_err();
    assert!(matches!(err, KernelError::ArgumentMismatch(_)));
}

// ---------------------------------------------------------------------------
// Inference mode
// ---------------------------------------------------------------------------

fn check_infer_shape(engine: &TiledEngine, shape: [usize; 3], max_cores: u32, epsilon: f64, seed: u64) {
    let dy = random_tensor(&shape, seed);
    let x = random_tensor(&shape, seed + 1);
    let mut rng = Lcg::new(seed + 2);
    let c = shape[1];
    let running_mean: Vec<f64> = (0..c).map(|_| rng.next_f64_range(-0.5, 0.5)).collect();
    let running_var: Vec<f64> = (0..c).map(|_| rng.next_f64_range(0.1, 3.0)).collect();
    let gamma: Vec<f64> = (0..c).map(|_| rng.next_f64_range(0.5, 1.5)).collect();
    let args = BatchNormGradInferArgs {
        dy: &dy,
        x: &x,
        running_mean: &running_mean,
        running_var: &running_var,
        gamma: &gamma,
    };
    let tiling = BatchNormGradTiling::plan_inference::<f64>(engine, &shape, max_cores, epsilon).unwrap();
    let out = batch_norm_grad_infer(engine, args, &tiling).unwrap();

    let (dx, dgamma, dbeta) = naive_batch_norm_grad_infer(
        dy.storage(),
        x.storage(),
        &running_mean,
        &running_var,
        &gamma,
        epsilon,
        shape,
    );
    assert!(max_abs_diff(&out.dbeta, &dbeta) < 1e-9, "dbeta {shape:?}");
    assert!(max_abs_diff(&out.dgamma, &dgamma) < 1e-9, "dgamma {shape:?}");
    assert!(max_abs_diff(out.dx.storage(), &dx) < 1e-12, "dx {shape:?}");
}

#[test]
fn test_inference_matches_reference() {
    let engine = TiledEngine::default();
    for (i, (shape, cores, eps)) in [
        ([1, 1, 1], 1, 1e-5),
        ([2, 3, 5], 4, 1e-3),
        ([4, 20, 33], 8, 0.0),
        ([8, 2, 1_000], 16, 1e-5),
    ]
    .into_iter()
    .enumerate()
    {
        check_infer_shape(&engine, shape, cores, eps, 100 + 10 * i as u64);
    }

    let small = TiledEngine::new(EngineConfig {
        scratch_bytes: 8 * 1024,
        buffer_num: 1,
        ..Default::default()
    })
    .unwrap();
    check_infer_shape(&small, [6, 5, 300], 3, 1e-5, 7);
}

#[test]
fn test_inference_tiling_from_blob() {
    let engine = TiledEngine::default();
    let shape = [2, 3, 7];
    let blob = BatchNormGradTiling::plan_inference::<f64>(&engine, &shape, 4, 1e-3)
        .unwrap()
        .to_blob();
    let tiling = BatchNormGradTiling::from_blob(&blob).unwrap();
    assert_eq!(tiling.mode, BatchNormMode::Inference { epsilon: 1e-3 });
    assert_eq!(tiling.apply.divisor, None);
}

#[test]
fn test_mode_and_tiling_must_agree() {
    let engine = TiledEngine::default();
    let shape = [2, 3, 4];
    let dy = random_tensor(&shape, 1);
    let (mean, rstd, gamma) = channel_params(3, 2);

    let infer_tiling = BatchNormGradTiling::plan_inference::<f64>(&engine, &shape, 2, 1e-5).unwrap();
    let err = batch_norm_grad(
        &engine,
        BatchNormGradArgs {
            dy: &dy,
            x: &dy,
            mean: &mean,
            rstd: &rstd,
            gamma: &gamma,
        },
        &infer_tiling,
    )
    .unwrap_err();
    assert!(matches!(err, KernelError::ArgumentMismatch(_)));

    let train_tiling = BatchNormGradTiling::plan::<f64>(&engine, &shape, 2).unwrap();
    let err = batch_norm_grad_infer(
        &engine,
        BatchNormGradInferArgs {
            dy: &dy,
            x: &dy,
            running_mean: &mean,
            running_var: &rstd,
            gamma: &gamma,
        },
        &train_tiling,
    )
    .unwrap_err();
    assert!(matches!(err, KernelError::ArgumentMismatch(_)));
}

// ---------------------------------------------------------------------------
// Empty channel axis
// ---------------------------------------------------------------------------

#[test]
fn test_zero_channels_gives_empty_gradients() {
    let engine = TiledEngine::default();
    let shape = [2, 0, 3];
    let dy = GlobalTensor::from_vec(&shape, Vec::<f64>::new()).unwrap();
    let none: [f64; 0] = [];

    let tiling = BatchNormGradTiling::plan::<f64>(&engine, &shape, 4).unwrap();
    let args = BatchNormGradArgs {
        dy: &dy,
        x: &dy,
        mean: &none,
        rstd: &none,
        gamma: &none,
    };
    let out = batch_norm_grad(&engine, args, &tiling).unwrap();
    assert!(out.dbeta.is_empty() && out.dgamma.is_empty());
    assert!(out.dx.storage().is_empty());
    assert_eq!(out.dx.shape(), &shape);

    let tiling = BatchNormGradTiling::plan_inference::<f64>(&engine, &shape, 4, 1e-5).unwrap();
    let args = BatchNormGradInferArgs {
        dy: &dy,
        x: &dy,
        running_mean: &none,
        running_var: &none,
        gamma: &none,
    };
    let out = batch_norm_grad_infer(&engine, args, &tiling).unwrap();
    assert!(out.dbeta.is_empty() && out.dx.storage().is_empty());
}
