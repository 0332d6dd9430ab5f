//! Shared test helpers for the ruvector-npu-kernels integration test suite.
//!
//! Provides deterministic random tensors, naive reference operators, and
//! floating-point comparison utilities used across all test modules.

#![allow(dead_code)]

use ruvector_npu_kernels::events::TransferEvent;
use ruvector_npu_kernels::pool3d::{Pool3dParams, PoolMode};
use ruvector_npu_kernels::types::GlobalTensor;

// ---------------------------------------------------------------------------
// Random number generator (simple LCG for deterministic reproducibility)
// ---------------------------------------------------------------------------

/// A minimal linear congruential generator for deterministic test data.
pub struct Lcg {
    state: u64,
}

impl Lcg {
    /// Create a new LCG with the given seed.
    pub fn new(seed: u64) -> Self {
        Self { state: seed }
    }

    /// Generate the next u64 value.
    pub fn next_u64(&mut self) -> u64 {
        self.state = self.state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        self.state
    }

    /// Generate a uniform f64 in [0, 1).
    pub fn next_f64(&mut self) -> f64 {
        (self.next_u64() >> 11) as f64 / (1u64 << 53) as f64
    }

    /// Generate a uniform f64 in [lo, hi).
    pub fn next_f64_range(&mut self, lo: f64, hi: f64) -> f64 {
        lo + (hi - lo) * self.next_f64()
    }
}

// ---------------------------------------------------------------------------
// Tensor generators
// ---------------------------------------------------------------------------

/// Deterministic random vector of length `n` in `[-1, 1)`.
pub fn random_vector(n: usize, seed: u64) -> Vec<f64> {
    let mut rng = Lcg::new(seed);
    (0..n).map(|_| rng.next_f64_range(-1.0, 1.0)).collect()
}

/// Contiguous random tensor of `shape`.
pub fn random_tensor(shape: &[usize], seed: u64) -> GlobalTensor<f64> {
    let n = shape.iter().product();
    GlobalTensor::from_vec(shape, random_vector(n, seed)).unwrap()
}

// ---------------------------------------------------------------------------
// Naive reference operators
// ---------------------------------------------------------------------------

/// Left-to-right row sums of a contiguous `[A, R]` buffer.
pub fn naive_row_sums(data: &[f64], a: usize, r: usize) -> Vec<f64> {
    (0..a).map(|i| data[i * r..(i + 1) * r].iter().sum()).collect()
}

/// Reference batch-norm backward on contiguous `[N, C, L]` buffers.
///
/// Returns `(dx, dgamma, dbeta)`.
pub fn naive_batch_norm_grad(
    dy: &[f64],
    x: &[f64],
    mean: &[f64],
    rstd: &[f64],
    gamma: &[f64],
    shape: [usize; 3],
) -> (Vec<f64>, Vec<f64>, Vec<f64>) {
    let [n, c, l] = shape;
    let m = (n * l) as f64;
    let mut dbeta = vec![0.0; c];
    let mut dgamma = vec![0.0; c];
    for ni in 0..n {
        for ci in 0..c {
            for li in 0..l {
                let i = (ni * c + ci) * l + li;
                dbeta[ci] += dy[i];
                dgamma[ci] += dy[i] * (x[i] - mean[ci]) * rstd[ci];
            }
        }
    }
    let mut dx = vec![0.0; n * c * l];
    for ni in 0..n {
        for ci in 0..c {
            for li in 0..l {
                let i = (ni * c + ci) * l + li;
                let xhat = (x[i] - mean[ci]) * rstd[ci];
                dx[i] = (dy[i] - (xhat * dgamma[ci] + dbeta[ci]) / m) * rstd[ci] * gamma[ci];
            }
        }
    }
    (dx, dgamma, dbeta)
}

/// Reference inference-mode batch-norm backward on a contiguous
/// `[N, C, L]` tensor normalized with running statistics.
pub fn naive_batch_norm_grad_infer(
    dy: &[f64],
    x: &[f64],
    running_mean: &[f64],
    running_var: &[f64],
    gamma: &[f64],
    epsilon: f64,
    shape: [usize; 3],
) -> (Vec<f64>, Vec<f64>, Vec<f64>) {
    let [n, c, l] = shape;
    let rstd: Vec<f64> = running_var.iter().map(|v| 1.0 / (v + epsilon).sqrt()).collect();
    let mut dbeta = vec![0.0; c];
    let mut dgamma = vec![0.0; c];
    let mut dx = vec![0.0; n * c * l];
    for ni in 0..n {
        for ci in 0..c {
            for li in 0..l {
                let i = (ni * c + ci) * l + li;
                dbeta[ci] += dy[i];
                dgamma[ci] += dy[i] * (x[i] - running_mean[ci]) * rstd[ci];
                dx[i] = dy[i] * gamma[ci] * rstd[ci];
            }
        }
    }
    (dx, dgamma, dbeta)
}

/// Reference 3-D pooling on a contiguous NCDHW tensor, direct from the
/// window definition. Returns values and first-max indices.
pub fn naive_pool3d(
    x: &[f64],
    shape: [usize; 5],
    out_shape: [usize; 5],
    p: &Pool3dParams,
    mode: PoolMode,
) -> (Vec<f64>, Vec<i64>) {
    let [n, c, d, h, w] = shape;
    let [_, _, od, oh, ow] = out_shape;
    let mut values = Vec::new();
    let mut indices = Vec::new();
    for ni in 0..n {
        for ci in 0..c {
            for (zd, zh, zw) in (0..od).flat_map(|a| (0..oh).flat_map(move |b| (0..ow).map(move |e| (a, b, e)))) {
                let origin = [
                    (zd * p.stride[0]) as isize - p.pad_front[0] as isize,
                    (zh * p.stride[1]) as isize - p.pad_front[1] as isize,
                    (zw * p.stride[2]) as isize - p.pad_front[2] as isize,
                ];
                let mut best = f64::NEG_INFINITY;
                let mut best_idx = -1i64;
                let mut sum = 0.0;
                let mut inside = 0usize;
                for kd in 0..p.kernel[0] {
                    for kh in 0..p.kernel[1] {
                        for kw in 0..p.kernel[2] {
                            let id = origin[0] + (kd * p.dilation[0]) as isize;
                            let ih = origin[1] + (kh * p.dilation[1]) as isize;
                            let iw = origin[2] + (kw * p.dilation[2]) as isize;
                            if id < 0 || ih < 0 || iw < 0 || id >= d as isize || ih >= h as isize || iw >= w as isize {
                                continue;
                            }
                            let (id, ih, iw) = (id as usize, ih as usize, iw as usize);
                            let v = x[(((ni * c + ci) * d + id) * h + ih) * w + iw];
                            inside += 1;
                            sum += v;
                            if v > best {
                                best = v;
                                best_idx = (id * h * w + ih * w + iw) as i64;
                            }
                        }
                    }
                }
                match mode {
                    PoolMode::Max => {
                        values.push(best);
                        indices.push(best_idx);
                    }
                    PoolMode::Avg => {
                        let div = match p.divisor_override {
                            Some(dv) => dv as f64,
                            None if p.count_include_pad => {
                                let mut size = 1isize;
                                for axis in 0..3 {
                                    let end = (origin[axis] + p.kernel[axis] as isize)
                                        .min((shape[2 + axis] + p.pad_back[axis]) as isize);
                                    size *= end - origin[axis];
                                }
                                size as f64
                            }
                            None => inside as f64,
                        };
                        values.push(sum / div);
                    }
                }
            }
        }
    }
    (values, indices)
}

// ---------------------------------------------------------------------------
// Transfer event checks
// ---------------------------------------------------------------------------

/// Assert that, per stream and slot, a slot is never re-allocated before
/// its previous occupant was freed (after its store completed, if any).
pub fn assert_slot_protocol(events: &[TransferEvent]) {
    use std::collections::HashMap;

    // (stream, slot) -> (held, store pending)
    let mut held: HashMap<(String, usize), (bool, bool)> = HashMap::new();
    for (i, e) in events.iter().enumerate() {
        let key = (e.stream().to_string(), e.slot());
        let entry = held.entry(key.clone()).or_insert((false, false));
        match e {
            TransferEvent::SlotAllocated { .. } => {
                assert!(!entry.0, "event {i}: slot {key:?} re-allocated while held");
                *entry = (true, false);
            }
            TransferEvent::LoadIssued { .. } | TransferEvent::LoadCompleted { .. } => {
                assert!(entry.0, "event {i}: load on unheld slot {key:?}");
            }
            TransferEvent::StoreIssued { .. } => {
                assert!(entry.0, "event {i}: store from unheld slot {key:?}");
                entry.1 = true;
            }
            TransferEvent::StoreCompleted { .. } => {
                assert!(entry.1, "event {i}: store completed without issue on {key:?}");
                entry.1 = false;
            }
            TransferEvent::SlotFreed { .. } => {
                assert!(!entry.1, "event {i}: slot {key:?} freed with a pending store");
                *entry = (false, false);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Floating-point comparison utilities
// ---------------------------------------------------------------------------

/// Largest absolute element difference.
pub fn max_abs_diff(a: &[f64], b: &[f64]) -> f64 {
    assert_eq!(a.len(), b.len(), "vectors must have same length");
    a.iter().zip(b).map(|(x, y)| (x - y).abs()).fold(0.0, f64::max)
}
