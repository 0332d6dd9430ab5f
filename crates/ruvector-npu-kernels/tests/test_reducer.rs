//! Integration tests for the binary-tree reducer.
//!
//! Tests cover every length class around the register width, the odd-tail
//! fold, the max variant, and grouped reduction against naive references.

mod helpers;

use approx::assert_relative_eq;
use helpers::{naive_row_sums, random_vector};
use ruvector_npu_kernels::config::BinaryAddSchedule;
use ruvector_npu_kernels::reducer::{tree_reduce, BinaryTreeReducer};
use ruvector_npu_kernels::traits::{Max, Min, Sum};

const LANES: usize = 8;

fn lengths() -> Vec<usize> {
    vec![1, 3, LANES, LANES + 1, 1_000, 1_024, 4_097]
}

// ---------------------------------------------------------------------------
// Length classes
// ---------------------------------------------------------------------------

#[test]
fn test_sum_matches_naive_for_every_length_class() {
    let r = BinaryTreeReducer::new(LANES).unwrap();
    for (seed, len) in lengths().into_iter().enumerate() {
        let data = random_vector(len, seed as u64 + 1);
        let naive: f64 = data.iter().sum();
        let got = r.reduce(&Sum, &data).unwrap();
        assert_relative_eq!(got, naive, epsilon = 1e-10, max_relative = 1e-12);
    }
}

#[test]
fn test_max_and_min_exact_for_every_length_class() {
    let r = BinaryTreeReducer::new(LANES).unwrap();
    for (seed, len) in lengths().into_iter().enumerate() {
        let data = random_vector(len, 100 + seed as u64);
        let max = data.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let min = data.iter().copied().fold(f64::INFINITY, f64::min);
        assert_eq!(r.reduce(&Max, &data).unwrap(), max, "len {len}");
        assert_eq!(r.reduce(&Min, &data).unwrap(), min, "len {len}");
    }
}

#[test]
fn test_f32_sum_uses_wide_registers() {
    let r = BinaryTreeReducer::for_element::<f32>(256).unwrap();
    assert_eq!(r.lanes(), 64);
    let data: Vec<f32> = (0..10_000).map(|i| (i % 10) as f32).collect();
    assert_eq!(r.reduce(&Sum, &data).unwrap(), 45_000.0);
}

// ---------------------------------------------------------------------------
// Odd-tail fold
// ---------------------------------------------------------------------------

#[test]
fn test_five_ones_with_four_lanes() {
    let r = BinaryTreeReducer::new(4).unwrap();
    let data = [1.0f64; 5];

    let schedule = r.schedule(5).unwrap().unwrap();
    assert_eq!(schedule.quotient, 4);

    let mut reg = [0.0f64; 4];
    r.fold_register(&Sum, &data, schedule.quotient, 0, &mut reg);
    assert_eq!(reg[0], 2.0, "index 0 folds with index 4");
    assert_eq!(reg.iter().sum::<f64>(), 5.0);
    assert_eq!(r.reduce(&Sum, &data).unwrap(), 5.0);
}

#[test]
fn test_schedule_shapes() {
    // 1000 / 8 lanes: quotient 512, 64 chunks, 3 halvings to 8
    let s = BinaryAddSchedule::for_length(1_000, 8).unwrap().unwrap();
    assert_eq!((s.quotient, s.k, s.last_num), (512, 3, 8));
    // power of two folds its upper half
    let s = BinaryAddSchedule::for_length(64, 8).unwrap().unwrap();
    assert_eq!((s.quotient, s.k, s.last_num), (32, 0, 4));
}

#[test]
fn test_scheduled_reduce_rejects_foreign_schedule() {
    let r = BinaryTreeReducer::new(8).unwrap();
    let data = random_vector(1_000, 7);
    let wrong = BinaryAddSchedule::for_length(100, 8).unwrap();
    let mut scratch = Vec::new();
    assert!(r.reduce_scheduled(&Sum, &data, wrong.as_ref(), &mut scratch).is_err());
    let right = r.schedule(1_000).unwrap();
    let got = r.reduce_scheduled(&Sum, &data, right.as_ref(), &mut scratch).unwrap();
    assert_relative_eq!(got, data.iter().sum::<f64>(), epsilon = 1e-10);
}

// ---------------------------------------------------------------------------
// Grouped
// ---------------------------------------------------------------------------

#[test]
fn test_grouped_reduction_matches_rows() {
    let r = BinaryTreeReducer::new(LANES).unwrap();
    let (a, len) = (5, 77);
    let data = random_vector(a * len, 42);
    let mut out = vec![0.0; a];
    r.reduce_groups(&Sum, &data, len, len, a, &mut out).unwrap();
    for (got, want) in out.iter().zip(naive_row_sums(&data, a, len)) {
        assert_relative_eq!(*got, want, epsilon = 1e-12);
    }
}

#[test]
fn test_tree_reduce_empty_is_identity() {
    assert_eq!(tree_reduce::<f64, _>(&Sum, &[]), 0.0);
    assert_eq!(tree_reduce::<f64, _>(&Max, &[]), f64::NEG_INFINITY);
}
