//! Binary-tree (dichotomy) partial reducer.
//!
//! Reduces a contiguous run to one value with O(log n) dependency depth:
//!
//! * `n <= lanes`: one masked intra-register tree reduction.
//! * `n > lanes`: with `quotient` the power-of-two split point from
//!   [`BinaryAddSchedule`],
//!   1. the odd tail `[quotient, n)` is folded onto the head register by
//!      register; lanes past the tail keep their pre-fold value,
//!   2. every register-width chunk of `[0, quotient)` is reduced to one value
//!      in a compact binary-add buffer,
//!   3. the buffer is halved in place `k` times and the remaining
//!      `last_num` lanes are reduced.
//!
//! The summation order is therefore pairwise, not left to right.

use crate::config::BinaryAddSchedule;
use crate::error::ConfigError;
use crate::traits::Combine;
use crate::types::{lanes_for, Element};

/// Pairwise tree reduction of `values`; the identity for an empty slice.
pub fn tree_reduce<T: Element, C: Combine<T>>(op: &C, values: &[T]) -> T {
    match values.len() {
        0 => op.identity(),
        1 => values[0],
        2 => op.combine(values[0], values[1]),
        n => {
            let mid = n.next_power_of_two() / 2;
            op.combine(tree_reduce(op, &values[..mid]), tree_reduce(op, &values[mid..]))
        }
    }
}

/// Binary-tree reducer for a fixed vector-register width.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BinaryTreeReducer {
    lanes: usize,
}

impl BinaryTreeReducer {
    /// Reducer with `lanes` lanes per register.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::ParameterOutOfRange`] unless `lanes` is a
    /// non-zero power of two.
    pub fn new(lanes: usize) -> Result<Self, ConfigError> {
        if !lanes.is_power_of_two() {
            return Err(ConfigError::ParameterOutOfRange {
                name: "lanes".into(),
                value: lanes.to_string(),
                expected: "a non-zero power of two".into(),
            });
        }
        Ok(Self { lanes })
    }

    /// Reducer sized for `T` in a register of `vector_bytes` bytes.
    ///
    /// # Errors
    ///
    /// See [`new`](Self::new).
    pub fn for_element<T: Element>(vector_bytes: usize) -> Result<Self, ConfigError> {
        Self::new(lanes_for::<T>(vector_bytes))
    }

    /// Lanes per register.
    #[inline]
    pub fn lanes(&self) -> usize {
        self.lanes
    }

    /// Fold schedule for a run of `len` elements.
    ///
    /// # Errors
    ///
    /// Never fails for a constructed reducer; see
    /// [`BinaryAddSchedule::for_length`].
    pub fn schedule(&self, len: usize) -> Result<Option<BinaryAddSchedule>, ConfigError> {
        BinaryAddSchedule::for_length(len, self.lanes)
    }

    /// Reduce `data` to one value.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::EmptyReduction`] if `data` is empty.
    pub fn reduce<T: Element, C: Combine<T>>(&self, op: &C, data: &[T]) -> Result<T, ConfigError> {
        let mut scratch = Vec::new();
        self.reduce_with(op, data, &mut scratch)
    }

    /// Like [`reduce`](Self::reduce), reusing `scratch` as the binary-add
    /// buffer.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::EmptyReduction`] if `data` is empty.
    pub fn reduce_with<T: Element, C: Combine<T>>(
        &self,
        op: &C,
        data: &[T],
        scratch: &mut Vec<T>,
    ) -> Result<T, ConfigError> {
        if data.is_empty() {
            return Err(ConfigError::EmptyReduction);
        }
        Ok(match self.schedule(data.len())? {
            None => tree_reduce(op, data),
            Some(schedule) => self.fold(op, data, &schedule, scratch),
        })
    }

    /// Reduce `data` with a schedule computed elsewhere (the planner record).
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::EmptyReduction`] for empty input and
    /// [`ConfigError::ParameterOutOfRange`] if `schedule` does not describe
    /// a run of `data.len()` elements at this register width.
    pub fn reduce_scheduled<T: Element, C: Combine<T>>(
        &self,
        op: &C,
        data: &[T],
        schedule: Option<&BinaryAddSchedule>,
        scratch: &mut Vec<T>,
    ) -> Result<T, ConfigError> {
        if data.is_empty() {
            return Err(ConfigError::EmptyReduction);
        }
        let Some(schedule) = schedule else {
            if data.len() > self.lanes {
                return Err(schedule_mismatch(data.len(), "missing schedule"));
            }
            return Ok(tree_reduce(op, data));
        };
        self.check_schedule(data.len(), schedule)?;
        Ok(self.fold(op, data, schedule, scratch))
    }

    /// Reduce `num_groups` runs of `length` elements spaced `group_stride`
    /// apart, writing one value per group into `out`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::EmptyReduction`] if `length == 0` and
    /// [`ConfigError::DimensionMismatch`] if `data` or `out` is too short.
    pub fn reduce_groups<T: Element, C: Combine<T>>(
        &self,
        op: &C,
        data: &[T],
        length: usize,
        group_stride: usize,
        num_groups: usize,
        out: &mut [T],
    ) -> Result<(), ConfigError> {
        if length == 0 {
            return Err(ConfigError::EmptyReduction);
        }
        if num_groups == 0 {
            return Ok(());
        }
        let need = (num_groups - 1) * group_stride + length;
        if data.len() < need || out.len() < num_groups {
            return Err(ConfigError::DimensionMismatch(format!(
                "{num_groups} groups of {length} (stride {group_stride}) need {need} inputs and \
                 {num_groups} outputs, got {} and {}",
                data.len(),
                out.len()
            )));
        }
        let schedule = self.schedule(length)?;
        let mut scratch = Vec::new();
        for (g, slot) in out.iter_mut().take(num_groups).enumerate() {
            let run = &data[g * group_stride..g * group_stride + length];
            *slot = match &schedule {
                None => tree_reduce(op, run),
                Some(s) => self.fold(op, run, s, &mut scratch),
            };
        }
        Ok(())
    }

    /// Load register `chunk` of the head region into `reg` and fold the odd
    /// tail onto it. Lanes past the tail keep their loaded value.
    ///
    /// `reg` must hold exactly `lanes` elements and `chunk * lanes` must lie
    /// inside `[0, quotient)`.
    pub fn fold_register<T: Element, C: Combine<T>>(
        &self,
        op: &C,
        data: &[T],
        quotient: usize,
        chunk: usize,
        reg: &mut [T],
    ) {
        let base = chunk * self.lanes;
        reg.copy_from_slice(&data[base..base + self.lanes]);
        let tail = data.len() - quotient;
        let valid = tail.saturating_sub(base).min(self.lanes);
        for (l, lane) in reg.iter_mut().take(valid).enumerate() {
            *lane = op.combine(*lane, data[quotient + base + l]);
        }
    }

    fn fold<T: Element, C: Combine<T>>(
        &self,
        op: &C,
        data: &[T],
        schedule: &BinaryAddSchedule,
        scratch: &mut Vec<T>,
    ) -> T {
        let vl = self.lanes;
        let quotient = schedule.quotient;
        let chunks = schedule.buffer_len(vl);
        let fold_loops = (data.len() - quotient).div_ceil(vl);

        scratch.clear();
        scratch.resize(chunks + vl, op.identity());
        let (buf, reg) = scratch.split_at_mut(chunks);

        for (i, cell) in buf.iter_mut().enumerate().take(fold_loops) {
            self.fold_register(op, data, quotient, i, reg);
            *cell = tree_reduce(op, reg);
        }
        for (i, cell) in buf.iter_mut().enumerate().skip(fold_loops) {
            *cell = tree_reduce(op, &data[i * vl..(i + 1) * vl]);
        }

        let mut live = chunks;
        for _ in 0..schedule.k {
            live /= 2;
            for j in 0..live {
                buf[j] = op.combine(buf[j], buf[j + live]);
            }
        }
        tree_reduce(op, &buf[..schedule.last_num])
    }

    fn check_schedule(&self, len: usize, s: &BinaryAddSchedule) -> Result<(), ConfigError> {
        let vl = self.lanes;
        if !s.quotient.is_power_of_two() || s.quotient < vl || s.quotient >= len || len > 2 * s.quotient {
            return Err(schedule_mismatch(len, "quotient"));
        }
        let chunks = s.quotient / vl;
        let consistent = if s.k == 0 {
            s.last_num == chunks && chunks <= vl
        } else {
            s.last_num == vl && chunks == vl << s.k
        };
        if !consistent {
            return Err(schedule_mismatch(len, "k / last_num"));
        }
        Ok(())
    }
}

fn schedule_mismatch(len: usize, what: &str) -> ConfigError {
    ConfigError::ParameterOutOfRange {
        name: "binary_add_schedule".into(),
        value: what.into(),
        expected: format!("a schedule for length {len}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::{Max, Sum};

    #[test]
    fn odd_tail_folds_index_zero_with_index_four() {
        let r = BinaryTreeReducer::new(4).unwrap();
        let data = [1.0f32; 5];
        let mut reg = [0.0f32; 4];
        r.fold_register(&Sum, &data, 4, 0, &mut reg);
        assert_eq!(reg, [2.0, 1.0, 1.0, 1.0]);
        assert_eq!(r.reduce(&Sum, &data).unwrap(), 5.0);
    }

    #[test]
    fn halving_rounds_run() {
        // 1000 with 8 lanes: 64 chunks, three halvings
        let r = BinaryTreeReducer::new(8).unwrap();
        let data: Vec<f64> = (0..1000).map(|i| i as f64).collect();
        assert_eq!(r.reduce(&Sum, &data).unwrap(), 499_500.0);
    }

    #[test]
    fn max_variant() {
        let r = BinaryTreeReducer::new(4).unwrap();
        let mut data: Vec<f32> = (0..37).map(|i| -(i as f32)).collect();
        data[36] = 5.0;
        assert_eq!(r.reduce(&Max, &data).unwrap(), 5.0);
    }

    #[test]
    fn empty_is_error() {
        let r = BinaryTreeReducer::new(4).unwrap();
        assert!(matches!(
            r.reduce::<f32, _>(&Sum, &[]),
            Err(ConfigError::EmptyReduction)
        ));
        let mut out = [0.0f32; 1];
        assert!(r.reduce_groups(&Sum, &[1.0f32], 0, 1, 1, &mut out).is_err());
    }

    #[test]
    fn grouped_reduction_honours_stride() {
        let r = BinaryTreeReducer::new(2).unwrap();
        // two groups of three, stride four (last element of each row is padding)
        let data = [1.0f64, 2.0, 3.0, 100.0, 4.0, 5.0, 6.0];
        let mut out = [0.0f64; 2];
        r.reduce_groups(&Sum, &data, 3, 4, 2, &mut out).unwrap();
        assert_eq!(out, [6.0, 15.0]);
    }

    #[test]
    fn lanes_must_be_power_of_two() {
        assert!(BinaryTreeReducer::new(0).is_err());
        assert!(BinaryTreeReducer::new(12).is_err());
        assert_eq!(BinaryTreeReducer::for_element::<f32>(256).unwrap().lanes(), 64);
    }

    #[test]
    fn scheduled_reduce_checks_schedule() {
        let r = BinaryTreeReducer::new(4).unwrap();
        let data = [1.0f32; 40];
        let good = r.schedule(40).unwrap();
        let mut scratch = Vec::new();
        assert_eq!(
            r.reduce_scheduled(&Sum, &data, good.as_ref(), &mut scratch).unwrap(),
            40.0
        );
        let bad = BinaryAddSchedule {
            quotient: 16,
            k: 0,
            last_num: 4,
        };
        assert!(r.reduce_scheduled(&Sum, &data, Some(&bad), &mut scratch).is_err());
        assert!(r.reduce_scheduled(&Sum, &data, None, &mut scratch).is_err());
    }
}
