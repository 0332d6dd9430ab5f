//! Tiled streaming engine.
//!
//! [`TiledEngine`] runs any [`ReduceKernel`] or [`MapKernel`] through the
//! same per-core loop:
//!
//! ```text
//! for chunk in A-chunks:                       (reduce only)
//!     issue load(tile 0)
//!     for tile i in core's plan:
//!         issue load(tile i + 1)               if buffer_num >= 2
//!         wait load(tile i)
//!         compute / reduce tile i
//!         merge partial into cache             (reduce)
//!         issue store(tile i)                  (map)
//!         free input slots
//!         issue load(tile i + 1)               if buffer_num == 1
//!     finalize cache into the core's workspace slice
//! ```
//!
//! A launch executes one rayon task per core over disjoint workspace or
//! output slices. The end of the parallel stage is the all-cores barrier;
//! core 0 then reduces each workspace column with the binary-tree reducer.

use std::ops::Range;

use rayon::prelude::*;
use tracing::{debug, instrument, trace};

use crate::accumulator::PartialResultCache;
use crate::arena::{ScratchArena, SCRATCH_ALIGN};
use crate::config::{EngineConfig, TilingConfig};
use crate::error::{ConfigError, KernelError};
use crate::events::TransferEvent;
use crate::partition::CoreSplit;
use crate::pipeline::{SlotHandle, TransferQueue};
use crate::reducer::BinaryTreeReducer;
use crate::traits::{Combine, MapKernel, ReduceKernel, SliceSink, TileSink};
use crate::types::{lanes_for, Element, TileDescriptor};
use crate::validation::{validate_engine_config, validate_tiling};
use crate::workspace::Workspace;

/// Alignment blocks held back from [`TiledEngine::tile_budget`] for
/// per-slot rounding and the per-group partial buffers.
const TILE_BUDGET_SLACK_BLOCKS: usize = 64;

// ---------------------------------------------------------------------------
// Reports
// ---------------------------------------------------------------------------

/// What one core did during a launch.
#[derive(Debug, Clone, Default)]
pub struct CoreReport {
    /// Core index.
    pub core: usize,
    /// Tiles processed (summed over A-chunks).
    pub tiles: u64,
    /// Items of the partitioned axis owned by this core.
    pub items: u64,
    /// Scratch bytes reserved.
    pub scratch_bytes: usize,
    /// Transfer events of every queue, when recording is enabled.
    pub events: Vec<TransferEvent>,
}

/// Result of [`TiledEngine::launch_reduce`].
#[derive(Debug, Clone)]
pub struct ReduceOutput<T> {
    /// `values[output][group]`.
    pub values: Vec<Vec<T>>,
    /// One report per core, in core order.
    pub reports: Vec<CoreReport>,
}

/// Result of [`TiledEngine::launch_map`].
#[derive(Debug, Clone)]
pub struct MapOutput<T> {
    /// One output per index of the flat index space.
    pub values: Vec<T>,
    /// One report per core, in core order.
    pub reports: Vec<CoreReport>,
}

// ---------------------------------------------------------------------------
// TiledEngine
// ---------------------------------------------------------------------------

/// Generic tiled, double-buffered execution engine.
#[derive(Debug, Clone, Default)]
pub struct TiledEngine {
    config: EngineConfig,
}

impl TiledEngine {
    /// Create an engine after validating `config`.
    ///
    /// # Errors
    ///
    /// Returns [`KernelError::InvalidConfig`] if `config` is invalid.
    pub fn new(config: EngineConfig) -> Result<Self, KernelError> {
        validate_engine_config(&config)?;
        Ok(Self { config })
    }

    /// The engine configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Reducer sized for `T` at this engine's register width.
    ///
    /// # Errors
    ///
    /// Returns [`KernelError::InvalidConfig`] if the width yields a
    /// non-power-of-two lane count.
    pub fn reducer<T: Element>(&self) -> Result<BinaryTreeReducer, KernelError> {
        Ok(BinaryTreeReducer::for_element::<T>(self.config.vector_bytes)?)
    }

    /// Largest `tile_factor` such that `tile_factor * elems_per_unit`
    /// elements of `T` fit in scratch, rounded down to whole registers when
    /// possible. `elems_per_unit` counts every slot of every stream that
    /// scales with the tile.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::ScratchOverflow`] if not even a one-element
    /// tile fits.
    pub fn tile_budget<T: Element>(&self, elems_per_unit: usize) -> Result<u32, KernelError> {
        let lanes = lanes_for::<T>(self.config.vector_bytes);
        let slack = TILE_BUDGET_SLACK_BLOCKS * SCRATCH_ALIGN;
        let usable = self.config.scratch_bytes.saturating_sub(slack);
        let per_unit = elems_per_unit.max(1) * std::mem::size_of::<T>();
        let fit = usable / per_unit;
        if fit == 0 {
            return Err(ConfigError::ScratchOverflow {
                requested: per_unit + slack,
                capacity: self.config.scratch_bytes,
            }
            .into());
        }
        let fit = if fit >= lanes { fit / lanes * lanes } else { fit };
        Ok(fit.min(u32::MAX as usize) as u32)
    }

    /// [`tile_budget`](Self::tile_budget) capped at `extent`, the length of
    /// the axis being tiled, and never below one element.
    ///
    /// # Errors
    ///
    /// See [`tile_budget`](Self::tile_budget).
    pub fn tile_for<T: Element>(&self, elems_per_unit: usize, extent: u64) -> Result<u32, KernelError> {
        let cap = extent.min(u32::MAX as u64) as u32;
        Ok(self.tile_budget::<T>(elems_per_unit)?.min(cap).max(1))
    }

    // -- reduce ------------------------------------------------------------

    /// Run core `core`'s share of a reduction, writing its per-group results
    /// into `out[output][..groups]` (the core's workspace slices).
    ///
    /// Groups with no tile on this core receive the operator identity.
    ///
    /// # Errors
    ///
    /// Returns [`KernelError::InvalidConfig`] for an invalid record or a
    /// slot layout that does not fit scratch, and propagates transfer
    /// faults.
    #[instrument(skip(self, kernel, tiling, out))]
    pub fn reduce_core<T, K>(
        &self,
        kernel: &K,
        tiling: &TilingConfig,
        core: usize,
        out: &mut [&mut [T]],
    ) -> Result<CoreReport, KernelError>
    where
        T: Element,
        K: ReduceKernel<T>,
    {
        let split = CoreSplit::from_config(tiling)?;
        let buffer_num = self.config.buffer_num;
        let plan = split.core_plan(core, tiling.tile_factor, buffer_num as u32)?;
        let reducer = self.reducer::<T>()?;
        let op = kernel.op();
        let groups = tiling.groups as usize;
        let group_factor = (tiling.group_factor.max(1) as usize).min(groups.max(1));
        let outputs = kernel.outputs();

        if out.len() < outputs || out.iter().any(|o| o.len() < groups) {
            return Err(KernelError::ArgumentMismatch(format!(
                "core {core} needs {outputs} workspace slices of {groups} elements"
            )));
        }

        let slot_len = group_factor * tiling.tile_factor as usize;
        let mut arena = ScratchArena::with_capacity(self.config.scratch_bytes);
        let mut queues = kernel
            .input_streams()
            .iter()
            .map(|&stream| {
                TransferQueue::<T>::in_arena(&mut arena, stream, buffer_num, slot_len, self.config.record_events)
            })
            .collect::<Result<Vec<_>, _>>()?;
        arena.reserve("work", 1, slot_len, std::mem::size_of::<T>())?;
        arena.reserve("partials", outputs, group_factor, std::mem::size_of::<T>())?;
        let mut work = vec![T::ZERO; slot_len];
        let mut partials: Vec<Vec<T>> = vec![vec![T::ZERO; group_factor]; outputs];
        let mut caches: Vec<PartialResultCache<T>> = (0..outputs)
            .map(|_| PartialResultCache::new(group_factor, plan.len()))
            .collect();

        debug!(
            core,
            range = ?split.range(core),
            tiles = plan.len(),
            chunks = tiling.group_chunks(),
            scratch = arena.bytes_used(),
            "reduce plan"
        );

        let mut report = CoreReport {
            core,
            items: split.share(core),
            scratch_bytes: arena.bytes_used(),
            ..Default::default()
        };

        let chunk_ranges = (0..groups)
            .step_by(group_factor)
            .map(|g0| g0..(g0 + group_factor).min(groups));
        for chunk in chunk_ranges {
            let glen = chunk.len();
            for cache in caches.iter_mut() {
                cache.reset(glen);
            }
            for p in partials.iter_mut() {
                p.resize(glen, T::ZERO);
            }

            let n = plan.len();
            let load = |stream: usize, tile: &TileDescriptor, dst: &mut [T]| {
                kernel.load(stream, chunk.clone(), tile, dst)
            };
            let load_len = |_: usize, tile: &TileDescriptor| glen * tile.length as usize;

            let mut inflight = match plan.get(0) {
                Some(first) => Some(issue_loads(&mut queues, &first, &load, &load_len)?),
                None => None,
            };
            for i in 0..n {
                let (Some(tile), Some(handles)) = (plan.get(i), inflight.take()) else {
                    break;
                };
                let mut next = None;
                if buffer_num >= 2 {
                    if let Some(t) = plan.get(i + 1) {
                        next = Some(issue_loads(&mut queues, &t, &load, &load_len)?);
                    }
                }

                for (q, &h) in queues.iter_mut().zip(&handles) {
                    q.wait_loaded(h)?;
                }
                {
                    let inputs = queues
                        .iter()
                        .zip(&handles)
                        .map(|(q, &h)| q.view(h))
                        .collect::<Result<Vec<_>, _>>()?;
                    kernel.partials(
                        &inputs,
                        chunk.clone(),
                        &tile,
                        &reducer,
                        &mut work[..glen * tile.length as usize],
                        &mut partials,
                    )?;
                }
                for (cache, p) in caches.iter_mut().zip(&partials) {
                    cache.merge(op, tile.index, p);
                }
                for (q, &h) in queues.iter_mut().zip(&handles) {
                    q.free_slot(h)?;
                }
                trace!(core, tile = tile.index, offset = tile.offset, "tile reduced");
                report.tiles += 1;

                if buffer_num < 2 {
                    if let Some(t) = plan.get(i + 1) {
                        next = Some(issue_loads(&mut queues, &t, &load, &load_len)?);
                    }
                }
                inflight = next;
            }

            for (j, cache) in caches.iter().enumerate() {
                let dst = &mut out[j][chunk.clone()];
                if !cache.finalize_into(op, dst) {
                    dst.fill(op.identity());
                }
            }
        }

        if self.config.record_events {
            for q in queues.iter_mut() {
                report.events.extend(q.take_events());
            }
        }
        Ok(report)
    }

    /// Run a reduction on every core with a freshly allocated workspace.
    ///
    /// # Errors
    ///
    /// See [`launch_reduce_in`](Self::launch_reduce_in).
    pub fn launch_reduce<T, K>(&self, kernel: &K, tiling: &TilingConfig) -> Result<ReduceOutput<T>, KernelError>
    where
        T: Element,
        K: ReduceKernel<T>,
    {
        validate_tiling(tiling)?;
        let mut ws = Workspace::new(
            kernel.outputs(),
            tiling.used_core_num as usize,
            tiling.groups as usize,
        );
        self.launch_reduce_in(kernel, tiling, &mut ws)
    }

    /// Run a reduction on every core using the caller's workspace.
    ///
    /// Stage 1 runs [`reduce_core`](Self::reduce_core) for each core in
    /// parallel, each writing only its own workspace slices. Stage 2 runs on
    /// core 0 after every core has finished: each workspace column is
    /// binary-tree reduced and finalized.
    ///
    /// # Errors
    ///
    /// Returns [`KernelError::ArgumentMismatch`] if the workspace layout does
    /// not match the launch, and the first error of any core.
    #[instrument(skip(self, kernel, tiling, ws), fields(cores = tiling.used_core_num, total = tiling.total))]
    pub fn launch_reduce_in<T, K>(
        &self,
        kernel: &K,
        tiling: &TilingConfig,
        ws: &mut Workspace<T>,
    ) -> Result<ReduceOutput<T>, KernelError>
    where
        T: Element,
        K: ReduceKernel<T>,
    {
        validate_tiling(tiling)?;
        let cores = tiling.used_core_num as usize;
        let groups = tiling.groups as usize;
        let outputs = kernel.outputs();
        if ws.num_cores() != cores || ws.num_arrays() < outputs || ws.a_dim() < groups {
            return Err(KernelError::ArgumentMismatch(format!(
                "workspace is {} arrays x {} cores x {}, launch needs {outputs} x {cores} x {groups}",
                ws.num_arrays(),
                ws.num_cores(),
                ws.a_dim(),
            )));
        }

        let reports = ws
            .core_slices_mut()
            .into_par_iter()
            .map(|mut view| self.reduce_core(kernel, tiling, view.core, &mut view.arrays))
            .collect::<Result<Vec<_>, _>>()?;
        debug!(cores, "all cores reached the barrier");

        let values = self.merge_cores(kernel, tiling, ws)?;
        Ok(ReduceOutput { values, reports })
    }

    /// Designated-core pass: reduce each workspace column across cores and
    /// finalize it.
    fn merge_cores<T, K>(
        &self,
        kernel: &K,
        tiling: &TilingConfig,
        ws: &Workspace<T>,
    ) -> Result<Vec<Vec<T>>, KernelError>
    where
        T: Element,
        K: ReduceKernel<T>,
    {
        let reducer = self.reducer::<T>()?;
        let groups = tiling.groups as usize;
        let mut column = vec![T::ZERO; ws.num_cores()];
        let mut scratch = Vec::new();
        let mut values = Vec::with_capacity(kernel.outputs());
        for j in 0..kernel.outputs() {
            let mut row = Vec::with_capacity(groups);
            for g in 0..groups {
                ws.column(j, g, &mut column);
                let acc = reducer.reduce_with(kernel.op(), &column, &mut scratch)?;
                row.push(kernel.finalize(j, g, acc, tiling.total));
            }
            values.push(row);
        }
        debug!(outputs = values.len(), groups, "cross-core merge complete");
        Ok(values)
    }

    // -- map ---------------------------------------------------------------

    /// Run core `core`'s share of a map kernel, storing outputs into `sink`.
    ///
    /// # Errors
    ///
    /// Returns [`KernelError::InvalidConfig`] for an invalid record or a
    /// slot layout that does not fit scratch, and propagates transfer
    /// faults of loads and stores.
    #[instrument(skip(self, kernel, tiling, sink))]
    pub fn map_core<T, K, S>(
        &self,
        kernel: &K,
        tiling: &TilingConfig,
        core: usize,
        sink: &mut S,
    ) -> Result<CoreReport, KernelError>
    where
        T: Element,
        K: MapKernel<T>,
        S: TileSink<T>,
    {
        let split = CoreSplit::from_config(tiling)?;
        let buffer_num = self.config.buffer_num;
        let plan = split.core_plan(core, tiling.tile_factor, buffer_num as u32)?;
        let reducer = self.reducer::<T>()?;
        let tile_factor = tiling.tile_factor as usize;
        let record = self.config.record_events;

        let mut arena = ScratchArena::with_capacity(self.config.scratch_bytes);
        let mut queues = kernel
            .input_streams()
            .iter()
            .enumerate()
            .map(|(s, &stream)| {
                TransferQueue::<T>::in_arena(&mut arena, stream, buffer_num, kernel.input_len(s, tile_factor), record)
            })
            .collect::<Result<Vec<_>, _>>()?;
        let mut out_q =
            TransferQueue::<T>::in_arena(&mut arena, kernel.output_stream(), buffer_num, tile_factor, record)?;

        debug!(
            core,
            range = ?split.range(core),
            tiles = plan.len(),
            scratch = arena.bytes_used(),
            "map plan"
        );

        let mut report = CoreReport {
            core,
            items: split.share(core),
            scratch_bytes: arena.bytes_used(),
            ..Default::default()
        };

        let load = |stream: usize, tile: &TileDescriptor, dst: &mut [T]| kernel.load(stream, tile, dst);
        let load_len = |stream: usize, tile: &TileDescriptor| kernel.input_len(stream, tile.length as usize);

        let n = plan.len();
        let mut inflight = match plan.get(0) {
            Some(first) => Some(issue_loads(&mut queues, &first, &load, &load_len)?),
            None => None,
        };
        for i in 0..n {
            let (Some(tile), Some(handles)) = (plan.get(i), inflight.take()) else {
                break;
            };
            let mut next = None;
            if buffer_num >= 2 {
                if let Some(t) = plan.get(i + 1) {
                    next = Some(issue_loads(&mut queues, &t, &load, &load_len)?);
                }
            }

            for (q, &h) in queues.iter_mut().zip(&handles) {
                q.wait_loaded(h)?;
            }
            let out_h = out_q.alloc_slot(&tile)?;
            {
                let inputs = queues
                    .iter()
                    .zip(&handles)
                    .map(|(q, &h)| q.view(h))
                    .collect::<Result<Vec<_>, _>>()?;
                let dst = out_q.view_mut(out_h, tile.length as usize)?;
                kernel.compute(&inputs, &tile, &reducer, dst)?;
            }
            out_q.issue_store(out_h, |t, data| sink.store(t, data))?;
            for (q, &h) in queues.iter_mut().zip(&handles) {
                q.free_slot(h)?;
            }
            trace!(core, tile = tile.index, offset = tile.offset, "tile mapped");
            report.tiles += 1;

            if buffer_num < 2 {
                if let Some(t) = plan.get(i + 1) {
                    next = Some(issue_loads(&mut queues, &t, &load, &load_len)?);
                }
            }
            inflight = next;
        }
        out_q.drain();

        if record {
            for q in queues.iter_mut() {
                report.events.extend(q.take_events());
            }
            report.events.extend(out_q.take_events());
        }
        Ok(report)
    }

    /// Run a map kernel on every core, each storing into its own range of a
    /// freshly allocated output.
    ///
    /// # Errors
    ///
    /// Returns the first error of any core.
    #[instrument(skip(self, kernel, tiling), fields(cores = tiling.used_core_num, total = tiling.total))]
    pub fn launch_map<T, K>(&self, kernel: &K, tiling: &TilingConfig) -> Result<MapOutput<T>, KernelError>
    where
        T: Element,
        K: MapKernel<T>,
    {
        validate_tiling(tiling)?;
        let split = CoreSplit::from_config(tiling)?;
        let mut values = vec![T::ZERO; tiling.total as usize];

        let mut parts: Vec<(usize, Range<u64>, &mut [T])> = Vec::with_capacity(split.cores());
        let mut rest: &mut [T] = &mut values;
        for core in 0..split.cores() {
            let range = split.range(core);
            let (mine, tail) = std::mem::take(&mut rest).split_at_mut(split.share(core) as usize);
            parts.push((core, range, mine));
            rest = tail;
        }

        let reports = parts
            .into_par_iter()
            .map(|(core, range, dst)| {
                let mut sink = SliceSink::new(range.start, dst);
                self.map_core(kernel, tiling, core, &mut sink)
            })
            .collect::<Result<Vec<_>, _>>()?;
        debug!(cores = split.cores(), "map launch complete");

        Ok(MapOutput { values, reports })
    }
}

/// Allocate a slot on every input queue for `tile` and issue its loads.
fn issue_loads<T, L, N>(
    queues: &mut [TransferQueue<T>],
    tile: &TileDescriptor,
    load: &L,
    load_len: &N,
) -> Result<Vec<SlotHandle>, KernelError>
where
    T: Element,
    L: Fn(usize, &TileDescriptor, &mut [T]) -> Result<(), KernelError>,
    N: Fn(usize, &TileDescriptor) -> usize,
{
    queues
        .iter_mut()
        .enumerate()
        .map(|(s, q)| {
            let h = q.alloc_slot(tile)?;
            q.issue_load(h, load_len(s, tile), |t, dst| load(s, t, dst))?;
            Ok(h)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::Sum;

    /// Sums rows of a dense `[groups, total]` matrix.
    struct RowSum {
        data: Vec<f64>,
        total: usize,
    }

    impl ReduceKernel<f64> for RowSum {
        type Op = Sum;

        fn op(&self) -> &Sum {
            &Sum
        }

        fn input_streams(&self) -> &'static [&'static str] {
            &["x"]
        }

        fn load(
            &self,
            _stream: usize,
            groups: Range<usize>,
            tile: &TileDescriptor,
            dst: &mut [f64],
        ) -> Result<(), KernelError> {
            let len = tile.length as usize;
            for (row, g) in groups.enumerate() {
                let src = g * self.total + tile.offset as usize;
                dst[row * len..(row + 1) * len].copy_from_slice(&self.data[src..src + len]);
            }
            Ok(())
        }

        fn partials(
            &self,
            inputs: &[&[f64]],
            groups: Range<usize>,
            tile: &TileDescriptor,
            reducer: &BinaryTreeReducer,
            _work: &mut [f64],
            out: &mut [Vec<f64>],
        ) -> Result<(), KernelError> {
            let len = tile.length as usize;
            reducer.reduce_groups(&Sum, inputs[0], len, len, groups.len(), &mut out[0])?;
            Ok(())
        }
    }

    fn row_sum(groups: usize, total: usize) -> RowSum {
        RowSum {
            data: (0..groups * total).map(|i| (i % 7) as f64).collect(),
            total,
        }
    }

    #[test]
    fn reduce_matches_naive_for_each_buffer_count() {
        let k = row_sum(5, 103);
        let tiling = TilingConfig::plan(103, 5, 3, 16, 2).unwrap();
        let expected: Vec<f64> = (0..5)
            .map(|g| k.data[g * 103..(g + 1) * 103].iter().sum())
            .collect();
        for buffer_num in 1..=3 {
            let engine = TiledEngine::new(EngineConfig {
                buffer_num,
                ..Default::default()
            })
            .unwrap();
            let out = engine.launch_reduce(&k, &tiling).unwrap();
            assert_eq!(out.values[0], expected, "buffer_num = {buffer_num}");
            assert_eq!(out.reports.len(), 3);
        }
    }

    #[test]
    fn idle_core_contributes_identity() {
        let k = row_sum(1, 2);
        let mut tiling = TilingConfig::plan(2, 1, 1, 4, 1).unwrap();
        tiling.used_core_num = 4;
        tiling.block_factor = 0;
        tiling.tail_block_num = 2;
        let out = TiledEngine::default().launch_reduce(&k, &tiling).unwrap();
        assert_eq!(out.values[0], vec![1.0]);
        assert_eq!(out.reports[3].tiles, 0);
    }

    #[test]
    fn scratch_overflow_is_config_error() {
        let k = row_sum(4, 64);
        let tiling = TilingConfig::plan(64, 4, 1, 64, 4).unwrap();
        let engine = TiledEngine::new(EngineConfig {
            scratch_bytes: 256,
            ..Default::default()
        })
        .unwrap();
        let err = engine.launch_reduce(&k, &tiling).unwrap_err();
        assert!(matches!(err, KernelError::InvalidConfig(_)));
    }

    #[test]
    fn tile_budget_fits_scratch() {
        let engine = TiledEngine::default();
        let tf = engine.tile_budget::<f32>(5).unwrap();
        assert_eq!(tf % 64, 0);
        assert!(tf as usize * 5 * 4 <= engine.config().scratch_bytes);

        let tiny = TiledEngine::new(EngineConfig {
            scratch_bytes: 1024,
            ..Default::default()
        })
        .unwrap();
        assert!(tiny.tile_budget::<f64>(1).is_err());
    }

    #[test]
    fn tile_for_caps_at_extent_without_wrapping() {
        let engine = TiledEngine::default();
        let budget = engine.tile_budget::<f32>(3).unwrap();
        assert_eq!(engine.tile_for::<f32>(3, 10).unwrap(), 10);
        assert_eq!(engine.tile_for::<f32>(3, 0).unwrap(), 1);
        // 2^32 + 3 would truncate to 3 with a plain cast
        assert_eq!(engine.tile_for::<f32>(3, (1u64 << 32) + 3).unwrap(), budget);
    }

    #[test]
    fn empty_group_axis_gives_empty_outputs() {
        let k = row_sum(0, 16);
        let tiling = TilingConfig::plan(16, 0, 3, 8, 1).unwrap();
        let out = TiledEngine::default().launch_reduce(&k, &tiling).unwrap();
        assert_eq!(out.values, vec![Vec::<f64>::new()]);
        assert_eq!(out.reports.len(), 3);
        assert!(out.reports.iter().all(|r| r.tiles == 0));
    }

    #[test]
    fn workspace_shape_mismatch() {
        let k = row_sum(2, 8);
        let tiling = TilingConfig::plan(8, 2, 2, 4, 2).unwrap();
        let mut ws = Workspace::<f64>::new(1, 3, 2);
        let err = TiledEngine::default()
            .launch_reduce_in(&k, &tiling, &mut ws)
            .unwrap_err();
        assert!(matches!(err, KernelError::ArgumentMismatch(_)));
    }
}
