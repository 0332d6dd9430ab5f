//! Tiled streaming reduction kernels for NPU-style vector cores.
//!
//! A kernel's work is split across cores ([`partition::CoreSplit`]), each
//! core's share is cut into tiles that fit its scratch memory
//! ([`partition::TilePlan`]), and tiles stream through double-buffered
//! transfer queues ([`pipeline::TransferQueue`]) so the next tile loads
//! while the current one is reduced. Tiles are reduced with a vector-width
//! binary tree ([`reducer::BinaryTreeReducer`]) and merged in a
//! binary-counter cache ([`accumulator::PartialResultCache`]) so every value
//! takes part in `O(log n)` combines. Cross-core partials meet in a
//! [`workspace::Workspace`] and are merged by core 0 after the parallel
//! stage.
//!
//! # Operators
//!
//! | Operator | Module | Pattern |
//! |----------|--------|---------|
//! | sum / max / min / mean over `R` of `[A, R]` | [`reduce`] | reduce |
//! | batch-norm backward over `[N, C, L]`, training and inference | [`batch_norm_grad`] | reduce, then map |
//! | 3-D max / average pooling | [`pool3d`] | map |
//!
//! [`dispatch::KernelDispatcher`] picks the variant from a planner tiling
//! key.
//!
//! # Example
//!
//! ```rust
//! use ruvector_npu_kernels::engine::TiledEngine;
//! use ruvector_npu_kernels::reduce::{plan_reduce, reduce_rows};
//! use ruvector_npu_kernels::traits::Sum;
//! use ruvector_npu_kernels::types::GlobalTensor;
//!
//! let engine = TiledEngine::default();
//! let x = GlobalTensor::from_vec(&[2, 1000], (0..2000).map(|i| (i % 7) as f32).collect()).unwrap();
//! let tiling = plan_reduce::<f32>(&engine, x.shape(), 4).unwrap();
//! let sums = reduce_rows(&engine, &x, Sum, &tiling).unwrap();
//! assert_eq!(sums.len(), 2);
//! ```

pub mod accumulator;
pub mod arena;
pub mod batch_norm_grad;
pub mod config;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod events;
pub mod partition;
pub mod pipeline;
pub mod pool3d;
pub mod reduce;
pub mod reducer;
pub mod traits;
pub mod types;
pub mod validation;
pub mod workspace;

pub use config::{EngineConfig, TilingConfig};
pub use engine::TiledEngine;
pub use error::{ConfigError, KernelError};
pub use types::{Element, GlobalTensor, TileDescriptor};
