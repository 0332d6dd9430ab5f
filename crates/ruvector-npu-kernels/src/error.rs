//! Error types for the kernel crate.
//!
//! Mirrors the three failure classes of an accelerator launch: invalid
//! planner configuration, fatal transfer faults, and dispatch misses. All
//! errors implement `std::error::Error` via `thiserror`.

/// Primary error type for kernel operations.
///
/// A launch either runs to completion or returns one of these; there is no
/// per-tile or per-element error granularity and no partial result salvage.
#[derive(Debug, thiserror::Error)]
pub enum KernelError {
    /// The tiling or engine configuration violates a precondition.
    #[error("invalid configuration: {0}")]
    InvalidConfig(#[from] ConfigError),

    /// A load or store descriptor could not be executed. Fatal for the whole
    /// launch: a partially transferred tile would corrupt the reduction.
    #[error("transfer fault on stream `{stream}` at offset {tile_offset}: {detail}")]
    TransferFault {
        /// Logical stream that issued the transfer.
        stream: &'static str,
        /// Global offset of the tile being transferred.
        tile_offset: u64,
        /// Human-readable explanation.
        detail: String,
    },

    /// No kernel variant is registered for the supplied tiling key.
    #[error("unsupported tiling key {key}")]
    UnsupportedTilingKey {
        /// The unmatched key.
        key: u64,
    },

    /// A scratch slot was driven out of its state-machine order.
    #[error("slot {slot} of stream `{stream}` is {found}, expected {expected}")]
    SlotState {
        /// Logical stream owning the slot.
        stream: &'static str,
        /// Slot index within the stream.
        slot: usize,
        /// State the operation required.
        expected: &'static str,
        /// State the slot was actually in.
        found: &'static str,
    },

    /// The dispatch key and the supplied argument record disagree.
    #[error("argument mismatch: {0}")]
    ArgumentMismatch(String),
}

/// Configuration errors raised before any tile is touched.
///
/// These are the caller obligations of the external planner; checking them
/// eagerly turns silent numeric corruption into a clear diagnostic.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A per-loop or per-core budget of zero was supplied.
    #[error("tile budget `{0}` must be non-zero")]
    ZeroBudget(&'static str),

    /// A reduction over an empty group was requested.
    #[error("reduction over an empty group")]
    EmptyReduction,

    /// A parameter is outside its valid range.
    #[error("parameter out of range: {name} = {value} (expected {expected})")]
    ParameterOutOfRange {
        /// Name of the parameter.
        name: String,
        /// The invalid value (as a string for flexibility).
        value: String,
        /// Human-readable description of the valid range.
        expected: String,
    },

    /// The requested slot layout does not fit the on-chip scratch budget.
    #[error("scratch reservation of {requested} bytes exceeds capacity {capacity} bytes")]
    ScratchOverflow {
        /// Total bytes that would be reserved.
        requested: usize,
        /// Scratch capacity in bytes.
        capacity: usize,
    },

    /// Tensor shapes or buffer lengths are inconsistent.
    #[error("dimension mismatch: {0}")]
    DimensionMismatch(String),

    /// A tiling blob could not be decoded.
    #[error("malformed tiling blob: {0}")]
    MalformedBlob(String),
}
