//! Engine and tiling configuration.
//!
//! [`EngineConfig`] describes the simulated core (vector width, slot count,
//! on-chip budget). [`TilingConfig`] is the planner record a kernel launch
//! consumes read-only; it can be built in-process with
//! [`TilingConfig::plan`] or decoded from its fixed little-endian layout
//! with [`TilingConfig::from_blob`]. [`BinaryAddSchedule`] carries the
//! precomputed fold parameters of the binary-tree reducer.

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

// ---------------------------------------------------------------------------
// EngineConfig
// ---------------------------------------------------------------------------

/// Properties of one simulated execution core.
///
/// # Example
///
/// ```rust
/// use ruvector_npu_kernels::config::EngineConfig;
///
/// let config = EngineConfig {
///     buffer_num: 1,
///     ..Default::default()
/// };
/// assert_eq!(config.vector_bytes, 256);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Width of one vector register in bytes. Must be a power of two.
    ///
    /// Default: `256`.
    pub vector_bytes: usize,

    /// Number of scratch slots per logical stream (`BUFFER_NUM`).
    ///
    /// With `1` transfers serialize against compute; with `2` or more the
    /// load of tile `i + 1` is issued before tile `i` is consumed.
    ///
    /// Default: `2`.
    pub buffer_num: usize,

    /// On-chip scratch capacity in bytes shared by every stream of a core.
    ///
    /// Default: `196_608` (192 KiB).
    pub scratch_bytes: usize,

    /// Record [`TransferEvent`](crate::events::TransferEvent)s in every
    /// transfer queue.
    ///
    /// Default: `false`.
    pub record_events: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            vector_bytes: 256,
            buffer_num: 2,
            scratch_bytes: 192 * 1024,
            record_events: false,
        }
    }
}

// ---------------------------------------------------------------------------
// TilingConfig
// ---------------------------------------------------------------------------

/// Size in bytes of the encoded [`TilingConfig`] blob.
pub const TILING_BLOB_LEN: usize = 48;

/// Planner record for one kernel launch.
///
/// The problem is an `[groups, total]` index space: `groups` independent
/// outputs (the A axis) each reduced or mapped over `total` elements (the R
/// axis for reductions, the flat element index for maps). Cores split the
/// `total` axis with the two-tier block rule; each core then walks its range
/// in chunks of `group_factor` groups and tiles of `tile_factor` elements.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TilingConfig {
    /// Length of the partitioned axis.
    pub total: u64,
    /// Number of independent output groups.
    pub groups: u64,
    /// Cores participating in the launch.
    pub used_core_num: u32,
    /// Base per-core share (`total / used_core_num`).
    pub block_factor: u64,
    /// Cores that take `block_factor + 1` items (`total % used_core_num`).
    pub tail_block_num: u32,
    /// Groups processed per A-chunk.
    pub group_factor: u32,
    /// Elements per tile along the partitioned axis.
    pub tile_factor: u32,
    /// Optional divisor applied by finalizers that need one.
    pub divisor: Option<f64>,
}

impl TilingConfig {
    /// Derive a record for `groups x total` over at most `max_cores` cores.
    ///
    /// The number of cores used never exceeds `total` so that every core has
    /// at least one item.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::ZeroBudget`] if `max_cores`, `tile_factor` or
    /// `group_factor` is zero.
    pub fn plan(
        total: u64,
        groups: u64,
        max_cores: u32,
        tile_factor: u32,
        group_factor: u32,
    ) -> Result<Self, ConfigError> {
        if max_cores == 0 {
            return Err(ConfigError::ZeroBudget("max_cores"));
        }
        if tile_factor == 0 {
            return Err(ConfigError::ZeroBudget("tile_factor"));
        }
        if group_factor == 0 {
            return Err(ConfigError::ZeroBudget("group_factor"));
        }
        let used_core_num = (max_cores as u64).min(total.max(1)) as u32;
        Ok(Self {
            total,
            groups,
            used_core_num,
            block_factor: total / used_core_num as u64,
            tail_block_num: (total % used_core_num as u64) as u32,
            group_factor: group_factor.min(groups.max(1).min(u32::MAX as u64) as u32),
            tile_factor,
            divisor: None,
        })
    }

    /// Builder-style divisor override.
    pub fn with_divisor(mut self, divisor: f64) -> Self {
        self.divisor = Some(divisor);
        self
    }

    /// Number of A-chunks each core walks.
    pub fn group_chunks(&self) -> u64 {
        if self.groups == 0 {
            return 0;
        }
        self.groups.div_ceil(self.group_factor.max(1) as u64)
    }

    /// Elements of one scratch slot (`group_factor * tile_factor`).
    pub fn slot_len(&self) -> usize {
        self.group_factor as usize * self.tile_factor as usize
    }

    /// Encode into the fixed little-endian layout.
    ///
    /// | offset | type | field |
    /// |--------|------|-------|
    /// | 0 | u64 | `total` |
    /// | 8 | u64 | `groups` |
    /// | 16 | u64 | `block_factor` |
    /// | 24 | u32 | `used_core_num` |
    /// | 28 | u32 | `tail_block_num` |
    /// | 32 | u32 | `group_factor` |
    /// | 36 | u32 | `tile_factor` |
    /// | 40 | f64 | `divisor` (NaN when absent) |
    pub fn to_blob(&self) -> [u8; TILING_BLOB_LEN] {
        let mut out = [0u8; TILING_BLOB_LEN];
        out[0..8].copy_from_slice(&self.total.to_le_bytes());
        out[8..16].copy_from_slice(&self.groups.to_le_bytes());
        out[16..24].copy_from_slice(&self.block_factor.to_le_bytes());
        out[24..28].copy_from_slice(&self.used_core_num.to_le_bytes());
        out[28..32].copy_from_slice(&self.tail_block_num.to_le_bytes());
        out[32..36].copy_from_slice(&self.group_factor.to_le_bytes());
        out[36..40].copy_from_slice(&self.tile_factor.to_le_bytes());
        out[40..48].copy_from_slice(&self.divisor.unwrap_or(f64::NAN).to_le_bytes());
        out
    }

    /// Decode from the layout written by [`to_blob`](Self::to_blob).
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MalformedBlob`] if `blob` is shorter than
    /// [`TILING_BLOB_LEN`].
    pub fn from_blob(blob: &[u8]) -> Result<Self, ConfigError> {
        if blob.len() < TILING_BLOB_LEN {
            return Err(ConfigError::MalformedBlob(format!(
                "expected {TILING_BLOB_LEN} bytes, got {}",
                blob.len()
            )));
        }
        let u64_at = |at: usize| {
            let mut b = [0u8; 8];
            b.copy_from_slice(&blob[at..at + 8]);
            u64::from_le_bytes(b)
        };
        let u32_at = |at: usize| {
            let mut b = [0u8; 4];
            b.copy_from_slice(&blob[at..at + 4]);
            u32::from_le_bytes(b)
        };
        let divisor = f64::from_bits(u64_at(40));
        Ok(Self {
            total: u64_at(0),
            groups: u64_at(8),
            block_factor: u64_at(16),
            used_core_num: u32_at(24),
            tail_block_num: u32_at(28),
            group_factor: u32_at(32),
            tile_factor: u32_at(36),
            divisor: if divisor.is_nan() { None } else { Some(divisor) },
        })
    }
}

// ---------------------------------------------------------------------------
// BinaryAddSchedule
// ---------------------------------------------------------------------------

/// Fold parameters of the binary-tree reducer for one reduction length.
///
/// `quotient` is the power-of-two split point of the odd-tail fold, `k` the
/// number of in-place halving rounds over the compacted buffer and
/// `last_num` the number of lanes of the final intra-register reduction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BinaryAddSchedule {
    /// Power-of-two fold point (`binaryAddQuotient`).
    pub quotient: usize,
    /// Halving rounds (`binaryAddK`).
    pub k: u32,
    /// Valid lanes of the last register (`binaryAddLastNum`).
    pub last_num: usize,
}

impl BinaryAddSchedule {
    /// Planner-side derivation for a reduction of `len` elements with
    /// `vector_width` lanes.
    ///
    /// Returns `None` when `len <= vector_width` (a single masked register
    /// reduction needs no schedule).
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::ParameterOutOfRange`] if `vector_width` is not
    /// a power of two.
    pub fn for_length(len: usize, vector_width: usize) -> Result<Option<Self>, ConfigError> {
        if !vector_width.is_power_of_two() {
            return Err(ConfigError::ParameterOutOfRange {
                name: "vector_width".into(),
                value: vector_width.to_string(),
                expected: "a power of two".into(),
            });
        }
        if len <= vector_width {
            return Ok(None);
        }
        let quotient = if len.is_power_of_two() {
            len / 2
        } else {
            1usize << (usize::BITS - 1 - len.leading_zeros())
        };
        let vcadd = quotient / vector_width;
        let (k, last_num) = if vcadd <= vector_width {
            (0, vcadd)
        } else {
            ((vcadd / vector_width).trailing_zeros(), vector_width)
        };
        Ok(Some(Self {
            quotient,
            k,
            last_num,
        }))
    }

    /// Length of the compacted binary-add buffer (one value per
    /// register-width chunk of the quotient region).
    pub fn buffer_len(&self, vector_width: usize) -> usize {
        self.quotient / vector_width
    }
}
