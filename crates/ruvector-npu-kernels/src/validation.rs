//! Eager validation of engine and tiling configuration.
//!
//! Every launch validates its [`EngineConfig`] and [`TilingConfig`] before
//! the first tile is planned, so planner mistakes surface as
//! [`ConfigError`]s instead of silently wrong reductions.
//!
//! # Limits
//!
//! | Resource              | Limit   | Constant                |
//! |-----------------------|---------|-------------------------|
//! | Cores per launch      | 4,096   | [`MAX_CORES`]           |
//! | Slots per stream      | 4       | [`MAX_BUFFER_NUM`]      |
//! | Vector register bytes | 32-4096 | [`MIN_VECTOR_BYTES`], [`MAX_VECTOR_BYTES`] |

use tracing::warn;

use crate::config::{EngineConfig, TilingConfig};
use crate::error::ConfigError;

// ---------------------------------------------------------------------------
// Limits
// ---------------------------------------------------------------------------

/// Maximum cores a launch may use.
pub const MAX_CORES: u32 = 4096;

/// Maximum scratch slots per stream.
pub const MAX_BUFFER_NUM: usize = 4;

/// Smallest supported vector register.
pub const MIN_VECTOR_BYTES: usize = 32;

/// Largest supported vector register.
pub const MAX_VECTOR_BYTES: usize = 4096;

fn out_of_range(name: &str, value: impl ToString, expected: impl Into<String>) -> ConfigError {
    ConfigError::ParameterOutOfRange {
        name: name.into(),
        value: value.to_string(),
        expected: expected.into(),
    }
}

// ---------------------------------------------------------------------------
// EngineConfig
// ---------------------------------------------------------------------------

/// Validate an [`EngineConfig`].
///
/// 1. `vector_bytes` is a power of two in
///    `[MIN_VECTOR_BYTES, MAX_VECTOR_BYTES]`.
/// 2. `buffer_num` is in `1..=MAX_BUFFER_NUM`.
/// 3. `scratch_bytes` is non-zero.
///
/// # Errors
///
/// Returns the first violated check.
///
/// # Examples
///
/// ```
/// use ruvector_npu_kernels::config::EngineConfig;
/// use ruvector_npu_kernels::validation::validate_engine_config;
///
/// assert!(validate_engine_config(&EngineConfig::default()).is_ok());
/// ```
pub fn validate_engine_config(config: &EngineConfig) -> Result<(), ConfigError> {
    // 1. Register width
    if !config.vector_bytes.is_power_of_two()
        || !(MIN_VECTOR_BYTES..=MAX_VECTOR_BYTES).contains(&config.vector_bytes)
    {
        return Err(out_of_range(
            "vector_bytes",
            config.vector_bytes,
            format!("a power of two in [{MIN_VECTOR_BYTES}, {MAX_VECTOR_BYTES}]"),
        ));
    }

    // 2. Slot count
    if config.buffer_num == 0 {
        return Err(ConfigError::ZeroBudget("buffer_num"));
    }
    if config.buffer_num > MAX_BUFFER_NUM {
        return Err(out_of_range(
            "buffer_num",
            config.buffer_num,
            format!("<= {MAX_BUFFER_NUM}"),
        ));
    }

    // 3. Scratch
    if config.scratch_bytes == 0 {
        return Err(ConfigError::ZeroBudget("scratch_bytes"));
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// TilingConfig
// ---------------------------------------------------------------------------

/// Validate a [`TilingConfig`].
///
/// 1. `used_core_num` is in `1..=MAX_CORES`.
/// 2. `tile_factor` is non-zero; `group_factor` is non-zero when there are
///    groups.
/// 3. `tail_block_num < used_core_num`.
/// 4. `block_factor * used_core_num + tail_block_num == total`.
/// 5. `divisor`, if present, is finite and non-zero.
/// 6. Idle cores (`block_factor == 0`) and `group_factor > groups` emit a
///    [`tracing::warn`] but are accepted.
///
/// # Errors
///
/// Returns the first violated check.
pub fn validate_tiling(tiling: &TilingConfig) -> Result<(), ConfigError> {
    // 1. Cores
    if tiling.used_core_num == 0 {
        return Err(ConfigError::ZeroBudget("used_core_num"));
    }
    if tiling.used_core_num > MAX_CORES {
        return Err(out_of_range(
            "used_core_num",
            tiling.used_core_num,
            format!("<= {MAX_CORES}"),
        ));
    }

    // 2. Loop factors
    if tiling.tile_factor == 0 {
        return Err(ConfigError::ZeroBudget("tile_factor"));
    }
    if tiling.groups > 0 && tiling.group_factor == 0 {
        return Err(ConfigError::ZeroBudget("group_factor"));
    }

    // 3. Tail group
    if tiling.tail_block_num >= tiling.used_core_num {
        return Err(out_of_range(
            "tail_block_num",
            tiling.tail_block_num,
            format!("< used_core_num ({})", tiling.used_core_num),
        ));
    }

    // 4. Coverage
    let covered = tiling
        .block_factor
        .checked_mul(tiling.used_core_num as u64)
        .and_then(|v| v.checked_add(tiling.tail_block_num as u64));
    if covered != Some(tiling.total) {
        return Err(ConfigError::DimensionMismatch(format!(
            "block_factor {} x {} cores + tail {} does not cover total {}",
            tiling.block_factor, tiling.used_core_num, tiling.tail_block_num, tiling.total,
        )));
    }

    // 5. Divisor
    if let Some(d) = tiling.divisor {
        if !d.is_finite() || d == 0.0 {
            return Err(out_of_range("divisor", d, "finite and non-zero"));
        }
    }

    // 6. Suspicious but legal
    if tiling.block_factor == 0 && tiling.total > 0 {
        warn!(
            cores = tiling.used_core_num,
            total = tiling.total,
            "more cores than items, some cores will idle"
        );
    }
    if tiling.group_factor as u64 > tiling.groups && tiling.groups > 0 {
        warn!(
            group_factor = tiling.group_factor,
            groups = tiling.groups,
            "group_factor exceeds group count"
        );
    }

    Ok(())
}
