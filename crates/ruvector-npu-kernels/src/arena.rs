//! On-chip scratch budget.
//!
//! [`ScratchArena`] is a bump allocator over the core's fixed scratch
//! capacity. Every transfer queue reserves `slots x slot_len` elements up
//! front; a layout that does not fit is rejected before the first tile is
//! loaded. [`reset`](ScratchArena::reset) releases every reservation at
//! once, which is what a kernel does between stages.

use crate::error::ConfigError;

/// Offsets inside scratch are aligned to this many bytes (one DMA block).
pub const SCRATCH_ALIGN: usize = 32;

/// One stream's share of the scratch region.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reservation {
    /// Stream that owns the region.
    pub stream: &'static str,
    /// Byte offset of the first slot.
    pub offset: usize,
    /// Number of slots.
    pub slots: usize,
    /// Bytes per slot, rounded up to [`SCRATCH_ALIGN`].
    pub slot_bytes: usize,
}

/// Bump allocator over a fixed scratch capacity.
///
/// # Example
///
/// ```
/// use ruvector_npu_kernels::arena::ScratchArena;
///
/// let mut arena = ScratchArena::with_capacity(1024);
/// arena.reserve("x", 2, 64, 4).unwrap();
/// assert_eq!(arena.bytes_used(), 512);
/// assert!(arena.reserve("y", 2, 128, 4).is_err());
/// arena.reset();
/// assert_eq!(arena.bytes_used(), 0);
/// ```
#[derive(Debug, Clone)]
pub struct ScratchArena {
    capacity: usize,
    offset: usize,
    reservations: Vec<Reservation>,
}

impl ScratchArena {
    /// Create an empty arena of `capacity` bytes.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity,
            offset: 0,
            reservations: Vec::new(),
        }
    }

    /// Reserve `slots` slots of `slot_len` elements of `elem_bytes` each.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::ScratchOverflow`] if the reservation does not
    /// fit in the remaining capacity (or its size overflows `usize`).
    pub fn reserve(
        &mut self,
        stream: &'static str,
        slots: usize,
        slot_len: usize,
        elem_bytes: usize,
    ) -> Result<Reservation, ConfigError> {
        let overflow = || ConfigError::ScratchOverflow {
            requested: usize::MAX,
            capacity: self.capacity,
        };
        let raw = slot_len.checked_mul(elem_bytes).ok_or_else(overflow)?;
        let slot_bytes = raw
            .checked_add(SCRATCH_ALIGN - 1)
            .ok_or_else(overflow)?
            & !(SCRATCH_ALIGN - 1);
        let bytes = slot_bytes.checked_mul(slots).ok_or_else(overflow)?;
        let end = self.offset.checked_add(bytes).ok_or_else(overflow)?;
        if end > self.capacity {
            return Err(ConfigError::ScratchOverflow {
                requested: end,
                capacity: self.capacity,
            });
        }
        let reservation = Reservation {
            stream,
            offset: self.offset,
            slots,
            slot_bytes,
        };
        self.offset = end;
        self.reservations.push(reservation.clone());
        Ok(reservation)
    }

    /// Release every reservation.
    pub fn reset(&mut self) {
        self.offset = 0;
        self.reservations.clear();
    }

    /// Bytes currently reserved.
    pub fn bytes_used(&self) -> usize {
        self.offset
    }

    /// Bytes still available.
    pub fn remaining(&self) -> usize {
        self.capacity - self.offset
    }

    /// Total capacity in bytes.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Reservations in allocation order.
    pub fn reservations(&self) -> &[Reservation] {
        &self.reservations
    }
}
