//! Transfer event log.
//!
//! When [`EngineConfig::record_events`](crate::config::EngineConfig) is set,
//! every [`TransferQueue`](crate::pipeline::TransferQueue) appends a
//! [`TransferEvent`] for each slot transition, giving a replayable trace of
//! the producer/consumer ordering on that stream.

use serde::{Deserialize, Serialize};

/// Slot transitions of one transfer queue.
///
/// Events are tagged with `#[serde(tag = "type")]` so they serialise as
/// `{ "type": "LoadIssued", ... }`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum TransferEvent {
    /// A slot was handed out for a tile.
    SlotAllocated {
        /// Stream name.
        stream: String,
        /// Tile offset along the partitioned axis.
        tile_offset: u64,
        /// Slot index.
        slot: usize,
    },

    /// A load descriptor was issued into the slot.
    LoadIssued {
        /// Stream name.
        stream: String,
        /// Tile offset along the partitioned axis.
        tile_offset: u64,
        /// Slot index.
        slot: usize,
    },

    /// The consumer waited for the load and may now read the slot.
    LoadCompleted {
        /// Stream name.
        stream: String,
        /// Tile offset along the partitioned axis.
        tile_offset: u64,
        /// Slot index.
        slot: usize,
    },

    /// A store descriptor was issued from the slot.
    StoreIssued {
        /// Stream name.
        stream: String,
        /// Tile offset along the partitioned axis.
        tile_offset: u64,
        /// Slot index.
        slot: usize,
    },

    /// The store was waited for; the slot contents are no longer needed.
    StoreCompleted {
        /// Stream name.
        stream: String,
        /// Tile offset along the partitioned axis.
        tile_offset: u64,
        /// Slot index.
        slot: usize,
    },

    /// The slot returned to the free list.
    SlotFreed {
        /// Stream name.
        stream: String,
        /// Slot index.
        slot: usize,
    },
}

impl TransferEvent {
    /// Slot the event refers to.
    pub fn slot(&self) -> usize {
        match self {
            Self::SlotAllocated { slot, .. }
            | Self::LoadIssued { slot, .. }
            | Self::LoadCompleted { slot, .. }
            | Self::StoreIssued { slot, .. }
            | Self::StoreCompleted { slot, .. }
            | Self::SlotFreed { slot, .. } => *slot,
        }
    }

    /// Stream the event refers to.
    pub fn stream(&self) -> &str {
        match self {
            Self::SlotAllocated { stream, .. }
            | Self::LoadIssued { stream, .. }
            | Self::LoadCompleted { stream, .. }
            | Self::StoreIssued { stream, .. }
            | Self::StoreCompleted { stream, .. }
            | Self::SlotFreed { stream, .. } => stream,
        }
    }
}
