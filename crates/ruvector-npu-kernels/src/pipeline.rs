//! Double-buffered transfer pipeline.
//!
//! A [`TransferQueue`] owns the `buffer_num` scratch slots of one logical
//! stream. Each slot is an explicit state machine:
//!
//! ```text
//! Free -> Allocated -> LoadPending -> Loaded --------+-> Free
//!             |                         |            |
//!             +------> StorePending <---+            |
//!                          |                         |
//!                          +------> Stored ----------+
//! ```
//!
//! Tile `i` uses slot `i mod buffer_num`. Allocating a slot whose previous
//! occupant still has a store in flight first waits for that store, so the
//! store of tile `i - buffer_num` always completes before tile `i` touches
//! the slot. Transfers are executed synchronously at issue time; the data is
//! only reachable through the queue after the matching wait.
//!
//! Callers hold a [`SlotHandle`] per in-flight tile. Handles carry a
//! generation number so a handle kept past [`free_slot`](TransferQueue::free_slot)
//! is rejected instead of aliasing the next occupant.

use tracing::trace;

use crate::arena::ScratchArena;
use crate::error::{ConfigError, KernelError};
use crate::events::TransferEvent;
use crate::types::{Element, TileDescriptor};

/// Lifecycle state of one scratch slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SlotState {
    /// Not owned by any tile.
    Free,
    /// Owned by a tile, contents undefined.
    Allocated,
    /// Load issued, not yet waited for.
    LoadPending,
    /// Load waited for; readable.
    Loaded,
    /// Store issued, not yet waited for.
    StorePending,
    /// Store waited for; awaiting release.
    Stored,
}

impl SlotState {
    /// Lower-case name used in diagnostics.
    pub fn name(self) -> &'static str {
        match self {
            Self::Free => "free",
            Self::Allocated => "allocated",
            Self::LoadPending => "load-pending",
            Self::Loaded => "loaded",
            Self::StorePending => "store-pending",
            Self::Stored => "stored",
        }
    }
}

/// Ticket for one tile's occupancy of a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SlotHandle {
    slot: usize,
    generation: u64,
}

impl SlotHandle {
    /// Slot index this handle refers to.
    #[inline]
    pub fn slot(&self) -> usize {
        self.slot
    }
}

#[derive(Debug)]
struct Slot<T> {
    state: SlotState,
    generation: u64,
    len: usize,
    tile: Option<TileDescriptor>,
    data: Vec<T>,
}

/// Fixed set of scratch slots for one logical stream.
#[derive(Debug)]
pub struct TransferQueue<T> {
    stream: &'static str,
    slot_len: usize,
    slots: Vec<Slot<T>>,
    events: Option<Vec<TransferEvent>>,
}

impl<T: Element> TransferQueue<T> {
    /// Create a queue of `buffer_num` slots holding `slot_len` elements each.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::ZeroBudget`] if `buffer_num == 0`.
    pub fn new(
        stream: &'static str,
        buffer_num: usize,
        slot_len: usize,
        record_events: bool,
    ) -> Result<Self, ConfigError> {
        if buffer_num == 0 {
            return Err(ConfigError::ZeroBudget("buffer_num"));
        }
        let slots = (0..buffer_num)
            .map(|_| Slot {
                state: SlotState::Free,
                generation: 0,
                len: 0,
                tile: None,
                data: vec![T::ZERO; slot_len],
            })
            .collect();
        Ok(Self {
            stream,
            slot_len,
            slots,
            events: record_events.then(Vec::new),
        })
    }

    /// Like [`new`](Self::new), but first reserves the slots in `arena`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::ScratchOverflow`] if the slots do not fit.
    pub fn in_arena(
        arena: &mut ScratchArena,
        stream: &'static str,
        buffer_num: usize,
        slot_len: usize,
        record_events: bool,
    ) -> Result<Self, ConfigError> {
        arena.reserve(stream, buffer_num, slot_len, std::mem::size_of::<T>())?;
        Self::new(stream, buffer_num, slot_len, record_events)
    }

    /// Stream name.
    pub fn stream(&self) -> &'static str {
        self.stream
    }

    /// Number of slots.
    pub fn buffer_num(&self) -> usize {
        self.slots.len()
    }

    /// Capacity of one slot in elements.
    pub fn slot_len(&self) -> usize {
        self.slot_len
    }

    /// Current state of `slot`.
    pub fn state(&self, slot: usize) -> Option<SlotState> {
        self.slots.get(slot).map(|s| s.state)
    }

    /// Recorded events (empty unless recording is enabled).
    pub fn events(&self) -> &[TransferEvent] {
        self.events.as_deref().unwrap_or(&[])
    }

    /// Drain the recorded events.
    pub fn take_events(&mut self) -> Vec<TransferEvent> {
        self.events.as_mut().map(std::mem::take).unwrap_or_default()
    }

    /// Claim slot `tile.buffer_slot mod buffer_num` for `tile`.
    ///
    /// If the previous occupant's store is still pending it is waited for and
    /// the slot released first.
    ///
    /// # Errors
    ///
    /// Returns [`KernelError::SlotState`] if the slot is still held by a tile
    /// that has not been stored or freed.
    pub fn alloc_slot(&mut self, tile: &TileDescriptor) -> Result<SlotHandle, KernelError> {
        let slot = tile.buffer_slot as usize % self.slots.len();
        match self.slots[slot].state {
            SlotState::Free => {}
            SlotState::StorePending | SlotState::Stored => {
                self.retire(slot);
            }
            other => {
                return Err(KernelError::SlotState {
                    stream: self.stream,
                    slot,
                    expected: SlotState::Free.name(),
                    found: other.name(),
                })
            }
        }
        let s = &mut self.slots[slot];
        s.generation += 1;
        s.state = SlotState::Allocated;
        s.len = 0;
        s.tile = Some(*tile);
        let generation = s.generation;
        trace!(stream = self.stream, slot, offset = tile.offset, "slot allocated");
        self.record(|stream| TransferEvent::SlotAllocated {
            stream,
            tile_offset: tile.offset,
            slot,
        });
        Ok(SlotHandle { slot, generation })
    }

    /// Issue the load of `len` elements into the slot. `fill` is the DMA
    /// descriptor: it writes the slot contents from global memory.
    ///
    /// # Errors
    ///
    /// Propagates the [`KernelError::TransferFault`] of `fill`, and returns
    /// one itself if `len` exceeds the slot capacity.
    pub fn issue_load<F>(&mut self, handle: SlotHandle, len: usize, fill: F) -> Result<(), KernelError>
    where
        F: FnOnce(&TileDescriptor, &mut [T]) -> Result<(), KernelError>,
    {
        let slot = self.check(handle, &[SlotState::Allocated])?;
        let tile = self.tile_of(slot);
        if len > self.slot_len {
            return Err(KernelError::TransferFault {
                stream: self.stream,
                tile_offset: tile.offset,
                detail: format!("load of {len} elements exceeds slot of {}", self.slot_len),
            });
        }
        let s = &mut self.slots[slot];
        fill(&tile, &mut s.data[..len])?;
        s.len = len;
        s.state = SlotState::LoadPending;
        self.record(|stream| TransferEvent::LoadIssued {
            stream,
            tile_offset: tile.offset,
            slot,
        });
        Ok(())
    }

    /// Wait for the slot's load and return its contents.
    ///
    /// # Errors
    ///
    /// Returns [`KernelError::SlotState`] if no load is pending.
    pub fn wait_loaded(&mut self, handle: SlotHandle) -> Result<&[T], KernelError> {
        let slot = self.check(handle, &[SlotState::LoadPending])?;
        self.slots[slot].state = SlotState::Loaded;
        let offset = self.tile_of(slot).offset;
        self.record(|stream| TransferEvent::LoadCompleted {
            stream,
            tile_offset: offset,
            slot,
        });
        let s = &self.slots[slot];
        Ok(&s.data[..s.len])
    }

    /// Read-only view of a loaded slot.
    ///
    /// # Errors
    ///
    /// Returns [`KernelError::SlotState`] unless the slot is `Loaded`.
    pub fn view(&self, handle: SlotHandle) -> Result<&[T], KernelError> {
        let slot = self.check(handle, &[SlotState::Loaded])?;
        let s = &self.slots[slot];
        Ok(&s.data[..s.len])
    }

    /// Writable view of `len` elements, for compute that produces the slot
    /// contents (output streams) or updates a loaded tile in place.
    ///
    /// # Errors
    ///
    /// Returns [`KernelError::SlotState`] unless the slot is `Allocated` or
    /// `Loaded`, and [`KernelError::TransferFault`] if `len` exceeds the
    /// slot capacity.
    pub fn view_mut(&mut self, handle: SlotHandle, len: usize) -> Result<&mut [T], KernelError> {
        let slot = self.check(handle, &[SlotState::Allocated, SlotState::Loaded])?;
        if len > self.slot_len {
            return Err(KernelError::TransferFault {
                stream: self.stream,
                tile_offset: self.tile_of(slot).offset,
                detail: format!("view of {len} elements exceeds slot of {}", self.slot_len),
            });
        }
        let s = &mut self.slots[slot];
        s.len = len;
        Ok(&mut s.data[..len])
    }

    /// Issue the store of the slot contents. `drain` is the DMA descriptor:
    /// it writes the contents to global memory.
    ///
    /// # Errors
    ///
    /// Returns [`KernelError::SlotState`] unless compute has finished with
    /// the slot (`Allocated` or `Loaded`), and propagates faults of `drain`.
    pub fn issue_store<F>(&mut self, handle: SlotHandle, drain: F) -> Result<(), KernelError>
    where
        F: FnOnce(&TileDescriptor, &[T]) -> Result<(), KernelError>,
    {
        let slot = self.check(handle, &[SlotState::Allocated, SlotState::Loaded])?;
        let tile = self.tile_of(slot);
        let s = &mut self.slots[slot];
        drain(&tile, &s.data[..s.len])?;
        s.state = SlotState::StorePending;
        self.record(|stream| TransferEvent::StoreIssued {
            stream,
            tile_offset: tile.offset,
            slot,
        });
        Ok(())
    }

    /// Wait for the slot's store.
    ///
    /// # Errors
    ///
    /// Returns [`KernelError::SlotState`] if no store is pending.
    pub fn wait_stored(&mut self, handle: SlotHandle) -> Result<(), KernelError> {
        let slot = self.check(handle, &[SlotState::StorePending])?;
        self.complete_store(slot);
        Ok(())
    }

    /// Return the slot to the free list.
    ///
    /// # Errors
    ///
    /// Returns [`KernelError::SlotState`] if a transfer on the slot is still
    /// pending.
    pub fn free_slot(&mut self, handle: SlotHandle) -> Result<(), KernelError> {
        let slot = self.check(
            handle,
            &[SlotState::Allocated, SlotState::Loaded, SlotState::Stored],
        )?;
        self.release(slot);
        Ok(())
    }

    /// Wait for every pending store and free every stored slot.
    ///
    /// Called at the end of a pass so the last `buffer_num` stores are
    /// visible before the kernel returns.
    pub fn drain(&mut self) {
        for slot in 0..self.slots.len() {
            if matches!(
                self.slots[slot].state,
                SlotState::StorePending | SlotState::Stored
            ) {
                self.retire(slot);
            }
        }
    }

    // -- internals ---------------------------------------------------------

    fn check(&self, handle: SlotHandle, allowed: &[SlotState]) -> Result<usize, KernelError> {
        let s = self.slots.get(handle.slot).ok_or(KernelError::SlotState {
            stream: self.stream,
            slot: handle.slot,
            expected: "a slot of this queue",
            found: "out of range",
        })?;
        if s.generation != handle.generation {
            return Err(KernelError::SlotState {
                stream: self.stream,
                slot: handle.slot,
                expected: allowed[0].name(),
                found: "stale handle",
            });
        }
        if !allowed.contains(&s.state) {
            return Err(KernelError::SlotState {
                stream: self.stream,
                slot: handle.slot,
                expected: allowed[0].name(),
                found: s.state.name(),
            });
        }
        Ok(handle.slot)
    }

    fn tile_of(&self, slot: usize) -> TileDescriptor {
        self.slots[slot].tile.unwrap_or(TileDescriptor {
            index: 0,
            offset: 0,
            length: 0,
            is_last: false,
            buffer_slot: slot as u32,
        })
    }

    fn retire(&mut self, slot: usize) {
        if self.slots[slot].state == SlotState::StorePending {
            self.complete_store(slot);
        }
        self.release(slot);
    }

    fn complete_store(&mut self, slot: usize) {
        self.slots[slot].state = SlotState::Stored;
        let offset = self.tile_of(slot).offset;
        self.record(|stream| TransferEvent::StoreCompleted {
            stream,
            tile_offset: offset,
            slot,
        });
    }

    fn release(&mut self, slot: usize) {
        let s = &mut self.slots[slot];
        s.state = SlotState::Free;
        s.tile = None;
        s.len = 0;
        self.record(|stream| TransferEvent::SlotFreed { stream, slot });
    }

    fn record(&mut self, make: impl FnOnce(String) -> TransferEvent) {
        if let Some(events) = self.events.as_mut() {
            events.push(make(self.stream.to_owned()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tile(index: u64, buffer_num: u32) -> TileDescriptor {
        TileDescriptor {
            index,
            offset: index * 4,
            length: 4,
            is_last: false,
            buffer_slot: (index % buffer_num as u64) as u32,
        }
    }

    #[test]
    fn load_then_view() {
        let mut q = TransferQueue::<f32>::new("x", 2, 4, false).unwrap();
        let h = q.alloc_slot(&tile(0, 2)).unwrap();
        q.issue_load(h, 3, |_, dst| {
            dst.copy_from_slice(&[1.0, 2.0, 3.0]);
            Ok(())
        })
        .unwrap();
        // not readable before the wait
        assert!(q.view(h).is_err());
        assert_eq!(q.wait_loaded(h).unwrap(), &[1.0, 2.0, 3.0]);
        q.free_slot(h).unwrap();
        assert_eq!(q.state(0), Some(SlotState::Free));
    }

    #[test]
    fn busy_slot_cannot_be_reallocated() {
        let mut q = TransferQueue::<f32>::new("x", 1, 4, false).unwrap();
        let _h = q.alloc_slot(&tile(0, 1)).unwrap();
        match q.alloc_slot(&tile(1, 1)) {
            Err(KernelError::SlotState { found, .. }) => assert_eq!(found, "allocated"),
            other => panic!("expected SlotState, got {other:?}"),
        }
    }

    #[test]
    fn stale_handle_rejected() {
        let mut q = TransferQueue::<f64>::new("x", 1, 4, false).unwrap();
        let h0 = q.alloc_slot(&tile(0, 1)).unwrap();
        q.free_slot(h0).unwrap();
        let _h1 = q.alloc_slot(&tile(1, 1)).unwrap();
        match q.view_mut(h0, 1) {
            Err(KernelError::SlotState { found, .. }) => assert_eq!(found, "stale handle"),
            other => panic!("expected stale handle, got {other:?}"),
        }
    }

    #[test]
    fn realloc_waits_for_pending_store() {
        let mut q = TransferQueue::<f32>::new("out", 1, 4, true).unwrap();
        let h = q.alloc_slot(&tile(0, 1)).unwrap();
        q.view_mut(h, 4).unwrap().fill(7.0);
        q.issue_store(h, |_, _| Ok(())).unwrap();
        let _next = q.alloc_slot(&tile(1, 1)).unwrap();
        let kinds: Vec<_> = q
            .events()
            .iter()
            .map(|e| match e {
                TransferEvent::SlotAllocated { .. } => "alloc",
                TransferEvent::StoreIssued { .. } => "store",
                TransferEvent::StoreCompleted { .. } => "stored",
                TransferEvent::SlotFreed { .. } => "free",
                _ => "other",
            })
            .collect();
        assert_eq!(kinds, vec!["alloc", "store", "stored", "free", "alloc"]);
    }

    #[test]
    fn oversize_load_is_transfer_fault() {
        let mut q = TransferQueue::<f32>::new("x", 1, 2, false).unwrap();
        let h = q.alloc_slot(&tile(0, 1)).unwrap();
        let err = q.issue_load(h, 3, |_, _| Ok(())).unwrap_err();
        assert!(matches!(err, KernelError::TransferFault { .. }));
    }

    #[test]
    fn arena_backed_queue_respects_capacity() {
        let mut arena = ScratchArena::with_capacity(64);
        assert!(TransferQueue::<f32>::in_arena(&mut arena, "x", 2, 8, false).is_ok());
        assert!(TransferQueue::<f32>::in_arena(&mut arena, "y", 2, 8, false).is_err());
    }
}
