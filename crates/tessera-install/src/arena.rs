//! Shared chunk arena
//!
//! A fixed budget of bytes split into equal slots, one decoded chunk per
//! slot. Slots are handed out by the submitter, filled by exactly one
//! download worker, read by the writer and returned once the last writer
//! task using the chunk completes. Ownership moves with the [`Slot`] value
//! carried in task messages.
//!
//! Slot buffers are allocated on first use, so the resident size follows
//! the number of slots actually in flight rather than the configured budget.

use std::collections::VecDeque;

use parking_lot::Mutex;
use thiserror::Error;

/// Arena misuse
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ArenaError {
    /// Budget smaller than a single slot
    #[error("arena of {size} bytes cannot hold a {slot_size}-byte slot")]
    TooSmall {
        /// Configured budget
        size: u64,
        /// Slot size
        slot_size: usize,
    },

    /// Data larger than a slot
    #[error("{len} bytes do not fit into a {slot_size}-byte slot")]
    Overflow {
        /// Data length
        len: usize,
        /// Slot size
        slot_size: usize,
    },

    /// Read outside the slot's filled range
    #[error("range {offset}+{len} outside the {filled} bytes stored in slot {index}")]
    OutOfRange {
        /// Slot index
        index: usize,
        /// Requested offset
        offset: usize,
        /// Requested length
        len: usize,
        /// Bytes stored
        filled: usize,
    },
}

/// One partition of the arena
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Slot {
    /// Slot number
    pub index: usize,
    /// First byte within the arena
    pub offset: u64,
    /// One past the last byte within the arena
    pub end: u64,
}

impl Slot {
    /// Slot capacity in bytes
    pub const fn len(&self) -> u64 {
        self.end - self.offset
    }

    /// Whether the slot has zero capacity
    pub const fn is_empty(&self) -> bool {
        self.end == self.offset
    }
}

/// Fixed-size arena of equally sized slots
#[derive(Debug)]
pub struct SharedArena {
    slot_size: usize,
    buffers: Vec<Mutex<Vec<u8>>>,
    free: Mutex<VecDeque<Slot>>,
}

impl SharedArena {
    /// Split `size` bytes into `size / slot_size` slots
    pub fn new(size: u64, slot_size: usize) -> Result<Self, ArenaError> {
        let count = if slot_size == 0 {
            0
        } else {
            usize::try_from(size / slot_size as u64).unwrap_or(usize::MAX)
        };
        if count == 0 {
            return Err(ArenaError::TooSmall { size, slot_size });
        }

        let free = (0..count)
            .map(|index| Slot {
                index,
                offset: (index * slot_size) as u64,
                end: ((index + 1) * slot_size) as u64,
            })
            .collect();

        Ok(Self {
            slot_size,
            buffers: (0..count).map(|_| Mutex::new(Vec::new())).collect(),
            free: Mutex::new(free),
        })
    }

    /// Take a free slot, most recently released first
    pub fn acquire(&self) -> Option<Slot> {
        self.free.lock().pop_back()
    }

    /// Return a slot to the pool
    pub fn release(&self, slot: Slot) {
        self.free.lock().push_back(slot);
    }

    /// Store `data` in a slot, replacing what was there
    pub fn write(&self, slot: Slot, data: &[u8]) -> Result<(), ArenaError> {
        if data.len() > self.slot_size {
            return Err(ArenaError::Overflow {
                len: data.len(),
                slot_size: self.slot_size,
            });
        }
        let mut buffer = self.buffers[slot.index].lock();
        buffer.clear();
        buffer.extend_from_slice(data);
        Ok(())
    }

    /// Run `f` over `len` bytes at `offset` inside a slot
    pub fn with_slice<R>(
        &self,
        slot: Slot,
        offset: usize,
        len: usize,
        f: impl FnOnce(&[u8]) -> R,
    ) -> Result<R, ArenaError> {
        let buffer = self.buffers[slot.index].lock();
        let range = offset
            .checked_add(len)
            .filter(|&end| end <= buffer.len())
            .map(|end| offset..end)
            .ok_or(ArenaError::OutOfRange {
                index: slot.index,
                offset,
                len,
                filled: buffer.len(),
            })?;
        Ok(f(&buffer[range]))
    }

    /// Bytes per slot
    pub const fn slot_size(&self) -> usize {
        self.slot_size
    }

    /// Total number of slots
    pub fn slot_count(&self) -> usize {
        self.buffers.len()
    }

    /// Slots currently free
    pub fn free_slots(&self) -> usize {
        self.free.lock().len()
    }

    /// Bytes held by slots that are in use
    pub fn used_bytes(&self) -> u64 {
        ((self.slot_count() - self.free_slots()) * self.slot_size) as u64
    }

    /// Configured capacity in bytes
    pub fn capacity(&self) -> u64 {
        (self.slot_count() * self.slot_size) as u64
    }
}
