//! Fixed-capacity virtual storage bus.
//!
//! A [`StorageBus`] models the addressable attachment points of a utility
//! VM's virtual storage controller. Slots are handed out lowest-first and
//! the number of allocated slots can never exceed the declared capacity.
//! The bus itself is plain data; callers serialize access to it.

use crate::error::{Result, VmError};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Default number of addressable slots on a utility VM storage bus.
pub const DEFAULT_BUS_CAPACITY: usize = 64;

/// Address of a single slot on a storage bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SlotId(u32);

impl SlotId {
    /// Create a slot address from its index on the bus.
    pub fn new(index: u32) -> Self {
        Self(index)
    }

    /// Index of this slot on the bus.
    pub fn index(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Where a layer's backing volume is attached inside a utility VM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttachPoint {
    /// A bus slot, consumed exclusively by one volume.
    Slot(SlotId),
    /// A shared-folder mapping; does not consume a bus slot.
    Share(u32),
}

impl fmt::Display for AttachPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttachPoint::Slot(slot) => write!(f, "slot {}", slot),
            AttachPoint::Share(index) => write!(f, "share {}", index),
        }
    }
}

/// Slot accounting for one virtual storage controller.
#[derive(Debug, Clone)]
pub struct StorageBus {
    slots: Vec<bool>,
    in_use: usize,
}

impl Default for StorageBus {
    fn default() -> Self {
        Self::new(DEFAULT_BUS_CAPACITY)
    }
}

impl StorageBus {
    /// Create an empty bus with `capacity` addressable slots.
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: vec![false; capacity],
            in_use: 0,
        }
    }

    /// Total number of addressable slots.
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Number of allocated slots.
    pub fn in_use(&self) -> usize {
        self.in_use
    }

    /// Number of free slots.
    pub fn free(&self) -> usize {
        self.capacity() - self.in_use
    }

    /// Allocate the lowest free slot.
    ///
    /// # Errors
    /// Returns [`VmError::BusExhausted`] if every slot is in use.
    pub fn allocate(&mut self) -> Result<SlotId> {
        let index = self
            .slots
            .iter()
            .position(|used| !used)
            .ok_or_else(|| self.exhausted(1))?;
        self.slots[index] = true;
        self.in_use += 1;
        tracing::trace!(slot = index, in_use = self.in_use, "Slot allocated");
        Ok(SlotId::new(index as u32))
    }

    /// Allocate `count` slots at once.
    ///
    /// Either all slots are allocated or none are; on failure the bus is
    /// left untouched.
    pub fn allocate_many(&mut self, count: usize) -> Result<Vec<SlotId>> {
        if count > self.free() {
            return Err(self.exhausted(count));
        }
        (0..count).map(|_| self.allocate()).collect()
    }

    /// Return `slot` to the free pool.
    ///
    /// Returns `false` if the slot was not allocated (double release).
    pub fn release(&mut self, slot: SlotId) -> bool {
        match self.slots.get_mut(slot.index() as usize) {
            Some(used) if *used => {
                *used = false;
                self.in_use -= 1;
                tracing::trace!(%slot, in_use = self.in_use, "Slot released");
                true
            }
            _ => false,
        }
    }

    fn exhausted(&self, needed: usize) -> VmError {
        VmError::BusExhausted {
            needed,
            free: self.free(),
            capacity: self.capacity(),
        }
    }
}
