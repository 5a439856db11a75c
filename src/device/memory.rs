//! Per-device memory accounting
//!
//! Every byte placed on a device goes through a [`MemoryArena`] and is held by
//! an [`Allocation`]. Allocations return their bytes on drop, so every exit
//! path (including a failed model load halfway through) releases memory.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::error::DeviceError;

use super::DeviceId;

/// Bounded byte budget for one device
#[derive(Debug)]
pub struct MemoryArena {
    device: DeviceId,
    capacity: u64,
    used: AtomicU64,
}

impl MemoryArena {
    pub fn new(device: DeviceId, capacity: u64) -> Arc<Self> {
        Arc::new(Self {
            device,
            capacity,
            used: AtomicU64::new(0),
        })
    }

    /// Reserve `bytes` and return a guard that releases them on drop.
    pub fn allocate(self: &Arc<Self>, bytes: u64) -> Result<Allocation, DeviceError> {
        self.reserve(bytes)?;
        Ok(Allocation {
            arena: Arc::clone(self),
            bytes,
        })
    }

    /// An empty allocation that can be grown later.
    pub fn empty(self: &Arc<Self>) -> Allocation {
        Allocation {
            arena: Arc::clone(self),
            bytes: 0,
        }
    }

    pub fn device(&self) -> DeviceId {
        self.device
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn used(&self) -> u64 {
        self.used.load(Ordering::Acquire)
    }

    fn reserve(&self, bytes: u64) -> Result<(), DeviceError> {
        if bytes == 0 {
            return Ok(());
        }
        let mut current = self.used.load(Ordering::Acquire);
        loop {
            let next = current.saturating_add(bytes);
            if next > self.capacity {
                return Err(DeviceError::OutOfMemory {
                    device: self.device,
                    requested: bytes,
                    available: self.capacity.saturating_sub(current),
                });
            }
            match self.used.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(()),
                Err(actual) => current = actual,
            }
        }
    }

    fn release(&self, bytes: u64) {
        if bytes > 0 {
            self.used.fetch_sub(bytes, Ordering::AcqRel);
        }
    }
}

/// Scoped reservation on a [`MemoryArena`]
#[derive(Debug)]
pub struct Allocation {
    arena: Arc<MemoryArena>,
    bytes: u64,
}

impl Allocation {
    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    pub fn device(&self) -> DeviceId {
        self.arena.device
    }

    /// Grow the reservation; on failure the reservation is unchanged.
    pub fn grow(&mut self, extra: u64) -> Result<(), DeviceError> {
        self.arena.reserve(extra)?;
        self.bytes += extra;
        Ok(())
    }

    /// Give back up to `by` bytes.
    pub fn shrink(&mut self, by: u64) {
        let by = by.min(self.bytes);
        self.arena.release(by);
        self.bytes -= by;
    }

    /// A second, empty reservation on the same arena.
    pub fn sibling(&self) -> Allocation {
        self.arena.empty()
    }
}

impl Drop for Allocation {
    fn drop(&mut self) {
        self.arena.release(self.bytes);
    }
}
