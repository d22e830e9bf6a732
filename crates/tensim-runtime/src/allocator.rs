//! Free-list bank allocator
//!
//! Interleaved and sharded buffers occupy the same offset in every bank they
//! touch, so one allocator per memory kind covers all banks: DRAM allocates
//! bottom-up from 0, L1 buffers allocate top-down from the end of L1 so they
//! never collide with circular buffers growing up from the unreserved base.

use std::collections::BTreeMap;
use tensim_chip::memory_map::align_up;
use tracing::{debug, trace};

use crate::error::{Result, RuntimeError};

/// Which end of the free space allocations are taken from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocDirection {
    /// Lowest fitting address first
    BottomUp,
    /// Highest fitting address first
    TopDown,
}

/// First-fit allocator over `[base, end)` with coalescing frees
#[derive(Debug)]
pub struct BankAllocator {
    region: &'static str,
    alignment: u64,
    direction: AllocDirection,
    /// start -> size
    free: BTreeMap<u64, u64>,
    /// start -> size
    allocated: BTreeMap<u64, u64>,
}

impl BankAllocator {
    /// Allocator over `[base, end)`, both rounded inward to `alignment`
    pub fn new(
        region: &'static str,
        base: u64,
        end: u64,
        alignment: u64,
        direction: AllocDirection,
    ) -> Self {
        let base = align_up(base, alignment);
        let end = end & !(alignment - 1);
        let mut free = BTreeMap::new();
        if end > base {
            free.insert(base, end - base);
        }
        Self {
            region,
            alignment,
            direction,
            free,
            allocated: BTreeMap::new(),
        }
    }

    /// Reserve `size` bytes (rounded up to the alignment)
    ///
    /// # Errors
    ///
    /// Returns `OutOfMemory` with requested vs largest free block when no
    /// free block fits, or `InvalidArgument` for a zero size.
    pub fn allocate(&mut self, size: u64) -> Result<u64> {
        if size == 0 {
            return Err(RuntimeError::invalid_argument(format!(
                "zero-byte {} allocation",
                self.region
            )));
        }
        let size = align_up(size, self.alignment);

        let fit = |(&start, &len): (&u64, &u64)| (len >= size).then_some((start, len));
        let block = match self.direction {
            AllocDirection::BottomUp => self.free.iter().find_map(fit),
            AllocDirection::TopDown => self.free.iter().rev().find_map(fit),
        };
        let Some((start, len)) = block else {
            return Err(RuntimeError::OutOfMemory {
                region: self.region,
                requested: size,
                available: self.largest_free(),
            });
        };

        self.free.remove(&start);
        let addr = match self.direction {
            AllocDirection::BottomUp => {
                if len > size {
                    self.free.insert(start + size, len - size);
                }
                start
            }
            AllocDirection::TopDown => {
                if len > size {
                    self.free.insert(start, len - size);
                }
                start + len - size
            }
        };
        self.allocated.insert(addr, size);
        trace!("{} alloc {size} bytes at {addr:#x}", self.region);
        Ok(addr)
    }

    /// Return the block starting at `addr` to the free list
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` if `addr` is not the start of a live block.
    pub fn deallocate(&mut self, addr: u64) -> Result<()> {
        let Some(mut size) = self.allocated.remove(&addr) else {
            return Err(RuntimeError::invalid_argument(format!(
                "{} address {addr:#x} is not allocated",
                self.region
            )));
        };
        let mut start = addr;

        // merge with the block after
        if let Some(next) = self.free.remove(&(start + size)) {
            size += next;
        }
        // merge with the block before
        if let Some((&prev, &prev_len)) = self.free.range(..start).next_back() {
            if prev + prev_len == start {
                self.free.remove(&prev);
                start = prev;
                size += prev_len;
            }
        }
        self.free.insert(start, size);
        debug!("{} freed block at {addr:#x}", self.region);
        Ok(())
    }

    /// Size of the largest free block
    pub fn largest_free(&self) -> u64 {
        self.free.values().copied().max().unwrap_or(0)
    }

    /// Total free bytes
    pub fn free_bytes(&self) -> u64 {
        self.free.values().sum()
    }

    /// Lowest live allocation, if any
    pub fn lowest_allocated(&self) -> Option<u64> {
        self.allocated.keys().next().copied()
    }

    /// Number of live allocations
    pub fn live_allocations(&self) -> usize {
        self.allocated.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bottom_up_first_fit() {
        let mut a = BankAllocator::new("DRAM", 0, 1024, 32, AllocDirection::BottomUp);
        assert_eq!(a.allocate(100).unwrap(), 0);
        assert_eq!(a.allocate(32).unwrap(), 128);
        assert_eq!(a.free_bytes(), 1024 - 160);
    }

    #[test]
    fn top_down_takes_highest() {
        let mut a = BankAllocator::new("L1", 0x1000, 0x2000, 16, AllocDirection::TopDown);
        assert_eq!(a.allocate(0x100).unwrap(), 0x1F00);
        assert_eq!(a.allocate(0x10).unwrap(), 0x1EF0);
        assert_eq!(a.lowest_allocated(), Some(0x1EF0));
    }

    #[test]
    fn free_coalesces_neighbours() {
        let mut a = BankAllocator::new("DRAM", 0, 3 * 64, 32, AllocDirection::BottomUp);
        let x = a.allocate(64).unwrap();
        let y = a.allocate(64).unwrap();
        let z = a.allocate(64).unwrap();
        assert!(a.allocate(32).is_err());
        a.deallocate(x).unwrap();
        a.deallocate(z).unwrap();
        assert_eq!(a.largest_free(), 64);
        a.deallocate(y).unwrap();
        assert_eq!(a.largest_free(), 192);
        assert_eq!(a.live_allocations(), 0);
    }

    #[test]
    fn oom_reports_requested_and_available() {
        let mut a = BankAllocator::new("DRAM", 0, 256, 32, AllocDirection::BottomUp);
        a.allocate(200).unwrap();
        match a.allocate(100) {
            Err(RuntimeError::OutOfMemory {
                requested,
                available,
                ..
            }) => {
                assert_eq!(requested, 128);
                assert_eq!(available, 32);
            }
            other => panic!("expected OOM, got {other:?}"),
        }
    }

    #[test]
    fn double_free_is_rejected() {
        let mut a = BankAllocator::new("DRAM", 0, 256, 32, AllocDirection::BottomUp);
        let x = a.allocate(32).unwrap();
        a.deallocate(x).unwrap();
        assert!(a.deallocate(x).is_err());
    }
}
