//! Simulated device memory: one L1 region per worker core and one region
//! per DRAM bank.
//!
//! Regions are sparse: backing storage grows on first write, and reads of
//! bytes never written return zero. Every write wakes waiters so semaphore
//! polls can block on the region's condvar instead of spinning.

use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tensim_chip::{CoreCoord, GridTopology, NocEndpoint};

use crate::error::{KernelFault, KernelResult};

/// Interval at which blocked waiters re-check the halt flag
pub(crate) const HALT_POLL: Duration = Duration::from_millis(5);

/// One flat byte-addressed memory
#[derive(Debug)]
pub struct MemoryRegion {
    bytes: Mutex<Vec<u8>>,
    changed: Condvar,
    limit: u64,
}

impl MemoryRegion {
    /// Empty region of `limit` addressable bytes
    pub fn new(limit: u64) -> Self {
        Self {
            bytes: Mutex::new(Vec::new()),
            changed: Condvar::new(),
            limit,
        }
    }

    /// Addressable size in bytes
    pub const fn limit(&self) -> u64 {
        self.limit
    }

    fn check(&self, addr: u64, len: u64) -> KernelResult<(usize, usize)> {
        match addr.checked_add(len) {
            Some(end) if end <= self.limit => {
                let start = usize::try_from(addr).map_err(|_| self.out_of_range(addr, len))?;
                let end = usize::try_from(end).map_err(|_| self.out_of_range(addr, len))?;
                Ok((start, end))
            }
            _ => Err(self.out_of_range(addr, len)),
        }
    }

    const fn out_of_range(&self, addr: u64, len: u64) -> KernelFault {
        KernelFault::L1OutOfRange {
            addr,
            len,
            limit: self.limit,
        }
    }

    /// Copy `dst.len()` bytes starting at `addr`
    ///
    /// # Errors
    ///
    /// Returns `L1OutOfRange` if the range leaves the region.
    pub fn read(&self, addr: u64, dst: &mut [u8]) -> KernelResult {
        let (start, end) = self.check(addr, dst.len() as u64)?;
        let bytes = self.bytes.lock();
        let stored_end = end.min(bytes.len());
        if start < stored_end {
            let n = stored_end - start;
            dst[..n].copy_from_slice(&bytes[start..stored_end]);
            dst[n..].fill(0);
        } else {
            dst.fill(0);
        }
        Ok(())
    }

    /// Write `src` at `addr` and wake waiters
    ///
    /// # Errors
    ///
    /// Returns `L1OutOfRange` if the range leaves the region.
    pub fn write(&self, addr: u64, src: &[u8]) -> KernelResult {
        let (start, end) = self.check(addr, src.len() as u64)?;
        {
            let mut bytes = self.bytes.lock();
            if bytes.len() < end {
                bytes.resize(end, 0);
            }
            bytes[start..end].copy_from_slice(src);
        }
        self.changed.notify_all();
        Ok(())
    }

    /// Little-endian u32 at `addr`
    ///
    /// # Errors
    ///
    /// Returns `L1OutOfRange` if the word leaves the region.
    pub fn read_u32(&self, addr: u64) -> KernelResult<u32> {
        let mut word = [0u8; 4];
        self.read(addr, &mut word)?;
        Ok(u32::from_le_bytes(word))
    }

    /// Store a little-endian u32
    ///
    /// # Errors
    ///
    /// Returns `L1OutOfRange` if the word leaves the region.
    pub fn write_u32(&self, addr: u64, value: u32) -> KernelResult {
        self.write(addr, &value.to_le_bytes())
    }

    /// Atomically add to the u32 at `addr`, returning the new value
    ///
    /// # Errors
    ///
    /// Returns `L1OutOfRange` if the word leaves the region.
    pub fn fetch_add_u32(&self, addr: u64, value: u32) -> KernelResult<u32> {
        let (start, end) = self.check(addr, 4)?;
        let new = {
            let mut bytes = self.bytes.lock();
            if bytes.len() < end {
                bytes.resize(end, 0);
            }
            let mut word = [0u8; 4];
            word.copy_from_slice(&bytes[start..end]);
            let new = u32::from_le_bytes(word).wrapping_add(value);
            bytes[start..end].copy_from_slice(&new.to_le_bytes());
            new
        };
        self.changed.notify_all();
        Ok(new)
    }

    /// Block until the u32 at `addr` satisfies `pred`
    ///
    /// # Errors
    ///
    /// Returns `Halted` if `halt` is raised while waiting, or `L1OutOfRange`.
    pub fn wait_u32(
        &self,
        addr: u64,
        halt: &AtomicBool,
        mut pred: impl FnMut(u32) -> bool,
    ) -> KernelResult<u32> {
        let (start, end) = self.check(addr, 4)?;
        let mut bytes = self.bytes.lock();
        loop {
            let value = if bytes.len() >= end {
                let mut word = [0u8; 4];
                word.copy_from_slice(&bytes[start..end]);
                u32::from_le_bytes(word)
            } else {
                0
            };
            if pred(value) {
                return Ok(value);
            }
            if halt.load(Ordering::Acquire) {
                return Err(KernelFault::Halted);
            }
            self.changed.wait_for(&mut bytes, HALT_POLL);
        }
    }

    /// Drop all contents
    pub fn clear(&self) {
        let mut bytes = self.bytes.lock();
        bytes.clear();
        bytes.shrink_to_fit();
    }
}

/// All memories of one device
#[derive(Debug)]
pub struct DeviceMemory {
    l1: HashMap<CoreCoord, Arc<MemoryRegion>>,
    dram: Vec<Arc<MemoryRegion>>,
}

impl DeviceMemory {
    /// Empty memories for every worker core and DRAM bank of `topology`
    pub fn new(topology: &GridTopology) -> Self {
        let l1 = topology
            .worker_cores()
            .into_iter()
            .map(|core| (core, Arc::new(MemoryRegion::new(u64::from(topology.l1_bytes)))))
            .collect();
        let dram = (0..topology.dram_banks)
            .map(|_| Arc::new(MemoryRegion::new(topology.dram_bank_bytes)))
            .collect();
        Self { l1, dram }
    }

    /// L1 of `core`
    pub fn l1(&self, core: CoreCoord) -> Option<&Arc<MemoryRegion>> {
        self.l1.get(&core)
    }

    /// DRAM bank `bank`
    pub fn dram(&self, bank: u32) -> Option<&Arc<MemoryRegion>> {
        self.dram.get(bank as usize)
    }

    /// Region behind a NoC endpoint
    pub fn endpoint(&self, endpoint: NocEndpoint) -> Option<&Arc<MemoryRegion>> {
        match endpoint {
            NocEndpoint::Core(core) => self.l1(core),
            NocEndpoint::DramBank(bank) => self.dram(bank),
        }
    }

    /// Wipe every L1 (device reset). DRAM contents survive.
    pub fn clear_l1(&self) {
        for region in self.l1.values() {
            region.clear();
        }
    }
}
