// SPDX-License-Identifier: AGPL-3.0-only

//! Per-engine NoC interface
//!
//! Transfers are split-phase. `async_read` / `async_write` only enqueue; the
//! bytes move when the engine calls the matching barrier (or when the kernel
//! returns). Until then the read destination holds stale data and the write
//! source must not be modified: a kernel that reuses the source early sends
//! whatever is there at barrier time, just as on hardware.
//!
//! Barriers are coarse: they complete every outstanding transfer of that
//! direction issued by this engine. There is no per-request token.
//!
//! Cross-core signalling uses semaphore words in L1. An increment takes the
//! [`WriteFence`] returned by the latest [`Noc::write_barrier`], which turns
//! "barrier before signal" into something the call site has to show. With
//! debug checks on, a fence older than the latest write is a fault.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use tensim_chip::{CoreCoord, CoreRange, NocAddr, NocEndpoint, NocId};
use tracing::trace;

use crate::addrgen::AddressGenerator;
use crate::error::{KernelFault, KernelResult};
use crate::memory::{DeviceMemory, MemoryRegion};

/// Proof that every write issued so far has landed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "a fence is only useful when passed to semaphore_inc"]
pub struct WriteFence {
    epoch: u64,
}

/// Transfer counters for one engine
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NocStats {
    /// Read requests issued
    pub reads: u64,
    /// Write requests issued (a multicast counts once)
    pub writes: u64,
    /// Multicast write requests
    pub multicasts: u64,
    /// Bytes read
    pub bytes_read: u64,
    /// Bytes written, per destination
    pub bytes_written: u64,
    /// Read barriers
    pub read_barriers: u64,
    /// Write barriers
    pub write_barriers: u64,
    /// Semaphore increments sent
    pub semaphore_incs: u64,
}

impl NocStats {
    /// Add another engine's counters
    pub fn merge(&mut self, other: &Self) {
        self.reads += other.reads;
        self.writes += other.writes;
        self.multicasts += other.multicasts;
        self.bytes_read += other.bytes_read;
        self.bytes_written += other.bytes_written;
        self.read_barriers += other.read_barriers;
        self.write_barriers += other.write_barriers;
        self.semaphore_incs += other.semaphore_incs;
    }
}

#[derive(Debug)]
struct PendingRead {
    src: Arc<MemoryRegion>,
    src_offset: u64,
    dst: u64,
    size: u64,
}

#[derive(Debug)]
struct PendingWrite {
    src: u64,
    dst: Arc<MemoryRegion>,
    dst_offset: u64,
    size: u64,
}

/// NoC interface of one data-movement engine
#[derive(Debug)]
pub struct Noc {
    id: NocId,
    core: CoreCoord,
    memory: Arc<DeviceMemory>,
    local: Arc<MemoryRegion>,
    halt: Arc<AtomicBool>,
    debug_checks: bool,
    reads: Vec<PendingRead>,
    writes: Vec<PendingWrite>,
    writes_issued: u64,
    stats: NocStats,
}

impl Noc {
    /// NoC interface for an engine on `core`
    ///
    /// # Errors
    ///
    /// Returns `UnknownEndpoint` if `core` has no L1 on this device.
    pub fn new(
        id: NocId,
        core: CoreCoord,
        memory: Arc<DeviceMemory>,
        halt: Arc<AtomicBool>,
        debug_checks: bool,
    ) -> KernelResult<Self> {
        let local = Arc::clone(memory.l1(core).ok_or(KernelFault::UnknownEndpoint {
            endpoint: NocEndpoint::Core(core),
        })?);
        Ok(Self {
            id,
            core,
            memory,
            local,
            halt,
            debug_checks,
            reads: Vec::new(),
            writes: Vec::new(),
            writes_issued: 0,
            stats: NocStats::default(),
        })
    }

    /// Which NoC this interface issues on
    pub const fn id(&self) -> NocId {
        self.id
    }

    /// Counters so far
    pub const fn stats(&self) -> &NocStats {
        &self.stats
    }

    fn region(&self, endpoint: NocEndpoint) -> KernelResult<Arc<MemoryRegion>> {
        self.memory
            .endpoint(endpoint)
            .cloned()
            .ok_or(KernelFault::UnknownEndpoint { endpoint })
    }

    /// Enqueue a read of `size` bytes from `src` into local L1 at `dst`
    ///
    /// # Errors
    ///
    /// Returns `UnknownEndpoint` if `src` names no memory on this device.
    pub fn async_read(&mut self, src: NocAddr, dst: u64, size: u32) -> KernelResult {
        let region = self.region(src.endpoint)?;
        trace!("{} {} read {src} -> {dst:#x} ({size} B)", self.core, self.id);
        self.reads.push(PendingRead {
            src: region,
            src_offset: src.offset,
            dst,
            size: u64::from(size),
        });
        self.stats.reads += 1;
        self.stats.bytes_read += u64::from(size);
        Ok(())
    }

    /// Enqueue a write of `size` bytes from local L1 at `src` to `dst`
    ///
    /// # Errors
    ///
    /// Returns `UnknownEndpoint` if `dst` names no memory on this device.
    pub fn async_write(&mut self, src: u64, dst: NocAddr, size: u32) -> KernelResult {
        let region = self.region(dst.endpoint)?;
        trace!("{} {} write {src:#x} -> {dst} ({size} B)", self.core, self.id);
        self.writes.push(PendingWrite {
            src,
            dst: region,
            dst_offset: dst.offset,
            size: u64::from(size),
        });
        self.writes_issued += 1;
        self.stats.writes += 1;
        self.stats.bytes_written += u64::from(size);
        Ok(())
    }

    /// Enqueue one write to the same L1 offset on every core of `targets`
    ///
    /// # Errors
    ///
    /// Returns `UnknownEndpoint` if any target core is off the grid.
    pub fn async_write_multicast(
        &mut self,
        src: u64,
        targets: CoreRange,
        dst_offset: u64,
        size: u32,
    ) -> KernelResult {
        let regions = targets
            .iter()
            .map(|core| self.region(NocEndpoint::Core(core)))
            .collect::<KernelResult<Vec<_>>>()?;
        trace!(
            "{} {} multicast {src:#x} -> {targets}+{dst_offset:#x} ({size} B)",
            self.core,
            self.id
        );
        let fanout = regions.len() as u64;
        for dst in regions {
            self.writes.push(PendingWrite {
                src,
                dst,
                dst_offset,
                size: u64::from(size),
            });
        }
        self.writes_issued += 1;
        self.stats.writes += 1;
        self.stats.multicasts += 1;
        self.stats.bytes_written += u64::from(size) * fanout;
        Ok(())
    }

    /// Read page `page` of `gen` into local L1 at `dst`
    ///
    /// # Errors
    ///
    /// As [`async_read`](Self::async_read); also `PageOutOfRange` when debug
    /// checks are on and the generator is bounded.
    pub fn async_read_page(
        &mut self,
        gen: &dyn AddressGenerator,
        page: u32,
        dst: u64,
    ) -> KernelResult {
        let src = self.page_addr(gen, page)?;
        self.async_read(src, dst, gen.page_size())
    }

    /// Write local L1 at `src` to page `page` of `gen`
    ///
    /// # Errors
    ///
    /// As [`async_write`](Self::async_write); also `PageOutOfRange` when
    /// debug checks are on and the generator is bounded.
    pub fn async_write_page(
        &mut self,
        gen: &dyn AddressGenerator,
        page: u32,
        src: u64,
    ) -> KernelResult {
        let dst = self.page_addr(gen, page)?;
        self.async_write(src, dst, gen.page_size())
    }

    fn page_addr(&self, gen: &dyn AddressGenerator, page: u32) -> KernelResult<NocAddr> {
        if self.debug_checks {
            gen.checked_page_addr(page)
        } else {
            Ok(gen.page_addr(page))
        }
    }

    /// Complete every outstanding read
    ///
    /// # Errors
    ///
    /// Returns `L1OutOfRange` if a queued read falls outside its memory.
    pub fn read_barrier(&mut self) -> KernelResult {
        self.stats.read_barriers += 1;
        let mut scratch = Vec::new();
        for read in self.reads.drain(..) {
            scratch.resize(usize::try_from(read.size).unwrap_or(usize::MAX), 0);
            read.src.read(read.src_offset, &mut scratch)?;
            self.local.write(read.dst, &scratch)?;
        }
        Ok(())
    }

    /// Complete every outstanding write and return a fence for semaphore signalling
    ///
    /// # Errors
    ///
    /// Returns `L1OutOfRange` if a queued write falls outside its memory.
    pub fn write_barrier(&mut self) -> KernelResult<WriteFence> {
        self.stats.write_barriers += 1;
        let mut scratch = Vec::new();
        for write in self.writes.drain(..) {
            scratch.resize(usize::try_from(write.size).unwrap_or(usize::MAX), 0);
            self.local.read(write.src, &mut scratch)?;
            write.dst.write(write.dst_offset, &scratch)?;
        }
        Ok(WriteFence {
            epoch: self.writes_issued,
        })
    }

    /// Complete everything still queued (kernel exit)
    ///
    /// # Errors
    ///
    /// As the two barriers.
    pub fn flush(&mut self) -> KernelResult {
        if !self.reads.is_empty() {
            self.read_barrier()?;
        }
        if !self.writes.is_empty() {
            let _ = self.write_barrier()?;
        }
        Ok(())
    }

    /// Atomically add `value` to the semaphore word at `dst`
    ///
    /// # Errors
    ///
    /// With debug checks, `UnfencedSemaphore` if writes were issued after
    /// `fence` was taken. Also `UnknownEndpoint` / `L1OutOfRange`.
    pub fn semaphore_inc(&mut self, dst: NocAddr, value: u32, fence: &WriteFence) -> KernelResult {
        if self.debug_checks && fence.epoch != self.writes_issued {
            return Err(KernelFault::UnfencedSemaphore {
                outstanding: self.writes_issued - fence.epoch,
            });
        }
        let region = self.region(dst.endpoint)?;
        let now = region.fetch_add_u32(dst.offset, value)?;
        trace!("{} {} sem inc {dst} -> {now}", self.core, self.id);
        self.stats.semaphore_incs += 1;
        Ok(())
    }

    /// Block until the local semaphore at `addr` equals `value`
    ///
    /// # Errors
    ///
    /// Returns `Halted` if the device halts while waiting.
    pub fn semaphore_wait(&self, addr: u64, value: u32) -> KernelResult {
        self.local.wait_u32(addr, &self.halt, |v| v == value).map(|_| ())
    }

    /// Block until the local semaphore at `addr` is at least `value`
    ///
    /// # Errors
    ///
    /// Returns `Halted` if the device halts while waiting.
    pub fn semaphore_wait_min(&self, addr: u64, value: u32) -> KernelResult<u32> {
        self.local.wait_u32(addr, &self.halt, |v| v >= value)
    }

    /// Store `value` into the local semaphore at `addr`
    ///
    /// # Errors
    ///
    /// Returns `L1OutOfRange` for an address outside L1.
    pub fn semaphore_set(&self, addr: u64, value: u32) -> KernelResult {
        self.local.write_u32(addr, value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tensim_chip::GridTopology;

    fn noc(debug_checks: bool) -> (Noc, Arc<DeviceMemory>) {
        let memory = Arc::new(DeviceMemory::new(&GridTopology::SMALL));
        let noc = Noc::new(
            NocId::Noc0,
            CoreCoord::new(0, 0),
            Arc::clone(&memory),
            Arc::new(AtomicBool::new(false)),
            debug_checks,
        )
        .unwrap();
        (noc, memory)
    }

    #[test]
    fn read_lands_only_at_barrier() {
        let (mut noc, memory) = noc(true);
        memory.dram(2).unwrap().write(64, &[7; 32]).unwrap();
        noc.async_read(NocAddr::dram(2, 64), 0x2_0000, 32).unwrap();

        let local = memory.l1(CoreCoord::new(0, 0)).unwrap();
        let mut buf = [0u8; 32];
        local.read(0x2_0000, &mut buf).unwrap();
        assert_eq!(buf, [0; 32]);

        noc.read_barrier().unwrap();
        local.read(0x2_0000, &mut buf).unwrap();
        assert_eq!(buf, [7; 32]);
    }

    #[test]
    fn write_sends_source_as_of_barrier() {
        let (mut noc, memory) = noc(true);
        let local = memory.l1(CoreCoord::new(0, 0)).unwrap();
        local.write(0x2_0000, &[1; 16]).unwrap();
        noc.async_write(0x2_0000, NocAddr::dram(0, 0), 16).unwrap();
        // source modified before the barrier: the new bytes are what arrives
        local.write(0x2_0000, &[2; 16]).unwrap();
        let _ = noc.write_barrier().unwrap();
        let mut buf = [0u8; 16];
        memory.dram(0).unwrap().read(0, &mut buf).unwrap();
        assert_eq!(buf, [2; 16]);
    }

    #[test]
    fn stale_fence_is_rejected_under_debug_checks() {
        let (mut noc, _memory) = noc(true);
        let sem = NocAddr::core(CoreCoord::new(1, 0), 0x9000);
        let fence = noc.write_barrier().unwrap();
        noc.async_write(0x2_0000, NocAddr::dram(0, 0), 16).unwrap();
        assert_eq!(
            noc.semaphore_inc(sem, 1, &fence),
            Err(KernelFault::UnfencedSemaphore { outstanding: 1 })
        );
        let fence = noc.write_barrier().unwrap();
        noc.semaphore_inc(sem, 1, &fence).unwrap();
    }

    #[test]
    fn multicast_reaches_every_core_in_range() {
        let (mut noc, memory) = noc(true);
        memory.l1(CoreCoord::new(0, 0)).unwrap().write(0x2_0000, &[9; 8]).unwrap();
        let range = CoreRange::new(CoreCoord::new(1, 1), CoreCoord::new(2, 2));
        noc.async_write_multicast(0x2_0000, range, 0x3_0000, 8).unwrap();
        let _ = noc.write_barrier().unwrap();
        for core in range.iter() {
            let mut buf = [0u8; 8];
            memory.l1(core).unwrap().read(0x3_0000, &mut buf).unwrap();
            assert_eq!(buf, [9; 8]);
        }
        assert_eq!(noc.stats().bytes_written, 32);
    }

    #[test]
    fn off_grid_endpoint_faults() {
        let (mut noc, _memory) = noc(true);
        assert!(matches!(
            noc.async_read(NocAddr::core(CoreCoord::new(9, 9), 0), 0, 4),
            Err(KernelFault::UnknownEndpoint { .. })
        ));
    }
}
