// SPDX-License-Identifier: AGPL-3.0-only

//! Circular buffers
//!
//! A CB is a ring of fixed-size pages in one core's L1, shared by exactly one
//! producer engine and one consumer engine on that core.
//!
//! ```text
//! producer                         consumer
//!   reserve_back(n)  ─ blocks until n pages free
//!   write at write_ptr()
//!   push_back(n)     ─────────────► wait_front(n)  ─ blocks until n pages ready
//!                                   read at read_ptr()
//!                    ◄───────────── pop_front(n)
//! ```
//!
//! The data itself lives in L1 at `write_ptr()` / `read_ptr()`; this module
//! only does the page accounting. `available + free == capacity` holds
//! between calls, and pointers advance modulo the capacity.
//!
//! A request for more pages than the CB holds can never be satisfied and is
//! rejected: at compile time when the kernel declares its CB usage, and at
//! run time as a [`KernelFault`] instead of a hang. Other sequencing mistakes
//! (push without reserve, popping more than was waited for, blocks that
//! straddle the ring's end) are only reported when debug checks are on.

use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tensim_chip::memory_map::NUM_CIRCULAR_BUFFERS;
use tensim_chip::{CoreCoord, CoreRangeSet, DataFormat};
use tracing::trace;

use crate::error::{KernelFault, KernelResult, Result, RuntimeError};
use crate::memory::HALT_POLL;

/// CB declaration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircularBufferConfig {
    /// CB id (0..32)
    pub index: u8,
    /// Capacity in bytes
    pub total_size: u32,
    /// Page size; the format's tile size when `None`
    pub page_size: Option<u32>,
    /// Datum format
    pub data_format: DataFormat,
    /// Fixed L1 address; assigned bottom-up from the unreserved base when `None`
    pub address: Option<u32>,
}

impl CircularBufferConfig {
    /// CB of `total_size` bytes holding tiles of `data_format`
    pub const fn new(index: u8, total_size: u32, data_format: DataFormat) -> Self {
        Self {
            index,
            total_size,
            page_size: None,
            data_format,
            address: None,
        }
    }

    /// CB of `num_pages` pages of `page_size` bytes
    ///
    /// A product past `u32::MAX` saturates and is rejected by
    /// [`validate`](Self::validate).
    pub const fn paged(index: u8, num_pages: u32, page_size: u32, data_format: DataFormat) -> Self {
        Self {
            index,
            total_size: num_pages.saturating_mul(page_size),
            page_size: Some(page_size),
            data_format,
            address: None,
        }
    }

    /// Override the page size
    #[must_use]
    pub const fn with_page_size(mut self, page_size: u32) -> Self {
        self.page_size = Some(page_size);
        self
    }

    /// Pin the CB at an explicit L1 address
    #[must_use]
    pub const fn with_address(mut self, address: u32) -> Self {
        self.address = Some(address);
        self
    }

    /// Effective page size
    pub const fn resolved_page_size(&self) -> u32 {
        match self.page_size {
            Some(p) => p,
            None => self.data_format.tile_size(),
        }
    }

    /// Capacity in pages
    pub const fn num_pages(&self) -> u32 {
        let page = self.resolved_page_size();
        if page == 0 {
            0
        } else {
            self.total_size / page
        }
    }

    /// Check id range and page geometry
    ///
    /// # Errors
    ///
    /// Returns `InvalidCircularBuffer` for an id ≥ 32, a zero page size, a
    /// capacity that overflowed, a capacity below one page, or a capacity
    /// that is not a whole number of pages.
    pub fn validate(&self, core: CoreCoord) -> Result<()> {
        let page = self.resolved_page_size();
        if self.index >= NUM_CIRCULAR_BUFFERS {
            return Err(RuntimeError::invalid_cb(
                core,
                self.index,
                format!("id must be below {NUM_CIRCULAR_BUFFERS}"),
            ));
        }
        if page == 0 {
            return Err(RuntimeError::invalid_cb(core, self.index, "page size is zero"));
        }
        if self.total_size == u32::MAX {
            return Err(RuntimeError::invalid_cb(
                core,
                self.index,
                "capacity overflows the L1 address space",
            ));
        }
        if self.total_size < page {
            return Err(RuntimeError::invalid_cb(
                core,
                self.index,
                format!("{} bytes cannot hold one {page}-byte page", self.total_size),
            ));
        }
        if self.total_size % page != 0 {
            return Err(RuntimeError::invalid_cb(
                core,
                self.index,
                format!(
                    "total size {} is not a multiple of page size {page}",
                    self.total_size
                ),
            ));
        }
        Ok(())
    }
}

/// A declared CB: same id and address on each of its cores
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircularBufferHandle {
    /// CB id
    pub index: u8,
    /// L1 address on every core
    pub address: u32,
    /// Capacity in bytes
    pub total_size: u32,
    /// Page size in bytes
    pub page_size: u32,
    /// Datum format
    pub data_format: DataFormat,
    /// Cores the CB exists on
    pub cores: CoreRangeSet,
}

impl CircularBufferHandle {
    /// Capacity in pages
    pub const fn num_pages(&self) -> u32 {
        self.total_size / self.page_size
    }

    /// One past the last L1 byte
    pub const fn end(&self) -> u32 {
        self.address.saturating_add(self.total_size)
    }
}

/// Per-CB instrumentation counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CbStats {
    /// `reserve_back` calls
    pub reserve_calls: u64,
    /// `push_back` calls
    pub push_calls: u64,
    /// `wait_front` calls
    pub wait_calls: u64,
    /// `pop_front` calls
    pub pop_calls: u64,
    /// `reserve_back` calls that had to block
    pub blocked_reserves: u64,
    /// `wait_front` calls that had to block
    pub blocked_waits: u64,
    /// Pages published
    pub pages_pushed: u64,
    /// Pages released
    pub pages_popped: u64,
    /// Most pages ever available at once
    pub high_water: u32,
}

#[derive(Debug, Default)]
struct CbState {
    pushed: u64,
    popped: u64,
    wr_page: u32,
    rd_page: u32,
    reserved: Option<u32>,
    waited: u32,
    stats: CbStats,
}

impl CbState {
    fn available(&self) -> u64 {
        self.pushed.saturating_sub(self.popped)
    }
}

/// Run-time CB shared by one producer and one consumer engine
#[derive(Debug)]
pub struct CircularBuffer {
    index: u8,
    core: CoreCoord,
    address: u64,
    page_size: u32,
    num_pages: u32,
    data_format: DataFormat,
    state: Mutex<CbState>,
    changed: Condvar,
    halt: Arc<AtomicBool>,
    debug_checks: bool,
}

impl CircularBuffer {
    /// Empty CB on `core` built from its declaration
    pub fn new(
        handle: &CircularBufferHandle,
        core: CoreCoord,
        halt: Arc<AtomicBool>,
        debug_checks: bool,
    ) -> Self {
        Self {
            index: handle.index,
            core,
            address: u64::from(handle.address),
            page_size: handle.page_size,
            num_pages: handle.num_pages(),
            data_format: handle.data_format,
            state: Mutex::new(CbState::default()),
            changed: Condvar::new(),
            halt,
            debug_checks,
        }
    }

    /// CB id
    pub const fn index(&self) -> u8 {
        self.index
    }

    /// Core the CB lives on
    pub const fn core(&self) -> CoreCoord {
        self.core
    }

    /// Base L1 address
    pub const fn address(&self) -> u64 {
        self.address
    }

    /// Bytes per page (`get_tile_size`)
    pub const fn page_size(&self) -> u32 {
        self.page_size
    }

    /// Capacity in pages
    pub const fn capacity(&self) -> u32 {
        self.num_pages
    }

    /// Datum format
    pub const fn data_format(&self) -> DataFormat {
        self.data_format
    }

    fn check_request(&self, n: u32) -> KernelResult {
        if n > self.num_pages {
            return Err(KernelFault::CbRequestExceedsCapacity {
                cb: self.index,
                requested: n,
                capacity: self.num_pages,
            });
        }
        Ok(())
    }

    fn check_straddle(&self, page: u32, n: u32, what: &str) -> KernelResult {
        if self.debug_checks && page + n > self.num_pages {
            return Err(KernelFault::cb_protocol(
                self.index,
                format!(
                    "{what} of {n} pages at page {page} straddles the end of a {}-page ring",
                    self.num_pages
                ),
            ));
        }
        Ok(())
    }

    fn block_until(
        &self,
        state: &mut parking_lot::MutexGuard<'_, CbState>,
        ready: impl Fn(&CbState) -> bool,
    ) -> KernelResult<bool> {
        let mut blocked = false;
        while !ready(&**state) {
            if self.halt.load(Ordering::Acquire) {
                return Err(KernelFault::Halted);
            }
            blocked = true;
            self.changed.wait_for(state, HALT_POLL);
        }
        Ok(blocked)
    }

    /// Block until `n` pages are free at the back. Does not move the write pointer.
    ///
    /// # Errors
    ///
    /// Faults if `n` exceeds the capacity, on a wrap straddle (debug checks),
    /// or when the device halts.
    pub fn reserve_back(&self, n: u32) -> KernelResult {
        self.check_request(n)?;
        let mut state = self.state.lock();
        state.stats.reserve_calls += 1;
        let wr_page = state.wr_page;
        self.check_straddle(wr_page, n, "reserve_back")?;

        let capacity = u64::from(self.num_pages);
        let blocked =
            self.block_until(&mut state, |s| capacity.saturating_sub(s.available()) >= u64::from(n))?;
        if blocked {
            state.stats.blocked_reserves += 1;
        }
        state.reserved = Some(n);
        Ok(())
    }

    /// Publish `n` pages and advance the write pointer
    ///
    /// # Errors
    ///
    /// Faults if `n` exceeds the capacity, or (debug checks) if it does not
    /// match the preceding `reserve_back`.
    pub fn push_back(&self, n: u32) -> KernelResult {
        self.check_request(n)?;
        {
            let mut state = self.state.lock();
            if self.debug_checks && state.reserved != Some(n) {
                let reason = match state.reserved {
                    Some(r) => format!("push_back({n}) after reserve_back({r})"),
                    None => format!("push_back({n}) without reserve_back"),
                };
                return Err(KernelFault::cb_protocol(self.index, reason));
            }
            state.reserved = None;
            state.pushed += u64::from(n);
            state.wr_page = (state.wr_page + n) % self.num_pages;
            state.stats.push_calls += 1;
            state.stats.pages_pushed += u64::from(n);
            let available = u32::try_from(state.available()).unwrap_or(u32::MAX);
            state.stats.high_water = state.stats.high_water.max(available);
            trace!("cb{} {} push {n} -> {available} ready", self.index, self.core);
        }
        self.changed.notify_all();
        Ok(())
    }

    /// Block until `n` pages are ready at the front. Does not move the read pointer.
    ///
    /// # Errors
    ///
    /// Faults if `n` exceeds the capacity, on a wrap straddle (debug checks),
    /// or when the device halts.
    pub fn wait_front(&self, n: u32) -> KernelResult {
        self.check_request(n)?;
        let mut state = self.state.lock();
        state.stats.wait_calls += 1;
        let rd_page = state.rd_page;
        self.check_straddle(rd_page, n, "wait_front")?;

        let blocked = self.block_until(&mut state, |s| s.available() >= u64::from(n))?;
        if blocked {
            state.stats.blocked_waits += 1;
        }
        state.waited = state.waited.max(n);
        Ok(())
    }

    /// Release `n` pages and advance the read pointer
    ///
    /// # Errors
    ///
    /// Faults if `n` exceeds the capacity, or (debug checks) if more pages are
    /// popped than `wait_front` confirmed.
    pub fn pop_front(&self, n: u32) -> KernelResult {
        self.check_request(n)?;
        {
            let mut state = self.state.lock();
            if self.debug_checks && n > state.waited {
                return Err(KernelFault::cb_protocol(
                    self.index,
                    format!("pop_front({n}) but only {} pages were waited for", state.waited),
                ));
            }
            state.waited = state.waited.saturating_sub(n);
            state.popped += u64::from(n);
            state.rd_page = (state.rd_page + n) % self.num_pages;
            state.stats.pop_calls += 1;
            state.stats.pages_popped += u64::from(n);
        }
        self.changed.notify_all();
        Ok(())
    }

    /// L1 address of the page at the write pointer
    pub fn write_ptr(&self) -> u64 {
        self.address + u64::from(self.state.lock().wr_page) * u64::from(self.page_size)
    }

    /// L1 address of the page at the read pointer
    pub fn read_ptr(&self) -> u64 {
        self.address + u64::from(self.state.lock().rd_page) * u64::from(self.page_size)
    }

    /// L1 address of page `offset` past the read pointer, wrapping
    pub fn read_page_addr(&self, offset: u32) -> u64 {
        let page = (self.state.lock().rd_page + offset) % self.num_pages;
        self.address + u64::from(page) * u64::from(self.page_size)
    }

    /// L1 address of page `offset` past the write pointer, wrapping
    pub fn write_page_addr(&self, offset: u32) -> u64 {
        let page = (self.state.lock().wr_page + offset) % self.num_pages;
        self.address + u64::from(page) * u64::from(self.page_size)
    }

    /// Pages ready to read
    pub fn pages_available(&self) -> u32 {
        u32::try_from(self.state.lock().available()).unwrap_or(u32::MAX)
    }

    /// Pages free to write
    pub fn pages_free(&self) -> u32 {
        self.num_pages.saturating_sub(self.pages_available())
    }

    /// Snapshot of the counters
    pub fn stats(&self) -> CbStats {
        self.state.lock().stats
    }

    /// Back to empty with pointers at the base
    pub fn reset(&self) {
        *self.state.lock() = CbState::default();
        self.changed.notify_all();
    }
}
