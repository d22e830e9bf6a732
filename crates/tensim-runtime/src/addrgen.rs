//! Page-to-NoC-address generators
//!
//! Kernels never see a buffer object; they see a base address, a page size
//! and a bank layout, and compute the NoC address of page `i` themselves.
//!
//! | Generator | Bank of page `i` | Offset in bank |
//! |-----------|------------------|----------------|
//! | [`InterleavedAddrGen`] | `i mod N` | `base + (i div N) × align(page_size)` |
//! | [`InterleavedPow2AddrGen`] | `i mod N` | `base + ((i div N) << log2_page_size)` |
//! | [`ShardedAddrGen`] | `i div pages_per_shard` | `base + (i mod pages_per_shard) × align(page_size)` |
//!
//! The page size a kernel passes here must match the page size of the CB it
//! stages through; nothing checks that. A page count bound can be attached,
//! and [`AddressGenerator::checked_page_addr`] uses it when debug checks are
//! enabled. Without a bound, out-of-range pages silently address whatever
//! lies past the buffer.

use std::fmt::Debug;
use std::sync::Arc;
use tensim_chip::memory_map::{align_up, DRAM_ALIGNMENT, L1_ALIGNMENT};
use tensim_chip::{CoreCoord, NocAddr, NocEndpoint};

use crate::error::{KernelFault, KernelResult};

/// The banks a buffer is spread across
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BankSet {
    /// DRAM banks `0..count`
    Dram {
        /// Number of banks
        count: u32,
    },
    /// L1 of the listed cores, in bank order
    L1 {
        /// Cores in bank order
        cores: Arc<[CoreCoord]>,
    },
}

impl BankSet {
    /// Number of banks
    pub fn len(&self) -> u32 {
        match self {
            Self::Dram { count } => *count,
            Self::L1 { cores } => u32::try_from(cores.len()).unwrap_or(u32::MAX),
        }
    }

    /// True if there are no banks
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Endpoint of bank `index`
    ///
    /// `index` must be below [`len`](Self::len).
    pub fn endpoint(&self, index: u32) -> NocEndpoint {
        match self {
            Self::Dram { .. } => NocEndpoint::DramBank(index),
            Self::L1 { cores } => NocEndpoint::Core(cores[index as usize]),
        }
    }

    /// Page alignment of this memory kind
    pub const fn alignment(&self) -> u64 {
        match self {
            Self::Dram { .. } => DRAM_ALIGNMENT as u64,
            Self::L1 { .. } => L1_ALIGNMENT as u64,
        }
    }
}

/// Maps page indices to NoC addresses
pub trait AddressGenerator: Debug + Send + Sync {
    /// Bytes per page
    fn page_size(&self) -> u32;

    /// Page count bound, if one was attached
    fn num_pages(&self) -> Option<u32>;

    /// NoC address of `page`. Never fails; out-of-range pages alias other memory.
    fn page_addr(&self, page: u32) -> NocAddr;

    /// NoC address of `page`, rejecting pages past the bound
    ///
    /// # Errors
    ///
    /// Returns `PageOutOfRange` if a bound is attached and `page` exceeds it.
    fn checked_page_addr(&self, page: u32) -> KernelResult<NocAddr> {
        match self.num_pages() {
            Some(num_pages) if page >= num_pages => {
                Err(KernelFault::PageOutOfRange { page, num_pages })
            }
            _ => Ok(self.page_addr(page)),
        }
    }
}

/// Round-robin page placement with aligned page stride
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterleavedAddrGen {
    base: u64,
    page_size: u32,
    stride: u64,
    banks: BankSet,
    bound: Option<u32>,
}

impl InterleavedAddrGen {
    /// Generator for a buffer at `base` spread over `banks`
    pub fn new(base: u64, page_size: u32, banks: BankSet) -> Self {
        let stride = align_up(u64::from(page_size), banks.alignment());
        Self {
            base,
            page_size,
            stride,
            banks,
            bound: None,
        }
    }

    /// Attach a page-count bound
    #[must_use]
    pub fn with_bound(mut self, num_pages: u32) -> Self {
        self.bound = Some(num_pages);
        self
    }

    /// (bank index, offset in bank) of `page`
    pub fn locate(&self, page: u32) -> (u32, u64) {
        let n = self.banks.len().max(1);
        let bank = page % n;
        let offset = self.base + u64::from(page / n) * self.stride;
        (bank, offset)
    }

    /// Aligned distance between consecutive pages in one bank
    pub const fn stride(&self) -> u64 {
        self.stride
    }
}

impl AddressGenerator for InterleavedAddrGen {
    fn page_size(&self) -> u32 {
        self.page_size
    }

    fn num_pages(&self) -> Option<u32> {
        self.bound
    }

    fn page_addr(&self, page: u32) -> NocAddr {
        let (bank, offset) = self.locate(page);
        NocAddr {
            endpoint: self.banks.endpoint(bank),
            offset,
        }
    }
}

/// Interleaved placement for power-of-two page sizes; shift instead of multiply
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterleavedPow2AddrGen {
    base: u64,
    log2_page_size: u32,
    banks: BankSet,
    bound: Option<u32>,
}

impl InterleavedPow2AddrGen {
    /// Generator for pages of `1 << log2_page_size` bytes
    pub const fn new(base: u64, log2_page_size: u32, banks: BankSet) -> Self {
        Self {
            base,
            log2_page_size,
            banks,
            bound: None,
        }
    }

    /// Attach a page-count bound
    #[must_use]
    pub fn with_bound(mut self, num_pages: u32) -> Self {
        self.bound = Some(num_pages);
        self
    }
}

impl AddressGenerator for InterleavedPow2AddrGen {
    fn page_size(&self) -> u32 {
        1 << self.log2_page_size
    }

    fn num_pages(&self) -> Option<u32> {
        self.bound
    }

    fn page_addr(&self, page: u32) -> NocAddr {
        let n = self.banks.len().max(1);
        NocAddr {
            endpoint: self.banks.endpoint(page % n),
            offset: self.base + (u64::from(page / n) << self.log2_page_size),
        }
    }
}

/// Contiguous shards of `pages_per_shard` pages, one shard per core
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardedAddrGen {
    base: u64,
    page_size: u32,
    stride: u64,
    cores: Arc<[CoreCoord]>,
    pages_per_shard: u32,
    bound: Option<u32>,
}

impl ShardedAddrGen {
    /// Generator for a buffer sharded over `cores`
    pub fn new(base: u64, page_size: u32, cores: Arc<[CoreCoord]>, pages_per_shard: u32) -> Self {
        Self {
            base,
            page_size,
            stride: align_up(u64::from(page_size), u64::from(L1_ALIGNMENT)),
            cores,
            pages_per_shard: pages_per_shard.max(1),
            bound: None,
        }
    }

    /// Attach a page-count bound
    ///
    /// The last shard may be short, so this is the buffer's page count, not
    /// `cores × pages_per_shard`.
    #[must_use]
    pub fn with_bound(mut self, num_pages: u32) -> Self {
        self.bound = Some(num_pages);
        self
    }
}

impl AddressGenerator for ShardedAddrGen {
    fn page_size(&self) -> u32 {
        self.page_size
    }

    fn num_pages(&self) -> Option<u32> {
        self.bound
    }

    fn page_addr(&self, page: u32) -> NocAddr {
        let shard = (page / self.pages_per_shard) as usize;
        // past the last shard: keep addressing the last core, like running off the end
        let core = self.cores[shard.min(self.cores.len() - 1)];
        let index = if shard < self.cores.len() {
            page % self.pages_per_shard
        } else {
            page - (self.cores.len() as u32 - 1) * self.pages_per_shard
        };
        NocAddr::core(core, self.base + u64::from(index) * self.stride)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn interleaved_pages_spread_evenly_over_banks() {
        let gen = InterleavedAddrGen::new(0x1000, 2048, BankSet::Dram { count: 8 });
        let mut per_bank: HashMap<u32, u32> = HashMap::new();
        for page in 0..64 {
            let (bank, _) = gen.locate(page);
            *per_bank.entry(bank).or_default() += 1;
        }
        assert_eq!(per_bank.len(), 8);
        assert!(per_bank.values().all(|&n| n == 8));
    }

    #[test]
    fn interleaved_offsets_have_period_n() {
        let n = 8;
        let gen = InterleavedAddrGen::new(0x1000, 100, BankSet::Dram { count: n });
        assert_eq!(gen.stride(), 128);
        for page in 0..40 {
            let (bank, offset) = gen.locate(page);
            let (bank_next, offset_next) = gen.locate(page + n);
            assert_eq!(bank, bank_next);
            assert_eq!(offset_next - offset, 128);
        }
        assert_eq!(gen.locate(0), (0, 0x1000));
        assert_eq!(gen.locate(9), (1, 0x1000 + 128));
    }

    #[test]
    fn pow2_matches_interleaved_for_aligned_pages() {
        let banks = BankSet::Dram { count: 6 };
        let a = InterleavedAddrGen::new(0x40, 2048, banks.clone());
        let b = InterleavedPow2AddrGen::new(0x40, 11, banks);
        for page in 0..100 {
            assert_eq!(a.page_addr(page), b.page_addr(page));
        }
    }

    #[test]
    fn l1_banks_follow_core_order() {
        let cores: Arc<[CoreCoord]> = vec![CoreCoord::new(0, 0), CoreCoord::new(1, 0)].into();
        let gen = InterleavedAddrGen::new(0x2_0000, 32, BankSet::L1 { cores });
        assert_eq!(gen.page_addr(3), NocAddr::core(CoreCoord::new(1, 0), 0x2_0000 + 32));
    }

    #[test]
    fn bound_is_enforced_only_by_checked_lookup() {
        let gen = InterleavedAddrGen::new(0, 64, BankSet::Dram { count: 2 }).with_bound(4);
        assert!(gen.checked_page_addr(3).is_ok());
        assert_eq!(
            gen.checked_page_addr(4),
            Err(KernelFault::PageOutOfRange { page: 4, num_pages: 4 })
        );
        // unchecked lookup still produces an address
        assert_eq!(gen.page_addr(4), NocAddr::dram(0, 128));
    }

    #[test]
    fn sharded_pages_are_contiguous_per_core() {
        let cores: Arc<[CoreCoord]> = vec![CoreCoord::new(2, 0), CoreCoord::new(3, 0)].into();
        let gen = ShardedAddrGen::new(0x3_0000, 64, cores, 4);
        assert_eq!(gen.num_pages(), None);
        assert_eq!(gen.page_addr(0), NocAddr::core(CoreCoord::new(2, 0), 0x3_0000));
        assert_eq!(gen.page_addr(3), NocAddr::core(CoreCoord::new(2, 0), 0x3_0000 + 192));
        assert_eq!(gen.page_addr(4), NocAddr::core(CoreCoord::new(3, 0), 0x3_0000));
    }

    #[test]
    fn sharded_bound_is_the_page_count_not_the_shard_capacity() {
        let cores: Arc<[CoreCoord]> = (0..4).map(|x| CoreCoord::new(x, 0)).collect();
        // 10 pages over 4 cores: shards of 3, 3, 3, 1
        let gen = ShardedAddrGen::new(0, 64, cores, 3).with_bound(10);
        assert_eq!(gen.num_pages(), Some(10));
        assert!(gen.checked_page_addr(9).is_ok());
        assert_eq!(
            gen.checked_page_addr(10),
            Err(KernelFault::PageOutOfRange { page: 10, num_pages: 10 })
        );
        assert!(gen.checked_page_addr(11).is_err());
    }
}
