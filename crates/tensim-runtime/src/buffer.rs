//! Device buffers
//!
//! A buffer is a run of fixed-size pages placed in DRAM banks or worker L1.
//! Interleaved buffers deal pages round-robin over all banks of their kind;
//! sharded buffers give each listed core a contiguous shard. Every bank holds
//! its part at the same offset, which is the buffer's [`Buffer::address`].

use std::sync::Arc;
use tensim_chip::{CoreCoord, CoreRangeSet, NocAddr};

use crate::addrgen::{AddressGenerator, BankSet, InterleavedAddrGen, ShardedAddrGen};
use crate::error::{Result, RuntimeError};

/// Memory kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BufferType {
    /// DRAM banks
    Dram,
    /// Worker L1
    L1,
}

impl std::fmt::Display for BufferType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Dram => write!(f, "DRAM"),
            Self::L1 => write!(f, "L1"),
        }
    }
}

/// Page placement
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BufferLayout {
    /// Round-robin over every bank of the memory kind
    Interleaved,
    /// Contiguous shards on the listed cores (L1 only)
    Sharded {
        /// Cores holding shards, in shard order
        cores: CoreRangeSet,
    },
}

/// Buffer request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferConfig {
    /// Total bytes; a multiple of `page_size`
    pub size: u64,
    /// Bytes per page
    pub page_size: u32,
    /// Memory kind
    pub buffer_type: BufferType,
    /// Placement
    pub layout: BufferLayout,
}

impl BufferConfig {
    /// Interleaved DRAM buffer
    pub const fn dram_interleaved(size: u64, page_size: u32) -> Self {
        Self {
            size,
            page_size,
            buffer_type: BufferType::Dram,
            layout: BufferLayout::Interleaved,
        }
    }

    /// Interleaved L1 buffer over every worker core
    pub const fn l1_interleaved(size: u64, page_size: u32) -> Self {
        Self {
            size,
            page_size,
            buffer_type: BufferType::L1,
            layout: BufferLayout::Interleaved,
        }
    }

    /// L1 buffer sharded over `cores`
    pub fn l1_sharded(size: u64, page_size: u32, cores: impl Into<CoreRangeSet>) -> Self {
        Self {
            size,
            page_size,
            buffer_type: BufferType::L1,
            layout: BufferLayout::Sharded {
                cores: cores.into(),
            },
        }
    }

    /// Number of pages
    pub fn num_pages(&self) -> u64 {
        if self.page_size == 0 {
            0
        } else {
            self.size / u64::from(self.page_size)
        }
    }

    /// Check the request is well formed
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` for a zero size or page size, a size that is
    /// not a whole number of pages, or a malformed sharded layout.
    pub fn validate(&self) -> Result<()> {
        if self.page_size == 0 || self.size == 0 {
            return Err(RuntimeError::invalid_argument(
                "buffer size and page size must be non-zero",
            ));
        }
        if self.size % u64::from(self.page_size) != 0 {
            return Err(RuntimeError::invalid_argument(format!(
                "buffer size {} is not a multiple of page size {}",
                self.size, self.page_size
            )));
        }
        if u32::try_from(self.num_pages()).is_err() {
            return Err(RuntimeError::invalid_argument(format!(
                "buffer of {} pages exceeds the u32 page index range",
                self.num_pages()
            )));
        }
        if let BufferLayout::Sharded { cores } = &self.layout {
            if self.buffer_type != BufferType::L1 {
                return Err(RuntimeError::invalid_argument("only L1 buffers can be sharded"));
            }
            if cores.is_empty() {
                return Err(RuntimeError::invalid_argument("sharded buffer needs at least one core"));
            }
        }
        Ok(())
    }
}

/// Unique buffer id on one device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferId(u32);

impl BufferId {
    /// Create new buffer id
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    /// Get buffer id
    pub const fn id(&self) -> u32 {
        self.0
    }
}

/// An allocated buffer
#[derive(Debug, Clone)]
pub struct Buffer {
    id: BufferId,
    config: BufferConfig,
    address: u64,
    banks: BankSet,
    pages_per_shard: u32,
}

impl Buffer {
    pub(crate) fn new(id: BufferId, config: BufferConfig, address: u64, banks: BankSet) -> Self {
        let pages_per_shard = match config.layout {
            BufferLayout::Interleaved => 0,
            BufferLayout::Sharded { .. } => shard_pages(config.num_pages(), banks.len()),
        };
        Self {
            id,
            config,
            address,
            banks,
            pages_per_shard,
        }
    }

    /// Buffer id
    pub const fn id(&self) -> BufferId {
        self.id
    }

    /// Offset of the buffer in each of its banks
    pub const fn address(&self) -> u64 {
        self.address
    }

    /// Total bytes
    pub const fn size(&self) -> u64 {
        self.config.size
    }

    /// Bytes per page
    pub const fn page_size(&self) -> u32 {
        self.config.page_size
    }

    /// Number of pages
    #[allow(clippy::cast_possible_truncation)] // validated at creation
    pub fn num_pages(&self) -> u32 {
        self.config.num_pages() as u32
    }

    /// Memory kind
    pub const fn buffer_type(&self) -> BufferType {
        self.config.buffer_type
    }

    /// The request this buffer was created from
    pub const fn config(&self) -> &BufferConfig {
        &self.config
    }

    /// Banks the pages live in
    pub const fn banks(&self) -> &BankSet {
        &self.banks
    }

    /// Cores of a sharded buffer, in shard order
    pub fn shard_cores(&self) -> Option<&[CoreCoord]> {
        match (&self.config.layout, &self.banks) {
            (BufferLayout::Sharded { .. }, BankSet::L1 { cores }) => Some(cores.as_ref()),
            _ => None,
        }
    }

    /// Bounded address generator for this buffer
    pub fn address_generator(&self) -> Arc<dyn AddressGenerator> {
        match (&self.config.layout, &self.banks) {
            (BufferLayout::Sharded { .. }, BankSet::L1 { cores }) => Arc::new(ShardedAddrGen::new(
                self.address,
                self.config.page_size,
                Arc::clone(cores),
                self.pages_per_shard,
            )
            .with_bound(self.num_pages())),
            _ => Arc::new(
                InterleavedAddrGen::new(self.address, self.config.page_size, self.banks.clone())
                    .with_bound(self.num_pages()),
            ),
        }
    }

    /// NoC address of `page`
    pub fn page_location(&self, page: u32) -> NocAddr {
        self.address_generator().page_addr(page)
    }
}

/// Pages each shard holds when `num_pages` are split over `shards` cores
pub(crate) fn shard_pages(num_pages: u64, shards: u32) -> u32 {
    let shards = u64::from(shards.max(1));
    u32::try_from(num_pages.div_ceil(shards)).unwrap_or(u32::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tensim_chip::CoreRange;

    #[test]
    fn size_must_be_whole_pages() {
        assert!(BufferConfig::dram_interleaved(4096, 2048).validate().is_ok());
        assert!(BufferConfig::dram_interleaved(4000, 2048).validate().is_err());
        assert!(BufferConfig::dram_interleaved(0, 2048).validate().is_err());
    }

    #[test]
    fn sharding_requires_l1_and_cores() {
        let mut cfg = BufferConfig::l1_sharded(1024, 64, CoreRangeSet::default());
        assert!(cfg.validate().is_err());
        cfg.layout = BufferLayout::Sharded {
            cores: CoreCoord::new(0, 0).into(),
        };
        assert!(cfg.validate().is_ok());
        cfg.buffer_type = BufferType::Dram;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn page_location_uses_interleaving() {
        let buf = Buffer::new(
            BufferId::new(1),
            BufferConfig::dram_interleaved(16 * 2048, 2048),
            0x100,
            BankSet::Dram { count: 8 },
        );
        assert_eq!(buf.page_location(9), NocAddr::dram(1, 0x100 + 2048));
        assert_eq!(buf.address_generator().num_pages(), Some(16));
    }

    #[test]
    fn uneven_shards_are_bounded_by_page_count() {
        let cores: Arc<[CoreCoord]> = (0..4).map(|x| CoreCoord::new(x, 0)).collect();
        let buf = Buffer::new(
            BufferId::new(2),
            BufferConfig::l1_sharded(10 * 64, 64, CoreRange::new(CoreCoord::new(0, 0), CoreCoord::new(3, 0))),
            0x4_0000,
            BankSet::L1 { cores },
        );
        let gen = buf.address_generator();
        assert_eq!(gen.num_pages(), Some(10));
        assert_eq!(gen.page_addr(9), NocAddr::core(CoreCoord::new(3, 0), 0x4_0000));
        assert!(gen.checked_page_addr(10).is_err());
        assert!(gen.checked_page_addr(11).is_err());
    }

    #[test]
    fn shard_split_rounds_up() {
        assert_eq!(shard_pages(10, 4), 3);
        assert_eq!(shard_pages(8, 4), 2);
    }
}
