//! Worker grid topology and device memory sizes.
//!
//! ## Reference figures
//!
//! - 12×10 worker grid (120 Tensix cores), 1 MiB of L1 SRAM per core
//! - 8 DRAM channels, interleaved round-robin for bandwidth
//! - Each core carries two data-movement RISC-V engines and one compute
//!   engine (see [`crate::processor`])

use crate::coord::{CoreCoord, CoreRange};

/// Grid and memory geometry of one simulated device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GridTopology {
    /// Worker columns.
    pub grid_x: u32,
    /// Worker rows.
    pub grid_y: u32,
    /// L1 bytes per core.
    pub l1_bytes: u32,
    /// DRAM banks (channels).
    pub dram_banks: u32,
    /// Bytes per DRAM bank.
    pub dram_bank_bytes: u64,
}

impl GridTopology {
    /// Reference device: 12×10 workers, 1 MiB L1, 8 × 1 GiB DRAM.
    pub const REFERENCE: Self = Self {
        grid_x: 12,
        grid_y: 10,
        l1_bytes: 1024 * 1024,
        dram_banks: 8,
        dram_bank_bytes: 1 << 30,
    };

    /// Small device for tests and demos: 4×4 workers, 8 × 64 MiB DRAM.
    pub const SMALL: Self = Self {
        grid_x: 4,
        grid_y: 4,
        l1_bytes: 1024 * 1024,
        dram_banks: 8,
        dram_bank_bytes: 64 << 20,
    };

    /// Number of worker cores.
    #[must_use]
    pub const fn total_cores(&self) -> u32 {
        self.grid_x * self.grid_y
    }

    /// Total DRAM capacity in bytes.
    #[must_use]
    pub const fn total_dram_bytes(&self) -> u64 {
        self.dram_banks as u64 * self.dram_bank_bytes
    }

    /// True if `core` is a worker on this grid.
    #[must_use]
    pub const fn contains(&self, core: CoreCoord) -> bool {
        core.x < self.grid_x && core.y < self.grid_y
    }

    /// The full worker rectangle.
    #[must_use]
    pub const fn worker_range(&self) -> CoreRange {
        CoreRange {
            start: CoreCoord::new(0, 0),
            end: CoreCoord::new(self.grid_x - 1, self.grid_y - 1),
        }
    }

    /// Worker cores in row-major order. L1-interleaved buffers use this
    /// order as their bank order.
    #[must_use]
    pub fn worker_cores(&self) -> Vec<CoreCoord> {
        self.worker_range().iter().collect()
    }
}

impl Default for GridTopology {
    fn default() -> Self {
        Self::REFERENCE
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reference_geometry() {
        let t = GridTopology::REFERENCE;
        assert_eq!(t.total_cores(), 120);
        assert_eq!(t.total_dram_bytes(), 8 << 30);
        assert!(t.contains(CoreCoord::new(11, 9)));
        assert!(!t.contains(CoreCoord::new(12, 0)));
    }

    #[test]
    fn worker_order_is_row_major() {
        let cores = GridTopology::SMALL.worker_cores();
        assert_eq!(cores.len(), 16);
        assert_eq!(cores[1], CoreCoord::new(1, 0));
        assert_eq!(cores[4], CoreCoord::new(0, 1));
    }
}
