//! NoC addressing.
//!
//! A NoC address names an endpoint (a worker core's L1 or a DRAM bank) and
//! a byte offset inside it. Kernels pass addresses around as raw `u64`
//! values, so the runtime also defines a packed encoding:
//!
//! ```text
//!  63      49   48   47    42 41    36 35                 0
//! +----------+------+--------+--------+--------------------+
//! | reserved | DRAM |   y    |   x    |   local offset     |
//! +----------+------+--------+--------+--------------------+
//! ```
//!
//! For DRAM endpoints the `x` field carries the bank id and `y` is zero.

use std::fmt;

use crate::coord::CoreCoord;

/// Bits of local offset in a raw NoC address.
pub const NOC_ADDR_LOCAL_BITS: u32 = 36;
/// Bits per node-id coordinate.
pub const NOC_ADDR_NODE_ID_BITS: u32 = 6;
/// Flag bit marking a DRAM endpoint.
pub const NOC_ADDR_DRAM_BIT: u32 = NOC_ADDR_LOCAL_BITS + 2 * NOC_ADDR_NODE_ID_BITS;

const LOCAL_MASK: u64 = (1 << NOC_ADDR_LOCAL_BITS) - 1;
const NODE_MASK: u64 = (1 << NOC_ADDR_NODE_ID_BITS) - 1;

/// Target of a NoC transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum NocEndpoint {
    /// L1 of a worker core.
    Core(CoreCoord),
    /// A DRAM bank.
    DramBank(u32),
}

impl fmt::Display for NocEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Core(c) => write!(f, "core{c}"),
            Self::DramBank(b) => write!(f, "dram[{b}]"),
        }
    }
}

/// Endpoint plus byte offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NocAddr {
    /// Where the bytes live.
    pub endpoint: NocEndpoint,
    /// Byte offset inside the endpoint.
    pub offset: u64,
}

impl NocAddr {
    /// Address in a core's L1.
    #[must_use]
    pub const fn core(core: CoreCoord, offset: u64) -> Self {
        Self { endpoint: NocEndpoint::Core(core), offset }
    }

    /// Address in a DRAM bank.
    #[must_use]
    pub const fn dram(bank: u32, offset: u64) -> Self {
        Self { endpoint: NocEndpoint::DramBank(bank), offset }
    }

    /// Same endpoint, offset advanced by `bytes`.
    #[must_use]
    pub const fn add(self, bytes: u64) -> Self {
        Self { endpoint: self.endpoint, offset: self.offset + bytes }
    }

    /// Packed 64-bit form.
    ///
    /// Offsets and coordinates wider than their fields are truncated, as the
    /// hardware would.
    #[must_use]
    pub const fn to_raw(self) -> u64 {
        let local = self.offset & LOCAL_MASK;
        match self.endpoint {
            NocEndpoint::Core(c) => {
                local
                    | ((c.x as u64 & NODE_MASK) << NOC_ADDR_LOCAL_BITS)
                    | ((c.y as u64 & NODE_MASK) << (NOC_ADDR_LOCAL_BITS + NOC_ADDR_NODE_ID_BITS))
            }
            NocEndpoint::DramBank(b) => {
                local | ((b as u64 & NODE_MASK) << NOC_ADDR_LOCAL_BITS) | (1 << NOC_ADDR_DRAM_BIT)
            }
        }
    }

    /// Decode the packed form.
    #[must_use]
    pub const fn from_raw(raw: u64) -> Self {
        let offset = raw & LOCAL_MASK;
        let x = ((raw >> NOC_ADDR_LOCAL_BITS) & NODE_MASK) as u32;
        let y = ((raw >> (NOC_ADDR_LOCAL_BITS + NOC_ADDR_NODE_ID_BITS)) & NODE_MASK) as u32;
        if raw & (1 << NOC_ADDR_DRAM_BIT) != 0 {
            Self::dram(x, offset)
        } else {
            Self::core(CoreCoord::new(x, y), offset)
        }
    }
}

impl fmt::Display for NocAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}+{:#x}", self.endpoint, self.offset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn core_address_packs_coordinates() {
        let a = NocAddr::core(CoreCoord::new(3, 5), 0x1_E000);
        let raw = a.to_raw();
        assert_eq!(raw & LOCAL_MASK, 0x1_E000);
        assert_eq!(NocAddr::from_raw(raw), a);
    }

    #[test]
    fn dram_flag_distinguishes_bank_from_core() {
        let dram = NocAddr::dram(3, 64).to_raw();
        let core = NocAddr::core(CoreCoord::new(3, 0), 64).to_raw();
        assert_ne!(dram, core);
        assert_eq!(NocAddr::from_raw(dram).endpoint, NocEndpoint::DramBank(3));
    }

    #[test]
    fn add_advances_offset_only() {
        let a = NocAddr::dram(1, 100).add(28);
        assert_eq!(a, NocAddr::dram(1, 128));
    }
}
