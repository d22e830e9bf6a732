//! Execution engines and NoC ids.
//!
//! Every worker core has three independent instruction streams: two
//! data-movement RISC-V engines and one compute engine. They run
//! concurrently and share nothing but the core's L1.

use std::fmt;

/// One of the three engines on a core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Processor {
    /// First data-movement engine (BRISC). Conventionally the writer.
    DataMovement0,
    /// Second data-movement engine (NCRISC). Conventionally the reader.
    DataMovement1,
    /// Compute engine (unpack / math / pack).
    Compute,
}

impl Processor {
    /// All engines in slot order.
    pub const ALL: [Self; 3] = [Self::DataMovement0, Self::DataMovement1, Self::Compute];

    /// Slot index (0, 1, 2).
    #[must_use]
    pub const fn index(self) -> usize {
        match self {
            Self::DataMovement0 => 0,
            Self::DataMovement1 => 1,
            Self::Compute => 2,
        }
    }

    /// True for the two data-movement engines.
    #[must_use]
    pub const fn is_data_movement(self) -> bool {
        !matches!(self, Self::Compute)
    }

    /// NoC this engine uses unless configured otherwise.
    #[must_use]
    pub const fn default_noc(self) -> Option<NocId> {
        match self {
            Self::DataMovement0 => Some(NocId::Noc0),
            Self::DataMovement1 => Some(NocId::Noc1),
            Self::Compute => None,
        }
    }

    /// Short name used in thread names and logs.
    #[must_use]
    pub const fn short_name(self) -> &'static str {
        match self {
            Self::DataMovement0 => "dm0",
            Self::DataMovement1 => "dm1",
            Self::Compute => "compute",
        }
    }
}

impl fmt::Display for Processor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DataMovement0 => write!(f, "DM0 (BRISC)"),
            Self::DataMovement1 => write!(f, "DM1 (NCRISC)"),
            Self::Compute => write!(f, "Compute"),
        }
    }
}

/// The two NoCs a data-movement engine can issue on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum NocId {
    /// NoC 0.
    Noc0,
    /// NoC 1.
    Noc1,
}

impl fmt::Display for NocId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Noc0 => write!(f, "NOC0"),
            Self::Noc1 => write!(f, "NOC1"),
        }
    }
}
