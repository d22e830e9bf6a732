//! Tile geometry and data formats.
//!
//! A tile is 32×32 datums. CB pages are usually sized to one tile of the
//! CB's data format, which is why [`DataFormat::tile_size`] is the default
//! page size when a CB is declared without an explicit one.

use std::fmt;

/// Tile height in datums.
pub const TILE_HEIGHT: u32 = 32;
/// Tile width in datums.
pub const TILE_WIDTH: u32 = 32;
/// Datums per tile.
pub const TILE_HW: u32 = TILE_HEIGHT * TILE_WIDTH;

/// Datum format of a CB or buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum DataFormat {
    /// IEEE f32.
    Float32,
    /// bfloat16.
    #[default]
    Float16B,
    /// Block floating point, 8-bit mantissas with one shared exponent per 16 datums.
    Bfp8B,
    /// u32.
    UInt32,
    /// u16.
    UInt16,
    /// u8.
    UInt8,
}

impl DataFormat {
    /// Bytes in one 32×32 tile of this format.
    #[must_use]
    pub const fn tile_size(self) -> u32 {
        match self {
            Self::Float32 | Self::UInt32 => TILE_HW * 4,
            Self::Float16B | Self::UInt16 => TILE_HW * 2,
            // mantissas + one exponent byte per 16 datums
            Self::Bfp8B => TILE_HW + TILE_HW / 16,
            Self::UInt8 => TILE_HW,
        }
    }
}

impl fmt::Display for DataFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Float32 => "Float32",
            Self::Float16B => "Float16_b",
            Self::Bfp8B => "Bfp8_b",
            Self::UInt32 => "UInt32",
            Self::UInt16 => "UInt16",
            Self::UInt8 => "UInt8",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tile_sizes() {
        assert_eq!(DataFormat::Float16B.tile_size(), 2048);
        assert_eq!(DataFormat::Float32.tile_size(), 4096);
        assert_eq!(DataFormat::Bfp8B.tile_size(), 1088);
        assert_eq!(DataFormat::UInt8.tile_size(), 1024);
    }
}
