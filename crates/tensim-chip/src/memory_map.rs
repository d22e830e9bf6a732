//! Per-core L1 memory map.
//!
//! L1 is one flat address space per core. The bottom of it is reserved for
//! firmware, the runtime-argument slots of the three engines, and the
//! semaphore words; everything above [`L1_UNRESERVED_BASE`] is shared between
//! circular buffers (allocated bottom-up) and L1 buffers (allocated top-down).
//!
//! ```text
//! 0x00000  firmware / mailboxes (not modelled)
//! 0x08000  runtime args, DM0      (256 × u32)
//! 0x08400  runtime args, DM1      (256 × u32)
//! 0x08800  runtime args, compute  (256 × u32)
//! 0x09000  semaphores             (8 × 16 B)
//! 0x1E000  unreserved: CBs grow up from here, L1 buffers grow down from the top
//! ```
//!
//! There is no protection between a CB region and adjacent scratch; the host
//! runtime is responsible for a collision-free layout.

use crate::processor::Processor;

// ── Alignment ────────────────────────────────────────────────────────────────

/// L1 allocation and NoC transfer alignment in bytes.
pub const L1_ALIGNMENT: u32 = 16;

/// DRAM page alignment in bytes.
pub const DRAM_ALIGNMENT: u32 = 32;

// ── Runtime arguments ────────────────────────────────────────────────────────

/// Base of the runtime-argument region.
pub const RUNTIME_ARGS_BASE: u32 = 0x8000;

/// Maximum runtime arguments per (kernel, core).
pub const MAX_RUNTIME_ARGS: usize = 256;

/// Bytes reserved for one engine's runtime arguments.
pub const RUNTIME_ARGS_STRIDE: u32 = (MAX_RUNTIME_ARGS as u32) * 4;

// ── Semaphores ───────────────────────────────────────────────────────────────

/// Base of the semaphore region.
pub const SEMAPHORE_BASE: u32 = 0x9000;

/// Semaphores available per core.
pub const NUM_SEMAPHORES: u32 = 8;

/// Bytes per semaphore slot (one u32, padded to L1 alignment).
pub const SEMAPHORE_SIZE: u32 = L1_ALIGNMENT;

// ── Circular buffers ─────────────────────────────────────────────────────────

/// First byte available to circular buffers and L1 buffers.
pub const L1_UNRESERVED_BASE: u32 = 120 * 1024;

/// Circular-buffer ids per core (0..32).
pub const NUM_CIRCULAR_BUFFERS: u8 = 32;

// ── Compute engine ───────────────────────────────────────────────────────────

/// Destination register tile slots available to the compute engine.
pub const DEST_TILE_SLOTS: usize = 16;

/// Runtime-argument base address for `processor`.
#[must_use]
pub const fn runtime_args_base(processor: Processor) -> u32 {
    RUNTIME_ARGS_BASE + processor.index() as u32 * RUNTIME_ARGS_STRIDE
}

/// L1 address of semaphore slot `index`.
#[must_use]
pub const fn semaphore_address(index: u32) -> u32 {
    SEMAPHORE_BASE + index * SEMAPHORE_SIZE
}

/// Round `value` up to a multiple of `alignment` (a power of two).
#[must_use]
pub const fn align_up(value: u64, alignment: u64) -> u64 {
    (value + alignment - 1) & !(alignment - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserved_regions_do_not_overlap() {
        let args_end = runtime_args_base(Processor::Compute) + RUNTIME_ARGS_STRIDE;
        assert!(args_end <= SEMAPHORE_BASE);
        assert!(semaphore_address(NUM_SEMAPHORES) <= L1_UNRESERVED_BASE);
    }

    #[test]
    fn alignment_rounding() {
        assert_eq!(align_up(0, 32), 0);
        assert_eq!(align_up(1, 32), 32);
        assert_eq!(align_up(2048, 32), 2048);
        assert_eq!(align_up(1088, 32), 1088);
        assert_eq!(align_up(33, 16), 48);
    }
}
