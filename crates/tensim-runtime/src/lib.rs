//! Host runtime and execution model for a simulated Tensix-style grid.
//!
//! Programs are built on the host from buffers, circular buffers (CBs),
//! semaphores and kernels, compiled against a [`KernelRegistry`], and
//! launched on a [`Device`]. Every core runs three engines (two data-movement
//! engines with a NoC each, one compute engine), each on its own thread.
//!
//! # Execution model
//!
//! ```text
//!            core (x, y)
//!  ┌──────────────────────────────────────────┐
//!  │  DM1 (reader, NOC1)  ──► CB 0 ──►  compute │
//!  │                                     │      │
//!  │  DM0 (writer, NOC0)  ◄── CB 16 ◄────┘      │
//!  └──────────────────────────────────────────┘
//!         ▲                       │
//!         │ async_read            │ async_write
//!     DRAM banks (interleaved)  ◄─┘
//! ```
//!
//! Engines on one core coordinate only through CB page counts. Engines on
//! different cores coordinate only through semaphores, and a semaphore
//! increment needs the [`WriteFence`] returned by a write barrier.
//!
//! # Quick start
//!
//! ```no_run
//! use tensim_runtime::{pipelines, Device, RuntimeConfig};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let mut dev = Device::open(RuntimeConfig::small())?;
//! let input: Vec<u8> = (0..16 * 2048).map(|i| (i % 251) as u8).collect();
//! let run = pipelines::run_copy(&mut dev, &input, &pipelines::CopyOptions::default())?;
//! assert_eq!(&run.output[..], &input[..]);
//! println!("{:?}", run.report.duration);
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::cast_possible_truncation)]

pub mod addrgen;
mod allocator;
mod buffer;
mod cb;
mod config;
mod device;
mod error;
mod kernel;
pub mod kernels;
mod memory;
mod noc;
pub mod pipelines;
mod program;
mod transport;

pub use addrgen::{
    AddressGenerator, BankSet, InterleavedAddrGen, InterleavedPow2AddrGen, ShardedAddrGen,
};
pub use allocator::{AllocDirection, BankAllocator};
pub use buffer::{Buffer, BufferConfig, BufferId, BufferLayout, BufferType};
pub use cb::{CbStats, CircularBuffer, CircularBufferConfig, CircularBufferHandle};
pub use config::{RuntimeConfig, ENV_DEBUG_CHECKS, ENV_WATCHDOG_MS};
pub use device::{Device, EngineReport, LaunchReport};
pub use error::{KernelFault, KernelResult, Result, RuntimeError};
pub use kernel::{
    CbEndpoint, CbUsage, ComputeConfig, KernelConfig, KernelContext, KernelEntry, KernelHandle,
    KernelRegistry, KernelSignature, KernelSource, KernelSpec, KernelState,
};
pub use memory::{DeviceMemory, MemoryRegion};
pub use noc::{Noc, NocStats, WriteFence};
pub use program::{
    BinaryCache, CompileReport, CompiledKernel, ContractIssue, Program, ProgramKernel, Semaphore,
};
pub use transport::{HostTransport, SimulatedTransport, TransportType};

/// Silicon model (re-exported from tensim-chip).
pub mod chip {
    pub use tensim_chip::memory_map;
    pub use tensim_chip::{
        CoreCoord, CoreRange, CoreRangeSet, DataFormat, GridTopology, NocAddr, NocEndpoint, NocId,
        Processor,
    };
}
