//! Silicon model for a Tensix-style accelerator grid.
//!
//! This crate has **no dependencies** and **no device access** — it is a
//! pure model of the chip as the runtime sees it: worker-core coordinates,
//! grid topology, the per-core L1 memory map, tile data formats, NoC address
//! encoding, and the three execution engines each core carries.
//!
//! # Crate organisation
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`coord`] | `CoreCoord`, inclusive `CoreRange`, `CoreRangeSet` |
//! | [`topology`] | Worker grid size, L1 size, DRAM bank count and size |
//! | [`memory_map`] | L1 layout: reserved region, runtime args, semaphores, CB limits |
//! | [`format`] | Tile geometry and per-format tile byte sizes |
//! | [`noc`] | `NocAddr` endpoints and the 64-bit raw encoding |
//! | [`processor`] | Data-movement / compute engines and NoC ids |

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod coord;
pub mod format;
pub mod memory_map;
pub mod noc;
pub mod processor;
pub mod topology;

pub use coord::{CoreCoord, CoreRange, CoreRangeSet};
pub use format::DataFormat;
pub use noc::{NocAddr, NocEndpoint};
pub use processor::{NocId, Processor};
pub use topology::GridTopology;
