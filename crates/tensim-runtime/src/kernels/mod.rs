// SPDX-License-Identifier: AGPL-3.0-only

//! Stock kernel library
//!
//! Every device registry starts with these sources. Argument layouts:
//!
//! | Source | Compile args | Runtime args |
//! |--------|--------------|--------------|
//! | [`READER_INTERLEAVED`] | `cb, block` | `addr, num_pages, start_page, is_dram, buffer_pages` |
//! | [`WRITER_INTERLEAVED`] | `cb, block` | `addr, num_pages, start_page, is_dram, buffer_pages` |
//! | [`COPY_TILES`] | `in_cb, out_cb, num_tiles` | none |
//! | [`RELAY_SENDER`] | `cb` | `num_pages, rx_x, rx_y, rx_cb_addr, rx_cb_pages, credit_sem, data_sem` |
//! | [`RELAY_RECEIVER`] | `cb` | `num_pages, tx_x, tx_y, credit_sem, data_sem` |
//!
//! The interleaved kernels take their page size from the CB they feed, so
//! the buffer and the CB must agree on it.

pub mod compute;
pub mod dataflow;
pub mod relay;

use crate::kernel::{KernelRegistry, KernelSource};

/// DRAM/L1 interleaved buffer → CB
pub const READER_INTERLEAVED: &str = "dataflow/reader_interleaved";
/// CB → DRAM/L1 interleaved buffer
pub const WRITER_INTERLEAVED: &str = "dataflow/writer_interleaved";
/// CB → destination registers → CB, one tile at a time
pub const COPY_TILES: &str = "compute/copy_tiles";
/// CB → remote core's CB, credit-based
pub const RELAY_SENDER: &str = "dataflow/relay_sender";
/// Remote core → local CB, credit-based
pub const RELAY_RECEIVER: &str = "dataflow/relay_receiver";

/// Add the stock kernels to `registry`
pub fn register_stock(registry: &mut KernelRegistry) {
    registry.register(
        KernelSource::new(READER_INTERLEAVED, dataflow::reader_interleaved).with_signature(2, 5),
    );
    registry.register(
        KernelSource::new(WRITER_INTERLEAVED, dataflow::writer_interleaved).with_signature(2, 5),
    );
    registry.register(KernelSource::new(COPY_TILES, compute::copy_tiles).with_signature(3, 0));
    registry.register(KernelSource::new(RELAY_SENDER, relay::relay_sender).with_signature(1, 7));
    registry.register(KernelSource::new(RELAY_RECEIVER, relay::relay_receiver).with_signature(1, 5));
}
