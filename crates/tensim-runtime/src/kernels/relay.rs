// SPDX-License-Identifier: AGPL-3.0-only

//! Core-to-core relay over the NoC
//!
//! The receiver grants one credit per free slot in its CB; the sender writes
//! a page into that slot, fences, and bumps the receiver's data semaphore.
//! Both semaphores only count up, so each side waits for "at least `i + 1`"
//! and never has to reset a counter another core may still be touching.
//!
//! ```text
//!  sender core                        receiver core
//!   wait credit >= i+1  ◄── inc ───  reserve_back(1)
//!   async_write(slot i % pages)
//!   write_barrier
//!   inc data ─────────────────────►  wait data >= i+1
//!                                    push_back(1)
//! ```

use tensim_chip::CoreCoord;

use crate::error::KernelResult;
use crate::kernel::KernelContext;

/// Forward `num_pages` CB pages to the receiver core
///
/// # Errors
///
/// Argument, CB, NoC and semaphore faults.
pub fn relay_sender(ctx: &mut KernelContext) -> KernelResult {
    let cb = ctx.cb(ctx.compile_arg_cb(0)?)?;
    let num_pages = ctx.arg(0)?;
    let rx = CoreCoord::new(ctx.arg(1)?, ctx.arg(2)?);
    let rx_cb_addr = u64::from(ctx.arg(3)?);
    let rx_cb_pages = ctx.arg(4)?.max(1);
    let credit = ctx.semaphore_addr(ctx.arg(5)?);
    let data = ctx.semaphore_addr(ctx.arg(6)?);
    let page_size = cb.page_size();
    let data_ready = ctx.core_addr(rx.x, rx.y, data);

    for i in 0..num_pages {
        let slot = u64::from(i % rx_cb_pages);
        let dst = ctx.core_addr(rx.x, rx.y, rx_cb_addr + slot * u64::from(page_size));

        cb.wait_front(1)?;
        let noc = ctx.noc()?;
        noc.semaphore_wait_min(credit, i + 1)?;
        noc.async_write(cb.read_ptr(), dst, page_size)?;
        let fence = noc.write_barrier()?;
        noc.semaphore_inc(data_ready, 1, &fence)?;
        cb.pop_front(1)?;
    }
    Ok(())
}

/// Accept `num_pages` pages from the sender core into the local CB
///
/// # Errors
///
/// Argument, CB, NoC and semaphore faults.
pub fn relay_receiver(ctx: &mut KernelContext) -> KernelResult {
    let cb = ctx.cb(ctx.compile_arg_cb(0)?)?;
    let num_pages = ctx.arg(0)?;
    let tx = CoreCoord::new(ctx.arg(1)?, ctx.arg(2)?);
    let credit = ctx.core_addr(tx.x, tx.y, ctx.semaphore_addr(ctx.arg(3)?));
    let data = ctx.semaphore_addr(ctx.arg(4)?);

    for i in 0..num_pages {
        cb.reserve_back(1)?;
        let noc = ctx.noc()?;
        let fence = noc.write_barrier()?;
        noc.semaphore_inc(credit, 1, &fence)?;
        noc.semaphore_wait_min(data, i + 1)?;
        cb.push_back(1)?;
    }
    Ok(())
}
