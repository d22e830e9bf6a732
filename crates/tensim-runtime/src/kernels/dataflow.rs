// SPDX-License-Identifier: AGPL-3.0-only

//! Interleaved reader and writer
//!
//! Both walk pages `start_page..start_page + num_pages` of an interleaved
//! buffer in blocks of `block` pages. The last block may be short. The
//! generator is bounded by `buffer_pages`, so with debug checks on a walk
//! past the end of the buffer faults instead of touching its neighbours.

use crate::addrgen::{BankSet, InterleavedAddrGen};
use crate::error::KernelResult;
use crate::kernel::KernelContext;

/// Bounded generator for the buffer a walk covers
fn interleaved(ctx: &KernelContext, walk: &PageWalk, page_size: u32) -> InterleavedAddrGen {
    let banks = if walk.is_dram {
        BankSet::Dram {
            count: ctx.topology().dram_banks,
        }
    } else {
        BankSet::L1 {
            cores: ctx.topology().worker_cores().into(),
        }
    };
    InterleavedAddrGen::new(u64::from(walk.addr), page_size, banks).with_bound(walk.buffer_pages)
}

struct PageWalk {
    cb: u8,
    block: u32,
    addr: u32,
    start: u32,
    end: u32,
    is_dram: bool,
    buffer_pages: u32,
}

fn page_walk(ctx: &KernelContext) -> KernelResult<PageWalk> {
    let start = ctx.arg(2)?;
    Ok(PageWalk {
        cb: ctx.compile_arg_cb(0)?,
        block: ctx.compile_arg(1)?.max(1),
        addr: ctx.arg(0)?,
        start,
        end: start.saturating_add(ctx.arg(1)?),
        is_dram: ctx.arg(3)? != 0,
        buffer_pages: ctx.arg(4)?,
    })
}

/// Read buffer pages into a CB
///
/// # Errors
///
/// Argument, CB and NoC faults; `PageOutOfRange` past `buffer_pages` under
/// debug checks.
pub fn reader_interleaved(ctx: &mut KernelContext) -> KernelResult {
    let walk = page_walk(ctx)?;
    let cb = ctx.cb(walk.cb)?;
    let gen = interleaved(ctx, &walk, cb.page_size());

    let mut page = walk.start;
    while page < walk.end {
        let n = walk.block.min(walk.end - page);
        cb.reserve_back(n)?;
        let noc = ctx.noc()?;
        for i in 0..n {
            noc.async_read_page(&gen, page + i, cb.write_page_addr(i))?;
        }
        noc.read_barrier()?;
        cb.push_back(n)?;
        page += n;
    }
    Ok(())
}

/// Write CB pages out to a buffer
///
/// # Errors
///
/// Argument, CB and NoC faults; `PageOutOfRange` past `buffer_pages` under
/// debug checks.
pub fn writer_interleaved(ctx: &mut KernelContext) -> KernelResult {
    let walk = page_walk(ctx)?;
    let cb = ctx.cb(walk.cb)?;
    let gen = interleaved(ctx, &walk, cb.page_size());

    let mut page = walk.start;
    while page < walk.end {
        let n = walk.block.min(walk.end - page);
        cb.wait_front(n)?;
        let noc = ctx.noc()?;
        for i in 0..n {
            noc.async_write_page(&gen, page + i, cb.read_page_addr(i))?;
        }
        let _fence = noc.write_barrier()?;
        cb.pop_front(n)?;
        page += n;
    }
    Ok(())
}
