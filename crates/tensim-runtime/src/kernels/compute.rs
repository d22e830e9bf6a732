// SPDX-License-Identifier: AGPL-3.0-only

//! Compute kernels

use crate::error::KernelResult;
use crate::kernel::KernelContext;

/// Move `num_tiles` tiles from `in_cb` to `out_cb` through destination slot 0
///
/// # Errors
///
/// Argument, CB and register faults.
pub fn copy_tiles(ctx: &mut KernelContext) -> KernelResult {
    let in_cb = ctx.compile_arg_cb(0)?;
    let out_cb = ctx.compile_arg_cb(1)?;
    let num_tiles = ctx.compile_arg(2)?;
    let (input, output) = (ctx.cb(in_cb)?, ctx.cb(out_cb)?);

    for _ in 0..num_tiles {
        input.wait_front(1)?;
        output.reserve_back(1)?;

        ctx.acquire_dst()?;
        ctx.copy_tile(in_cb, 0, 0)?;
        ctx.pack_tile(0, out_cb, 0)?;
        ctx.release_dst()?;

        input.pop_front(1)?;
        output.push_back(1)?;
    }
    Ok(())
}
