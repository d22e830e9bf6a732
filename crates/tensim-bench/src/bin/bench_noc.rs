// SPDX-License-Identifier: AGPL-3.0-only

//! NoC barrier benchmark — how much batching reads behind one barrier buys.
//!
//! The kernel pulls every page of a DRAM buffer into an L1 staging area,
//! issuing `batch` reads before each `read_barrier`. Batch 1 is the
//! barrier-per-page pattern.
//!
//! Usage:
//!   cargo run --bin bench_noc
//!   cargo run --bin bench_noc -- --pages 2048 --page-size 1024

use anyhow::{Context, Result};
use std::time::Duration;
use tensim_chip::memory_map::L1_UNRESERVED_BASE;
use tensim_chip::CoreCoord;
use tensim_runtime::addrgen::{BankSet, InterleavedAddrGen};
use tensim_runtime::{
    BufferConfig, Device, KernelConfig, KernelContext, KernelResult, KernelSource, KernelSpec,
    Program, RuntimeConfig,
};
use tracing_subscriber::EnvFilter;

const DEFAULT_PAGES: usize = 1024;
const DEFAULT_PAGE_SIZE: usize = 2048;
const BATCHES: [u32; 5] = [1, 2, 4, 8, 16];
const SOURCE: &str = "bench/batched_reader";
const CORE: CoreCoord = CoreCoord::new(0, 0);

/// Runtime args: `addr, num_pages, batch, page_size`
fn batched_reader(ctx: &mut KernelContext) -> KernelResult {
    let addr = u64::from(ctx.arg(0)?);
    let pages = ctx.arg(1)?;
    let batch = ctx.arg(2)?.max(1);
    let page_size = ctx.arg(3)?;
    let gen = InterleavedAddrGen::new(
        addr,
        page_size,
        BankSet::Dram {
            count: ctx.topology().dram_banks,
        },
    );
    let staging = u64::from(L1_UNRESERVED_BASE);

    let noc = ctx.noc()?;
    let mut page = 0;
    while page < pages {
        let n = batch.min(pages - page);
        for i in 0..n {
            noc.async_read_page(&gen, page + i, staging + u64::from(i * page_size))?;
        }
        noc.read_barrier()?;
        page += n;
    }
    Ok(())
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("warn".parse()?))
        .init();

    let args: Vec<String> = std::env::args().collect();
    let pages = u32::try_from(parse_arg(&args, "--pages", DEFAULT_PAGES))?;
    let page_size = u32::try_from(parse_arg(&args, "--page-size", DEFAULT_PAGE_SIZE))?;

    println!("NoC barrier benchmark");
    println!("=====================");
    println!("Pages       : {pages} × {page_size} B");
    println!();

    let config = RuntimeConfig::small()
        .with_debug_checks(false)
        .with_watchdog(Duration::from_secs(60));
    let mut dev = Device::open(config)?;
    dev.registry_mut()
        .register(KernelSource::new(SOURCE, batched_reader).with_signature(0, 4));

    let size = u64::from(pages) * u64::from(page_size);
    let src = dev.create_buffer(BufferConfig::dram_interleaved(size, page_size))?;
    let payload: Vec<u8> = (0..size).map(|i| (i % 241) as u8).collect();
    dev.write_buffer(&src, &payload)?;
    let addr = u32::try_from(src.address()).context("buffer address exceeds 32 bits")?;

    println!("{:>6}  {:>10}  {:>10}  {:>12}", "batch", "barriers", "MB/s", "µs/page");
    for batch in BATCHES {
        let mut program = Program::new();
        let kernel = program.create_kernel(KernelSpec::new(SOURCE, CORE, KernelConfig::reader()))?;
        program.set_runtime_args(kernel, CORE, &[addr, pages, batch, page_size])?;
        dev.compile_program(&mut program)?;
        let report = dev.launch_program(&mut program)?;

        let secs = report.duration.as_secs_f64();
        let mb_s = size as f64 / 1_048_576.0 / secs;
        let us_page = secs * 1e6 / f64::from(pages);
        println!(
            "{batch:>6}  {:>10}  {mb_s:>10.1}  {us_page:>12.2}",
            report.noc_totals.read_barriers
        );
    }

    dev.deallocate_buffer(&src)?;
    Ok(())
}

fn parse_arg(args: &[String], flag: &str, default: usize) -> usize {
    args.windows(2)
        .find(|w| w[0] == flag)
        .and_then(|w| w[1].parse().ok())
        .unwrap_or(default)
}
