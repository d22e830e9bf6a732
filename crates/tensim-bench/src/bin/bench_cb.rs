// SPDX-License-Identifier: AGPL-3.0-only

//! CB handoff benchmark — reader → CB → writer on one core, sweeping CB depth.
//!
//! A one-page CB serialises the two engines; deeper CBs let the reader run
//! ahead. The blocked-wait and blocked-reserve counters show which side is
//! starved at each depth.
//!
//! Usage:
//!   cargo run --bin bench_cb
//!   cargo run --bin bench_cb -- --pages 1024 --page-size 2048 --iterations 5

use anyhow::{ensure, Result};
use std::time::Duration;
use tensim_runtime::pipelines::{self, CopyOptions, INPUT_CB};
use tensim_runtime::{Device, RuntimeConfig};
use tracing_subscriber::EnvFilter;

const DEFAULT_PAGES: usize = 512;
const DEFAULT_PAGE_SIZE: usize = 2048;
const DEFAULT_ITERATIONS: usize = 3;
const DEPTHS: [u32; 5] = [1, 2, 4, 8, 16];

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("warn".parse()?))
        .init();

    let args: Vec<String> = std::env::args().collect();
    let pages = parse_arg(&args, "--pages", DEFAULT_PAGES);
    let page_size = parse_arg(&args, "--page-size", DEFAULT_PAGE_SIZE);
    let iterations = parse_arg(&args, "--iterations", DEFAULT_ITERATIONS).max(1);

    println!("CB handoff benchmark");
    println!("====================");
    println!("Pages       : {pages} × {page_size} B");
    println!("Iterations  : {iterations}");
    println!();

    // protocol checks off
    let config = RuntimeConfig::small()
        .with_debug_checks(false)
        .with_watchdog(Duration::from_secs(60));
    let mut dev = Device::open(config)?;
    let input: Vec<u8> = (0..pages * page_size).map(|i| (i % 251) as u8).collect();

    println!("{:>6}  {:>10}  {:>12}  {:>14}  {:>10}", "depth", "MB/s", "µs/page", "blocked waits", "reserves");
    for depth in DEPTHS {
        let opts = CopyOptions {
            page_size: u32::try_from(page_size)?,
            cb_pages: depth,
            ..CopyOptions::default()
        };
        let mut best = Duration::MAX;
        let mut waits = 0;
        let mut reserves = 0;
        for _ in 0..iterations {
            let run = pipelines::run_copy(&mut dev, &input, &opts)?;
            ensure!(run.output[..] == input[..], "copy corrupted data at depth {depth}");
            if run.report.duration < best {
                best = run.report.duration;
                if let Some(cb) = run.report.cb_stats(opts.core, INPUT_CB) {
                    waits = cb.blocked_waits;
                    reserves = cb.blocked_reserves;
                }
            }
        }
        let secs = best.as_secs_f64();
        let mb_s = (pages * page_size) as f64 / 1_048_576.0 / secs;
        let us_page = secs * 1e6 / pages as f64;
        println!("{depth:>6}  {mb_s:>10.1}  {us_page:>12.2}  {waits:>14}  {reserves:>10}");
    }

    Ok(())
}

fn parse_arg(args: &[String], flag: &str, default: usize) -> usize {
    args.windows(2)
        .find(|w| w[0] == flag)
        .and_then(|w| w[1].parse().ok())
        .unwrap_or(default)
}
