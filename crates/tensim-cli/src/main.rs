//! `tensim` — command-line front end for the simulated Tensix grid.
//!
//! ```text
//! USAGE:
//!   tensim topology                  Grid geometry and L1 memory map
//!   tensim kernels                   Stock kernel sources and signatures
//!   tensim copy [--pages N] ...      Reader → CB → writer on one core
//!   tensim relay [--from X,Y] ...    Core-to-core relay with semaphores
//! ```
//!
//! `TENSIM_WATCHDOG_MS` and `TENSIM_DEBUG_CHECKS` seed the configuration;
//! flags override them.

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use std::time::Duration;
use tensim_chip::memory_map::{
    runtime_args_base, semaphore_address, L1_UNRESERVED_BASE, NUM_CIRCULAR_BUFFERS, NUM_SEMAPHORES,
};
use tensim_chip::{CoreCoord, GridTopology, Processor};
use tensim_runtime::pipelines::{self, CopyOptions, RelayOptions};
use tensim_runtime::{BufferType, Device, LaunchReport, RuntimeConfig};
use tracing::debug;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "tensim", about = "Simulated Tensix grid runtime", version)]
struct Cli {
    #[command(flatten)]
    device: DeviceArgs,
    #[command(subcommand)]
    command: Cmd,
}

#[derive(Args)]
struct DeviceArgs {
    /// Use the 4×4 test grid instead of the 12×10 reference grid.
    #[arg(long, global = true)]
    small: bool,
    /// Launch watchdog in milliseconds.
    #[arg(long, global = true)]
    watchdog_ms: Option<u64>,
    /// Skip CB/NoC protocol checks (faster, mistakes corrupt instead of faulting).
    #[arg(long, global = true)]
    no_debug_checks: bool,
}

#[derive(Subcommand)]
enum Cmd {
    /// Print grid geometry and the per-core L1 memory map.
    Topology,
    /// List the stock kernel sources.
    Kernels,
    /// Stream a buffer through one core and check it comes back intact.
    Copy {
        #[command(flatten)]
        stream: StreamArgs,
        /// Core to run on (x,y).
        #[arg(long, default_value = "0,0", value_parser = parse_core)]
        core: CoreCoord,
        /// Pages per reserve/wait.
        #[arg(long, default_value_t = 1)]
        block: u32,
        /// Route pages through the compute engine.
        #[arg(long)]
        compute: bool,
        /// Read the input from L1 instead of DRAM.
        #[arg(long)]
        l1_input: bool,
    },
    /// Relay a buffer from one core to another over the NoC.
    Relay {
        #[command(flatten)]
        stream: StreamArgs,
        /// Sender core (x,y).
        #[arg(long, default_value = "0,0", value_parser = parse_core)]
        from: CoreCoord,
        /// Receiver core (x,y).
        #[arg(long, default_value = "1,0", value_parser = parse_core)]
        to: CoreCoord,
    },
}

#[derive(Args)]
struct StreamArgs {
    /// Number of pages.
    #[arg(long, default_value_t = 16)]
    pages: u32,
    /// Bytes per page.
    #[arg(long, default_value_t = 2048)]
    page_size: u32,
    /// CB capacity in pages.
    #[arg(long, default_value_t = 4)]
    cb_pages: u32,
}

impl StreamArgs {
    fn input(&self) -> Vec<u8> {
        let len = self.pages as usize * self.page_size as usize;
        (0..len).map(|i| (i % 251) as u8).collect()
    }
}

fn parse_core(s: &str) -> std::result::Result<CoreCoord, String> {
    let (x, y) = s
        .split_once(',')
        .ok_or_else(|| format!("expected x,y but got '{s}'"))?;
    let x = x.trim().parse().map_err(|e| format!("bad x in '{s}': {e}"))?;
    let y = y.trim().parse().map_err(|e| format!("bad y in '{s}': {e}"))?;
    Ok(CoreCoord::new(x, y))
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()),
        )
        .init();

    let cli = Cli::parse();
    let config = runtime_config(&cli.device);
    debug!("Runtime configuration: {config:?}");

    match cli.command {
        Cmd::Topology => cmd_topology(&config.topology),
        Cmd::Kernels => cmd_kernels(config)?,
        Cmd::Copy {
            stream,
            core,
            block,
            compute,
            l1_input,
        } => {
            let opts = CopyOptions {
                core,
                page_size: stream.page_size,
                cb_pages: stream.cb_pages,
                block,
                through_compute: compute,
                src_type: if l1_input { BufferType::L1 } else { BufferType::Dram },
                ..CopyOptions::default()
            };
            cmd_copy(config, &stream, &opts)?;
        }
        Cmd::Relay { stream, from, to } => {
            let opts = RelayOptions {
                sender: from,
                receiver: to,
                page_size: stream.page_size,
                cb_pages: stream.cb_pages,
                ..RelayOptions::default()
            };
            cmd_relay(config, &stream, &opts)?;
        }
    }

    Ok(())
}

fn runtime_config(args: &DeviceArgs) -> RuntimeConfig {
    let mut config = RuntimeConfig::from_env();
    if args.small {
        config = config.with_topology(GridTopology::SMALL);
    }
    if let Some(ms) = args.watchdog_ms {
        config = config.with_watchdog(Duration::from_millis(ms));
    }
    if args.no_debug_checks {
        config = config.with_debug_checks(false);
    }
    config
}

fn cmd_topology(topo: &GridTopology) {
    println!("Grid         : {}×{} ({} worker cores)", topo.grid_x, topo.grid_y, topo.total_cores());
    println!("L1 per core  : {} KiB", topo.l1_bytes / 1024);
    println!(
        "DRAM         : {} banks × {} MiB ({} MiB total)",
        topo.dram_banks,
        topo.dram_bank_bytes >> 20,
        topo.total_dram_bytes() >> 20
    );
    println!();
    println!("L1 map (every core):");
    for p in Processor::ALL {
        println!("  {:#07x}  runtime args ({p})", runtime_args_base(p));
    }
    println!(
        "  {:#07x}  semaphores ({NUM_SEMAPHORES} slots)",
        semaphore_address(0)
    );
    println!(
        "  {L1_UNRESERVED_BASE:#07x}  CBs grow up ({NUM_CIRCULAR_BUFFERS} ids), L1 buffers grow down from {:#x}",
        topo.l1_bytes
    );
}

fn cmd_kernels(config: RuntimeConfig) -> Result<()> {
    let dev = Device::open(config)?;
    for name in dev.registry().names() {
        let sig = dev.registry().get(name).and_then(|k| k.signature());
        match sig {
            Some(s) => println!(
                "{name:<32} {} compile args, {} runtime args",
                s.compile_args, s.runtime_args
            ),
            None => println!("{name:<32} (unchecked)"),
        }
    }
    Ok(())
}

fn cmd_copy(config: RuntimeConfig, stream: &StreamArgs, opts: &CopyOptions) -> Result<()> {
    let mut dev = Device::open(config)?;
    let input = stream.input();
    let run = pipelines::run_copy(&mut dev, &input, opts).context("copy pipeline failed")?;
    if run.output[..] != input[..] {
        bail!("copy returned different bytes");
    }
    println!(
        "Copied {} pages × {} B on core {} through a {}-page CB",
        stream.pages, stream.page_size, opts.core, stream.cb_pages
    );
    print_report(&run.report);
    Ok(())
}

fn cmd_relay(config: RuntimeConfig, stream: &StreamArgs, opts: &RelayOptions) -> Result<()> {
    let mut dev = Device::open(config)?;
    let input = stream.input();
    let run = pipelines::run_relay(&mut dev, &input, opts).context("relay pipeline failed")?;
    if run.output[..] != input[..] {
        bail!("relay returned different bytes");
    }
    println!(
        "Relayed {} pages × {} B from {} to {}",
        stream.pages, stream.page_size, opts.sender, opts.receiver
    );
    print_report(&run.report);
    Ok(())
}

fn print_report(report: &LaunchReport) {
    let noc = report.noc_totals;
    println!("Duration     : {:?}", report.duration);
    println!(
        "NoC          : {} reads ({} B), {} writes ({} B), {} semaphore incs",
        noc.reads, noc.bytes_read, noc.writes, noc.bytes_written, noc.semaphore_incs
    );
    for engine in &report.engines {
        println!(
            "  {:<28} {} {:<8} {:?}",
            engine.name, engine.core, engine.processor, engine.duration
        );
    }
    for ((core, cb), stats) in &report.cb_stats {
        println!(
            "  CB {cb:<2} on {core}: {} pages, {} blocked waits, {} blocked reserves, high water {}",
            stats.pages_pushed, stats.blocked_waits, stats.blocked_reserves, stats.high_water
        );
    }
}
