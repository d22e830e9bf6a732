//! NoC transfer tests
//!
//! Kernels here drive the NoC directly instead of going through CBs.

use tensim_runtime::addrgen::{BankSet, InterleavedAddrGen};
use tensim_runtime::chip::memory_map::{semaphore_address, L1_UNRESERVED_BASE};
use tensim_runtime::chip::{CoreCoord, CoreRange, NocAddr};
use tensim_runtime::{
    BufferConfig, Device, KernelConfig, KernelContext, KernelFault, KernelHandle, KernelResult,
    KernelSource, KernelSpec, Program, RuntimeConfig, RuntimeError,
};

const ORIGIN: CoreCoord = CoreCoord::new(0, 0);
const SCRATCH: u64 = L1_UNRESERVED_BASE as u64;

/// DRAM page → local scratch → L1-interleaved page, one page at a time
fn round_trip(ctx: &mut KernelContext) -> KernelResult {
    let src = u64::from(ctx.arg(0)?);
    let dst = u64::from(ctx.arg(1)?);
    let pages = ctx.arg(2)?;
    let page_size = ctx.arg(3)?;
    let topo = *ctx.topology();
    let src_gen = InterleavedAddrGen::new(src, page_size, BankSet::Dram { count: topo.dram_banks });
    let dst_gen = InterleavedAddrGen::new(
        dst,
        page_size,
        BankSet::L1 {
            cores: topo.worker_cores().into(),
        },
    );

    let noc = ctx.noc()?;
    for page in 0..pages {
        noc.async_read_page(&src_gen, page, SCRATCH)?;
        noc.read_barrier()?;
        noc.async_write_page(&dst_gen, page, SCRATCH)?;
        let _fence = noc.write_barrier()?;
    }
    Ok(())
}

fn multicast(ctx: &mut KernelContext) -> KernelResult {
    ctx.l1_write(SCRATCH, &[0x5A; 64])?;
    let targets = CoreRange::new(CoreCoord::new(1, 1), CoreCoord::new(2, 2));
    let sem = ctx.semaphore_addr(0);
    let noc = ctx.noc()?;
    noc.async_write_multicast(SCRATCH, targets, SCRATCH, 64)?;
    let fence = noc.write_barrier()?;
    for core in targets.iter() {
        noc.semaphore_inc(NocAddr::core(core, sem), 1, &fence)?;
    }
    Ok(())
}

/// Takes a fence, then issues another write before signalling
fn unfenced(ctx: &mut KernelContext) -> KernelResult {
    let peer_scratch = ctx.core_addr(1, 0, SCRATCH);
    let peer_sem = ctx.core_addr(1, 0, ctx.semaphore_addr(0));
    let noc = ctx.noc()?;
    let stale = noc.write_barrier()?;
    noc.async_write(SCRATCH, peer_scratch, 16)?;
    noc.semaphore_inc(peer_sem, 1, &stale)
}

fn device(debug_checks: bool) -> Device {
    let mut dev = Device::open(RuntimeConfig::small().with_debug_checks(debug_checks))
        .expect("open device");
    let registry = dev.registry_mut();
    registry.register(KernelSource::new("test/noc_round_trip", round_trip).with_signature(0, 4));
    registry.register(KernelSource::new("test/multicast", multicast).with_signature(0, 0));
    registry.register(KernelSource::new("test/unfenced", unfenced).with_signature(0, 0));
    dev
}

fn single_kernel(source: &str) -> (Program, KernelHandle) {
    let mut program = Program::new();
    let kernel = program
        .create_kernel(KernelSpec::new(source, ORIGIN, KernelConfig::writer()))
        .expect("create kernel");
    (program, kernel)
}

#[test]
fn test_round_trip_page_sizes_and_counts() {
    let mut dev = device(true);
    for page_size in [32u32, 64, 2048] {
        for pages in [1u32, 17, 256] {
            let size = u64::from(page_size) * u64::from(pages);
            let src = dev
                .create_buffer(BufferConfig::dram_interleaved(size, page_size))
                .expect("src");
            let dst = dev
                .create_buffer(BufferConfig::l1_interleaved(size, page_size))
                .expect("dst");
            let input: Vec<u8> = (0..size).map(|i| (i * 13 % 255) as u8).collect();
            dev.write_buffer(&src, &input).expect("write");

            let (mut program, kernel) = single_kernel("test/noc_round_trip");
            program
                .set_runtime_args(
                    kernel,
                    ORIGIN,
                    &[src.address() as u32, dst.address() as u32, pages, page_size],
                )
                .expect("args");
            dev.compile_program(&mut program).expect("compile");
            let report = dev.launch_program(&mut program).expect("launch");

            let output = dev.read_buffer(&dst).expect("read back");
            assert_eq!(&output[..], &input[..], "page {page_size} B x {pages}");
            assert_eq!(report.noc_totals.reads, u64::from(pages));
            assert_eq!(report.noc_totals.bytes_written, size);

            dev.deallocate_buffer(&src).expect("free src");
            dev.deallocate_buffer(&dst).expect("free dst");
        }
    }
}

#[test]
fn test_multicast_reaches_every_target() {
    let mut dev = device(true);
    let (mut program, _) = single_kernel("test/multicast");
    dev.compile_program(&mut program).expect("compile");
    let report = dev.launch_program(&mut program).expect("launch");
    assert_eq!(report.noc_totals.multicasts, 1);
    assert_eq!(report.noc_totals.bytes_written, 4 * 64);
    assert_eq!(report.noc_totals.semaphore_incs, 4);

    let sem = u64::from(semaphore_address(0));
    for core in CoreRange::new(CoreCoord::new(1, 1), CoreCoord::new(2, 2)).iter() {
        let data = dev.read_l1(core, SCRATCH, 64).expect("read target");
        assert!(data.iter().all(|&b| b == 0x5A), "{core}");
        let count = dev.read_l1(core, sem, 4).expect("read semaphore");
        assert_eq!(&count[..], &1u32.to_le_bytes());
    }
    // outside the range nothing landed
    let untouched = dev.read_l1(CoreCoord::new(3, 3), SCRATCH, 64).expect("read");
    assert!(untouched.iter().all(|&b| b == 0));
}

#[test]
fn test_semaphore_inc_with_stale_fence_faults() {
    let mut dev = device(true);
    let (mut program, _) = single_kernel("test/unfenced");
    dev.compile_program(&mut program).expect("compile");
    let err = dev.launch_program(&mut program).unwrap_err();
    match err {
        RuntimeError::KernelFault { fault, core, .. } => {
            assert_eq!(fault, KernelFault::UnfencedSemaphore { outstanding: 1 });
            assert_eq!(core, ORIGIN);
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn test_stale_fence_is_not_checked_without_debug_checks() {
    let mut dev = device(false);
    let (mut program, _) = single_kernel("test/unfenced");
    dev.compile_program(&mut program).expect("compile");
    dev.launch_program(&mut program).expect("launch");
}
