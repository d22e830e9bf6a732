//! End-to-end pipeline tests
//!
//! A reader streams DRAM pages into a CB and a writer drains it back to
//! DRAM. Mismatched page totals must hang (caught by the watchdog) or
//! overrun the destination, never fail cleanly.

use std::thread;
use std::time::Duration;

use tensim_runtime::chip::CoreCoord;
use tensim_runtime::kernels::{self, READER_INTERLEAVED, WRITER_INTERLEAVED};
use tensim_runtime::pipelines::{self, CopyOptions, INPUT_CB};
use tensim_runtime::{
    Buffer, BufferConfig, CircularBufferConfig, ContractIssue, Device, KernelConfig, KernelFault,
    KernelHandle, KernelSource, KernelSpec, KernelState, Program, RuntimeConfig, RuntimeError,
};

const PAGE: u32 = 2048;
const CORE: CoreCoord = CoreCoord::new(0, 0);

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

fn dram(dev: &mut Device, pages: u32) -> Buffer {
    dev.create_buffer(BufferConfig::dram_interleaved(u64::from(pages) * u64::from(PAGE), PAGE))
        .expect("DRAM buffer")
}

/// Reader/writer program over one 4-page CB with explicit page counts
fn loopback(
    src: &Buffer,
    read_pages: u32,
    dst: &Buffer,
    write_pages: u32,
) -> (Program, [KernelHandle; 2]) {
    let mut program = Program::new();
    program
        .create_circular_buffer(CORE, CircularBufferConfig::paged(INPUT_CB, 4, PAGE, Default::default()))
        .expect("CB");
    let reader = program
        .create_kernel(
            KernelSpec::new(READER_INTERLEAVED, CORE, KernelConfig::reader())
                .with_compile_args([0, 1])
                .produces(INPUT_CB, 1, Some(read_pages)),
        )
        .expect("reader");
    let writer = program
        .create_kernel(
            KernelSpec::new(WRITER_INTERLEAVED, CORE, KernelConfig::writer())
                .with_compile_args([0, 1])
                .consumes(INPUT_CB, 1, Some(write_pages)),
        )
        .expect("writer");
    program
        .set_runtime_args(reader, CORE, &[src.address() as u32, read_pages, 0, 1, src.num_pages()])
        .expect("reader args");
    program
        .set_runtime_args(writer, CORE, &[dst.address() as u32, write_pages, 0, 1, dst.num_pages()])
        .expect("writer args");
    (program, [reader, writer])
}

#[test]
fn test_sixteen_pages_through_four_page_cb() {
    let mut dev = Device::open(RuntimeConfig::small()).expect("open device");
    // hold the first push back so the writer is already parked in wait_front
    dev.registry_mut().register(
        KernelSource::new("test/late_reader", |ctx| {
            thread::sleep(Duration::from_millis(50));
            kernels::dataflow::reader_interleaved(ctx)
        })
        .with_signature(2, 5),
    );

    let input = pattern(16 * PAGE as usize);
    let opts = CopyOptions {
        reader: "test/late_reader".into(),
        ..CopyOptions::default()
    };
    let run = pipelines::run_copy(&mut dev, &input, &opts).expect("copy pipeline");
    assert_eq!(&run.output[..], &input[..]);

    let cb = run.report.cb_stats(CORE, INPUT_CB).expect("CB 0 stats");
    assert_eq!(cb.pages_pushed, 16);
    assert_eq!(cb.pages_popped, 16);
    assert!(cb.blocked_waits >= 1, "writer never blocked: {cb:?}");
    assert!(cb.high_water <= 4);

    let noc = run.report.noc_totals;
    assert_eq!(noc.bytes_read, 16 * u64::from(PAGE));
    assert_eq!(noc.bytes_written, 16 * u64::from(PAGE));
    assert_eq!(run.report.engines.len(), 2);
}

#[test]
fn test_second_compile_hits_the_binary_cache() {
    let mut dev = Device::open(RuntimeConfig::small()).expect("open device");
    let input = pattern(4 * PAGE as usize);
    let first = pipelines::run_copy(&mut dev, &input, &CopyOptions::default()).expect("first run");
    let second = pipelines::run_copy(&mut dev, &input, &CopyOptions::default()).expect("second run");
    assert_eq!(first.compile.cache_misses, 2);
    assert_eq!(second.compile.cache_hits, 2);
    assert_eq!(&second.output[..], &input[..]);
}

#[test]
fn test_consumer_expecting_more_pages_hangs_until_watchdog() {
    let config = RuntimeConfig::small().with_watchdog(Duration::from_millis(300));
    let mut dev = Device::open(config).expect("open device");
    let src = dram(&mut dev, 16);
    let dst = dram(&mut dev, 20);
    dev.write_buffer(&src, &pattern(16 * PAGE as usize)).expect("write input");

    let (mut program, [reader, writer]) = loopback(&src, 16, &dst, 20);
    assert_eq!(
        program.check_cb_contracts(),
        vec![ContractIssue::TotalMismatch {
            core: CORE,
            cb: INPUT_CB,
            produced: 16,
            consumed: 20,
        }]
    );

    dev.compile_program(&mut program).expect("compile");
    let err = dev.launch_program(&mut program).unwrap_err();
    assert!(matches!(err, RuntimeError::Timeout { duration_ms: 300 }), "{err}");
    assert!(dev.needs_reset());
    assert_eq!(program.kernel_state(reader), Some(KernelState::Faulted));
    assert_eq!(program.kernel_state(writer), Some(KernelState::Faulted));

    let err = dev.launch_program(&mut program).unwrap_err();
    assert!(matches!(err, RuntimeError::InvalidState { .. }));

    dev.reset();
    assert!(!dev.needs_reset());
    let input = pattern(2 * PAGE as usize);
    let run = pipelines::run_copy(&mut dev, &input, &CopyOptions::default()).expect("after reset");
    assert_eq!(&run.output[..], &input[..]);
}

#[test]
fn test_producer_sending_extra_pages_overruns_destination() {
    let config = RuntimeConfig::small().with_debug_checks(false);
    let mut dev = Device::open(config).expect("open device");
    let src = dram(&mut dev, 20);
    let dst = dram(&mut dev, 16);
    let canary = dram(&mut dev, 8);
    let input = pattern(20 * PAGE as usize);
    dev.write_buffer(&src, &input).expect("write input");
    dev.write_buffer(&canary, &vec![0xAA; 8 * PAGE as usize]).expect("write canary");

    // 16 pages over 8 banks fill two slots per bank; pages 16..20 land
    // where the canary's first four pages live
    assert_eq!(canary.address(), dst.address() + 2 * u64::from(PAGE));

    let (mut program, _) = loopback(&src, 20, &dst, 20);
    dev.compile_program(&mut program).expect("compile");
    dev.launch_program(&mut program).expect("overrun is not detected");

    let out = dev.read_buffer(&dst).expect("read dst");
    assert_eq!(&out[..], &input[..16 * PAGE as usize]);
    let canary_now = dev.read_buffer(&canary).expect("read canary");
    let page = PAGE as usize;
    assert_eq!(&canary_now[..4 * page], &input[16 * page..]);
    assert!(canary_now[4 * page..].iter().all(|&b| b == 0xAA));
}

#[test]
fn test_extra_pages_fault_at_buffer_end_with_debug_checks() {
    let config = RuntimeConfig::small().with_debug_checks(true);
    let mut dev = Device::open(config).expect("open device");
    let src = dram(&mut dev, 20);
    let dst = dram(&mut dev, 16);
    let canary = dram(&mut dev, 8);
    dev.write_buffer(&src, &pattern(20 * PAGE as usize)).expect("write input");
    dev.write_buffer(&canary, &vec![0xAA; 8 * PAGE as usize]).expect("write canary");

    let (mut program, [_, writer]) = loopback(&src, 20, &dst, 20);
    dev.compile_program(&mut program).expect("compile");
    match dev.launch_program(&mut program) {
        Err(RuntimeError::KernelFault { kernel, fault, .. }) => {
            assert_eq!(kernel, WRITER_INTERLEAVED);
            assert_eq!(fault, KernelFault::PageOutOfRange { page: 16, num_pages: 16 });
        }
        other => panic!("expected PageOutOfRange, got {other:?}"),
    }
    assert_eq!(program.kernel_state(writer), Some(KernelState::Faulted));
    assert!(!dev.needs_reset());

    let canary_now = dev.read_buffer(&canary).expect("read canary");
    assert!(canary_now.iter().all(|&b| b == 0xAA));
}

#[test]
fn test_oversized_block_is_rejected_at_compile() {
    let mut dev = Device::open(RuntimeConfig::small()).expect("open device");
    let src = dram(&mut dev, 8);
    let dst = dram(&mut dev, 8);
    let opts = CopyOptions {
        block: 8,
        ..CopyOptions::default()
    };
    let mut pipe = pipelines::CopyPipeline::build(&src, &dst, &opts).expect("build");
    let err = dev.compile_program(&mut pipe.program).unwrap_err();
    assert!(
        matches!(err, RuntimeError::CbRequestExceedsCapacity { requested: 8, capacity: 4, .. }),
        "{err}"
    );
}
