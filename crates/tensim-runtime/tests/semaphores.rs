//! Cross-core handshake tests
//!
//! The relay pipeline moves every page with a credit from the receiver and
//! a data-ready increment from the sender. Chunk counts of 1, 2 and 100
//! cover the empty-ring, wrap and long-run cases.

use tensim_runtime::chip::memory_map::L1_UNRESERVED_BASE;
use tensim_runtime::chip::CoreCoord;
use tensim_runtime::pipelines::{self, RelayOptions};
use tensim_runtime::{
    BufferType, Device, KernelConfig, KernelContext, KernelResult, KernelSource, KernelSpec, Program,
    RuntimeConfig,
};

fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect()
}

#[test]
fn test_relay_handshake_chunk_counts() {
    let mut dev = Device::open(RuntimeConfig::small()).expect("open device");
    for (chunks, seed) in [(1usize, 1u8), (2, 2), (100, 3)] {
        let opts = RelayOptions {
            page_size: 64,
            cb_pages: 2,
            ..RelayOptions::default()
        };
        let input = pattern(chunks * 64, seed);
        let run = pipelines::run_relay(&mut dev, &input, &opts).expect("relay");
        assert_eq!(&run.output[..], &input[..], "{chunks} chunks");
        // one credit and one data-ready signal per chunk
        assert_eq!(run.report.noc_totals.semaphore_incs, 2 * chunks as u64);
    }
}

#[test]
fn test_relay_across_the_grid_with_l1_output() {
    let mut dev = Device::open(RuntimeConfig::small()).expect("open device");
    let opts = RelayOptions {
        sender: CoreCoord::new(0, 3),
        receiver: CoreCoord::new(3, 0),
        page_size: 256,
        cb_pages: 4,
        dst_type: BufferType::L1,
        ..RelayOptions::default()
    };
    let input = pattern(33 * 256, 9);
    let run = pipelines::run_relay(&mut dev, &input, &opts).expect("relay");
    assert_eq!(&run.output[..], &input[..]);
    assert_eq!(run.report.engines.len(), 4);
}

/// Waits for semaphore 0 to reach exactly 3, then stores 0 back
fn wait_exact(ctx: &mut KernelContext) -> KernelResult {
    let sem = ctx.semaphore_addr(0);
    let noc = ctx.noc()?;
    noc.semaphore_wait(sem, 3)?;
    noc.semaphore_set(sem, 0)
}

/// Bumps semaphore 0 on core (1, 0) three times
fn bump_three(ctx: &mut KernelContext) -> KernelResult {
    let target = ctx.core_addr(1, 0, ctx.semaphore_addr(0));
    let noc = ctx.noc()?;
    for _ in 0..3 {
        let fence = noc.write_barrier()?;
        noc.semaphore_inc(target, 1, &fence)?;
    }
    Ok(())
}

#[test]
fn test_semaphore_wait_sees_remote_increments() {
    let mut dev = Device::open(RuntimeConfig::small()).expect("open device");
    let registry = dev.registry_mut();
    registry.register(KernelSource::new("test/wait_exact", wait_exact));
    registry.register(KernelSource::new("test/bump_three", bump_three));

    let waiter = CoreCoord::new(1, 0);
    let mut program = Program::new();
    let sem = program.create_semaphore(waiter, 0).expect("semaphore");
    assert_eq!(sem, 0);
    program
        .create_kernel(KernelSpec::new("test/wait_exact", waiter, KernelConfig::reader()))
        .expect("waiter");
    program
        .create_kernel(KernelSpec::new("test/bump_three", CoreCoord::new(0, 0), KernelConfig::writer()))
        .expect("bumper");
    dev.compile_program(&mut program).expect("compile");
    let report = dev.launch_program(&mut program).expect("launch");
    assert_eq!(report.noc_totals.semaphore_incs, 3);

    let sem_addr = u64::from(program.semaphores()[0].address());
    let value = dev.read_l1(waiter, sem_addr, 4).expect("read semaphore");
    assert_eq!(&value[..], &0u32.to_le_bytes());
}

/// Issues one data increment per credit granted by the receiver
///
/// Runtime args: `num_chunks, rx_x, rx_y, credit_sem, data_sem`.
fn paced_sender(ctx: &mut KernelContext) -> KernelResult {
    let chunks = ctx.arg(0)?;
    let credit = ctx.semaphore_addr(ctx.arg(3)?);
    let data = ctx.core_addr(ctx.arg(1)?, ctx.arg(2)?, ctx.semaphore_addr(ctx.arg(4)?));
    let noc = ctx.noc()?;
    for i in 0..chunks {
        noc.semaphore_wait_min(credit, i + 1)?;
        let fence = noc.write_barrier()?;
        noc.semaphore_inc(data, 1, &fence)?;
    }
    Ok(())
}

/// Grants a credit, waits for the matching increment, and stores the value
/// it saw at `L1_UNRESERVED_BASE + 4 * chunk`
///
/// Runtime args: `num_chunks, tx_x, tx_y, credit_sem, data_sem`.
fn recording_receiver(ctx: &mut KernelContext) -> KernelResult {
    let chunks = ctx.arg(0)?;
    let credit = ctx.core_addr(ctx.arg(1)?, ctx.arg(2)?, ctx.semaphore_addr(ctx.arg(3)?));
    let data = ctx.semaphore_addr(ctx.arg(4)?);
    for i in 0..chunks {
        let seen = {
            let noc = ctx.noc()?;
            let fence = noc.write_barrier()?;
            noc.semaphore_inc(credit, 1, &fence)?;
            noc.semaphore_wait_min(data, i + 1)?
        };
        ctx.l1_write(u64::from(L1_UNRESERVED_BASE) + 4 * u64::from(i), &seen.to_le_bytes())?;
    }
    Ok(())
}

#[test]
fn test_receiver_never_sees_more_increments_than_issued() {
    let mut dev = Device::open(RuntimeConfig::small()).expect("open device");
    let registry = dev.registry_mut();
    registry.register(KernelSource::new("test/paced_sender", paced_sender).with_signature(0, 5));
    registry.register(
        KernelSource::new("test/recording_receiver", recording_receiver).with_signature(0, 5),
    );

    let tx = CoreCoord::new(0, 0);
    let rx = CoreCoord::new(2, 1);
    for chunks in [1u32, 2, 100] {
        let mut program = Program::new();
        let credit = program.create_semaphore(tx, 0).expect("credit semaphore");
        let data = program.create_semaphore(rx, 0).expect("data semaphore");
        let sender = program
            .create_kernel(KernelSpec::new("test/paced_sender", tx, KernelConfig::writer()))
            .expect("sender");
        let receiver = program
            .create_kernel(KernelSpec::new("test/recording_receiver", rx, KernelConfig::reader()))
            .expect("receiver");
        program
            .set_runtime_args(sender, tx, &[chunks, rx.x, rx.y, credit, data])
            .expect("sender args");
        program
            .set_runtime_args(receiver, rx, &[chunks, tx.x, tx.y, credit, data])
            .expect("receiver args");
        dev.compile_program(&mut program).expect("compile");
        let report = dev.launch_program(&mut program).expect("launch");
        assert_eq!(report.noc_totals.semaphore_incs, 2 * u64::from(chunks));

        // credit i + 1 is granted only after chunk i was seen, so at most
        // i + 1 increments exist when the receiver looks for the (i + 1)th
        let seen = dev
            .read_l1(rx, u64::from(L1_UNRESERVED_BASE), 4 * chunks as usize)
            .expect("read record");
        for (i, word) in seen.chunks_exact(4).enumerate() {
            let value = u32::from_le_bytes([word[0], word[1], word[2], word[3]]);
            assert_eq!(value, i as u32 + 1, "{chunks} chunks: chunk {i} saw {value}");
        }

        let sem_addr = u64::from(program.semaphores()[1].address());
        let total = dev.read_l1(rx, sem_addr, 4).expect("read data semaphore");
        assert_eq!(&total[..], &chunks.to_le_bytes());
    }
}
