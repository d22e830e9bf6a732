//! Ready-made programs built from the stock kernels
//!
//! - **copy**: one core reads a buffer into a CB and writes it back out,
//!   optionally through the compute engine.
//! - **relay**: a sender core streams a buffer to a receiver core over the
//!   NoC with a credit/semaphore handshake, and the receiver writes it out.
//!
//! The `build` functions only construct the [`Program`], so callers can
//! override runtime arguments before compiling. The `run_*` functions do the
//! whole round trip on a [`Device`].

use bytes::Bytes;
use tensim_chip::{CoreCoord, DataFormat};
use tracing::info;

use crate::buffer::{Buffer, BufferConfig, BufferType};
use crate::cb::CircularBufferConfig;
use crate::device::{Device, LaunchReport};
use crate::error::{Result, RuntimeError};
use crate::kernel::{KernelConfig, KernelHandle, KernelSpec};
use crate::kernels::{COPY_TILES, READER_INTERLEAVED, RELAY_RECEIVER, RELAY_SENDER, WRITER_INTERLEAVED};
use crate::program::{CompileReport, Program};

/// CB the reader fills
pub const INPUT_CB: u8 = 0;
/// CB the compute stage fills
pub const OUTPUT_CB: u8 = 16;

/// Copy pipeline parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CopyOptions {
    /// Core the pipeline runs on
    pub core: CoreCoord,
    /// Bytes per page (buffers and CBs)
    pub page_size: u32,
    /// CB capacity in pages
    pub cb_pages: u32,
    /// Pages per reserve/wait
    pub block: u32,
    /// Route pages through the compute engine
    pub through_compute: bool,
    /// Where the input lives
    pub src_type: BufferType,
    /// Where the output goes
    pub dst_type: BufferType,
    /// Reader kernel source
    pub reader: String,
    /// Writer kernel source
    pub writer: String,
}

impl Default for CopyOptions {
    fn default() -> Self {
        Self {
            core: CoreCoord::new(0, 0),
            page_size: 2048,
            cb_pages: 4,
            block: 1,
            through_compute: false,
            src_type: BufferType::Dram,
            dst_type: BufferType::Dram,
            reader: READER_INTERLEAVED.to_string(),
            writer: WRITER_INTERLEAVED.to_string(),
        }
    }
}

/// A built copy program and its kernel handles
#[derive(Debug)]
pub struct CopyPipeline {
    /// The program
    pub program: Program,
    /// Reader kernel (DM1)
    pub reader: KernelHandle,
    /// Compute kernel, when routed through compute
    pub compute: Option<KernelHandle>,
    /// Writer kernel (DM0)
    pub writer: KernelHandle,
}

fn check_pair(src: &Buffer, dst: &Buffer, page_size: u32) -> Result<u32> {
    if src.page_size() != page_size || dst.page_size() != page_size {
        return Err(RuntimeError::invalid_argument(format!(
            "buffers have pages of {} and {} B, pipeline expects {page_size} B",
            src.page_size(),
            dst.page_size()
        )));
    }
    if src.num_pages() != dst.num_pages() {
        return Err(RuntimeError::invalid_argument(format!(
            "source has {} pages, destination {}",
            src.num_pages(),
            dst.num_pages()
        )));
    }
    Ok(src.num_pages())
}

/// Runtime arguments of an interleaved reader/writer over all of `buffer`
fn walk_args(buffer: &Buffer) -> Result<[u32; 5]> {
    let addr = u32::try_from(buffer.address()).map_err(|_| {
        RuntimeError::invalid_argument(format!(
            "buffer address {:#x} does not fit a runtime argument",
            buffer.address()
        ))
    })?;
    let is_dram = u32::from(buffer.buffer_type() == BufferType::Dram);
    Ok([addr, buffer.num_pages(), 0, is_dram, buffer.num_pages()])
}

fn paged_cb(index: u8, pages: u32, page_size: u32) -> CircularBufferConfig {
    CircularBufferConfig::paged(index, pages, page_size, DataFormat::default())
}

impl CopyPipeline {
    /// Build the copy program for `src` → `dst`
    ///
    /// # Errors
    ///
    /// `InvalidArgument` if the buffers disagree with each other or with
    /// `opts`; program-building errors otherwise.
    pub fn build(src: &Buffer, dst: &Buffer, opts: &CopyOptions) -> Result<Self> {
        let pages = check_pair(src, dst, opts.page_size)?;
        let core = opts.core;
        let block = opts.block;
        let mut program = Program::new();

        program.create_circular_buffer(core, paged_cb(INPUT_CB, opts.cb_pages, opts.page_size))?;
        let out_cb = if opts.through_compute {
            program.create_circular_buffer(core, paged_cb(OUTPUT_CB, opts.cb_pages, opts.page_size))?;
            OUTPUT_CB
        } else {
            INPUT_CB
        };

        let reader = program.create_kernel(
            KernelSpec::new(opts.reader.as_str(), core, KernelConfig::reader())
                .with_compile_args([u32::from(INPUT_CB), block])
                .produces(INPUT_CB, block, Some(pages)),
        )?;
        let compute = if opts.through_compute {
            Some(
                program.create_kernel(
                    KernelSpec::new(COPY_TILES, core, KernelConfig::compute())
                        .with_compile_args([u32::from(INPUT_CB), u32::from(OUTPUT_CB), pages])
                        .consumes(INPUT_CB, 1, Some(pages))
                        .produces(OUTPUT_CB, 1, Some(pages)),
                )?,
            )
        } else {
            None
        };
        let writer = program.create_kernel(
            KernelSpec::new(opts.writer.as_str(), core, KernelConfig::writer())
                .with_compile_args([u32::from(out_cb), block])
                .consumes(out_cb, block, Some(pages)),
        )?;

        program.set_runtime_args(reader, core, &walk_args(src)?)?;
        program.set_runtime_args(writer, core, &walk_args(dst)?)?;

        Ok(Self {
            program,
            reader,
            compute,
            writer,
        })
    }
}

/// Result of a full pipeline run
#[derive(Debug, Clone)]
pub struct PipelineRun {
    /// Bytes read back from the destination buffer
    pub output: Bytes,
    /// Compile outcome
    pub compile: CompileReport,
    /// Launch metrics
    pub report: LaunchReport,
}

fn buffer_config(kind: BufferType, size: u64, page_size: u32) -> BufferConfig {
    match kind {
        BufferType::Dram => BufferConfig::dram_interleaved(size, page_size),
        BufferType::L1 => BufferConfig::l1_interleaved(size, page_size),
    }
}

/// Allocate source and destination, run `build`, read back, free both
fn round_trip(
    dev: &mut Device,
    input: &[u8],
    page_size: u32,
    kinds: (BufferType, BufferType),
    build: impl FnOnce(&Buffer, &Buffer) -> Result<Program>,
) -> Result<PipelineRun> {
    let size = input.len() as u64;
    let src = dev.create_buffer(buffer_config(kinds.0, size, page_size))?;
    let dst = match dev.create_buffer(buffer_config(kinds.1, size, page_size)) {
        Ok(dst) => dst,
        Err(e) => {
            dev.deallocate_buffer(&src)?;
            return Err(e);
        }
    };

    let run = execute(dev, &src, &dst, input, build);
    dev.deallocate_buffer(&src)?;
    dev.deallocate_buffer(&dst)?;
    run
}

fn execute(
    dev: &mut Device,
    src: &Buffer,
    dst: &Buffer,
    input: &[u8],
    build: impl FnOnce(&Buffer, &Buffer) -> Result<Program>,
) -> Result<PipelineRun> {
    dev.write_buffer(src, input)?;
    let mut program = build(src, dst)?;
    let compile = dev.compile_program(&mut program)?;
    let report = dev.launch_program(&mut program)?;
    let output = dev.read_buffer(dst)?;
    Ok(PipelineRun {
        output,
        compile,
        report,
    })
}

/// Copy `input` through a one-core pipeline and read it back
///
/// # Errors
///
/// Any allocation, build, compile, launch or transport error.
pub fn run_copy(dev: &mut Device, input: &[u8], opts: &CopyOptions) -> Result<PipelineRun> {
    let run = round_trip(dev, input, opts.page_size, (opts.src_type, opts.dst_type), |src, dst| {
        Ok(CopyPipeline::build(src, dst, opts)?.program)
    })?;
    info!(
        "✅ Copied {} B in {:?} ({} consumer stalls)",
        run.output.len(),
        run.report.duration,
        run.report
            .cb_stats
            .values()
            .map(|s| s.blocked_waits)
            .sum::<u64>()
    );
    Ok(run)
}

/// Relay pipeline parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayOptions {
    /// Core that reads the input
    pub sender: CoreCoord,
    /// Core that writes the output
    pub receiver: CoreCoord,
    /// Bytes per page
    pub page_size: u32,
    /// CB capacity in pages, on both cores
    pub cb_pages: u32,
    /// Where the input lives
    pub src_type: BufferType,
    /// Where the output goes
    pub dst_type: BufferType,
}

impl Default for RelayOptions {
    fn default() -> Self {
        Self {
            sender: CoreCoord::new(0, 0),
            receiver: CoreCoord::new(1, 0),
            page_size: 2048,
            cb_pages: 4,
            src_type: BufferType::Dram,
            dst_type: BufferType::Dram,
        }
    }
}

/// A built relay program and its kernel handles
#[derive(Debug)]
pub struct RelayPipeline {
    /// The program
    pub program: Program,
    /// Reader on the sender core
    pub reader: KernelHandle,
    /// Relay sender on the sender core
    pub sender: KernelHandle,
    /// Relay receiver on the receiver core
    pub receiver: KernelHandle,
    /// Writer on the receiver core
    pub writer: KernelHandle,
    /// Credit semaphore (sender core)
    pub credit_sem: u32,
    /// Data-ready semaphore (receiver core)
    pub data_sem: u32,
}

impl RelayPipeline {
    /// Build the relay program for `src` → `dst`
    ///
    /// # Errors
    ///
    /// `InvalidArgument` if sender and receiver are the same core or the
    /// buffers disagree; program-building errors otherwise.
    pub fn build(src: &Buffer, dst: &Buffer, opts: &RelayOptions) -> Result<Self> {
        let pages = check_pair(src, dst, opts.page_size)?;
        let (tx, rx) = (opts.sender, opts.receiver);
        if tx == rx {
            return Err(RuntimeError::invalid_argument(
                "relay sender and receiver must be different cores",
            ));
        }
        let mut program = Program::new();

        let cb = program.create_circular_buffer(
            vec![tx, rx],
            paged_cb(INPUT_CB, opts.cb_pages, opts.page_size),
        )?;
        let credit_sem = program.create_semaphore(tx, 0)?;
        let data_sem = program.create_semaphore(rx, 0)?;
        let cb_id = u32::from(INPUT_CB);

        let reader = program.create_kernel(
            KernelSpec::new(READER_INTERLEAVED, tx, KernelConfig::reader())
                .with_compile_args([cb_id, 1])
                .produces(INPUT_CB, 1, Some(pages)),
        )?;
        let sender = program.create_kernel(
            KernelSpec::new(RELAY_SENDER, tx, KernelConfig::writer())
                .with_compile_args([cb_id])
                .consumes(INPUT_CB, 1, Some(pages)),
        )?;
        let receiver = program.create_kernel(
            KernelSpec::new(RELAY_RECEIVER, rx, KernelConfig::reader())
                .with_compile_args([cb_id])
                .produces(INPUT_CB, 1, Some(pages)),
        )?;
        let writer = program.create_kernel(
            KernelSpec::new(WRITER_INTERLEAVED, rx, KernelConfig::writer())
                .with_compile_args([cb_id, 1])
                .consumes(INPUT_CB, 1, Some(pages)),
        )?;

        program.set_runtime_args(reader, tx, &walk_args(src)?)?;
        program.set_runtime_args(
            sender,
            tx,
            &[pages, rx.x, rx.y, cb.address, cb.num_pages(), credit_sem, data_sem],
        )?;
        program.set_runtime_args(receiver, rx, &[pages, tx.x, tx.y, credit_sem, data_sem])?;
        program.set_runtime_args(writer, rx, &walk_args(dst)?)?;

        Ok(Self {
            program,
            reader,
            sender,
            receiver,
            writer,
            credit_sem,
            data_sem,
        })
    }
}

/// Relay `input` from one core to another and read it back
///
/// # Errors
///
/// Any allocation, build, compile, launch or transport error.
pub fn run_relay(dev: &mut Device, input: &[u8], opts: &RelayOptions) -> Result<PipelineRun> {
    let run = round_trip(dev, input, opts.page_size, (opts.src_type, opts.dst_type), |src, dst| {
        Ok(RelayPipeline::build(src, dst, opts)?.program)
    })?;
    info!(
        "✅ Relayed {} B {} -> {} in {:?}",
        run.output.len(),
        opts.sender,
        opts.receiver,
        run.report.duration
    );
    Ok(run)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeConfig;

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 7 % 253) as u8).collect()
    }

    #[test]
    fn copy_pipeline_declares_matching_contracts() {
        let mut dev = Device::open(RuntimeConfig::small()).unwrap();
        let src = dev.create_buffer(BufferConfig::dram_interleaved(8 * 2048, 2048)).unwrap();
        let dst = dev.create_buffer(BufferConfig::dram_interleaved(8 * 2048, 2048)).unwrap();
        let pipe = CopyPipeline::build(&src, &dst, &CopyOptions::default()).unwrap();
        assert!(pipe.program.check_cb_contracts().is_empty());
        assert!(pipe.compute.is_none());
    }

    #[test]
    fn mismatched_buffers_are_rejected() {
        let mut dev = Device::open(RuntimeConfig::small()).unwrap();
        let src = dev.create_buffer(BufferConfig::dram_interleaved(8 * 2048, 2048)).unwrap();
        let dst = dev.create_buffer(BufferConfig::dram_interleaved(4 * 2048, 2048)).unwrap();
        let err = CopyPipeline::build(&src, &dst, &CopyOptions::default()).unwrap_err();
        assert!(matches!(err, RuntimeError::InvalidArgument { .. }));
    }

    #[test]
    fn copy_through_compute_round_trips() {
        let mut dev = Device::open(RuntimeConfig::small()).unwrap();
        let input = pattern(6 * 2048);
        let opts = CopyOptions {
            through_compute: true,
            ..CopyOptions::default()
        };
        let run = run_copy(&mut dev, &input, &opts).unwrap();
        assert_eq!(&run.output[..], &input[..]);
        assert_eq!(run.report.engines.len(), 3);
    }

    #[test]
    fn copy_between_l1_and_dram() {
        let mut dev = Device::open(RuntimeConfig::small()).unwrap();
        let input = pattern(20 * 256);
        let opts = CopyOptions {
            page_size: 256,
            block: 2,
            src_type: BufferType::L1,
            ..CopyOptions::default()
        };
        let run = run_copy(&mut dev, &input, &opts).unwrap();
        assert_eq!(&run.output[..], &input[..]);
    }

    #[test]
    fn relay_moves_data_between_cores() {
        let mut dev = Device::open(RuntimeConfig::small()).unwrap();
        let input = pattern(10 * 512);
        let opts = RelayOptions {
            page_size: 512,
            cb_pages: 2,
            ..RelayOptions::default()
        };
        let run = run_relay(&mut dev, &input, &opts).unwrap();
        assert_eq!(&run.output[..], &input[..]);
        assert_eq!(run.report.noc_totals.semaphore_incs, 20);
    }

    #[test]
    fn relay_needs_two_cores() {
        let mut dev = Device::open(RuntimeConfig::small()).unwrap();
        let src = dev.create_buffer(BufferConfig::dram_interleaved(2048, 2048)).unwrap();
        let dst = dev.create_buffer(BufferConfig::dram_interleaved(2048, 2048)).unwrap();
        let opts = RelayOptions {
            receiver: CoreCoord::new(0, 0),
            ..RelayOptions::default()
        };
        assert!(RelayPipeline::build(&src, &dst, &opts).is_err());
    }
}
