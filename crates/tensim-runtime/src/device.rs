//! Simulated device: memory, allocation, compile and launch
//!
//! One [`Device`] owns one simulated grid exclusively. Host operations
//! (buffer I/O, runtime arguments, semaphore initialisation) go through its
//! [`HostTransport`]; kernels run on OS threads, one per (kernel, core).
//!
//! A launch blocks until every engine has returned or the watchdog fires.
//! A hang cannot be diagnosed from the outside, so a timeout only reports
//! that the program did not complete and marks the device as needing a
//! [`Device::reset`].

use bytes::Bytes;
use std::collections::{BTreeMap, HashMap};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tensim_chip::memory_map::{
    align_up, runtime_args_base, L1_ALIGNMENT, L1_UNRESERVED_BASE, DRAM_ALIGNMENT,
};
use tensim_chip::{CoreCoord, GridTopology, NocEndpoint, Processor};
use tracing::{debug, info, warn};

use crate::addrgen::BankSet;
use crate::allocator::{AllocDirection, BankAllocator};
use crate::buffer::{shard_pages, Buffer, BufferConfig, BufferId, BufferLayout, BufferType};
use crate::cb::{CbStats, CircularBuffer};
use crate::config::RuntimeConfig;
use crate::error::{KernelFault, KernelResult, Result, RuntimeError};
use crate::kernel::{ContextParts, KernelContext, KernelHandle, KernelRegistry, KernelState};
use crate::memory::DeviceMemory;
use crate::noc::{Noc, NocStats};
use crate::program::{CompileReport, Program, BinaryCache};
use crate::transport::{HostTransport, SimulatedTransport, TransportType};

/// Outcome of one engine in a launch
#[derive(Debug, Clone)]
pub struct EngineReport {
    /// Kernel handle
    pub kernel: KernelHandle,
    /// Kernel source name
    pub name: String,
    /// Core
    pub core: CoreCoord,
    /// Engine
    pub processor: Processor,
    /// Time from thread start to return
    pub duration: Duration,
    /// NoC counters (zero for compute)
    pub noc: NocStats,
}

/// Metrics of a completed launch
#[derive(Debug, Clone)]
pub struct LaunchReport {
    /// Wall time from first spawn to last completion
    pub duration: Duration,
    /// One entry per (kernel, core)
    pub engines: Vec<EngineReport>,
    /// Sum of every engine's NoC counters
    pub noc_totals: NocStats,
    /// Final counters per (core, CB id)
    pub cb_stats: BTreeMap<(CoreCoord, u8), CbStats>,
}

impl LaunchReport {
    /// Counters of CB `cb` on `core`
    pub fn cb_stats(&self, core: CoreCoord, cb: u8) -> Option<&CbStats> {
        self.cb_stats.get(&(core, cb))
    }

    /// Engine report for `kernel` on `core`
    pub fn engine(&self, kernel: KernelHandle, core: CoreCoord) -> Option<&EngineReport> {
        self.engines
            .iter()
            .find(|e| e.kernel == kernel && e.core == core)
    }
}

struct EngineOutcome {
    report: EngineReport,
    result: std::result::Result<(), KernelFault>,
}

/// Decrements the running-engine count when an engine thread exits
struct RunningGuard(Arc<AtomicUsize>);

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

/// A simulated device
#[derive(Debug)]
pub struct Device {
    config: RuntimeConfig,
    memory: Arc<DeviceMemory>,
    transport: Box<dyn HostTransport>,
    registry: KernelRegistry,
    cache: BinaryCache,
    dram: BankAllocator,
    l1: BankAllocator,
    buffers: HashMap<BufferId, Buffer>,
    next_buffer: u32,
    halt: Arc<AtomicBool>,
    running: Arc<AtomicUsize>,
    needs_reset: bool,
}

impl Device {
    /// Open a device with the in-process transport and the stock kernels
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` for a degenerate topology.
    pub fn open(config: RuntimeConfig) -> Result<Self> {
        Self::with_transport(config, |memory| Box::new(SimulatedTransport::new(memory)))
    }

    /// Open a device whose host accesses go through a custom transport
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` for a degenerate topology.
    pub fn with_transport(
        config: RuntimeConfig,
        make_transport: impl FnOnce(Arc<DeviceMemory>) -> Box<dyn HostTransport>,
    ) -> Result<Self> {
        let topo = config.topology;
        if topo.total_cores() == 0 || topo.dram_banks == 0 {
            return Err(RuntimeError::invalid_argument(
                "topology needs at least one core and one DRAM bank",
            ));
        }
        if u64::from(topo.l1_bytes) <= u64::from(L1_UNRESERVED_BASE) {
            return Err(RuntimeError::invalid_argument(format!(
                "L1 of {} bytes leaves nothing above the reserved region",
                topo.l1_bytes
            )));
        }

        let memory = Arc::new(DeviceMemory::new(&topo));
        let transport = make_transport(Arc::clone(&memory));
        info!(
            "Opened simulated device: {}x{} grid, {} KiB L1/core, {} DRAM banks, {} transport",
            topo.grid_x,
            topo.grid_y,
            topo.l1_bytes / 1024,
            topo.dram_banks,
            transport.transport_type()
        );

        Ok(Self {
            dram: BankAllocator::new(
                "DRAM",
                0,
                topo.dram_bank_bytes,
                u64::from(DRAM_ALIGNMENT),
                AllocDirection::BottomUp,
            ),
            l1: BankAllocator::new(
                "L1",
                u64::from(L1_UNRESERVED_BASE),
                u64::from(topo.l1_bytes),
                u64::from(L1_ALIGNMENT),
                AllocDirection::TopDown,
            ),
            config,
            memory,
            transport,
            registry: KernelRegistry::with_stock_kernels(),
            cache: BinaryCache::new(),
            buffers: HashMap::new(),
            next_buffer: 0,
            halt: Arc::new(AtomicBool::new(false)),
            running: Arc::new(AtomicUsize::new(0)),
            needs_reset: false,
        })
    }

    /// Active configuration
    pub const fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Grid geometry
    pub const fn topology(&self) -> &GridTopology {
        &self.config.topology
    }

    /// Get transport type for debugging
    pub fn transport_type(&self) -> TransportType {
        self.transport.transport_type()
    }

    /// Kernel sources available to programs
    pub const fn registry(&self) -> &KernelRegistry {
        &self.registry
    }

    /// Mutable registry; invalidates the binary cache
    ///
    /// Programs compiled before this call keep the old kernel bindings and
    /// are refused at launch until they are compiled again.
    pub fn registry_mut(&mut self) -> &mut KernelRegistry {
        self.cache.clear();
        &mut self.registry
    }

    /// Compiled-kernel cache
    pub const fn binary_cache(&self) -> &BinaryCache {
        &self.cache
    }

    /// True after a launch timed out
    pub const fn needs_reset(&self) -> bool {
        self.needs_reset
    }

    // ── Buffers ──────────────────────────────────────────────────────────────

    /// Allocate a buffer
    ///
    /// # Errors
    ///
    /// `InvalidArgument` for a malformed request or shard cores off the grid;
    /// `OutOfMemory` with requested vs available bytes per bank.
    pub fn create_buffer(&mut self, config: BufferConfig) -> Result<Buffer> {
        config.validate()?;
        let topo = self.config.topology;

        let banks = match (&config.buffer_type, &config.layout) {
            (BufferType::Dram, _) => BankSet::Dram {
                count: topo.dram_banks,
            },
            (BufferType::L1, BufferLayout::Interleaved) => BankSet::L1 {
                cores: topo.worker_cores().into(),
            },
            (BufferType::L1, BufferLayout::Sharded { cores }) => {
                let cores = cores.cores();
                if let Some(core) = cores.iter().find(|c| !topo.contains(**c)) {
                    return Err(RuntimeError::invalid_argument(format!(
                        "shard core {core} is off the grid"
                    )));
                }
                BankSet::L1 {
                    cores: cores.into(),
                }
            }
        };

        let stride = align_up(u64::from(config.page_size), banks.alignment());
        let pages_per_bank = match config.layout {
            BufferLayout::Interleaved => config.num_pages().div_ceil(u64::from(banks.len())),
            BufferLayout::Sharded { .. } => u64::from(shard_pages(config.num_pages(), banks.len())),
        };
        let bytes_per_bank = pages_per_bank * stride;

        let address = match config.buffer_type {
            BufferType::Dram => self.dram.allocate(bytes_per_bank)?,
            BufferType::L1 => self.l1.allocate(bytes_per_bank)?,
        };

        let id = BufferId::new(self.next_buffer);
        self.next_buffer += 1;
        let buffer = Buffer::new(id, config, address, banks);
        debug!(
            "Buffer {}: {} B {} at {:#x} ({} pages of {} B, {} B per bank)",
            id.id(),
            buffer.size(),
            buffer.buffer_type(),
            address,
            buffer.num_pages(),
            buffer.page_size(),
            bytes_per_bank
        );
        self.buffers.insert(id, buffer.clone());
        Ok(buffer)
    }

    /// Free a buffer
    ///
    /// # Errors
    ///
    /// `InvalidArgument` if the buffer is not live on this device.
    pub fn deallocate_buffer(&mut self, buffer: &Buffer) -> Result<()> {
        let live = self.buffers.remove(&buffer.id()).ok_or_else(|| {
            RuntimeError::invalid_argument(format!("buffer {} is not allocated", buffer.id().id()))
        })?;
        match live.buffer_type() {
            BufferType::Dram => self.dram.deallocate(live.address()),
            BufferType::L1 => self.l1.deallocate(live.address()),
        }
    }

    /// Write the whole buffer from host memory
    ///
    /// # Errors
    ///
    /// `InvalidArgument` if `data` is not exactly the buffer size;
    /// `TransportFailed` from the transport, never retried.
    pub fn write_buffer(&self, buffer: &Buffer, data: &[u8]) -> Result<()> {
        if data.len() as u64 != buffer.size() {
            return Err(RuntimeError::invalid_argument(format!(
                "write of {} bytes into a {}-byte buffer",
                data.len(),
                buffer.size()
            )));
        }
        let gen = buffer.address_generator();
        for (page, chunk) in data.chunks(buffer.page_size() as usize).enumerate() {
            let addr = gen.page_addr(page as u32);
            self.transport.write(addr.endpoint, addr.offset, chunk)?;
        }
        debug!("Wrote {} B to buffer {}", data.len(), buffer.id().id());
        Ok(())
    }

    /// Read the whole buffer back
    ///
    /// # Errors
    ///
    /// `TransportFailed` from the transport, never retried.
    pub fn read_buffer(&self, buffer: &Buffer) -> Result<Bytes> {
        let gen = buffer.address_generator();
        let page_size = buffer.page_size() as usize;
        let mut out = Vec::with_capacity(usize::try_from(buffer.size()).unwrap_or(0));
        for page in 0..buffer.num_pages() {
            let addr = gen.page_addr(page);
            out.extend_from_slice(&self.transport.read(addr.endpoint, addr.offset, page_size)?);
        }
        Ok(Bytes::from(out))
    }

    /// Write raw bytes into a core's L1
    ///
    /// # Errors
    ///
    /// `TransportFailed` for an unknown core or an out-of-range address.
    pub fn write_l1(&self, core: CoreCoord, addr: u64, data: &[u8]) -> Result<()> {
        self.transport.write(NocEndpoint::Core(core), addr, data)
    }

    /// Read raw bytes from a core's L1
    ///
    /// # Errors
    ///
    /// `TransportFailed` for an unknown core or an out-of-range address.
    pub fn read_l1(&self, core: CoreCoord, addr: u64, len: usize) -> Result<Bytes> {
        self.transport.read(NocEndpoint::Core(core), addr, len)
    }

    fn l1_floor(&self) -> u64 {
        self.l1
            .lowest_allocated()
            .unwrap_or_else(|| u64::from(self.config.topology.l1_bytes))
    }

    // ── Programs ─────────────────────────────────────────────────────────────

    /// Compile `program` against this device's registry, topology and L1 usage
    ///
    /// # Errors
    ///
    /// See [`Program::compile`].
    pub fn compile_program(&mut self, program: &mut Program) -> Result<CompileReport> {
        let floor = self.l1_floor();
        program.compile(&self.registry, &self.config.topology, floor, &mut self.cache)
    }

    /// Launch a compiled program and wait for it to finish
    ///
    /// # Errors
    ///
    /// - `InvalidState` if the device needs a reset, or the program is not
    ///   compiled or was compiled before the registry last changed
    /// - `OutOfMemory` if L1 buffers allocated since compile collide with CBs
    /// - `ArgumentMismatch` if runtime-arg counts disagree with a signature
    /// - `TransportFailed` while loading arguments
    /// - `KernelFault` for the first engine that faulted
    /// - `Timeout` if the watchdog fired; the device then needs a reset
    pub fn launch_program(&mut self, program: &mut Program) -> Result<LaunchReport> {
        if self.needs_reset {
            return Err(RuntimeError::invalid_state(
                "device needs reset after a launch that did not complete",
            ));
        }
        if !program.is_compiled() {
            return Err(RuntimeError::invalid_state("program is not compiled"));
        }
        if program.cache_generation() != self.cache.generation() {
            return Err(RuntimeError::invalid_state(
                "kernel registry changed since the program was compiled",
            ));
        }
        program.check_l1_layout(self.l1_floor())?;
        self.check_runtime_args(program)?;
        self.load_program(program)?;
        program.set_all_states(KernelState::ArgsLoaded);

        let halt = Arc::new(AtomicBool::new(false));
        self.halt = Arc::clone(&halt);
        let debug_checks = self.config.debug_checks;

        // fresh CBs for every core that has any
        let mut core_cbs: HashMap<CoreCoord, HashMap<u8, Arc<CircularBuffer>>> = HashMap::new();
        for handle in program.circular_buffers() {
            for core in handle.cores.cores() {
                core_cbs.entry(core).or_default().insert(
                    handle.index,
                    Arc::new(CircularBuffer::new(handle, core, Arc::clone(&halt), debug_checks)),
                );
            }
        }
        let all_cbs: Vec<Arc<CircularBuffer>> =
            core_cbs.values().flat_map(|m| m.values().cloned()).collect();
        let core_cbs: HashMap<CoreCoord, Arc<HashMap<u8, Arc<CircularBuffer>>>> =
            core_cbs.into_iter().map(|(core, m)| (core, Arc::new(m))).collect();
        let no_cbs = Arc::new(HashMap::new());

        let (tx, rx) = mpsc::channel::<EngineOutcome>();
        let started = Instant::now();
        let mut spawned = 0usize;

        program.set_all_states(KernelState::Running);
        for kernel in program.kernels() {
            let Some(compiled) = kernel.compiled() else {
                halt.store(true, Ordering::Release);
                return Err(RuntimeError::invalid_state(format!(
                    "kernel '{}' has no compiled binary",
                    kernel.spec().source
                )));
            };
            let name: Arc<str> = Arc::from(compiled.source.name());
            let processor = compiled.config.processor();

            for &core in kernel.cores() {
                let l1 = Arc::clone(self.memory.l1(core).ok_or_else(|| {
                    RuntimeError::invalid_argument(format!("core {core} is off the grid"))
                })?);
                let noc = match compiled.config.noc() {
                    Some(id) => Some(
                        Noc::new(id, core, Arc::clone(&self.memory), Arc::clone(&halt), debug_checks)
                            .map_err(|fault| RuntimeError::KernelFault {
                                kernel: name.to_string(),
                                core,
                                processor,
                                fault,
                            })?,
                    ),
                    None => None,
                };
                let mut ctx = KernelContext::new(ContextParts {
                    kernel: Arc::clone(&name),
                    core,
                    config: compiled.config,
                    topology: self.config.topology,
                    compile_args: Arc::clone(&compiled.compile_args),
                    runtime_arg_count: kernel.runtime_args(core).len(),
                    l1,
                    cbs: core_cbs.get(&core).cloned().unwrap_or_else(|| Arc::clone(&no_cbs)),
                    noc,
                    halt: Arc::clone(&halt),
                });

                let entry = compiled.source.entry();
                let tx = tx.clone();
                let handle = kernel.handle();
                let kernel_name = name.to_string();
                self.running.fetch_add(1, Ordering::AcqRel);
                let guard = RunningGuard(Arc::clone(&self.running));

                let spawn = std::thread::Builder::new()
                    .name(format!("{}-{}-{}", processor.short_name(), core.x, core.y))
                    .spawn(move || {
                        let _guard = guard;
                        let t0 = Instant::now();
                        let result = catch_unwind(AssertUnwindSafe(|| -> KernelResult {
                            (*entry)(&mut ctx)?;
                            ctx.finish()
                        }))
                        .unwrap_or_else(|payload| Err(KernelFault::Panicked(panic_message(&payload))));
                        let report = EngineReport {
                            kernel: handle,
                            name: kernel_name,
                            core,
                            processor,
                            duration: t0.elapsed(),
                            noc: ctx.noc_stats(),
                        };
                        // receiver gone means the host already gave up on this launch
                        let _ = tx.send(EngineOutcome { report, result });
                    });
                if let Err(e) = spawn {
                    halt.store(true, Ordering::Release);
                    return Err(RuntimeError::invalid_state(format!(
                        "failed to spawn engine thread: {e}"
                    )));
                }
                spawned += 1;
            }
        }
        drop(tx);
        debug!("Launched {spawned} engines");

        let deadline = started + self.config.watchdog;
        let mut engines = Vec::with_capacity(spawned);
        let mut first_fault: Option<RuntimeError> = None;
        let mut faulted: Vec<KernelHandle> = Vec::new();

        while engines.len() < spawned {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match rx.recv_timeout(remaining) {
                Ok(outcome) => {
                    if let Err(fault) = outcome.result {
                        faulted.push(outcome.report.kernel);
                        // later Halted faults are fallout of the first one
                        let replace = match &first_fault {
                            None => true,
                            Some(RuntimeError::KernelFault { fault: prev, .. }) => {
                                *prev == KernelFault::Halted && fault != KernelFault::Halted
                            }
                            Some(_) => false,
                        };
                        if replace {
                            warn!(
                                "Kernel '{}' faulted on core {} ({}): {fault}",
                                outcome.report.name, outcome.report.core, outcome.report.processor
                            );
                            first_fault = Some(RuntimeError::KernelFault {
                                kernel: outcome.report.name.clone(),
                                core: outcome.report.core,
                                processor: outcome.report.processor,
                                fault,
                            });
                        }
                        halt.store(true, Ordering::Release);
                    }
                    engines.push(outcome.report);
                }
                Err(mpsc::RecvTimeoutError::Timeout) => {
                    halt.store(true, Ordering::Release);
                    self.needs_reset = true;
                    program.set_all_states(KernelState::Faulted);
                    let duration_ms = u64::try_from(self.config.watchdog.as_millis()).unwrap_or(u64::MAX);
                    warn!(
                        "Program did not complete within {duration_ms}ms ({} of {spawned} engines returned); device needs reset",
                        engines.len()
                    );
                    return Err(first_fault.unwrap_or(RuntimeError::Timeout { duration_ms }));
                }
                Err(mpsc::RecvTimeoutError::Disconnected) => {
                    halt.store(true, Ordering::Release);
                    return Err(RuntimeError::invalid_state(
                        "engine threads exited without reporting",
                    ));
                }
            }
        }

        program.set_all_states(KernelState::Completed);
        for handle in faulted {
            program.set_state(handle, KernelState::Faulted);
        }
        if let Some(err) = first_fault {
            return Err(err);
        }

        let mut noc_totals = NocStats::default();
        for engine in &engines {
            noc_totals.merge(&engine.noc);
        }
        let cb_stats = all_cbs
            .iter()
            .map(|cb| ((cb.core(), cb.index()), cb.stats()))
            .collect();
        let report = LaunchReport {
            duration: started.elapsed(),
            engines,
            noc_totals,
            cb_stats,
        };
        info!(
            "✅ Program complete: {spawned} engines in {:?}, {} B over NoC",
            report.duration,
            noc_totals.bytes_read + noc_totals.bytes_written
        );
        Ok(report)
    }

    fn check_runtime_args(&self, program: &Program) -> Result<()> {
        for kernel in program.kernels() {
            let Some(sig) = kernel.compiled().and_then(|c| c.source.signature()) else {
                continue;
            };
            for &core in kernel.cores() {
                let actual = kernel.runtime_args(core).len();
                if actual != sig.runtime_args {
                    return Err(RuntimeError::ArgumentMismatch {
                        kernel: kernel.spec().source.clone(),
                        core,
                        expected: sig.runtime_args,
                        actual,
                    });
                }
            }
        }
        Ok(())
    }

    fn load_program(&self, program: &Program) -> Result<()> {
        for kernel in program.kernels() {
            let base = u64::from(runtime_args_base(kernel.spec().config.processor()));
            for &core in kernel.cores() {
                let args = kernel.runtime_args(core);
                if args.is_empty() {
                    continue;
                }
                let bytes: Vec<u8> = args.iter().flat_map(|a| a.to_le_bytes()).collect();
                self.transport.write(NocEndpoint::Core(core), base, &bytes)?;
            }
        }
        for sem in program.semaphores() {
            for core in sem.cores.cores() {
                self.transport.write(
                    NocEndpoint::Core(core),
                    u64::from(sem.address()),
                    &sem.initial.to_le_bytes(),
                )?;
            }
        }
        Ok(())
    }

    /// Halt every engine, wait for them to exit, and clear L1
    ///
    /// L1 buffer contents are lost; DRAM survives. Engines that do not exit
    /// within the watchdog period are abandoned with a warning.
    pub fn reset(&mut self) {
        self.halt.store(true, Ordering::Release);
        let deadline = Instant::now() + self.config.watchdog;
        while self.running.load(Ordering::Acquire) > 0 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(1));
        }
        let stuck = self.running.load(Ordering::Acquire);
        if stuck > 0 {
            warn!("Reset abandoned {stuck} engines that did not observe the halt");
        }
        self.memory.clear_l1();
        self.needs_reset = false;
        info!("Device reset");
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        self.halt.store(true, Ordering::Release);
        info!(
            "Closing simulated device ({} live buffers)",
            self.buffers.len()
        );
    }
}

fn panic_message(payload: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
