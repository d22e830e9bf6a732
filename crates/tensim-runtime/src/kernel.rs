//! Kernels: sources, per-engine configuration, and the device-side context
//!
//! A kernel source is a named entry function. The host binds it to a core
//! set and an engine with a [`KernelSpec`]; compilation resolves the name in
//! a [`KernelRegistry`] and freezes the compile-time arguments. At launch
//! each (kernel, core) pair runs on its own thread with a [`KernelContext`]
//! holding everything the engine can touch: its runtime-argument slots, its
//! core's CBs and L1, its NoC interface, and (compute only) the destination
//! registers.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tensim_chip::memory_map::{runtime_args_base, semaphore_address, DEST_TILE_SLOTS};
use tensim_chip::{CoreCoord, CoreRangeSet, GridTopology, NocAddr, NocId, Processor};

use crate::cb::CircularBuffer;
use crate::error::{KernelFault, KernelResult};
use crate::memory::MemoryRegion;
use crate::noc::{Noc, NocStats};

/// Entry point of a kernel
pub type KernelEntry = Arc<dyn Fn(&mut KernelContext) -> KernelResult + Send + Sync>;

/// Declared argument counts of a kernel source
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelSignature {
    /// Compile-time argument count
    pub compile_args: usize,
    /// Runtime argument count per core
    pub runtime_args: usize,
}

/// A named kernel entry function
#[derive(Clone)]
pub struct KernelSource {
    name: String,
    entry: KernelEntry,
    signature: Option<KernelSignature>,
}

impl KernelSource {
    /// Wrap an entry function
    pub fn new(
        name: impl Into<String>,
        entry: impl Fn(&mut KernelContext) -> KernelResult + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            entry: Arc::new(entry),
            signature: None,
        }
    }

    /// Declare argument counts so the host can check them
    #[must_use]
    pub fn with_signature(mut self, compile_args: usize, runtime_args: usize) -> Self {
        self.signature = Some(KernelSignature {
            compile_args,
            runtime_args,
        });
        self
    }

    /// Source identifier
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Declared signature, if any
    pub const fn signature(&self) -> Option<KernelSignature> {
        self.signature
    }

    pub(crate) fn entry(&self) -> KernelEntry {
        Arc::clone(&self.entry)
    }
}

impl fmt::Debug for KernelSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KernelSource")
            .field("name", &self.name)
            .field("signature", &self.signature)
            .finish_non_exhaustive()
    }
}

/// Source identifier → kernel
///
/// Stands in for the device toolchain: "compiling" a kernel means resolving
/// its source here.
#[derive(Debug, Default, Clone)]
pub struct KernelRegistry {
    sources: HashMap<String, KernelSource>,
}

impl KernelRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry preloaded with the stock dataflow and compute kernels
    pub fn with_stock_kernels() -> Self {
        let mut registry = Self::new();
        crate::kernels::register_stock(&mut registry);
        registry
    }

    /// Add or replace a source
    pub fn register(&mut self, source: KernelSource) {
        self.sources.insert(source.name.clone(), source);
    }

    /// Look up a source
    pub fn get(&self, name: &str) -> Option<&KernelSource> {
        self.sources.get(name)
    }

    /// Registered source names, sorted
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<_> = self.sources.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

/// Compute engine options
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ComputeConfig {
    /// Accumulate in fp32; halves the destination tile slots
    pub fp32_dest_acc_en: bool,
}

impl ComputeConfig {
    /// Destination tile slots available under this configuration
    pub const fn dst_slots(&self) -> usize {
        if self.fp32_dest_acc_en {
            DEST_TILE_SLOTS / 2
        } else {
            DEST_TILE_SLOTS
        }
    }
}

/// Which engine a kernel runs on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KernelConfig {
    /// A data-movement engine issuing on `noc`
    DataMovement {
        /// DM0 or DM1
        processor: Processor,
        /// NoC used for transfers
        noc: NocId,
    },
    /// The compute engine
    Compute(ComputeConfig),
}

impl KernelConfig {
    /// Reader convention: DM1 on NOC1
    pub const fn reader() -> Self {
        Self::DataMovement {
            processor: Processor::DataMovement1,
            noc: NocId::Noc1,
        }
    }

    /// Writer convention: DM0 on NOC0
    pub const fn writer() -> Self {
        Self::DataMovement {
            processor: Processor::DataMovement0,
            noc: NocId::Noc0,
        }
    }

    /// Compute engine with default options
    pub const fn compute() -> Self {
        Self::Compute(ComputeConfig {
            fp32_dest_acc_en: false,
        })
    }

    /// Engine this configuration occupies
    pub const fn processor(&self) -> Processor {
        match self {
            Self::DataMovement { processor, .. } => *processor,
            Self::Compute(_) => Processor::Compute,
        }
    }

    /// NoC this configuration occupies
    pub const fn noc(&self) -> Option<NocId> {
        match self {
            Self::DataMovement { noc, .. } => Some(*noc),
            Self::Compute(_) => None,
        }
    }
}

/// Handle to a kernel inside one program
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct KernelHandle(u32);

impl KernelHandle {
    /// Create new kernel handle
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    /// Get kernel id
    pub const fn id(&self) -> u32 {
        self.0
    }
}

/// Lifecycle of a kernel as the host tracks it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KernelState {
    /// Declared, not compiled
    Uninitialized,
    /// Resolved and cached
    Compiled,
    /// Runtime arguments written to L1
    ArgsLoaded,
    /// Threads launched
    Running,
    /// Every core returned Ok
    Completed,
    /// At least one core faulted, or the launch was halted
    Faulted,
}

impl fmt::Display for KernelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Uninitialized => "uninitialized",
            Self::Compiled => "compiled",
            Self::ArgsLoaded => "args loaded",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Faulted => "faulted",
        };
        f.write_str(s)
    }
}

/// Side of a CB a kernel sits on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CbEndpoint {
    /// reserve_back / push_back
    Producer,
    /// wait_front / pop_front
    Consumer,
}

/// Declared CB usage of a kernel, checked before launch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CbUsage {
    /// CB id
    pub cb: u8,
    /// Which side
    pub endpoint: CbEndpoint,
    /// Pages per reserve/wait call
    pub block_pages: u32,
    /// Pages moved over the whole run, per core, if known
    pub total_pages: Option<u32>,
}

/// Kernel creation request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelSpec {
    /// Source identifier
    pub source: String,
    /// Cores to run on
    pub cores: CoreRangeSet,
    /// Engine
    pub config: KernelConfig,
    /// Compile-time arguments
    pub compile_args: Vec<u32>,
    /// CB usage declarations
    pub cb_usage: Vec<CbUsage>,
}

impl KernelSpec {
    /// Kernel from `source` on `cores`
    pub fn new(source: impl Into<String>, cores: impl Into<CoreRangeSet>, config: KernelConfig) -> Self {
        Self {
            source: source.into(),
            cores: cores.into(),
            config,
            compile_args: Vec::new(),
            cb_usage: Vec::new(),
        }
    }

    /// Set the compile-time arguments
    #[must_use]
    pub fn with_compile_args(mut self, args: impl Into<Vec<u32>>) -> Self {
        self.compile_args = args.into();
        self
    }

    /// Declare that this kernel produces into `cb` in blocks of `block_pages`
    #[must_use]
    pub fn produces(mut self, cb: u8, block_pages: u32, total_pages: Option<u32>) -> Self {
        self.cb_usage.push(CbUsage {
            cb,
            endpoint: CbEndpoint::Producer,
            block_pages,
            total_pages,
        });
        self
    }

    /// Declare that this kernel consumes from `cb` in blocks of `block_pages`
    #[must_use]
    pub fn consumes(mut self, cb: u8, block_pages: u32, total_pages: Option<u32>) -> Self {
        self.cb_usage.push(CbUsage {
            cb,
            endpoint: CbEndpoint::Consumer,
            block_pages,
            total_pages,
        });
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DstPhase {
    Released,
    Acquired,
}

/// Compute-engine destination registers
#[derive(Debug)]
struct DstRegisters {
    phase: DstPhase,
    slots: Vec<Option<Vec<u8>>>,
}

impl DstRegisters {
    fn new(slots: usize) -> Self {
        Self {
            phase: DstPhase::Released,
            slots: vec![None; slots],
        }
    }

    fn require_acquired(&self, op: &str) -> KernelResult {
        if self.phase == DstPhase::Acquired {
            Ok(())
        } else {
            Err(KernelFault::dst(format!("{op} outside acquire/release")))
        }
    }

    fn slot_index(&self, index: usize) -> KernelResult<usize> {
        if index < self.slots.len() {
            Ok(index)
        } else {
            Err(KernelFault::dst(format!(
                "slot {index} out of range ({} available)",
                self.slots.len()
            )))
        }
    }
}

/// Everything one engine on one core can reach while its kernel runs
#[derive(Debug)]
pub struct KernelContext {
    kernel: Arc<str>,
    core: CoreCoord,
    processor: Processor,
    topology: GridTopology,
    compile_args: Arc<[u32]>,
    runtime_arg_count: usize,
    l1: Arc<MemoryRegion>,
    cbs: Arc<HashMap<u8, Arc<CircularBuffer>>>,
    noc: Option<Noc>,
    dst: Option<DstRegisters>,
    halt: Arc<AtomicBool>,
}

/// Parts a [`KernelContext`] is assembled from
#[derive(Debug)]
pub(crate) struct ContextParts {
    pub kernel: Arc<str>,
    pub core: CoreCoord,
    pub config: KernelConfig,
    pub topology: GridTopology,
    pub compile_args: Arc<[u32]>,
    pub runtime_arg_count: usize,
    pub l1: Arc<MemoryRegion>,
    pub cbs: Arc<HashMap<u8, Arc<CircularBuffer>>>,
    pub noc: Option<Noc>,
    pub halt: Arc<AtomicBool>,
}

impl KernelContext {
    pub(crate) fn new(parts: ContextParts) -> Self {
        let dst = match parts.config {
            KernelConfig::Compute(cfg) => Some(DstRegisters::new(cfg.dst_slots())),
            KernelConfig::DataMovement { .. } => None,
        };
        Self {
            kernel: parts.kernel,
            core: parts.core,
            processor: parts.config.processor(),
            topology: parts.topology,
            compile_args: parts.compile_args,
            runtime_arg_count: parts.runtime_arg_count,
            l1: parts.l1,
            cbs: parts.cbs,
            noc: parts.noc,
            dst,
            halt: parts.halt,
        }
    }

    /// Kernel source name
    pub fn kernel_name(&self) -> &str {
        &self.kernel
    }

    /// Core this engine belongs to
    pub const fn core(&self) -> CoreCoord {
        self.core
    }

    /// Engine running this kernel
    pub const fn processor(&self) -> Processor {
        self.processor
    }

    /// Device geometry
    pub const fn topology(&self) -> &GridTopology {
        &self.topology
    }

    /// True once the host has halted the device
    pub fn is_halted(&self) -> bool {
        self.halt.load(Ordering::Acquire)
    }

    /// Runtime argument `index`, read from this engine's L1 argument slots
    ///
    /// # Errors
    ///
    /// Returns `ArgOutOfRange` past the count the host wrote.
    pub fn arg(&self, index: usize) -> KernelResult<u32> {
        if index >= self.runtime_arg_count {
            return Err(KernelFault::ArgOutOfRange {
                index,
                count: self.runtime_arg_count,
            });
        }
        let addr = u64::from(runtime_args_base(self.processor)) + 4 * index as u64;
        self.l1.read_u32(addr)
    }

    /// Number of runtime arguments the host wrote
    pub const fn arg_count(&self) -> usize {
        self.runtime_arg_count
    }

    /// Compile-time argument `index`
    ///
    /// # Errors
    ///
    /// Returns `CompileArgOutOfRange` past the compiled argument list.
    pub fn compile_arg(&self, index: usize) -> KernelResult<u32> {
        self.compile_args
            .get(index)
            .copied()
            .ok_or(KernelFault::CompileArgOutOfRange {
                index,
                count: self.compile_args.len(),
            })
    }

    /// Compile-time argument `index` as a CB id
    ///
    /// # Errors
    ///
    /// As [`compile_arg`](Self::compile_arg); also `Other` for a value that
    /// does not fit a CB id. Ids that fit but were never declared surface as
    /// `UnknownCircularBuffer` from [`cb`](Self::cb).
    pub fn compile_arg_cb(&self, index: usize) -> KernelResult<u8> {
        let raw = self.compile_arg(index)?;
        u8::try_from(raw)
            .map_err(|_| KernelFault::Other(format!("compile arg {index} = {raw} is not a CB id")))
    }

    /// CB `id` on this core
    ///
    /// # Errors
    ///
    /// Returns `UnknownCircularBuffer` if the program declared no such CB here.
    pub fn cb(&self, id: u8) -> KernelResult<Arc<CircularBuffer>> {
        self.cbs
            .get(&id)
            .cloned()
            .ok_or(KernelFault::UnknownCircularBuffer { cb: id })
    }

    /// This engine's NoC interface
    ///
    /// # Errors
    ///
    /// Faults on the compute engine, which has no NoC access.
    pub fn noc(&mut self) -> KernelResult<&mut Noc> {
        self.noc
            .as_mut()
            .ok_or_else(|| KernelFault::Other("compute engine has no NoC interface".into()))
    }

    /// L1 address of semaphore `index` (same on every core)
    pub const fn semaphore_addr(&self, index: u32) -> u64 {
        semaphore_address(index) as u64
    }

    /// NoC address of `offset` in core `(x, y)`'s L1
    pub const fn core_addr(&self, x: u32, y: u32, offset: u64) -> NocAddr {
        NocAddr::core(CoreCoord::new(x, y), offset)
    }

    /// Copy bytes out of local L1
    ///
    /// # Errors
    ///
    /// Returns `L1OutOfRange` past the end of L1.
    pub fn l1_read(&self, addr: u64, dst: &mut [u8]) -> KernelResult {
        self.l1.read(addr, dst)
    }

    /// Copy bytes into local L1
    ///
    /// # Errors
    ///
    /// Returns `L1OutOfRange` past the end of L1.
    pub fn l1_write(&self, addr: u64, src: &[u8]) -> KernelResult {
        self.l1.write(addr, src)
    }

    /// Complete outstanding transfers after the entry function returns
    pub(crate) fn finish(&mut self) -> KernelResult {
        match self.noc.as_mut() {
            Some(noc) => noc.flush(),
            None => Ok(()),
        }
    }

    pub(crate) fn noc_stats(&self) -> NocStats {
        self.noc.as_ref().map(|noc| *noc.stats()).unwrap_or_default()
    }

    fn dst_ref(&self) -> KernelResult<&DstRegisters> {
        self.dst
            .as_ref()
            .ok_or_else(|| KernelFault::dst("only the compute engine has destination registers"))
    }

    fn dst_mut(&mut self) -> KernelResult<&mut DstRegisters> {
        self.dst
            .as_mut()
            .ok_or_else(|| KernelFault::dst("only the compute engine has destination registers"))
    }

    /// Take ownership of the destination registers
    ///
    /// # Errors
    ///
    /// Faults if already acquired or not on the compute engine.
    pub fn acquire_dst(&mut self) -> KernelResult {
        let dst = self.dst_mut()?;
        if dst.phase == DstPhase::Acquired {
            return Err(KernelFault::dst("acquire while already acquired"));
        }
        dst.phase = DstPhase::Acquired;
        Ok(())
    }

    /// Give the destination registers back; their contents are discarded
    ///
    /// # Errors
    ///
    /// Faults if not acquired.
    pub fn release_dst(&mut self) -> KernelResult {
        let dst = self.dst_mut()?;
        dst.require_acquired("release")?;
        dst.phase = DstPhase::Released;
        dst.slots.iter_mut().for_each(|slot| *slot = None);
        Ok(())
    }

    /// Unpack tile `tile` (counted from the CB's read pointer) into slot `dst_index`
    ///
    /// # Errors
    ///
    /// Faults outside acquire/release, on a bad slot or CB, or on L1 errors.
    pub fn copy_tile(&mut self, cb: u8, tile: u32, dst_index: usize) -> KernelResult {
        let cb = self.cb(cb)?;
        let mut data = vec![0u8; cb.page_size() as usize];
        self.l1.read(cb.read_page_addr(tile), &mut data)?;
        let dst = self.dst_mut()?;
        dst.require_acquired("copy_tile")?;
        let slot = dst.slot_index(dst_index)?;
        dst.slots[slot] = Some(data);
        Ok(())
    }

    /// Mutable view of slot `dst_index` for in-register math
    ///
    /// # Errors
    ///
    /// Faults outside acquire/release, on a bad slot, or on an empty slot.
    pub fn dst_tile_mut(&mut self, dst_index: usize) -> KernelResult<&mut [u8]> {
        let dst = self.dst_mut()?;
        dst.require_acquired("tile access")?;
        let slot = dst.slot_index(dst_index)?;
        dst.slots[slot]
            .as_deref_mut()
            .ok_or_else(|| KernelFault::dst(format!("slot {slot} holds no tile")))
    }

    /// Pack slot `dst_index` into page `out_page` past `cb`'s write pointer
    ///
    /// # Errors
    ///
    /// Faults outside acquire/release, on a bad or empty slot, a bad CB, or
    /// on L1 errors.
    pub fn pack_tile(&mut self, dst_index: usize, cb: u8, out_page: u32) -> KernelResult {
        let cb = self.cb(cb)?;
        let dst = self.dst_ref()?;
        dst.require_acquired("pack_tile")?;
        let slot = dst.slot_index(dst_index)?;
        let data = dst.slots[slot]
            .as_ref()
            .ok_or_else(|| KernelFault::dst(format!("pack of empty slot {slot}")))?;
        let len = data.len().min(cb.page_size() as usize);
        self.l1.write(cb.write_page_addr(out_page), &data[..len])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cb::CircularBufferHandle;
    use tensim_chip::DataFormat;

    fn compute_ctx(fp32: bool) -> KernelContext {
        let core = CoreCoord::new(0, 0);
        let halt = Arc::new(AtomicBool::new(false));
        let l1 = Arc::new(MemoryRegion::new(1 << 20));
        let handle = |index, address| CircularBufferHandle {
            index,
            address,
            total_size: 4 * 64,
            page_size: 64,
            data_format: DataFormat::UInt8,
            cores: core.into(),
        };
        let mut cbs = HashMap::new();
        for (index, address) in [(0u8, 0x1_E000u32), (16, 0x1_F000)] {
            cbs.insert(
                index,
                Arc::new(CircularBuffer::new(&handle(index, address), core, Arc::clone(&halt), true)),
            );
        }
        KernelContext::new(ContextParts {
            kernel: "test".into(),
            core,
            config: KernelConfig::Compute(ComputeConfig {
                fp32_dest_acc_en: fp32,
            }),
            topology: GridTopology::SMALL,
            compile_args: vec![0, 16].into(),
            runtime_arg_count: 0,
            l1,
            cbs: Arc::new(cbs),
            noc: None,
            halt,
        })
    }

    #[test]
    fn registry_resolves_by_name() {
        let mut reg = KernelRegistry::new();
        reg.register(KernelSource::new("noop", |_| Ok(())).with_signature(0, 0));
        assert!(reg.get("noop").is_some());
        assert!(reg.get("missing").is_none());
        assert_eq!(reg.names(), vec!["noop"]);
    }

    #[test]
    fn compile_arg_cb_rejects_values_past_u8() {
        let mut ctx = compute_ctx(false);
        ctx.compile_args = vec![0, 16, 300, 40].into();
        assert_eq!(ctx.compile_arg_cb(1), Ok(16));
        assert!(matches!(ctx.compile_arg_cb(2), Err(KernelFault::Other(_))));
        let id = ctx.compile_arg_cb(3).unwrap();
        assert!(matches!(ctx.cb(id), Err(KernelFault::UnknownCircularBuffer { cb: 40 })));
        assert!(matches!(
            ctx.compile_arg_cb(4),
            Err(KernelFault::CompileArgOutOfRange { index: 4, count: 4 })
        ));
    }

    #[test]
    fn reader_and_writer_use_opposite_nocs() {
        assert_eq!(KernelConfig::reader().noc(), Some(NocId::Noc1));
        assert_eq!(KernelConfig::writer().noc(), Some(NocId::Noc0));
        assert_ne!(KernelConfig::reader().processor(), KernelConfig::writer().processor());
    }

    #[test]
    fn dst_protocol_copies_tile_between_cbs() {
        let mut ctx = compute_ctx(false);
        let input = ctx.cb(0).unwrap();
        ctx.l1_write(input.write_ptr(), &[5; 64]).unwrap();
        input.reserve_back(1).unwrap();
        input.push_back(1).unwrap();

        input.wait_front(1).unwrap();
        ctx.acquire_dst().unwrap();
        ctx.copy_tile(0, 0, 3).unwrap();
        ctx.dst_tile_mut(3).unwrap()[0] = 6;
        ctx.pack_tile(3, 16, 0).unwrap();
        ctx.release_dst().unwrap();

        let mut out = [0u8; 64];
        ctx.l1_read(ctx.cb(16).unwrap().write_ptr(), &mut out).unwrap();
        assert_eq!(out[0], 6);
        assert_eq!(out[1], 5);
    }

    #[test]
    fn dst_misuse_faults() {
        let mut ctx = compute_ctx(true);
        assert!(matches!(ctx.copy_tile(0, 0, 0), Err(KernelFault::DstRegister { .. })));
        ctx.acquire_dst().unwrap();
        assert!(ctx.acquire_dst().is_err());
        // fp32 accumulation leaves 8 slots
        assert!(ctx.copy_tile(0, 0, 8).is_err());
        assert!(ctx.pack_tile(0, 16, 0).is_err());
        assert!(matches!(ctx.cb(9), Err(KernelFault::UnknownCircularBuffer { cb: 9 })));
        assert!(ctx.noc().is_err());
    }

    #[test]
    fn args_are_bounds_checked() {
        let ctx = compute_ctx(false);
        assert_eq!(ctx.compile_arg(1), Ok(16));
        assert!(ctx.compile_arg(2).is_err());
        assert!(ctx.arg(0).is_err());
    }
}
