//! Core Grid Programs
//!
//! A program is built in three steps: declare CBs, semaphores and kernels;
//! compile (resolve sources, validate layout and CB usage, fill the binary
//! cache); then set runtime arguments and hand it to the device for launch.
//!
//! Configuration errors are reported as early as they can be detected:
//! engine and NoC conflicts, duplicate or overlapping CBs at declaration;
//! unknown sources, argument-count mismatches, oversized CB requests and
//! L1 layout collisions at compile.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tensim_chip::memory_map::{
    align_up, semaphore_address, L1_ALIGNMENT, L1_UNRESERVED_BASE, MAX_RUNTIME_ARGS,
    NUM_SEMAPHORES,
};
use tensim_chip::{CoreCoord, CoreRangeSet, GridTopology, Processor};
use tracing::{debug, info, warn};

use crate::cb::{CircularBufferConfig, CircularBufferHandle};
use crate::error::{Result, RuntimeError};
use crate::kernel::{
    CbEndpoint, KernelConfig, KernelHandle, KernelRegistry, KernelSource, KernelSpec, KernelState,
};

/// A semaphore word, at the same L1 address on each of its cores
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Semaphore {
    /// Slot index
    pub index: u32,
    /// Cores holding the word
    pub cores: CoreRangeSet,
    /// Value written before launch
    pub initial: u32,
}

impl Semaphore {
    /// L1 address of the word
    pub const fn address(&self) -> u32 {
        semaphore_address(self.index)
    }
}

/// A kernel resolved for one engine on a set of cores
#[derive(Debug)]
pub struct CompiledKernel {
    /// Resolved source
    pub source: KernelSource,
    /// Frozen compile-time arguments
    pub compile_args: Arc<[u32]>,
    /// Engine configuration
    pub config: KernelConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    source: String,
    compile_args: Vec<u32>,
    cores: Vec<CoreCoord>,
    processor: Processor,
}

/// Compiled kernels keyed by (source, compile args, cores, engine)
#[derive(Debug, Default)]
pub struct BinaryCache {
    entries: HashMap<CacheKey, Arc<CompiledKernel>>,
    hits: u64,
    misses: u64,
    generation: u64,
}

impl BinaryCache {
    /// Empty cache
    pub fn new() -> Self {
        Self::default()
    }

    /// Cached entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True if nothing is cached
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Lifetime (hits, misses)
    pub const fn counters(&self) -> (u64, u64) {
        (self.hits, self.misses)
    }

    /// Bumped by every [`clear`](Self::clear); programs compiled under an
    /// older generation must be recompiled
    pub const fn generation(&self) -> u64 {
        self.generation
    }

    /// Drop every entry
    pub fn clear(&mut self) {
        self.entries.clear();
        self.generation += 1;
    }
}

/// Outcome of [`Program::compile`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompileReport {
    /// Kernels in the program
    pub kernels: usize,
    /// Kernels served from the cache
    pub cache_hits: usize,
    /// Kernels compiled fresh
    pub cache_misses: usize,
    /// Wall time
    pub duration: Duration,
}

/// A producer/consumer mismatch found by [`Program::check_cb_contracts`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContractIssue {
    /// Pages are consumed but nobody produces them
    NoProducer {
        /// Core
        core: CoreCoord,
        /// CB id
        cb: u8,
    },
    /// Pages are produced but nobody consumes them
    NoConsumer {
        /// Core
        core: CoreCoord,
        /// CB id
        cb: u8,
    },
    /// More than one engine produces into the CB
    MultipleProducers {
        /// Core
        core: CoreCoord,
        /// CB id
        cb: u8,
    },
    /// More than one engine consumes from the CB
    MultipleConsumers {
        /// Core
        core: CoreCoord,
        /// CB id
        cb: u8,
    },
    /// Declared totals differ; the run would hang or overrun
    TotalMismatch {
        /// Core
        core: CoreCoord,
        /// CB id
        cb: u8,
        /// Pages the producer pushes
        produced: u32,
        /// Pages the consumer pops
        consumed: u32,
    },
}

/// One kernel inside a program
#[derive(Debug)]
pub struct ProgramKernel {
    handle: KernelHandle,
    spec: KernelSpec,
    cores: Vec<CoreCoord>,
    runtime_args: BTreeMap<CoreCoord, Vec<u32>>,
    state: KernelState,
    compiled: Option<Arc<CompiledKernel>>,
}

impl ProgramKernel {
    /// Handle
    pub const fn handle(&self) -> KernelHandle {
        self.handle
    }

    /// Creation request
    pub const fn spec(&self) -> &KernelSpec {
        &self.spec
    }

    /// Distinct cores, sorted
    pub fn cores(&self) -> &[CoreCoord] {
        &self.cores
    }

    /// Runtime arguments for `core` (empty if never set)
    pub fn runtime_args(&self, core: CoreCoord) -> &[u32] {
        self.runtime_args.get(&core).map_or(&[], Vec::as_slice)
    }

    /// Compiled form, once compiled
    pub fn compiled(&self) -> Option<&Arc<CompiledKernel>> {
        self.compiled.as_ref()
    }

    /// Current state
    pub const fn state(&self) -> KernelState {
        self.state
    }
}

/// A Core Grid Program
#[derive(Debug, Default)]
pub struct Program {
    cbs: Vec<CircularBufferHandle>,
    semaphores: Vec<Semaphore>,
    kernels: Vec<ProgramKernel>,
    compiled: bool,
    cache_generation: u64,
}

impl Program {
    /// Empty program
    pub fn new() -> Self {
        Self::default()
    }

    /// Declared CBs
    pub fn circular_buffers(&self) -> &[CircularBufferHandle] {
        &self.cbs
    }

    /// Declared semaphores
    pub fn semaphores(&self) -> &[Semaphore] {
        &self.semaphores
    }

    /// Declared kernels
    pub fn kernels(&self) -> &[ProgramKernel] {
        &self.kernels
    }

    /// True after a successful compile with no declarations since
    pub const fn is_compiled(&self) -> bool {
        self.compiled
    }

    pub(crate) const fn cache_generation(&self) -> u64 {
        self.cache_generation
    }

    /// State of `kernel`
    pub fn kernel_state(&self, kernel: KernelHandle) -> Option<KernelState> {
        self.kernel(kernel).map(ProgramKernel::state)
    }

    fn kernel(&self, handle: KernelHandle) -> Option<&ProgramKernel> {
        self.kernels.get(handle.id() as usize)
    }

    pub(crate) fn set_all_states(&mut self, state: KernelState) {
        for kernel in &mut self.kernels {
            kernel.state = state;
        }
    }

    pub(crate) fn set_state(&mut self, handle: KernelHandle, state: KernelState) {
        if let Some(kernel) = self.kernels.get_mut(handle.id() as usize) {
            kernel.state = state;
        }
    }

    /// Declare a CB on `cores`
    ///
    /// Without an explicit address the CB is placed above every CB already
    /// declared on any of its cores, so it has one address everywhere.
    ///
    /// # Errors
    ///
    /// `InvalidCircularBuffer` for bad geometry, a duplicate id, an explicit
    /// address in the reserved region, or a CB whose end does not fit a
    /// 32-bit L1 address; `CircularBufferOverlap` if an explicit address
    /// collides with an existing CB. Running past the device's L1 size is
    /// caught at compile, where the topology is known.
    pub fn create_circular_buffer(
        &mut self,
        cores: impl Into<CoreRangeSet>,
        config: CircularBufferConfig,
    ) -> Result<CircularBufferHandle> {
        let cores = cores.into();
        let core_list = cores.cores();
        let Some(&first) = core_list.first() else {
            return Err(RuntimeError::invalid_argument("CB declared on an empty core set"));
        };
        config.validate(first)?;

        for existing in &self.cbs {
            if let Some(&core) = core_list.iter().find(|c| existing.cores.contains(**c)) {
                if existing.index == config.index {
                    return Err(RuntimeError::invalid_cb(
                        core,
                        config.index,
                        "already declared on this core",
                    ));
                }
            }
        }

        let address = if let Some(address) = config.address {
            if address < L1_UNRESERVED_BASE || address % L1_ALIGNMENT != 0 {
                return Err(RuntimeError::invalid_cb(
                    first,
                    config.index,
                    format!(
                        "address {address:#x} must be {L1_ALIGNMENT}-byte aligned and at or above {L1_UNRESERVED_BASE:#x}"
                    ),
                ));
            }
            address
        } else {
            let top = self
                .cbs
                .iter()
                .filter(|cb| core_list.iter().any(|c| cb.cores.contains(*c)))
                .map(CircularBufferHandle::end)
                .fold(L1_UNRESERVED_BASE, u32::max);
            u32::try_from(align_up(u64::from(top), u64::from(L1_ALIGNMENT))).map_err(|_| {
                RuntimeError::invalid_cb(first, config.index, "no L1 address space left above earlier CBs")
            })?
        };
        let end = address.checked_add(config.total_size).ok_or_else(|| {
            RuntimeError::invalid_cb(
                first,
                config.index,
                format!(
                    "{} bytes at {address:#x} run past the end of the L1 address space",
                    config.total_size
                ),
            )
        })?;

        if config.address.is_some() {
            for existing in &self.cbs {
                let shared = core_list.iter().find(|c| existing.cores.contains(**c));
                if let Some(&core) = shared {
                    if address < existing.end() && existing.address < end {
                        return Err(RuntimeError::CircularBufferOverlap {
                            core,
                            first: existing.index,
                            second: config.index,
                        });
                    }
                }
            }
        }

        let handle = CircularBufferHandle {
            index: config.index,
            address,
            total_size: config.total_size,
            page_size: config.resolved_page_size(),
            data_format: config.data_format,
            cores,
        };
        debug!(
            "CB {} at {:#x}: {} x {} B ({}) on {}",
            handle.index,
            handle.address,
            handle.num_pages(),
            handle.page_size,
            handle.data_format,
            handle.cores
        );
        self.cbs.push(handle.clone());
        self.compiled = false;
        Ok(handle)
    }

    /// Declare a semaphore on `cores`, returning its slot index
    ///
    /// The slot is the lowest one free on every listed core.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` for an empty core set or when no slot is free.
    pub fn create_semaphore(&mut self, cores: impl Into<CoreRangeSet>, initial: u32) -> Result<u32> {
        let cores = cores.into();
        let core_list = cores.cores();
        if core_list.is_empty() {
            return Err(RuntimeError::invalid_argument(
                "semaphore declared on an empty core set",
            ));
        }
        let taken = |index: u32| {
            self.semaphores.iter().any(|s| {
                s.index == index && core_list.iter().any(|c| s.cores.contains(*c))
            })
        };
        let index = (0..NUM_SEMAPHORES).find(|&i| !taken(i)).ok_or_else(|| {
            RuntimeError::invalid_argument(format!(
                "all {NUM_SEMAPHORES} semaphores in use on {cores}"
            ))
        })?;
        debug!("Semaphore {index} (init {initial}) on {cores}");
        self.semaphores.push(Semaphore {
            index,
            cores,
            initial,
        });
        self.compiled = false;
        Ok(index)
    }

    /// Declare a kernel
    ///
    /// # Errors
    ///
    /// `KernelConflict` if another kernel already occupies the same engine or
    /// the same NoC on any of its cores; `InvalidArgument` for an empty core
    /// set or a data-movement config naming the compute engine.
    pub fn create_kernel(&mut self, spec: KernelSpec) -> Result<KernelHandle> {
        let cores = spec.cores.cores();
        if cores.is_empty() {
            return Err(RuntimeError::invalid_argument(format!(
                "kernel '{}' has no cores",
                spec.source
            )));
        }
        let processor = spec.config.processor();
        if matches!(spec.config, KernelConfig::DataMovement { .. }) && !processor.is_data_movement() {
            return Err(RuntimeError::invalid_argument(format!(
                "kernel '{}': data-movement config on the compute engine",
                spec.source
            )));
        }

        for existing in &self.kernels {
            for core in cores.iter().filter(|c| existing.spec.cores.contains(**c)) {
                if existing.spec.config.processor() == processor {
                    return Err(RuntimeError::kernel_conflict(
                        *core,
                        format!(
                            "{processor} already runs '{}'",
                            existing.spec.source
                        ),
                    ));
                }
                if let (Some(a), Some(b)) = (existing.spec.config.noc(), spec.config.noc()) {
                    if a == b {
                        return Err(RuntimeError::kernel_conflict(
                            *core,
                            format!("{b} already used by '{}'", existing.spec.source),
                        ));
                    }
                }
            }
        }

        let handle = KernelHandle::new(u32::try_from(self.kernels.len()).map_err(|_| {
            RuntimeError::invalid_argument("too many kernels in one program")
        })?);
        debug!(
            "Kernel {} '{}' on {} ({})",
            handle.id(),
            spec.source,
            spec.cores,
            processor
        );
        self.kernels.push(ProgramKernel {
            handle,
            spec,
            cores,
            runtime_args: BTreeMap::new(),
            state: KernelState::Uninitialized,
            compiled: None,
        });
        self.compiled = false;
        Ok(handle)
    }

    /// Set the runtime arguments of `kernel` on `core`
    ///
    /// # Errors
    ///
    /// `InvalidArgument` for an unknown kernel, a core the kernel does not
    /// run on, or more than 256 values.
    pub fn set_runtime_args(&mut self, kernel: KernelHandle, core: CoreCoord, args: &[u32]) -> Result<()> {
        if args.len() > MAX_RUNTIME_ARGS {
            return Err(RuntimeError::invalid_argument(format!(
                "{} runtime args exceed the limit of {MAX_RUNTIME_ARGS}",
                args.len()
            )));
        }
        let entry = self
            .kernels
            .get_mut(kernel.id() as usize)
            .ok_or_else(|| RuntimeError::invalid_argument(format!("unknown kernel {}", kernel.id())))?;
        if !entry.spec.cores.contains(core) {
            return Err(RuntimeError::invalid_argument(format!(
                "kernel '{}' does not run on core {core}",
                entry.spec.source
            )));
        }
        entry.runtime_args.insert(core, args.to_vec());
        Ok(())
    }

    /// Set the same runtime arguments on every core of `kernel`
    ///
    /// # Errors
    ///
    /// As [`set_runtime_args`](Self::set_runtime_args).
    pub fn set_runtime_args_all(&mut self, kernel: KernelHandle, args: &[u32]) -> Result<()> {
        let cores = self
            .kernel(kernel)
            .map(|k| k.cores.clone())
            .ok_or_else(|| RuntimeError::invalid_argument(format!("unknown kernel {}", kernel.id())))?;
        for core in cores {
            self.set_runtime_args(kernel, core, args)?;
        }
        Ok(())
    }

    /// CBs declared on `core`
    pub fn cbs_on(&self, core: CoreCoord) -> impl Iterator<Item = &CircularBufferHandle> {
        self.cbs.iter().filter(move |cb| cb.cores.contains(core))
    }

    /// Resolve, validate and cache every kernel
    ///
    /// `l1_floor` is the lowest L1 address taken by an L1 buffer (or the L1
    /// size when there are none); every CB must end at or below it.
    ///
    /// # Errors
    ///
    /// - `InvalidArgument` if anything is placed off the grid
    /// - `OutOfMemory` if CBs run into L1 buffers or past L1
    /// - `CompileFailed` for an unknown source, a compile-arg count that
    ///   disagrees with the source's signature, or CB usage naming a CB that
    ///   is not declared on the kernel's cores
    /// - `CbRequestExceedsCapacity` if a declared block exceeds its CB
    pub fn compile(
        &mut self,
        registry: &KernelRegistry,
        topology: &GridTopology,
        l1_floor: u64,
        cache: &mut BinaryCache,
    ) -> Result<CompileReport> {
        let started = Instant::now();
        self.check_placement(topology)?;
        self.check_l1_layout(l1_floor)?;

        let (mut hits, mut misses) = (0, 0);
        for index in 0..self.kernels.len() {
            let kernel = &self.kernels[index];
            let spec = &kernel.spec;
            let source = registry
                .get(&spec.source)
                .ok_or_else(|| RuntimeError::compile_failed(&spec.source, "unknown kernel source"))?;

            if let Some(sig) = source.signature() {
                if sig.compile_args != spec.compile_args.len() {
                    return Err(RuntimeError::compile_failed(
                        &spec.source,
                        format!(
                            "expected {} compile-time args, got {}",
                            sig.compile_args,
                            spec.compile_args.len()
                        ),
                    ));
                }
            }
            self.check_cb_usage(kernel)?;

            let key = CacheKey {
                source: spec.source.clone(),
                compile_args: spec.compile_args.clone(),
                cores: kernel.cores.clone(),
                processor: spec.config.processor(),
            };
            let compiled = if let Some(hit) = cache.entries.get(&key) {
                hits += 1;
                cache.hits += 1;
                Arc::clone(hit)
            } else {
                misses += 1;
                cache.misses += 1;
                let compiled = Arc::new(CompiledKernel {
                    source: source.clone(),
                    compile_args: spec.compile_args.clone().into(),
                    config: spec.config,
                });
                cache.entries.insert(key, Arc::clone(&compiled));
                compiled
            };

            let kernel = &mut self.kernels[index];
            kernel.compiled = Some(compiled);
            kernel.state = KernelState::Compiled;
        }

        self.compiled = true;
        self.cache_generation = cache.generation;
        let report = CompileReport {
            kernels: self.kernels.len(),
            cache_hits: hits,
            cache_misses: misses,
            duration: started.elapsed(),
        };
        info!(
            "✅ Program compiled: {} kernels ({} cached, {} new) in {:?}",
            report.kernels, report.cache_hits, report.cache_misses, report.duration
        );
        Ok(report)
    }

    fn check_placement(&self, topology: &GridTopology) -> Result<()> {
        let off_grid = |what: String, cores: &CoreRangeSet| -> Result<()> {
            match cores.cores().into_iter().find(|c| !topology.contains(*c)) {
                Some(core) => Err(RuntimeError::invalid_argument(format!(
                    "{what} placed on core {core} outside the {}x{} grid",
                    topology.grid_x, topology.grid_y
                ))),
                None => Ok(()),
            }
        };
        for cb in &self.cbs {
            off_grid(format!("CB {}", cb.index), &cb.cores)?;
        }
        for sem in &self.semaphores {
            off_grid(format!("semaphore {}", sem.index), &sem.cores)?;
        }
        for kernel in &self.kernels {
            off_grid(format!("kernel '{}'", kernel.spec.source), &kernel.spec.cores)?;
        }
        Ok(())
    }

    pub(crate) fn check_l1_layout(&self, l1_floor: u64) -> Result<()> {
        let mut per_core: BTreeMap<CoreCoord, Vec<&CircularBufferHandle>> = BTreeMap::new();
        for cb in &self.cbs {
            for core in cb.cores.cores() {
                per_core.entry(core).or_default().push(cb);
            }
        }
        for (core, mut cbs) in per_core {
            cbs.sort_by_key(|cb| cb.address);
            for pair in cbs.windows(2) {
                if pair[1].address < pair[0].end() {
                    return Err(RuntimeError::CircularBufferOverlap {
                        core,
                        first: pair[0].index,
                        second: pair[1].index,
                    });
                }
            }
            if let Some(last) = cbs.last() {
                if u64::from(last.end()) > l1_floor {
                    return Err(RuntimeError::OutOfMemory {
                        region: "L1",
                        requested: u64::from(last.end() - L1_UNRESERVED_BASE),
                        available: l1_floor.saturating_sub(u64::from(L1_UNRESERVED_BASE)),
                    });
                }
            }
        }
        Ok(())
    }

    fn check_cb_usage(&self, kernel: &ProgramKernel) -> Result<()> {
        let source = &kernel.spec.source;
        for usage in &kernel.spec.cb_usage {
            if usage.block_pages == 0 {
                return Err(RuntimeError::compile_failed(
                    source,
                    format!("zero-page block declared on CB {}", usage.cb),
                ));
            }
            for &core in &kernel.cores {
                let cb = self
                    .cbs_on(core)
                    .find(|cb| cb.index == usage.cb)
                    .ok_or_else(|| {
                        RuntimeError::compile_failed(
                            source,
                            format!("uses CB {} which is not declared on core {core}", usage.cb),
                        )
                    })?;
                let capacity = cb.num_pages();
                if usage.block_pages > capacity {
                    return Err(RuntimeError::CbRequestExceedsCapacity {
                        kernel: source.clone(),
                        core,
                        cb: usage.cb,
                        requested: usage.block_pages,
                        capacity,
                    });
                }
                if capacity % usage.block_pages != 0 {
                    warn!(
                        "Kernel '{source}' blocks of {} pages do not divide CB {} ({} pages); blocks will straddle the wrap",
                        usage.block_pages, usage.cb, capacity
                    );
                }
            }
        }
        Ok(())
    }

    /// Cross-check producer and consumer declarations without running anything
    ///
    /// Only (core, CB) pairs with at least one declared usage are checked.
    pub fn check_cb_contracts(&self) -> Vec<ContractIssue> {
        #[derive(Default)]
        struct Sides {
            producers: Vec<Option<u32>>,
            consumers: Vec<Option<u32>>,
        }

        let mut sides: BTreeMap<(CoreCoord, u8), Sides> = BTreeMap::new();
        for kernel in &self.kernels {
            for usage in &kernel.spec.cb_usage {
                for &core in &kernel.cores {
                    let entry = sides.entry((core, usage.cb)).or_default();
                    match usage.endpoint {
                        CbEndpoint::Producer => entry.producers.push(usage.total_pages),
                        CbEndpoint::Consumer => entry.consumers.push(usage.total_pages),
                    }
                }
            }
        }

        let mut issues = Vec::new();
        for ((core, cb), s) in sides {
            match (s.producers.as_slice(), s.consumers.as_slice()) {
                ([], _) => issues.push(ContractIssue::NoProducer { core, cb }),
                (_, []) => issues.push(ContractIssue::NoConsumer { core, cb }),
                ([Some(produced)], [Some(consumed)]) if produced != consumed => {
                    issues.push(ContractIssue::TotalMismatch {
                        core,
                        cb,
                        produced: *produced,
                        consumed: *consumed,
                    });
                }
                _ => {}
            }
            if s.producers.len() > 1 {
                issues.push(ContractIssue::MultipleProducers { core, cb });
            }
            if s.consumers.len() > 1 {
                issues.push(ContractIssue::MultipleConsumers { core, cb });
            }
        }
        issues
    }
}
