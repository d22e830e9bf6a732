//! Error types for host runtime and kernel execution

use tensim_chip::{CoreCoord, NocEndpoint, Processor};
use thiserror::Error;

/// Result type alias for runtime operations
pub type Result<T> = std::result::Result<T, RuntimeError>;

/// Result type returned by kernel entry points and device-side primitives
pub type KernelResult<T = ()> = std::result::Result<T, KernelFault>;

/// Errors surfaced at the host boundary
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// Circular buffer declaration is malformed
    #[error("Invalid circular buffer {cb} on core {core}: {reason}")]
    InvalidCircularBuffer {
        /// Core the CB was declared on
        core: CoreCoord,
        /// CB id
        cb: u8,
        /// What is wrong with it
        reason: String,
    },

    /// Two CBs on one core share L1 bytes
    #[error("Circular buffers {first} and {second} overlap in L1 on core {core}")]
    CircularBufferOverlap {
        /// Core with the collision
        core: CoreCoord,
        /// First CB id
        first: u8,
        /// Second CB id
        second: u8,
    },

    /// A kernel declares a CB block larger than the CB; it would block forever
    #[error(
        "Kernel '{kernel}' on core {core} requests {requested} pages from CB {cb} \
         which holds only {capacity}"
    )]
    CbRequestExceedsCapacity {
        /// Kernel source name
        kernel: String,
        /// Core
        core: CoreCoord,
        /// CB id
        cb: u8,
        /// Pages per request
        requested: u32,
        /// CB capacity in pages
        capacity: u32,
    },

    /// Two kernels claim the same engine or NoC on a core
    #[error("Kernel conflict on core {core}: {reason}")]
    KernelConflict {
        /// Core
        core: CoreCoord,
        /// Which slot is doubly claimed
        reason: String,
    },

    /// Allocation failed
    #[error("Out of {region} memory: requested {requested} bytes, {available} available")]
    OutOfMemory {
        /// Memory region name ("DRAM", "L1")
        region: &'static str,
        /// Bytes requested
        requested: u64,
        /// Largest contiguous free block
        available: u64,
    },

    /// Kernel failed to compile
    #[error("Compile failed for kernel '{kernel}': {reason}")]
    CompileFailed {
        /// Kernel source name
        kernel: String,
        /// Reason for failure
        reason: String,
    },

    /// Argument count disagrees with the kernel's declared signature
    #[error("Kernel '{kernel}' on core {core}: expected {expected} args, got {actual}")]
    ArgumentMismatch {
        /// Kernel source name
        kernel: String,
        /// Core
        core: CoreCoord,
        /// Declared count
        expected: usize,
        /// Supplied count
        actual: usize,
    },

    /// Host API called with an invalid argument
    #[error("Invalid argument: {reason}")]
    InvalidArgument {
        /// Reason
        reason: String,
    },

    /// Program did not finish before the watchdog fired
    #[error("Program did not complete within {duration_ms}ms (cause not diagnosed)")]
    Timeout {
        /// Watchdog duration in milliseconds
        duration_ms: u64,
    },

    /// A kernel returned a fault
    #[error("Kernel '{kernel}' faulted on core {core} ({processor}): {fault}")]
    KernelFault {
        /// Kernel source name
        kernel: String,
        /// Core
        core: CoreCoord,
        /// Engine
        processor: Processor,
        /// The fault
        #[source]
        fault: KernelFault,
    },

    /// Device or program is in the wrong state for the operation
    #[error("Invalid state: {state}")]
    InvalidState {
        /// Current state description
        state: String,
    },

    /// Host↔device transfer failed
    #[error("Transport failed: {reason}")]
    TransportFailed {
        /// Reason for failure
        reason: String,
    },
}

impl RuntimeError {
    /// Create an invalid circular buffer error
    pub fn invalid_cb(core: CoreCoord, cb: u8, reason: impl Into<String>) -> Self {
        Self::InvalidCircularBuffer {
            core,
            cb,
            reason: reason.into(),
        }
    }

    /// Create a kernel conflict error
    pub fn kernel_conflict(core: CoreCoord, reason: impl Into<String>) -> Self {
        Self::KernelConflict {
            core,
            reason: reason.into(),
        }
    }

    /// Create a compile failed error
    pub fn compile_failed(kernel: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::CompileFailed {
            kernel: kernel.into(),
            reason: reason.into(),
        }
    }

    /// Create an invalid argument error
    pub fn invalid_argument(reason: impl Into<String>) -> Self {
        Self::InvalidArgument {
            reason: reason.into(),
        }
    }

    /// Create an invalid state error
    pub fn invalid_state(state: impl Into<String>) -> Self {
        Self::InvalidState {
            state: state.into(),
        }
    }

    /// Create a transport failed error
    pub fn transport_failed(reason: impl Into<String>) -> Self {
        Self::TransportFailed {
            reason: reason.into(),
        }
    }
}

/// Faults raised inside a running kernel
///
/// Raised by device-side primitives when they detect a condition that would
/// otherwise hang or corrupt memory silently. Conditions only caught by
/// debug checks are marked as such.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KernelFault {
    /// reserve/wait for more pages than the CB can ever hold
    #[error("CB {cb}: request for {requested} pages exceeds capacity of {capacity}")]
    CbRequestExceedsCapacity {
        /// CB id
        cb: u8,
        /// Pages requested
        requested: u32,
        /// Capacity in pages
        capacity: u32,
    },

    /// Kernel addressed a CB that was not declared on its core
    #[error("CB {cb} is not configured on this core")]
    UnknownCircularBuffer {
        /// CB id
        cb: u8,
    },

    /// CB call sequence violated (debug checks)
    #[error("CB {cb} protocol violation: {reason}")]
    CbProtocol {
        /// CB id
        cb: u8,
        /// What went wrong
        reason: String,
    },

    /// Runtime argument index past what the host wrote
    #[error("Runtime arg {index} out of range ({count} supplied)")]
    ArgOutOfRange {
        /// Index read
        index: usize,
        /// Args supplied
        count: usize,
    },

    /// Compile-time argument index out of range
    #[error("Compile-time arg {index} out of range ({count} supplied)")]
    CompileArgOutOfRange {
        /// Index read
        index: usize,
        /// Args supplied
        count: usize,
    },

    /// Semaphore increment issued with writes outstanding (debug checks)
    #[error("Semaphore increment with {outstanding} writes issued after the fence")]
    UnfencedSemaphore {
        /// Writes issued since the fence's barrier
        outstanding: u64,
    },

    /// Destination register misuse
    #[error("Destination registers: {reason}")]
    DstRegister {
        /// What went wrong
        reason: String,
    },

    /// L1 access outside the core's L1
    #[error("L1 access at {addr:#x}+{len} outside {limit} bytes")]
    L1OutOfRange {
        /// Start address
        addr: u64,
        /// Length in bytes
        len: u64,
        /// L1 size
        limit: u64,
    },

    /// NoC transaction addressed an endpoint that does not exist
    #[error("No such NoC endpoint: {endpoint}")]
    UnknownEndpoint {
        /// The endpoint
        endpoint: NocEndpoint,
    },

    /// Page index beyond an address generator's bound (debug checks)
    #[error("Page {page} out of range for a {num_pages}-page buffer")]
    PageOutOfRange {
        /// Page index
        page: u32,
        /// Buffer size in pages
        num_pages: u32,
    },

    /// Device halted while the kernel was blocked
    #[error("Device halted")]
    Halted,

    /// Kernel panicked
    #[error("Kernel panicked: {0}")]
    Panicked(String),

    /// Kernel-defined failure
    #[error("{0}")]
    Other(String),
}

impl KernelFault {
    /// Create a CB protocol fault
    pub fn cb_protocol(cb: u8, reason: impl Into<String>) -> Self {
        Self::CbProtocol {
            cb,
            reason: reason.into(),
        }
    }

    /// Create a destination-register fault
    pub fn dst(reason: impl Into<String>) -> Self {
        Self::DstRegister {
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kernel_fault_names_kernel_and_core() {
        let err = RuntimeError::KernelFault {
            kernel: "reader".into(),
            core: CoreCoord::new(1, 2),
            processor: Processor::DataMovement1,
            fault: KernelFault::UnknownCircularBuffer { cb: 7 },
        };
        let msg = err.to_string();
        assert!(msg.contains("reader"));
        assert!(msg.contains("(1, 2)"));
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn oom_reports_requested_and_available() {
        let err = RuntimeError::OutOfMemory {
            region: "DRAM",
            requested: 4096,
            available: 1024,
        };
        assert_eq!(
            err.to_string(),
            "Out of DRAM memory: requested 4096 bytes, 1024 available"
        );
    }
}
