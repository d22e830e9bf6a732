//! Host ↔ device transport
//!
//! Every host-side access to device memory (buffer writes and read-back,
//! runtime arguments, semaphore initialisation) goes through a
//! [`HostTransport`]. The simulator ships an in-process transport; tests
//! wrap it to inject faults.
//!
//! Transport errors are fatal for the operation that hit them. The runtime
//! never retries.

use bytes::Bytes;
use std::fmt::Debug;
use std::sync::Arc;
use tensim_chip::NocEndpoint;

use crate::error::{Result, RuntimeError};
use crate::memory::DeviceMemory;

/// Transport type identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportType {
    /// Direct access to in-process simulated memory
    Simulated,
    /// Anything supplied by the embedder
    External,
}

impl std::fmt::Display for TransportType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Simulated => write!(f, "Simulated"),
            Self::External => write!(f, "External"),
        }
    }
}

/// Host-side path into device memory
pub trait HostTransport: Debug + Send + Sync {
    /// Write `data` at `offset` in `endpoint`
    ///
    /// # Errors
    ///
    /// Returns `TransportFailed` if the bytes could not be delivered.
    fn write(&self, endpoint: NocEndpoint, offset: u64, data: &[u8]) -> Result<()>;

    /// Read `len` bytes at `offset` in `endpoint`
    ///
    /// # Errors
    ///
    /// Returns `TransportFailed` if the bytes could not be fetched.
    fn read(&self, endpoint: NocEndpoint, offset: u64, len: usize) -> Result<Bytes>;

    /// Get transport type for debugging
    fn transport_type(&self) -> TransportType;
}

/// In-process transport over [`DeviceMemory`]
#[derive(Debug, Clone)]
pub struct SimulatedTransport {
    memory: Arc<DeviceMemory>,
}

impl SimulatedTransport {
    /// Transport over `memory`
    pub const fn new(memory: Arc<DeviceMemory>) -> Self {
        Self { memory }
    }
}

impl HostTransport for SimulatedTransport {
    fn write(&self, endpoint: NocEndpoint, offset: u64, data: &[u8]) -> Result<()> {
        let region = self
            .memory
            .endpoint(endpoint)
            .ok_or_else(|| RuntimeError::transport_failed(format!("no such endpoint {endpoint}")))?;
        region
            .write(offset, data)
            .map_err(|e| RuntimeError::transport_failed(format!("write to {endpoint}: {e}")))
    }

    fn read(&self, endpoint: NocEndpoint, offset: u64, len: usize) -> Result<Bytes> {
        let region = self
            .memory
            .endpoint(endpoint)
            .ok_or_else(|| RuntimeError::transport_failed(format!("no such endpoint {endpoint}")))?;
        let mut buf = vec![0u8; len];
        region
            .read(offset, &mut buf)
            .map_err(|e| RuntimeError::transport_failed(format!("read from {endpoint}: {e}")))?;
        Ok(Bytes::from(buf))
    }

    fn transport_type(&self) -> TransportType {
        TransportType::Simulated
    }
}
