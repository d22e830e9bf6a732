//! Host transport failure handling
//!
//! Transport errors surface unchanged and are never retried.

use bytes::Bytes;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tensim_runtime::chip::NocEndpoint;
use tensim_runtime::pipelines::{CopyOptions, CopyPipeline};
use tensim_runtime::{
    BufferConfig, Device, HostTransport, Result, RuntimeConfig, RuntimeError, SimulatedTransport,
    TransportType,
};

/// Forwards to the simulated transport but rejects writes to one kind of endpoint
#[derive(Debug)]
struct FlakyTransport {
    inner: SimulatedTransport,
    fail_dram: bool,
    fail_l1: bool,
    writes: Arc<AtomicUsize>,
}

impl HostTransport for FlakyTransport {
    fn write(&self, endpoint: NocEndpoint, offset: u64, data: &[u8]) -> Result<()> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        let fail = match endpoint {
            NocEndpoint::DramBank(_) => self.fail_dram,
            NocEndpoint::Core(_) => self.fail_l1,
        };
        if fail {
            return Err(RuntimeError::transport_failed(format!("link down writing {endpoint}")));
        }
        self.inner.write(endpoint, offset, data)
    }

    fn read(&self, endpoint: NocEndpoint, offset: u64, len: usize) -> Result<Bytes> {
        self.inner.read(endpoint, offset, len)
    }

    fn transport_type(&self) -> TransportType {
        TransportType::External
    }
}

fn flaky_device(fail_dram: bool, fail_l1: bool) -> (Device, Arc<AtomicUsize>) {
    let writes = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&writes);
    let dev = Device::with_transport(RuntimeConfig::small(), move |memory| {
        Box::new(FlakyTransport {
            inner: SimulatedTransport::new(memory),
            fail_dram,
            fail_l1,
            writes: counter,
        })
    })
    .expect("open device");
    (dev, writes)
}

#[test]
fn test_buffer_write_failure_is_not_retried() {
    let (mut dev, writes) = flaky_device(true, false);
    assert_eq!(dev.transport_type(), TransportType::External);
    let buf = dev
        .create_buffer(BufferConfig::dram_interleaved(8 * 1024, 1024))
        .expect("buffer");
    let err = dev.write_buffer(&buf, &[1u8; 8 * 1024]).unwrap_err();
    assert!(matches!(err, RuntimeError::TransportFailed { .. }), "{err}");
    assert_eq!(writes.load(Ordering::SeqCst), 1);
}

#[test]
fn test_argument_load_failure_aborts_launch() {
    let (mut dev, writes) = flaky_device(false, true);
    let src = dev
        .create_buffer(BufferConfig::dram_interleaved(4 * 2048, 2048))
        .expect("src");
    let dst = dev
        .create_buffer(BufferConfig::dram_interleaved(4 * 2048, 2048))
        .expect("dst");
    dev.write_buffer(&src, &[7u8; 4 * 2048]).expect("DRAM writes still work");
    let before = writes.load(Ordering::SeqCst);

    let mut pipe = CopyPipeline::build(&src, &dst, &CopyOptions::default()).expect("build");
    dev.compile_program(&mut pipe.program).expect("compile");
    let err = dev.launch_program(&mut pipe.program).unwrap_err();
    assert!(matches!(err, RuntimeError::TransportFailed { .. }), "{err}");
    assert_eq!(writes.load(Ordering::SeqCst), before + 1);
    assert!(!dev.needs_reset());

    // nothing ran, so the destination is still zero
    let out = dev.read_buffer(&dst).expect("read back");
    assert!(out.iter().all(|&b| b == 0));
}
