//! Capability probing: can the device register a given memory kind?
//!
//! For each kind the probe allocates a small test buffer in that memory and
//! tries to register it with the local device for local (and, when the
//! device supports RDMA read, remote-read) access. Registration success
//! means the NIC can reach the memory peer-to-peer; failure is not fatal,
//! the kind falls back to host-staged thresholds. The test buffer and any
//! registration handle are released on every exit path.

use crate::error::Result;
use crate::hmem::runtime::MemoryRuntime;
use tracing::{info, warn};

/// Probe test-buffer length: two pages, enough to catch alignment-sensitive
/// registration failures.
pub const PROBE_BUF_LEN: usize = 2 * 4096;

/// Device capabilities consulted by the probe and the threshold selector.
#[derive(Debug, Clone, Copy)]
pub struct DeviceCaps {
    /// Largest single message the device accepts (the negotiated MTU).
    pub max_msg_size: usize,
    /// Worst-case wire header prepended to an eager payload.
    pub max_wire_hdr_size: usize,
    /// Whether the device supports remote RDMA read.
    pub rdma_read: bool,
}

impl Default for DeviceCaps {
    fn default() -> Self {
        // Conservative single-packet payload of an EFA-class device.
        Self {
            max_msg_size: 8928,
            max_wire_hdr_size: 172,
            rdma_read: false,
        }
    }
}

/// A live probe registration. Deregistration is explicit so driver failures
/// can be surfaced instead of being swallowed by a drop.
pub trait ProbeMr {
    fn deregister(self: Box<Self>) -> Result<()>;
}

/// The device/domain context the probe runs against.
///
/// Always passed in explicitly; the probe never consults process-global
/// device state.
pub trait DomainContext {
    fn device_count(&self) -> usize;

    fn caps(&self) -> &DeviceCaps;

    /// Register `len` bytes at `addr` for local access, plus remote read
    /// when `remote_read` is set. `None` means the device refused the
    /// registration (expected on systems without P2P support).
    fn register_probe(&self, addr: usize, len: usize, remote_read: bool)
        -> Option<Box<dyn ProbeMr>>;
}

/// What the probe learned about one memory kind.
#[derive(Debug, Clone, Copy)]
pub struct ProbeReport {
    pub p2p_supported: bool,
}

/// Probe one memory kind against the domain's device.
///
/// `Ok(None)` means the kind is not usable on this system and should be
/// skipped without an error (runtime missing, or required device capability
/// absent). `Err` is a soft failure the registry records as a diagnostic.
pub(crate) fn probe_kind(
    rt: &dyn MemoryRuntime,
    domain: &dyn DomainContext,
) -> Result<Option<ProbeReport>> {
    let kind = rt.kind();

    if !rt.is_initialized() {
        info!(?kind, "memory runtime not initialized, skipping");
        return Ok(None);
    }

    let caps = domain.caps();
    if rt.requires_device_rdma_read() && !caps.rdma_read {
        warn!(
            ?kind,
            "device has no RDMA read support, transfers using this memory kind will fail"
        );
        return Ok(None);
    }

    if !rt.needs_registration_probe() {
        return Ok(Some(ProbeReport {
            p2p_supported: true,
        }));
    }

    // Freed on drop whichever way we leave this function.
    let buf = rt.alloc_probe_buffer(PROBE_BUF_LEN)?;

    let mr = match domain.register_probe(buf.addr(), buf.len(), caps.rdma_read) {
        Some(mr) => mr,
        None => {
            warn!(
                ?kind,
                "failed to register probe buffer with the device; \
                 transfers requiring peer-to-peer support will fall back"
            );
            return Ok(Some(ProbeReport {
                p2p_supported: false,
            }));
        }
    };

    mr.deregister()?;

    Ok(Some(ProbeReport {
        p2p_supported: true,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::hmem::runtime::ProbeBuffer;
    use crate::hmem::MemoryKind;
    use std::sync::atomic::{AtomicIsize, AtomicUsize, Ordering};
    use std::sync::Arc;

    /// Counts outstanding allocations and registrations so every test can
    /// assert nothing leaked on its exit path.
    #[derive(Default)]
    struct Ledger {
        live_bufs: AtomicIsize,
        live_mrs: AtomicIsize,
        reg_attempts: AtomicUsize,
    }

    struct TrackedBuf {
        mem: Box<[u8]>,
        ledger: Arc<Ledger>,
    }

    impl ProbeBuffer for TrackedBuf {
        fn addr(&self) -> usize {
            self.mem.as_ptr() as usize
        }
        fn len(&self) -> usize {
            self.mem.len()
        }
    }

    impl Drop for TrackedBuf {
        fn drop(&mut self) {
            self.ledger.live_bufs.fetch_sub(1, Ordering::Relaxed);
        }
    }

    struct TrackedRuntime {
        kind: MemoryKind,
        available: bool,
        fail_alloc: bool,
        ledger: Arc<Ledger>,
    }

    impl MemoryRuntime for TrackedRuntime {
        fn kind(&self) -> MemoryKind {
            self.kind
        }
        fn is_initialized(&self) -> bool {
            self.available
        }
        fn alloc_probe_buffer(&self, len: usize) -> crate::Result<Box<dyn ProbeBuffer>> {
            if self.fail_alloc {
                return Err(Error::OutOfMemory {
                    kind: self.kind,
                    len,
                });
            }
            self.ledger.live_bufs.fetch_add(1, Ordering::Relaxed);
            Ok(Box::new(TrackedBuf {
                mem: vec![0u8; len].into_boxed_slice(),
                ledger: Arc::clone(&self.ledger),
            }))
        }
        unsafe fn copy_from_device(&self, dst: &mut [u8], src: *const u8) -> crate::Result<()> {
            std::ptr::copy_nonoverlapping(src, dst.as_mut_ptr(), dst.len());
            Ok(())
        }
        unsafe fn copy_to_device(&self, dst: *mut u8, src: &[u8]) -> crate::Result<()> {
            std::ptr::copy_nonoverlapping(src.as_ptr(), dst, src.len());
            Ok(())
        }
    }

    struct TrackedMr {
        ledger: Arc<Ledger>,
        fail_dereg: bool,
    }

    impl ProbeMr for TrackedMr {
        fn deregister(self: Box<Self>) -> Result<()> {
            self.ledger.live_mrs.fetch_sub(1, Ordering::Relaxed);
            if self.fail_dereg {
                return Err(Error::Driver { code: -5 });
            }
            Ok(())
        }
    }

    struct TrackedDomain {
        caps: DeviceCaps,
        refuse_registration: bool,
        fail_dereg: bool,
        ledger: Arc<Ledger>,
    }

    impl TrackedDomain {
        fn new(ledger: Arc<Ledger>) -> Self {
            Self {
                caps: DeviceCaps {
                    rdma_read: true,
                    ..DeviceCaps::default()
                },
                refuse_registration: false,
                fail_dereg: false,
                ledger,
            }
        }
    }

    impl DomainContext for TrackedDomain {
        fn device_count(&self) -> usize {
            1
        }
        fn caps(&self) -> &DeviceCaps {
            &self.caps
        }
        fn register_probe(
            &self,
            _addr: usize,
            len: usize,
            _remote_read: bool,
        ) -> Option<Box<dyn ProbeMr>> {
            assert_eq!(len, PROBE_BUF_LEN);
            self.ledger.reg_attempts.fetch_add(1, Ordering::Relaxed);
            if self.refuse_registration {
                return None;
            }
            self.ledger.live_mrs.fetch_add(1, Ordering::Relaxed);
            Some(Box::new(TrackedMr {
                ledger: Arc::clone(&self.ledger),
                fail_dereg: self.fail_dereg,
            }))
        }
    }

    fn runtime(ledger: &Arc<Ledger>, kind: MemoryKind) -> TrackedRuntime {
        TrackedRuntime {
            kind,
            available: true,
            fail_alloc: false,
            ledger: Arc::clone(ledger),
        }
    }

    fn assert_no_leaks(ledger: &Ledger) {
        assert_eq!(ledger.live_bufs.load(Ordering::Relaxed), 0, "buffer leak");
        assert_eq!(ledger.live_mrs.load(Ordering::Relaxed), 0, "mr leak");
    }

    #[test]
    fn test_successful_probe_reports_p2p() {
        let ledger = Arc::new(Ledger::default());
        let domain = TrackedDomain::new(Arc::clone(&ledger));
        let rt = runtime(&ledger, MemoryKind::Cuda);

        let report = probe_kind(&rt, &domain).unwrap().unwrap();
        assert!(report.p2p_supported);
        assert_no_leaks(&ledger);
    }

    #[test]
    fn test_uninitialized_runtime_skips_without_touching_device() {
        let ledger = Arc::new(Ledger::default());
        let domain = TrackedDomain::new(Arc::clone(&ledger));
        let mut rt = runtime(&ledger, MemoryKind::Cuda);
        rt.available = false;

        assert!(probe_kind(&rt, &domain).unwrap().is_none());
        assert_eq!(ledger.reg_attempts.load(Ordering::Relaxed), 0);
        assert_no_leaks(&ledger);
    }

    #[test]
    fn test_missing_rdma_read_skips_read_only_kinds() {
        let ledger = Arc::new(Ledger::default());
        let mut domain = TrackedDomain::new(Arc::clone(&ledger));
        domain.caps.rdma_read = false;
        let rt = runtime(&ledger, MemoryKind::Neuron);

        assert!(probe_kind(&rt, &domain).unwrap().is_none());
        assert_eq!(ledger.reg_attempts.load(Ordering::Relaxed), 0);
        assert_no_leaks(&ledger);
    }

    #[test]
    fn test_alloc_failure_is_out_of_memory() {
        let ledger = Arc::new(Ledger::default());
        let domain = TrackedDomain::new(Arc::clone(&ledger));
        let mut rt = runtime(&ledger, MemoryKind::Cuda);
        rt.fail_alloc = true;

        let err = probe_kind(&rt, &domain).unwrap_err();
        assert!(matches!(err, Error::OutOfMemory { .. }));
        assert_no_leaks(&ledger);
    }

    #[test]
    fn test_registration_refusal_reports_no_p2p_and_frees_buffer() {
        let ledger = Arc::new(Ledger::default());
        let mut domain = TrackedDomain::new(Arc::clone(&ledger));
        domain.refuse_registration = true;
        let rt = runtime(&ledger, MemoryKind::Cuda);

        let report = probe_kind(&rt, &domain).unwrap().unwrap();
        assert!(!report.p2p_supported);
        assert_no_leaks(&ledger);
    }

    #[test]
    fn test_dereg_failure_propagates_driver_code_without_leak() {
        let ledger = Arc::new(Ledger::default());
        let mut domain = TrackedDomain::new(Arc::clone(&ledger));
        domain.fail_dereg = true;
        let rt = runtime(&ledger, MemoryKind::Cuda);

        let err = probe_kind(&rt, &domain).unwrap_err();
        assert!(matches!(err, Error::Driver { code: -5 }));
        assert_no_leaks(&ledger);
    }

    #[test]
    fn test_system_kind_trusts_device_without_probe() {
        let ledger = Arc::new(Ledger::default());
        let domain = TrackedDomain::new(Arc::clone(&ledger));
        let rt = runtime(&ledger, MemoryKind::System);

        let report = probe_kind(&rt, &domain).unwrap().unwrap();
        assert!(report.p2p_supported);
        assert_eq!(ledger.reg_attempts.load(Ordering::Relaxed), 0);
        assert_no_leaks(&ledger);
    }
}
