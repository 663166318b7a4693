//! Heterogeneous-memory (HMEM) capability registry and protocol selection.
//!
//! One [`HmemRegistry`] is populated per domain, before the domain is shared
//! with any progress thread. Population runs a capability probe for every
//! supported memory kind (see `probe`), derives the protocol thresholds for
//! the kinds that turned out usable (see `thresholds`), and records the
//! result in a fixed-size table. Afterwards the send path reads the table on
//! every message; the only mutation allowed post-init is the user's P2P
//! disable flag (see `p2p`), which is atomic so readers never see a torn
//! value.

mod copy;
mod p2p;
mod probe;
mod runtime;
pub mod thresholds;

pub use copy::{copy_from_hmem_iov, copy_to_hmem_iov, HmemIov, HmemIovMut};
pub use p2p::{P2pOpt, P2pPolicy};
pub use probe::{DeviceCaps, DomainContext, ProbeMr, ProbeReport, PROBE_BUF_LEN};
#[cfg(feature = "cuda")]
pub use runtime::CudaRuntime;
pub use runtime::{AbsentRuntime, HostRuntime, MemoryRuntime, ProbeBuffer, RuntimeSet};

use crate::config::ConfigSource;
use crate::error::{Error, Result};
use thresholds::ThresholdProfile;
use tracing::{debug, warn};

/// Capacity of the per-domain registry. Larger than the kinds we know about
/// today so new accelerator kinds can slot in without a layout change.
pub const MAX_MEMORY_KINDS: usize = 8;

/// The memory technologies the transport reasons about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemoryKind {
    /// Ordinary host RAM.
    System = 0,
    /// CUDA-class accelerator memory.
    Cuda = 1,
    /// Neuron-class accelerator memory.
    Neuron = 2,
    /// SynapseAi-class accelerator memory (long-read protocol only).
    SynapseAi = 3,
}

impl MemoryKind {
    pub const ALL: [MemoryKind; 4] = [
        MemoryKind::System,
        MemoryKind::Cuda,
        MemoryKind::Neuron,
        MemoryKind::SynapseAi,
    ];

    #[inline]
    pub(crate) fn index(self) -> usize {
        self as usize
    }
}

/// Wire protocol families the send path chooses between.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferProtocol {
    /// Full payload embedded in the initial packet(s).
    Eager,
    /// Multi-packet send for payloads above eager but below the read cutover.
    Medium,
    /// Small eager portion followed by an RDMA read of the remainder.
    RuntingRead,
    /// Pure RDMA-read transfer.
    LongRead,
}

/// Per-kind capability and threshold record.
///
/// Threshold fields are immutable once the registry is populated;
/// `p2p_disabled_by_user` is the single runtime-mutable field and is written
/// only by [`HmemRegistry::apply_p2p_policy`].
#[derive(Debug, Default)]
pub struct HmemInfo {
    pub(crate) initialized: bool,
    pub(crate) p2p_disabled_by_user: std::sync::atomic::AtomicBool,
    pub(crate) p2p_required_by_impl: bool,
    pub(crate) p2p_supported_by_device: bool,
    pub(crate) runt_size: usize,
    pub(crate) max_medium_msg_size: usize,
    pub(crate) min_read_msg_size: usize,
    pub(crate) min_read_write_size: usize,
}

impl HmemInfo {
    #[inline]
    pub fn initialized(&self) -> bool {
        self.initialized
    }

    #[inline]
    pub fn p2p_required_by_impl(&self) -> bool {
        self.p2p_required_by_impl
    }

    #[inline]
    pub fn p2p_supported_by_device(&self) -> bool {
        self.p2p_supported_by_device
    }

    #[inline]
    pub fn p2p_disabled_by_user(&self) -> bool {
        self.p2p_disabled_by_user
            .load(std::sync::atomic::Ordering::Relaxed)
    }

    #[inline]
    pub(crate) fn set_p2p_disabled(&self, disabled: bool) {
        self.p2p_disabled_by_user
            .store(disabled, std::sync::atomic::Ordering::Relaxed);
    }

    /// Whether the transport may move data for this kind without host staging.
    #[inline]
    pub fn p2p_available(&self) -> bool {
        self.p2p_supported_by_device && !self.p2p_disabled_by_user()
    }

    #[inline]
    pub fn runt_size(&self) -> usize {
        self.runt_size
    }

    #[inline]
    pub fn max_medium_msg_size(&self) -> usize {
        self.max_medium_msg_size
    }

    #[inline]
    pub fn min_read_msg_size(&self) -> usize {
        self.min_read_msg_size
    }

    #[inline]
    pub fn min_read_write_size(&self) -> usize {
        self.min_read_write_size
    }

    /// Pick the protocol for a `size`-byte message.
    ///
    /// `max_eager_payload` is the single-packet payload limit the caller
    /// negotiated for the connection (see [`thresholds::max_eager_payload`]).
    pub fn select_protocol(&self, size: usize, max_eager_payload: usize) -> TransferProtocol {
        if size >= self.min_read_msg_size {
            if self.runt_size > 0 {
                TransferProtocol::RuntingRead
            } else {
                TransferProtocol::LongRead
            }
        } else if size <= max_eager_payload {
            TransferProtocol::Eager
        } else if self.max_medium_msg_size > 0 && size <= self.max_medium_msg_size {
            TransferProtocol::Medium
        } else {
            TransferProtocol::LongRead
        }
    }
}

/// Result of registry population.
///
/// A kind failing to probe is not fatal: the kind stays unusable and the
/// last such error is reported here as a diagnostic. Only the absence of any
/// local device aborts population entirely.
#[derive(Debug)]
pub struct HmemInitReport {
    pub registry: HmemRegistry,
    pub last_error: Option<Error>,
}

/// Per-domain table mapping memory kind to capability/threshold record.
#[derive(Debug, Default)]
pub struct HmemRegistry {
    info: [HmemInfo; MAX_MEMORY_KINDS],
}

impl HmemRegistry {
    /// Probe every runtime in `runtimes` and populate the registry.
    ///
    /// Must run to completion before the owning domain is shared; afterwards
    /// the registry may be read concurrently without synchronization.
    pub fn init_all(
        domain: &dyn DomainContext,
        runtimes: &RuntimeSet,
        config: &dyn ConfigSource,
    ) -> Result<HmemInitReport> {
        if domain.device_count() == 0 {
            return Err(Error::NoDevice);
        }

        let mut registry = HmemRegistry::default();
        let mut last_error = None;

        for rt in runtimes.iter() {
            let kind = rt.kind();
            match probe::probe_kind(rt, domain) {
                Ok(Some(report)) => {
                    let info = &mut registry.info[kind.index()];
                    info.initialized = true;
                    info.p2p_required_by_impl = rt.p2p_required_by_impl();
                    info.p2p_supported_by_device = report.p2p_supported;
                    let profile = ThresholdProfile::for_kind(kind, report.p2p_supported);
                    thresholds::init_protocol_thresholds(
                        info,
                        kind,
                        profile,
                        domain.caps(),
                        config,
                    );
                    debug!(?kind, p2p = report.p2p_supported, "memory kind usable");
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(?kind, error = %e, "failed to probe memory kind");
                    last_error = Some(e);
                }
            }
        }

        Ok(HmemInitReport {
            registry,
            last_error,
        })
    }

    /// Look up a usable memory kind.
    pub fn get(&self, kind: MemoryKind) -> Result<&HmemInfo> {
        let info = self.entry(kind);
        if !info.initialized {
            return Err(Error::NotInitialized { kind });
        }
        Ok(info)
    }

    #[inline]
    pub(crate) fn entry(&self, kind: MemoryKind) -> &HmemInfo {
        &self.info[kind.index()]
    }

    #[cfg(test)]
    pub(crate) fn entry_mut(&mut self, kind: MemoryKind) -> &mut HmemInfo {
        &mut self.info[kind.index()]
    }
}
