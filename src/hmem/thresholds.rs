//! Default protocol-threshold policy and override handling.
//!
//! The thresholds govern the cutover points between the eager, medium,
//! runting-read and long-read protocols. They are computed once per domain
//! from the device capabilities and any user overrides, then frozen in the
//! registry.

use crate::config::{
    ConfigSource, PARAM_MAX_MEDIUM_MESSAGE_SIZE, PARAM_MIN_READ_MESSAGE_SIZE,
    PARAM_MIN_READ_WRITE_SIZE, PARAM_MTU_SIZE, PARAM_RUNT_SIZE, THRESHOLD_PARAMS,
};
use crate::hmem::probe::DeviceCaps;
use crate::hmem::{HmemInfo, MemoryKind};
use tracing::warn;

/// Largest medium-protocol message for host memory.
pub const DEFAULT_MAX_MEDIUM_MESSAGE_SIZE: usize = 65536;
/// Smallest host-memory message forced onto the read protocol.
pub const DEFAULT_MIN_READ_MESSAGE_SIZE: usize = 1 << 20;
/// Smallest host-memory read/write forced onto the read protocol.
pub const DEFAULT_MIN_READ_WRITE_SIZE: usize = 65536;
/// Eager portion of a runting read for accelerator memory.
pub const DEFAULT_RUNT_SIZE: usize = 307200;
/// Hard ceiling on the single-packet payload regardless of the device MTU.
pub const MTU_HARD_LIMIT: usize = 1 << 15;

/// Which default row applies to a kind, given its probe outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ThresholdProfile {
    /// Host memory: all four protocols, fully tunable.
    MultiProtocol,
    /// P2P-capable accelerator memory: no staging path, so anything that
    /// cannot embed inline in one packet must go over a read protocol.
    P2pAccelerator,
    /// Accelerator memory whose registration probe failed: host thresholds
    /// apply (the bounce-buffer path behaves like host memory), and the
    /// tuning knobs are not meaningful.
    HostFallback,
    /// Long-read-only kinds (SynapseAi-class).
    ReadOnly,
}

impl ThresholdProfile {
    pub(crate) fn for_kind(kind: MemoryKind, p2p_supported: bool) -> Self {
        match kind {
            MemoryKind::System => Self::MultiProtocol,
            MemoryKind::SynapseAi => Self::ReadOnly,
            _ if p2p_supported => Self::P2pAccelerator,
            _ => Self::HostFallback,
        }
    }
}

/// Largest payload that still fits eagerly in a single packet after the
/// worst-case wire header.
pub fn max_eager_payload(caps: &DeviceCaps, config: &dyn ConfigSource) -> usize {
    let mut mtu = caps.max_msg_size;
    if let Some(user) = config.size_param(PARAM_MTU_SIZE) {
        if user > 0 && user < mtu {
            mtu = user;
        }
    }
    mtu = mtu.min(MTU_HARD_LIMIT);
    mtu.saturating_sub(caps.max_wire_hdr_size)
}

/// Fill in the threshold fields of `info` for the given profile.
pub(crate) fn init_protocol_thresholds(
    info: &mut HmemInfo,
    kind: MemoryKind,
    profile: ThresholdProfile,
    caps: &DeviceCaps,
    config: &dyn ConfigSource,
) {
    match profile {
        ThresholdProfile::MultiProtocol => {
            // Runting is untested with host memory; leave it disabled.
            info.runt_size = 0;
            info.max_medium_msg_size = DEFAULT_MAX_MEDIUM_MESSAGE_SIZE;
            info.min_read_msg_size = DEFAULT_MIN_READ_MESSAGE_SIZE;
            info.min_read_write_size = DEFAULT_MIN_READ_WRITE_SIZE;
            apply_overrides(info, config);
        }
        ThresholdProfile::P2pAccelerator => {
            let read_min = max_eager_payload(caps, config) + 1;
            info.runt_size = DEFAULT_RUNT_SIZE;
            info.max_medium_msg_size = 0;
            info.min_read_msg_size = read_min;
            info.min_read_write_size = read_min;
            apply_overrides(info, config);
        }
        ThresholdProfile::HostFallback => {
            info.runt_size = 0;
            info.max_medium_msg_size = DEFAULT_MAX_MEDIUM_MESSAGE_SIZE;
            info.min_read_msg_size = DEFAULT_MIN_READ_MESSAGE_SIZE;
            info.min_read_write_size = DEFAULT_MIN_READ_WRITE_SIZE;
            reject_overrides(kind, config);
        }
        ThresholdProfile::ReadOnly => {
            info.runt_size = 0;
            info.max_medium_msg_size = 0;
            info.min_read_msg_size = 1;
            info.min_read_write_size = 1;
            reject_overrides(kind, config);
        }
    }
}

/// Overrides replace computed values verbatim; no re-validation against the
/// eager-capacity formula.
fn apply_overrides(info: &mut HmemInfo, config: &dyn ConfigSource) {
    if let Some(v) = config.size_param(PARAM_RUNT_SIZE) {
        info.runt_size = v;
    }
    if let Some(v) = config.size_param(PARAM_MAX_MEDIUM_MESSAGE_SIZE) {
        info.max_medium_msg_size = v;
    }
    if let Some(v) = config.size_param(PARAM_MIN_READ_MESSAGE_SIZE) {
        info.min_read_msg_size = v;
    }
    if let Some(v) = config.size_param(PARAM_MIN_READ_WRITE_SIZE) {
        info.min_read_write_size = v;
    }
}

/// Kinds with a single protocol path have nothing for the knobs to tune;
/// tell the user instead of silently applying them.
fn reject_overrides(kind: MemoryKind, config: &dyn ConfigSource) {
    let set: Vec<&str> = THRESHOLD_PARAMS
        .iter()
        .copied()
        .filter(|p| config.size_param(p).is_some())
        .collect();
    if !set.is_empty() {
        warn!(
            ?kind,
            params = ?set,
            "threshold overrides were set, but this memory kind supports a \
             single protocol path; the overrides will not be applied"
        );
    }
}
