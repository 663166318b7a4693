//! Runtime P2P policy control.
//!
//! Applications adjust peer-to-peer usage per memory kind through a single
//! explicit command, [`HmemRegistry::apply_p2p_policy`]; the transition
//! table below is the only place the user-disable flag is written.

use crate::error::{Error, Result};
use crate::hmem::{HmemRegistry, MemoryKind};

/// Requested peer-to-peer policy. Raw values match the fi_setopt-style
/// control interface this replaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum P2pOpt {
    /// P2P may be used.
    Enabled = 1,
    /// P2P must be used; fail if the device cannot.
    Required = 2,
    /// P2P should be preferred when available.
    Preferred = 3,
    /// P2P must not be used.
    Disabled = 4,
}

impl P2pOpt {
    /// Decode a raw option value from a C-style control boundary.
    pub fn from_raw(value: u32) -> Result<Self> {
        match value {
            1 => Ok(Self::Enabled),
            2 => Ok(Self::Required),
            3 => Ok(Self::Preferred),
            4 => Ok(Self::Disabled),
            _ => Err(Error::InvalidArgument { value }),
        }
    }
}

/// Outcome of a successfully applied policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum P2pPolicy {
    /// P2P may be used for this kind.
    Active,
    /// The user disabled P2P; transfers stage through host memory.
    DisabledByUser,
}

impl HmemRegistry {
    /// Validate a requested P2P policy against one kind's capability record
    /// and apply it. The disabled flag is written only when the request is
    /// accepted.
    pub fn apply_p2p_policy(&self, kind: MemoryKind, opt: P2pOpt) -> Result<P2pPolicy> {
        let info = self.entry(kind);
        if !info.initialized {
            return Err(Error::NotInitialized { kind });
        }

        match opt {
            P2pOpt::Required => {
                if !info.p2p_supported_by_device {
                    return Err(Error::Unsupported {
                        kind,
                        requested: opt,
                        reason: "device cannot register this memory for p2p",
                    });
                }
                info.set_p2p_disabled(false);
                Ok(P2pPolicy::Active)
            }
            // ENABLED means p2p may be used, PREFERRED that it should be
            // preferred when available. Neither demands device support nor
            // conflicts with an implementation requirement, so once the kind
            // is initialized they always succeed.
            P2pOpt::Enabled | P2pOpt::Preferred => {
                info.set_p2p_disabled(false);
                Ok(P2pPolicy::Active)
            }
            P2pOpt::Disabled => {
                if info.p2p_required_by_impl {
                    return Err(Error::Unsupported {
                        kind,
                        requested: opt,
                        reason: "implementation requires p2p for this memory kind",
                    });
                }
                info.set_p2p_disabled(true);
                Ok(P2pPolicy::DisabledByUser)
            }
        }
    }

    /// [`apply_p2p_policy`](Self::apply_p2p_policy) for a raw option value.
    pub fn apply_p2p_policy_raw(&self, kind: MemoryKind, value: u32) -> Result<P2pPolicy> {
        self.apply_p2p_policy(kind, P2pOpt::from_raw(value)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL_OPTS: [P2pOpt; 4] = [
        P2pOpt::Required,
        P2pOpt::Preferred,
        P2pOpt::Enabled,
        P2pOpt::Disabled,
    ];

    fn registry(initialized: bool, supported: bool, required: bool) -> HmemRegistry {
        let mut r = HmemRegistry::default();
        let info = r.entry_mut(MemoryKind::Cuda);
        info.initialized = initialized;
        info.p2p_supported_by_device = supported;
        info.p2p_required_by_impl = required;
        r
    }

    #[test]
    fn test_uninitialized_kind_rejects_all_modes() {
        let r = registry(false, true, false);
        for opt in ALL_OPTS {
            let err = r.apply_p2p_policy(MemoryKind::Cuda, opt).unwrap_err();
            assert!(matches!(err, Error::NotInitialized { .. }), "{opt:?}");
            assert!(!r.entry(MemoryKind::Cuda).p2p_disabled_by_user());
        }
    }

    #[test]
    fn test_supported_not_required_accepts_everything() {
        let r = registry(true, true, false);
        assert_eq!(
            r.apply_p2p_policy(MemoryKind::Cuda, P2pOpt::Required).unwrap(),
            P2pPolicy::Active
        );
        assert_eq!(
            r.apply_p2p_policy(MemoryKind::Cuda, P2pOpt::Disabled).unwrap(),
            P2pPolicy::DisabledByUser
        );
        assert!(r.entry(MemoryKind::Cuda).p2p_disabled_by_user());
        // re-enabling clears the flag
        assert_eq!(
            r.apply_p2p_policy(MemoryKind::Cuda, P2pOpt::Enabled).unwrap(),
            P2pPolicy::Active
        );
        assert!(!r.entry(MemoryKind::Cuda).p2p_disabled_by_user());
    }

    #[test]
    fn test_required_by_impl_cannot_be_disabled() {
        let r = registry(true, true, true);
        r.entry(MemoryKind::Cuda).set_p2p_disabled(false);
        let err = r
            .apply_p2p_policy(MemoryKind::Cuda, P2pOpt::Disabled)
            .unwrap_err();
        assert!(matches!(err, Error::Unsupported { .. }));
        // failed requests never mutate the flag
        assert!(!r.entry(MemoryKind::Cuda).p2p_disabled_by_user());
        assert_eq!(
            r.apply_p2p_policy(MemoryKind::Cuda, P2pOpt::Required).unwrap(),
            P2pPolicy::Active
        );
    }

    #[test]
    fn test_unsupported_device_cannot_be_required() {
        let r = registry(true, false, false);
        let err = r
            .apply_p2p_policy(MemoryKind::Cuda, P2pOpt::Required)
            .unwrap_err();
        assert!(matches!(err, Error::Unsupported { .. }));
        // advisory modes still succeed without device support
        assert_eq!(
            r.apply_p2p_policy(MemoryKind::Cuda, P2pOpt::Preferred).unwrap(),
            P2pPolicy::Active
        );
        assert_eq!(
            r.apply_p2p_policy(MemoryKind::Cuda, P2pOpt::Disabled).unwrap(),
            P2pPolicy::DisabledByUser
        );
    }

    #[test]
    fn test_advisory_modes_always_clear_disable_flag() {
        for supported in [true, false] {
            for required in [true, false] {
                let r = registry(true, supported, required);
                r.entry(MemoryKind::Cuda).set_p2p_disabled(true);
                for opt in [P2pOpt::Preferred, P2pOpt::Enabled] {
                    assert_eq!(
                        r.apply_p2p_policy(MemoryKind::Cuda, opt).unwrap(),
                        P2pPolicy::Active
                    );
                    assert!(!r.entry(MemoryKind::Cuda).p2p_disabled_by_user());
                    r.entry(MemoryKind::Cuda).set_p2p_disabled(true);
                }
            }
        }
    }

    #[test]
    fn test_raw_decoding() {
        assert_eq!(P2pOpt::from_raw(1).unwrap(), P2pOpt::Enabled);
        assert_eq!(P2pOpt::from_raw(2).unwrap(), P2pOpt::Required);
        assert_eq!(P2pOpt::from_raw(3).unwrap(), P2pOpt::Preferred);
        assert_eq!(P2pOpt::from_raw(4).unwrap(), P2pOpt::Disabled);
        assert!(matches!(
            P2pOpt::from_raw(0).unwrap_err(),
            Error::InvalidArgument { value: 0 }
        ));
        assert!(matches!(
            P2pOpt::from_raw(5).unwrap_err(),
            Error::InvalidArgument { value: 5 }
        ));
    }

    #[test]
    fn test_raw_entrypoint_applies_policy() {
        let r = registry(true, true, false);
        assert_eq!(
            r.apply_p2p_policy_raw(MemoryKind::Cuda, 4).unwrap(),
            P2pPolicy::DisabledByUser
        );
        assert!(r.entry(MemoryKind::Cuda).p2p_disabled_by_user());
    }
}
