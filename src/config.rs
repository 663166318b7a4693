//! Size-parameter lookup for protocol threshold overrides.
//!
//! The transport does not parse config files itself; it only asks an opaque
//! key-value source for optional numeric knobs. The default source reads
//! `HMEM_`-prefixed environment variables (`HMEM_RUNT_SIZE`, ...).

use std::collections::HashMap;
use tracing::warn;

/// Override for the runting-read eager portion size.
pub const PARAM_RUNT_SIZE: &str = "runt_size";
/// Override for the largest medium-protocol message.
pub const PARAM_MAX_MEDIUM_MESSAGE_SIZE: &str = "inter_max_medium_message_size";
/// Override for the smallest message that must use the read protocol.
pub const PARAM_MIN_READ_MESSAGE_SIZE: &str = "inter_min_read_message_size";
/// Override for the smallest read/write that must use the read protocol.
pub const PARAM_MIN_READ_WRITE_SIZE: &str = "inter_min_read_write_size";
/// Caps the negotiated MTU used in the eager-capacity computation.
pub const PARAM_MTU_SIZE: &str = "mtu_size";

/// The four per-kind threshold knobs, in warning-message order.
pub(crate) const THRESHOLD_PARAMS: [&str; 4] = [
    PARAM_RUNT_SIZE,
    PARAM_MAX_MEDIUM_MESSAGE_SIZE,
    PARAM_MIN_READ_MESSAGE_SIZE,
    PARAM_MIN_READ_WRITE_SIZE,
];

/// Opaque source of optional numeric parameters.
pub trait ConfigSource {
    /// Look up a size parameter by name. `None` means "not set".
    fn size_param(&self, name: &str) -> Option<usize>;
}

/// Environment-backed config source.
///
/// A parameter `runt_size` is read from `<PREFIX>RUNT_SIZE`. Unparsable
/// values are ignored with a warning rather than failing initialization.
#[derive(Debug, Clone)]
pub struct EnvConfig {
    prefix: &'static str,
}

impl EnvConfig {
    pub fn new() -> Self {
        Self { prefix: "HMEM_" }
    }

    pub fn with_prefix(prefix: &'static str) -> Self {
        Self { prefix }
    }
}

impl Default for EnvConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigSource for EnvConfig {
    fn size_param(&self, name: &str) -> Option<usize> {
        let var = format!("{}{}", self.prefix, name.to_uppercase());
        let raw = std::env::var(&var).ok()?;
        match raw.trim().parse::<usize>() {
            Ok(v) => Some(v),
            Err(_) => {
                warn!("ignoring {var}={raw:?}: not a valid size");
                None
            }
        }
    }
}

/// A fixed map of parameters; useful for embedders and tests.
impl ConfigSource for HashMap<&'static str, usize> {
    fn size_param(&self, name: &str) -> Option<usize> {
        self.get(name).copied()
    }
}

/// Empty source: every parameter is unset.
impl ConfigSource for () {
    fn size_param(&self, _name: &str) -> Option<usize> {
        None
    }
}
