use crate::hmem::MemoryKind;

pub type Result<T> = std::result::Result<T, Error>;

/// Which end of a copy ran out first.
///
/// Both outcomes surface as [`Error::Truncated`]; callers that need to tell a
/// short write apart from a genuine overflow can inspect the cause.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TruncationCause {
    /// The destination ran out of capacity before the source was consumed.
    DestinationFull,
    /// The source was exhausted before the destination capacity was.
    SourceExhausted,
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("no local RDMA device present")]
    NoDevice,

    #[error("failed to allocate {len}-byte probe buffer in {kind:?} memory")]
    OutOfMemory { kind: MemoryKind, len: usize },

    #[error("memory kind {kind:?} was not initialized on this system")]
    NotInitialized { kind: MemoryKind },

    #[error("p2p option {requested:?} is not supported for {kind:?}: {reason}")]
    Unsupported {
        kind: MemoryKind,
        requested: crate::hmem::P2pOpt,
        reason: &'static str,
    },

    #[error("{value} is not a valid p2p option")]
    InvalidArgument { value: u32 },

    #[error("copy truncated after {copied} bytes ({cause:?})")]
    Truncated {
        copied: usize,
        cause: TruncationCause,
    },

    #[error("device driver error (code {code})")]
    Driver { code: i32 },

    #[error("rdma device error: {0}")]
    Device(String),
}

impl Error {
    /// True for failures that disable a single memory kind without aborting
    /// registry initialization.
    pub fn is_soft(&self) -> bool {
        !matches!(self, Error::NoDevice | Error::Device(_))
    }
}
