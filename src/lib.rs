//! Heterogeneous-memory support for an RDMA transport.
//!
//! The crate answers one question per memory technology (host RAM, CUDA,
//! Neuron, SynapseAI): can the local device reach that memory peer-to-peer,
//! and given the answer, at which message sizes should the transport switch
//! between its eager, medium and read protocols. The answers are probed once
//! per domain and frozen in an [`hmem::HmemRegistry`].
//!
//! Device access goes through the [`hmem::DomainContext`] trait; the
//! `rdma` feature provides a libibverbs-backed implementation in
//! [`drivers::rdma`]. Everything else runs devicelessly and is exercised by
//! the test suite with in-memory fakes.

pub mod config;
pub mod error;
pub mod hmem;

#[cfg(feature = "rdma")]
pub mod drivers;

pub use error::{Error, Result, TruncationCause};
