//! Per-kind memory runtimes.
//!
//! A [`MemoryRuntime`] bridges one memory technology to the probe and copy
//! paths: it allocates the registration test buffer in that memory and moves
//! bytes between it and host buffers. Kinds whose runtime is not present in
//! the process are represented by [`AbsentRuntime`], which soft-skips
//! uniformly instead of being compiled out.

use crate::error::{Error, Result};
use crate::hmem::{MemoryKind, MAX_MEMORY_KINDS};

/// Probe test buffer in some memory kind. Freed on drop.
pub trait ProbeBuffer {
    fn addr(&self) -> usize;
    fn len(&self) -> usize;
}

/// Bridges one memory kind to the capability probe and the copy mover.
pub trait MemoryRuntime: Send + Sync {
    fn kind(&self) -> MemoryKind;

    /// Whether the underlying runtime/driver is usable in this process.
    /// `false` is not an error; the kind is skipped.
    fn is_initialized(&self) -> bool;

    /// Static property of the kind: true when the transport has no staged
    /// fallback and cannot function without P2P.
    fn p2p_required_by_impl(&self) -> bool {
        matches!(self.kind(), MemoryKind::Neuron | MemoryKind::SynapseAi)
    }

    /// Kinds reachable only through RDMA read need the device to support it.
    fn requires_device_rdma_read(&self) -> bool {
        matches!(self.kind(), MemoryKind::Neuron | MemoryKind::SynapseAi)
    }

    /// Whether usability must be proven by registering a test buffer.
    /// System memory and SynapseAi-class memory trust the device without one.
    fn needs_registration_probe(&self) -> bool {
        !matches!(self.kind(), MemoryKind::System | MemoryKind::SynapseAi)
    }

    /// Allocate a `len`-byte test buffer in this kind's memory.
    fn alloc_probe_buffer(&self, len: usize) -> Result<Box<dyn ProbeBuffer>>;

    /// Copy `dst.len()` bytes out of this kind's memory at `src`.
    ///
    /// # Safety
    /// `src` must be valid for `dst.len()` bytes in this kind's memory.
    unsafe fn copy_from_device(&self, dst: &mut [u8], src: *const u8) -> Result<()>;

    /// Copy `src` into this kind's memory at `dst`.
    ///
    /// # Safety
    /// `dst` must be valid for `src.len()` bytes in this kind's memory.
    unsafe fn copy_to_device(&self, dst: *mut u8, src: &[u8]) -> Result<()>;
}

/// Host RAM. Always initialized; copies are plain memcpy.
pub struct HostRuntime;

struct HostProbeBuffer(Box<[u8]>);

impl ProbeBuffer for HostProbeBuffer {
    fn addr(&self) -> usize {
        self.0.as_ptr() as usize
    }
    fn len(&self) -> usize {
        self.0.len()
    }
}

impl MemoryRuntime for HostRuntime {
    fn kind(&self) -> MemoryKind {
        MemoryKind::System
    }

    fn is_initialized(&self) -> bool {
        true
    }

    fn alloc_probe_buffer(&self, len: usize) -> Result<Box<dyn ProbeBuffer>> {
        Ok(Box::new(HostProbeBuffer(vec![0u8; len].into_boxed_slice())))
    }

    unsafe fn copy_from_device(&self, dst: &mut [u8], src: *const u8) -> Result<()> {
        std::ptr::copy_nonoverlapping(src, dst.as_mut_ptr(), dst.len());
        Ok(())
    }

    unsafe fn copy_to_device(&self, dst: *mut u8, src: &[u8]) -> Result<()> {
        std::ptr::copy_nonoverlapping(src.as_ptr(), dst, src.len());
        Ok(())
    }
}

/// Stand-in for a memory kind whose runtime is not present in this build or
/// on this system. Never initialized, so the probe skips it.
pub struct AbsentRuntime {
    kind: MemoryKind,
}

impl AbsentRuntime {
    pub fn new(kind: MemoryKind) -> Self {
        Self { kind }
    }
}

impl MemoryRuntime for AbsentRuntime {
    fn kind(&self) -> MemoryKind {
        self.kind
    }

    fn is_initialized(&self) -> bool {
        false
    }

    fn alloc_probe_buffer(&self, len: usize) -> Result<Box<dyn ProbeBuffer>> {
        Err(Error::OutOfMemory {
            kind: self.kind,
            len,
        })
    }

    unsafe fn copy_from_device(&self, _dst: &mut [u8], _src: *const u8) -> Result<()> {
        Err(Error::NotInitialized { kind: self.kind })
    }

    unsafe fn copy_to_device(&self, _dst: *mut u8, _src: &[u8]) -> Result<()> {
        Err(Error::NotInitialized { kind: self.kind })
    }
}

/// CUDA device memory via the driver API. The driver is loaded dynamically;
/// on machines without one the runtime simply reports uninitialized.
#[cfg(feature = "cuda")]
pub struct CudaRuntime {
    dev: Option<std::sync::Arc<cudarc::driver::CudaDevice>>,
}

#[cfg(feature = "cuda")]
impl CudaRuntime {
    pub fn new() -> Self {
        Self {
            dev: cudarc::driver::CudaDevice::new(0).ok(),
        }
    }
}

#[cfg(feature = "cuda")]
impl Default for CudaRuntime {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(feature = "cuda")]
struct CudaProbeBuffer {
    slice: cudarc::driver::CudaSlice<u8>,
}

#[cfg(feature = "cuda")]
impl ProbeBuffer for CudaProbeBuffer {
    fn addr(&self) -> usize {
        use cudarc::driver::DevicePtr;
        *self.slice.device_ptr() as usize
    }
    fn len(&self) -> usize {
        self.slice.len()
    }
}

#[cfg(feature = "cuda")]
impl MemoryRuntime for CudaRuntime {
    fn kind(&self) -> MemoryKind {
        MemoryKind::Cuda
    }

    fn is_initialized(&self) -> bool {
        self.dev.is_some()
    }

    fn alloc_probe_buffer(&self, len: usize) -> Result<Box<dyn ProbeBuffer>> {
        let dev = self.dev.as_ref().ok_or(Error::NotInitialized {
            kind: MemoryKind::Cuda,
        })?;
        let slice = dev.alloc_zeros::<u8>(len).map_err(|e| {
            tracing::warn!("failed to allocate CUDA probe buffer: {e}");
            Error::OutOfMemory {
                kind: MemoryKind::Cuda,
                len,
            }
        })?;
        Ok(Box::new(CudaProbeBuffer { slice }))
    }

    unsafe fn copy_from_device(&self, dst: &mut [u8], src: *const u8) -> Result<()> {
        cudarc::driver::result::memcpy_dtoh_sync(dst, src as u64)
            .map_err(|e| Error::Driver { code: e.0 as i32 })
    }

    unsafe fn copy_to_device(&self, dst: *mut u8, src: &[u8]) -> Result<()> {
        cudarc::driver::result::memcpy_htod_sync(dst as u64, src)
            .map_err(|e| Error::Driver { code: e.0 as i32 })
    }
}

/// Runtime table consulted by registry population and the copy mover.
///
/// Selected at runtime rather than by conditional compilation; kinds without
/// a runtime get an [`AbsentRuntime`] (or no slot at all) and are skipped.
#[derive(Default)]
pub struct RuntimeSet {
    slots: [Option<Box<dyn MemoryRuntime>>; MAX_MEMORY_KINDS],
}

impl RuntimeSet {
    pub fn empty() -> Self {
        Self::default()
    }

    /// The runtimes available to this build: host memory always, CUDA when
    /// compiled in, absent placeholders for the rest.
    pub fn detect() -> Self {
        let mut set = Self::empty();
        set.insert(Box::new(HostRuntime));
        #[cfg(feature = "cuda")]
        set.insert(Box::new(CudaRuntime::new()));
        #[cfg(not(feature = "cuda"))]
        set.insert(Box::new(AbsentRuntime::new(MemoryKind::Cuda)));
        set.insert(Box::new(AbsentRuntime::new(MemoryKind::Neuron)));
        set.insert(Box::new(AbsentRuntime::new(MemoryKind::SynapseAi)));
        set
    }

    /// Register (or replace) the runtime for its kind.
    pub fn insert(&mut self, rt: Box<dyn MemoryRuntime>) {
        let idx = rt.kind().index();
        self.slots[idx] = Some(rt);
    }

    pub fn get(&self, kind: MemoryKind) -> Option<&dyn MemoryRuntime> {
        self.slots[kind.index()].as_deref()
    }

    pub fn iter(&self) -> impl Iterator<Item = &dyn MemoryRuntime> {
        self.slots.iter().filter_map(|s| s.as_deref())
    }
}
