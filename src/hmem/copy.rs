//! Bounds-checked copies between kind-tagged segment lists and contiguous
//! host buffers.
//!
//! Message assembly gathers a scattered, possibly mixed-kind IOV into one
//! bounce buffer; disassembly scatters a received buffer back out. Each
//! segment carries its memory kind so the copy dispatches through the right
//! [`MemoryRuntime`](crate::hmem::MemoryRuntime); segments without a kind
//! descriptor are host memory.
//! Neither direction ever writes past a buffer's capacity.

use crate::error::{Error, Result, TruncationCause};
use crate::hmem::runtime::RuntimeSet;
use crate::hmem::MemoryKind;
use std::marker::PhantomData;
use tracing::warn;

/// One source segment of a gather, tagged with its memory kind.
pub struct HmemIov<'a> {
    kind: MemoryKind,
    base: *const u8,
    len: usize,
    _marker: PhantomData<&'a [u8]>,
}

impl<'a> HmemIov<'a> {
    /// A host-memory segment.
    pub fn new(buf: &'a [u8]) -> Self {
        Self {
            kind: MemoryKind::System,
            base: buf.as_ptr(),
            len: buf.len(),
            _marker: PhantomData,
        }
    }

    /// A segment in `kind` memory.
    ///
    /// # Safety
    /// `base` must be valid for reads of `len` bytes in `kind` memory for
    /// the lifetime `'a`.
    pub unsafe fn from_raw(kind: MemoryKind, base: *const u8, len: usize) -> Self {
        Self {
            kind,
            base,
            len,
            _marker: PhantomData,
        }
    }

    #[inline]
    pub fn kind(&self) -> MemoryKind {
        self.kind
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// One destination segment of a scatter, tagged with its memory kind.
pub struct HmemIovMut<'a> {
    kind: MemoryKind,
    base: *mut u8,
    len: usize,
    _marker: PhantomData<&'a mut [u8]>,
}

impl<'a> HmemIovMut<'a> {
    /// A host-memory segment.
    pub fn new(buf: &'a mut [u8]) -> Self {
        Self {
            kind: MemoryKind::System,
            base: buf.as_mut_ptr(),
            len: buf.len(),
            _marker: PhantomData,
        }
    }

    /// A segment in `kind` memory.
    ///
    /// # Safety
    /// `base` must be valid for writes of `len` bytes in `kind` memory for
    /// the lifetime `'a`, and not aliased while this segment exists.
    pub unsafe fn from_raw(kind: MemoryKind, base: *mut u8, len: usize) -> Self {
        Self {
            kind,
            base,
            len,
            _marker: PhantomData,
        }
    }

    #[inline]
    pub fn kind(&self) -> MemoryKind {
        self.kind
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Gather a kind-tagged IOV into one contiguous host buffer.
///
/// Fails with `Truncated` before copying any segment that would overflow
/// `dst`; bytes of `dst` beyond the last copied offset are never written.
/// Returns the number of bytes copied.
pub fn copy_from_hmem_iov(
    runtimes: &RuntimeSet,
    dst: &mut [u8],
    iov: &[HmemIov<'_>],
) -> Result<usize> {
    let mut copied = 0;
    for seg in iov {
        if copied + seg.len() > dst.len() {
            warn!("iov is larger than the target buffer");
            return Err(Error::Truncated {
                copied,
                cause: TruncationCause::DestinationFull,
            });
        }
        let rt = runtimes
            .get(seg.kind())
            .ok_or(Error::NotInitialized { kind: seg.kind() })?;
        // SAFETY: the segment constructor guarantees `base` is valid for
        // `len` bytes in this kind's memory for the segment lifetime.
        unsafe { rt.copy_from_device(&mut dst[copied..copied + seg.len()], seg.base)? };
        copied += seg.len();
    }
    Ok(copied)
}

/// Scatter a contiguous host buffer into a kind-tagged IOV, consuming
/// destination capacity segment by segment.
///
/// Truncation is reported in both directions: `DestinationFull` when the
/// IOV ran out of capacity with source bytes left over (the copied prefix is
/// intact, the remainder was never written), and `SourceExhausted` when the
/// source ran dry with destination capacity left over (every source byte was
/// copied; the cause lets callers treat this as a short-write success).
/// Returns the number of bytes copied on exact fit.
pub fn copy_to_hmem_iov(
    runtimes: &RuntimeSet,
    iov: &mut [HmemIovMut<'_>],
    src: &[u8],
) -> Result<usize> {
    let mut offset = 0;
    let mut capacity = 0;
    for seg in iov.iter_mut() {
        capacity += seg.len();
        let n = seg.len().min(src.len() - offset);
        if n == 0 {
            continue;
        }
        let rt = runtimes
            .get(seg.kind())
            .ok_or(Error::NotInitialized { kind: seg.kind() })?;
        // SAFETY: the segment constructor guarantees `base` is valid for
        // `len` >= `n` bytes in this kind's memory for the segment lifetime.
        unsafe { rt.copy_to_device(seg.base, &src[offset..offset + n])? };
        offset += n;
    }

    if offset < src.len() {
        warn!("source buffer is larger than the target iov");
        return Err(Error::Truncated {
            copied: offset,
            cause: TruncationCause::DestinationFull,
        });
    }
    if capacity > src.len() {
        return Err(Error::Truncated {
            copied: offset,
            cause: TruncationCause::SourceExhausted,
        });
    }
    Ok(offset)
}
