use std::alloc::{self, Layout};
use std::ptr::NonNull;
use std::slice;

use super::HalError;

/// Zero-initialized host memory with a stable address.
///
/// Backs upload-heap mappings: the pointer handed out by `map_buffer` stays
/// valid until the allocation is dropped.
pub(crate) struct HostAllocation {
    ptr: NonNull<u8>,
    len: usize,
    layout: Layout,
}

// SAFETY: the allocation is plain bytes owned by this value. The device side
// (timeline thread, or the wgpu submit path) reads it under the backend mutex.
// The host writes through the mapped pointer without that mutex and relies on
// the contract documented on `MappedUploadBuffer`: no slot is written while a
// submission reading it is in flight. Any byte pattern is valid, so a broken
// contract yields stale device data, never an invalid value.
unsafe impl Send for HostAllocation {}
unsafe impl Sync for HostAllocation {}

impl HostAllocation {
    const ALIGN: usize = 256;

    pub(crate) fn zeroed(size: u64) -> Result<Self, HalError> {
        let len = usize::try_from(size).map_err(|_| HalError::OutOfMemory(size))?;
        let layout = Layout::from_size_align(len.max(1), Self::ALIGN)
            .map_err(|_| HalError::OutOfMemory(size))?;

        // SAFETY: layout has a non-zero size.
        let raw = unsafe { alloc::alloc_zeroed(layout) };
        let ptr = NonNull::new(raw).ok_or(HalError::OutOfMemory(size))?;

        Ok(Self { ptr, len, layout })
    }

    pub(crate) fn as_ptr(&self) -> NonNull<u8> {
        self.ptr
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    /// Views the whole allocation.
    ///
    /// # Safety
    /// No writes through a mapped pointer may happen while the slice is alive.
    pub(crate) unsafe fn as_slice(&self) -> &[u8] {
        // SAFETY: ptr is valid for len initialized bytes; the caller excludes writers.
        unsafe { slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    /// Copies `len` bytes at `offset` out of the allocation.
    pub(crate) fn read(&self, offset: u64, len: u64) -> Result<Vec<u8>, HalError> {
        let range = self.range(offset, len)?;
        // SAFETY: range is in bounds; device-side readers hold the backend lock.
        Ok(unsafe { self.as_slice() }[range].to_vec())
    }

    /// Copies a region from `src` into this allocation.
    pub(crate) fn copy_from(
        &self,
        dst_offset: u64,
        src: &HostAllocation,
        src_offset: u64,
        size: u64,
    ) -> Result<(), HalError> {
        let dst_range = self.range(dst_offset, size)?;
        let src_range = src.range(src_offset, size)?;
        if std::ptr::eq(self, src) {
            return Err(HalError::Unsupported("copy within one buffer".into()));
        }

        // SAFETY: both ranges are in bounds and belong to distinct allocations.
        unsafe {
            std::ptr::copy_nonoverlapping(
                src.ptr.as_ptr().add(src_range.start),
                self.ptr.as_ptr().add(dst_range.start),
                dst_range.len(),
            );
        }
        Ok(())
    }

    fn range(&self, offset: u64, len: u64) -> Result<std::ops::Range<usize>, HalError> {
        let end = offset
            .checked_add(len)
            .filter(|end| *end <= self.len as u64)
            .ok_or_else(|| {
                HalError::Validation(format!(
                    "range {offset}..{} exceeds allocation of {} bytes",
                    offset.saturating_add(len),
                    self.len
                ))
            })?;
        Ok(offset as usize..end as usize)
    }
}

impl Drop for HostAllocation {
    fn drop(&mut self) {
        // SAFETY: ptr was allocated with exactly this layout.
        unsafe { alloc::dealloc(self.ptr.as_ptr(), self.layout) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zeroed_and_aligned() {
        let mem = HostAllocation::zeroed(300).unwrap();
        assert_eq!(mem.len(), 300);
        assert_eq!(mem.as_ptr().as_ptr() as usize % 256, 0);
        assert!(mem.read(0, 300).unwrap().iter().all(|b| *b == 0));
    }

    #[test]
    fn copies_between_allocations() {
        let src = HostAllocation::zeroed(8).unwrap();
        unsafe { src.as_ptr().as_ptr().add(2).write(7) };
        let dst = HostAllocation::zeroed(8).unwrap();
        dst.copy_from(4, &src, 2, 2).unwrap();
        assert_eq!(dst.read(0, 8).unwrap(), vec![0, 0, 0, 0, 7, 0, 0, 0]);
    }

    #[test]
    fn rejects_out_of_range() {
        let mem = HostAllocation::zeroed(4).unwrap();
        assert!(matches!(mem.read(2, 3), Err(HalError::Validation(_))));
        assert!(mem.read(u64::MAX, 2).is_err());
    }
}
