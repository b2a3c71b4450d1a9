use std::fmt;
use std::ptr::NonNull;
use std::sync::Arc;

use crate::error::{GfxError, GfxResult};
use crate::hal::{Backend, BufferDesc, GpuAddress, HalError, HeapKind, RawBuffer};

/// A linear buffer. Destroyed on drop.
///
/// Dropping a buffer does not wait for the device. Keeping it alive until the
/// work that reads it has completed is the owner's job.
pub struct Buffer {
    backend: Arc<dyn Backend>,
    raw: RawBuffer,
    desc: BufferDesc,
}

impl Buffer {
    pub(crate) fn new(backend: Arc<dyn Backend>, desc: &BufferDesc) -> GfxResult<Self> {
        let raw = backend
            .create_buffer(desc)
            .map_err(GfxError::resource(desc.label))?;
        log::trace!("buffer `{}` created ({} bytes, {:?})", desc.label, desc.size, desc.heap);
        Ok(Self {
            backend,
            raw,
            desc: *desc,
        })
    }

    pub fn raw(&self) -> RawBuffer {
        self.raw
    }

    pub fn desc(&self) -> &BufferDesc {
        &self.desc
    }

    pub fn size(&self) -> u64 {
        self.desc.size
    }

    pub fn heap(&self) -> HeapKind {
        self.desc.heap
    }

    pub fn gpu_virtual_address(&self) -> GfxResult<GpuAddress> {
        self.backend
            .buffer_address(self.raw)
            .map_err(GfxError::resource("buffer address"))
    }

    pub(crate) fn map(&self) -> Result<NonNull<u8>, HalError> {
        self.backend.map_buffer(self.raw)
    }

    pub(crate) fn unmap(&self) {
        self.backend.unmap_buffer(self.raw);
    }

    /// Copies `len` bytes at `offset` back to the host.
    ///
    /// The caller makes sure no in-flight work still writes the buffer.
    pub fn read_back(&self, offset: u64, len: u64) -> GfxResult<Vec<u8>> {
        self.backend
            .read_buffer(self.raw, offset, len)
            .map_err(GfxError::ReadBack)
    }
}

impl fmt::Debug for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Buffer")
            .field("raw", &self.raw)
            .field("desc", &self.desc)
            .finish()
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        self.backend.destroy_buffer(self.raw);
    }
}
