use std::marker::PhantomData;
use std::ptr::{self, NonNull};
use std::slice;

use bytemuck::Pod;

use super::{ConstantBufferAligned, ElementLayout, Tight};
use crate::device::Device;
use crate::error::{GfxError, GfxResult};
use crate::hal::{BufferDesc, GpuAddress, HalError, HeapKind, ResourceState};
use crate::resource::Buffer;

/// Upload-heap buffer of `len` elements of `T`, mapped for its whole lifetime.
///
/// # Synchronization contract
///
/// Writes are plain memory copies into the mapping. They take no lock and are
/// not ordered against the device. The device reads the mapping only while
/// executing submitted work, so:
///
/// - a slot must not be written while a submission that reads it is in flight.
///   Wait on a [`Label`](crate::sync::Label) put after that submission first;
/// - writes made before
///   [`Queue::execute_command_lists`](crate::command::Queue::execute_command_lists)
///   are visible to the work it submits.
///
/// Breaking the first rule lets the device observe a mix of old and new bytes.
pub struct MappedUploadBuffer<T: Pod, L: ElementLayout = Tight> {
    buffer: Buffer,
    mapped: NonNull<u8>,
    len: usize,
    stride: u64,
    _marker: PhantomData<(T, L)>,
}

/// Vertex/staging data, packed.
pub type UploadBuffer<T> = MappedUploadBuffer<T, Tight>;

/// Per-object shader constants, one 256-byte aligned slot per element.
pub type ConstantBuffer<T> = MappedUploadBuffer<T, ConstantBufferAligned>;

impl<T: Pod, L: ElementLayout> MappedUploadBuffer<T, L> {
    pub fn new(device: &Device, len: usize) -> GfxResult<Self> {
        let stride = L::stride(size_of::<T>());
        let size = (len as u64)
            .checked_mul(stride)
            .ok_or(GfxError::ResourceCreation {
                what: "upload buffer",
                source: HalError::OutOfMemory(u64::MAX),
            })?;
        if len == 0 || stride == 0 {
            return Err(GfxError::ResourceCreation {
                what: "upload buffer",
                source: HalError::Unsupported(format!(
                    "{len} elements of {} bytes",
                    size_of::<T>()
                )),
            });
        }

        let buffer = device.create_buffer(&BufferDesc {
            label: "upload buffer",
            size,
            heap: HeapKind::Upload,
            initial_state: ResourceState::GenericRead,
        })?;
        let mapped = buffer
            .map()
            .map_err(GfxError::resource("upload buffer mapping"))?;

        Ok(Self {
            buffer,
            mapped,
            len,
            stride,
            _marker: PhantomData,
        })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn stride(&self) -> u64 {
        self.stride
    }

    pub fn size_in_bytes(&self) -> u64 {
        self.stride * self.len as u64
    }

    pub fn buffer(&self) -> &Buffer {
        &self.buffer
    }

    /// Copies `value` into slot `index`.
    pub fn upload_value(&mut self, index: usize, value: &T) -> GfxResult<()> {
        self.check(index)?;
        // SAFETY: index was just checked.
        unsafe { self.upload_value_unchecked(index, value) };
        Ok(())
    }

    /// Copies `value` into slot `index` without a bounds check.
    ///
    /// # Safety
    /// `index` must be less than `self.len()`.
    pub unsafe fn upload_value_unchecked(&mut self, index: usize, value: &T) {
        debug_assert!(index < self.len, "slot {index} of {}", self.len);
        let bytes = bytemuck::bytes_of(value);
        // SAFETY: the slot lies inside the mapping and `&mut self` excludes other CPU access.
        unsafe {
            ptr::copy_nonoverlapping(
                bytes.as_ptr(),
                self.mapped.as_ptr().add(index * self.stride as usize),
                bytes.len(),
            );
        }
    }

    /// Bytes of slot `index` as currently written (without stride padding).
    pub fn slot_bytes(&self, index: usize) -> GfxResult<&[u8]> {
        self.check(index)?;
        // SAFETY: in bounds; the device only reads the mapping.
        Ok(unsafe {
            slice::from_raw_parts(
                self.mapped.as_ptr().add(index * self.stride as usize),
                size_of::<T>(),
            )
        })
    }

    pub fn read_value(&self, index: usize) -> GfxResult<T> {
        Ok(bytemuck::pod_read_unaligned(self.slot_bytes(index)?))
    }

    pub fn gpu_virtual_address_base(&self) -> GfxResult<GpuAddress> {
        self.buffer.gpu_virtual_address()
    }

    /// Device address of slot `index`.
    pub fn gpu_virtual_address(&self, index: usize) -> GfxResult<GpuAddress> {
        self.check(index)?;
        Ok(self
            .gpu_virtual_address_base()?
            .offset(index as u64 * self.stride))
    }

    fn check(&self, index: usize) -> GfxResult<()> {
        if index < self.len {
            Ok(())
        } else {
            Err(GfxError::IndexOutOfBounds {
                index,
                len: self.len,
            })
        }
    }
}

impl<T: Pod, L: ElementLayout> Drop for MappedUploadBuffer<T, L> {
    fn drop(&mut self) {
        self.buffer.unmap();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DeviceConfig;

    #[repr(C)]
    #[derive(Debug, Copy, Clone, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
    struct Constants64([f32; 16]);

    #[repr(C)]
    #[derive(Debug, Copy, Clone, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
    struct Constants300 {
        head: [u8; 256],
        mid: [u8; 32],
        tail: [u8; 12],
    }

    fn device() -> Device {
        Device::create(&DeviceConfig::soft()).unwrap()
    }

    #[test]
    fn constant_buffer_slots_are_256_aligned() {
        let device = device();
        let small = ConstantBuffer::<Constants64>::new(&device, 3).unwrap();
        assert_eq!(small.stride(), 256);
        assert_eq!(small.size_in_bytes(), 768);

        let large = ConstantBuffer::<Constants300>::new(&device, 2).unwrap();
        assert_eq!(large.stride(), 512);

        let base = small.gpu_virtual_address_base().unwrap();
        assert_eq!(small.gpu_virtual_address(2).unwrap(), base.offset(512));
    }

    #[test]
    fn element_count_overflow_is_a_creation_error() {
        let device = device();
        let err = UploadBuffer::<u32>::new(&device, usize::MAX).err().unwrap();
        assert!(matches!(
            err,
            GfxError::ResourceCreation {
                source: HalError::OutOfMemory(_),
                ..
            }
        ));
    }

    #[test]
    fn writes_before_submission_reach_the_device() {
        use crate::sync::CompletionFence;

        let device = device();
        let queue = device.create_queue().unwrap();
        let mut fence = CompletionFence::new(&device).unwrap();
        let allocator = device.create_command_allocator();
        let mut list = device.create_command_list(&allocator).unwrap();

        let mut upload = UploadBuffer::<u32>::new(&device, 4).unwrap();
        let target = device
            .create_buffer(&BufferDesc {
                label: "target",
                size: 16,
                heap: HeapKind::Default,
                initial_state: ResourceState::CopyDest,
            })
            .unwrap();
        for (slot, value) in [7u32, 8, 9, 10].iter().enumerate() {
            upload.upload_value(slot, value).unwrap();
        }
        list.copy_buffer_region(&target, 0, upload.buffer(), 0, 16).unwrap();
        list.close().unwrap();
        queue.execute_command_lists(&[&list]).unwrap();
        let label = fence.put_label(&queue).unwrap();
        fence.wait_for_label(label).unwrap();

        // Rewriting after the wait cannot disturb the finished copy.
        upload.upload_value(0, &99).unwrap();
        let copied = target.read_back(0, 16).unwrap();
        let words: Vec<u32> = copied
            .chunks_exact(4)
            .map(|w| u32::from_ne_bytes([w[0], w[1], w[2], w[3]]))
            .collect();
        assert_eq!(words, [7, 8, 9, 10]);
        assert_eq!(upload.read_value(0).unwrap(), 99);
    }

    #[test]
    fn tight_buffers_pack_elements() {
        let device = device();
        let buf = UploadBuffer::<[f32; 3]>::new(&device, 4).unwrap();
        assert_eq!(buf.stride(), 12);
        assert_eq!(buf.buffer().size(), 48);
    }

    #[test]
    fn upload_then_read_back() {
        let device = device();
        let mut buf = ConstantBuffer::<Constants64>::new(&device, 2).unwrap();
        let value = Constants64(std::array::from_fn(|i| i as f32));

        buf.upload_value(1, &value).unwrap();
        assert_eq!(buf.read_value(1).unwrap(), value);
        assert_eq!(buf.read_value(0).unwrap(), Constants64([0.0; 16]));

        // Same bytes are visible to the device at slot offset.
        let raw = buf.buffer().read_back(256, 64).unwrap();
        assert_eq!(raw, bytemuck::bytes_of(&value));
    }

    #[test]
    fn out_of_range_slots_are_rejected() {
        let device = device();
        let mut buf = UploadBuffer::<u32>::new(&device, 2).unwrap();
        assert!(matches!(
            buf.upload_value(2, &7),
            Err(GfxError::IndexOutOfBounds { index: 2, len: 2 })
        ));
        assert!(buf.gpu_virtual_address(5).is_err());
        assert!(buf.slot_bytes(2).is_err());
    }

    #[test]
    fn zero_elements_is_an_error() {
        let device = device();
        assert!(matches!(
            UploadBuffer::<u32>::new(&device, 0),
            Err(GfxError::ResourceCreation { .. })
        ));
    }
}
