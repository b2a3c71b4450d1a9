use std::fmt;
use std::ptr;
use std::sync::Arc;

use crate::command::{CommandAllocator, CommandList, Queue};
use crate::config::DeviceConfig;
use crate::descriptor::{DescriptorHeap, DescriptorKind};
use crate::error::{GfxError, GfxResult, SubmissionError};
use crate::hal::hw::{WgpuBackend, WgpuOptions};
use crate::hal::soft::{SoftBackend, SoftOptions};
use crate::hal::{
    AdapterInfo, Backend, BackendKind, BufferDesc, GpuAddress, HalError, HeapKind, PresentTarget,
    ResourceId, ResourceState, SwapChainDesc, TextureDesc,
};
use crate::present::SwapChain;
use crate::resource::{Buffer, Texture};

/// The logical device: factory for every other GPU object.
///
/// Immutable after creation. Objects it creates keep the backend alive on
/// their own, so they may outlive the `Device` value.
pub struct Device {
    backend: Arc<dyn Backend>,
    info: AdapterInfo,
    config: DeviceConfig,
}

impl Device {
    /// Opens the backend named by `config`.
    pub fn create(config: &DeviceConfig) -> GfxResult<Self> {
        let backend: Arc<dyn Backend> = match config.backend {
            BackendKind::Soft => Arc::new(
                SoftBackend::new(SoftOptions {
                    latency: config.soft_latency,
                })
                .map_err(GfxError::DeviceCreation)?,
            ),
            BackendKind::Wgpu => Arc::new(
                WgpuBackend::new(&WgpuOptions {
                    power_preference: config.power_preference,
                    ..WgpuOptions::default()
                })
                .map_err(GfxError::DeviceCreation)?,
            ),
        };
        Ok(Self::from_backend(backend, config.clone()))
    }

    /// Wraps an already created backend.
    pub fn from_backend(backend: Arc<dyn Backend>, config: DeviceConfig) -> Self {
        let info = backend.adapter_info();
        log::info!("device: {} ({}, {})", info.name, info.backend, info.api);
        Self {
            backend,
            info,
            config,
        }
    }

    pub fn adapter_info(&self) -> &AdapterInfo {
        &self.info
    }

    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    pub(crate) fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    pub fn create_queue(&self) -> GfxResult<Queue> {
        Queue::new(Arc::clone(&self.backend))
    }

    pub fn create_buffer(&self, desc: &BufferDesc) -> GfxResult<Buffer> {
        Buffer::new(Arc::clone(&self.backend), desc)
    }

    pub fn create_texture(&self, desc: &TextureDesc) -> GfxResult<Texture> {
        Texture::new(Arc::clone(&self.backend), desc)
    }

    pub fn create_command_allocator(&self) -> CommandAllocator {
        CommandAllocator::new(Arc::clone(&self.backend))
    }

    /// New lists are returned recording, bound to `allocator`.
    ///
    /// Fails if another list is still recording into `allocator`.
    pub fn create_command_list(&self, allocator: &CommandAllocator) -> GfxResult<CommandList> {
        CommandList::new(allocator)
    }

    pub fn create_swap_chain(
        &self,
        queue: &Queue,
        target: &PresentTarget,
        desc: &SwapChainDesc,
    ) -> GfxResult<SwapChain> {
        SwapChain::new(Arc::clone(&self.backend), queue, target, desc)
    }

    pub fn create_descriptor_heap(
        &self,
        kind: DescriptorKind,
        len: usize,
        shader_visible: bool,
    ) -> GfxResult<DescriptorHeap> {
        DescriptorHeap::new(kind, len, shader_visible)
    }

    pub fn create_render_target_view(
        &self,
        heap: &mut DescriptorHeap,
        index: usize,
        texture: &Texture,
    ) -> GfxResult<()> {
        heap.create_render_target_view(index, texture)
    }

    pub fn create_depth_stencil_view(
        &self,
        heap: &mut DescriptorHeap,
        index: usize,
        texture: &Texture,
    ) -> GfxResult<()> {
        heap.create_depth_stencil_view(index, texture)
    }

    pub fn create_constant_buffer_view(
        &self,
        heap: &mut DescriptorHeap,
        index: usize,
        location: GpuAddress,
        size: u64,
    ) -> GfxResult<()> {
        heap.create_constant_buffer_view(index, location, size)
    }

    /// Creates a default-heap buffer holding `init_data` once `list` has executed.
    ///
    /// Records a full copy from a new staging buffer plus a transition to
    /// `GenericRead` into `list`; nothing is submitted. Returns
    /// `(default, staging)`. The staging buffer must stay alive until the
    /// recorded copy has completed on the device.
    pub fn create_default_buffer_upload(
        &self,
        list: &mut CommandList,
        init_data: &[u8],
    ) -> GfxResult<(Buffer, Buffer)> {
        if !list.is_recording() {
            return Err(SubmissionError::NotRecording {
                op: "create_default_buffer_upload",
            }
            .into());
        }
        if init_data.is_empty() {
            return Err(GfxError::ResourceCreation {
                what: "default buffer",
                source: HalError::Unsupported("no initial data".into()),
            });
        }

        let size = init_data.len() as u64;
        let default = self.create_buffer(&BufferDesc {
            label: "default buffer",
            size,
            heap: HeapKind::Default,
            initial_state: ResourceState::CopyDest,
        })?;
        let staging = self.create_buffer(&BufferDesc {
            label: "staging buffer",
            size,
            heap: HeapKind::Upload,
            initial_state: ResourceState::GenericRead,
        })?;

        let mapped = staging
            .map()
            .map_err(GfxError::resource("staging buffer mapping"))?;
        // SAFETY: the mapping spans `size` bytes and nothing else writes it.
        unsafe { ptr::copy_nonoverlapping(init_data.as_ptr(), mapped.as_ptr(), init_data.len()) };
        staging.unmap();

        list.copy_buffer_region(&default, 0, &staging, 0, size)?;
        list.resource_barrier(
            ResourceId::Buffer(default.raw()),
            ResourceState::CopyDest,
            ResourceState::GenericRead,
        )?;

        log::debug!("recorded upload of {size} bytes into the default heap");
        Ok((default, staging))
    }
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("info", &self.info)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::CompletionFence;

    fn soft() -> Device {
        Device::create(&DeviceConfig::soft()).unwrap()
    }

    #[test]
    fn soft_device_reports_adapter() {
        let device = soft();
        assert_eq!(device.adapter_info().backend, BackendKind::Soft);
    }

    #[test]
    fn default_buffer_receives_init_data() {
        let device = soft();
        let queue = device.create_queue().unwrap();
        let mut fence = CompletionFence::new(&device).unwrap();
        let allocator = device.create_command_allocator();
        let mut list = device.create_command_list(&allocator).unwrap();

        let data: Vec<u8> = (0..84).collect();
        let (default, staging) = device.create_default_buffer_upload(&mut list, &data).unwrap();
        assert_eq!(default.heap(), HeapKind::Default);
        assert_eq!(staging.size(), 84);
        assert_eq!(list.len(), 2);

        list.close().unwrap();
        queue.execute_command_lists(&[&list]).unwrap();
        let label = fence.put_label(&queue).unwrap();
        fence.wait_for_label(label).unwrap();

        drop(staging);
        assert_eq!(default.read_back(0, 84).unwrap(), data);
    }

    #[test]
    fn staging_dropped_before_execution_removes_device() {
        let device = soft();
        let queue = device.create_queue().unwrap();
        let mut fence = CompletionFence::new(&device).unwrap();
        let allocator = device.create_command_allocator();
        let mut list = device.create_command_list(&allocator).unwrap();

        let (_default, staging) = device
            .create_default_buffer_upload(&mut list, &[1, 2, 3, 4])
            .unwrap();
        drop(staging);
        list.close().unwrap();

        let err = queue
            .execute_command_lists(&[&list])
            .and_then(|_| fence.put_label(&queue))
            .and_then(|label| fence.wait_for_label(label))
            .unwrap_err();
        assert!(err.is_device_lost(), "{err:?}");
    }

    #[test]
    fn upload_needs_recording_list_and_data() {
        let device = soft();
        let allocator = device.create_command_allocator();
        let mut list = device.create_command_list(&allocator).unwrap();

        assert!(matches!(
            device.create_default_buffer_upload(&mut list, &[]),
            Err(GfxError::ResourceCreation { .. })
        ));

        list.close().unwrap();
        assert!(matches!(
            device.create_default_buffer_upload(&mut list, &[1]),
            Err(GfxError::CommandSubmission(SubmissionError::NotRecording { .. }))
        ));
    }

    #[test]
    fn default_heap_buffers_are_not_mappable() {
        let device = soft();
        let buffer = device
            .create_buffer(&BufferDesc {
                label: "gpu only",
                size: 16,
                heap: HeapKind::Default,
                initial_state: ResourceState::Common,
            })
            .unwrap();
        assert!(buffer.map().is_err());
        assert!(
            device
                .create_buffer(&BufferDesc {
                    label: "empty",
                    size: 0,
                    heap: HeapKind::Upload,
                    initial_state: ResourceState::GenericRead,
                })
                .is_err()
        );
    }
}
