use super::frame_data::{ObjectConstants, TRIANGLE};
use crate::command::{CommandAllocator, CommandList, CommandListState, Queue};
use crate::config::RenderConfig;
use crate::descriptor::{DescriptorHeap, DescriptorKind};
use crate::device::Device;
use crate::error::{GfxError, GfxResult};
use crate::hal::{
    HalError, PresentTarget, ResourceId, ResourceState, ScissorRect, SwapChainDesc, TextureDesc,
    TextureUsage, Viewport,
};
use crate::present::SwapChain;
use crate::resource::{Buffer, Texture};
use crate::sync::CompletionFence;
use crate::upload::ConstantBuffer;

/// Owns every GPU object of the sandbox and drives the per-frame cycle.
///
/// Each frame is flushed before `render_frame` returns, so at most one frame
/// is ever in flight. Running more needs one fence label, command allocator
/// and constant buffer slot per frame.
pub struct RenderingSystem {
    config: RenderConfig,
    viewport: Viewport,
    scissor: ScissorRect,
    current_back_buffer: u32,
    frames_rendered: u64,
    object_constants: Vec<ObjectConstants>,
    shut_down: bool,

    // Drop order: views and buffers before the queue and device.
    constant_buffer: ConstantBuffer<ObjectConstants>,
    vertex_buffer: Option<Buffer>,
    rtv_heap: DescriptorHeap,
    dsv_heap: DescriptorHeap,
    cbv_heap: DescriptorHeap,
    depth_buffer: Texture,
    swap_chain: SwapChain,
    command_list: CommandList,
    allocator: CommandAllocator,
    fence: CompletionFence,
    queue: Queue,
    device: Device,
}

impl RenderingSystem {
    /// Opens the configured device and builds everything on it.
    pub fn new(
        target: PresentTarget,
        width: u32,
        height: u32,
        config: RenderConfig,
    ) -> GfxResult<Self> {
        check_size(width, height)?;
        let device = Device::create(&config.device)?;
        Self::with_device(device, target, width, height, config)
    }

    /// Builds the renderer on an existing device. `config.device` is ignored.
    pub fn with_device(
        device: Device,
        target: PresentTarget,
        width: u32,
        height: u32,
        config: RenderConfig,
    ) -> GfxResult<Self> {
        check_size(width, height)?;
        log::debug!("building rendering system for {width}x{height} ({target:?})");

        let fence = CompletionFence::new(&device)?;
        let constant_buffer =
            ConstantBuffer::<ObjectConstants>::new(&device, config.object_count)?;

        let queue = device.create_queue()?;

        let allocator = device.create_command_allocator();
        let mut command_list = device.create_command_list(&allocator)?;
        command_list.close()?;

        let viewport = Viewport::full(width, height);
        let scissor = ScissorRect::full(width, height);

        let swap_chain = device.create_swap_chain(
            &queue,
            &target,
            &SwapChainDesc {
                width,
                height,
                format: config.back_buffer_format,
                buffer_count: config.back_buffer_count,
            },
        )?;
        let current_back_buffer = swap_chain.current_back_buffer_index()?;

        let depth_buffer = device.create_texture(&TextureDesc {
            label: "depth buffer",
            width,
            height,
            format: config.depth_format,
            usage: TextureUsage::DepthStencil,
            initial_state: ResourceState::DepthWrite,
        })?;

        let mut rtv_heap = device.create_descriptor_heap(
            DescriptorKind::RenderTarget,
            swap_chain.buffer_count() as usize,
            false,
        )?;
        let mut dsv_heap = device.create_descriptor_heap(DescriptorKind::DepthStencil, 1, false)?;
        let mut cbv_heap =
            device.create_descriptor_heap(DescriptorKind::CbvSrvUav, config.object_count, true)?;

        for index in 0..swap_chain.buffer_count() {
            device.create_render_target_view(
                &mut rtv_heap,
                index as usize,
                swap_chain.back_buffer(index)?,
            )?;
        }
        device.create_depth_stencil_view(&mut dsv_heap, 0, &depth_buffer)?;
        for slot in 0..constant_buffer.len() {
            device.create_constant_buffer_view(
                &mut cbv_heap,
                slot,
                constant_buffer.gpu_virtual_address(slot)?,
                constant_buffer.stride(),
            )?;
        }

        let mut system = Self {
            object_constants: vec![ObjectConstants::IDENTITY; config.object_count],
            config,
            viewport,
            scissor,
            current_back_buffer,
            frames_rendered: 0,
            shut_down: false,
            constant_buffer,
            vertex_buffer: None,
            rtv_heap,
            dsv_heap,
            cbv_heap,
            depth_buffer,
            swap_chain,
            command_list,
            allocator,
            fence,
            queue,
            device,
        };
        system.upload_static_resources()?;

        log::info!(
            "rendering system ready: {width}x{height}, {} back buffers",
            system.back_buffer_count()
        );
        Ok(system)
    }

    /// Uploads the triangle into the default heap and waits for the copy.
    fn upload_static_resources(&mut self) -> GfxResult<()> {
        self.allocator.reset()?;
        self.command_list.reset(&self.allocator)?;

        let (vertices, staging) = self.device.create_default_buffer_upload(
            &mut self.command_list,
            bytemuck::cast_slice::<_, u8>(&TRIANGLE[..]),
        )?;

        self.command_list.close()?;
        self.queue.execute_command_lists(&[&self.command_list])?;
        self.flush_command_queue()?;

        // The copy has completed; the staging buffer is no longer read.
        drop(staging);
        self.vertex_buffer = Some(vertices);
        Ok(())
    }

    /// Records, submits and presents one frame, then waits for it.
    pub fn render_frame(&mut self) -> GfxResult<()> {
        for (slot, constants) in self.object_constants.iter().enumerate() {
            self.constant_buffer.upload_value(slot, constants)?;
        }

        self.allocator.reset()?;
        self.command_list.reset(&self.allocator)?;

        self.command_list.set_viewport(self.viewport)?;
        self.command_list.set_scissor_rect(self.scissor)?;

        let back_buffer = self.swap_chain.back_buffer(self.current_back_buffer)?;
        let back_buffer = ResourceId::Texture(back_buffer.raw());
        self.command_list.resource_barrier(
            back_buffer,
            ResourceState::Present,
            ResourceState::RenderTarget,
        )?;
        self.command_list.clear_render_target_view(
            &self.rtv_heap,
            self.current_back_buffer as usize,
            self.config.clear_color,
        )?;
        self.command_list.resource_barrier(
            back_buffer,
            ResourceState::RenderTarget,
            ResourceState::Present,
        )?;

        self.command_list.close()?;
        self.queue.execute_command_lists(&[&self.command_list])?;

        self.swap_chain.present(self.config.sync_interval)?;
        self.flush_command_queue()?;

        self.current_back_buffer = self.swap_chain.current_back_buffer_index()?;
        self.frames_rendered += 1;
        log::trace!(
            "frame {} done, next back buffer {}",
            self.frames_rendered,
            self.current_back_buffer
        );
        Ok(())
    }

    /// Blocks until the device has finished everything submitted so far.
    pub fn flush_command_queue(&mut self) -> GfxResult<()> {
        let label = self.fence.put_label(&self.queue)?;
        self.fence.wait_for_label(label)
    }

    /// Sets the constants uploaded for `slot` from the next frame on.
    pub fn set_object_constants(
        &mut self,
        slot: usize,
        constants: ObjectConstants,
    ) -> GfxResult<()> {
        let len = self.object_constants.len();
        let entry = self
            .object_constants
            .get_mut(slot)
            .ok_or(GfxError::IndexOutOfBounds { index: slot, len })?;
        *entry = constants;
        Ok(())
    }

    pub fn current_back_buffer_index(&self) -> u32 {
        self.current_back_buffer
    }

    pub fn back_buffer_count(&self) -> u32 {
        self.swap_chain.buffer_count()
    }

    pub fn command_list_state(&self) -> CommandListState {
        self.command_list.state()
    }

    pub fn frames_rendered(&self) -> u64 {
        self.frames_rendered
    }

    pub fn viewport(&self) -> Viewport {
        self.viewport
    }

    pub fn scissor_rect(&self) -> ScissorRect {
        self.scissor
    }

    pub fn vertex_buffer(&self) -> Option<&Buffer> {
        self.vertex_buffer.as_ref()
    }

    pub fn constant_buffer(&self) -> &ConstantBuffer<ObjectConstants> {
        &self.constant_buffer
    }

    pub fn swap_chain(&self) -> &SwapChain {
        &self.swap_chain
    }

    pub fn depth_buffer(&self) -> &Texture {
        &self.depth_buffer
    }

    pub fn descriptor_heaps(&self) -> [&DescriptorHeap; 3] {
        [&self.rtv_heap, &self.dsv_heap, &self.cbv_heap]
    }

    pub fn fence(&self) -> &CompletionFence {
        &self.fence
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Waits for the device to go idle and destroys the fence, reporting failures.
    pub fn shutdown(mut self) -> GfxResult<()> {
        self.shut_down = true;
        self.flush_command_queue()?;
        self.fence.release()
    }
}

impl Drop for RenderingSystem {
    fn drop(&mut self) {
        if self.shut_down {
            return;
        }
        if let Err(e) = self.flush_command_queue() {
            log::warn!("could not flush the queue on drop: {e}");
        }
    }
}

fn check_size(width: u32, height: u32) -> GfxResult<()> {
    if width == 0 || height == 0 {
        return Err(GfxError::ResourceCreation {
            what: "rendering system",
            source: HalError::Unsupported(format!("{width}x{height} target")),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::config::DeviceConfig;
    use crate::hal::soft::{SoftBackend, SoftOptions};

    fn config() -> RenderConfig {
        RenderConfig {
            device: DeviceConfig::soft(),
            ..RenderConfig::default()
        }
    }

    fn headless(width: u32, height: u32) -> RenderingSystem {
        RenderingSystem::new(PresentTarget::Headless, width, height, config()).unwrap()
    }

    #[test]
    fn frames_alternate_back_buffers() {
        let mut system = headless(800, 600);
        assert_eq!(system.command_list_state(), CommandListState::Closed);

        let mut indices = vec![system.current_back_buffer_index()];
        for _ in 0..3 {
            system.render_frame().unwrap();
            assert_eq!(system.command_list_state(), CommandListState::Closed);
            indices.push(system.current_back_buffer_index());
        }

        assert_eq!(indices, [0, 1, 0, 1]);
        assert_eq!(system.frames_rendered(), 3);
        system.shutdown().unwrap();
    }

    #[test]
    fn setup_fixes_viewport_views_and_geometry() {
        let system = headless(800, 600);
        assert_eq!(system.viewport(), Viewport::full(800, 600));
        assert_eq!(system.scissor_rect(), ScissorRect::full(800, 600));
        assert_eq!(system.back_buffer_count(), 2);
        assert_eq!(system.depth_buffer().width(), 800);

        let [rtv, dsv, cbv] = system.descriptor_heaps();
        assert_eq!((rtv.len(), dsv.len(), cbv.len()), (2, 1, 1));
        assert!(cbv.is_shader_visible());

        let vertices = system.vertex_buffer().unwrap();
        let bytes = vertices.read_back(0, vertices.size()).unwrap();
        assert_eq!(bytes, bytemuck::cast_slice::<_, u8>(&TRIANGLE[..]));
    }

    #[test]
    fn presented_image_holds_clear_color() {
        let mut system = headless(64, 32);
        system.render_frame().unwrap();

        let shown = system.swap_chain().back_buffer(0).unwrap();
        assert_eq!(shown.read_texel(0, 0).unwrap(), [0, 102, 51, 255]);
        assert_eq!(shown.read_texel(63, 31).unwrap(), [0, 102, 51, 255]);

        // The other buffer has not been drawn yet.
        let idle = system.swap_chain().back_buffer(1).unwrap();
        assert_eq!(idle.read_texel(0, 0).unwrap(), [0, 0, 0, 0]);
    }

    #[test]
    fn one_by_one_target_renders() {
        let mut system = headless(1, 1);
        system.render_frame().unwrap();
        assert_eq!(system.current_back_buffer_index(), 1);
    }

    #[test]
    fn zero_sized_target_is_rejected() {
        for (w, h) in [(0, 600), (800, 0)] {
            assert!(matches!(
                RenderingSystem::new(PresentTarget::Headless, w, h, config()),
                Err(GfxError::ResourceCreation { .. })
            ));
        }
    }

    #[test]
    fn constants_are_written_each_frame() {
        let mut system = headless(8, 8);
        let mut scaled = ObjectConstants::IDENTITY;
        scaled.world_view_proj[0][0] = 2.0;

        system.set_object_constants(0, scaled).unwrap();
        assert!(system.set_object_constants(1, scaled).is_err());
        assert_eq!(system.constant_buffer().read_value(0).unwrap(), ObjectConstants::IDENTITY);

        system.render_frame().unwrap();
        assert_eq!(system.constant_buffer().read_value(0).unwrap(), scaled);
    }

    #[test]
    fn every_frame_is_presented_and_flushed() {
        let backend = Arc::new(
            SoftBackend::new(SoftOptions {
                latency: std::time::Duration::from_millis(2),
            })
            .unwrap(),
        );
        let device = Device::from_backend(backend.clone(), DeviceConfig::soft());
        let mut system =
            RenderingSystem::with_device(device, PresentTarget::Headless, 16, 16, config())
                .unwrap();

        for _ in 0..4 {
            system.render_frame().unwrap();
        }
        assert_eq!(backend.presented_frames(), 4);
        assert_eq!(system.fence().last_issued(), 5);
        assert_eq!(system.fence().completed_value().unwrap(), 5);
    }

    #[test]
    fn device_loss_fails_the_frame() {
        let backend = Arc::new(SoftBackend::new(SoftOptions::default()).unwrap());
        let device = Device::from_backend(backend.clone(), DeviceConfig::soft());
        let mut system =
            RenderingSystem::with_device(device, PresentTarget::Headless, 16, 16, config())
                .unwrap();

        backend.remove_device("driver reset");
        let err = system.render_frame().unwrap_err();
        assert!(err.is_device_lost(), "{err:?}");
    }
}
