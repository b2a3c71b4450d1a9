//! Hardware device through wgpu.
//!
//! wgpu hides barriers, persistent mappings and fences, so each is emulated:
//! - upload-heap buffers are host allocations flushed with `Queue::write_buffer`
//!   ahead of every submission;
//! - fence values are published from `Queue::on_submitted_work_done`
//!   callbacks, which `Device::poll` drives;
//! - transitions are tracked and checked on the CPU only, a whole batch at a
//!   time before anything is encoded.

mod batch;
mod resources;
mod surface;

use std::collections::HashMap;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use resources::{HwBuffer, HwSwapChain, HwTexture, Resources};

use super::memory::HostAllocation;
use super::{
    AdapterInfo, AddressSpace, Backend, BackendKind, BufferDesc, Command, GpuAddress, HalError,
    HandleAllocator, HeapKind, PresentTarget, RawBuffer, RawFence, RawQueue, RawSwapChain,
    RawTexture, ResourceState, SubmissionId, SwapChainDesc, TextureDesc, TextureFormat,
    TextureUsage, WaitStatus, align_up,
};

/// Adapter selection for the wgpu device.
#[derive(Debug, Clone)]
pub struct WgpuOptions {
    pub backends: wgpu::Backends,
    pub power_preference: wgpu::PowerPreference,
}

impl Default for WgpuOptions {
    fn default() -> Self {
        Self {
            backends: wgpu::Backends::PRIMARY,
            power_preference: wgpu::PowerPreference::HighPerformance,
        }
    }
}

/// Completion state written by wgpu callbacks.
#[derive(Default)]
struct Progress {
    completed_submission: AtomicU64,
    fences: Mutex<HashMap<RawFence, u64>>,
}

impl Progress {
    fn fences(&self) -> MutexGuard<'_, HashMap<RawFence, u64>> {
        self.fences.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn finish_submission(&self, submission: u64) {
        self.completed_submission
            .fetch_max(submission, Ordering::AcqRel);
    }

    fn signal(&self, fence: RawFence, value: u64) {
        if let Some(current) = self.fences().get_mut(&fence) {
            *current = (*current).max(value);
        }
    }
}

pub struct WgpuBackend {
    instance: wgpu::Instance,
    adapter: wgpu::Adapter,
    device: wgpu::Device,
    queue: wgpu::Queue,
    info: AdapterInfo,
    handles: HandleAllocator,
    addresses: AddressSpace,
    resources: Mutex<Resources>,
    progress: Arc<Progress>,
    next_submission: AtomicU64,
}

impl WgpuBackend {
    /// Creates instance, adapter and device, blocking until the adapter answers.
    pub fn new(options: &WgpuOptions) -> Result<Self, HalError> {
        pollster::block_on(Self::new_async(options))
    }

    async fn new_async(options: &WgpuOptions) -> Result<Self, HalError> {
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
            backends: options.backends,
            ..Default::default()
        });

        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: options.power_preference,
                compatible_surface: None,
                force_fallback_adapter: false,
            })
            .await
            .map_err(|e| HalError::NoAdapter(e.to_string()))?;

        let (device, queue) = adapter
            .request_device(&wgpu::DeviceDescriptor {
                label: Some("ember device"),
                required_features: wgpu::Features::empty(),
                required_limits: adapter.limits(),
                experimental_features: wgpu::ExperimentalFeatures::disabled(),
                memory_hints: wgpu::MemoryHints::Performance,
                trace: wgpu::Trace::Off,
            })
            .await
            .map_err(|e| HalError::NoAdapter(format!("device request failed: {e}")))?;

        let raw = adapter.get_info();
        let info = AdapterInfo {
            name: raw.name.clone(),
            backend: BackendKind::Wgpu,
            api: format!("{:?}", raw.backend),
        };
        log::debug!("wgpu device on `{}` ({})", info.name, info.api);

        Ok(Self {
            instance,
            adapter,
            device,
            queue,
            info,
            handles: HandleAllocator::new(),
            addresses: AddressSpace::new(),
            resources: Mutex::new(Resources::default()),
            progress: Arc::new(Progress::default()),
            next_submission: AtomicU64::new(0),
        })
    }

    fn resources(&self) -> MutexGuard<'_, Resources> {
        self.resources.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn poll(&self, poll: wgpu::PollType) -> Result<(), HalError> {
        self.device
            .poll(poll)
            .map(|_| ())
            .map_err(|e| HalError::DeviceLost(e.to_string()))
    }

    /// Encodes one command of a batch [`batch::plan`] has accepted.
    ///
    /// Records in `acquired` any swap chain whose image this call acquired.
    fn encode(
        &self,
        res: &mut Resources,
        encoder: &mut wgpu::CommandEncoder,
        command: &Command,
        acquired: &mut Vec<RawSwapChain>,
    ) -> Result<(), HalError> {
        match *command {
            // Only meaningful inside a render pass; the recorded streams never draw.
            Command::SetViewport(_) | Command::SetScissorRect(_) => Ok(()),
            // Committed from the plan once the whole batch is encoded.
            Command::Transition { .. } => Ok(()),
            Command::CopyBufferRegion {
                dst,
                dst_offset,
                src,
                src_offset,
                size,
            } => {
                // Buffers are padded to the copy alignment, so the rounded size stays in bounds.
                let padded = align_up(size, wgpu::COPY_BUFFER_ALIGNMENT)?;
                encoder.copy_buffer_to_buffer(
                    &res.buffer(src)?.buffer,
                    src_offset,
                    &res.buffer(dst)?.buffer,
                    dst_offset,
                    padded,
                );
                Ok(())
            }
            Command::ClearRenderTarget { texture, color } => {
                let swap_chain = match res.texture(texture)? {
                    HwTexture::BackBuffer { swap_chain, .. } => Some(*swap_chain),
                    HwTexture::Owned { .. } => None,
                };
                let (view, fresh) = res.color_view(&self.device, texture)?;
                let [r, g, b, a] = color.map(f64::from);
                let _pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                    label: Some("ember clear"),
                    color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                        view,
                        resolve_target: None,
                        depth_slice: None,
                        ops: wgpu::Operations {
                            load: wgpu::LoadOp::Clear(wgpu::Color { r, g, b, a }),
                            store: wgpu::StoreOp::Store,
                        },
                    })],
                    depth_stencil_attachment: None,
                    timestamp_writes: None,
                    occlusion_query_set: None,
                    multiview_mask: None,
                });
                if let (true, Some(swap_chain)) = (fresh, swap_chain) {
                    acquired.push(swap_chain);
                }
                Ok(())
            }
        }
    }
}

fn native_format(format: TextureFormat) -> wgpu::TextureFormat {
    match format {
        TextureFormat::Rgba8Unorm => wgpu::TextureFormat::Rgba8Unorm,
        TextureFormat::Bgra8Unorm => wgpu::TextureFormat::Bgra8Unorm,
        // 32-bit float depth with stencil needs an optional feature; this one is core.
        TextureFormat::Depth32FloatStencil8 => wgpu::TextureFormat::Depth24PlusStencil8,
    }
}

impl Backend for WgpuBackend {
    fn adapter_info(&self) -> AdapterInfo {
        self.info.clone()
    }

    fn create_queue(&self) -> Result<RawQueue, HalError> {
        let queue = RawQueue(self.handles.next());
        self.resources().queues.insert(queue);
        Ok(queue)
    }

    fn destroy_queue(&self, queue: RawQueue) {
        self.resources().queues.remove(&queue);
    }

    fn submit(&self, queue: RawQueue, commands: &[Command]) -> Result<SubmissionId, HalError> {
        let mut res = self.resources();
        res.check_queue(queue)?;

        // Nothing below changes tracked state until the whole batch is known to be valid.
        let plan = batch::plan(&*res, commands)?;

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("ember submission"),
            });
        let mut acquired = Vec::new();
        for command in commands {
            if let Err(e) = self.encode(&mut res, &mut encoder, command, &mut acquired) {
                res.release_acquired(&acquired);
                return Err(e);
            }
        }

        // Writes staged here are ordered before the commands submitted below.
        for buffer in res.buffers.values() {
            if let Some(mirror) = &buffer.mirror {
                // SAFETY: the owning thread is inside this call and not writing the mapping.
                self.queue.write_buffer(&buffer.buffer, 0, unsafe { mirror.as_slice() });
            }
        }
        self.queue.submit(std::iter::once(encoder.finish()));
        res.commit(plan);

        let submission = self.next_submission.fetch_add(1, Ordering::Relaxed) + 1;
        let progress = Arc::clone(&self.progress);
        self.queue
            .on_submitted_work_done(move || progress.finish_submission(submission));

        log::trace!("wgpu submit #{submission} ({} commands)", commands.len());
        Ok(SubmissionId(submission))
    }

    fn completed_submission(&self) -> SubmissionId {
        if let Err(e) = self.poll(wgpu::PollType::Poll) {
            log::warn!("device poll failed: {e}");
        }
        SubmissionId(self.progress.completed_submission.load(Ordering::Acquire))
    }

    fn create_fence(&self, initial_value: u64) -> Result<RawFence, HalError> {
        let fence = RawFence(self.handles.next());
        self.progress.fences().insert(fence, initial_value);
        Ok(fence)
    }

    fn destroy_fence(&self, fence: RawFence) -> Result<(), HalError> {
        self.progress
            .fences()
            .remove(&fence)
            .map(|_| ())
            .ok_or(HalError::invalid("fence", fence.id()))
    }

    fn signal_fence(&self, queue: RawQueue, fence: RawFence, value: u64) -> Result<(), HalError> {
        self.resources().check_queue(queue)?;
        if !self.progress.fences().contains_key(&fence) {
            return Err(HalError::invalid("fence", fence.id()));
        }

        let progress = Arc::clone(&self.progress);
        self.queue
            .on_submitted_work_done(move || progress.signal(fence, value));
        Ok(())
    }

    fn fence_value(&self, fence: RawFence) -> Result<u64, HalError> {
        self.poll(wgpu::PollType::Poll)?;
        self.progress
            .fences()
            .get(&fence)
            .copied()
            .ok_or(HalError::invalid("fence", fence.id()))
    }

    /// wgpu cannot bound a device wait, so `timeout` is not honoured: the
    /// call returns once all submitted work is done. A value that is still
    /// short at that point was never signalled and reports `TimedOut`.
    fn wait_fence(
        &self,
        fence: RawFence,
        value: u64,
        _timeout: Option<Duration>,
    ) -> Result<WaitStatus, HalError> {
        if self.fence_value(fence)? >= value {
            return Ok(WaitStatus::Reached);
        }

        self.poll(wgpu::PollType::wait_indefinitely())?;

        if self.fence_value(fence)? >= value {
            Ok(WaitStatus::Reached)
        } else {
            Ok(WaitStatus::TimedOut)
        }
    }

    fn create_buffer(&self, desc: &BufferDesc) -> Result<RawBuffer, HalError> {
        if desc.size == 0 {
            return Err(HalError::Unsupported(format!(
                "zero-sized buffer `{}`",
                desc.label
            )));
        }

        let size = align_up(desc.size, wgpu::COPY_BUFFER_ALIGNMENT)?;
        let address = self.addresses.reserve(size)?;
        let usage = match desc.heap {
            HeapKind::Default => {
                wgpu::BufferUsages::COPY_DST
                    | wgpu::BufferUsages::COPY_SRC
                    | wgpu::BufferUsages::VERTEX
                    | wgpu::BufferUsages::INDEX
            }
            HeapKind::Upload => {
                wgpu::BufferUsages::COPY_DST
                    | wgpu::BufferUsages::COPY_SRC
                    | wgpu::BufferUsages::VERTEX
                    | wgpu::BufferUsages::UNIFORM
            }
        };
        let mirror = match desc.heap {
            HeapKind::Upload => Some(HostAllocation::zeroed(size)?),
            HeapKind::Default => None,
        };

        let buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some(desc.label),
            size,
            usage,
            mapped_at_creation: false,
        });

        let handle = RawBuffer(self.handles.next());
        self.resources().buffers.insert(
            handle,
            HwBuffer {
                desc: *desc,
                buffer,
                mirror,
                address,
                state: desc.initial_state,
                mapped: false,
            },
        );
        Ok(handle)
    }

    fn destroy_buffer(&self, buffer: RawBuffer) {
        if let Some(b) = self.resources().buffers.remove(&buffer) {
            if b.mapped {
                log::warn!("buffer `{}` destroyed while mapped", b.desc.label);
            }
            b.buffer.destroy();
        }
    }

    fn map_buffer(&self, buffer: RawBuffer) -> Result<NonNull<u8>, HalError> {
        let mut res = self.resources();
        let b = res.buffer_mut(buffer)?;
        let ptr = match &b.mirror {
            Some(mirror) => mirror.as_ptr(),
            None => {
                return Err(HalError::Unsupported(format!(
                    "buffer `{}` lives in the default heap and is not CPU visible",
                    b.desc.label
                )));
            }
        };
        if b.mapped {
            return Err(HalError::Validation(format!(
                "buffer `{}` is already mapped",
                b.desc.label
            )));
        }
        b.mapped = true;
        Ok(ptr)
    }

    fn unmap_buffer(&self, buffer: RawBuffer) {
        if let Ok(b) = self.resources().buffer_mut(buffer) {
            b.mapped = false;
        }
    }

    fn buffer_address(&self, buffer: RawBuffer) -> Result<GpuAddress, HalError> {
        Ok(self.resources().buffer(buffer)?.address)
    }

    fn read_buffer(&self, buffer: RawBuffer, offset: u64, len: u64) -> Result<Vec<u8>, HalError> {
        let res = self.resources();
        let b = res.buffer(buffer)?;
        if offset.checked_add(len).is_none_or(|end| end > b.desc.size) {
            return Err(HalError::Validation(format!(
                "read of {len} bytes at {offset} exceeds `{}`",
                b.desc.label
            )));
        }
        if let Some(mirror) = &b.mirror {
            return mirror.read(offset, len);
        }
        if offset % wgpu::COPY_BUFFER_ALIGNMENT != 0 {
            return Err(HalError::Unsupported(
                "read-back offset must be 4-byte aligned".into(),
            ));
        }

        let padded = align_up(len.max(1), wgpu::COPY_BUFFER_ALIGNMENT)?;
        let staging = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("ember read-back"),
            size: padded,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("ember read-back"),
            });
        encoder.copy_buffer_to_buffer(&b.buffer, offset, &staging, 0, padded);
        self.queue.submit(std::iter::once(encoder.finish()));
        drop(res);

        let slice = staging.slice(..);
        let (tx, rx) = std::sync::mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = tx.send(result);
        });
        self.poll(wgpu::PollType::wait_indefinitely())?;
        rx.recv()
            .map_err(|_| HalError::DeviceLost("read-back mapping never completed".into()))?
            .map_err(|e| HalError::DeviceLost(e.to_string()))?;

        let bytes = slice.get_mapped_range()[..len as usize].to_vec();
        staging.unmap();
        Ok(bytes)
    }

    fn create_texture(&self, desc: &TextureDesc) -> Result<RawTexture, HalError> {
        if desc.width == 0 || desc.height == 0 {
            return Err(HalError::Unsupported(format!(
                "{}x{} texture `{}`",
                desc.width, desc.height, desc.label
            )));
        }

        let usage = match desc.usage {
            TextureUsage::RenderTarget => {
                wgpu::TextureUsages::RENDER_ATTACHMENT | wgpu::TextureUsages::TEXTURE_BINDING
            }
            TextureUsage::DepthStencil => wgpu::TextureUsages::RENDER_ATTACHMENT,
        };
        let texture = self.device.create_texture(&wgpu::TextureDescriptor {
            label: Some(desc.label),
            size: wgpu::Extent3d {
                width: desc.width,
                height: desc.height,
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: native_format(desc.format),
            usage,
            view_formats: &[],
        });
        let view = texture.create_view(&wgpu::TextureViewDescriptor::default());

        let handle = RawTexture(self.handles.next());
        self.resources().textures.insert(
            handle,
            HwTexture::Owned {
                desc: *desc,
                view,
                state: desc.initial_state,
            },
        );
        Ok(handle)
    }

    fn destroy_texture(&self, texture: RawTexture) {
        let mut res = self.resources();
        // Back buffers go away with their swap chain.
        if matches!(res.textures.get(&texture), Some(HwTexture::Owned { .. })) {
            res.textures.remove(&texture);
        }
    }

    fn read_texel(&self, _texture: RawTexture, _x: u32, _y: u32) -> Result<[u8; 4], HalError> {
        Err(HalError::Unsupported(
            "texel read-back on the wgpu backend".into(),
        ))
    }

    fn create_swap_chain(
        &self,
        queue: RawQueue,
        target: &PresentTarget,
        desc: &SwapChainDesc,
    ) -> Result<RawSwapChain, HalError> {
        let PresentTarget::Window(window) = target else {
            return Err(HalError::Unsupported(
                "the wgpu backend presents to windows only".into(),
            ));
        };
        if desc.width == 0 || desc.height == 0 {
            return Err(HalError::Surface(format!(
                "cannot create a {}x{} surface",
                desc.width, desc.height
            )));
        }
        self.resources().check_queue(queue)?;

        let surface = self
            .instance
            .create_surface(Arc::clone(window))
            .map_err(|e| HalError::Os(format!("failed to create surface: {e}")))?;
        let caps = surface.get_capabilities(&self.adapter);
        let format = surface::choose_surface_format(&caps, native_format(desc.format))
            .ok_or_else(|| HalError::Surface("surface reports no formats".into()))?;

        let config = wgpu::SurfaceConfiguration {
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT,
            format,
            width: desc.width,
            height: desc.height,
            present_mode: surface::present_mode(1),
            alpha_mode: surface::choose_alpha_mode(&caps, None),
            view_formats: vec![],
            desired_maximum_frame_latency: desc.buffer_count.saturating_sub(1).max(1),
        };
        surface.configure(&self.device, &config);
        log::debug!(
            "surface configured: {}x{} {:?}, {} buffers",
            desc.width,
            desc.height,
            format,
            desc.buffer_count
        );

        let swap_chain = RawSwapChain(self.handles.next());
        let mut res = self.resources();
        let images = (0..desc.buffer_count)
            .map(|index| {
                let image = RawTexture(self.handles.next());
                res.textures.insert(
                    image,
                    HwTexture::BackBuffer {
                        swap_chain,
                        index,
                        state: ResourceState::Present,
                    },
                );
                image
            })
            .collect();
        res.swap_chains.insert(
            swap_chain,
            HwSwapChain {
                surface,
                config,
                images,
                current: 0,
                acquired: None,
            },
        );
        Ok(swap_chain)
    }

    fn destroy_swap_chain(&self, swap_chain: RawSwapChain) {
        let mut res = self.resources();
        if let Some(chain) = res.swap_chains.remove(&swap_chain) {
            for image in chain.images {
                res.textures.remove(&image);
            }
        }
    }

    fn swap_chain_image(
        &self,
        swap_chain: RawSwapChain,
        index: u32,
    ) -> Result<RawTexture, HalError> {
        let mut res = self.resources();
        let chain = res.swap_chain_mut(swap_chain)?;
        chain
            .images
            .get(index as usize)
            .copied()
            .ok_or_else(|| HalError::Validation(format!("no back buffer {index}")))
    }

    fn current_image_index(&self, swap_chain: RawSwapChain) -> Result<u32, HalError> {
        Ok(self.resources().swap_chain_mut(swap_chain)?.current)
    }

    fn present(&self, swap_chain: RawSwapChain, sync_interval: u32) -> Result<(), HalError> {
        let mut res = self.resources();
        let chain = res.swap_chain_mut(swap_chain)?;
        let image = chain
            .images
            .get(chain.current as usize)
            .copied()
            .ok_or_else(|| HalError::Validation("swap chain has no back buffers".into()))?;
        let state = res.texture(image)?.state();
        if state != ResourceState::Present {
            return Err(HalError::Validation(format!(
                "present of back buffer in {state:?} state"
            )));
        }

        let chain = res.swap_chain_mut(swap_chain)?;
        if chain.acquired.is_none() {
            chain.acquire(&self.device)?;
        }
        let acquired = chain
            .acquired
            .take()
            .ok_or_else(|| HalError::Surface("no acquired back buffer".into()))?;
        drop(acquired.view);
        acquired.texture.present();
        chain.current = (chain.current + 1) % chain.images.len() as u32;

        // Nothing is acquired now, so the surface may be reconfigured.
        let mode = surface::present_mode(sync_interval);
        if chain.config.present_mode != mode {
            chain.config.present_mode = mode;
            chain.surface.configure(&self.device, &chain.config);
        }
        Ok(())
    }
}
