//! Host-memory reference device.
//!
//! Resources live in host memory. A dedicated timeline thread plays the GPU:
//! it executes submissions, fence signals, and presents strictly in the order
//! they were queued, and validates resource states the way a debug layer
//! would. Any validation failure removes the device; later waits and
//! submissions report the removal reason.

mod state;
mod timeline;

use std::ptr::NonNull;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use state::{SoftBuffer, SoftSwapChain, SoftTexture};
use timeline::{Job, Shared, Timeline};

use super::{
    AdapterInfo, AddressSpace, Backend, BackendKind, BufferDesc, Command, GpuAddress, HalError,
    HandleAllocator, HeapKind, PresentTarget, RawBuffer, RawFence, RawQueue, RawSwapChain,
    RawTexture, ResourceState, SubmissionId, SwapChainDesc, TextureDesc, TextureUsage, WaitStatus,
};
use super::memory::HostAllocation;

/// Soft device options.
#[derive(Debug, Clone, Default)]
pub struct SoftOptions {
    /// Delay the timeline applies before executing each submission.
    pub latency: Duration,
}

pub struct SoftBackend {
    shared: Arc<Shared>,
    timeline: Timeline,
    handles: HandleAllocator,
    addresses: AddressSpace,
    next_submission: AtomicU64,
}

impl SoftBackend {
    pub fn new(options: SoftOptions) -> Result<Self, HalError> {
        let shared = Arc::new(Shared::default());
        let timeline = Timeline::spawn(Arc::clone(&shared), options.latency)?;

        log::debug!("soft device created (latency {:?})", options.latency);

        Ok(Self {
            shared,
            timeline,
            handles: HandleAllocator::new(),
            addresses: AddressSpace::new(),
            next_submission: AtomicU64::new(0),
        })
    }

    /// Number of presents the timeline has executed.
    pub fn presented_frames(&self) -> u64 {
        self.shared.lock().presented_frames
    }

    /// Removes the device as if the driver had reset it.
    pub fn remove_device(&self, reason: &str) {
        let mut state = self.shared.lock();
        if state.lost.is_none() {
            state.lost = Some(reason.to_owned());
        }
        drop(state);
        self.shared.progress.notify_all();
    }
}

impl Backend for SoftBackend {
    fn adapter_info(&self) -> AdapterInfo {
        AdapterInfo {
            name: "Ember soft device".into(),
            backend: BackendKind::Soft,
            api: "host".into(),
        }
    }

    fn create_queue(&self) -> Result<RawQueue, HalError> {
        let mut state = self.shared.lock();
        state.check_alive()?;
        let queue = RawQueue(self.handles.next());
        state.queues.insert(queue);
        Ok(queue)
    }

    fn destroy_queue(&self, queue: RawQueue) {
        self.shared.lock().queues.remove(&queue);
    }

    fn submit(&self, queue: RawQueue, commands: &[Command]) -> Result<SubmissionId, HalError> {
        // Hold the lock so ids reach the timeline in increasing order.
        let state = self.shared.lock();
        state.check_alive()?;
        state.check_queue(queue)?;

        let submission = SubmissionId(self.next_submission.fetch_add(1, Ordering::Relaxed) + 1);
        self.timeline.send(Job::Execute {
            submission,
            commands: commands.to_vec(),
        })?;

        log::trace!(
            "soft submit #{} ({} commands)",
            submission.get(),
            commands.len()
        );
        Ok(submission)
    }

    fn completed_submission(&self) -> SubmissionId {
        SubmissionId(self.shared.lock().completed_submission)
    }

    fn create_fence(&self, initial_value: u64) -> Result<RawFence, HalError> {
        let mut state = self.shared.lock();
        state.check_alive()?;
        let fence = RawFence(self.handles.next());
        state.fences.insert(fence, initial_value);
        Ok(fence)
    }

    fn destroy_fence(&self, fence: RawFence) -> Result<(), HalError> {
        let mut state = self.shared.lock();
        let removed = state.fences.remove(&fence);
        state.check_alive()?;
        removed
            .map(|_| ())
            .ok_or(HalError::invalid("fence", fence.id()))
    }

    fn signal_fence(&self, queue: RawQueue, fence: RawFence, value: u64) -> Result<(), HalError> {
        let state = self.shared.lock();
        state.check_alive()?;
        state.check_queue(queue)?;
        if !state.fences.contains_key(&fence) {
            return Err(HalError::invalid("fence", fence.id()));
        }
        self.timeline.send(Job::Signal { fence, value })
    }

    fn fence_value(&self, fence: RawFence) -> Result<u64, HalError> {
        let state = self.shared.lock();
        state.check_alive()?;
        state
            .fences
            .get(&fence)
            .copied()
            .ok_or(HalError::invalid("fence", fence.id()))
    }

    fn wait_fence(
        &self,
        fence: RawFence,
        value: u64,
        timeout: Option<Duration>,
    ) -> Result<WaitStatus, HalError> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut state = self.shared.lock();

        loop {
            state.check_alive()?;
            let current = state
                .fences
                .get(&fence)
                .copied()
                .ok_or(HalError::invalid("fence", fence.id()))?;
            if current >= value {
                return Ok(WaitStatus::Reached);
            }

            state = match deadline {
                None => self
                    .shared
                    .progress
                    .wait(state)
                    .unwrap_or_else(std::sync::PoisonError::into_inner),
                Some(deadline) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        return Ok(WaitStatus::TimedOut);
                    }
                    self.shared
                        .progress
                        .wait_timeout(state, remaining)
                        .unwrap_or_else(std::sync::PoisonError::into_inner)
                        .0
                }
            };
        }
    }

    fn create_buffer(&self, desc: &BufferDesc) -> Result<RawBuffer, HalError> {
        if desc.size == 0 {
            return Err(HalError::Unsupported(format!(
                "zero-sized buffer `{}`",
                desc.label
            )));
        }

        let memory = HostAllocation::zeroed(desc.size)?;
        let address = self.addresses.reserve(desc.size)?;
        let mut state = self.shared.lock();
        state.check_alive()?;

        let buffer = RawBuffer(self.handles.next());
        state.buffers.insert(
            buffer,
            SoftBuffer {
                desc: *desc,
                memory,
                address,
                state: desc.initial_state,
                mapped: false,
            },
        );
        Ok(buffer)
    }

    fn destroy_buffer(&self, buffer: RawBuffer) {
        if let Some(b) = self.shared.lock().buffers.remove(&buffer) {
            if b.mapped {
                log::warn!("buffer `{}` destroyed while mapped", b.desc.label);
            }
        }
    }

    fn map_buffer(&self, buffer: RawBuffer) -> Result<NonNull<u8>, HalError> {
        let mut state = self.shared.lock();
        let b = state.buffer_mut(buffer)?;
        if b.desc.heap != HeapKind::Upload {
            return Err(HalError::Unsupported(format!(
                "buffer `{}` lives in the default heap and is not CPU visible",
                b.desc.label
            )));
        }
        if b.mapped {
            return Err(HalError::Validation(format!(
                "buffer `{}` is already mapped",
                b.desc.label
            )));
        }
        b.mapped = true;
        Ok(b.memory.as_ptr())
    }

    fn unmap_buffer(&self, buffer: RawBuffer) {
        let mut state = self.shared.lock();
        if let Ok(b) = state.buffer_mut(buffer) {
            if !b.mapped {
                log::warn!("unmap of buffer `{}` that is not mapped", b.desc.label);
            }
            b.mapped = false;
        }
    }

    fn buffer_address(&self, buffer: RawBuffer) -> Result<GpuAddress, HalError> {
        Ok(self.shared.lock().buffer(buffer)?.address)
    }

    fn read_buffer(&self, buffer: RawBuffer, offset: u64, len: u64) -> Result<Vec<u8>, HalError> {
        let state = self.shared.lock();
        state.check_alive()?;
        state.buffer(buffer)?.memory.read(offset, len)
    }

    fn create_texture(&self, desc: &TextureDesc) -> Result<RawTexture, HalError> {
        let texels = texel_storage(desc)?;
        let mut state = self.shared.lock();
        state.check_alive()?;

        let texture = RawTexture(self.handles.next());
        state.textures.insert(
            texture,
            SoftTexture {
                desc: *desc,
                texels,
                state: desc.initial_state,
                swap_chain: None,
            },
        );
        Ok(texture)
    }

    fn destroy_texture(&self, texture: RawTexture) {
        let mut state = self.shared.lock();
        match state.textures.get(&texture) {
            Some(t) if t.swap_chain.is_some() => {
                log::warn!("back buffer {} is owned by its swap chain", texture.id());
            }
            Some(_) => {
                state.textures.remove(&texture);
            }
            None => {}
        }
    }

    fn read_texel(&self, texture: RawTexture, x: u32, y: u32) -> Result<[u8; 4], HalError> {
        let state = self.shared.lock();
        state.check_alive()?;
        let t = state.texture(texture)?;

        if t.desc.format.is_depth() {
            return Err(HalError::Unsupported("texel read-back of a depth texture".into()));
        }
        if x >= t.desc.width || y >= t.desc.height {
            return Err(HalError::Validation(format!(
                "texel ({x}, {y}) outside {}x{}",
                t.desc.width, t.desc.height
            )));
        }

        let at = (y as usize * t.desc.width as usize + x as usize) * 4;
        let mut texel = [0u8; 4];
        texel.copy_from_slice(&t.texels[at..at + 4]);
        Ok(texel)
    }

    fn create_swap_chain(
        &self,
        queue: RawQueue,
        target: &PresentTarget,
        desc: &SwapChainDesc,
    ) -> Result<RawSwapChain, HalError> {
        if desc.width == 0 || desc.height == 0 {
            return Err(HalError::Surface(format!(
                "cannot create a {}x{} surface",
                desc.width, desc.height
            )));
        }
        if !(2..=16).contains(&desc.buffer_count) {
            return Err(HalError::Unsupported(format!(
                "flip-model swap chains need 2..=16 buffers, got {}",
                desc.buffer_count
            )));
        }
        if desc.format.is_depth() {
            return Err(HalError::Unsupported("depth format back buffers".into()));
        }
        if let PresentTarget::Window(_) = target {
            log::debug!("soft device keeps window presentation in host memory");
        }

        let image_desc = TextureDesc {
            label: "back buffer",
            width: desc.width,
            height: desc.height,
            format: desc.format,
            usage: TextureUsage::RenderTarget,
            initial_state: ResourceState::Present,
        };

        let mut images = Vec::with_capacity(desc.buffer_count as usize);
        let mut storage = Vec::with_capacity(desc.buffer_count as usize);
        for _ in 0..desc.buffer_count {
            images.push(RawTexture(self.handles.next()));
            storage.push(texel_storage(&image_desc)?);
        }

        let mut state = self.shared.lock();
        state.check_alive()?;
        state.check_queue(queue)?;

        let swap_chain = RawSwapChain(self.handles.next());
        for (image, texels) in images.iter().zip(storage) {
            state.textures.insert(
                *image,
                SoftTexture {
                    desc: image_desc,
                    texels,
                    state: ResourceState::Present,
                    swap_chain: Some(swap_chain),
                },
            );
        }
        state.swap_chains.insert(
            swap_chain,
            SoftSwapChain {
                queue,
                images,
                current: 0,
            },
        );

        Ok(swap_chain)
    }

    fn destroy_swap_chain(&self, swap_chain: RawSwapChain) {
        let mut state = self.shared.lock();
        if let Some(sc) = state.swap_chains.remove(&swap_chain) {
            for image in sc.images {
                state.textures.remove(&image);
            }
        }
    }

    fn swap_chain_image(
        &self,
        swap_chain: RawSwapChain,
        index: u32,
    ) -> Result<RawTexture, HalError> {
        let state = self.shared.lock();
        let sc = state
            .swap_chains
            .get(&swap_chain)
            .ok_or(HalError::invalid("swap chain", swap_chain.id()))?;
        sc.images
            .get(index as usize)
            .copied()
            .ok_or_else(|| HalError::Validation(format!("no back buffer {index}")))
    }

    fn current_image_index(&self, swap_chain: RawSwapChain) -> Result<u32, HalError> {
        let state = self.shared.lock();
        state
            .swap_chains
            .get(&swap_chain)
            .map(|sc| sc.current)
            .ok_or(HalError::invalid("swap chain", swap_chain.id()))
    }

    fn present(&self, swap_chain: RawSwapChain, sync_interval: u32) -> Result<(), HalError> {
        if sync_interval > 4 {
            return Err(HalError::Validation(format!(
                "sync interval {sync_interval} outside 0..=4"
            )));
        }

        let mut state = self.shared.lock();
        state.check_alive()?;
        let sc = state
            .swap_chains
            .get_mut(&swap_chain)
            .ok_or(HalError::invalid("swap chain", swap_chain.id()))?;

        let image = sc.images[sc.current as usize];
        // Flip model: the ring advances as soon as present is queued.
        sc.current = (sc.current + 1) % sc.images.len() as u32;
        let queue = sc.queue;

        self.timeline.send(Job::Present { swap_chain, image })?;
        log::trace!("soft present on queue {} (image {})", queue.id(), image.id());
        Ok(())
    }
}

fn texel_storage(desc: &TextureDesc) -> Result<Vec<u8>, HalError> {
    if desc.width == 0 || desc.height == 0 {
        return Err(HalError::Unsupported(format!(
            "zero-sized texture `{}`",
            desc.label
        )));
    }

    let bytes = u64::from(desc.width)
        .checked_mul(u64::from(desc.height))
        .and_then(|n| n.checked_mul(u64::from(desc.format.bytes_per_texel())))
        .ok_or(HalError::OutOfMemory(u64::MAX))?;
    let len = usize::try_from(bytes).map_err(|_| HalError::OutOfMemory(bytes))?;
    Ok(vec![0; len])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::{ResourceId, TextureFormat};

    fn device() -> SoftBackend {
        SoftBackend::new(SoftOptions::default()).unwrap()
    }

    fn upload(dev: &SoftBackend, size: u64) -> RawBuffer {
        dev.create_buffer(&BufferDesc {
            label: "upload",
            size,
            heap: HeapKind::Upload,
            initial_state: ResourceState::GenericRead,
        })
        .unwrap()
    }

    fn flush(dev: &SoftBackend, queue: RawQueue, fence: RawFence, value: u64) {
        dev.signal_fence(queue, fence, value).unwrap();
        let status = dev
            .wait_fence(fence, value, Some(Duration::from_secs(5)))
            .unwrap();
        assert_eq!(status, WaitStatus::Reached);
    }

    #[test]
    fn signals_complete_in_order() {
        let dev = device();
        let queue = dev.create_queue().unwrap();
        let fence = dev.create_fence(0).unwrap();

        dev.submit(queue, &[]).unwrap();
        let second = dev.submit(queue, &[]).unwrap();
        flush(&dev, queue, fence, 1);

        assert_eq!(dev.fence_value(fence).unwrap(), 1);
        assert!(dev.completed_submission() >= second);
    }

    #[test]
    fn wait_times_out_when_never_signaled() {
        let dev = device();
        let fence = dev.create_fence(0).unwrap();
        let status = dev
            .wait_fence(fence, 3, Some(Duration::from_millis(20)))
            .unwrap();
        assert_eq!(status, WaitStatus::TimedOut);
    }

    #[test]
    fn default_heap_is_not_mappable() {
        let dev = device();
        let buffer = dev
            .create_buffer(&BufferDesc {
                label: "vram",
                size: 16,
                heap: HeapKind::Default,
                initial_state: ResourceState::CopyDest,
            })
            .unwrap();
        assert!(matches!(dev.map_buffer(buffer), Err(HalError::Unsupported(_))));
    }

    #[test]
    fn second_map_is_rejected() {
        let dev = device();
        let buffer = upload(&dev, 16);
        dev.map_buffer(buffer).unwrap();
        assert!(matches!(dev.map_buffer(buffer), Err(HalError::Validation(_))));
        dev.unmap_buffer(buffer);
        assert!(dev.map_buffer(buffer).is_ok());
    }

    #[test]
    fn bad_transition_removes_device() {
        let dev = device();
        let queue = dev.create_queue().unwrap();
        let fence = dev.create_fence(0).unwrap();
        let buffer = upload(&dev, 16);

        dev.submit(
            queue,
            &[Command::Transition {
                resource: ResourceId::Buffer(buffer),
                before: ResourceState::CopyDest,
                after: ResourceState::GenericRead,
            }],
        )
        .unwrap();
        dev.signal_fence(queue, fence, 1).unwrap();

        let err = dev
            .wait_fence(fence, 1, Some(Duration::from_secs(5)))
            .unwrap_err();
        assert!(err.is_device_lost());
        assert!(dev.submit(queue, &[]).unwrap_err().is_device_lost());
    }

    #[test]
    fn removal_wakes_waiters() {
        let dev = Arc::new(device());
        let fence = dev.create_fence(0).unwrap();

        let waiter = {
            let dev = Arc::clone(&dev);
            std::thread::spawn(move || dev.wait_fence(fence, 1, None))
        };
        std::thread::sleep(Duration::from_millis(20));
        dev.remove_device("driver reset");

        let result = waiter.join().unwrap();
        assert_eq!(result, Err(HalError::DeviceLost("driver reset".into())));
    }

    #[test]
    fn present_advances_ring() {
        let dev = device();
        let queue = dev.create_queue().unwrap();
        let fence = dev.create_fence(0).unwrap();
        let sc = dev
            .create_swap_chain(
                queue,
                &PresentTarget::Headless,
                &SwapChainDesc {
                    width: 4,
                    height: 2,
                    format: TextureFormat::Rgba8Unorm,
                    buffer_count: 3,
                },
            )
            .unwrap();

        let mut seen = Vec::new();
        for _ in 0..4 {
            seen.push(dev.current_image_index(sc).unwrap());
            dev.present(sc, 1).unwrap();
        }
        flush(&dev, queue, fence, 1);

        assert_eq!(seen, vec![0, 1, 2, 0]);
        assert_eq!(dev.presented_frames(), 4);
    }

    #[test]
    fn swap_chain_needs_two_buffers() {
        let dev = device();
        let queue = dev.create_queue().unwrap();
        let desc = SwapChainDesc {
            width: 1,
            height: 1,
            format: TextureFormat::Rgba8Unorm,
            buffer_count: 1,
        };
        assert!(matches!(
            dev.create_swap_chain(queue, &PresentTarget::Headless, &desc),
            Err(HalError::Unsupported(_))
        ));
    }
}
