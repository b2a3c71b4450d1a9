//! Hardware abstraction.
//!
//! An explicit, D3D12-shaped device interface: queues, value fences, heap-typed
//! buffers with persistent mapping, recorded command streams with explicit
//! state transitions, and flip-model swap chains.
//!
//! Two implementations exist:
//! - [`soft`]: host-memory reference device with its own GPU timeline thread
//! - [`hw`]: hardware device through wgpu

mod error;
pub(crate) mod memory;
mod types;

pub mod hw;
pub mod soft;

use std::ptr::NonNull;
use std::time::Duration;

pub use error::HalError;
pub(crate) use types::{AddressSpace, HandleAllocator};
pub use types::{
    AdapterInfo, BackendKind, BufferDesc, Command, GpuAddress, HeapKind, NativeWindow,
    PresentTarget, RawBuffer, RawFence, RawQueue, RawSwapChain, RawTexture, ResourceId,
    ResourceState, ScissorRect, SubmissionId, SwapChainDesc, TextureDesc, TextureFormat,
    TextureUsage, Viewport, WaitStatus, align_up,
};

/// Device interface every backend implements.
///
/// Handles are plain values; ownership is tracked by the typed wrappers built
/// on top of this trait. Work submitted to a queue executes in submission order.
pub trait Backend: Send + Sync {
    fn adapter_info(&self) -> AdapterInfo;

    // ── queues ────────────────────────────────────────────────────────────

    fn create_queue(&self) -> Result<RawQueue, HalError>;

    fn destroy_queue(&self, queue: RawQueue);

    /// Queues `commands` for execution after all previously submitted work.
    fn submit(&self, queue: RawQueue, commands: &[Command]) -> Result<SubmissionId, HalError>;

    /// Most recent submission the device has finished executing.
    fn completed_submission(&self) -> SubmissionId;

    // ── fences ────────────────────────────────────────────────────────────

    fn create_fence(&self, initial_value: u64) -> Result<RawFence, HalError>;

    fn destroy_fence(&self, fence: RawFence) -> Result<(), HalError>;

    /// Sets `fence` to `value` once all work queued on `queue` so far has completed.
    fn signal_fence(&self, queue: RawQueue, fence: RawFence, value: u64) -> Result<(), HalError>;

    /// Value the device has most recently written to `fence`.
    fn fence_value(&self, fence: RawFence) -> Result<u64, HalError>;

    /// Blocks until `fence` reaches `value`. `None` waits without a deadline.
    fn wait_fence(
        &self,
        fence: RawFence,
        value: u64,
        timeout: Option<Duration>,
    ) -> Result<WaitStatus, HalError>;

    // ── buffers ───────────────────────────────────────────────────────────

    fn create_buffer(&self, desc: &BufferDesc) -> Result<RawBuffer, HalError>;

    fn destroy_buffer(&self, buffer: RawBuffer);

    /// Maps an upload-heap buffer for CPU writes. One mapping per buffer at a time.
    fn map_buffer(&self, buffer: RawBuffer) -> Result<NonNull<u8>, HalError>;

    fn unmap_buffer(&self, buffer: RawBuffer);

    fn buffer_address(&self, buffer: RawBuffer) -> Result<GpuAddress, HalError>;

    /// Reads buffer contents back to the host. Blocks until the copy is done.
    ///
    /// Callers must make sure no submitted work still writes the buffer.
    fn read_buffer(&self, buffer: RawBuffer, offset: u64, len: u64) -> Result<Vec<u8>, HalError>;

    // ── textures ──────────────────────────────────────────────────────────

    fn create_texture(&self, desc: &TextureDesc) -> Result<RawTexture, HalError>;

    fn destroy_texture(&self, texture: RawTexture);

    /// Reads one colour texel back to the host.
    fn read_texel(&self, texture: RawTexture, x: u32, y: u32) -> Result<[u8; 4], HalError>;

    // ── presentation ──────────────────────────────────────────────────────

    fn create_swap_chain(
        &self,
        queue: RawQueue,
        target: &PresentTarget,
        desc: &SwapChainDesc,
    ) -> Result<RawSwapChain, HalError>;

    fn destroy_swap_chain(&self, swap_chain: RawSwapChain);

    fn swap_chain_image(&self, swap_chain: RawSwapChain, index: u32)
    -> Result<RawTexture, HalError>;

    /// Index of the back buffer the next frame renders into.
    fn current_image_index(&self, swap_chain: RawSwapChain) -> Result<u32, HalError>;

    /// Queues the current back buffer for display and advances the ring.
    fn present(&self, swap_chain: RawSwapChain, sync_interval: u32) -> Result<(), HalError>;
}
