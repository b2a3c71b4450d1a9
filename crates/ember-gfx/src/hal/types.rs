use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use raw_window_handle::{HasDisplayHandle, HasWindowHandle};

use super::HalError;

macro_rules! raw_handle {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub(crate) u64);

        impl $name {
            /// Backend-assigned identifier.
            pub fn id(self) -> u64 {
                self.0
            }
        }
    };
}

raw_handle!(
    /// Submission queue.
    RawQueue
);
raw_handle!(
    /// Device-side fence.
    RawFence
);
raw_handle!(
    /// Linear buffer allocation.
    RawBuffer
);
raw_handle!(
    /// 2D image.
    RawTexture
);
raw_handle!(
    /// Presentation surface with its ring of back buffers.
    RawSwapChain
);

/// Issues process-unique raw handle values for one backend.
#[derive(Debug)]
pub(crate) struct HandleAllocator {
    next: AtomicU64,
}

impl HandleAllocator {
    pub(crate) fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    pub(crate) fn next(&self) -> u64 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }
}

/// Which implementation of [`super::Backend`] a device runs on.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum BackendKind {
    /// Hardware device through wgpu.
    Wgpu,
    /// Host-memory reference device with its own GPU timeline thread.
    Soft,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            BackendKind::Wgpu => "wgpu",
            BackendKind::Soft => "soft",
        })
    }
}

impl FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "wgpu" | "gpu" | "hw" => Ok(BackendKind::Wgpu),
            "soft" | "software" | "cpu" => Ok(BackendKind::Soft),
            other => Err(format!("unknown backend `{other}` (expected `wgpu` or `soft`)")),
        }
    }
}

/// Description of the adapter a device was created on.
#[derive(Debug, Clone)]
pub struct AdapterInfo {
    pub name: String,
    pub backend: BackendKind,
    /// Native API underneath (e.g. "Vulkan", "Dx12"), or "host" for the soft backend.
    pub api: String,
}

/// Memory pool a buffer is allocated from.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum HeapKind {
    /// GPU-local memory. Not CPU accessible.
    Default,
    /// CPU-visible memory the device reads from. May be persistently mapped.
    Upload,
}

/// Usage state of a resource. Transitions between states are explicit.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum ResourceState {
    Common,
    Present,
    RenderTarget,
    DepthWrite,
    CopyDest,
    CopySource,
    GenericRead,
}

impl ResourceState {
    /// Whether a copy may read from a buffer in this state.
    pub fn is_copy_readable(self) -> bool {
        matches!(self, ResourceState::CopySource | ResourceState::GenericRead)
    }
}

/// Texel formats understood by every backend.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum TextureFormat {
    Rgba8Unorm,
    Bgra8Unorm,
    Depth32FloatStencil8,
}

impl TextureFormat {
    pub fn bytes_per_texel(self) -> u32 {
        match self {
            TextureFormat::Rgba8Unorm | TextureFormat::Bgra8Unorm => 4,
            TextureFormat::Depth32FloatStencil8 => 8,
        }
    }

    pub fn is_depth(self) -> bool {
        matches!(self, TextureFormat::Depth32FloatStencil8)
    }

    /// Encodes a linear RGBA colour as one texel of this format.
    ///
    /// Returns `None` for depth formats.
    pub fn encode_color(self, color: [f32; 4]) -> Option<[u8; 4]> {
        let unorm = |c: f32| (c.clamp(0.0, 1.0) * 255.0).round() as u8;
        let [r, g, b, a] = color.map(unorm);
        match self {
            TextureFormat::Rgba8Unorm => Some([r, g, b, a]),
            TextureFormat::Bgra8Unorm => Some([b, g, r, a]),
            TextureFormat::Depth32FloatStencil8 => None,
        }
    }
}

/// How a texture will be bound.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum TextureUsage {
    RenderTarget,
    DepthStencil,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct BufferDesc {
    pub label: &'static str,
    pub size: u64,
    pub heap: HeapKind,
    pub initial_state: ResourceState,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct TextureDesc {
    pub label: &'static str,
    pub width: u32,
    pub height: u32,
    pub format: TextureFormat,
    pub usage: TextureUsage,
    pub initial_state: ResourceState,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct SwapChainDesc {
    pub width: u32,
    pub height: u32,
    pub format: TextureFormat,
    pub buffer_count: u32,
}

/// Rasterizer viewport in pixels.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct Viewport {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub min_depth: f32,
    pub max_depth: f32,
}

impl Viewport {
    /// Viewport covering a whole `width` x `height` target with the full depth range.
    pub fn full(width: u32, height: u32) -> Self {
        Self {
            x: 0.0,
            y: 0.0,
            width: width as f32,
            height: height as f32,
            min_depth: 0.0,
            max_depth: 1.0,
        }
    }
}

/// Scissor rectangle, right/bottom exclusive.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ScissorRect {
    pub left: i32,
    pub top: i32,
    pub right: i32,
    pub bottom: i32,
}

impl ScissorRect {
    pub fn full(width: u32, height: u32) -> Self {
        Self {
            left: 0,
            top: 0,
            right: i32::try_from(width).unwrap_or(i32::MAX),
            bottom: i32::try_from(height).unwrap_or(i32::MAX),
        }
    }
}

/// A resource referenced by a barrier.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum ResourceId {
    Buffer(RawBuffer),
    Texture(RawTexture),
}

/// One recorded GPU operation.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    SetViewport(Viewport),
    SetScissorRect(ScissorRect),
    Transition {
        resource: ResourceId,
        before: ResourceState,
        after: ResourceState,
    },
    CopyBufferRegion {
        dst: RawBuffer,
        dst_offset: u64,
        src: RawBuffer,
        src_offset: u64,
        size: u64,
    },
    ClearRenderTarget {
        texture: RawTexture,
        color: [f32; 4],
    },
}

/// Monotonic id of a queue submission. `SubmissionId::NONE` precedes every submission.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct SubmissionId(pub(crate) u64);

impl SubmissionId {
    pub const NONE: SubmissionId = SubmissionId(0);

    pub fn get(self) -> u64 {
        self.0
    }
}

/// Outcome of a bounded fence wait.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum WaitStatus {
    Reached,
    TimedOut,
}

/// Device-side virtual address.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GpuAddress(pub u64);

impl GpuAddress {
    pub fn offset(self, bytes: u64) -> GpuAddress {
        GpuAddress(self.0 + bytes)
    }
}

impl fmt::Display for GpuAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#014x}", self.0)
    }
}

/// Rounds `value` up to the next multiple of `alignment` (a power of two).
///
/// Fails with `OutOfMemory` when the rounded size does not fit in 64 bits.
pub fn align_up(value: u64, alignment: u64) -> Result<u64, HalError> {
    debug_assert!(alignment.is_power_of_two());
    value
        .checked_add(alignment - 1)
        .map(|end| end & !(alignment - 1))
        .ok_or(HalError::OutOfMemory(value))
}

/// Hands out non-overlapping virtual address ranges for buffers.
#[derive(Debug)]
pub(crate) struct AddressSpace {
    next: AtomicU64,
}

impl AddressSpace {
    const BASE: u64 = 1 << 32;
    const GRANULARITY: u64 = 64 * 1024;

    pub(crate) fn new() -> Self {
        Self {
            next: AtomicU64::new(Self::BASE),
        }
    }

    pub(crate) fn reserve(&self, size: u64) -> Result<GpuAddress, HalError> {
        let span = align_up(size.max(1), Self::GRANULARITY)?;
        self.next
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |next| {
                next.checked_add(span)
            })
            .map(GpuAddress)
            .map_err(|_| HalError::OutOfMemory(size))
    }
}

/// A native window the presentation surface can be bound to.
pub trait NativeWindow: HasWindowHandle + HasDisplayHandle + Send + Sync {}

impl<T> NativeWindow for T where T: HasWindowHandle + HasDisplayHandle + Send + Sync {}

/// Where a swap chain presents.
#[derive(Clone)]
pub enum PresentTarget {
    /// Images stay in device memory; nothing reaches a display.
    Headless,
    Window(Arc<dyn NativeWindow>),
}

impl PresentTarget {
    pub fn window<W>(window: Arc<W>) -> Self
    where
        W: NativeWindow + 'static,
    {
        PresentTarget::Window(window)
    }
}

impl fmt::Debug for PresentTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PresentTarget::Headless => f.write_str("Headless"),
            PresentTarget::Window(_) => f.write_str("Window(..)"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn align_up_rounds_to_multiple() {
        assert_eq!(align_up(0, 256), Ok(0));
        assert_eq!(align_up(1, 256), Ok(256));
        assert_eq!(align_up(256, 256), Ok(256));
        assert_eq!(align_up(300, 256), Ok(512));
    }

    #[test]
    fn align_up_reports_overflow() {
        assert_eq!(align_up(u64::MAX, 4), Err(HalError::OutOfMemory(u64::MAX)));
        assert_eq!(align_up(u64::MAX - 3, 4), Ok(u64::MAX - 3));
    }

    #[test]
    fn address_ranges_do_not_overlap() {
        let space = AddressSpace::new();
        let a = space.reserve(10).unwrap();
        let b = space.reserve(70_000).unwrap();
        let c = space.reserve(1).unwrap();
        assert!(b.0 >= a.0 + 10);
        assert!(c.0 >= b.0 + 70_000);
        assert_eq!(a.0 % AddressSpace::GRANULARITY, 0);
        assert!(space.reserve(u64::MAX).is_err());
    }

    #[test]
    fn backend_kind_parses() {
        assert_eq!("soft".parse::<BackendKind>(), Ok(BackendKind::Soft));
        assert_eq!(" WGPU ".parse::<BackendKind>(), Ok(BackendKind::Wgpu));
        assert!("metal".parse::<BackendKind>().is_err());
    }

    #[test]
    fn encodes_clear_color_per_format() {
        let c = [0.0, 0.4, 0.2, 1.0];
        assert_eq!(TextureFormat::Rgba8Unorm.encode_color(c), Some([0, 102, 51, 255]));
        assert_eq!(TextureFormat::Bgra8Unorm.encode_color(c), Some([51, 102, 0, 255]));
        assert_eq!(TextureFormat::Depth32FloatStencil8.encode_color(c), None);
    }

    #[test]
    fn scissor_covers_target() {
        let s = ScissorRect::full(800, 600);
        assert_eq!((s.left, s.top, s.right, s.bottom), (0, 0, 800, 600));
    }
}
