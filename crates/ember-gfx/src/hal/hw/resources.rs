use std::collections::{HashMap, HashSet};

use super::batch::{StatePlan, Tracked, TrackedResources};
use super::surface::{self, SurfaceErrorAction};
use crate::hal::memory::HostAllocation;
use crate::hal::{
    BufferDesc, GpuAddress, HalError, RawBuffer, RawQueue, RawSwapChain, RawTexture, ResourceId,
    ResourceState, TextureDesc,
};

pub(super) struct HwBuffer {
    pub(super) desc: BufferDesc,
    pub(super) buffer: wgpu::Buffer,
    /// Persistent mapping of an upload-heap buffer.
    pub(super) mirror: Option<HostAllocation>,
    pub(super) address: GpuAddress,
    pub(super) state: ResourceState,
    pub(super) mapped: bool,
}

pub(super) enum HwTexture {
    Owned {
        desc: TextureDesc,
        view: wgpu::TextureView,
        state: ResourceState,
    },
    /// Stands in for whatever image the surface hands out when the frame is acquired.
    BackBuffer {
        swap_chain: RawSwapChain,
        index: u32,
        state: ResourceState,
    },
}

impl HwTexture {
    pub(super) fn state(&self) -> ResourceState {
        match self {
            HwTexture::Owned { state, .. } | HwTexture::BackBuffer { state, .. } => *state,
        }
    }

    fn state_mut(&mut self) -> &mut ResourceState {
        match self {
            HwTexture::Owned { state, .. } | HwTexture::BackBuffer { state, .. } => state,
        }
    }
}

pub(super) struct Acquired {
    pub(super) texture: wgpu::SurfaceTexture,
    pub(super) view: wgpu::TextureView,
}

pub(super) struct HwSwapChain {
    pub(super) surface: wgpu::Surface<'static>,
    pub(super) config: wgpu::SurfaceConfiguration,
    pub(super) images: Vec<RawTexture>,
    pub(super) current: u32,
    pub(super) acquired: Option<Acquired>,
}

impl HwSwapChain {
    /// Acquires the next surface image unless this frame already holds one.
    pub(super) fn acquire(&mut self, device: &wgpu::Device) -> Result<&Acquired, HalError> {
        if self.acquired.is_none() {
            let texture = match self.surface.get_current_texture() {
                Ok(texture) => texture,
                Err(err) => {
                    let message = err.to_string();
                    match surface::map_surface_error(&self.surface, device, &self.config, err) {
                        SurfaceErrorAction::Reconfigured => self
                            .surface
                            .get_current_texture()
                            .map_err(|e| HalError::Surface(e.to_string()))?,
                        action => {
                            return Err(HalError::Surface(format!(
                                "back buffer unavailable ({action:?}): {message}"
                            )));
                        }
                    }
                }
            };
            let view = texture
                .texture
                .create_view(&wgpu::TextureViewDescriptor::default());
            self.acquired = Some(Acquired { texture, view });
        }

        self.acquired
            .as_ref()
            .ok_or_else(|| HalError::Surface("no acquired back buffer".into()))
    }
}

#[derive(Default)]
pub(super) struct Resources {
    pub(super) queues: HashSet<RawQueue>,
    pub(super) buffers: HashMap<RawBuffer, HwBuffer>,
    pub(super) textures: HashMap<RawTexture, HwTexture>,
    pub(super) swap_chains: HashMap<RawSwapChain, HwSwapChain>,
}

impl Resources {
    pub(super) fn check_queue(&self, queue: RawQueue) -> Result<(), HalError> {
        if self.queues.contains(&queue) {
            Ok(())
        } else {
            Err(HalError::invalid("queue", queue.id()))
        }
    }

    pub(super) fn buffer(&self, buffer: RawBuffer) -> Result<&HwBuffer, HalError> {
        self.buffers
            .get(&buffer)
            .ok_or(HalError::invalid("buffer", buffer.id()))
    }

    pub(super) fn buffer_mut(&mut self, buffer: RawBuffer) -> Result<&mut HwBuffer, HalError> {
        self.buffers
            .get_mut(&buffer)
            .ok_or(HalError::invalid("buffer", buffer.id()))
    }

    pub(super) fn texture(&self, texture: RawTexture) -> Result<&HwTexture, HalError> {
        self.textures
            .get(&texture)
            .ok_or(HalError::invalid("texture", texture.id()))
    }

    pub(super) fn swap_chain_mut(
        &mut self,
        swap_chain: RawSwapChain,
    ) -> Result<&mut HwSwapChain, HalError> {
        self.swap_chains
            .get_mut(&swap_chain)
            .ok_or(HalError::invalid("swap chain", swap_chain.id()))
    }

    /// Writes the states of a batch that has been encoded.
    ///
    /// wgpu inserts the real barriers itself; this only keeps the recorded
    /// stream honest.
    pub(super) fn commit(&mut self, plan: StatePlan) {
        for (resource, after) in plan {
            let state = match resource {
                ResourceId::Buffer(b) => self.buffers.get_mut(&b).map(|b| &mut b.state),
                ResourceId::Texture(t) => self.textures.get_mut(&t).map(HwTexture::state_mut),
            };
            if let Some(state) = state {
                *state = after;
            }
        }
    }

    /// View a clear of `texture` renders into, acquiring a surface image for back buffers.
    ///
    /// Returns whether this call did the acquiring.
    pub(super) fn color_view(
        &mut self,
        device: &wgpu::Device,
        texture: RawTexture,
    ) -> Result<(&wgpu::TextureView, bool), HalError> {
        let back_buffer = match self.texture(texture)? {
            HwTexture::Owned { .. } => None,
            HwTexture::BackBuffer { swap_chain, .. } => Some(*swap_chain),
        };

        match back_buffer {
            None => match self.texture(texture)? {
                HwTexture::Owned { view, .. } => Ok((view, false)),
                HwTexture::BackBuffer { .. } => Err(HalError::invalid("texture", texture.id())),
            },
            Some(swap_chain) => {
                let chain = self.swap_chain_mut(swap_chain)?;
                let fresh = chain.acquired.is_none();
                Ok((&chain.acquire(device)?.view, fresh))
            }
        }
    }

    /// Gives back surface images acquired by a batch that was not submitted.
    pub(super) fn release_acquired(&mut self, swap_chains: &[RawSwapChain]) {
        for swap_chain in swap_chains {
            if let Some(chain) = self.swap_chains.get_mut(swap_chain) {
                chain.acquired = None;
            }
        }
    }
}

impl TrackedResources for Resources {
    fn tracked(&self, resource: ResourceId) -> Result<Tracked, HalError> {
        Ok(match resource {
            ResourceId::Buffer(b) => {
                let b = self.buffer(b)?;
                Tracked::Buffer {
                    label: b.desc.label,
                    size: b.desc.size,
                    state: b.state,
                }
            }
            ResourceId::Texture(t) => match self.texture(t)? {
                HwTexture::Owned { desc, state, .. } => Tracked::Texture {
                    label: desc.label,
                    depth: desc.format.is_depth(),
                    back_buffer: None,
                    state: *state,
                },
                HwTexture::BackBuffer {
                    swap_chain,
                    index,
                    state,
                } => Tracked::Texture {
                    label: "back buffer",
                    depth: false,
                    back_buffer: Some((*swap_chain, *index)),
                    state: *state,
                },
            },
        })
    }

    fn current_image(&self, swap_chain: RawSwapChain) -> Result<u32, HalError> {
        self.swap_chains
            .get(&swap_chain)
            .map(|chain| chain.current)
            .ok_or(HalError::invalid("swap chain", swap_chain.id()))
    }
}
