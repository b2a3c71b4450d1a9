use std::sync::Arc;

use crate::command::Queue;
use crate::error::{GfxError, GfxResult, SubmissionError};
use crate::hal::{
    Backend, PresentTarget, RawSwapChain, ResourceState, SwapChainDesc, TextureDesc, TextureUsage,
};
use crate::resource::Texture;

/// Flip-model presentation surface with a fixed ring of back buffers.
pub struct SwapChain {
    backend: Arc<dyn Backend>,
    raw: RawSwapChain,
    desc: SwapChainDesc,
    back_buffers: Vec<Texture>,
}

impl SwapChain {
    pub(crate) fn new(
        backend: Arc<dyn Backend>,
        queue: &Queue,
        target: &PresentTarget,
        desc: &SwapChainDesc,
    ) -> GfxResult<Self> {
        let raw = backend
            .create_swap_chain(queue.raw(), target, desc)
            .map_err(GfxError::resource("swap chain"))?;

        let image_desc = TextureDesc {
            label: "back buffer",
            width: desc.width,
            height: desc.height,
            format: desc.format,
            usage: TextureUsage::RenderTarget,
            initial_state: ResourceState::Present,
        };
        let mut back_buffers = Vec::with_capacity(desc.buffer_count as usize);
        for index in 0..desc.buffer_count {
            let image = match backend.swap_chain_image(raw, index) {
                Ok(image) => image,
                Err(e) => {
                    backend.destroy_swap_chain(raw);
                    return Err(GfxError::resource("back buffer")(e));
                }
            };
            back_buffers.push(Texture::borrowed(Arc::clone(&backend), image, image_desc));
        }

        log::debug!(
            "swap chain {}x{} {:?} with {} buffers",
            desc.width,
            desc.height,
            desc.format,
            desc.buffer_count
        );
        Ok(Self {
            backend,
            raw,
            desc: *desc,
            back_buffers,
        })
    }

    pub fn desc(&self) -> &SwapChainDesc {
        &self.desc
    }

    pub fn buffer_count(&self) -> u32 {
        self.desc.buffer_count
    }

    pub fn back_buffer(&self, index: u32) -> GfxResult<&Texture> {
        self.back_buffers
            .get(index as usize)
            .ok_or(GfxError::IndexOutOfBounds {
                index: index as usize,
                len: self.back_buffers.len(),
            })
    }

    /// Back buffer the next frame renders into.
    pub fn current_back_buffer_index(&self) -> GfxResult<u32> {
        self.backend
            .current_image_index(self.raw)
            .map_err(|e| SubmissionError::Device(e).into())
    }

    pub fn current_back_buffer(&self) -> GfxResult<&Texture> {
        self.back_buffer(self.current_back_buffer_index()?)
    }

    /// Queues the current back buffer for display and moves to the next one.
    pub fn present(&self, sync_interval: u32) -> GfxResult<()> {
        self.backend
            .present(self.raw, sync_interval)
            .map_err(|e| SubmissionError::Device(e).into())
    }
}

impl Drop for SwapChain {
    fn drop(&mut self) {
        self.backend.destroy_swap_chain(self.raw);
    }
}
