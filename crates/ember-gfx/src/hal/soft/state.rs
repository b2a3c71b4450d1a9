use std::collections::{HashMap, HashSet};

use crate::hal::memory::HostAllocation;
use crate::hal::{
    BufferDesc, Command, GpuAddress, HalError, RawBuffer, RawFence, RawQueue, RawSwapChain,
    RawTexture, ResourceId, ResourceState, TextureDesc,
};

pub(super) struct SoftBuffer {
    pub(super) desc: BufferDesc,
    pub(super) memory: HostAllocation,
    pub(super) address: GpuAddress,
    pub(super) state: ResourceState,
    pub(super) mapped: bool,
}

pub(super) struct SoftTexture {
    pub(super) desc: TextureDesc,
    pub(super) texels: Vec<u8>,
    pub(super) state: ResourceState,
    /// Set for back buffers; those are destroyed with their swap chain.
    pub(super) swap_chain: Option<RawSwapChain>,
}

pub(super) struct SoftSwapChain {
    pub(super) queue: RawQueue,
    pub(super) images: Vec<RawTexture>,
    pub(super) current: u32,
}

/// Everything the soft device knows, guarded by one mutex.
#[derive(Default)]
pub(super) struct DeviceState {
    pub(super) queues: HashSet<RawQueue>,
    pub(super) buffers: HashMap<RawBuffer, SoftBuffer>,
    pub(super) textures: HashMap<RawTexture, SoftTexture>,
    pub(super) fences: HashMap<RawFence, u64>,
    pub(super) swap_chains: HashMap<RawSwapChain, SoftSwapChain>,
    pub(super) completed_submission: u64,
    pub(super) presented_frames: u64,
    /// Removal reason once the device is lost. Never cleared.
    pub(super) lost: Option<String>,
}

impl DeviceState {
    pub(super) fn check_alive(&self) -> Result<(), HalError> {
        match &self.lost {
            Some(reason) => Err(HalError::DeviceLost(reason.clone())),
            None => Ok(()),
        }
    }

    pub(super) fn check_queue(&self, queue: RawQueue) -> Result<(), HalError> {
        if self.queues.contains(&queue) {
            Ok(())
        } else {
            Err(HalError::invalid("queue", queue.id()))
        }
    }

    pub(super) fn buffer(&self, buffer: RawBuffer) -> Result<&SoftBuffer, HalError> {
        self.buffers
            .get(&buffer)
            .ok_or(HalError::invalid("buffer", buffer.id()))
    }

    pub(super) fn buffer_mut(&mut self, buffer: RawBuffer) -> Result<&mut SoftBuffer, HalError> {
        self.buffers
            .get_mut(&buffer)
            .ok_or(HalError::invalid("buffer", buffer.id()))
    }

    pub(super) fn texture(&self, texture: RawTexture) -> Result<&SoftTexture, HalError> {
        self.textures
            .get(&texture)
            .ok_or(HalError::invalid("texture", texture.id()))
    }

    fn texture_mut(&mut self, texture: RawTexture) -> Result<&mut SoftTexture, HalError> {
        self.textures
            .get_mut(&texture)
            .ok_or(HalError::invalid("texture", texture.id()))
    }

    fn state_mut(&mut self, resource: ResourceId) -> Result<&mut ResourceState, HalError> {
        match resource {
            ResourceId::Buffer(b) => self.buffer_mut(b).map(|b| &mut b.state),
            ResourceId::Texture(t) => self.texture_mut(t).map(|t| &mut t.state),
        }
    }

    // ── GPU timeline ──────────────────────────────────────────────────────
    //
    // Errors returned from here remove the device.

    pub(super) fn execute(&mut self, commands: &[Command]) -> Result<(), String> {
        for (i, command) in commands.iter().enumerate() {
            self.execute_one(command)
                .map_err(|e| format!("command #{i} {}: {e}", command_name(command)))?;
        }
        Ok(())
    }

    fn execute_one(&mut self, command: &Command) -> Result<(), HalError> {
        match *command {
            Command::SetViewport(v) => {
                if v.width < 0.0 || v.height < 0.0 || v.min_depth > v.max_depth {
                    return Err(HalError::Validation(format!("malformed viewport {v:?}")));
                }
            }

            Command::SetScissorRect(s) => {
                if s.right < s.left || s.bottom < s.top {
                    return Err(HalError::Validation(format!("inverted scissor rect {s:?}")));
                }
            }

            Command::Transition {
                resource,
                before,
                after,
            } => {
                let state = self.state_mut(resource)?;
                if *state != before {
                    return Err(HalError::Validation(format!(
                        "{resource:?} is in state {state:?} but the barrier expects {before:?}"
                    )));
                }
                *state = after;
            }

            Command::CopyBufferRegion {
                dst,
                dst_offset,
                src,
                src_offset,
                size,
            } => {
                let src_buf = self.buffer(src)?;
                if !src_buf.state.is_copy_readable() {
                    return Err(HalError::Validation(format!(
                        "copy source {} is in state {:?}",
                        src.id(),
                        src_buf.state
                    )));
                }

                let dst_buf = self.buffer(dst)?;
                if dst_buf.state != ResourceState::CopyDest {
                    return Err(HalError::Validation(format!(
                        "copy destination {} is in state {:?}",
                        dst.id(),
                        dst_buf.state
                    )));
                }

                dst_buf
                    .memory
                    .copy_from(dst_offset, &src_buf.memory, src_offset, size)?;
            }

            Command::ClearRenderTarget { texture, color } => {
                let tex = self.texture_mut(texture)?;
                if tex.state != ResourceState::RenderTarget {
                    return Err(HalError::Validation(format!(
                        "cleared texture {} is in state {:?}",
                        texture.id(),
                        tex.state
                    )));
                }

                let texel = tex.desc.format.encode_color(color).ok_or_else(|| {
                    HalError::Validation(format!("texture {} is not a colour target", texture.id()))
                })?;

                for chunk in tex.texels.chunks_exact_mut(texel.len()) {
                    chunk.copy_from_slice(&texel);
                }
            }
        }

        Ok(())
    }

    pub(super) fn signal(&mut self, fence: RawFence, value: u64) -> Result<(), String> {
        let current = self
            .fences
            .get_mut(&fence)
            .ok_or_else(|| format!("signal of destroyed fence {}", fence.id()))?;
        *current = (*current).max(value);
        Ok(())
    }

    pub(super) fn present(&mut self, image: RawTexture) -> Result<(), String> {
        let tex = self.texture(image).map_err(|e| format!("present: {e}"))?;
        if tex.state != ResourceState::Present {
            return Err(format!(
                "present: back buffer {} is in state {:?}",
                image.id(),
                tex.state
            ));
        }
        self.presented_frames += 1;
        Ok(())
    }
}

fn command_name(command: &Command) -> &'static str {
    match command {
        Command::SetViewport(_) => "set-viewport",
        Command::SetScissorRect(_) => "set-scissor",
        Command::Transition { .. } => "transition",
        Command::CopyBufferRegion { .. } => "copy-buffer-region",
        Command::ClearRenderTarget { .. } => "clear-render-target",
    }
}
