//! Whole-batch checks for the wgpu backend.
//!
//! A submission is checked against a scratch copy of the tracked states
//! before anything is encoded, so a rejected batch leaves every tracked
//! state, mirror and surface image as it was.

use std::collections::HashMap;

use crate::hal::{Command, HalError, RawSwapChain, ResourceId, ResourceState};

/// What batch checks need to know about one resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum Tracked {
    Buffer {
        label: &'static str,
        size: u64,
        state: ResourceState,
    },
    Texture {
        label: &'static str,
        depth: bool,
        /// Swap chain and image index, for back buffers.
        back_buffer: Option<(RawSwapChain, u32)>,
        state: ResourceState,
    },
}

impl Tracked {
    fn state(&self) -> ResourceState {
        match self {
            Tracked::Buffer { state, .. } | Tracked::Texture { state, .. } => *state,
        }
    }
}

/// Read-only view of the tracked resources.
pub(super) trait TrackedResources {
    fn tracked(&self, resource: ResourceId) -> Result<Tracked, HalError>;

    /// Index of the image the swap chain renders into next.
    fn current_image(&self, swap_chain: RawSwapChain) -> Result<u32, HalError>;
}

/// States to commit once a checked batch has been encoded.
pub(super) type StatePlan = HashMap<ResourceId, ResourceState>;

/// Checks `commands` in order, with each barrier applied to a scratch state.
pub(super) fn plan(
    resources: &impl TrackedResources,
    commands: &[Command],
) -> Result<StatePlan, HalError> {
    let mut states = StatePlan::new();
    let state_of = |states: &StatePlan, id: ResourceId| -> Result<ResourceState, HalError> {
        match states.get(&id) {
            Some(state) => Ok(*state),
            None => Ok(resources.tracked(id)?.state()),
        }
    };

    for command in commands {
        match *command {
            Command::SetViewport(_) | Command::SetScissorRect(_) => {}
            Command::Transition {
                resource,
                before,
                after,
            } => {
                let state = state_of(&states, resource)?;
                if state != before {
                    return Err(HalError::Validation(format!(
                        "{resource:?} transitioned from {before:?} but is in {state:?}"
                    )));
                }
                states.insert(resource, after);
            }
            Command::CopyBufferRegion {
                dst,
                dst_offset,
                src,
                src_offset,
                size,
            } => {
                if src == dst {
                    return Err(HalError::Unsupported("copy within one buffer".into()));
                }
                let (src_id, dst_id) = (ResourceId::Buffer(src), ResourceId::Buffer(dst));
                let Tracked::Buffer {
                    label: from,
                    size: from_len,
                    ..
                } = resources.tracked(src_id)?
                else {
                    return Err(HalError::invalid("buffer", src.id()));
                };
                let Tracked::Buffer {
                    label: to,
                    size: to_len,
                    ..
                } = resources.tracked(dst_id)?
                else {
                    return Err(HalError::invalid("buffer", dst.id()));
                };
                let from_state = state_of(&states, src_id)?;
                let to_state = state_of(&states, dst_id)?;
                if !from_state.is_copy_readable() || to_state != ResourceState::CopyDest {
                    return Err(HalError::Validation(format!(
                        "copy `{from}` ({from_state:?}) -> `{to}` ({to_state:?})"
                    )));
                }
                let fits =
                    |offset: u64, len: u64| offset.checked_add(size).is_some_and(|end| end <= len);
                if !fits(src_offset, from_len) || !fits(dst_offset, to_len) {
                    return Err(HalError::Validation(format!(
                        "copy of {size} bytes out of range"
                    )));
                }
                if src_offset % wgpu::COPY_BUFFER_ALIGNMENT != 0
                    || dst_offset % wgpu::COPY_BUFFER_ALIGNMENT != 0
                {
                    return Err(HalError::Unsupported(
                        "copy offsets must be 4-byte aligned".into(),
                    ));
                }
            }
            Command::ClearRenderTarget { texture, .. } => {
                let id = ResourceId::Texture(texture);
                let Tracked::Texture {
                    label,
                    depth,
                    back_buffer,
                    ..
                } = resources.tracked(id)?
                else {
                    return Err(HalError::invalid("texture", texture.id()));
                };
                let state = state_of(&states, id)?;
                if state != ResourceState::RenderTarget {
                    return Err(HalError::Validation(format!(
                        "clear of `{label}` in {state:?} state"
                    )));
                }
                if depth {
                    return Err(HalError::Validation(format!(
                        "colour clear of depth texture `{label}`"
                    )));
                }
                if let Some((swap_chain, index)) = back_buffer {
                    let current = resources.current_image(swap_chain)?;
                    if index != current {
                        return Err(HalError::Validation(format!(
                            "back buffer {index} cleared while {current} is current"
                        )));
                    }
                }
            }
        }
    }
    Ok(states)
}
