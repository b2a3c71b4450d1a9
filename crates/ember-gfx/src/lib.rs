//! Ember graphics core.
//!
//! An explicit, D3D12-style GPU stack: a logical [`Device`], queues with
//! value fences, persistently mapped upload buffers, recorded command lists,
//! descriptor heaps and flip-model swap chains, driven by a
//! [`RenderingSystem`] that clears and presents one frame at a time.
//!
//! Everything runs on either the wgpu backend or the host-memory soft
//! backend (see [`hal`]).

pub mod command;
pub mod config;
pub mod descriptor;
pub mod device;
mod error;
pub mod hal;
pub mod logging;
pub mod present;
pub mod render;
pub mod resource;
pub mod sync;
pub mod upload;

pub use config::{DeviceConfig, RenderConfig, ValidationMode};
pub use device::Device;
pub use error::{GfxError, GfxResult, SubmissionError, SyncError};
pub use render::RenderingSystem;
