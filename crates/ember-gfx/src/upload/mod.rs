//! Persistently mapped, CPU-writable buffers.

mod layout;
mod mapped;

pub use layout::{CONSTANT_BUFFER_ALIGNMENT, ConstantBufferAligned, ElementLayout, Tight};
pub use mapped::{ConstantBuffer, MappedUploadBuffer, UploadBuffer};
