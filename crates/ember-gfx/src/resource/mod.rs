//! Owned GPU resources.

mod buffer;
mod texture;

pub use buffer::Buffer;
pub use texture::Texture;
