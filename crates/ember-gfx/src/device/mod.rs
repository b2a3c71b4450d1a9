//! Logical device.
//!
//! [`Device`] opens a backend (wgpu or soft) and creates queues, buffers,
//! textures, command storage, swap chains and descriptor heaps on it.

mod logical;

pub use logical::Device;
