//! The clear-and-present renderer.

mod frame_data;
mod system;

pub use frame_data::{ObjectConstants, TRIANGLE, Vertex};
pub use system::RenderingSystem;
