//! Descriptor storage.

mod heap;

pub use heap::{DescriptorHeap, DescriptorKind, DescriptorView};
