//! CPU/GPU completion tracking.

mod fence;

pub use fence::{CompletionFence, FenceId, Label};
