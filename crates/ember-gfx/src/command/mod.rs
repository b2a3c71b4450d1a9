//! Command recording and submission.
//!
//! A [`CommandList`] records into storage owned by a [`CommandAllocator`].
//! The allocator may only be reset once the device has finished the last
//! submission that used it; the [`Queue`] stamps allocators at submit time so
//! that this can be checked.

mod allocator;
mod list;
mod queue;

pub use allocator::CommandAllocator;
pub use list::{CommandList, CommandListState};
pub use queue::Queue;
