use std::rc::Rc;

use super::CommandAllocator;
use super::allocator::AllocatorTracker;
use crate::descriptor::DescriptorHeap;
use crate::error::{GfxResult, SubmissionError};
use crate::hal::{Command, HeapKind, ResourceId, ResourceState, ScissorRect, Viewport};
use crate::resource::Buffer;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum CommandListState {
    Recording,
    Closed,
}

/// Records commands for one submission.
///
/// `Closed --reset--> Recording --close--> Closed`. Only closed lists can be
/// submitted; only recording lists accept commands.
pub struct CommandList {
    state: CommandListState,
    commands: Vec<Command>,
    allocator: Rc<AllocatorTracker>,
}

impl CommandList {
    /// New lists start out recording, bound to `allocator`.
    pub(crate) fn new(allocator: &CommandAllocator) -> GfxResult<Self> {
        let tracker = Rc::clone(allocator.tracker());
        tracker.begin_recording("Device::create_command_list")?;
        Ok(Self {
            state: CommandListState::Recording,
            commands: Vec::new(),
            allocator: tracker,
        })
    }

    pub fn state(&self) -> CommandListState {
        self.state
    }

    pub fn is_recording(&self) -> bool {
        self.state == CommandListState::Recording
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    pub(crate) fn commands(&self) -> &[Command] {
        &self.commands
    }

    pub(crate) fn allocator(&self) -> &AllocatorTracker {
        &self.allocator
    }

    /// Starts a new recording into `allocator`, discarding previous commands.
    pub fn reset(&mut self, allocator: &CommandAllocator) -> GfxResult<()> {
        if self.state != CommandListState::Closed {
            return Err(SubmissionError::NotClosed {
                op: "CommandList::reset",
            }
            .into());
        }

        let tracker = Rc::clone(allocator.tracker());
        tracker.begin_recording("CommandList::reset")?;
        self.commands.clear();
        self.allocator = tracker;
        self.state = CommandListState::Recording;
        Ok(())
    }

    pub fn close(&mut self) -> GfxResult<()> {
        self.require_recording("CommandList::close")?;
        self.allocator.end_recording();
        self.state = CommandListState::Closed;
        Ok(())
    }

    pub fn set_viewport(&mut self, viewport: Viewport) -> GfxResult<()> {
        self.record("set_viewport", Command::SetViewport(viewport))
    }

    pub fn set_scissor_rect(&mut self, rect: ScissorRect) -> GfxResult<()> {
        self.record("set_scissor_rect", Command::SetScissorRect(rect))
    }

    pub fn resource_barrier(
        &mut self,
        resource: ResourceId,
        before: ResourceState,
        after: ResourceState,
    ) -> GfxResult<()> {
        self.require_recording("resource_barrier")?;
        if before == after {
            return Err(SubmissionError::InvalidBarrier(format!(
                "{resource:?} transitions from {before:?} to itself"
            ))
            .into());
        }
        self.record(
            "resource_barrier",
            Command::Transition {
                resource,
                before,
                after,
            },
        )
    }

    /// Copies `size` bytes from `src` at `src_offset` into `dst` at `dst_offset`.
    pub fn copy_buffer_region(
        &mut self,
        dst: &Buffer,
        dst_offset: u64,
        src: &Buffer,
        src_offset: u64,
        size: u64,
    ) -> GfxResult<()> {
        self.require_recording("copy_buffer_region")?;

        let invalid =
            |msg: String| -> GfxResult<()> { Err(SubmissionError::InvalidCopy(msg).into()) };
        if size == 0 {
            return invalid("empty copy".into());
        }
        if dst.raw() == src.raw() {
            return invalid(format!("source and destination are both `{}`", dst.desc().label));
        }
        if dst.heap() == HeapKind::Upload {
            return invalid(format!("`{}` is in the upload heap", dst.desc().label));
        }
        for (buffer, offset) in [(src, src_offset), (dst, dst_offset)] {
            if offset.checked_add(size).is_none_or(|end| end > buffer.size()) {
                return invalid(format!(
                    "{size} bytes at {offset} overrun `{}` ({} bytes)",
                    buffer.desc().label,
                    buffer.size()
                ));
            }
        }

        self.record(
            "copy_buffer_region",
            Command::CopyBufferRegion {
                dst: dst.raw(),
                dst_offset,
                src: src.raw(),
                src_offset,
                size,
            },
        )
    }

    /// Clears the render target stored at `index` of `heap`.
    pub fn clear_render_target_view(
        &mut self,
        heap: &DescriptorHeap,
        index: usize,
        color: [f32; 4],
    ) -> GfxResult<()> {
        self.require_recording("clear_render_target_view")?;
        let texture = heap.render_target(index)?;
        self.record(
            "clear_render_target_view",
            Command::ClearRenderTarget {
                texture: texture.raw(),
                color,
            },
        )
    }

    fn require_recording(&self, op: &'static str) -> GfxResult<()> {
        if self.state == CommandListState::Recording {
            Ok(())
        } else {
            Err(SubmissionError::NotRecording { op }.into())
        }
    }

    fn record(&mut self, op: &'static str, command: Command) -> GfxResult<()> {
        self.require_recording(op)?;
        self.commands.push(command);
        Ok(())
    }
}

impl Drop for CommandList {
    fn drop(&mut self) {
        if self.state == CommandListState::Recording {
            self.allocator.end_recording();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::config::DeviceConfig;
    use crate::device::Device;
    use crate::error::GfxError;
    use crate::hal::BufferDesc;
    use crate::sync::CompletionFence;

    fn buffer(device: &Device, heap: HeapKind, state: ResourceState) -> Buffer {
        device
            .create_buffer(&BufferDesc {
                label: "test",
                size: 64,
                heap,
                initial_state: state,
            })
            .unwrap()
    }

    #[test]
    fn state_machine_rejects_out_of_order_calls() {
        let device = Device::create(&DeviceConfig::soft()).unwrap();
        let queue = device.create_queue().unwrap();
        let allocator = device.create_command_allocator();
        let mut list = device.create_command_list(&allocator).unwrap();
        assert_eq!(list.state(), CommandListState::Recording);

        // Recording: cannot reset or submit.
        assert!(matches!(
            list.reset(&allocator),
            Err(GfxError::CommandSubmission(SubmissionError::NotClosed { .. }))
        ));
        assert!(queue.execute_command_lists(&[&list]).is_err());

        list.close().unwrap();

        // Closed: cannot record or close again.
        assert!(matches!(
            list.set_viewport(Viewport::full(4, 4)),
            Err(GfxError::CommandSubmission(SubmissionError::NotRecording { .. }))
        ));
        assert!(list.close().is_err());
        queue.execute_command_lists(&[&list]).unwrap();

        list.reset(&allocator).unwrap();
        assert!(list.is_empty());
        list.set_scissor_rect(ScissorRect::full(4, 4)).unwrap();
        assert_eq!(list.len(), 1);
    }

    #[test]
    fn allocator_cannot_be_reset_while_in_flight() {
        let device = Device::create(&DeviceConfig {
            soft_latency: Duration::from_millis(100),
            ..DeviceConfig::soft()
        })
        .unwrap();
        let queue = device.create_queue().unwrap();
        let mut fence = CompletionFence::new(&device).unwrap();
        let mut allocator = device.create_command_allocator();
        let mut list = device.create_command_list(&allocator).unwrap();

        assert!(allocator.reset().is_err(), "list still recording");
        list.close().unwrap();
        let submission = queue.execute_command_lists(&[&list]).unwrap();
        assert_eq!(allocator.last_submission(), submission);

        assert!(matches!(
            allocator.reset(),
            Err(GfxError::CommandSubmission(SubmissionError::AllocatorInUse { .. }))
        ));

        let label = fence.put_label(&queue).unwrap();
        fence.wait_for_label(label).unwrap();
        assert!(!allocator.is_in_flight());
        allocator.reset().unwrap();
    }

    #[test]
    fn allocator_takes_one_recording_list_at_a_time() {
        let device = Device::create(&DeviceConfig::soft()).unwrap();
        let mut allocator = device.create_command_allocator();
        let mut a = device.create_command_list(&allocator).unwrap();

        assert!(matches!(
            device.create_command_list(&allocator),
            Err(GfxError::CommandSubmission(SubmissionError::AllocatorRecording { .. }))
        ));

        let other = device.create_command_allocator();
        let mut b = device.create_command_list(&other).unwrap();
        b.close().unwrap();
        assert!(matches!(
            b.reset(&allocator),
            Err(GfxError::CommandSubmission(SubmissionError::AllocatorRecording { .. }))
        ));
        // The refused reset leaves `b` closed and `allocator` owned by `a`.
        assert_eq!(b.state(), CommandListState::Closed);
        assert!(matches!(
            allocator.reset(),
            Err(GfxError::CommandSubmission(SubmissionError::NotClosed { .. }))
        ));

        a.close().unwrap();
        allocator.reset().unwrap();
        b.reset(&allocator).unwrap();
        assert!(allocator.reset().is_err());

        drop(b);
        allocator.reset().unwrap();
    }

    #[test]
    fn invalid_barriers_and_copies_are_rejected_while_recording() {
        let device = Device::create(&DeviceConfig::soft()).unwrap();
        let allocator = device.create_command_allocator();
        let mut list = device.create_command_list(&allocator).unwrap();
        let gpu = buffer(&device, HeapKind::Default, ResourceState::CopyDest);
        let staging = buffer(&device, HeapKind::Upload, ResourceState::GenericRead);

        let same = list.resource_barrier(
            ResourceId::Buffer(gpu.raw()),
            ResourceState::CopyDest,
            ResourceState::CopyDest,
        );
        assert!(matches!(
            same,
            Err(GfxError::CommandSubmission(SubmissionError::InvalidBarrier(_)))
        ));

        let invalid_copy = |r: GfxResult<()>| {
            matches!(r, Err(GfxError::CommandSubmission(SubmissionError::InvalidCopy(_))))
        };
        assert!(invalid_copy(list.copy_buffer_region(&gpu, 0, &staging, 0, 0)));
        assert!(invalid_copy(list.copy_buffer_region(&gpu, 32, &staging, 0, 64)));
        assert!(invalid_copy(list.copy_buffer_region(&staging, 0, &gpu, 0, 16)));
        assert!(invalid_copy(list.copy_buffer_region(&gpu, 0, &gpu, 0, 16)));
        assert!(list.is_empty());

        list.copy_buffer_region(&gpu, 0, &staging, 0, 64).unwrap();
        assert_eq!(list.len(), 1);
    }
}
