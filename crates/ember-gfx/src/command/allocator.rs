use std::cell::Cell;
use std::rc::Rc;
use std::sync::Arc;

use crate::error::{GfxResult, SubmissionError};
use crate::hal::{Backend, SubmissionId};

/// Bookkeeping shared between an allocator and the lists recording into it.
#[derive(Debug, Default)]
pub(crate) struct AllocatorTracker {
    last_submission: Cell<SubmissionId>,
    /// Set while a list records into the allocator.
    recording: Cell<bool>,
}

impl AllocatorTracker {
    pub(crate) fn stamp(&self, submission: SubmissionId) {
        self.last_submission.set(submission);
    }

    /// Marks a list as recording into this allocator.
    ///
    /// Only one list may record into an allocator at a time.
    pub(crate) fn begin_recording(&self, op: &'static str) -> GfxResult<()> {
        if self.recording.replace(true) {
            return Err(SubmissionError::AllocatorRecording { op }.into());
        }
        Ok(())
    }

    pub(crate) fn end_recording(&self) {
        self.recording.set(false);
    }
}

/// Backing storage for recorded commands.
pub struct CommandAllocator {
    backend: Arc<dyn Backend>,
    tracker: Rc<AllocatorTracker>,
}

impl CommandAllocator {
    pub(crate) fn new(backend: Arc<dyn Backend>) -> Self {
        Self {
            backend,
            tracker: Rc::default(),
        }
    }

    pub(crate) fn tracker(&self) -> &Rc<AllocatorTracker> {
        &self.tracker
    }

    /// Last submission that executed commands from this allocator.
    pub fn last_submission(&self) -> SubmissionId {
        self.tracker.last_submission.get()
    }

    /// Whether the device may still be reading commands from this allocator.
    pub fn is_in_flight(&self) -> bool {
        self.last_submission() > self.backend.completed_submission()
    }

    /// Reclaims the storage for new recording.
    pub fn reset(&mut self) -> GfxResult<()> {
        if self.tracker.recording.get() {
            return Err(SubmissionError::NotClosed {
                op: "CommandAllocator::reset",
            }
            .into());
        }

        let completed = self.backend.completed_submission();
        let pending = self.last_submission();
        if pending > completed {
            return Err(SubmissionError::AllocatorInUse {
                pending: pending.get(),
                completed: completed.get(),
            }
            .into());
        }
        Ok(())
    }
}
