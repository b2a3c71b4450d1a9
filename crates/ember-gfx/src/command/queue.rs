use std::sync::Arc;

use super::CommandList;
use crate::error::{GfxError, GfxResult, SubmissionError};
use crate::hal::{Backend, RawQueue, SubmissionId};

/// Submission queue. Work executes in submission order.
pub struct Queue {
    backend: Arc<dyn Backend>,
    raw: RawQueue,
}

impl Queue {
    pub(crate) fn new(backend: Arc<dyn Backend>) -> GfxResult<Self> {
        let raw = backend
            .create_queue()
            .map_err(GfxError::resource("command queue"))?;
        Ok(Self { backend, raw })
    }

    pub fn raw(&self) -> RawQueue {
        self.raw
    }

    /// Submits closed lists as one batch, in order.
    ///
    /// Each list's allocator is stamped with the returned submission and may
    /// not be reset before the device has completed it.
    pub fn execute_command_lists(&self, lists: &[&CommandList]) -> GfxResult<SubmissionId> {
        if lists.iter().any(|l| l.is_recording()) {
            return Err(SubmissionError::NotClosed {
                op: "Queue::execute_command_lists",
            }
            .into());
        }

        let commands: Vec<_> = lists
            .iter()
            .flat_map(|l| l.commands().iter().cloned())
            .collect();
        let submission = self
            .backend
            .submit(self.raw, &commands)
            .map_err(SubmissionError::Device)?;

        for list in lists {
            list.allocator().stamp(submission);
        }

        log::trace!(
            "submission {} ({} lists, {} commands)",
            submission.get(),
            lists.len(),
            commands.len()
        );
        Ok(submission)
    }
}

impl Drop for Queue {
    fn drop(&mut self) {
        self.backend.destroy_queue(self.raw);
    }
}
