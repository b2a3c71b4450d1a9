use thiserror::Error;

use crate::hal::HalError;

/// Errors surfaced by the rendering stack.
#[derive(Debug, Error)]
pub enum GfxError {
    #[error("device creation failed")]
    DeviceCreation(#[source] HalError),

    #[error("failed to create {what}")]
    ResourceCreation {
        what: &'static str,
        #[source]
        source: HalError,
    },

    #[error("command submission failed")]
    CommandSubmission(#[from] SubmissionError),

    #[error("synchronization failed")]
    Synchronization(#[from] SyncError),

    /// The device could not provide a wait primitive or worker.
    #[error("operating system primitive unavailable")]
    OsPrimitive(#[source] HalError),

    #[error("index {index} out of bounds for {len} elements")]
    IndexOutOfBounds { index: usize, len: usize },

    #[error("read-back failed")]
    ReadBack(#[source] HalError),
}

impl GfxError {
    /// Adapter for `map_err` on resource allocation paths.
    pub(crate) fn resource(what: &'static str) -> impl FnOnce(HalError) -> GfxError {
        move |source| match source {
            HalError::Os(_) => GfxError::OsPrimitive(source),
            source => GfxError::ResourceCreation { what, source },
        }
    }

    /// Whether the underlying device was removed.
    pub fn is_device_lost(&self) -> bool {
        match self {
            GfxError::DeviceCreation(e)
            | GfxError::ResourceCreation { source: e, .. }
            | GfxError::OsPrimitive(e)
            | GfxError::ReadBack(e) => e.is_device_lost(),
            GfxError::CommandSubmission(SubmissionError::Device(e))
            | GfxError::Synchronization(SyncError::Device(e)) => e.is_device_lost(),
            _ => false,
        }
    }
}

/// Misuse of the recording/submission protocol, or a rejected submission.
#[derive(Debug, Error)]
pub enum SubmissionError {
    #[error("`{op}` requires a recording command list")]
    NotRecording { op: &'static str },

    #[error("`{op}` requires a closed command list")]
    NotClosed { op: &'static str },

    #[error("`{op}`: another command list is still recording into the allocator")]
    AllocatorRecording { op: &'static str },

    #[error("allocator still in use by submission {pending} (device completed {completed})")]
    AllocatorInUse { pending: u64, completed: u64 },

    #[error("invalid barrier: {0}")]
    InvalidBarrier(String),

    #[error("invalid copy: {0}")]
    InvalidCopy(String),

    #[error("invalid descriptor: {0}")]
    InvalidDescriptor(String),

    #[error(transparent)]
    Device(HalError),
}

/// Failure to observe GPU completion.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("label {label} was issued by fence {label_fence}, not fence {fence}")]
    ForeignLabel {
        label: u64,
        label_fence: u64,
        fence: u64,
    },

    #[error("label {value} is ahead of the last issued label {issued}")]
    NotIssued { value: u64, issued: u64 },

    #[error("timed out waiting for label {value} (completed {completed})")]
    Timeout { value: u64, completed: u64 },

    #[error(transparent)]
    Device(HalError),
}

pub type GfxResult<T> = Result<T, GfxError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn os_failures_map_to_os_primitive() {
        let e = GfxError::resource("fence")(HalError::Os("no threads".into()));
        assert!(matches!(e, GfxError::OsPrimitive(_)));

        let e = GfxError::resource("buffer")(HalError::OutOfMemory(64));
        assert!(matches!(e, GfxError::ResourceCreation { what: "buffer", .. }));
    }

    #[test]
    fn device_loss_is_visible_through_wrappers() {
        let lost = HalError::DeviceLost("reset".into());
        assert!(GfxError::Synchronization(SyncError::Device(lost.clone())).is_device_lost());
        assert!(GfxError::CommandSubmission(SubmissionError::Device(lost)).is_device_lost());
        assert!(!GfxError::IndexOutOfBounds { index: 3, len: 2 }.is_device_lost());
    }
}
