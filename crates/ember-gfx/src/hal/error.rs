use thiserror::Error;

/// Failure reported by a [`super::Backend`].
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum HalError {
    #[error("out of memory allocating {0} bytes")]
    OutOfMemory(u64),

    #[error("invalid {kind} handle {id}")]
    InvalidHandle { kind: &'static str, id: u64 },

    #[error("device lost: {0}")]
    DeviceLost(String),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("surface error: {0}")]
    Surface(String),

    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("no compatible adapter: {0}")]
    NoAdapter(String),

    #[error("operating system error: {0}")]
    Os(String),
}

impl HalError {
    pub(crate) fn invalid(kind: &'static str, id: u64) -> Self {
        HalError::InvalidHandle { kind, id }
    }

    pub fn is_device_lost(&self) -> bool {
        matches!(self, HalError::DeviceLost(_))
    }
}
