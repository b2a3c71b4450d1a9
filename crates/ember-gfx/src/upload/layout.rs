/// Placement granularity of constant buffer views.
pub const CONSTANT_BUFFER_ALIGNMENT: u64 = 256;

/// Spacing of consecutive elements in an upload buffer.
pub trait ElementLayout {
    fn stride(element_size: usize) -> u64;
}

/// Elements packed back to back.
#[derive(Debug, Copy, Clone, Default)]
pub struct Tight;

impl ElementLayout for Tight {
    fn stride(element_size: usize) -> u64 {
        element_size as u64
    }
}

/// Every element starts on a constant-buffer boundary.
#[derive(Debug, Copy, Clone, Default)]
pub struct ConstantBufferAligned;

impl ElementLayout for ConstantBufferAligned {
    fn stride(element_size: usize) -> u64 {
        // Type sizes never exceed `isize::MAX`, so this cannot overflow.
        (element_size as u64).next_multiple_of(CONSTANT_BUFFER_ALIGNMENT)
    }
}
