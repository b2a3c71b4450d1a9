//! Presentation.

mod swap_chain;

pub use swap_chain::SwapChain;
