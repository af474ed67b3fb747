//! Shared utilities for the layer implementations
//!
//! Random number generation, activation functions, weight initialisation,
//! padding arithmetic and tensor shape checks.

pub mod activations;
pub mod init;
pub mod padding;
pub mod rng;
pub mod tensor;

pub use rng::SimpleRng;
pub use tensor::Tensor;
