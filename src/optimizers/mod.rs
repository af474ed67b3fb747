//! Parameter update policies.
//!
//! Layers accumulate gradients during `backward`; an [`Optimizer`] decides how
//! those gradients move the parameters when `update` runs. Plain gradient
//! descent ([`SGD`]) is the policy behind `Layer::update(lr)`.
//!
//! # Example
//!
//! ```ignore
//! use rust_neural_layers::optimizers::{Optimizer, SGD};
//!
//! let mut optimizer = SGD::new(0.01);
//! layer.update_with_optimizer(&mut optimizer)?;
//! ```

pub mod sgd;

pub use sgd::SGD;

use ndarray::{ArrayViewD, ArrayViewMutD};

/// Update rule applied to one parameter tensor at a time.
pub trait Optimizer {
    /// Move `parameters` using `gradients` of the same shape.
    ///
    /// `name` identifies the tensor inside its layer (`W`, `b`, `scaler`, ...)
    /// so that stateful policies can key per-parameter statistics.
    fn update(&mut self, name: &str, parameters: ArrayViewMutD<f64>, gradients: ArrayViewD<f64>);

    fn learning_rate(&self) -> f64;

    fn set_learning_rate(&mut self, lr: f64);
}
