//! Layer trait definition
//!
//! Every layer and composite module implements [`Layer`]: a stateful unit
//! with a hand-written forward pass, an exact analytic backward pass, and a
//! uniform interface for parameters, gradients, freezing and checkpoints.

use log::debug;

use crate::config::{Hyperparameters, Summary};
use crate::error::Result;
use crate::optimizers::{Optimizer, SGD};
use crate::params::{ParamDict, TensorMap};
use crate::utils::tensor::Tensor;

/// Core trait for neural network layers.
///
/// `Input` is what `forward` consumes and what `backward` returns the
/// gradient of: a single tensor for most layers, a list of tensors for
/// `Add`. `Output` is a tensor, or `(a_t, C_t)` for the LSTM cell.
///
/// # Example
///
/// ```ignore
/// let y = layer.forward(&x)?;
/// let dx = layer.backward(&dldy)?;
/// layer.update(0.01)?;
/// ```
pub trait Layer {
    type Input;
    type Output;

    /// Forward propagation.
    ///
    /// Validates the input shape and caches whatever the matching backward
    /// call needs. Frozen layers run in inference mode.
    ///
    /// # Arguments
    ///
    /// * `input` - Channel-last input tensor(s)
    fn forward(&mut self, input: &Self::Input) -> Result<Self::Output>;

    /// Backward propagation.
    ///
    /// Accumulates parameter gradients and returns the gradient of the loss
    /// with respect to the input of the cached forward call.
    ///
    /// # Arguments
    ///
    /// * `grad_output` - Gradient of the loss with respect to the layer output
    ///
    /// # Errors
    ///
    /// Fails when the layer is frozen, when no forward pass is cached, or
    /// when `grad_output` does not match the cached output shape.
    fn backward(&mut self, grad_output: &Tensor) -> Result<Self::Input>;

    /// Layer name used in summaries and error messages.
    fn name(&self) -> &'static str;

    fn parameters(&self) -> ParamDict;

    /// Accumulated gradients, keyed like the trainable parameters.
    fn gradients(&self) -> ParamDict;

    fn hyperparameters(&self) -> Hyperparameters;

    /// Intermediate values of the most recent forward/backward calls.
    fn derived_variables(&self) -> TensorMap {
        TensorMap::new()
    }

    fn is_trainable(&self) -> bool;

    fn freeze(&mut self);

    fn unfreeze(&mut self);

    /// Zero the accumulated gradients and drop transient caches.
    fn flush_gradients(&mut self) -> Result<()>;

    /// Apply `optimizer` to every trainable parameter. Gradients are kept.
    fn update_with_optimizer(&mut self, optimizer: &mut dyn Optimizer) -> Result<()>;

    /// Plain gradient-descent step followed by a gradient flush.
    ///
    /// # Arguments
    ///
    /// * `learning_rate` - Step size
    fn update(&mut self, learning_rate: f64) -> Result<()> {
        let mut optimizer = SGD::new(learning_rate);
        self.update_with_optimizer(&mut optimizer)?;
        debug!("{}: updated with learning rate {}", self.name(), learning_rate);
        self.flush_gradients()
    }

    /// Restore parameters and hyperparameters from a checkpoint.
    fn set_params(&mut self, summary: &Summary) -> Result<()>;

    fn summary(&self) -> Summary {
        Summary::new(self.hyperparameters(), self.parameters())
    }

    /// Number of trainable scalars.
    fn parameter_count(&self) -> usize {
        self.gradients().element_count()
    }
}

impl<L: Layer + ?Sized> Layer for Box<L> {
    type Input = L::Input;
    type Output = L::Output;

    fn forward(&mut self, input: &Self::Input) -> Result<Self::Output> {
        (**self).forward(input)
    }

    fn backward(&mut self, grad_output: &Tensor) -> Result<Self::Input> {
        (**self).backward(grad_output)
    }

    fn name(&self) -> &'static str {
        (**self).name()
    }

    fn parameters(&self) -> ParamDict {
        (**self).parameters()
    }

    fn gradients(&self) -> ParamDict {
        (**self).gradients()
    }

    fn hyperparameters(&self) -> Hyperparameters {
        (**self).hyperparameters()
    }

    fn derived_variables(&self) -> TensorMap {
        (**self).derived_variables()
    }

    fn is_trainable(&self) -> bool {
        (**self).is_trainable()
    }

    fn freeze(&mut self) {
        (**self).freeze()
    }

    fn unfreeze(&mut self) {
        (**self).unfreeze()
    }

    fn flush_gradients(&mut self) -> Result<()> {
        (**self).flush_gradients()
    }

    fn update_with_optimizer(&mut self, optimizer: &mut dyn Optimizer) -> Result<()> {
        (**self).update_with_optimizer(optimizer)
    }

    fn update(&mut self, learning_rate: f64) -> Result<()> {
        (**self).update(learning_rate)
    }

    fn set_params(&mut self, summary: &Summary) -> Result<()> {
        (**self).set_params(summary)
    }

    fn summary(&self) -> Summary {
        (**self).summary()
    }

    fn parameter_count(&self) -> usize {
        (**self).parameter_count()
    }
}
