//! Loss functions used to drive gradient checks and training loops.
//!
//! Both losses sum over every element of the batch, so their gradients are
//! the per-element derivatives without any `1 / n_ex` factor.

use crate::error::{LayerError, Result};
use crate::utils::activations::Activation;
use crate::utils::tensor::{check_shape, Tensor};

/// A scalar loss over predictions and targets of the same shape.
pub trait Loss {
    /// Loss value for targets `y` and predictions `y_pred`.
    fn loss(&self, y: &Tensor, y_pred: &Tensor) -> Result<f64>;

    /// Gradient with respect to the pre-activation `z` of the output layer,
    /// where `y_pred = act(z)`.
    fn grad(&self, y: &Tensor, y_pred: &Tensor, z: &Tensor, act: Activation) -> Result<Tensor>;
}

/// `0.5 * sum((y_pred - y)^2)`
#[derive(Debug, Clone, Copy, Default)]
pub struct SquaredError;

impl Loss for SquaredError {
    fn loss(&self, y: &Tensor, y_pred: &Tensor) -> Result<f64> {
        check_shape("SquaredError", y.shape(), y_pred.shape())?;
        Ok(0.5 * (y_pred - y).mapv(|d| d * d).sum())
    }

    fn grad(&self, y: &Tensor, y_pred: &Tensor, z: &Tensor, act: Activation) -> Result<Tensor> {
        check_shape("SquaredError", y.shape(), y_pred.shape())?;
        check_shape("SquaredError", y.shape(), z.shape())?;
        Ok((y_pred - y) * act.grad(z))
    }
}

/// `-sum(y * ln(y_pred + eps))` for one-hot targets and softmax predictions.
#[derive(Debug, Clone, Copy)]
pub struct CrossEntropy {
    pub eps: f64,
}

impl Default for CrossEntropy {
    fn default() -> Self {
        Self {
            eps: f64::EPSILON,
        }
    }
}

impl Loss for CrossEntropy {
    fn loss(&self, y: &Tensor, y_pred: &Tensor) -> Result<f64> {
        check_shape("CrossEntropy", y.shape(), y_pred.shape())?;
        if y_pred.iter().any(|&p| !(0.0..=1.0).contains(&p)) {
            return Err(LayerError::InvalidConfig(
                "cross-entropy predictions must lie in [0, 1]".to_string(),
            ));
        }
        let eps = self.eps;
        Ok(-(y * &y_pred.mapv(|p| (p + eps).ln())).sum())
    }

    /// Assumes a softmax output layer, so the gradient with respect to the
    /// logits is `y_pred - y` and `z` and `act` are not consulted.
    fn grad(&self, y: &Tensor, y_pred: &Tensor, _z: &Tensor, _act: Activation) -> Result<Tensor> {
        check_shape("CrossEntropy", y.shape(), y_pred.shape())?;
        Ok(y_pred - y)
    }
}
