//! Activation functions used by the layers.
//!
//! Every activation exposes the same two operations the layers rely on:
//! `apply(z)` and `grad(z)`, the element-wise derivative evaluated at the
//! pre-activation `z` (not at the activation output).

use ndarray::{Axis, Ix2};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{LayerError, Result};
use crate::utils::tensor::Tensor;

/// Element-wise activation function.
///
/// Serialised in snake case, e.g. `"tanh"` or `{"leaky_relu": {"alpha": 0.3}}`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Activation {
    #[default]
    Identity,
    Sigmoid,
    Tanh,
    Relu,
    LeakyRelu { alpha: f64 },
    Elu { alpha: f64 },
}

impl Activation {
    pub fn apply_scalar(&self, z: f64) -> f64 {
        match *self {
            Activation::Identity => z,
            Activation::Sigmoid => sigmoid(z),
            Activation::Tanh => z.tanh(),
            Activation::Relu => z.max(0.0),
            Activation::LeakyRelu { alpha } => {
                if z > 0.0 {
                    z
                } else {
                    alpha * z
                }
            }
            Activation::Elu { alpha } => {
                if z > 0.0 {
                    z
                } else {
                    alpha * (z.exp() - 1.0)
                }
            }
        }
    }

    /// Derivative of the activation with respect to its input, at `z`.
    pub fn grad_scalar(&self, z: f64) -> f64 {
        match *self {
            Activation::Identity => 1.0,
            Activation::Sigmoid => {
                let s = sigmoid(z);
                s * (1.0 - s)
            }
            Activation::Tanh => 1.0 - z.tanh().powi(2),
            Activation::Relu => {
                if z > 0.0 {
                    1.0
                } else {
                    0.0
                }
            }
            Activation::LeakyRelu { alpha } => {
                if z > 0.0 {
                    1.0
                } else {
                    alpha
                }
            }
            Activation::Elu { alpha } => {
                if z > 0.0 {
                    1.0
                } else {
                    alpha * z.exp()
                }
            }
        }
    }

    /// Reject slopes that would make the activation non-monotone or non-finite.
    pub fn validate(&self) -> Result<()> {
        match *self {
            Activation::LeakyRelu { alpha } | Activation::Elu { alpha }
                if !alpha.is_finite() || alpha < 0.0 =>
            {
                Err(LayerError::InvalidConfig(format!(
                    "{} needs a finite, non-negative alpha, got {}",
                    self, alpha
                )))
            }
            _ => Ok(()),
        }
    }

    pub fn apply(&self, z: &Tensor) -> Tensor {
        z.mapv(|v| self.apply_scalar(v))
    }

    pub fn grad(&self, z: &Tensor) -> Tensor {
        z.mapv(|v| self.grad_scalar(v))
    }
}

impl fmt::Display for Activation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Activation::Identity => write!(f, "Identity"),
            Activation::Sigmoid => write!(f, "Sigmoid"),
            Activation::Tanh => write!(f, "Tanh"),
            Activation::Relu => write!(f, "ReLU"),
            Activation::LeakyRelu { alpha } => write!(f, "LeakyReLU(alpha={})", alpha),
            Activation::Elu { alpha } => write!(f, "ELU(alpha={})", alpha),
        }
    }
}

/// Logistic sigmoid, stable for large negative inputs.
pub fn sigmoid(z: f64) -> f64 {
    if z >= 0.0 {
        1.0 / (1.0 + (-z).exp())
    } else {
        let e = z.exp();
        e / (1.0 + e)
    }
}

/// Row-wise softmax of a 2-D tensor, using the max-subtraction trick.
pub fn softmax_rows(z: &Tensor) -> Result<Tensor> {
    let z2 = z
        .view()
        .into_dimensionality::<Ix2>()
        .map_err(|_| LayerError::shape("softmax", &[0, 0], z.shape()))?;
    let mut out = z2.to_owned();
    for mut row in out.axis_iter_mut(Axis(0)) {
        let max = row.fold(f64::NEG_INFINITY, |m, &v| m.max(v));
        row.mapv_inplace(|v| (v - max).exp());
        let sum = row.sum();
        row.mapv_inplace(|v| v / sum);
    }
    Ok(out.into_dyn())
}
