//! Layer abstractions for neural networks
//!
//! This module provides the [`Layer`] trait and the layers built on it:
//! fully-connected, convolution, pooling, batch normalization, recurrent
//! cells, element-wise addition, and the [`Dropout`] wrapper.

mod r#trait;
pub mod add;
pub mod batchnorm;
pub mod conv2d;
pub mod dense;
pub mod dropout;
pub mod lstm;
pub mod pool2d;
pub mod rnn;
pub mod sequence;

pub use r#trait::Layer;
pub use add::Add;
pub use batchnorm::{BatchNorm1D, BatchNorm2D};
pub use conv2d::Conv2D;
pub use dense::FullyConnected;
pub use dropout::Dropout;
pub use lstm::LstmCell;
pub use pool2d::Pool2D;
pub use rnn::RnnCell;
pub use sequence::SequencePhase;

use ndarray::{Array, Dimension};

use crate::config::LayerConfig;
use crate::error::{LayerError, Result};
use crate::optimizers::Optimizer;

/// Fail with [`LayerError::Frozen`] unless the layer is trainable.
pub(crate) fn ensure_trainable(name: &str, trainable: bool) -> Result<()> {
    if trainable {
        Ok(())
    } else {
        Err(LayerError::Frozen(name.to_string()))
    }
}

/// Error for a checkpoint whose configuration describes another layer.
pub(crate) fn mismatch(expected: &str, found: &LayerConfig) -> LayerError {
    LayerError::LayerMismatch {
        expected: expected.to_string(),
        found: found.name().to_string(),
    }
}

/// Fail with [`LayerError::ShapeMismatch`] when a restored configuration
/// changes a structural dimension.
pub(crate) fn ensure_same_dims(
    name: &str,
    current: &[usize],
    restored: &[usize],
) -> Result<()> {
    if current == restored {
        Ok(())
    } else {
        Err(LayerError::shape(name, current, restored))
    }
}

/// Hand one parameter and its gradient to the optimizer.
pub(crate) fn step<D: Dimension>(
    optimizer: &mut dyn Optimizer,
    name: &str,
    param: &mut Array<f64, D>,
    grad: &Array<f64, D>,
) {
    optimizer.update(name, param.view_mut().into_dyn(), grad.view().into_dyn());
}
