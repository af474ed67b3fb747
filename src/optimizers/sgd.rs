//! Stochastic gradient descent: `parameter = parameter - learning_rate * gradient`

use ndarray::{ArrayViewD, ArrayViewMutD};

use crate::optimizers::Optimizer;

/// Vanilla gradient descent without momentum.
///
/// # Example
///
/// ```
/// use ndarray::arr1;
/// use rust_neural_layers::optimizers::{Optimizer, SGD};
///
/// let mut optimizer = SGD::new(0.1);
/// let mut params = arr1(&[1.0, 2.0, 3.0]).into_dyn();
/// let grads = arr1(&[0.1, 0.2, 0.3]).into_dyn();
///
/// optimizer.update("W", params.view_mut(), grads.view());
/// assert!((params[[0]] - 0.99).abs() < 1e-12);
/// ```
#[derive(Debug, Clone)]
pub struct SGD {
    learning_rate: f64,
}

impl SGD {
    pub fn new(learning_rate: f64) -> Self {
        Self { learning_rate }
    }
}

impl Optimizer for SGD {
    fn update(&mut self, _name: &str, mut parameters: ArrayViewMutD<f64>, gradients: ArrayViewD<f64>) {
        parameters.scaled_add(-self.learning_rate, &gradients);
    }

    fn learning_rate(&self) -> f64 {
        self.learning_rate
    }

    fn set_learning_rate(&mut self, lr: f64) {
        self.learning_rate = lr;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::arr2;

    #[test]
    fn test_sgd_step() {
        let mut optimizer = SGD::new(0.5);
        let mut w = arr2(&[[1.0, -1.0], [0.0, 2.0]]).into_dyn();
        let g = arr2(&[[2.0, 2.0], [-1.0, 0.0]]).into_dyn();

        optimizer.update("W", w.view_mut(), g.view());

        assert_abs_diff_eq!(w[[0, 0]], 0.0);
        assert_abs_diff_eq!(w[[0, 1]], -2.0);
        assert_abs_diff_eq!(w[[1, 0]], 0.5);
        assert_abs_diff_eq!(w[[1, 1]], 2.0);
    }

    #[test]
    fn test_set_learning_rate() {
        let mut optimizer = SGD::new(0.01);
        optimizer.set_learning_rate(0.1);
        assert_eq!(optimizer.learning_rate(), 0.1);
    }
}
