//! Dropout wrapper
//!
//! [`Dropout`] decorates any layer that consumes a single tensor. In
//! training mode each forward pass draws a fresh keep-mask, zeroes the
//! dropped input units and hands the masked input to the wrapped layer. The
//! matching backward pass applies the same mask to the input gradient.
//!
//! Kept units are not rescaled, so a frozen (inference-mode) wrapper simply
//! forwards its input unchanged.

use log::{debug, trace, warn};

use crate::config::{Hyperparameters, Summary, WrapperConfig};
use crate::error::{LayerError, Result};
use crate::layers::Layer;
use crate::optimizers::Optimizer;
use crate::params::{ParamDict, TensorMap};
use crate::utils::rng::SimpleRng;
use crate::utils::tensor::Tensor;

/// Dropout applied to the input of the wrapped layer.
///
/// # Fields
///
/// * `inner` - The wrapped layer
/// * `p` - Probability of dropping each input unit, in `[0, 1)`
/// * `rng` - Random number generator for the masks
/// * `mask` - Keep-mask of the last training-mode forward pass
///
/// # Example
///
/// ```
/// use ndarray::Array2;
/// use rust_neural_layers::config::FullyConnectedConfig;
/// use rust_neural_layers::layers::{Dropout, FullyConnected, Layer};
/// use rust_neural_layers::utils::SimpleRng;
///
/// let mut rng = SimpleRng::new(42);
/// let config = FullyConnectedConfig {
///     n_in: 8,
///     n_out: 2,
///     act_fn: Default::default(),
///     init: Default::default(),
/// };
/// let dense = FullyConnected::new(config, &mut rng).unwrap();
/// let mut layer = Dropout::new(dense, 0.5, SimpleRng::new(7)).unwrap();
///
/// let y = layer.forward(&Array2::<f64>::ones((4, 8)).into_dyn()).unwrap();
/// assert_eq!(y.shape(), &[4, 2]);
/// assert_eq!(layer.summary().layer_wrappers, vec!["Dropout".to_string()]);
/// ```
#[derive(Debug, Clone)]
pub struct Dropout<L> {
    inner: L,
    p: f64,
    rng: SimpleRng,
    mask: Option<Tensor>,
}

impl<L> Dropout<L>
where
    L: Layer<Input = Tensor>,
{
    /// Wrap `inner` with dropout probability `p`.
    ///
    /// # Errors
    ///
    /// Returns [`LayerError::InvalidConfig`] unless `0 <= p < 1`.
    pub fn new(inner: L, p: f64, rng: SimpleRng) -> Result<Self> {
        validate_p(p)?;
        Ok(Self {
            inner,
            p,
            rng,
            mask: None,
        })
    }

    pub fn p(&self) -> f64 {
        self.p
    }

    pub fn inner(&self) -> &L {
        &self.inner
    }

    pub fn inner_mut(&mut self) -> &mut L {
        &mut self.inner
    }

    pub fn into_inner(self) -> L {
        self.inner
    }

    /// Keep-mask of the most recent training-mode forward pass.
    pub fn mask(&self) -> Option<&Tensor> {
        self.mask.as_ref()
    }
}

fn validate_p(p: f64) -> Result<()> {
    if (0.0..1.0).contains(&p) {
        Ok(())
    } else {
        Err(LayerError::InvalidConfig(format!(
            "dropout probability must be in [0, 1), got {}",
            p
        )))
    }
}

impl<L> Layer for Dropout<L>
where
    L: Layer<Input = Tensor>,
{
    type Input = Tensor;
    type Output = L::Output;

    fn forward(&mut self, input: &Tensor) -> Result<L::Output> {
        if !self.inner.is_trainable() {
            self.mask = None;
            return self.inner.forward(input);
        }

        let keep = 1.0 - self.p;
        let rng = &mut self.rng;
        let mask = Tensor::from_shape_simple_fn(input.raw_dim(), || {
            if rng.bernoulli(keep) {
                1.0
            } else {
                0.0
            }
        });
        let masked = input * &mask;
        trace!(
            "Dropout: kept {} of {} units",
            mask.iter().filter(|&&m| m > 0.0).count(),
            mask.len()
        );
        self.mask = Some(mask);
        self.inner.forward(&masked)
    }

    fn backward(&mut self, grad_output: &Tensor) -> Result<Tensor> {
        let dx = self.inner.backward(grad_output)?;
        match &self.mask {
            Some(mask) if mask.shape() == dx.shape() => Ok(dx * mask),
            Some(mask) => Err(LayerError::shape("Dropout", mask.shape(), dx.shape())),
            None => Ok(dx),
        }
    }

    fn name(&self) -> &'static str {
        self.inner.name()
    }

    fn parameters(&self) -> ParamDict {
        self.inner.parameters()
    }

    fn gradients(&self) -> ParamDict {
        self.inner.gradients()
    }

    fn hyperparameters(&self) -> Hyperparameters {
        let mut hp = self.inner.hyperparameters();
        hp.wrappers.push(WrapperConfig::Dropout { p: self.p });
        hp
    }

    fn derived_variables(&self) -> TensorMap {
        let mut vars = self.inner.derived_variables();
        if let Some(mask) = &self.mask {
            vars.insert("dropout_mask".to_string(), mask.clone());
        }
        vars
    }

    fn is_trainable(&self) -> bool {
        self.inner.is_trainable()
    }

    fn freeze(&mut self) {
        self.inner.freeze();
    }

    fn unfreeze(&mut self) {
        self.inner.unfreeze();
    }

    fn flush_gradients(&mut self) -> Result<()> {
        self.inner.flush_gradients()?;
        self.mask = None;
        Ok(())
    }

    fn update_with_optimizer(&mut self, optimizer: &mut dyn Optimizer) -> Result<()> {
        self.inner.update_with_optimizer(optimizer)
    }

    fn update(&mut self, learning_rate: f64) -> Result<()> {
        self.inner.update(learning_rate)?;
        self.mask = None;
        Ok(())
    }

    fn set_params(&mut self, summary: &Summary) -> Result<()> {
        match summary.hyperparameters.wrappers.last() {
            Some(WrapperConfig::Dropout { p }) => {
                validate_p(*p)?;
                self.p = *p;
                debug!("Dropout: restored p = {}", p);
            }
            None => warn!(
                "summary for {} carries no wrapper, keeping dropout p = {}",
                summary.layer, self.p
            ),
        }
        self.inner.set_params(&summary.without_outer_wrapper())
    }
}
