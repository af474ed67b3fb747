//! Batch normalization layers
//!
//! [`BatchNorm1D`] normalizes `(n_ex, n_in)` inputs per feature.
//! [`BatchNorm2D`] normalizes `(n_ex, rows, cols, n_in)` inputs per channel,
//! pooling the statistics over examples and both spatial axes.
//!
//! # Batch Normalization Theory
//!
//! 1. Compute batch statistics: mean μ and biased variance σ² per channel
//! 2. Normalize: x̂ = (x - μ) / sqrt(σ² + ε)
//! 3. Scale and shift: y = γ x̂ + β
//!
//! During training the running statistics follow an exponential moving
//! average, `running = momentum * running + (1 - momentum) * batch`. A frozen
//! layer normalizes with the running statistics instead.
//!
//! # References
//!
//! Ioffe, S., & Szegedy, C. (2015). Batch Normalization: Accelerating Deep Network Training
//! by Reducing Internal Covariate Shift. ICML.

use log::{debug, trace};
use ndarray::{Array1, Array2, ArrayView2, Axis, IxDyn};

use crate::config::{BatchNormConfig, Hyperparameters, LayerConfig, Summary};
use crate::error::{LayerError, Result};
use crate::layers::{ensure_same_dims, ensure_trainable, mismatch, step, Layer};
use crate::optimizers::Optimizer;
use crate::params::{load_tensor, ParamDict, TensorMap};
use crate::utils::tensor::{check_dim, check_shape, Tensor};

#[derive(Debug, Clone)]
struct NormCache {
    input_shape: Vec<usize>,
    x_hat: Array2<f64>,
    inv_std: Array1<f64>,
}

/// Per-channel normalization over the rows of a 2-D matrix; the layers
/// reshape their inputs to `(samples, channels)` before calling it.
#[derive(Debug, Clone)]
struct NormCore {
    config: BatchNormConfig,
    scaler: Array1<f64>,
    intercept: Array1<f64>,
    running_mean: Array1<f64>,
    running_var: Array1<f64>,
    dscaler: Array1<f64>,
    dintercept: Array1<f64>,
    trainable: bool,
    cache: Option<NormCache>,
}

impl NormCore {
    fn new(config: BatchNormConfig) -> Self {
        let n = config.n_in;
        Self {
            config,
            scaler: Array1::ones(n),
            intercept: Array1::zeros(n),
            running_mean: Array1::zeros(n),
            running_var: Array1::ones(n),
            dscaler: Array1::zeros(n),
            dintercept: Array1::zeros(n),
            trainable: true,
            cache: None,
        }
    }

    fn forward(&mut self, layer: &str, x: ArrayView2<f64>, input_shape: &[usize]) -> Result<Array2<f64>> {
        let eps = self.config.epsilon;

        if !self.trainable {
            let inv_std = self.running_var.mapv(|v| 1.0 / (v + eps).sqrt());
            let x_hat = (&x - &self.running_mean) * &inv_std;
            self.cache = None;
            return Ok(x_hat * &self.scaler + &self.intercept);
        }

        // rows are examples for 1D, examples x pixels for 2D
        if x.nrows() < 2 {
            return Err(LayerError::InvalidConfig(format!(
                "{} needs at least 2 samples per feature in training mode, got {}",
                layer,
                x.nrows()
            )));
        }

        let n = x.nrows() as f64;
        let mean = x.sum_axis(Axis(0)) / n;
        let centered = &x - &mean;
        let var = centered.mapv(|v| v * v).sum_axis(Axis(0)) / n;
        let inv_std = var.mapv(|v| 1.0 / (v + eps).sqrt());
        let x_hat = &centered * &inv_std;
        let y = &x_hat * &self.scaler + &self.intercept;

        let m = self.config.momentum;
        self.running_mean = &self.running_mean * m + &mean * (1.0 - m);
        self.running_var = &self.running_var * m + &var * (1.0 - m);

        self.cache = Some(NormCache {
            input_shape: input_shape.to_vec(),
            x_hat,
            inv_std,
        });
        Ok(y)
    }

    fn backward(&mut self, layer: &str, dy: ArrayView2<f64>, grad_shape: &[usize]) -> Result<Array2<f64>> {
        ensure_trainable(layer, self.trainable)?;
        let cache = self
            .cache
            .as_ref()
            .ok_or_else(|| LayerError::NoForwardCache(layer.to_string()))?;
        check_shape(layer, &cache.input_shape, grad_shape)?;

        let n = dy.nrows() as f64;
        self.dintercept += &dy.sum_axis(Axis(0));
        self.dscaler += &(&dy * &cache.x_hat).sum_axis(Axis(0));

        let dx_hat = &dy * &self.scaler;
        let sum_dx_hat = dx_hat.sum_axis(Axis(0));
        let sum_dx_hat_x_hat = (&dx_hat * &cache.x_hat).sum_axis(Axis(0));
        let dx = (dx_hat * n - &sum_dx_hat - &cache.x_hat * &sum_dx_hat_x_hat) * &cache.inv_std / n;
        Ok(dx)
    }

    fn parameters(&self) -> ParamDict {
        ParamDict::new()
            .with("scaler", self.scaler.clone().into_dyn())
            .with("intercept", self.intercept.clone().into_dyn())
            .with("running_mean", self.running_mean.clone().into_dyn())
            .with("running_var", self.running_var.clone().into_dyn())
    }

    fn gradients(&self) -> ParamDict {
        ParamDict::new()
            .with("scaler", self.dscaler.clone().into_dyn())
            .with("intercept", self.dintercept.clone().into_dyn())
    }

    fn derived_variables(&self) -> TensorMap {
        let mut vars = TensorMap::new();
        if let Some(cache) = &self.cache {
            vars.insert("X_hat".to_string(), cache.x_hat.clone().into_dyn());
        }
        vars
    }

    fn flush_gradients(&mut self, layer: &str) -> Result<()> {
        ensure_trainable(layer, self.trainable)?;
        self.dscaler.fill(0.0);
        self.dintercept.fill(0.0);
        self.cache = None;
        debug!("{}: gradients flushed", layer);
        Ok(())
    }

    fn update(&mut self, layer: &str, optimizer: &mut dyn Optimizer) -> Result<()> {
        ensure_trainable(layer, self.trainable)?;
        step(optimizer, "scaler", &mut self.scaler, &self.dscaler);
        step(optimizer, "intercept", &mut self.intercept, &self.dintercept);
        Ok(())
    }

    fn set_params(&mut self, layer: &str, config: &BatchNormConfig, params: &ParamDict) -> Result<()> {
        ensure_same_dims(layer, &[self.config.n_in], &[config.n_in])?;
        load_tensor(layer, &mut self.scaler, params, "scaler")?;
        load_tensor(layer, &mut self.intercept, params, "intercept")?;
        load_tensor(layer, &mut self.running_mean, params, "running_mean")?;
        load_tensor(layer, &mut self.running_var, params, "running_var")?;
        self.config = config.clone();
        Ok(())
    }
}

/// Flatten every axis but the last: `(..., n_in)` becomes `(samples, n_in)`.
fn to_rows(layer: &str, input: &Tensor, rank: usize, n_in: usize) -> Result<Array2<f64>> {
    if input.ndim() != rank {
        return Err(LayerError::RankMismatch {
            layer: layer.to_string(),
            expected: rank,
            actual: input.shape().to_vec(),
        });
    }
    check_dim(layer, input, rank - 1, n_in)?;
    let rows = input.len() / n_in;
    Array2::from_shape_vec((rows, n_in), input.iter().copied().collect())
        .map_err(|_| LayerError::shape(layer, &[rows, n_in], input.shape()))
}

fn from_rows(layer: &str, rows: Array2<f64>, shape: &[usize]) -> Result<Tensor> {
    let actual = rows.shape().to_vec();
    Tensor::from_shape_vec(IxDyn(shape), rows.iter().copied().collect())
        .map_err(|_| LayerError::shape(layer, shape, &actual))
}

macro_rules! batchnorm_layer {
    ($ty:ident, $name:expr, $variant:ident, $rank:expr) => {
        impl $ty {
            pub fn new(config: BatchNormConfig) -> Result<Self> {
                LayerConfig::$variant(config.clone()).validate()?;
                Ok(Self {
                    core: NormCore::new(config),
                })
            }

            pub fn config(&self) -> &BatchNormConfig {
                &self.core.config
            }

            pub fn momentum(&self) -> f64 {
                self.core.config.momentum
            }

            pub fn epsilon(&self) -> f64 {
                self.core.config.epsilon
            }

            /// Scale γ, one entry per channel.
            pub fn scaler(&self) -> &Array1<f64> {
                &self.core.scaler
            }

            /// Shift β, one entry per channel.
            pub fn intercept(&self) -> &Array1<f64> {
                &self.core.intercept
            }

            pub fn running_mean(&self) -> &Array1<f64> {
                &self.core.running_mean
            }

            pub fn running_var(&self) -> &Array1<f64> {
                &self.core.running_var
            }
        }

        impl Layer for $ty {
            type Input = Tensor;
            type Output = Tensor;

            fn forward(&mut self, input: &Tensor) -> Result<Tensor> {
                let rows = to_rows($name, input, $rank, self.core.config.n_in)?;
                let y = self.core.forward($name, rows.view(), input.shape())?;
                trace!("{}: forward {:?}", $name, input.shape());
                from_rows($name, y, input.shape())
            }

            fn backward(&mut self, grad_output: &Tensor) -> Result<Tensor> {
                let rows = to_rows($name, grad_output, $rank, self.core.config.n_in)?;
                let dx = self.core.backward($name, rows.view(), grad_output.shape())?;
                trace!("{}: backward {:?}", $name, grad_output.shape());
                from_rows($name, dx, grad_output.shape())
            }

            fn name(&self) -> &'static str {
                $name
            }

            fn parameters(&self) -> ParamDict {
                self.core.parameters()
            }

            fn gradients(&self) -> ParamDict {
                self.core.gradients()
            }

            fn hyperparameters(&self) -> Hyperparameters {
                Hyperparameters::new(LayerConfig::$variant(self.core.config.clone()))
            }

            fn derived_variables(&self) -> TensorMap {
                self.core.derived_variables()
            }

            fn is_trainable(&self) -> bool {
                self.core.trainable
            }

            fn freeze(&mut self) {
                self.core.trainable = false;
            }

            fn unfreeze(&mut self) {
                self.core.trainable = true;
            }

            fn flush_gradients(&mut self) -> Result<()> {
                self.core.flush_gradients($name)
            }

            fn update_with_optimizer(&mut self, optimizer: &mut dyn Optimizer) -> Result<()> {
                self.core.update($name, optimizer)
            }

            fn set_params(&mut self, summary: &Summary) -> Result<()> {
                match &summary.hyperparameters.config {
                    LayerConfig::$variant(c) => self.core.set_params($name, c, &summary.parameters),
                    other => Err(mismatch($name, other)),
                }
            }
        }
    };
}

/// Batch normalization over `(n_ex, n_in)` inputs.
///
/// # Example
///
/// ```
/// use ndarray::arr2;
/// use rust_neural_layers::config::BatchNormConfig;
/// use rust_neural_layers::layers::{BatchNorm1D, Layer};
///
/// let mut bn = BatchNorm1D::new(BatchNormConfig { n_in: 2, momentum: 0.9, epsilon: 1e-5 }).unwrap();
/// let y = bn.forward(&arr2(&[[1.0, 10.0], [3.0, 30.0]]).into_dyn()).unwrap();
/// assert!((y[[0, 0]] + 1.0).abs() < 1e-4);
/// assert!((bn.running_mean()[0] - 0.2).abs() < 1e-12);
/// ```
#[derive(Debug, Clone)]
pub struct BatchNorm1D {
    core: NormCore,
}

/// Batch normalization over channel-last `(n_ex, rows, cols, n_in)` inputs.
#[derive(Debug, Clone)]
pub struct BatchNorm2D {
    core: NormCore,
}

batchnorm_layer!(BatchNorm1D, "BatchNorm1D", BatchNorm1D, 2);
batchnorm_layer!(BatchNorm2D, "BatchNorm2D", BatchNorm2D, 4);
