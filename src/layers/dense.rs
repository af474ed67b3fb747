//! Fully-connected layer implementation
//!
//! Performs the transformation `Y = act(X·W + b)` on a batch of row vectors.

use log::{debug, trace};
use ndarray::{Array2, Axis, Dim};

use crate::config::{FullyConnectedConfig, Hyperparameters, LayerConfig, Summary};
use crate::error::{LayerError, Result};
use crate::layers::{ensure_same_dims, ensure_trainable, mismatch, step, Layer};
use crate::optimizers::Optimizer;
use crate::params::{load_tensor, ParamDict, TensorMap};
use crate::utils::rng::SimpleRng;
use crate::utils::tensor::{check_dim, check_shape, view2, Tensor};

const NAME: &str = "FullyConnected";

#[derive(Debug, Clone)]
struct DenseCache {
    x: Array2<f64>,
    z: Array2<f64>,
}

/// Fully-connected (dense) layer with weights and biases.
///
/// # Fields
///
/// * `w` - Weight matrix `(n_in, n_out)`
/// * `b` - Bias row `(1, n_out)`
/// * `dw`, `db` - Accumulated gradients, same shapes
///
/// # Example
///
/// ```
/// use ndarray::Array2;
/// use rust_neural_layers::config::FullyConnectedConfig;
/// use rust_neural_layers::layers::{FullyConnected, Layer};
/// use rust_neural_layers::utils::{activations::Activation, init::WeightInit, SimpleRng};
///
/// let mut rng = SimpleRng::new(42);
/// let config = FullyConnectedConfig {
///     n_in: 4,
///     n_out: 3,
///     act_fn: Activation::Relu,
///     init: WeightInit::HeUniform,
/// };
/// let mut layer = FullyConnected::new(config, &mut rng).unwrap();
///
/// let x = Array2::<f64>::ones((2, 4)).into_dyn();
/// let y = layer.forward(&x).unwrap();
/// assert_eq!(y.shape(), &[2, 3]);
/// assert_eq!(layer.parameter_count(), 4 * 3 + 3);
/// ```
#[derive(Debug, Clone)]
pub struct FullyConnected {
    config: FullyConnectedConfig,
    w: Array2<f64>,
    b: Array2<f64>,
    dw: Array2<f64>,
    db: Array2<f64>,
    trainable: bool,
    cache: Option<DenseCache>,
    dldy: Option<Array2<f64>>,
    dldz: Option<Array2<f64>>,
}

impl FullyConnected {
    /// Create a layer with weights drawn from `config.init` and zero biases.
    ///
    /// # Arguments
    ///
    /// * `config` - Layer dimensions, activation and initialiser
    /// * `rng` - Random number generator for weight initialisation
    pub fn new(config: FullyConnectedConfig, rng: &mut SimpleRng) -> Result<Self> {
        LayerConfig::FullyConnected(config.clone()).validate()?;
        let (n_in, n_out) = (config.n_in, config.n_out);
        let w = config.init.sample(Dim([n_in, n_out]), rng);

        Ok(Self {
            config,
            w,
            b: Array2::zeros((1, n_out)),
            dw: Array2::zeros((n_in, n_out)),
            db: Array2::zeros((1, n_out)),
            trainable: true,
            cache: None,
            dldy: None,
            dldz: None,
        })
    }

    pub fn config(&self) -> &FullyConnectedConfig {
        &self.config
    }

    pub fn n_in(&self) -> usize {
        self.config.n_in
    }

    pub fn n_out(&self) -> usize {
        self.config.n_out
    }

    pub fn weights(&self) -> &Array2<f64> {
        &self.w
    }

    pub fn bias(&self) -> &Array2<f64> {
        &self.b
    }
}

impl Layer for FullyConnected {
    type Input = Tensor;
    type Output = Tensor;

    fn forward(&mut self, input: &Tensor) -> Result<Tensor> {
        let x = view2(input, NAME)?;
        check_dim(NAME, input, 1, self.config.n_in)?;

        let z = x.dot(&self.w) + &self.b;
        let y = z.mapv(|v| self.config.act_fn.apply_scalar(v));
        trace!("{}: forward {:?} -> {:?}", NAME, input.shape(), y.shape());

        self.cache = Some(DenseCache {
            x: x.to_owned(),
            z,
        });
        Ok(y.into_dyn())
    }

    fn backward(&mut self, grad_output: &Tensor) -> Result<Tensor> {
        ensure_trainable(NAME, self.trainable)?;
        let cache = self
            .cache
            .as_ref()
            .ok_or_else(|| LayerError::NoForwardCache(NAME.to_string()))?;
        check_shape(NAME, cache.z.shape(), grad_output.shape())?;
        let dy = view2(grad_output, NAME)?;

        let act = self.config.act_fn;
        let dz = &dy * &cache.z.mapv(|v| act.grad_scalar(v));
        let dx = dz.dot(&self.w.t());

        self.dw += &cache.x.t().dot(&dz);
        self.db += &dz.sum_axis(Axis(0)).insert_axis(Axis(0));
        trace!("{}: backward {:?} -> {:?}", NAME, grad_output.shape(), dx.shape());

        self.dldy = Some(dy.to_owned());
        self.dldz = Some(dz);
        Ok(dx.into_dyn())
    }

    fn name(&self) -> &'static str {
        NAME
    }

    fn parameters(&self) -> ParamDict {
        ParamDict::new()
            .with("W", self.w.clone().into_dyn())
            .with("b", self.b.clone().into_dyn())
    }

    fn gradients(&self) -> ParamDict {
        ParamDict::new()
            .with("W", self.dw.clone().into_dyn())
            .with("b", self.db.clone().into_dyn())
    }

    fn hyperparameters(&self) -> Hyperparameters {
        Hyperparameters::new(LayerConfig::FullyConnected(self.config.clone()))
    }

    fn derived_variables(&self) -> TensorMap {
        let mut vars = TensorMap::new();
        if let Some(cache) = &self.cache {
            vars.insert("Z".to_string(), cache.z.clone().into_dyn());
        }
        if let Some(dldy) = &self.dldy {
            vars.insert("dLdY".to_string(), dldy.clone().into_dyn());
        }
        if let Some(dldz) = &self.dldz {
            vars.insert("dLdZ".to_string(), dldz.clone().into_dyn());
        }
        vars
    }

    fn is_trainable(&self) -> bool {
        self.trainable
    }

    fn freeze(&mut self) {
        self.trainable = false;
    }

    fn unfreeze(&mut self) {
        self.trainable = true;
    }

    fn flush_gradients(&mut self) -> Result<()> {
        ensure_trainable(NAME, self.trainable)?;
        self.dw.fill(0.0);
        self.db.fill(0.0);
        self.cache = None;
        self.dldy = None;
        self.dldz = None;
        debug!("{}: gradients flushed", NAME);
        Ok(())
    }

    fn update_with_optimizer(&mut self, optimizer: &mut dyn Optimizer) -> Result<()> {
        ensure_trainable(NAME, self.trainable)?;
        step(optimizer, "W", &mut self.w, &self.dw);
        step(optimizer, "b", &mut self.b, &self.db);
        Ok(())
    }

    fn set_params(&mut self, summary: &Summary) -> Result<()> {
        let config = match &summary.hyperparameters.config {
            LayerConfig::FullyConnected(c) => c,
            other => return Err(mismatch(NAME, other)),
        };
        ensure_same_dims(
            NAME,
            &[self.config.n_in, self.config.n_out],
            &[config.n_in, config.n_out],
        )?;
        load_tensor(NAME, &mut self.w, &summary.parameters, "W")?;
        load_tensor(NAME, &mut self.b, &summary.parameters, "b")?;
        self.config = config.clone();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::activations::Activation;
    use crate::utils::init::WeightInit;
    use approx::assert_abs_diff_eq;
    use ndarray::arr2;

    fn layer(act_fn: Activation) -> FullyConnected {
        let mut rng = SimpleRng::new(42);
        let config = FullyConnectedConfig {
            n_in: 2,
            n_out: 2,
            act_fn,
            init: WeightInit::GlorotUniform,
        };
        FullyConnected::new(config, &mut rng).unwrap()
    }

    #[test]
    fn test_biases_start_at_zero() {
        let layer = layer(Activation::Identity);
        assert!(layer.bias().iter().all(|&b| b == 0.0));
        assert_eq!(layer.weights().dim(), (2, 2));
    }

    #[test]
    fn test_linear_forward_backward() {
        let mut layer = layer(Activation::Identity);
        layer.w = arr2(&[[1.0, 2.0], [3.0, 4.0]]);
        layer.b = arr2(&[[0.5, -0.5]]);

        let x = arr2(&[[1.0, 1.0], [0.0, 2.0]]).into_dyn();
        let y = layer.forward(&x).unwrap();
        assert_abs_diff_eq!(y[[0, 0]], 4.5);
        assert_abs_diff_eq!(y[[1, 1]], 7.5);

        let dx = layer.backward(&Tensor::ones(y.raw_dim())).unwrap();
        // each row of dX is the row sums of W
        assert_abs_diff_eq!(dx[[0, 0]], 3.0);
        assert_abs_diff_eq!(dx[[0, 1]], 7.0);
        // dW = X^T · 1
        assert_abs_diff_eq!(layer.dw[[1, 0]], 3.0);
        assert_abs_diff_eq!(layer.db[[0, 1]], 2.0);
    }

    #[test]
    fn test_gradients_accumulate_until_flushed() {
        let mut layer = layer(Activation::Tanh);
        let x = arr2(&[[0.3, -0.2]]).into_dyn();
        let ones = Tensor::ones(ndarray::IxDyn(&[1, 2]));

        layer.forward(&x).unwrap();
        layer.backward(&ones).unwrap();
        let once = layer.dw.clone();
        layer.forward(&x).unwrap();
        layer.backward(&ones).unwrap();
        for (twice, once) in layer.dw.iter().zip(once.iter()) {
            assert_abs_diff_eq!(*twice, 2.0 * once, epsilon = 1e-12);
        }

        layer.flush_gradients().unwrap();
        assert!(layer.gradients().all_values().iter().all(|&g| g == 0.0));
    }

    #[test]
    fn test_backward_requires_forward() {
        let mut layer = layer(Activation::Identity);
        let result = layer.backward(&Tensor::ones(ndarray::IxDyn(&[1, 2])));
        assert!(matches!(result, Err(LayerError::NoForwardCache(_))));
    }

    #[test]
    fn test_wrong_feature_count() {
        let mut layer = layer(Activation::Identity);
        let x = Tensor::ones(ndarray::IxDyn(&[3, 5]));
        assert!(matches!(
            layer.forward(&x),
            Err(LayerError::ShapeMismatch { .. })
        ));
    }
}
