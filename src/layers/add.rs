//! Element-wise addition of several same-shaped inputs, followed by an
//! activation.

use log::trace;

use crate::config::{AddConfig, Hyperparameters, LayerConfig, Summary};
use crate::error::{LayerError, Result};
use crate::layers::{ensure_trainable, mismatch, Layer};
use crate::optimizers::Optimizer;
use crate::params::{ParamDict, TensorMap};
use crate::utils::tensor::{check_shape, Tensor};

const NAME: &str = "Add";

/// `Y = act(X_1 + X_2 + ... + X_k)`.
///
/// Backward returns one gradient per input, all equal to `dY * act'(sum)`.
#[derive(Debug, Clone)]
pub struct Add {
    config: AddConfig,
    trainable: bool,
    /// Pre-activation sum and number of inputs of the last forward pass.
    cache: Option<(Tensor, usize)>,
}

impl Add {
    pub fn new(config: AddConfig) -> Result<Self> {
        LayerConfig::Add(config.clone()).validate()?;
        Ok(Self {
            config,
            trainable: true,
            cache: None,
        })
    }

    pub fn config(&self) -> &AddConfig {
        &self.config
    }
}

impl Layer for Add {
    type Input = Vec<Tensor>;
    type Output = Tensor;

    fn forward(&mut self, inputs: &Vec<Tensor>) -> Result<Tensor> {
        let (first, rest) = inputs
            .split_first()
            .ok_or_else(|| LayerError::InvalidConfig("Add needs at least one input".into()))?;

        let mut sum = first.clone();
        for x in rest {
            check_shape(NAME, first.shape(), x.shape())?;
            sum += x;
        }
        let act = self.config.act_fn;
        let y = sum.mapv(|v| act.apply_scalar(v));
        trace!("{}: forward {} x {:?}", NAME, inputs.len(), first.shape());

        self.cache = Some((sum, inputs.len()));
        Ok(y)
    }

    fn backward(&mut self, grad_output: &Tensor) -> Result<Vec<Tensor>> {
        ensure_trainable(NAME, self.trainable)?;
        let (sum, n_inputs) = self
            .cache
            .as_ref()
            .ok_or_else(|| LayerError::NoForwardCache(NAME.to_string()))?;
        check_shape(NAME, sum.shape(), grad_output.shape())?;

        let act = self.config.act_fn;
        let grad = grad_output * &sum.mapv(|v| act.grad_scalar(v));
        Ok(vec![grad; *n_inputs])
    }

    fn name(&self) -> &'static str {
        NAME
    }

    fn parameters(&self) -> ParamDict {
        ParamDict::new()
    }

    fn gradients(&self) -> ParamDict {
        ParamDict::new()
    }

    fn hyperparameters(&self) -> Hyperparameters {
        Hyperparameters::new(LayerConfig::Add(self.config.clone()))
    }

    fn derived_variables(&self) -> TensorMap {
        let mut vars = TensorMap::new();
        if let Some((sum, _)) = &self.cache {
            vars.insert("sum".to_string(), sum.clone());
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
        self.cache = None;
        Ok(())
    }

    fn update_with_optimizer(&mut self, _optimizer: &mut dyn Optimizer) -> Result<()> {
        ensure_trainable(NAME, self.trainable)
    }

    fn set_params(&mut self, summary: &Summary) -> Result<()> {
        match &summary.hyperparameters.config {
            LayerConfig::Add(c) => {
                self.config = c.clone();
                Ok(())
            }
            other => Err(mismatch(NAME, other)),
        }
    }
}
