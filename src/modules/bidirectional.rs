//! Bidirectional LSTM over a whole sequence.

use log::trace;
use ndarray::{s, Array3, Axis};

use crate::config::{BidirectionalLstmConfig, Hyperparameters, LayerConfig, LstmCellConfig, Summary};
use crate::error::{LayerError, Result};
use crate::layers::{ensure_same_dims, mismatch, Layer, LstmCell};
use crate::optimizers::Optimizer;
use crate::params::{ParamDict, TensorMap};
use crate::utils::rng::SimpleRng;
use crate::utils::tensor::{check_dim, check_shape, view3, Tensor};

const NAME: &str = "BidirectionalLSTM";

/// Two LSTM cells reading the sequence in opposite directions.
///
/// Input has shape `(n_ex, n_in, n_t)`. The output stacks the hidden states
/// of the forward cell and of the backward cell along the feature axis,
/// `(n_ex, 2 * n_out, n_t)`, both aligned to input time.
#[derive(Debug, Clone)]
pub struct BidirectionalLstm {
    config: BidirectionalLstmConfig,
    cell_fwd: LstmCell,
    cell_bwd: LstmCell,
    trainable: bool,
    /// Output shape of the last forward pass.
    out_shape: Option<(usize, usize, usize)>,
    vars: TensorMap,
}

impl BidirectionalLstm {
    pub fn new(config: BidirectionalLstmConfig, rng: &mut SimpleRng) -> Result<Self> {
        LayerConfig::BidirectionalLstm(config.clone()).validate()?;
        let cell_fwd = LstmCell::new(Self::cell_config(&config), rng)?;
        let cell_bwd = LstmCell::new(Self::cell_config(&config), rng)?;
        Ok(Self {
            config,
            cell_fwd,
            cell_bwd,
            trainable: true,
            out_shape: None,
            vars: TensorMap::new(),
        })
    }

    fn cell_config(c: &BidirectionalLstmConfig) -> LstmCellConfig {
        LstmCellConfig {
            n_in: c.n_in,
            n_out: c.n_out,
            act_fn: c.act_fn,
            gate_fn: c.gate_fn,
            init: c.init,
        }
    }

    pub fn config(&self) -> &BidirectionalLstmConfig {
        &self.config
    }

    /// The cell reading the sequence front to back.
    pub fn forward_cell(&self) -> &LstmCell {
        &self.cell_fwd
    }

    /// The cell reading the sequence back to front.
    pub fn backward_cell(&self) -> &LstmCell {
        &self.cell_bwd
    }
}

impl Layer for BidirectionalLstm {
    type Input = Tensor;
    type Output = Tensor;

    fn forward(&mut self, input: &Tensor) -> Result<Tensor> {
        let x = view3(input, NAME)?;
        check_dim(NAME, input, 1, self.config.n_in)?;
        let (n_ex, _, n_t) = x.dim();
        let n_out = self.config.n_out;

        self.cell_fwd.reset_state();
        self.cell_bwd.reset_state();
        self.vars.clear();

        let mut y = Array3::<f64>::zeros((n_ex, 2 * n_out, n_t));
        for t in 0..n_t {
            let xt = x.index_axis(Axis(2), t).to_owned().into_dyn();
            let (a, _) = self.cell_fwd.forward(&xt)?;
            y.slice_mut(s![.., ..n_out, t]).assign(&a);
        }
        for t in (0..n_t).rev() {
            let xt = x.index_axis(Axis(2), t).to_owned().into_dyn();
            let (a, _) = self.cell_bwd.forward(&xt)?;
            y.slice_mut(s![.., n_out.., t]).assign(&a);
        }

        self.vars.insert(
            "A_forward".to_string(),
            y.slice(s![.., ..n_out, ..]).to_owned().into_dyn(),
        );
        self.vars.insert(
            "A_backward".to_string(),
            y.slice(s![.., n_out.., ..]).to_owned().into_dyn(),
        );
        self.out_shape = Some(y.dim());
        trace!("{}: forward {:?} -> {:?}", NAME, input.shape(), y.shape());
        Ok(y.into_dyn())
    }

    fn backward(&mut self, grad_output: &Tensor) -> Result<Tensor> {
        let (n_ex, n_feat, n_t) = self
            .out_shape
            .ok_or_else(|| LayerError::NoForwardCache(NAME.to_string()))?;
        check_shape(NAME, &[n_ex, n_feat, n_t], grad_output.shape())?;
        let dy = view3(grad_output, NAME)?;
        let n_out = self.config.n_out;

        let mut dx = Array3::<f64>::zeros((n_ex, self.config.n_in, n_t));
        for t in (0..n_t).rev() {
            let da = dy.slice(s![.., ..n_out, t]).to_owned().into_dyn();
            let dxt = self.cell_fwd.backward(&da)?;
            let mut slot = dx.index_axis_mut(Axis(2), t);
            slot += &dxt;
        }
        // the backward cell saw time 0 last, so its sweep starts there
        for t in 0..n_t {
            let da = dy.slice(s![.., n_out.., t]).to_owned().into_dyn();
            let dxt = self.cell_bwd.backward(&da)?;
            let mut slot = dx.index_axis_mut(Axis(2), t);
            slot += &dxt;
        }

        trace!("{}: backward {:?} -> {:?}", NAME, grad_output.shape(), dx.shape());
        Ok(dx.into_dyn())
    }

    fn name(&self) -> &'static str {
        NAME
    }

    fn parameters(&self) -> ParamDict {
        ParamDict::new()
            .with_component("forward", self.cell_fwd.parameters())
            .with_component("backward", self.cell_bwd.parameters())
    }

    fn gradients(&self) -> ParamDict {
        ParamDict::new()
            .with_component("forward", self.cell_fwd.gradients())
            .with_component("backward", self.cell_bwd.gradients())
    }

    fn hyperparameters(&self) -> Hyperparameters {
        Hyperparameters::new(LayerConfig::BidirectionalLstm(self.config.clone()))
    }

    fn derived_variables(&self) -> TensorMap {
        self.vars.clone()
    }

    fn is_trainable(&self) -> bool {
        self.trainable
    }

    fn freeze(&mut self) {
        self.trainable = false;
        self.cell_fwd.freeze();
        self.cell_bwd.freeze();
    }

    fn unfreeze(&mut self) {
        self.trainable = true;
        self.cell_fwd.unfreeze();
        self.cell_bwd.unfreeze();
    }

    fn flush_gradients(&mut self) -> Result<()> {
        self.cell_fwd.flush_gradients()?;
        self.cell_bwd.flush_gradients()?;
        self.out_shape = None;
        self.vars.clear();
        Ok(())
    }

    fn update_with_optimizer(&mut self, optimizer: &mut dyn Optimizer) -> Result<()> {
        self.cell_fwd.update_with_optimizer(optimizer)?;
        self.cell_bwd.update_with_optimizer(optimizer)
    }

    fn set_params(&mut self, summary: &Summary) -> Result<()> {
        let config = match &summary.hyperparameters.config {
            LayerConfig::BidirectionalLstm(c) => c,
            other => return Err(mismatch(NAME, other)),
        };
        ensure_same_dims(
            NAME,
            &[self.config.n_in, self.config.n_out],
            &[config.n_in, config.n_out],
        )?;
        let cell_hp = Hyperparameters::new(LayerConfig::LstmCell(Self::cell_config(config)));
        let params = &summary.parameters;
        self.cell_fwd.set_params(&Summary::new(
            cell_hp.clone(),
            params.component("forward")?.clone(),
        ))?;
        self.cell_bwd.set_params(&Summary::new(
            cell_hp,
            params.component("backward")?.clone(),
        ))?;
        self.config = config.clone();
        Ok(())
    }
}
