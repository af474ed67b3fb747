//! Elman recurrent cell
//!
//! One call to `forward` processes one timestep:
//!
//! ```text
//! Z_t = A_{t-1}·Waa + ba + X_t·Wax + bx
//! A_t = act(Z_t)
//! ```
//!
//! with `A_0 = 0`. Backward calls run in reverse time order; the gradient
//! flowing into `A_{t-1}` is carried inside the cell and added to the
//! upstream gradient of the next backward call.

use log::{debug, trace};
use ndarray::{Array2, Axis, Dim};

use crate::config::{Hyperparameters, LayerConfig, RnnCellConfig, Summary};
use crate::error::{LayerError, Result};
use crate::layers::sequence::{stack_steps, SequencePhase, StepHistory};
use crate::layers::{ensure_same_dims, ensure_trainable, mismatch, step, Layer};
use crate::optimizers::Optimizer;
use crate::params::{load_tensor, ParamDict, TensorMap};
use crate::utils::rng::SimpleRng;
use crate::utils::tensor::{check_dim, check_shape, view2, Tensor};

const NAME: &str = "RNNCell";

#[derive(Debug, Clone)]
struct RnnStep {
    x: Array2<f64>,
    a_prev: Array2<f64>,
    z: Array2<f64>,
    a: Array2<f64>,
}

/// Single-layer Elman RNN cell.
///
/// # Fields
///
/// * `wax` - Input-to-hidden weights `(n_in, n_out)`
/// * `waa` - Hidden-to-hidden weights `(n_out, n_out)`
/// * `bx`, `ba` - Biases `(1, n_out)`
#[derive(Debug, Clone)]
pub struct RnnCell {
    config: RnnCellConfig,
    waa: Array2<f64>,
    wax: Array2<f64>,
    ba: Array2<f64>,
    bx: Array2<f64>,
    dwaa: Array2<f64>,
    dwax: Array2<f64>,
    dba: Array2<f64>,
    dbx: Array2<f64>,
    trainable: bool,
    history: StepHistory<RnnStep>,
    /// Gradient of the loss with respect to `A_{t-1}` from the last backward call.
    dlda_prev: Option<Array2<f64>>,
}

impl RnnCell {
    pub fn new(config: RnnCellConfig, rng: &mut SimpleRng) -> Result<Self> {
        LayerConfig::RnnCell(config.clone()).validate()?;
        let (n_in, n_out) = (config.n_in, config.n_out);
        let waa = config.init.sample(Dim([n_out, n_out]), rng);
        let wax = config.init.sample(Dim([n_in, n_out]), rng);

        Ok(Self {
            config,
            waa,
            wax,
            ba: Array2::zeros((1, n_out)),
            bx: Array2::zeros((1, n_out)),
            dwaa: Array2::zeros((n_out, n_out)),
            dwax: Array2::zeros((n_in, n_out)),
            dba: Array2::zeros((1, n_out)),
            dbx: Array2::zeros((1, n_out)),
            trainable: true,
            history: StepHistory::new(),
            dlda_prev: None,
        })
    }

    pub fn config(&self) -> &RnnCellConfig {
        &self.config
    }

    /// Number of timesteps recorded since the last reset.
    pub fn n_timesteps(&self) -> usize {
        self.history.len()
    }

    pub fn phase(&self) -> SequencePhase {
        self.history.phase()
    }

    /// Forget the recorded sequence. Accumulated gradients are kept.
    pub fn reset_state(&mut self) {
        self.history.clear();
        self.dlda_prev = None;
        debug!("{}: state reset", NAME);
    }
}

impl Layer for RnnCell {
    type Input = Tensor;
    type Output = Tensor;

    fn forward(&mut self, input: &Tensor) -> Result<Tensor> {
        let x = view2(input, NAME)?;
        check_dim(NAME, input, 1, self.config.n_in)?;
        if let Some(last) = self.history.last() {
            check_dim(NAME, input, 0, last.a.nrows())?;
        }

        let a_prev = match self.history.last() {
            Some(last) => last.a.clone(),
            None => Array2::zeros((x.nrows(), self.config.n_out)),
        };
        let z = a_prev.dot(&self.waa) + &self.ba + x.dot(&self.wax) + &self.bx;
        let act = self.config.act_fn;
        let a = z.mapv(|v| act.apply_scalar(v));

        self.history.record(
            NAME,
            RnnStep {
                x: x.to_owned(),
                a_prev,
                z,
                a: a.clone(),
            },
        )?;
        trace!("{}: forward step {}", NAME, self.history.len() - 1);
        Ok(a.into_dyn())
    }

    fn backward(&mut self, grad_output: &Tensor) -> Result<Tensor> {
        ensure_trainable(NAME, self.trainable)?;
        let t = self.history.pending(NAME)?;
        let cached = self.history.get(t);
        check_shape(NAME, cached.a.shape(), grad_output.shape())?;

        let mut da = view2(grad_output, NAME)?.to_owned();
        if let Some(carried) = &self.dlda_prev {
            da += carried;
        }
        let act = self.config.act_fn;
        let dz = cached.z.mapv(|v| act.grad_scalar(v)) * &da;
        let dx = dz.dot(&self.wax.t());
        let db = dz.sum_axis(Axis(0)).insert_axis(Axis(0));

        self.dwaa += &cached.a_prev.t().dot(&dz);
        self.dwax += &cached.x.t().dot(&dz);
        self.dba += &db;
        self.dbx += &db;
        self.dlda_prev = Some(dz.dot(&self.waa.t()));
        self.history.consume(t);

        trace!("{}: backward step {}", NAME, t);
        Ok(dx.into_dyn())
    }

    fn name(&self) -> &'static str {
        NAME
    }

    fn parameters(&self) -> ParamDict {
        ParamDict::new()
            .with("Waa", self.waa.clone().into_dyn())
            .with("Wax", self.wax.clone().into_dyn())
            .with("ba", self.ba.clone().into_dyn())
            .with("bx", self.bx.clone().into_dyn())
    }

    fn gradients(&self) -> ParamDict {
        ParamDict::new()
            .with("Waa", self.dwaa.clone().into_dyn())
            .with("Wax", self.dwax.clone().into_dyn())
            .with("ba", self.dba.clone().into_dyn())
            .with("bx", self.dbx.clone().into_dyn())
    }

    fn hyperparameters(&self) -> Hyperparameters {
        Hyperparameters::new(LayerConfig::RnnCell(self.config.clone()))
    }

    /// `A` and `Z` stacked as `(n_ex, n_out, n_t)`, plus the carried `dLdA_prev`.
    fn derived_variables(&self) -> TensorMap {
        let mut vars = TensorMap::new();
        let steps = self.history.steps();
        if let Some(a) = stack_steps(steps.iter().map(|s| &s.a)) {
            vars.insert("A".to_string(), a);
        }
        if let Some(z) = stack_steps(steps.iter().map(|s| &s.z)) {
            vars.insert("Z".to_string(), z);
        }
        if let Some(d) = &self.dlda_prev {
            vars.insert("dLdA_prev".to_string(), d.clone().into_dyn());
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
        self.dwaa.fill(0.0);
        self.dwax.fill(0.0);
        self.dba.fill(0.0);
        self.dbx.fill(0.0);
        self.reset_state();
        Ok(())
    }

    fn update_with_optimizer(&mut self, optimizer: &mut dyn Optimizer) -> Result<()> {
        ensure_trainable(NAME, self.trainable)?;
        step(optimizer, "Waa", &mut self.waa, &self.dwaa);
        step(optimizer, "Wax", &mut self.wax, &self.dwax);
        step(optimizer, "ba", &mut self.ba, &self.dba);
        step(optimizer, "bx", &mut self.bx, &self.dbx);
        Ok(())
    }

    fn set_params(&mut self, summary: &Summary) -> Result<()> {
        let config = match &summary.hyperparameters.config {
            LayerConfig::RnnCell(c) => c,
            other => return Err(mismatch(NAME, other)),
        };
        ensure_same_dims(
            NAME,
            &[self.config.n_in, self.config.n_out],
            &[config.n_in, config.n_out],
        )?;
        let params = &summary.parameters;
        load_tensor(NAME, &mut self.waa, params, "Waa")?;
        load_tensor(NAME, &mut self.wax, params, "Wax")?;
        load_tensor(NAME, &mut self.ba, params, "ba")?;
        load_tensor(NAME, &mut self.bx, params, "bx")?;
        self.config = config.clone();
        Ok(())
    }
}
