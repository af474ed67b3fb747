//! Long short-term memory cell
//!
//! Each forward call processes one timestep. With `Z_t = [A_{t-1}, X_t]`:
//!
//! ```text
//! Gf = gate(Z_t·Wf + bf)        forget gate
//! Gu = gate(Z_t·Wu + bu)        update gate
//! Go = gate(Z_t·Wo + bo)        output gate
//! Cc = act(Z_t·Wc + bc)         candidate cell value
//! C_t = Gf * C_{t-1} + Gu * Cc
//! A_t = Go * act(C_t)
//! ```
//!
//! `A_0` and `C_0` are zero. As in [`RnnCell`](crate::layers::RnnCell), the
//! gradients flowing into `A_{t-1}` and `C_{t-1}` are carried between
//! backward calls.

use log::{debug, trace};
use ndarray::{concatenate, s, Array2, Axis, Dim};

use crate::config::{Hyperparameters, LayerConfig, LstmCellConfig, Summary};
use crate::error::{LayerError, Result};
use crate::layers::sequence::{stack_steps, SequencePhase, StepHistory};
use crate::layers::{ensure_same_dims, ensure_trainable, mismatch, step, Layer};
use crate::optimizers::Optimizer;
use crate::params::{load_tensor, ParamDict, TensorMap};
use crate::utils::rng::SimpleRng;
use crate::utils::tensor::{check_dim, check_shape, view2, Tensor};

const NAME: &str = "LSTMCell";
const GATES: [&str; 4] = ["f", "u", "c", "o"];

#[derive(Debug, Clone)]
struct LstmStep {
    z: Array2<f64>,
    c_prev: Array2<f64>,
    /// Pre-activations, indexed like `GATES`.
    pre: [Array2<f64>; 4],
    gf: Array2<f64>,
    gu: Array2<f64>,
    cc: Array2<f64>,
    go: Array2<f64>,
    c: Array2<f64>,
    a: Array2<f64>,
}

/// LSTM cell with forget, update and output gates.
///
/// Weights `W{f,u,c,o}` have shape `(n_out + n_in, n_out)` and act on the
/// concatenation of the previous hidden state and the current input.
#[derive(Debug, Clone)]
pub struct LstmCell {
    config: LstmCellConfig,
    w: [Array2<f64>; 4],
    b: [Array2<f64>; 4],
    dw: [Array2<f64>; 4],
    db: [Array2<f64>; 4],
    trainable: bool,
    history: StepHistory<LstmStep>,
    dlda_prev: Option<Array2<f64>>,
    dldc_prev: Option<Array2<f64>>,
}

impl LstmCell {
    pub fn new(config: LstmCellConfig, rng: &mut SimpleRng) -> Result<Self> {
        LayerConfig::LstmCell(config.clone()).validate()?;
        let (n_in, n_out) = (config.n_in, config.n_out);
        let rows = n_out + n_in;
        let w = [
            config.init.sample(Dim([rows, n_out]), rng),
            config.init.sample(Dim([rows, n_out]), rng),
            config.init.sample(Dim([rows, n_out]), rng),
            config.init.sample(Dim([rows, n_out]), rng),
        ];
        let zeros = |r: usize| Array2::<f64>::zeros((r, n_out));

        Ok(Self {
            config,
            w,
            b: [zeros(1), zeros(1), zeros(1), zeros(1)],
            dw: [zeros(rows), zeros(rows), zeros(rows), zeros(rows)],
            db: [zeros(1), zeros(1), zeros(1), zeros(1)],
            trainable: true,
            history: StepHistory::new(),
            dlda_prev: None,
            dldc_prev: None,
        })
    }

    pub fn config(&self) -> &LstmCellConfig {
        &self.config
    }

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
        self.dldc_prev = None;
        debug!("{}: state reset", NAME);
    }

    fn weight_name(gate: usize) -> String {
        format!("W{}", GATES[gate])
    }

    fn bias_name(gate: usize) -> String {
        format!("b{}", GATES[gate])
    }
}

impl Layer for LstmCell {
    type Input = Tensor;
    type Output = (Tensor, Tensor);

    fn forward(&mut self, input: &Tensor) -> Result<(Tensor, Tensor)> {
        let x = view2(input, NAME)?;
        check_dim(NAME, input, 1, self.config.n_in)?;
        if let Some(last) = self.history.last() {
            check_dim(NAME, input, 0, last.a.nrows())?;
        }

        let n_ex = x.nrows();
        let n_out = self.config.n_out;
        let (a_prev, c_prev) = match self.history.last() {
            Some(last) => (last.a.clone(), last.c.clone()),
            None => (Array2::zeros((n_ex, n_out)), Array2::zeros((n_ex, n_out))),
        };
        let z = concatenate(Axis(1), &[a_prev.view(), x])
            .map_err(|_| LayerError::shape(NAME, &[n_ex, n_out + self.config.n_in], input.shape()))?;

        let pre = [0, 1, 2, 3].map(|g| z.dot(&self.w[g]) + &self.b[g]);
        let (gate, act) = (self.config.gate_fn, self.config.act_fn);
        let gf = pre[0].mapv(|v| gate.apply_scalar(v));
        let gu = pre[1].mapv(|v| gate.apply_scalar(v));
        let cc = pre[2].mapv(|v| act.apply_scalar(v));
        let go = pre[3].mapv(|v| gate.apply_scalar(v));
        let c = &gf * &c_prev + &gu * &cc;
        let a = &go * &c.mapv(|v| act.apply_scalar(v));

        let out = (a.clone().into_dyn(), c.clone().into_dyn());
        self.history.record(
            NAME,
            LstmStep {
                z,
                c_prev,
                pre,
                gf,
                gu,
                cc,
                go,
                c,
                a,
            },
        )?;
        trace!("{}: forward step {}", NAME, self.history.len() - 1);
        Ok(out)
    }

    fn backward(&mut self, grad_output: &Tensor) -> Result<Tensor> {
        ensure_trainable(NAME, self.trainable)?;
        let t = self.history.pending(NAME)?;
        let st = self.history.get(t);
        check_shape(NAME, st.a.shape(), grad_output.shape())?;

        let (gate, act) = (self.config.gate_fn, self.config.act_fn);
        let mut da = view2(grad_output, NAME)?.to_owned();
        if let Some(carried) = &self.dlda_prev {
            da += carried;
        }
        let mut dc = &da * &st.go * &st.c.mapv(|v| act.grad_scalar(v));
        if let Some(carried) = &self.dldc_prev {
            dc += carried;
        }

        let dgo = &da * &st.c.mapv(|v| act.apply_scalar(v)) * &st.pre[3].mapv(|v| gate.grad_scalar(v));
        let dgc = &dc * &st.gu * &st.pre[2].mapv(|v| act.grad_scalar(v));
        let dgu = &dc * &st.cc * &st.pre[1].mapv(|v| gate.grad_scalar(v));
        let dgf = &dc * &st.c_prev * &st.pre[0].mapv(|v| gate.grad_scalar(v));
        let dpre = [dgf, dgu, dgc, dgo];

        let mut dz = Array2::<f64>::zeros(st.z.raw_dim());
        for g in 0..4 {
            dz += &dpre[g].dot(&self.w[g].t());
            self.dw[g] += &st.z.t().dot(&dpre[g]);
            self.db[g] += &dpre[g].sum_axis(Axis(0)).insert_axis(Axis(0));
        }

        let n_out = self.config.n_out;
        let dx = dz.slice(s![.., n_out..]).to_owned();
        self.dlda_prev = Some(dz.slice(s![.., ..n_out]).to_owned());
        self.dldc_prev = Some(&st.gf * &dc);
        self.history.consume(t);

        trace!("{}: backward step {}", NAME, t);
        Ok(dx.into_dyn())
    }

    fn name(&self) -> &'static str {
        NAME
    }

    fn parameters(&self) -> ParamDict {
        (0..4).fold(ParamDict::new(), |dict, g| {
            dict.with(&Self::weight_name(g), self.w[g].clone().into_dyn())
                .with(&Self::bias_name(g), self.b[g].clone().into_dyn())
        })
    }

    fn gradients(&self) -> ParamDict {
        (0..4).fold(ParamDict::new(), |dict, g| {
            dict.with(&Self::weight_name(g), self.dw[g].clone().into_dyn())
                .with(&Self::bias_name(g), self.db[g].clone().into_dyn())
        })
    }

    fn hyperparameters(&self) -> Hyperparameters {
        Hyperparameters::new(LayerConfig::LstmCell(self.config.clone()))
    }

    fn derived_variables(&self) -> TensorMap {
        let mut vars = TensorMap::new();
        let steps = self.history.steps();
        if let Some(a) = stack_steps(steps.iter().map(|s| &s.a)) {
            vars.insert("A".to_string(), a);
        }
        if let Some(c) = stack_steps(steps.iter().map(|s| &s.c)) {
            vars.insert("C".to_string(), c);
        }
        if let Some(d) = &self.dlda_prev {
            vars.insert("dLdA_prev".to_string(), d.clone().into_dyn());
        }
        if let Some(d) = &self.dldc_prev {
            vars.insert("dLdC_prev".to_string(), d.clone().into_dyn());
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
        for g in 0..4 {
            self.dw[g].fill(0.0);
            self.db[g].fill(0.0);
        }
        self.reset_state();
        Ok(())
    }

    fn update_with_optimizer(&mut self, optimizer: &mut dyn Optimizer) -> Result<()> {
        ensure_trainable(NAME, self.trainable)?;
        for g in 0..4 {
            step(optimizer, &Self::weight_name(g), &mut self.w[g], &self.dw[g]);
            step(optimizer, &Self::bias_name(g), &mut self.b[g], &self.db[g]);
        }
        Ok(())
    }

    fn set_params(&mut self, summary: &Summary) -> Result<()> {
        let config = match &summary.hyperparameters.config {
            LayerConfig::LstmCell(c) => c,
            other => return Err(mismatch(NAME, other)),
        };
        ensure_same_dims(
            NAME,
            &[self.config.n_in, self.config.n_out],
            &[config.n_in, config.n_out],
        )?;
        for g in 0..4 {
            load_tensor(NAME, &mut self.w[g], &summary.parameters, &Self::weight_name(g))?;
            load_tensor(NAME, &mut self.b[g], &summary.parameters, &Self::bias_name(g))?;
        }
        self.config = config.clone();
        Ok(())
    }
}
