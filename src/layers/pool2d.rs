//! 2D pooling layer (max or average) over channel-last inputs.

use log::trace;
use ndarray::Array4;

use crate::config::{Hyperparameters, LayerConfig, Pool2DConfig, PoolMode, Summary};
use crate::error::{LayerError, Result};
use crate::layers::{ensure_trainable, mismatch, Layer};
use crate::optimizers::Optimizer;
use crate::params::ParamDict;
use crate::utils::padding::{output_dims, pad_4d, resolve_padding, unpad_4d, PadDims};
use crate::utils::tensor::{check_shape, view4, Tensor};

const NAME: &str = "Pool2D";

#[derive(Debug, Clone)]
struct PoolCache {
    padded_shape: (usize, usize, usize, usize),
    out_shape: (usize, usize, usize, usize),
    pad: PadDims,
    /// Window offset `(r, c)` of the maximum, per output element (max mode).
    argmax: Option<Array4<(usize, usize)>>,
}

/// Parameter-free pooling layer.
///
/// Max pooling pads with `-inf` and routes each output gradient to the first
/// maximum of its window. Average pooling pads with zeros and always divides
/// by the full window size, so padded positions count towards the average.
#[derive(Debug, Clone)]
pub struct Pool2D {
    config: Pool2DConfig,
    trainable: bool,
    cache: Option<PoolCache>,
}

impl Pool2D {
    pub fn new(config: Pool2DConfig) -> Result<Self> {
        LayerConfig::Pool2D(config.clone()).validate()?;
        Ok(Self {
            config,
            trainable: true,
            cache: None,
        })
    }

    pub fn config(&self) -> &Pool2DConfig {
        &self.config
    }

    pub fn mode(&self) -> PoolMode {
        self.config.mode
    }
}

impl Layer for Pool2D {
    type Input = Tensor;
    type Output = Tensor;

    fn forward(&mut self, input: &Tensor) -> Result<Tensor> {
        let x = view4(input, NAME)?;
        let (kr, kc) = self.config.kernel_shape;
        let s = self.config.stride;
        let pad = resolve_padding(self.config.pad, input.shape(), (kr, kc), s)?;
        let (n_ex, in_rows, in_cols, ch) = x.dim();
        let (out_rows, out_cols) = output_dims((in_rows, in_cols), &pad, (kr, kc), s)?;

        let fill = match self.config.mode {
            PoolMode::Max => f64::NEG_INFINITY,
            PoolMode::Average => 0.0,
        };
        let xp = pad_4d(x, &pad, fill);
        let window = (kr * kc) as f64;

        let mut y = Array4::<f64>::zeros((n_ex, out_rows, out_cols, ch));
        let mut argmax = match self.config.mode {
            PoolMode::Max => Some(Array4::from_elem((n_ex, out_rows, out_cols, ch), (0, 0))),
            PoolMode::Average => None,
        };

        for n in 0..n_ex {
            for i in 0..out_rows {
                for j in 0..out_cols {
                    for k in 0..ch {
                        match argmax.as_mut() {
                            Some(arg) => {
                                let mut best = f64::NEG_INFINITY;
                                let mut at = (0, 0);
                                for r in 0..kr {
                                    for c in 0..kc {
                                        let v = xp[[n, i * s + r, j * s + c, k]];
                                        // strict comparison keeps the first maximum
                                        if v > best {
                                            best = v;
                                            at = (r, c);
                                        }
                                    }
                                }
                                y[[n, i, j, k]] = best;
                                arg[[n, i, j, k]] = at;
                            }
                            None => {
                                let mut sum = 0.0;
                                for r in 0..kr {
                                    for c in 0..kc {
                                        sum += xp[[n, i * s + r, j * s + c, k]];
                                    }
                                }
                                y[[n, i, j, k]] = sum / window;
                            }
                        }
                    }
                }
            }
        }
        trace!("{}: forward {:?} -> {:?}", NAME, input.shape(), y.shape());

        self.cache = Some(PoolCache {
            padded_shape: xp.dim(),
            out_shape: y.dim(),
            pad,
            argmax,
        });
        Ok(y.into_dyn())
    }

    fn backward(&mut self, grad_output: &Tensor) -> Result<Tensor> {
        ensure_trainable(NAME, self.trainable)?;
        let cache = self
            .cache
            .as_ref()
            .ok_or_else(|| LayerError::NoForwardCache(NAME.to_string()))?;
        let (n_ex, out_rows, out_cols, ch) = cache.out_shape;
        check_shape(NAME, &[n_ex, out_rows, out_cols, ch], grad_output.shape())?;
        let dy = view4(grad_output, NAME)?;

        let (kr, kc) = self.config.kernel_shape;
        let s = self.config.stride;
        let window = (kr * kc) as f64;
        let mut dxp = Array4::<f64>::zeros(cache.padded_shape);

        for n in 0..n_ex {
            for i in 0..out_rows {
                for j in 0..out_cols {
                    for k in 0..ch {
                        let g = dy[[n, i, j, k]];
                        match &cache.argmax {
                            Some(arg) => {
                                let (r, c) = arg[[n, i, j, k]];
                                dxp[[n, i * s + r, j * s + c, k]] += g;
                            }
                            None => {
                                for r in 0..kr {
                                    for c in 0..kc {
                                        dxp[[n, i * s + r, j * s + c, k]] += g / window;
                                    }
                                }
                            }
                        }
                    }
                }
            }
        }

        let dx = unpad_4d(&dxp, &cache.pad);
        trace!("{}: backward {:?} -> {:?}", NAME, grad_output.shape(), dx.shape());
        Ok(dx.into_dyn())
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
        Hyperparameters::new(LayerConfig::Pool2D(self.config.clone()))
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
            LayerConfig::Pool2D(c) => {
                self.config = c.clone();
                Ok(())
            }
            other => Err(mismatch(NAME, other)),
        }
    }
}
