//! 2D convolutional layer implementation
//!
//! Channel-last convolution (strictly, cross-correlation) over inputs of
//! shape `(n_ex, in_rows, in_cols, in_channels)` with kernels of shape
//! `(kernel_rows, kernel_cols, in_channels, out_channels)`.

use log::{debug, trace};
use ndarray::{Array4, Dim};

use crate::config::{Conv2DConfig, Hyperparameters, LayerConfig, Summary};
use crate::error::{LayerError, Result};
use crate::layers::{ensure_same_dims, ensure_trainable, mismatch, step, Layer};
use crate::optimizers::Optimizer;
use crate::params::{load_tensor, ParamDict, TensorMap};
use crate::utils::padding::{output_dims, pad_4d, resolve_padding, unpad_4d, PadDims, Padding};
use crate::utils::rng::SimpleRng;
use crate::utils::tensor::{check_dim, check_shape, view4, Tensor};

const NAME: &str = "Conv2D";

#[derive(Debug, Clone)]
struct ConvCache {
    x_padded: Array4<f64>,
    z: Array4<f64>,
    pad: PadDims,
}

/// 2D convolutional layer with learnable filters.
///
/// Supports zero padding (uniform, per-axis or `same`) and a configurable
/// stride shared by both spatial axes.
///
/// # Fields
///
/// * `w` - Filters `(kernel_rows, kernel_cols, in_channels, out_channels)`
/// * `b` - Bias per output channel, stored as `(1, 1, 1, out_channels)`
///
/// # Example
///
/// ```
/// use ndarray::Array4;
/// use rust_neural_layers::config::Conv2DConfig;
/// use rust_neural_layers::layers::{Conv2D, Layer};
/// use rust_neural_layers::utils::{padding::Padding, SimpleRng};
///
/// let mut rng = SimpleRng::new(42);
/// let config = Conv2DConfig {
///     in_channels: 2,
///     out_channels: 3,
///     kernel_shape: (3, 3),
///     stride: 1,
///     pad: Padding::Same,
///     act_fn: Default::default(),
///     init: Default::default(),
/// };
/// let mut conv = Conv2D::new(config, &mut rng).unwrap();
/// let y = conv.forward(&Array4::<f64>::ones((1, 5, 5, 2)).into_dyn()).unwrap();
/// assert_eq!(y.shape(), &[1, 5, 5, 3]);
/// ```
#[derive(Debug, Clone)]
pub struct Conv2D {
    config: Conv2DConfig,
    w: Array4<f64>,
    b: Array4<f64>,
    dw: Array4<f64>,
    db: Array4<f64>,
    trainable: bool,
    cache: Option<ConvCache>,
}

impl Conv2D {
    /// Create a convolution with filters drawn from `config.init` and zero
    /// biases.
    pub fn new(config: Conv2DConfig, rng: &mut SimpleRng) -> Result<Self> {
        LayerConfig::Conv2D(config.clone()).validate()?;
        let (kr, kc) = config.kernel_shape;
        let (in_ch, out_ch) = (config.in_channels, config.out_channels);
        let w = config.init.sample(Dim([kr, kc, in_ch, out_ch]), rng);

        Ok(Self {
            config,
            w,
            b: Array4::zeros((1, 1, 1, out_ch)),
            dw: Array4::zeros((kr, kc, in_ch, out_ch)),
            db: Array4::zeros((1, 1, 1, out_ch)),
            trainable: true,
            cache: None,
        })
    }

    pub fn config(&self) -> &Conv2DConfig {
        &self.config
    }

    pub fn in_channels(&self) -> usize {
        self.config.in_channels
    }

    pub fn out_channels(&self) -> usize {
        self.config.out_channels
    }

    pub fn weights(&self) -> &Array4<f64> {
        &self.w
    }

    /// Replace the configured padding. Filters are unaffected.
    pub(crate) fn set_padding(&mut self, pad: Padding) {
        self.config.pad = pad;
    }

    /// Padding applied by the most recent forward pass.
    pub fn last_padding(&self) -> Option<PadDims> {
        self.cache.as_ref().map(|c| c.pad)
    }

    /// Output shape produced for an input of shape `x_shape`.
    pub fn output_shape(&self, x_shape: &[usize]) -> Result<[usize; 4]> {
        if x_shape.len() != 4 {
            return Err(LayerError::RankMismatch {
                layer: NAME.to_string(),
                expected: 4,
                actual: x_shape.to_vec(),
            });
        }
        let pad = resolve_padding(
            self.config.pad,
            x_shape,
            self.config.kernel_shape,
            self.config.stride,
        )?;
        let (rows, cols) = output_dims(
            (x_shape[1], x_shape[2]),
            &pad,
            self.config.kernel_shape,
            self.config.stride,
        )?;
        Ok([x_shape[0], rows, cols, self.config.out_channels])
    }
}

impl Layer for Conv2D {
    type Input = Tensor;
    type Output = Tensor;

    fn forward(&mut self, input: &Tensor) -> Result<Tensor> {
        let x = view4(input, NAME)?;
        check_dim(NAME, input, 3, self.config.in_channels)?;

        let (kr, kc) = self.config.kernel_shape;
        let s = self.config.stride;
        let pad = resolve_padding(self.config.pad, input.shape(), (kr, kc), s)?;
        let (n_ex, in_rows, in_cols, in_ch) = x.dim();
        let (out_rows, out_cols) = output_dims((in_rows, in_cols), &pad, (kr, kc), s)?;
        let out_ch = self.config.out_channels;

        let xp = pad_4d(x, &pad, 0.0);
        let mut z = Array4::<f64>::zeros((n_ex, out_rows, out_cols, out_ch));

        for n in 0..n_ex {
            for i in 0..out_rows {
                for j in 0..out_cols {
                    for o in 0..out_ch {
                        let mut acc = self.b[[0, 0, 0, o]];
                        for r in 0..kr {
                            for c in 0..kc {
                                for ch in 0..in_ch {
                                    acc += xp[[n, i * s + r, j * s + c, ch]] * self.w[[r, c, ch, o]];
                                }
                            }
                        }
                        z[[n, i, j, o]] = acc;
                    }
                }
            }
        }

        let act = self.config.act_fn;
        let y = z.mapv(|v| act.apply_scalar(v));
        trace!("{}: forward {:?} -> {:?}", NAME, input.shape(), y.shape());

        self.cache = Some(ConvCache {
            x_padded: xp,
            z,
            pad,
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
        let dy = view4(grad_output, NAME)?;

        let act = self.config.act_fn;
        let dz = &dy * &cache.z.mapv(|v| act.grad_scalar(v));

        let (kr, kc) = self.config.kernel_shape;
        let s = self.config.stride;
        let (n_ex, out_rows, out_cols, out_ch) = dz.dim();
        let in_ch = self.config.in_channels;
        let xp = &cache.x_padded;
        let mut dxp = Array4::<f64>::zeros(xp.raw_dim());

        for n in 0..n_ex {
            for i in 0..out_rows {
                for j in 0..out_cols {
                    for o in 0..out_ch {
                        let g = dz[[n, i, j, o]];
                        if g == 0.0 {
                            continue;
                        }
                        self.db[[0, 0, 0, o]] += g;
                        for r in 0..kr {
                            for c in 0..kc {
                                for ch in 0..in_ch {
                                    let (pr, pc) = (i * s + r, j * s + c);
                                    self.dw[[r, c, ch, o]] += xp[[n, pr, pc, ch]] * g;
                                    dxp[[n, pr, pc, ch]] += self.w[[r, c, ch, o]] * g;
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
            .with("W", self.w.clone().into_dyn())
            .with("b", self.b.clone().into_dyn())
    }

    fn gradients(&self) -> ParamDict {
        ParamDict::new()
            .with("W", self.dw.clone().into_dyn())
            .with("b", self.db.clone().into_dyn())
    }

    fn hyperparameters(&self) -> Hyperparameters {
        Hyperparameters::new(LayerConfig::Conv2D(self.config.clone()))
    }

    fn derived_variables(&self) -> TensorMap {
        let mut vars = TensorMap::new();
        if let Some(cache) = &self.cache {
            vars.insert("Z".to_string(), cache.z.clone().into_dyn());
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
            LayerConfig::Conv2D(c) => c,
            other => return Err(mismatch(NAME, other)),
        };
        ensure_same_dims(
            NAME,
            &[
                self.config.in_channels,
                self.config.out_channels,
                self.config.kernel_shape.0,
                self.config.kernel_shape.1,
            ],
            &[
                config.in_channels,
                config.out_channels,
                config.kernel_shape.0,
                config.kernel_shape.1,
            ],
        )?;
        load_tensor(NAME, &mut self.w, &summary.parameters, "W")?;
        load_tensor(NAME, &mut self.b, &summary.parameters, "b")?;
        self.config = config.clone();
        Ok(())
    }
}
