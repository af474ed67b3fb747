//! Residual blocks
//!
//! Both blocks share the main path
//!
//! ```text
//! X -> conv1 (act_fn) -> batchnorm1 -> conv2 (identity) -> batchnorm2
//! ```
//!
//! and join it with a skip path through an [`Add`] layer that applies
//! `act_fn`. [`SkipConnectionIdentityModule`] passes `X` unchanged along the
//! skip path; [`SkipConnectionConvModule`] sends it through its own
//! convolution and batch normalization so that channel counts and spatial
//! sizes can change.

use log::{debug, trace};

use crate::config::{
    AddConfig, BatchNormConfig, Conv2DConfig, Hyperparameters, LayerConfig,
    SkipConnectionConvConfig, SkipConnectionIdentityConfig, Summary,
};
use crate::error::{LayerError, Result};
use crate::layers::{ensure_same_dims, mismatch, Add, BatchNorm2D, Conv2D, Layer};
use crate::optimizers::Optimizer;
use crate::params::{ParamDict, TensorMap};
use crate::utils::activations::Activation;
use crate::utils::padding::{calc_pad_dims_2d, Padding};
use crate::utils::rng::SimpleRng;
use crate::utils::tensor::Tensor;

/// Hand a component of a module checkpoint to one sub-layer.
fn restore_component<L: Layer>(
    layer: &mut L,
    name: &str,
    config: LayerConfig,
    params: &ParamDict,
) -> Result<()> {
    let component = params.component(name)?.clone();
    layer.set_params(&Summary::new(Hyperparameters::new(config), component))
}

fn bn_config(n_in: usize, momentum: f64, epsilon: f64) -> BatchNormConfig {
    BatchNormConfig {
        n_in,
        momentum,
        epsilon,
    }
}

/// Configurations of the four main-path layers.
#[derive(Debug, Clone)]
struct MainPathConfig {
    conv1: Conv2DConfig,
    batchnorm1: BatchNormConfig,
    conv2: Conv2DConfig,
    batchnorm2: BatchNormConfig,
}

/// `conv1 -> batchnorm1 -> conv2 -> batchnorm2`, recording every
/// intermediate output and gradient.
#[derive(Debug, Clone)]
struct MainPath {
    conv1: Conv2D,
    batchnorm1: BatchNorm2D,
    conv2: Conv2D,
    batchnorm2: BatchNorm2D,
}

impl MainPath {
    fn new(config: MainPathConfig, rng: &mut SimpleRng) -> Result<Self> {
        Ok(Self {
            conv1: Conv2D::new(config.conv1, rng)?,
            batchnorm1: BatchNorm2D::new(config.batchnorm1)?,
            conv2: Conv2D::new(config.conv2, rng)?,
            batchnorm2: BatchNorm2D::new(config.batchnorm2)?,
        })
    }

    fn forward(&mut self, x: &Tensor, vars: &mut TensorMap) -> Result<Tensor> {
        let conv1_out = self.conv1.forward(x)?;
        let bn1_out = self.batchnorm1.forward(&conv1_out)?;
        let conv2_out = self.conv2.forward(&bn1_out)?;
        let bn2_out = self.batchnorm2.forward(&conv2_out)?;

        vars.insert("conv1_out".to_string(), conv1_out);
        vars.insert("batchnorm1_out".to_string(), bn1_out);
        vars.insert("conv2_out".to_string(), conv2_out);
        vars.insert("batchnorm2_out".to_string(), bn2_out.clone());
        Ok(bn2_out)
    }

    fn backward(&mut self, dldbn2: Tensor, vars: &mut TensorMap) -> Result<Tensor> {
        let dldconv2 = self.batchnorm2.backward(&dldbn2)?;
        let dldbn1 = self.conv2.backward(&dldconv2)?;
        let dldconv1 = self.batchnorm1.backward(&dldbn1)?;
        let dx = self.conv1.backward(&dldconv1)?;

        vars.insert("dLdBn2".to_string(), dldbn2);
        vars.insert("dLdConv2".to_string(), dldconv2);
        vars.insert("dLdBn1".to_string(), dldbn1);
        vars.insert("dLdConv1".to_string(), dldconv1);
        Ok(dx)
    }

    fn parameters(&self) -> ParamDict {
        ParamDict::new()
            .with_component("conv1", self.conv1.parameters())
            .with_component("batchnorm1", self.batchnorm1.parameters())
            .with_component("conv2", self.conv2.parameters())
            .with_component("batchnorm2", self.batchnorm2.parameters())
    }

    fn gradients(&self) -> ParamDict {
        ParamDict::new()
            .with_component("conv1", self.conv1.gradients())
            .with_component("batchnorm1", self.batchnorm1.gradients())
            .with_component("conv2", self.conv2.gradients())
            .with_component("batchnorm2", self.batchnorm2.gradients())
    }

    fn set_trainable(&mut self, trainable: bool) {
        if trainable {
            self.conv1.unfreeze();
            self.batchnorm1.unfreeze();
            self.conv2.unfreeze();
            self.batchnorm2.unfreeze();
        } else {
            self.conv1.freeze();
            self.batchnorm1.freeze();
            self.conv2.freeze();
            self.batchnorm2.freeze();
        }
    }

    fn flush_gradients(&mut self) -> Result<()> {
        self.conv1.flush_gradients()?;
        self.batchnorm1.flush_gradients()?;
        self.conv2.flush_gradients()?;
        self.batchnorm2.flush_gradients()
    }

    fn update(&mut self, optimizer: &mut dyn Optimizer) -> Result<()> {
        self.conv1.update_with_optimizer(optimizer)?;
        self.batchnorm1.update_with_optimizer(optimizer)?;
        self.conv2.update_with_optimizer(optimizer)?;
        self.batchnorm2.update_with_optimizer(optimizer)
    }

    fn set_params(&mut self, config: MainPathConfig, params: &ParamDict) -> Result<()> {
        restore_component(&mut self.conv1, "conv1", LayerConfig::Conv2D(config.conv1), params)?;
        restore_component(
            &mut self.batchnorm1,
            "batchnorm1",
            LayerConfig::BatchNorm2D(config.batchnorm1),
            params,
        )?;
        restore_component(&mut self.conv2, "conv2", LayerConfig::Conv2D(config.conv2), params)?;
        restore_component(
            &mut self.batchnorm2,
            "batchnorm2",
            LayerConfig::BatchNorm2D(config.batchnorm2),
            params,
        )
    }
}

/// Residual block whose skip path is the identity.
///
/// Both convolutions use `same` padding, so with unit strides the main path
/// preserves the input shape and can be added back onto `X`.
#[derive(Debug, Clone)]
pub struct SkipConnectionIdentityModule {
    config: SkipConnectionIdentityConfig,
    main: MainPath,
    add: Add,
    trainable: bool,
    vars: TensorMap,
}

impl SkipConnectionIdentityModule {
    const NAME: &'static str = "SkipConnectionIdentityModule";

    pub fn new(config: SkipConnectionIdentityConfig, rng: &mut SimpleRng) -> Result<Self> {
        LayerConfig::SkipConnectionIdentityModule(config.clone()).validate()?;
        let main = MainPath::new(Self::main_config(&config), rng)?;
        let add = Add::new(AddConfig {
            act_fn: config.act_fn,
        })?;
        Ok(Self {
            config,
            main,
            add,
            trainable: true,
            vars: TensorMap::new(),
        })
    }

    fn main_config(c: &SkipConnectionIdentityConfig) -> MainPathConfig {
        MainPathConfig {
            conv1: Conv2DConfig {
                in_channels: c.in_channels,
                out_channels: c.out_channels,
                kernel_shape: c.kernel_shape1,
                stride: c.stride1,
                pad: Padding::Same,
                act_fn: c.act_fn,
                init: c.init,
            },
            batchnorm1: bn_config(c.out_channels, c.momentum, c.epsilon),
            conv2: Conv2DConfig {
                in_channels: c.out_channels,
                out_channels: c.in_channels,
                kernel_shape: c.kernel_shape2,
                stride: c.stride2,
                pad: Padding::Same,
                act_fn: Activation::Identity,
                init: c.init,
            },
            batchnorm2: bn_config(c.in_channels, c.momentum, c.epsilon),
        }
    }

    pub fn config(&self) -> &SkipConnectionIdentityConfig {
        &self.config
    }

    pub fn momentum(&self) -> f64 {
        self.config.momentum
    }

    pub fn epsilon(&self) -> f64 {
        self.config.epsilon
    }
}

impl Layer for SkipConnectionIdentityModule {
    type Input = Tensor;
    type Output = Tensor;

    fn forward(&mut self, input: &Tensor) -> Result<Tensor> {
        self.vars.clear();
        let bn2_out = self.main.forward(input, &mut self.vars)?;
        let y = self.add.forward(&vec![input.clone(), bn2_out])?;
        trace!("{}: forward {:?} -> {:?}", Self::NAME, input.shape(), y.shape());
        Ok(y)
    }

    fn backward(&mut self, grad_output: &Tensor) -> Result<Tensor> {
        let mut grads = self.add.backward(grad_output)?.into_iter();
        let (dx_skip, dldbn2) = match (grads.next(), grads.next()) {
            (Some(a), Some(b)) => (a, b),
            _ => return Err(LayerError::NoForwardCache(Self::NAME.to_string())),
        };
        let dx_main = self.main.backward(dldbn2, &mut self.vars)?;
        let dx = dx_main + &dx_skip;
        self.vars.insert("dLdX".to_string(), dx.clone());
        Ok(dx)
    }

    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn parameters(&self) -> ParamDict {
        self.main.parameters()
    }

    fn gradients(&self) -> ParamDict {
        self.main.gradients()
    }

    fn hyperparameters(&self) -> Hyperparameters {
        Hyperparameters::new(LayerConfig::SkipConnectionIdentityModule(self.config.clone()))
    }

    fn derived_variables(&self) -> TensorMap {
        self.vars.clone()
    }

    fn is_trainable(&self) -> bool {
        self.trainable
    }

    fn freeze(&mut self) {
        self.trainable = false;
        self.main.set_trainable(false);
        self.add.freeze();
    }

    fn unfreeze(&mut self) {
        self.trainable = true;
        self.main.set_trainable(true);
        self.add.unfreeze();
    }

    fn flush_gradients(&mut self) -> Result<()> {
        self.main.flush_gradients()?;
        self.add.flush_gradients()?;
        self.vars.clear();
        debug!("{}: gradients flushed", Self::NAME);
        Ok(())
    }

    fn update_with_optimizer(&mut self, optimizer: &mut dyn Optimizer) -> Result<()> {
        self.main.update(optimizer)
    }

    fn set_params(&mut self, summary: &Summary) -> Result<()> {
        let config = match &summary.hyperparameters.config {
            LayerConfig::SkipConnectionIdentityModule(c) => c,
            other => return Err(mismatch(Self::NAME, other)),
        };
        ensure_same_dims(
            Self::NAME,
            &[self.config.in_channels, self.config.out_channels],
            &[config.in_channels, config.out_channels],
        )?;
        self.main
            .set_params(Self::main_config(config), &summary.parameters)?;
        self.add.set_params(&Summary::new(
            Hyperparameters::new(LayerConfig::Add(AddConfig {
                act_fn: config.act_fn,
            })),
            ParamDict::new(),
        ))?;
        self.config = config.clone();
        Ok(())
    }
}

/// Residual block with a convolutional skip path.
///
/// The skip convolution's padding is resolved on every forward pass so that
/// its output matches the spatial size of the main path; the resolved value
/// is reported as the `pad_skip` hyperparameter.
#[derive(Debug, Clone)]
pub struct SkipConnectionConvModule {
    config: SkipConnectionConvConfig,
    main: MainPath,
    conv_skip: Conv2D,
    batchnorm_skip: BatchNorm2D,
    add: Add,
    trainable: bool,
    vars: TensorMap,
}

impl SkipConnectionConvModule {
    const NAME: &'static str = "SkipConnectionConvModule";

    pub fn new(config: SkipConnectionConvConfig, rng: &mut SimpleRng) -> Result<Self> {
        LayerConfig::SkipConnectionConvModule(config.clone()).validate()?;
        let main = MainPath::new(Self::main_config(&config), rng)?;
        let conv_skip = Conv2D::new(Self::skip_conv_config(&config), rng)?;
        let batchnorm_skip =
            BatchNorm2D::new(bn_config(config.out_channels2, config.momentum, config.epsilon))?;
        let add = Add::new(AddConfig {
            act_fn: config.act_fn,
        })?;
        Ok(Self {
            config,
            main,
            conv_skip,
            batchnorm_skip,
            add,
            trainable: true,
            vars: TensorMap::new(),
        })
    }

    fn main_config(c: &SkipConnectionConvConfig) -> MainPathConfig {
        MainPathConfig {
            conv1: Conv2DConfig {
                in_channels: c.in_channels,
                out_channels: c.out_channels1,
                kernel_shape: c.kernel_shape1,
                stride: c.stride1,
                pad: c.pad1,
                act_fn: c.act_fn,
                init: c.init,
            },
            batchnorm1: bn_config(c.out_channels1, c.momentum, c.epsilon),
            conv2: Conv2DConfig {
                in_channels: c.out_channels1,
                out_channels: c.out_channels2,
                kernel_shape: c.kernel_shape2,
                stride: c.stride2,
                pad: c.pad2,
                act_fn: Activation::Identity,
                init: c.init,
            },
            batchnorm2: bn_config(c.out_channels2, c.momentum, c.epsilon),
        }
    }

    fn skip_conv_config(c: &SkipConnectionConvConfig) -> Conv2DConfig {
        let pad = c
            .pad_skip
            .map(|p| Padding::Symmetric(p.top, p.left))
            .unwrap_or_default();
        Conv2DConfig {
            in_channels: c.in_channels,
            out_channels: c.out_channels2,
            kernel_shape: c.kernel_shape_skip,
            stride: c.stride_skip,
            pad,
            act_fn: Activation::Identity,
            init: c.init,
        }
    }

    pub fn config(&self) -> &SkipConnectionConvConfig {
        &self.config
    }

    pub fn momentum(&self) -> f64 {
        self.config.momentum
    }

    pub fn epsilon(&self) -> f64 {
        self.config.epsilon
    }
}

impl Layer for SkipConnectionConvModule {
    type Input = Tensor;
    type Output = Tensor;

    fn forward(&mut self, input: &Tensor) -> Result<Tensor> {
        self.vars.clear();
        let bn2_out = self.main.forward(input, &mut self.vars)?;

        let out_dims = (bn2_out.shape()[1], bn2_out.shape()[2]);
        let pad = calc_pad_dims_2d(
            input.shape(),
            out_dims,
            self.config.kernel_shape_skip,
            self.config.stride_skip,
            0,
        )?;
        let (pad_rows, pad_cols) = pad.to_symmetric()?;
        self.conv_skip.set_padding(Padding::Symmetric(pad_rows, pad_cols));
        self.config.pad_skip = Some(pad);
        debug!("{}: skip padding resolved to {:?}", Self::NAME, pad);

        let conv_skip_out = self.conv_skip.forward(input)?;
        let bn_skip_out = self.batchnorm_skip.forward(&conv_skip_out)?;
        self.vars.insert("conv_skip_out".to_string(), conv_skip_out);
        self.vars
            .insert("batchnorm_skip_out".to_string(), bn_skip_out.clone());

        let y = self.add.forward(&vec![bn_skip_out, bn2_out])?;
        trace!("{}: forward {:?} -> {:?}", Self::NAME, input.shape(), y.shape());
        Ok(y)
    }

    fn backward(&mut self, grad_output: &Tensor) -> Result<Tensor> {
        let mut grads = self.add.backward(grad_output)?.into_iter();
        let (dldbn_skip, dldbn2) = match (grads.next(), grads.next()) {
            (Some(a), Some(b)) => (a, b),
            _ => return Err(LayerError::NoForwardCache(Self::NAME.to_string())),
        };

        let dx_main = self.main.backward(dldbn2, &mut self.vars)?;
        let dldconv_skip = self.batchnorm_skip.backward(&dldbn_skip)?;
        let dx_skip = self.conv_skip.backward(&dldconv_skip)?;
        let dx = dx_main + &dx_skip;

        self.vars.insert("dLdBnSkip".to_string(), dldbn_skip);
        self.vars.insert("dLdConvSkip".to_string(), dldconv_skip);
        self.vars.insert("dLdX".to_string(), dx.clone());
        Ok(dx)
    }

    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn parameters(&self) -> ParamDict {
        self.main
            .parameters()
            .with_component("conv_skip", self.conv_skip.parameters())
            .with_component("batchnorm_skip", self.batchnorm_skip.parameters())
    }

    fn gradients(&self) -> ParamDict {
        self.main
            .gradients()
            .with_component("conv_skip", self.conv_skip.gradients())
            .with_component("batchnorm_skip", self.batchnorm_skip.gradients())
    }

    fn hyperparameters(&self) -> Hyperparameters {
        Hyperparameters::new(LayerConfig::SkipConnectionConvModule(self.config.clone()))
    }

    fn derived_variables(&self) -> TensorMap {
        self.vars.clone()
    }

    fn is_trainable(&self) -> bool {
        self.trainable
    }

    fn freeze(&mut self) {
        self.trainable = false;
        self.main.set_trainable(false);
        self.conv_skip.freeze();
        self.batchnorm_skip.freeze();
        self.add.freeze();
    }

    fn unfreeze(&mut self) {
        self.trainable = true;
        self.main.set_trainable(true);
        self.conv_skip.unfreeze();
        self.batchnorm_skip.unfreeze();
        self.add.unfreeze();
    }

    fn flush_gradients(&mut self) -> Result<()> {
        self.main.flush_gradients()?;
        self.conv_skip.flush_gradients()?;
        self.batchnorm_skip.flush_gradients()?;
        self.add.flush_gradients()?;
        self.vars.clear();
        debug!("{}: gradients flushed", Self::NAME);
        Ok(())
    }

    fn update_with_optimizer(&mut self, optimizer: &mut dyn Optimizer) -> Result<()> {
        self.main.update(optimizer)?;
        self.conv_skip.update_with_optimizer(optimizer)?;
        self.batchnorm_skip.update_with_optimizer(optimizer)
    }

    fn set_params(&mut self, summary: &Summary) -> Result<()> {
        let config = match &summary.hyperparameters.config {
            LayerConfig::SkipConnectionConvModule(c) => c,
            other => return Err(mismatch(Self::NAME, other)),
        };
        ensure_same_dims(
            Self::NAME,
            &[
                self.config.in_channels,
                self.config.out_channels1,
                self.config.out_channels2,
            ],
            &[config.in_channels, config.out_channels1, config.out_channels2],
        )?;
        let params = &summary.parameters;
        self.main.set_params(Self::main_config(config), params)?;
        restore_component(
            &mut self.conv_skip,
            "conv_skip",
            LayerConfig::Conv2D(Self::skip_conv_config(config)),
            params,
        )?;
        restore_component(
            &mut self.batchnorm_skip,
            "batchnorm_skip",
            LayerConfig::BatchNorm2D(bn_config(
                config.out_channels2,
                config.momentum,
                config.epsilon,
            )),
            params,
        )?;
        self.add.set_params(&Summary::new(
            Hyperparameters::new(LayerConfig::Add(AddConfig {
                act_fn: config.act_fn,
            })),
            ParamDict::new(),
        ))?;
        self.config = config.clone();
        Ok(())
    }
}
