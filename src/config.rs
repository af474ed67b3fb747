//! Layer configuration, hyperparameters and checkpoint I/O.
//!
//! Every layer is described by a serde-deserializable config struct. The
//! tagged [`LayerConfig`] enum is what a layer reports as its
//! hyperparameters and what a JSON configuration file contains:
//!
//! ```json
//! {
//!   "layer": "Conv2D",
//!   "in_channels": 2,
//!   "out_channels": 3,
//!   "kernel_shape": [3, 3],
//!   "pad": "same",
//!   "act_fn": "relu"
//! }
//! ```
//!
//! Checkpoints are [`Summary`] values serialised as JSON.

use std::fs;
use std::path::Path;

use log::{debug, warn};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::LayerError;
use crate::layers::{
    BatchNorm1D, BatchNorm2D, Conv2D, Dropout, FullyConnected, Layer, Pool2D, RnnCell,
};
use crate::modules::{BidirectionalLstm, SkipConnectionConvModule, SkipConnectionIdentityModule};
use crate::params::ParamDict;
use crate::utils::activations::Activation;
use crate::utils::init::WeightInit;
use crate::utils::padding::{PadDims, Padding};
use crate::utils::rng::SimpleRng;
use crate::utils::tensor::Tensor;

/// Errors raised while reading or writing configuration and checkpoint files.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Layer(#[from] LayerError),
}

fn default_stride() -> usize {
    1
}

fn default_momentum() -> f64 {
    0.9
}

fn default_epsilon() -> f64 {
    1e-5
}

fn default_tanh() -> Activation {
    Activation::Tanh
}

fn default_sigmoid() -> Activation {
    Activation::Sigmoid
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FullyConnectedConfig {
    pub n_in: usize,
    pub n_out: usize,
    #[serde(default)]
    pub act_fn: Activation,
    #[serde(default)]
    pub init: WeightInit,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conv2DConfig {
    pub in_channels: usize,
    pub out_channels: usize,
    pub kernel_shape: (usize, usize),
    #[serde(default = "default_stride")]
    pub stride: usize,
    #[serde(default)]
    pub pad: Padding,
    #[serde(default)]
    pub act_fn: Activation,
    #[serde(default)]
    pub init: WeightInit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PoolMode {
    #[default]
    Max,
    Average,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pool2DConfig {
    pub kernel_shape: (usize, usize),
    #[serde(default = "default_stride")]
    pub stride: usize,
    #[serde(default)]
    pub pad: Padding,
    #[serde(default)]
    pub mode: PoolMode,
}

/// Shared by the 1-D and 2-D batch normalisation layers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchNormConfig {
    pub n_in: usize,
    #[serde(default = "default_momentum")]
    pub momentum: f64,
    #[serde(default = "default_epsilon")]
    pub epsilon: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RnnCellConfig {
    pub n_in: usize,
    pub n_out: usize,
    #[serde(default = "default_tanh")]
    pub act_fn: Activation,
    #[serde(default)]
    pub init: WeightInit,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LstmCellConfig {
    pub n_in: usize,
    pub n_out: usize,
    #[serde(default = "default_tanh")]
    pub act_fn: Activation,
    #[serde(default = "default_sigmoid")]
    pub gate_fn: Activation,
    #[serde(default)]
    pub init: WeightInit,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct AddConfig {
    #[serde(default)]
    pub act_fn: Activation,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkipConnectionIdentityConfig {
    pub in_channels: usize,
    pub out_channels: usize,
    pub kernel_shape1: (usize, usize),
    pub kernel_shape2: (usize, usize),
    #[serde(default = "default_stride")]
    pub stride1: usize,
    #[serde(default = "default_stride")]
    pub stride2: usize,
    #[serde(default)]
    pub act_fn: Activation,
    #[serde(default = "default_momentum")]
    pub momentum: f64,
    #[serde(default = "default_epsilon")]
    pub epsilon: f64,
    #[serde(default)]
    pub init: WeightInit,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkipConnectionConvConfig {
    pub in_channels: usize,
    pub out_channels1: usize,
    pub out_channels2: usize,
    pub kernel_shape1: (usize, usize),
    pub kernel_shape2: (usize, usize),
    pub kernel_shape_skip: (usize, usize),
    #[serde(default = "default_stride")]
    pub stride1: usize,
    #[serde(default = "default_stride")]
    pub stride2: usize,
    #[serde(default = "default_stride")]
    pub stride_skip: usize,
    #[serde(default)]
    pub pad1: Padding,
    #[serde(default)]
    pub pad2: Padding,
    /// Skip-branch padding resolved by the most recent forward pass.
    #[serde(default)]
    pub pad_skip: Option<PadDims>,
    #[serde(default)]
    pub act_fn: Activation,
    #[serde(default = "default_momentum")]
    pub momentum: f64,
    #[serde(default = "default_epsilon")]
    pub epsilon: f64,
    #[serde(default)]
    pub init: WeightInit,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BidirectionalLstmConfig {
    pub n_in: usize,
    pub n_out: usize,
    #[serde(default = "default_tanh")]
    pub act_fn: Activation,
    #[serde(default = "default_sigmoid")]
    pub gate_fn: Activation,
    #[serde(default)]
    pub init: WeightInit,
}

/// Configuration of any layer or module, tagged by its name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "layer")]
pub enum LayerConfig {
    FullyConnected(FullyConnectedConfig),
    Conv2D(Conv2DConfig),
    Pool2D(Pool2DConfig),
    BatchNorm1D(BatchNormConfig),
    BatchNorm2D(BatchNormConfig),
    #[serde(rename = "RNNCell")]
    RnnCell(RnnCellConfig),
    #[serde(rename = "LSTMCell")]
    LstmCell(LstmCellConfig),
    Add(AddConfig),
    SkipConnectionIdentityModule(SkipConnectionIdentityConfig),
    SkipConnectionConvModule(SkipConnectionConvConfig),
    #[serde(rename = "BidirectionalLSTM")]
    BidirectionalLstm(BidirectionalLstmConfig),
}

impl LayerConfig {
    pub fn name(&self) -> &'static str {
        match self {
            LayerConfig::FullyConnected(_) => "FullyConnected",
            LayerConfig::Conv2D(_) => "Conv2D",
            LayerConfig::Pool2D(_) => "Pool2D",
            LayerConfig::BatchNorm1D(_) => "BatchNorm1D",
            LayerConfig::BatchNorm2D(_) => "BatchNorm2D",
            LayerConfig::RnnCell(_) => "RNNCell",
            LayerConfig::LstmCell(_) => "LSTMCell",
            LayerConfig::Add(_) => "Add",
            LayerConfig::SkipConnectionIdentityModule(_) => "SkipConnectionIdentityModule",
            LayerConfig::SkipConnectionConvModule(_) => "SkipConnectionConvModule",
            LayerConfig::BidirectionalLstm(_) => "BidirectionalLSTM",
        }
    }

    /// Check value ranges that serde cannot express.
    pub fn validate(&self) -> Result<(), LayerError> {
        fn positive(name: &str, v: usize) -> Result<(), LayerError> {
            if v == 0 {
                Err(LayerError::InvalidConfig(format!("{} must be positive", name)))
            } else {
                Ok(())
            }
        }
        fn kernel(name: &str, k: (usize, usize)) -> Result<(), LayerError> {
            positive(name, k.0)?;
            positive(name, k.1)
        }
        fn batchnorm(momentum: f64, epsilon: f64) -> Result<(), LayerError> {
            if !(0.0..=1.0).contains(&momentum) {
                return Err(LayerError::InvalidConfig(format!(
                    "momentum must be in [0, 1], got {}",
                    momentum
                )));
            }
            if epsilon <= 0.0 {
                return Err(LayerError::InvalidConfig(format!(
                    "epsilon must be positive, got {}",
                    epsilon
                )));
            }
            Ok(())
        }

        fn pool_pad(kernel: (usize, usize), pad: &Padding) -> Result<(), LayerError> {
            let (rows, cols) = match *pad {
                Padding::Uniform(p) => (p, p),
                Padding::Symmetric(r, c) => (r, c),
                Padding::Same => return Ok(()),
            };
            // a window lying wholly in the padding has nothing to pool
            if rows >= kernel.0 || cols >= kernel.1 {
                return Err(LayerError::InvalidConfig(format!(
                    "pool padding {:?} must be smaller than kernel_shape {:?}",
                    pad, kernel
                )));
            }
            Ok(())
        }

        let activations = match self {
            LayerConfig::FullyConnected(c) => vec![c.act_fn],
            LayerConfig::Conv2D(c) => vec![c.act_fn],
            LayerConfig::RnnCell(c) => vec![c.act_fn],
            LayerConfig::LstmCell(c) => vec![c.act_fn, c.gate_fn],
            LayerConfig::Add(c) => vec![c.act_fn],
            LayerConfig::SkipConnectionIdentityModule(c) => vec![c.act_fn],
            LayerConfig::SkipConnectionConvModule(c) => vec![c.act_fn],
            LayerConfig::BidirectionalLstm(c) => vec![c.act_fn, c.gate_fn],
            LayerConfig::Pool2D(_) | LayerConfig::BatchNorm1D(_) | LayerConfig::BatchNorm2D(_) => {
                Vec::new()
            }
        };
        for act in &activations {
            act.validate()?;
        }

        match self {
            LayerConfig::FullyConnected(c) => {
                positive("n_in", c.n_in)?;
                positive("n_out", c.n_out)
            }
            LayerConfig::Conv2D(c) => {
                positive("in_channels", c.in_channels)?;
                positive("out_channels", c.out_channels)?;
                kernel("kernel_shape", c.kernel_shape)?;
                positive("stride", c.stride)
            }
            LayerConfig::Pool2D(c) => {
                kernel("kernel_shape", c.kernel_shape)?;
                positive("stride", c.stride)?;
                pool_pad(c.kernel_shape, &c.pad)
            }
            LayerConfig::BatchNorm1D(c) | LayerConfig::BatchNorm2D(c) => {
                positive("n_in", c.n_in)?;
                batchnorm(c.momentum, c.epsilon)
            }
            LayerConfig::RnnCell(c) => {
                positive("n_in", c.n_in)?;
                positive("n_out", c.n_out)
            }
            LayerConfig::LstmCell(c) => {
                positive("n_in", c.n_in)?;
                positive("n_out", c.n_out)
            }
            LayerConfig::Add(_) => Ok(()),
            LayerConfig::SkipConnectionIdentityModule(c) => {
                positive("in_channels", c.in_channels)?;
                if c.in_channels != c.out_channels {
                    return Err(LayerError::InvalidConfig(format!(
                        "identity skip connection needs in_channels == out_channels, got {} and {}",
                        c.in_channels, c.out_channels
                    )));
                }
                kernel("kernel_shape1", c.kernel_shape1)?;
                kernel("kernel_shape2", c.kernel_shape2)?;
                positive("stride1", c.stride1)?;
                positive("stride2", c.stride2)?;
                batchnorm(c.momentum, c.epsilon)
            }
            LayerConfig::SkipConnectionConvModule(c) => {
                positive("in_channels", c.in_channels)?;
                positive("out_channels1", c.out_channels1)?;
                positive("out_channels2", c.out_channels2)?;
                kernel("kernel_shape1", c.kernel_shape1)?;
                kernel("kernel_shape2", c.kernel_shape2)?;
                kernel("kernel_shape_skip", c.kernel_shape_skip)?;
                positive("stride1", c.stride1)?;
                positive("stride2", c.stride2)?;
                positive("stride_skip", c.stride_skip)?;
                batchnorm(c.momentum, c.epsilon)
            }
            LayerConfig::BidirectionalLstm(c) => {
                positive("n_in", c.n_in)?;
                positive("n_out", c.n_out)
            }
        }
    }
}

/// Descriptor of a behavioural wrapper attached to a layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "wrapper")]
pub enum WrapperConfig {
    Dropout { p: f64 },
}

impl WrapperConfig {
    pub fn name(&self) -> &'static str {
        match self {
            WrapperConfig::Dropout { .. } => "Dropout",
        }
    }
}

/// Hyperparameters of a layer: its configuration plus attached wrappers,
/// innermost first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hyperparameters {
    pub config: LayerConfig,
    #[serde(default)]
    pub wrappers: Vec<WrapperConfig>,
}

impl Hyperparameters {
    pub fn new(config: LayerConfig) -> Self {
        Self {
            config,
            wrappers: Vec::new(),
        }
    }
}

/// Checkpoint of a layer: everything needed to rebuild it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Summary {
    pub layer: String,
    pub layer_wrappers: Vec<String>,
    pub parameters: ParamDict,
    pub hyperparameters: Hyperparameters,
}

impl Summary {
    pub fn new(hyperparameters: Hyperparameters, parameters: ParamDict) -> Self {
        Self {
            layer: hyperparameters.config.name().to_string(),
            layer_wrappers: hyperparameters
                .wrappers
                .iter()
                .map(|w| w.name().to_string())
                .collect(),
            parameters,
            hyperparameters,
        }
    }

    /// The same summary with the outermost wrapper removed.
    pub fn without_outer_wrapper(&self) -> Summary {
        let mut hp = self.hyperparameters.clone();
        hp.wrappers.pop();
        Summary::new(hp, self.parameters.clone())
    }
}

/// Read and validate a JSON layer configuration.
pub fn load_layer_config<P: AsRef<Path>>(path: P) -> Result<LayerConfig, ConfigError> {
    let contents = fs::read_to_string(path)?;
    let config: LayerConfig = serde_json::from_str(&contents)?;
    config.validate()?;
    Ok(config)
}

pub fn save_summary<P: AsRef<Path>>(path: P, summary: &Summary) -> Result<(), ConfigError> {
    let json = serde_json::to_string_pretty(summary)?;
    fs::write(path, json)?;
    Ok(())
}

pub fn load_summary<P: AsRef<Path>>(path: P) -> Result<Summary, ConfigError> {
    let contents = fs::read_to_string(path)?;
    let summary: Summary = serde_json::from_str(&contents)?;
    summary.hyperparameters.config.validate()?;
    Ok(summary)
}

/// A boxed layer mapping one tensor to one tensor.
pub type TensorLayer = Box<dyn Layer<Input = Tensor, Output = Tensor>>;

/// Construct a tensor-in/tensor-out layer from its configuration and wrap
/// it in the listed wrappers, innermost first.
///
/// `LSTMCell` and `Add` have different input or output types and are built
/// directly through their constructors.
pub fn build_layer(
    config: &LayerConfig,
    wrappers: &[WrapperConfig],
    rng: &mut SimpleRng,
) -> Result<TensorLayer, LayerError> {
    config.validate()?;
    let mut layer: TensorLayer = match config {
        LayerConfig::FullyConnected(c) => Box::new(FullyConnected::new(c.clone(), rng)?),
        LayerConfig::Conv2D(c) => Box::new(Conv2D::new(c.clone(), rng)?),
        LayerConfig::Pool2D(c) => Box::new(Pool2D::new(c.clone())?),
        LayerConfig::BatchNorm1D(c) => Box::new(BatchNorm1D::new(c.clone())?),
        LayerConfig::BatchNorm2D(c) => Box::new(BatchNorm2D::new(c.clone())?),
        LayerConfig::RnnCell(c) => Box::new(RnnCell::new(c.clone(), rng)?),
        LayerConfig::SkipConnectionIdentityModule(c) => {
            Box::new(SkipConnectionIdentityModule::new(c.clone(), rng)?)
        }
        LayerConfig::SkipConnectionConvModule(c) => {
            Box::new(SkipConnectionConvModule::new(c.clone(), rng)?)
        }
        LayerConfig::BidirectionalLstm(c) => Box::new(BidirectionalLstm::new(c.clone(), rng)?),
        other => {
            return Err(LayerError::InvalidConfig(format!(
                "{} does not map a single tensor to a single tensor",
                other.name()
            )))
        }
    };

    for wrapper in wrappers {
        layer = match wrapper {
            WrapperConfig::Dropout { p } => {
                Box::new(Dropout::new(layer, *p, SimpleRng::new(rng.next_u64()))?)
            }
        };
    }
    Ok(layer)
}

/// Rebuild a tensor layer, wrappers included, from a checkpoint summary.
pub fn restore_layer(summary: &Summary, rng: &mut SimpleRng) -> Result<TensorLayer, LayerError> {
    let hp = &summary.hyperparameters;
    if summary.layer != hp.config.name() {
        warn!(
            "summary names layer {} but its hyperparameters describe {}",
            summary.layer,
            hp.config.name()
        );
    }
    let wrapper_names: Vec<&str> = hp.wrappers.iter().map(WrapperConfig::name).collect();
    if summary.layer_wrappers != wrapper_names {
        warn!(
            "summary lists wrappers {:?} but its hyperparameters carry {:?}",
            summary.layer_wrappers, wrapper_names
        );
    }
    let mut layer = build_layer(&hp.config, &hp.wrappers, rng)?;
    layer.set_params(summary)?;
    debug!(
        "restored {} with {} wrapper(s)",
        hp.config.name(),
        hp.wrappers.len()
    );
    Ok(layer)
}
