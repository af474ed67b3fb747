//! Rust Neural Network Layers
//!
//! Hand-written layers with analytic forward and backward passes, meant to be
//! composed by an external training loop.
//!
//! # Modules
//!
//! - `layers`: Layer trait and implementations (FullyConnected, Conv2D, Pool2D,
//!   batch normalization, recurrent cells, Add, Dropout)
//! - `modules`: Composite modules (residual skip connections, bidirectional LSTM)
//! - `optimizers`: Optimizer trait and plain SGD
//! - `losses`: Squared error and cross-entropy
//! - `config`: Layer configuration structures and JSON checkpoints
//! - `params`: Parameter and gradient dictionaries
//! - `utils`: Shared utilities (RNG, activations, initialization, padding)

pub mod config;
pub mod error;
pub mod layers;
pub mod losses;
pub mod modules;
pub mod optimizers;
pub mod params;
pub mod utils;

pub use error::{LayerError, Result};
pub use layers::Layer;
pub use params::ParamDict;
pub use utils::{SimpleRng, Tensor};
