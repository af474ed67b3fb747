//! Error types shared by every layer and module.

use thiserror::Error;

/// Errors raised by layer construction, forward/backward passes and
/// parameter restoration.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum LayerError {
    #[error("{layer}: expected shape {expected:?}, got {actual:?}")]
    ShapeMismatch {
        layer: String,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    #[error("{layer}: expected a rank-{expected} tensor, got shape {actual:?}")]
    RankMismatch {
        layer: String,
        expected: usize,
        actual: Vec<usize>,
    },

    #[error("{0} is frozen")]
    Frozen(String),

    #[error("{0}: backward called without a cached forward pass")]
    NoForwardCache(String),

    #[error("{layer}: {reason}")]
    SequenceOrder { layer: String, reason: String },

    #[error("padding {0:?} is asymmetric (top, bottom, left, right)")]
    AsymmetricPadding([usize; 4]),

    #[error("invalid padding: {0}")]
    InvalidPadding(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("summary describes a {found} layer, cannot restore into {expected}")]
    LayerMismatch { expected: String, found: String },

    #[error("missing parameter '{0}'")]
    MissingParameter(String),
}

impl LayerError {
    pub(crate) fn shape(layer: &str, expected: &[usize], actual: &[usize]) -> Self {
        LayerError::ShapeMismatch {
            layer: layer.to_string(),
            expected: expected.to_vec(),
            actual: actual.to_vec(),
        }
    }

    pub(crate) fn order(layer: &str, reason: &str) -> Self {
        LayerError::SequenceOrder {
            layer: layer.to_string(),
            reason: reason.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, LayerError>;
