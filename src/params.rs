//! Parameter and gradient containers.
//!
//! A [`ParamDict`] maps tensor names to tensors. Composite modules nest the
//! dictionaries of their sub-layers under `components`, keyed by sub-layer
//! name, so parameters and gradients of a module always share one shape of
//! tree.

use std::collections::BTreeMap;

use ndarray::{Array, Dimension, IxDyn};
use serde::{Deserialize, Serialize};

use crate::error::{LayerError, Result};
use crate::utils::tensor::Tensor;

/// Named tensors of one layer, e.g. intermediate outputs.
pub type TensorMap = BTreeMap<String, Tensor>;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParamDict {
    #[serde(default)]
    pub tensors: TensorMap,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub components: BTreeMap<String, ParamDict>,
}

impl ParamDict {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insertion of a tensor.
    pub fn with(mut self, name: &str, tensor: Tensor) -> Self {
        self.tensors.insert(name.to_string(), tensor);
        self
    }

    /// Builder-style insertion of a sub-layer dictionary.
    pub fn with_component(mut self, name: &str, dict: ParamDict) -> Self {
        self.components.insert(name.to_string(), dict);
        self
    }

    pub fn get(&self, name: &str) -> Option<&Tensor> {
        self.tensors.get(name)
    }

    /// Tensor lookup that fails with [`LayerError::MissingParameter`].
    pub fn tensor(&self, name: &str) -> Result<&Tensor> {
        self.tensors
            .get(name)
            .ok_or_else(|| LayerError::MissingParameter(name.to_string()))
    }

    pub fn component(&self, name: &str) -> Result<&ParamDict> {
        self.components
            .get(name)
            .ok_or_else(|| LayerError::MissingParameter(format!("components.{}", name)))
    }

    /// Total number of scalars in this dictionary and every component.
    pub fn element_count(&self) -> usize {
        self.tensors.values().map(|t| t.len()).sum::<usize>()
            + self
                .components
                .values()
                .map(ParamDict::element_count)
                .sum::<usize>()
    }

    /// A dictionary of the same structure filled with zeros.
    pub fn zeros_like(&self) -> ParamDict {
        ParamDict {
            tensors: self
                .tensors
                .iter()
                .map(|(k, t)| (k.clone(), Tensor::zeros(IxDyn(t.shape()))))
                .collect(),
            components: self
                .components
                .iter()
                .map(|(k, c)| (k.clone(), c.zeros_like()))
                .collect(),
        }
    }

    /// True when both trees have the same keys and tensor shapes.
    pub fn same_structure(&self, other: &ParamDict) -> bool {
        self.tensors.len() == other.tensors.len()
            && self.components.len() == other.components.len()
            && self.tensors.iter().all(|(k, t)| {
                other
                    .tensors
                    .get(k)
                    .map_or(false, |o| o.shape() == t.shape())
            })
            && self.components.iter().all(|(k, c)| {
                other
                    .components
                    .get(k)
                    .map_or(false, |o| c.same_structure(o))
            })
    }

    /// Every scalar of every tensor, depth first.
    pub fn all_values(&self) -> Vec<f64> {
        let mut out: Vec<f64> = self.tensors.values().flat_map(|t| t.iter().copied()).collect();
        for c in self.components.values() {
            out.extend(c.all_values());
        }
        out
    }
}

/// Copy `name` from `source` into `target`, requiring an identical shape.
pub(crate) fn load_tensor<D: Dimension>(
    layer: &str,
    target: &mut Array<f64, D>,
    source: &ParamDict,
    name: &str,
) -> Result<()> {
    let incoming = source.tensor(name)?;
    let mismatch = || {
        LayerError::shape(
            &format!("{}.{}", layer, name),
            target.shape(),
            incoming.shape(),
        )
    };
    if incoming.shape() != target.shape() {
        return Err(mismatch());
    }
    let view = incoming
        .view()
        .into_dimensionality::<D>()
        .map_err(|_| mismatch())?;
    target.assign(&view);
    Ok(())
}
