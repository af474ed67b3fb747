//! Tensor alias and the rank/shape checks every layer runs on its inputs.

use ndarray::{ArrayD, ArrayView2, ArrayView3, ArrayView4, Ix2, Ix3, Ix4};

use crate::error::{LayerError, Result};

/// Dense n-dimensional `f64` tensor, channel-last for image data.
pub type Tensor = ArrayD<f64>;

fn rank_error(layer: &str, expected: usize, t: &Tensor) -> LayerError {
    LayerError::RankMismatch {
        layer: layer.to_string(),
        expected,
        actual: t.shape().to_vec(),
    }
}

pub fn view2<'a>(t: &'a Tensor, layer: &str) -> Result<ArrayView2<'a, f64>> {
    t.view()
        .into_dimensionality::<Ix2>()
        .map_err(|_| rank_error(layer, 2, t))
}

pub fn view3<'a>(t: &'a Tensor, layer: &str) -> Result<ArrayView3<'a, f64>> {
    t.view()
        .into_dimensionality::<Ix3>()
        .map_err(|_| rank_error(layer, 3, t))
}

pub fn view4<'a>(t: &'a Tensor, layer: &str) -> Result<ArrayView4<'a, f64>> {
    t.view()
        .into_dimensionality::<Ix4>()
        .map_err(|_| rank_error(layer, 4, t))
}

/// Fail unless `actual` equals `expected` exactly.
pub fn check_shape(layer: &str, expected: &[usize], actual: &[usize]) -> Result<()> {
    if expected == actual {
        Ok(())
    } else {
        Err(LayerError::shape(layer, expected, actual))
    }
}

/// Fail unless dimension `axis` of `t` equals `size`.
pub fn check_dim(layer: &str, t: &Tensor, axis: usize, size: usize) -> Result<()> {
    match t.shape().get(axis) {
        Some(&d) if d == size => Ok(()),
        _ => {
            let mut expected = t.shape().to_vec();
            if axis < expected.len() {
                expected[axis] = size;
            }
            Err(LayerError::shape(layer, &expected, t.shape()))
        }
    }
}
