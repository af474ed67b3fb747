//! Zero-padding configuration and the padding-dimension helper used by the
//! convolution and pooling layers.

use log::debug;
use ndarray::{s, Array4, ArrayView4};
use serde::{Deserialize, Serialize};

use crate::error::{LayerError, Result};

/// Padding requested in a layer configuration.
///
/// `Same` is resolved against each input so that the output keeps the
/// input's spatial size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Padding {
    /// Same number of pixels on every side.
    Uniform(usize),
    /// `(rows, cols)`: rows on top and bottom, cols on left and right.
    Symmetric(usize, usize),
    Same,
}

impl Default for Padding {
    fn default() -> Self {
        Padding::Uniform(0)
    }
}

/// Resolved padding, in pixels, on each side of the spatial axes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PadDims {
    pub top: usize,
    pub bottom: usize,
    pub left: usize,
    pub right: usize,
}

impl PadDims {
    pub fn new(top: usize, bottom: usize, left: usize, right: usize) -> Self {
        Self {
            top,
            bottom,
            left,
            right,
        }
    }

    pub fn is_symmetric(&self) -> bool {
        self.top == self.bottom && self.left == self.right
    }

    pub fn as_array(&self) -> [usize; 4] {
        [self.top, self.bottom, self.left, self.right]
    }

    /// `(rows, cols)` padding of a symmetric result.
    pub fn to_symmetric(&self) -> Result<(usize, usize)> {
        if self.is_symmetric() {
            Ok((self.top, self.left))
        } else {
            Err(LayerError::AsymmetricPadding(self.as_array()))
        }
    }
}

/// Padding `(top, bottom, left, right)` that makes a convolution over an
/// input of shape `(n_ex, in_rows, in_cols, in_ch)` produce `out_dims`.
///
/// An extra pixel is added to the bottom/right when an even split cannot
/// reach the requested size.
pub fn calc_pad_dims_2d(
    x_shape: &[usize],
    out_dims: (usize, usize),
    kernel_shape: (usize, usize),
    stride: usize,
    dilation: usize,
) -> Result<PadDims> {
    if x_shape.len() != 4 {
        return Err(LayerError::InvalidPadding(format!(
            "expected a 4-D input shape, got {:?}",
            x_shape
        )));
    }
    if stride == 0 {
        return Err(LayerError::InvalidPadding("stride must be positive".into()));
    }

    let (top, bottom) = pad_axis(x_shape[1], out_dims.0, kernel_shape.0, stride, dilation)?;
    let (left, right) = pad_axis(x_shape[2], out_dims.1, kernel_shape.1, stride, dilation)?;
    Ok(PadDims::new(top, bottom, left, right))
}

fn pad_axis(
    in_size: usize,
    out_size: usize,
    kernel: usize,
    stride: usize,
    dilation: usize,
) -> Result<(usize, usize)> {
    let (in_size, out_size, stride) = (in_size as isize, out_size as isize, stride as isize);
    let d = dilation as isize;
    let k = kernel as isize * (d + 1) - d;

    // integer division truncates toward zero
    let p = (stride * (out_size - 1) + k - in_size) / 2;
    let reached = (1.0 + (in_size + 2 * p - k) as f64 / stride as f64) as isize;

    let (p1, p2) = if reached == out_size {
        (p, p)
    } else if reached == out_size - 1 {
        (p, p + 1)
    } else {
        return Err(LayerError::InvalidPadding(format!(
            "no padding maps {} pixels to {} with kernel {} and stride {}",
            in_size, out_size, k, stride
        )));
    };

    if p1 < 0 || p2 < 0 {
        return Err(LayerError::InvalidPadding(format!(
            "padding cannot be negative, got ({}, {})",
            p1, p2
        )));
    }
    Ok((p1 as usize, p2 as usize))
}

/// Resolve a configured padding against an input shape. Results must be
/// symmetric.
pub fn resolve_padding(
    padding: Padding,
    x_shape: &[usize],
    kernel_shape: (usize, usize),
    stride: usize,
) -> Result<PadDims> {
    let dims = match padding {
        Padding::Uniform(p) => PadDims::new(p, p, p, p),
        Padding::Symmetric(pr, pc) => PadDims::new(pr, pr, pc, pc),
        Padding::Same => {
            let out = (
                x_shape.get(1).copied().unwrap_or(0),
                x_shape.get(2).copied().unwrap_or(0),
            );
            let dims = calc_pad_dims_2d(x_shape, out, kernel_shape, stride, 0)?;
            debug!("resolved 'same' padding for input {:?} to {:?}", x_shape, dims);
            dims
        }
    };

    if !dims.is_symmetric() {
        return Err(LayerError::AsymmetricPadding(dims.as_array()));
    }
    Ok(dims)
}

/// Spatial output size `floor(1 + (in + pad - kernel) / stride)` per axis.
pub fn output_dims(
    in_dims: (usize, usize),
    pad: &PadDims,
    kernel_shape: (usize, usize),
    stride: usize,
) -> Result<(usize, usize)> {
    let axis = |in_size: usize, p1: usize, p2: usize, k: usize| -> Result<usize> {
        let padded = in_size + p1 + p2;
        if k == 0 || padded < k {
            return Err(LayerError::InvalidPadding(format!(
                "kernel of size {} does not fit a padded input of size {}",
                k, padded
            )));
        }
        Ok((padded - k) / stride + 1)
    };

    if stride == 0 {
        return Err(LayerError::InvalidConfig("stride must be positive".into()));
    }
    Ok((
        axis(in_dims.0, pad.top, pad.bottom, kernel_shape.0)?,
        axis(in_dims.1, pad.left, pad.right, kernel_shape.1)?,
    ))
}

/// Pad the spatial axes of an `(n, rows, cols, ch)` tensor with `value`.
pub fn pad_4d(x: ArrayView4<f64>, pad: &PadDims, value: f64) -> Array4<f64> {
    let (n, rows, cols, ch) = x.dim();
    let mut out = Array4::from_elem(
        (n, rows + pad.top + pad.bottom, cols + pad.left + pad.right, ch),
        value,
    );
    out.slice_mut(s![.., pad.top..pad.top + rows, pad.left..pad.left + cols, ..])
        .assign(&x);
    out
}

/// Inverse of [`pad_4d`]: drop the padded border.
pub fn unpad_4d(x: &Array4<f64>, pad: &PadDims) -> Array4<f64> {
    let (_, rows, cols, _) = x.dim();
    x.slice(s![.., pad.top..rows - pad.bottom, pad.left..cols - pad.right, ..])
        .to_owned()
}
