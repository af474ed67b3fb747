//! Weight initialisation schemes.

use ndarray::{Array, Dimension};
use serde::{Deserialize, Serialize};

use crate::utils::rng::SimpleRng;

/// Initialisation scheme for weight tensors. Biases always start at zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum WeightInit {
    #[default]
    GlorotUniform,
    GlorotNormal,
    HeUniform,
    HeNormal,
    StdNormal,
}

/// Fan-in and fan-out of a dense `(n_in, n_out)` or convolutional
/// `(kh, kw, in_ch, out_ch)` weight shape.
pub fn calc_fan(shape: &[usize]) -> (usize, usize) {
    match shape {
        [fan_in, fan_out] => (*fan_in, *fan_out),
        [kh, kw, in_ch, out_ch] => (in_ch * kh * kw, out_ch * kh * kw),
        _ => {
            let n: usize = shape.iter().product();
            (n, n)
        }
    }
}

impl WeightInit {
    /// Draw a weight array of shape `dim`.
    pub fn sample<D: Dimension>(&self, dim: D, rng: &mut SimpleRng) -> Array<f64, D> {
        let (fan_in, fan_out) = calc_fan(dim.slice());
        let (fan_in, fan_out) = (fan_in.max(1) as f64, fan_out.max(1) as f64);

        match self {
            WeightInit::GlorotUniform => {
                let limit = (6.0 / (fan_in + fan_out)).sqrt();
                Array::from_shape_simple_fn(dim, || rng.gen_range_f64(-limit, limit))
            }
            WeightInit::HeUniform => {
                let limit = (6.0 / fan_in).sqrt();
                Array::from_shape_simple_fn(dim, || rng.gen_range_f64(-limit, limit))
            }
            WeightInit::GlorotNormal => {
                let std = (2.0 / (fan_in + fan_out)).sqrt();
                Array::from_shape_simple_fn(dim, || std * rng.next_gaussian())
            }
            WeightInit::HeNormal => {
                let std = (2.0 / fan_in).sqrt();
                Array::from_shape_simple_fn(dim, || std * rng.next_gaussian())
            }
            WeightInit::StdNormal => {
                Array::from_shape_simple_fn(dim, || rng.next_gaussian())
            }
        }
    }
}
