// Shared helpers for the finite-difference gradient checks.
//
// Every check uses the loss L = sum(Y * W) for a fixed random weight tensor W,
// so dL/dY = W is what gets passed to `backward`.

#![allow(dead_code)]

use ndarray::IxDyn;
use rust_neural_layers::params::ParamDict;
use rust_neural_layers::{Layer, SimpleRng, Tensor};

pub const EPS: f64 = 1e-5;

pub fn random_tensor(shape: &[usize], rng: &mut SimpleRng) -> Tensor {
    Tensor::from_shape_simple_fn(IxDyn(shape), || rng.gen_range_f64(-1.0, 1.0))
}

// Tensor whose values are pairwise at least 0.01 apart, so that a finite
// difference never flips which element of a pooling window is the largest.
pub fn distinct_tensor(shape: &[usize]) -> Tensor {
    let n: usize = shape.iter().product();
    let stride = if n % 37 == 0 { 41 } else { 37 };
    let data = (0..n)
        .map(|i| ((i * stride) % n) as f64 * 0.01 - 0.5)
        .collect();
    Tensor::from_shape_vec(IxDyn(shape), data).unwrap()
}

pub fn weighted_sum(y: &Tensor, weights: &Tensor) -> f64 {
    (y * weights).sum()
}

fn tensor_mut<'a>(dict: &'a mut ParamDict, path: &[&str]) -> &'a mut Tensor {
    let (name, components) = path.split_last().unwrap();
    let mut node = dict;
    for c in components {
        node = node.components.get_mut(*c).unwrap();
    }
    node.tensors.get_mut(*name).unwrap()
}

fn tensor_at<'a>(dict: &'a ParamDict, path: &[&str]) -> &'a Tensor {
    let (name, components) = path.split_last().unwrap();
    let mut node = dict;
    for c in components {
        node = node.component(c).unwrap();
    }
    node.tensor(name).unwrap()
}

// Analytic gradient of one scalar, read from `layer.gradients()`.
pub fn analytic_grad<L: Layer + ?Sized>(layer: &L, path: &[&str], index: usize) -> f64 {
    let grads = layer.gradients();
    *tensor_at(&grads, path).iter().nth(index).unwrap()
}

pub fn param_len<L: Layer + ?Sized>(layer: &L, path: &[&str]) -> usize {
    tensor_at(&layer.parameters(), path).len()
}

// Shift one scalar of a parameter tensor through the checkpoint interface.
pub fn nudge<L: Layer + ?Sized>(layer: &mut L, path: &[&str], index: usize, delta: f64) {
    let mut summary = layer.summary();
    let t = tensor_mut(&mut summary.parameters, path);
    *t.iter_mut().nth(index).unwrap() += delta;
    layer.set_params(&summary).unwrap();
}

// Central difference of `loss` with respect to one parameter scalar.
pub fn numeric_param_grad<L, F>(layer: &mut L, path: &[&str], index: usize, mut loss: F) -> f64
where
    L: Layer + ?Sized,
    F: FnMut(&mut L) -> f64,
{
    nudge(layer, path, index, EPS);
    let plus = loss(layer);
    nudge(layer, path, index, -2.0 * EPS);
    let minus = loss(layer);
    nudge(layer, path, index, EPS);
    (plus - minus) / (2.0 * EPS)
}

// Central difference of `loss` with respect to every element of `x`.
pub fn numeric_input_grad<F>(x: &Tensor, mut loss: F) -> Tensor
where
    F: FnMut(&Tensor) -> f64,
{
    let base: Vec<f64> = x.iter().copied().collect();
    let grads = (0..base.len())
        .map(|i| {
            let mut probe = base.clone();
            probe[i] = base[i] + EPS;
            let plus = loss(&Tensor::from_shape_vec(x.raw_dim(), probe.clone()).unwrap());
            probe[i] = base[i] - EPS;
            let minus = loss(&Tensor::from_shape_vec(x.raw_dim(), probe).unwrap());
            (plus - minus) / (2.0 * EPS)
        })
        .collect();
    Tensor::from_shape_vec(x.raw_dim(), grads).unwrap()
}

pub fn assert_close(analytic: f64, numeric: f64, what: &str) {
    let tol = 1e-6 * (1.0 + analytic.abs().max(numeric.abs()));
    assert!(
        (analytic - numeric).abs() <= tol,
        "{}: analytic {} vs numeric {}",
        what,
        analytic,
        numeric
    );
}

pub fn assert_tensors_close(analytic: &Tensor, numeric: &Tensor, what: &str) {
    assert_eq!(analytic.shape(), numeric.shape(), "{}: shape", what);
    for (i, (a, n)) in analytic.iter().zip(numeric.iter()).enumerate() {
        assert_close(*a, *n, &format!("{}[{}]", what, i));
    }
}

// Check every scalar of the parameter at `path` against a central difference.
pub fn check_param<L, F>(layer: &mut L, path: &[&str], mut loss: F)
where
    L: Layer + ?Sized,
    F: FnMut(&mut L) -> f64,
{
    for i in 0..param_len(layer, path) {
        let analytic = analytic_grad(layer, path, i);
        let numeric = numeric_param_grad(layer, path, i, &mut loss);
        assert_close(analytic, numeric, &format!("{}[{}]", path.join("."), i));
    }
}
