// Tests for Conv2D and Pool2D: output shapes, padding resolution and
// finite-difference gradients on channel-last inputs.

mod common;

use approx::assert_abs_diff_eq;
use ndarray::{Array4, IxDyn};
use rust_neural_layers::config::{Conv2DConfig, Pool2DConfig, PoolMode};
use rust_neural_layers::layers::{Conv2D, Layer, Pool2D};
use rust_neural_layers::utils::activations::Activation;
use rust_neural_layers::utils::init::WeightInit;
use rust_neural_layers::utils::padding::{PadDims, Padding};
use rust_neural_layers::{LayerError, SimpleRng, Tensor};

use common::*;

fn conv(in_ch: usize, out_ch: usize, kernel: usize, stride: usize, pad: Padding) -> Conv2D {
    let mut rng = SimpleRng::new(17);
    Conv2D::new(
        Conv2DConfig {
            in_channels: in_ch,
            out_channels: out_ch,
            kernel_shape: (kernel, kernel),
            stride,
            pad,
            act_fn: Activation::Tanh,
            init: WeightInit::GlorotUniform,
        },
        &mut rng,
    )
    .unwrap()
}

fn pool(kernel: usize, stride: usize, pad: Padding, mode: PoolMode) -> Pool2D {
    Pool2D::new(Pool2DConfig {
        kernel_shape: (kernel, kernel),
        stride,
        pad,
        mode,
    })
    .unwrap()
}

// ============================================================================
// Conv2D
// ============================================================================

#[test]
fn test_conv_output_shapes() {
    let mut rng = SimpleRng::new(3);
    let x = random_tensor(&[2, 5, 5, 2], &mut rng);

    let mut same = conv(2, 3, 3, 1, Padding::Same);
    assert_eq!(same.forward(&x).unwrap().shape(), &[2, 5, 5, 3]);
    assert_eq!(same.last_padding(), Some(PadDims::new(1, 1, 1, 1)));

    let mut strided = conv(2, 4, 3, 2, Padding::Uniform(1));
    assert_eq!(strided.forward(&x).unwrap().shape(), &[2, 3, 3, 4]);
    assert_eq!(strided.output_shape(x.shape()).unwrap(), [2, 3, 3, 4]);

    let mut valid = conv(2, 1, 3, 1, Padding::Uniform(0));
    assert_eq!(valid.forward(&x).unwrap().shape(), &[2, 3, 3, 1]);
}

#[test]
fn test_conv_single_window_value() {
    let mut layer = conv(1, 1, 2, 1, Padding::Uniform(0));
    let x = Array4::from_shape_vec((1, 2, 2, 1), vec![1.0, 2.0, 3.0, 4.0])
        .unwrap()
        .into_dyn();
    let y = layer.forward(&x).unwrap();
    let w = layer.weights().clone();
    let z = w[[0, 0, 0, 0]] + 2.0 * w[[0, 1, 0, 0]] + 3.0 * w[[1, 0, 0, 0]] + 4.0 * w[[1, 1, 0, 0]];
    assert_eq!(y.shape(), &[1, 1, 1, 1]);
    assert_abs_diff_eq!(y[[0, 0, 0, 0]], z.tanh(), epsilon = 1e-12);
}

#[test]
fn test_conv_same_padding_must_be_symmetric() {
    let mut layer = conv(1, 1, 2, 1, Padding::Same);
    let x = Tensor::ones(IxDyn(&[1, 4, 4, 1]));
    assert!(matches!(
        layer.forward(&x),
        Err(LayerError::AsymmetricPadding(_))
    ));
}

#[test]
fn test_conv_rejects_wrong_channels() {
    let mut layer = conv(2, 3, 3, 1, Padding::Same);
    assert!(layer.forward(&Tensor::ones(IxDyn(&[1, 5, 5, 3]))).is_err());
    assert!(matches!(
        layer.forward(&Tensor::ones(IxDyn(&[5, 5, 2]))),
        Err(LayerError::RankMismatch { .. })
    ));
}

#[test]
fn test_conv_gradients_match_finite_differences() {
    let mut rng = SimpleRng::new(8);
    let mut layer = conv(2, 3, 3, 1, Padding::Uniform(1));
    let x = random_tensor(&[2, 5, 5, 2], &mut rng);
    let y = layer.forward(&x).unwrap();
    let w_out = random_tensor(y.shape(), &mut rng);
    let dx = layer.backward(&w_out).unwrap();

    let numeric_dx = numeric_input_grad(&x, |probe| {
        weighted_sum(&layer.clone().forward(probe).unwrap(), &w_out)
    });
    assert_tensors_close(&dx, &numeric_dx, "dLdX");

    let loss = |l: &mut Conv2D| weighted_sum(&l.clone().forward(&x).unwrap(), &w_out);
    check_param(&mut layer, &["W"], loss);
    check_param(&mut layer, &["b"], loss);
}

#[test]
fn test_strided_conv_input_gradient() {
    let mut rng = SimpleRng::new(9);
    let mut layer = conv(1, 2, 3, 2, Padding::Uniform(1));
    let x = random_tensor(&[1, 6, 6, 1], &mut rng);
    let y = layer.forward(&x).unwrap();
    let w_out = random_tensor(y.shape(), &mut rng);
    let dx = layer.backward(&w_out).unwrap();

    let numeric_dx = numeric_input_grad(&x, |probe| {
        weighted_sum(&layer.clone().forward(probe).unwrap(), &w_out)
    });
    assert_tensors_close(&dx, &numeric_dx, "dLdX");
}

// ============================================================================
// Pool2D
// ============================================================================

#[test]
fn test_max_pool_values_and_routing() {
    let mut layer = pool(2, 2, Padding::Uniform(0), PoolMode::Max);
    let x = Array4::from_shape_vec(
        (1, 2, 4, 1),
        vec![1.0, 5.0, 2.0, 0.0, 3.0, 4.0, 8.0, 7.0],
    )
    .unwrap()
    .into_dyn();
    let y = layer.forward(&x).unwrap();
    assert_eq!(y.shape(), &[1, 1, 2, 1]);
    assert_abs_diff_eq!(y[[0, 0, 0, 0]], 5.0);
    assert_abs_diff_eq!(y[[0, 0, 1, 0]], 8.0);

    let dy = Array4::from_shape_vec((1, 1, 2, 1), vec![10.0, 20.0]).unwrap().into_dyn();
    let dx = layer.backward(&dy).unwrap();
    assert_abs_diff_eq!(dx[[0, 0, 1, 0]], 10.0);
    assert_abs_diff_eq!(dx[[0, 1, 2, 0]], 20.0);
    assert_abs_diff_eq!(dx.sum(), 30.0);
}

#[test]
fn test_average_pool_counts_padding() {
    let mut layer = pool(3, 1, Padding::Uniform(1), PoolMode::Average);
    let x = Tensor::ones(IxDyn(&[1, 2, 2, 1]));
    let y = layer.forward(&x).unwrap();
    assert_eq!(y.shape(), &[1, 2, 2, 1]);
    // every window covers all four ones plus five padded zeros
    for v in y.iter() {
        assert_abs_diff_eq!(*v, 4.0 / 9.0, epsilon = 1e-12);
    }
}

#[test]
fn test_average_pool_backward_counts_windows() {
    let mut layer = pool(2, 1, Padding::Uniform(0), PoolMode::Average);
    let x = Tensor::ones(IxDyn(&[1, 3, 3, 1]));
    let y = layer.forward(&x).unwrap();
    let dx = layer.backward(&Tensor::ones(y.raw_dim())).unwrap();
    // each input pixel receives 1/4 from every window covering it
    assert_abs_diff_eq!(dx[[0, 0, 0, 0]], 0.25);
    assert_abs_diff_eq!(dx[[0, 0, 1, 0]], 0.5);
    assert_abs_diff_eq!(dx[[0, 1, 1, 0]], 1.0);
}

#[test]
fn test_pool_gradients_match_finite_differences() {
    let mut rng = SimpleRng::new(10);
    let x = distinct_tensor(&[2, 5, 5, 2]);
    for mode in [PoolMode::Max, PoolMode::Average] {
        let mut layer = pool(3, 2, Padding::Uniform(1), mode);
        let y = layer.forward(&x).unwrap();
        assert_eq!(y.shape(), &[2, 3, 3, 2]);
        let w_out = random_tensor(y.shape(), &mut rng);
        let dx = layer.backward(&w_out).unwrap();

        let numeric_dx = numeric_input_grad(&x, |probe| {
            weighted_sum(&layer.clone().forward(probe).unwrap(), &w_out)
        });
        assert_tensors_close(&dx, &numeric_dx, &format!("{:?} dLdX", mode));
        assert_eq!(layer.parameter_count(), 0);
    }
}

#[test]
fn test_pool_backward_requires_forward() {
    let mut layer = pool(2, 2, Padding::Uniform(0), PoolMode::Max);
    assert!(matches!(
        layer.backward(&Tensor::ones(IxDyn(&[1, 1, 1, 1]))),
        Err(LayerError::NoForwardCache(_))
    ));
}
