// Tests for the composite modules: residual skip connections, the Add layer
// and the bidirectional LSTM.

mod common;

use approx::assert_abs_diff_eq;
use ndarray::IxDyn;
use rust_neural_layers::config::{
    AddConfig, BidirectionalLstmConfig, SkipConnectionConvConfig, SkipConnectionIdentityConfig,
};
use rust_neural_layers::layers::{Add, Layer};
use rust_neural_layers::modules::{
    BidirectionalLstm, SkipConnectionConvModule, SkipConnectionIdentityModule,
};
use rust_neural_layers::utils::activations::Activation;
use rust_neural_layers::utils::init::WeightInit;
use rust_neural_layers::utils::padding::{PadDims, Padding};
use rust_neural_layers::{LayerError, SimpleRng, Tensor};

use common::*;

fn identity_module(seed: u64) -> SkipConnectionIdentityModule {
    SkipConnectionIdentityModule::new(
        SkipConnectionIdentityConfig {
            in_channels: 2,
            out_channels: 2,
            kernel_shape1: (3, 3),
            kernel_shape2: (3, 3),
            stride1: 1,
            stride2: 1,
            act_fn: Activation::Tanh,
            momentum: 0.9,
            epsilon: 1e-5,
            init: WeightInit::GlorotUniform,
        },
        &mut SimpleRng::new(seed),
    )
    .unwrap()
}

fn conv_module(seed: u64) -> SkipConnectionConvModule {
    SkipConnectionConvModule::new(
        SkipConnectionConvConfig {
            in_channels: 2,
            out_channels1: 3,
            out_channels2: 2,
            kernel_shape1: (3, 3),
            kernel_shape2: (3, 3),
            kernel_shape_skip: (3, 3),
            stride1: 1,
            stride2: 1,
            stride_skip: 2,
            pad1: Padding::Uniform(0),
            pad2: Padding::Uniform(0),
            pad_skip: None,
            act_fn: Activation::Tanh,
            momentum: 0.9,
            epsilon: 1e-5,
            init: WeightInit::GlorotUniform,
        },
        &mut SimpleRng::new(seed),
    )
    .unwrap()
}

fn bilstm(seed: u64) -> BidirectionalLstm {
    BidirectionalLstm::new(
        BidirectionalLstmConfig {
            n_in: 2,
            n_out: 3,
            act_fn: Activation::Tanh,
            gate_fn: Activation::Sigmoid,
            init: WeightInit::GlorotUniform,
        },
        &mut SimpleRng::new(seed),
    )
    .unwrap()
}

// ============================================================================
// Add
// ============================================================================

#[test]
fn test_add_gradients_match_finite_differences() {
    let mut rng = SimpleRng::new(51);
    let mut add = Add::new(AddConfig {
        act_fn: Activation::Sigmoid,
    })
    .unwrap();
    let inputs = vec![
        random_tensor(&[3, 4], &mut rng),
        random_tensor(&[3, 4], &mut rng),
        random_tensor(&[3, 4], &mut rng),
    ];
    let w_out = random_tensor(&[3, 4], &mut rng);
    add.forward(&inputs).unwrap();
    let grads = add.backward(&w_out).unwrap();
    assert_eq!(grads.len(), 3);

    for (i, grad) in grads.iter().enumerate() {
        let numeric = numeric_input_grad(&inputs[i], |probe| {
            let mut probed = inputs.clone();
            probed[i] = probe.clone();
            weighted_sum(&add.clone().forward(&probed).unwrap(), &w_out)
        });
        assert_tensors_close(grad, &numeric, &format!("dLdX{}", i));
    }
}

// ============================================================================
// Skip connections
// ============================================================================

#[test]
fn test_identity_module_gradients() {
    let mut rng = SimpleRng::new(52);
    let mut module = identity_module(1);
    let x = random_tensor(&[2, 4, 4, 2], &mut rng);
    let y = module.forward(&x).unwrap();
    assert_eq!(y.shape(), x.shape());
    let w_out = random_tensor(y.shape(), &mut rng);
    let dx = module.backward(&w_out).unwrap();

    let numeric_dx = numeric_input_grad(&x, |probe| {
        weighted_sum(&module.clone().forward(probe).unwrap(), &w_out)
    });
    assert_tensors_close(&dx, &numeric_dx, "dLdX");

    let loss = |m: &mut SkipConnectionIdentityModule| {
        weighted_sum(&m.clone().forward(&x).unwrap(), &w_out)
    };
    check_param(&mut module, &["conv1", "W"], loss);
    check_param(&mut module, &["batchnorm1", "scaler"], loss);
    check_param(&mut module, &["conv2", "b"], loss);
    check_param(&mut module, &["batchnorm2", "intercept"], loss);
}

#[test]
fn test_identity_module_trains_on_a_single_image() {
    let mut rng = SimpleRng::new(61);
    let mut module = identity_module(10);
    let x = random_tensor(&[1, 4, 4, 2], &mut rng);
    let y = module.forward(&x).unwrap();
    assert_eq!(y.shape(), x.shape());
    let w_out = random_tensor(y.shape(), &mut rng);
    let dx = module.backward(&w_out).unwrap();

    let numeric_dx = numeric_input_grad(&x, |probe| {
        weighted_sum(&module.clone().forward(probe).unwrap(), &w_out)
    });
    assert_tensors_close(&dx, &numeric_dx, "dLdX");

    let loss = |m: &mut SkipConnectionIdentityModule| {
        weighted_sum(&m.clone().forward(&x).unwrap(), &w_out)
    };
    check_param(&mut module, &["batchnorm2", "scaler"], loss);
}

#[test]
fn test_identity_module_records_intermediates() {
    let mut module = identity_module(2);
    let x = random_tensor(&[2, 3, 3, 2], &mut SimpleRng::new(53));
    let y = module.forward(&x).unwrap();
    module.backward(&Tensor::ones(y.raw_dim())).unwrap();

    let vars = module.derived_variables();
    for key in [
        "conv1_out",
        "batchnorm1_out",
        "conv2_out",
        "batchnorm2_out",
        "dLdBn2",
        "dLdConv2",
        "dLdBn1",
        "dLdConv1",
        "dLdX",
    ] {
        assert!(vars.contains_key(key), "missing {}", key);
    }
    assert_eq!(vars["conv1_out"].shape(), &[2, 3, 3, 2]);
}

#[test]
fn test_conv_module_gradients() {
    let mut rng = SimpleRng::new(54);
    let mut module = conv_module(3);
    let x = random_tensor(&[2, 6, 6, 2], &mut rng);
    let y = module.forward(&x).unwrap();
    assert_eq!(y.shape(), &[2, 2, 2, 2]);
    assert_eq!(module.config().pad_skip, Some(PadDims::new(0, 0, 0, 0)));

    let w_out = random_tensor(y.shape(), &mut rng);
    let dx = module.backward(&w_out).unwrap();

    let numeric_dx = numeric_input_grad(&x, |probe| {
        weighted_sum(&module.clone().forward(probe).unwrap(), &w_out)
    });
    assert_tensors_close(&dx, &numeric_dx, "dLdX");

    let loss = |m: &mut SkipConnectionConvModule| {
        weighted_sum(&m.clone().forward(&x).unwrap(), &w_out)
    };
    check_param(&mut module, &["conv1", "b"], loss);
    check_param(&mut module, &["batchnorm2", "scaler"], loss);
    check_param(&mut module, &["conv_skip", "W"], loss);
    check_param(&mut module, &["batchnorm_skip", "intercept"], loss);
}

#[test]
fn test_conv_module_restores_from_summary() {
    let mut original = conv_module(4);
    let x = random_tensor(&[2, 6, 6, 2], &mut SimpleRng::new(55));
    let y = original.forward(&x).unwrap();
    let summary = original.summary();
    assert!(summary.parameters.component("conv_skip").is_ok());

    let mut restored = conv_module(99);
    restored.set_params(&summary).unwrap();
    assert_eq!(restored.config().pad_skip, Some(PadDims::new(0, 0, 0, 0)));
    assert_eq!(restored.parameters(), original.parameters());

    let y_restored = restored.forward(&x).unwrap();
    for (a, b) in y.iter().zip(y_restored.iter()) {
        assert_abs_diff_eq!(*a, *b, epsilon = 1e-12);
    }
}

#[test]
fn test_module_update_changes_every_component() {
    let mut module = conv_module(5);
    let x = random_tensor(&[2, 6, 6, 2], &mut SimpleRng::new(56));
    let before = module.parameters();
    let y = module.forward(&x).unwrap();
    module
        .backward(&random_tensor(y.shape(), &mut SimpleRng::new(57)))
        .unwrap();
    module.update(0.1).unwrap();

    let after = module.parameters();
    for name in ["conv1", "conv2", "conv_skip"] {
        assert_ne!(
            before.component(name).unwrap().tensor("W").unwrap(),
            after.component(name).unwrap().tensor("W").unwrap(),
            "{} did not move",
            name
        );
    }
    assert!(module.gradients().all_values().iter().all(|&g| g == 0.0));
}

fn flush_twice<L>(layer: &mut L, x: &Tensor, seed: u64)
where
    L: Layer<Input = Tensor, Output = Tensor>,
{
    let y = layer.forward(x).unwrap();
    layer
        .backward(&random_tensor(y.shape(), &mut SimpleRng::new(seed)))
        .unwrap();
    assert!(layer.gradients().all_values().iter().any(|&g| g != 0.0));

    layer.flush_gradients().unwrap();
    layer.flush_gradients().unwrap();
    let grads = layer.gradients();
    assert!(grads.all_values().iter().all(|&g| g == 0.0));
    assert!(grads.element_count() > 0);
}

#[test]
fn test_flushing_twice_zeroes_every_module() {
    let mut rng = SimpleRng::new(62);

    let mut identity = identity_module(11);
    flush_twice(&mut identity, &random_tensor(&[2, 4, 4, 2], &mut rng), 63);
    let grads = identity.gradients();
    for name in ["conv1", "batchnorm1", "conv2", "batchnorm2"] {
        let sub = grads.component(name).unwrap();
        assert!(sub.all_values().iter().all(|&g| g == 0.0), "{}", name);
    }

    let mut conv = conv_module(12);
    flush_twice(&mut conv, &random_tensor(&[2, 6, 6, 2], &mut rng), 64);
    assert!(conv.gradients().component("conv_skip").is_ok());

    let mut layer = bilstm(13);
    flush_twice(&mut layer, &random_tensor(&[2, 2, 4], &mut rng), 65);
    assert!(layer.gradients().component("backward").is_ok());
}

#[test]
fn test_frozen_module_rejects_backward() {
    let mut module = identity_module(6);
    module.freeze();
    let x = random_tensor(&[1, 3, 3, 2], &mut SimpleRng::new(58));
    let y = module.forward(&x).unwrap();
    assert!(matches!(
        module.backward(&Tensor::ones(y.raw_dim())),
        Err(LayerError::Frozen(_))
    ));
}

// ============================================================================
// BidirectionalLSTM
// ============================================================================

#[test]
fn test_bilstm_gradients_match_finite_differences() {
    let mut rng = SimpleRng::new(59);
    let mut layer = bilstm(7);
    let x = random_tensor(&[2, 2, 4], &mut rng);
    let y = layer.forward(&x).unwrap();
    assert_eq!(y.shape(), &[2, 6, 4]);
    let w_out = random_tensor(y.shape(), &mut rng);
    let dx = layer.backward(&w_out).unwrap();

    let numeric_dx = numeric_input_grad(&x, |probe| {
        weighted_sum(&layer.clone().forward(probe).unwrap(), &w_out)
    });
    assert_tensors_close(&dx, &numeric_dx, "dLdX");

    let loss = |l: &mut BidirectionalLstm| weighted_sum(&l.clone().forward(&x).unwrap(), &w_out);
    check_param(&mut layer, &["forward", "Wu"], loss);
    check_param(&mut layer, &["forward", "bf"], loss);
    check_param(&mut layer, &["backward", "Wc"], loss);
    check_param(&mut layer, &["backward", "bo"], loss);
}

#[test]
fn test_bilstm_runs_fresh_sequence_per_forward() {
    let mut layer = bilstm(8);
    let x = random_tensor(&[1, 2, 3], &mut SimpleRng::new(60));
    let first = layer.forward(&x).unwrap();
    let second = layer.forward(&x).unwrap();
    assert_eq!(first, second);

    let vars = layer.derived_variables();
    assert_eq!(vars["A_forward"].shape(), &[1, 3, 3]);
    assert_eq!(vars["A_backward"].shape(), &[1, 3, 3]);
}

#[test]
fn test_bilstm_checks_gradient_shape() {
    let mut layer = bilstm(9);
    assert!(matches!(
        layer.backward(&Tensor::ones(IxDyn(&[1, 6, 3]))),
        Err(LayerError::NoForwardCache(_))
    ));
    layer.forward(&Tensor::ones(IxDyn(&[1, 2, 3]))).unwrap();
    assert!(matches!(
        layer.backward(&Tensor::ones(IxDyn(&[1, 3, 3]))),
        Err(LayerError::ShapeMismatch { .. })
    ));
}
