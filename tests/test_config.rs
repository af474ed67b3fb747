// Tests for configuration files and checkpoints: JSON parsing, validation,
// summary round trips through disk and layer restoration.

use approx::assert_abs_diff_eq;
use ndarray::IxDyn;
use std::fs;
use tempfile::tempdir;

use rust_neural_layers::config::{
    build_layer, load_layer_config, load_summary, restore_layer, save_summary,
    BatchNormConfig, BidirectionalLstmConfig, ConfigError, FullyConnectedConfig, LayerConfig,
    PoolMode, RnnCellConfig, WrapperConfig,
};
use rust_neural_layers::layers::{FullyConnected, Layer};
use rust_neural_layers::utils::activations::Activation;
use rust_neural_layers::utils::init::WeightInit;
use rust_neural_layers::utils::padding::Padding;
use rust_neural_layers::{LayerError, SimpleRng, Tensor};

fn ramp(shape: &[usize]) -> Tensor {
    let n: usize = shape.iter().product();
    Tensor::from_shape_vec(
        IxDyn(shape),
        (0..n).map(|i| (i as f64 * 0.37).sin()).collect(),
    )
    .unwrap()
}

// ============================================================================
// Layer configuration files
// ============================================================================

#[test]
fn test_load_layer_config_from_file() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("pool.json");
    fs::write(
        &path,
        r#"{"layer": "Pool2D", "kernel_shape": [2, 2], "stride": 2, "mode": "average"}"#,
    )
    .unwrap();

    match load_layer_config(&path).unwrap() {
        LayerConfig::Pool2D(c) => {
            assert_eq!(c.kernel_shape, (2, 2));
            assert_eq!(c.stride, 2);
            assert_eq!(c.pad, Padding::Uniform(0));
            assert_eq!(c.mode, PoolMode::Average);
        }
        other => panic!("unexpected config {:?}", other),
    }
}

#[test]
fn test_activation_with_parameters_parses() {
    let json = r#"{
        "layer": "FullyConnected",
        "n_in": 4,
        "n_out": 2,
        "act_fn": {"leaky_relu": {"alpha": 0.3}},
        "init": "he_normal"
    }"#;
    let config: LayerConfig = serde_json::from_str(json).unwrap();
    match config {
        LayerConfig::FullyConnected(c) => {
            assert_eq!(c.act_fn, Activation::LeakyRelu { alpha: 0.3 });
            assert_eq!(c.init, WeightInit::HeNormal);
        }
        other => panic!("unexpected config {:?}", other),
    }
}

#[test]
fn test_load_layer_config_errors() {
    let dir = tempdir().unwrap();

    let missing = dir.path().join("missing.json");
    assert!(matches!(load_layer_config(&missing), Err(ConfigError::Io(_))));

    let garbled = dir.path().join("garbled.json");
    fs::write(&garbled, "{ not json").unwrap();
    assert!(matches!(load_layer_config(&garbled), Err(ConfigError::Json(_))));

    let invalid = dir.path().join("invalid.json");
    fs::write(&invalid, r#"{"layer": "FullyConnected", "n_in": 0, "n_out": 2}"#).unwrap();
    assert!(matches!(
        load_layer_config(&invalid),
        Err(ConfigError::Layer(LayerError::InvalidConfig(_)))
    ));
}

// ============================================================================
// Checkpoints
// ============================================================================

#[test]
fn test_summary_round_trip_through_disk() {
    let mut rng = SimpleRng::new(71);
    let config = LayerConfig::FullyConnected(FullyConnectedConfig {
        n_in: 3,
        n_out: 2,
        act_fn: Activation::Sigmoid,
        init: WeightInit::GlorotNormal,
    });
    let layer = build_layer(&config, &[WrapperConfig::Dropout { p: 0.2 }], &mut rng).unwrap();
    let summary = layer.summary();

    let dir = tempdir().unwrap();
    let path = dir.path().join("dense.json");
    save_summary(&path, &summary).unwrap();
    let loaded = load_summary(&path).unwrap();
    assert_eq!(loaded, summary);

    let mut restored = restore_layer(&loaded, &mut SimpleRng::new(1000)).unwrap();
    assert_eq!(restored.parameters(), layer.parameters());
    assert_eq!(restored.summary().layer_wrappers, vec!["Dropout".to_string()]);

    // frozen layers skip dropout, so both produce identical outputs
    let mut original = layer;
    original.freeze();
    restored.freeze();
    let x = ramp(&[4, 3]);
    let a = original.forward(&x).unwrap();
    let b = restored.forward(&x).unwrap();
    for (u, v) in a.iter().zip(b.iter()) {
        assert_abs_diff_eq!(*u, *v, epsilon = 1e-12);
    }
}

#[test]
fn test_restore_each_tensor_layer_kind() {
    let configs = vec![
        (
            LayerConfig::BatchNorm2D(BatchNormConfig {
                n_in: 2,
                momentum: 0.8,
                epsilon: 1e-3,
            }),
            vec![3, 2, 2, 2],
        ),
        (
            LayerConfig::RnnCell(RnnCellConfig {
                n_in: 3,
                n_out: 2,
                act_fn: Activation::Tanh,
                init: WeightInit::HeUniform,
            }),
            vec![2, 3],
        ),
        (
            LayerConfig::BidirectionalLstm(BidirectionalLstmConfig {
                n_in: 2,
                n_out: 2,
                act_fn: Activation::Tanh,
                gate_fn: Activation::Sigmoid,
                init: WeightInit::GlorotUniform,
            }),
            vec![2, 2, 3],
        ),
    ];

    for (config, shape) in configs {
        let mut rng = SimpleRng::new(72);
        let mut layer = build_layer(&config, &[], &mut rng).unwrap();
        let x = ramp(&shape);
        let y = layer.forward(&x).unwrap();

        let json = serde_json::to_string(&layer.summary()).unwrap();
        let summary = serde_json::from_str(&json).unwrap();
        let mut restored = restore_layer(&summary, &mut SimpleRng::new(73)).unwrap();
        assert_eq!(restored.hyperparameters(), layer.hyperparameters());

        let y_restored = restored.forward(&x).unwrap();
        for (u, v) in y.iter().zip(y_restored.iter()) {
            assert_abs_diff_eq!(*u, *v, epsilon = 1e-12);
        }
    }
}

#[test]
fn test_set_params_rejects_other_layer_kind() {
    let mut rng = SimpleRng::new(74);
    let bn = build_layer(
        &LayerConfig::BatchNorm1D(BatchNormConfig {
            n_in: 2,
            momentum: 0.9,
            epsilon: 1e-5,
        }),
        &[],
        &mut rng,
    )
    .unwrap();

    let mut dense = FullyConnected::new(
        FullyConnectedConfig {
            n_in: 2,
            n_out: 2,
            act_fn: Activation::Identity,
            init: WeightInit::GlorotUniform,
        },
        &mut rng,
    )
    .unwrap();
    assert!(matches!(
        dense.set_params(&bn.summary()),
        Err(LayerError::LayerMismatch { .. })
    ));
}

#[test]
fn test_set_params_rejects_resized_layer() {
    let mut rng = SimpleRng::new(75);
    let make = |n_out: usize, rng: &mut SimpleRng| {
        FullyConnected::new(
            FullyConnectedConfig {
                n_in: 3,
                n_out,
                act_fn: Activation::Identity,
                init: WeightInit::GlorotUniform,
            },
            rng,
        )
        .unwrap()
    };
    let small = make(2, &mut rng);
    let mut large = make(4, &mut rng);
    assert!(large.set_params(&small.summary()).is_err());
}

#[test]
fn test_missing_parameter_is_reported() {
    let mut rng = SimpleRng::new(76);
    let config = FullyConnectedConfig {
        n_in: 2,
        n_out: 2,
        act_fn: Activation::Identity,
        init: WeightInit::GlorotUniform,
    };
    let source = FullyConnected::new(config.clone(), &mut rng).unwrap();
    let mut summary = source.summary();
    summary.parameters.tensors.remove("b");

    let mut target = FullyConnected::new(config, &mut rng).unwrap();
    assert!(matches!(
        target.set_params(&summary),
        Err(LayerError::MissingParameter(_))
    ));
}
