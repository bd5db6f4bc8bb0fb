use burn::backend::ndarray::NdArray;
use burn::backend::Autodiff;
use burn::module::{AutodiffModule, Module};
use burn::tensor::{Distribution, Int, Tensor};
use models::prelude::*;

type B = NdArray<f32>;

fn input(shape: [usize; 3]) -> Tensor<B, 3> {
    Tensor::random(shape, Distribution::Normal(0.0, 1.0), &Default::default())
}

#[test]
fn baseline_shapes_for_both_dims() {
    let device = Default::default();
    let mut cfg = ClassifierConfig::baseline(9, 4, 5, 1);
    cfg.embedding_dim = 16;
    let model = BaselineClassifier::<B>::init(&cfg, &device);
    assert_eq!(model.forward(input([2, 9, 64])).dims(), [2, 5]);
    assert_eq!(model.embed(input([2, 9, 64])).dims(), [2, 16]);

    let cfg = ClassifierConfig::baseline(1, 4, 3, 2);
    let model = BaselineClassifier::<B>::init(&cfg, &device);
    assert_eq!(model.forward(input([2, 16, 32])).dims(), [2, 3]);
    assert_eq!(model.embed(input([2, 16, 32])).dims(), [2, 256]);
}

#[test]
fn residual_shapes_for_both_dims() {
    let device = Default::default();
    let cfg = ClassifierConfig::residual(9, 4, 6, 1);
    let model = ResidualClassifier::<B>::init(&cfg, &device);
    assert_eq!(model.forward(input([3, 9, 64])).dims(), [3, 6]);
    assert_eq!(model.embed(input([3, 9, 64])).dims(), [3, cfg.embedding_width()]);

    let cfg = ClassifierConfig::residual(1, 2, 4, 2);
    let model = ResidualClassifier::<B>::init(&cfg, &device);
    assert_eq!(model.forward(input([2, 32, 32])).dims(), [2, 4]);
    assert!(model.num_params() > 0);
}

#[test]
fn margin_lowers_only_the_target_logit() {
    let device = Default::default();
    let cfg = ClassifierConfig::baseline(4, 2, 3, 1).with_margin(0.5);
    let model = BaselineClassifier::<B>::init(&cfg, &device);
    let x = input([2, 4, 32]);
    let targets = Tensor::<B, 1, Int>::from_ints([2, 0], &device);
    let plain = model.forward(x.clone()).into_data().to_vec::<f32>().unwrap();
    let margined = model
        .forward_with_targets(x, targets)
        .into_data()
        .to_vec::<f32>()
        .unwrap();
    for (i, (p, m)) in plain.iter().zip(&margined).enumerate() {
        let expected = if i == 2 || i == 3 { p - 0.5 } else { *p };
        assert!((expected - m).abs() < 1e-5, "logit {i}: {m} vs {expected}");
    }
}

#[test]
fn autodiff_models_expose_gradients() {
    type AB = Autodiff<B>;
    let device = Default::default();
    let cfg = ClassifierConfig::residual(4, 2, 3, 1);
    let model = ResidualClassifier::<AB>::init(&cfg, &device);
    let x = Tensor::<AB, 3>::random([2, 4, 64], Distribution::Normal(0.0, 1.0), &device);
    let loss = model.forward(x).mean();
    let grads = loss.backward();
    let valid = model.valid();
    let x = Tensor::<B, 3>::random([2, 4, 64], Distribution::Normal(0.0, 1.0), &device);
    assert_eq!(valid.forward(x).dims(), [2, 3]);
    drop(grads);
}
