use super::*;
use crate::nn::{Dense, Layer, Sequential};

fn single(values: &[f32]) -> Sequential {
    Sequential::new(
        "single",
        &[1],
        vec![Layer::Dense(Dense::new(Tensor::new(values, &[1, values.len()])))],
    )
    .unwrap()
}

#[test]
fn test_sgd_basic() {
    let mut net = single(&[1.0, 2.0, 3.0]);
    let grad = Tensor::new(&[2.0, 4.0, 6.0], &[1, 3]);

    let mut sgd = SGD::new(0.1);
    sgd.step(&mut net, &[grad]);

    // param = param - lr * grad = [1, 2, 3] - 0.1 * [2, 4, 6]
    let expected = [0.8, 1.6, 2.4];
    for (p, e) in net.weight(0).data().iter().zip(expected.iter()) {
        assert!((p - e).abs() < 1e-5, "Expected {e}, got {p}");
    }
}

#[test]
fn test_sgd_with_momentum() {
    let mut net = single(&[1.0]);
    let mut sgd = SGD::with_momentum(0.1, 0.9);

    // v = 2.0, param = 1.0 - 0.1 * 2.0
    sgd.step(&mut net, &[Tensor::new(&[2.0], &[1, 1])]);
    assert!((net.weight(0).data()[0] - 0.8).abs() < 1e-5);

    // v = 0.9 * 2.0 + 1.6 = 3.4, param = 0.8 - 0.34
    sgd.step(&mut net, &[Tensor::new(&[1.6], &[1, 1])]);
    assert!((net.weight(0).data()[0] - 0.46).abs() < 1e-5);
}

#[test]
fn test_sgd_nesterov() {
    let mut net = single(&[1.0]);
    let mut sgd = SGD::with_momentum(0.1, 0.9).nesterov();
    sgd.step(&mut net, &[Tensor::new(&[1.0], &[1, 1])]);
    // v = 1.0, param = 1.0 - 0.1 * (0.9 * 1.0 + 1.0)
    assert!((net.weight(0).data()[0] - 0.81).abs() < 1e-5);
}

// ==========================================================================
// FALSIFICATION: momentum and weight decay revive zeroed weights
// ==========================================================================
#[test]
fn test_momentum_moves_zero_weight_with_zero_gradient() {
    let mut net = single(&[0.0, 1.0]);
    let mut sgd = SGD::with_momentum(0.1, 0.9);
    sgd.step(&mut net, &[Tensor::new(&[1.0, 0.0], &[1, 2])]);
    // Zero it back by hand, then step with a zero gradient.
    net.weight_mut(0).data_mut()[0] = 0.0;
    sgd.step(&mut net, &[Tensor::new(&[0.0, 0.0], &[1, 2])]);
    assert!(net.weight(0).data()[0] != 0.0);
}

#[test]
fn test_weight_decay_shrinks_weights() {
    let mut net = single(&[2.0]);
    let mut sgd = SGD::new(0.1).weight_decay(0.5);
    sgd.step(&mut net, &[Tensor::new(&[0.0], &[1, 1])]);
    assert!((net.weight(0).data()[0] - 1.9).abs() < 1e-6);
}

#[test]
fn test_set_lr() {
    let mut sgd = SGD::new(0.1);
    sgd.set_lr(0.01);
    assert!((sgd.lr() - 0.01).abs() < 1e-9);
}

#[test]
fn test_piecewise_constant_decay() {
    let schedule = PiecewiseConstantDecay::new(vec![2, 4], vec![1.0, 0.5, 0.25]).unwrap();
    assert_eq!(schedule.lr_at(0), 1.0);
    assert_eq!(schedule.lr_at(1), 1.0);
    assert_eq!(schedule.lr_at(2), 0.5);
    assert_eq!(schedule.lr_at(3), 0.5);
    assert_eq!(schedule.lr_at(4), 0.25);
    assert_eq!(schedule.lr_at(1_000), 0.25);
}

#[test]
fn test_piecewise_rejects_wrong_value_count() {
    assert!(PiecewiseConstantDecay::new(vec![2, 4], vec![1.0, 0.5]).is_err());
}

#[test]
fn test_tenfold_decay_values() {
    let schedule = PiecewiseConstantDecay::tenfold(0.1, vec![10, 20]);
    assert!((schedule.lr_at(0) - 0.1).abs() < 1e-7);
    assert!((schedule.lr_at(10) - 0.01).abs() < 1e-7);
    assert!((schedule.lr_at(25) - 0.001).abs() < 1e-7);
}
