//! Gradient-based optimizers and learning-rate schedules.
//!
//! Gradients are passed in explicitly, one per prunable tensor, as returned
//! by [`Network::forward_backward`](crate::nn::Network::forward_backward).
//!
//! # Example
//!
//! ```
//! use effective_sparsity::nn::optim::{Optimizer, PiecewiseConstantDecay, SGD};
//! use effective_sparsity::nn::{Batch, Dense, Layer, Network, Pass, Sequential};
//! use effective_sparsity::tensor::Tensor;
//!
//! let mut net = Sequential::new(
//!     "linear",
//!     &[2],
//!     vec![Layer::Dense(Dense::new(Tensor::ones(&[2, 2])))],
//! )
//! .unwrap();
//! let batch = Batch::synthetic(&[2], 2, 4, 0);
//! let mut sgd = SGD::with_momentum(0.1, 0.9).weight_decay(5e-4);
//! let schedule = PiecewiseConstantDecay::new(vec![100], vec![0.1, 0.01]).unwrap();
//!
//! for step in 0..3 {
//!     sgd.set_lr(schedule.lr_at(step));
//!     let out = net.forward_backward(Pass::Loss(&batch)).unwrap();
//!     sgd.step(&mut net, &out.gradients);
//! }
//! ```
//!
//! # References
//!
//! - Robbins, H., & Monro, S. (1951). A stochastic approximation method.
//! - Sutskever, I., et al. (2013). On the importance of initialization and
//!   momentum in deep learning. ICML.

use crate::nn::Network;
use crate::pruning::{PruningError, Result};
use crate::tensor::Tensor;
use serde::{Deserialize, Serialize};

/// Common trait for optimizers over a [`Network`]'s prunable tensors.
pub trait Optimizer {
    /// Update every prunable tensor from its gradient.
    fn step(&mut self, net: &mut dyn Network, grads: &[Tensor]);

    /// Current learning rate.
    fn lr(&self) -> f32;

    /// Set learning rate (for schedules).
    fn set_lr(&mut self, lr: f32);
}

/// Stochastic Gradient Descent optimizer with momentum.
///
/// Update rule:
/// ```text
/// g   = grad + weight_decay * param
/// v_t = momentum * v_{t-1} + g
/// param = param - lr * v_t
/// ```
///
/// With Nesterov momentum:
/// ```text
/// param = param - lr * (momentum * v_t + g)
/// ```
///
/// Momentum and weight decay move pruned weights away from zero; pair the
/// optimizer with a [`MaskEnforcer`](crate::pruning::MaskEnforcer).
#[derive(Debug, Clone)]
pub struct SGD {
    lr: f32,
    momentum: f32,
    weight_decay: f32,
    nesterov: bool,
    /// Velocity buffers, one per tensor, allocated on first use.
    velocities: Vec<Vec<f32>>,
}

impl SGD {
    /// Plain SGD.
    #[must_use]
    pub fn new(lr: f32) -> Self {
        Self::with_momentum(lr, 0.0)
    }

    /// SGD with momentum.
    #[must_use]
    pub fn with_momentum(lr: f32, momentum: f32) -> Self {
        Self {
            lr,
            momentum,
            weight_decay: 0.0,
            nesterov: false,
            velocities: Vec::new(),
        }
    }

    /// Enable Nesterov momentum.
    #[must_use]
    pub fn nesterov(mut self) -> Self {
        self.nesterov = true;
        self
    }

    /// Set weight decay (L2 regularization).
    #[must_use]
    pub fn weight_decay(mut self, wd: f32) -> Self {
        self.weight_decay = wd;
        self
    }

    /// Update a single parameter tensor.
    ///
    /// # Panics
    /// Panics if `grad` and `param` differ in length.
    pub fn update_param(&mut self, idx: usize, param: &mut Tensor, grad: &Tensor) {
        assert_eq!(
            param.numel(),
            grad.numel(),
            "gradient length does not match tensor {idx}"
        );
        if idx >= self.velocities.len() {
            self.velocities.resize(idx + 1, Vec::new());
        }
        let velocity = &mut self.velocities[idx];
        if velocity.len() != param.numel() {
            *velocity = vec![0.0; param.numel()];
        }

        for ((p, &g), v) in param
            .data_mut()
            .iter_mut()
            .zip(grad.data())
            .zip(velocity.iter_mut())
        {
            let g = g + self.weight_decay * *p;
            if self.momentum != 0.0 {
                *v = self.momentum * *v + g;
                if self.nesterov {
                    *p -= self.lr * (self.momentum * *v + g);
                } else {
                    *p -= self.lr * *v;
                }
            } else {
                *p -= self.lr * g;
            }
        }
    }
}

impl Optimizer for SGD {
    fn step(&mut self, net: &mut dyn Network, grads: &[Tensor]) {
        for (idx, grad) in grads.iter().enumerate() {
            self.update_param(idx, net.weight_mut(idx), grad);
        }
    }

    fn lr(&self) -> f32 {
        self.lr
    }

    fn set_lr(&mut self, lr: f32) {
        self.lr = lr;
    }
}

/// Step-indexed piecewise-constant learning rate.
///
/// `values[i]` applies while `step < boundaries[i]`; `values.last()` applies
/// from `boundaries.last()` on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PiecewiseConstantDecay {
    boundaries: Vec<usize>,
    values: Vec<f32>,
}

impl PiecewiseConstantDecay {
    /// # Errors
    /// `ShapeMismatch` unless `values.len() == boundaries.len() + 1`.
    pub fn new(boundaries: Vec<usize>, values: Vec<f32>) -> Result<Self> {
        if values.len() != boundaries.len() + 1 {
            return Err(PruningError::ShapeMismatch {
                expected: vec![boundaries.len() + 1],
                got: vec![values.len()],
            });
        }
        Ok(Self { boundaries, values })
    }

    /// `base * 0.1^i` for each interval, the decay used by all reference
    /// experiments.
    #[must_use]
    pub fn tenfold(base: f32, boundaries: Vec<usize>) -> Self {
        let values = (0..=boundaries.len())
            .map(|i| base * 0.1f32.powi(i as i32))
            .collect();
        Self { boundaries, values }
    }

    /// Learning rate at `step` (zero-based).
    #[must_use]
    pub fn lr_at(&self, step: usize) -> f32 {
        let interval = self.boundaries.iter().take_while(|&&b| step >= b).count();
        self.values[interval]
    }
}

#[cfg(test)]
mod tests;
