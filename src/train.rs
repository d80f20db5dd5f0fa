//! Minimal training loop with step hooks.
//!
//! The loop is: draw a batch, evaluate the loss pass, take one optimizer
//! step, then run every hook in order. [`crate::pruning::MaskEnforcer`] is
//! such a hook, so masks are restored before the next forward pass.

use crate::config::ExperimentConfig;
use crate::nn::optim::{Optimizer, PiecewiseConstantDecay, SGD};
use crate::nn::{Batch, BatchSource, Network, Pass};
use crate::pruning::{PruningError, Result};
use crate::tensor::Tensor;
use serde::{Deserialize, Serialize};

/// Callback run after every optimizer step.
pub trait StepHook {
    /// Called with the zero-based step index after the weights were updated.
    fn after_step(&mut self, step: usize, net: &mut dyn Network) -> Result<()>;

    /// Called once when training ends.
    fn on_finish(&mut self, _net: &mut dyn Network) -> Result<()> {
        Ok(())
    }
}

/// Outcome of [`Trainer::fit`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainSummary {
    /// Steps actually taken.
    pub steps: usize,
    /// Training loss of the last step.
    pub final_loss: f32,
}

/// Drives an optimizer with a learning-rate schedule.
#[derive(Debug, Clone)]
pub struct Trainer<O: Optimizer> {
    optimizer: O,
    schedule: PiecewiseConstantDecay,
}

impl Trainer<SGD> {
    /// SGD with momentum, weight decay and tenfold decays from `config`.
    #[must_use]
    pub fn from_experiment(config: &ExperimentConfig) -> Self {
        let optimizer = SGD::with_momentum(config.lr, config.momentum).weight_decay(config.weight_decay);
        let schedule = PiecewiseConstantDecay::tenfold(config.lr, config.lr_decay.clone());
        Self::new(optimizer, schedule)
    }
}

impl<O: Optimizer> Trainer<O> {
    #[must_use]
    pub fn new(optimizer: O, schedule: PiecewiseConstantDecay) -> Self {
        Self { optimizer, schedule }
    }

    #[must_use]
    pub fn optimizer(&self) -> &O {
        &self.optimizer
    }

    /// Train for up to `steps` steps, stopping early when `data` runs dry.
    ///
    /// # Errors
    /// - `DataUnavailable` if `data` yields no batch at all
    /// - any error from the loss pass or from a hook
    pub fn fit(
        &mut self,
        net: &mut dyn Network,
        data: &mut dyn BatchSource,
        steps: usize,
        hooks: &mut [&mut dyn StepHook],
    ) -> Result<TrainSummary> {
        let mut summary = TrainSummary {
            steps: 0,
            final_loss: 0.0,
        };
        for step in 0..steps {
            let Some(batch) = data.next_batch() else {
                if step == 0 {
                    return Err(PruningError::DataUnavailable {
                        rule: "training".to_string(),
                    });
                }
                break;
            };
            self.optimizer.set_lr(self.schedule.lr_at(step));
            let out = net.forward_backward(Pass::Loss(&batch))?;
            self.optimizer.step(net, &out.gradients);
            for hook in hooks.iter_mut() {
                hook.after_step(step, net)?;
            }
            summary.steps = step + 1;
            summary.final_loss = out.loss;
            if step % 100 == 0 {
                tracing::debug!(step, loss = out.loss, lr = self.optimizer.lr(), "training step");
            }
        }
        for hook in hooks.iter_mut() {
            hook.on_finish(net)?;
        }
        tracing::info!(steps = summary.steps, loss = summary.final_loss, "training finished");
        Ok(summary)
    }
}

/// Records held-out accuracy and loss at a fixed interval and the final
/// weights at the end of training.
#[derive(Debug, Clone)]
pub struct LogHook {
    eval: Batch,
    every: usize,
    accuracies: Vec<f32>,
    losses: Vec<f32>,
    final_weights: Vec<Tensor>,
}

impl LogHook {
    /// Evaluate on `eval` at steps `0, every, 2 * every, ...`.
    #[must_use]
    pub fn new(eval: Batch, every: usize) -> Self {
        Self {
            eval,
            every: every.max(1),
            accuracies: Vec::new(),
            losses: Vec::new(),
            final_weights: Vec::new(),
        }
    }

    #[must_use]
    pub fn accuracies(&self) -> &[f32] {
        &self.accuracies
    }

    #[must_use]
    pub fn losses(&self) -> &[f32] {
        &self.losses
    }

    /// Prunable weights at the end of training (empty before).
    #[must_use]
    pub fn final_weights(&self) -> &[Tensor] {
        &self.final_weights
    }
}

impl StepHook for LogHook {
    fn after_step(&mut self, step: usize, net: &mut dyn Network) -> Result<()> {
        if step % self.every != 0 {
            return Ok(());
        }
        let out = net.forward_backward(Pass::Loss(&self.eval))?;
        let accuracy = out.correct as f32 / self.eval.len().max(1) as f32;
        self.accuracies.push(accuracy);
        self.losses.push(out.loss);
        tracing::info!(step, accuracy, loss = out.loss, "evaluation");
        Ok(())
    }

    fn on_finish(&mut self, net: &mut dyn Network) -> Result<()> {
        self.final_weights = net.snapshot();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nn::{BatchCycle, Dense, Layer, Sequential};

    fn net() -> Sequential {
        Sequential::new(
            "linear",
            &[4],
            vec![Layer::Dense(Dense::new(Tensor::full(&[4, 3], 0.1)))],
        )
        .unwrap()
    }

    #[test]
    fn test_fit_reduces_loss_on_fixed_batch() {
        let mut net = net();
        let batch = Batch::synthetic(&[4], 3, 16, 5);
        let initial = net.forward_backward(Pass::Loss(&batch)).unwrap().loss;
        let mut trainer = Trainer::new(SGD::new(0.5), PiecewiseConstantDecay::tenfold(0.5, vec![]));
        let mut data = BatchCycle::new(vec![batch.clone()]);
        let summary = trainer.fit(&mut net, &mut data, 50, &mut []).unwrap();
        assert_eq!(summary.steps, 50);
        assert!(summary.final_loss < initial);
    }

    #[test]
    fn test_fit_without_data_fails() {
        let mut net = net();
        let mut trainer = Trainer::new(SGD::new(0.1), PiecewiseConstantDecay::tenfold(0.1, vec![]));
        let mut data = BatchCycle::new(Vec::new());
        let err = trainer.fit(&mut net, &mut data, 3, &mut []).unwrap_err();
        assert!(matches!(err, PruningError::DataUnavailable { .. }));
    }

    #[test]
    fn test_log_hook_interval_and_final_weights() {
        let mut net = net();
        let batch = Batch::synthetic(&[4], 3, 8, 2);
        let mut log = LogHook::new(batch.clone(), 2);
        let mut trainer = Trainer::from_experiment(&ExperimentConfig {
            data: "synthetic".to_string(),
            lr: 0.1,
            batch_size_train: 8,
            iterations: 5,
            weight_decay: 0.0,
            momentum: 0.9,
            lr_decay: vec![3],
            batch_size_snip: 8,
            log_every: 2,
        });
        let mut data = BatchCycle::new(vec![batch]);
        trainer.fit(&mut net, &mut data, 5, &mut [&mut log]).unwrap();
        // Steps 0, 2 and 4.
        assert_eq!(log.accuracies().len(), 3);
        assert_eq!(log.losses().len(), 3);
        assert_eq!(log.final_weights(), net.snapshot().as_slice());
        assert!((trainer.optimizer().lr() - 0.01).abs() < 1e-7);
    }
}
