//! Keeps pruned weights at exactly zero during training.

use super::error::{PruningError, Result};
use super::mask::Mask;
use crate::nn::Network;
use crate::train::StepHook;

/// Reapplies a fixed mask set after every optimizer step.
///
/// Momentum and weight decay move pruned weights off zero even when their
/// gradient is excluded, so the masks are written back after each update.
/// Kept weights are never touched.
#[derive(Debug, Clone)]
pub struct MaskEnforcer {
    masks: Vec<Mask>,
}

impl MaskEnforcer {
    #[must_use]
    pub fn new(masks: Vec<Mask>) -> Self {
        Self { masks }
    }

    #[must_use]
    pub fn masks(&self) -> &[Mask] {
        &self.masks
    }

    /// Zero every masked weight of `net`.
    ///
    /// Shapes are validated for all tensors before anything is written.
    ///
    /// # Errors
    /// `ShapeMismatch` if the mask count or any mask shape differs from the
    /// network's prunable tensors.
    pub fn enforce<N: Network + ?Sized>(&self, net: &mut N) -> Result<()> {
        let tensors = net.prunable();
        if tensors.len() != self.masks.len() {
            return Err(PruningError::ShapeMismatch {
                expected: vec![self.masks.len()],
                got: vec![tensors.len()],
            });
        }
        for (t, m) in tensors.iter().zip(&self.masks) {
            m.check_shape(&t.shape)?;
        }
        for (id, m) in self.masks.iter().enumerate() {
            m.apply(net.weight_mut(id))?;
        }
        Ok(())
    }

    /// `true` if every masked weight of `net` is exactly zero.
    #[must_use]
    pub fn holds<N: Network + ?Sized>(&self, net: &N) -> bool {
        self.masks.iter().enumerate().all(|(id, m)| {
            let w = net.weight(id);
            w.shape() == m.shape()
                && w.data()
                    .iter()
                    .zip(m.tensor().data())
                    .all(|(&v, &k)| k == 1.0 || v == 0.0)
        })
    }
}

impl StepHook for MaskEnforcer {
    fn after_step(&mut self, _step: usize, net: &mut dyn Network) -> Result<()> {
        self.enforce(net)
    }
}
