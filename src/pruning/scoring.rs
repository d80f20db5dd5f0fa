//! Per-weight importance scores.
//!
//! Scores are only compared among the weights that are still kept; pruned
//! positions are excluded by the candidate masks when ranking.
//!
//! # References
//! - Lee, N., et al. (2019). SNIP: Single-shot network pruning based on
//!   connection sensitivity. ICLR.
//! - Tanaka, H., et al. (2020). Pruning neural networks without any data by
//!   iteratively conserving synaptic flow. NeurIPS.
//! - Lee, J., et al. (2021). Layer-adaptive sparsity for the magnitude-based
//!   pruning. ICLR.

use super::error::{PruningError, Result};
use super::mask::Mask;
use super::policy::ScoreRule;
use crate::nn::{Batch, Network, Pass};
use crate::tensor::Tensor;
use rand::rngs::StdRng;
use rand::Rng;
use std::ops::{Deref, DerefMut};

/// Scoped access to a network whose prunable weights are restored when the
/// context is dropped.
///
/// Weight substitutions made through the context (masking, absolute values)
/// never outlive it, whether scoring returns normally, fails or panics.
pub struct ScoringContext<'a, N: Network + ?Sized> {
    net: &'a mut N,
    snapshot: Vec<Tensor>,
}

impl<'a, N: Network + ?Sized> ScoringContext<'a, N> {
    /// Snapshot every prunable weight of `net`.
    pub fn new(net: &'a mut N) -> Self {
        let snapshot = net.snapshot();
        Self { net, snapshot }
    }

    /// Weights as they were when the context was opened.
    #[must_use]
    pub fn original(&self) -> &[Tensor] {
        &self.snapshot
    }

    /// Replace every weight by `mask` values.
    pub fn substitute_masks(&mut self, masks: &[Mask]) {
        for (id, mask) in masks.iter().enumerate() {
            *self.net.weight_mut(id) = mask.tensor().clone();
        }
    }

    /// Zero every pruned weight.
    ///
    /// # Errors
    /// `ShapeMismatch` if a mask does not fit its tensor.
    pub fn apply_masks(&mut self, masks: &[Mask]) -> Result<()> {
        for (id, mask) in masks.iter().enumerate() {
            mask.apply(self.net.weight_mut(id))?;
        }
        Ok(())
    }
}

impl<N: Network + ?Sized> Deref for ScoringContext<'_, N> {
    type Target = N;

    fn deref(&self) -> &N {
        self.net
    }
}

impl<N: Network + ?Sized> DerefMut for ScoringContext<'_, N> {
    fn deref_mut(&mut self) -> &mut N {
        self.net
    }
}

impl<N: Network + ?Sized> Drop for ScoringContext<'_, N> {
    fn drop(&mut self) {
        self.net.restore(&self.snapshot);
    }
}

/// Fail with `ShapeMismatch` unless `masks` line up with the network's
/// prunable tensors.
pub(crate) fn check_masks<N: Network + ?Sized>(net: &N, masks: &[Mask]) -> Result<()> {
    let tensors = net.prunable();
    if tensors.len() != masks.len() {
        return Err(PruningError::ShapeMismatch {
            expected: vec![tensors.len()],
            got: vec![masks.len()],
        });
    }
    for (t, m) in tensors.iter().zip(masks) {
        m.check_shape(&t.shape)?;
    }
    Ok(())
}

impl ScoreRule {
    /// Score every weight of `net`, given the current `masks`.
    ///
    /// `rng` feeds [`ScoreRule::Random`]; `batch` feeds [`ScoreRule::Snip`].
    /// The network's weights are unchanged on return.
    ///
    /// # Errors
    /// - `DataUnavailable` for `Snip` without a batch
    /// - `ShapeMismatch` if the masks do not fit the network
    /// - any error of the network's forward/backward pass
    pub fn score<N: Network + ?Sized>(
        self,
        net: &mut N,
        masks: &[Mask],
        batch: Option<&Batch>,
        rng: &mut StdRng,
    ) -> Result<Vec<Tensor>> {
        check_masks(net, masks)?;
        match self {
            ScoreRule::Random => Ok(masks
                .iter()
                .map(|m| {
                    let data = (0..m.numel()).map(|_| rng.gen::<f32>()).collect();
                    Tensor::from_vec(data, m.shape())
                })
                .collect()),
            ScoreRule::Magnitude => {
                let mut ctx = ScoringContext::new(net);
                ctx.apply_masks(masks)?;
                Ok((0..masks.len()).map(|id| ctx.weight(id).abs()).collect())
            }
            ScoreRule::Lamp => {
                let mut ctx = ScoringContext::new(net);
                ctx.apply_masks(masks)?;
                Ok((0..masks.len()).map(|id| lamp_scores(ctx.weight(id))).collect())
            }
            ScoreRule::Snip => {
                let batch = batch.ok_or_else(|| PruningError::DataUnavailable {
                    rule: "snip".to_string(),
                })?;
                let mut ctx = ScoringContext::new(net);
                ctx.apply_masks(masks)?;
                let out = ctx.forward_backward(Pass::Loss(batch))?;
                Ok(out
                    .gradients
                    .iter()
                    .enumerate()
                    .map(|(id, g)| g.mul(ctx.weight(id)).abs())
                    .collect())
            }
            ScoreRule::Synflow => {
                let mut ctx = ScoringContext::new(net);
                for (id, mask) in masks.iter().enumerate() {
                    let linear = ctx.weight(id).abs().mul(mask.tensor());
                    *ctx.weight_mut(id) = linear;
                }
                let out = ctx.forward_backward(Pass::Flow)?;
                Ok(out
                    .gradients
                    .iter()
                    .enumerate()
                    .map(|(id, g)| g.mul(ctx.weight(id)))
                    .collect())
            }
        }
    }
}

/// `w_u^2 / sum_{v : |w_v| >= |w_u|} w_v^2` within one tensor.
fn lamp_scores(weights: &Tensor) -> Tensor {
    let squared: Vec<f32> = weights.data().iter().map(|w| w * w).collect();
    let mut order: Vec<usize> = (0..squared.len()).collect();
    order.sort_by(|&a, &b| squared[b].total_cmp(&squared[a]));

    let mut scores = vec![0.0f32; squared.len()];
    let mut tail = 0.0f64;
    let mut start = 0;
    while start < order.len() {
        let value = squared[order[start]];
        let end = start + order[start..].iter().take_while(|&&i| squared[i] == value).count();
        tail += f64::from(value) * (end - start) as f64;
        let score = if tail > 0.0 {
            (f64::from(value) / tail) as f32
        } else {
            0.0
        };
        for &i in &order[start..end] {
            scores[i] = score;
        }
        start = end;
    }
    Tensor::from_vec(scores, weights.shape())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nn::{Dense, Layer, Sequential};
    use rand::SeedableRng;

    fn net() -> Sequential {
        Sequential::new(
            "mlp",
            &[2],
            vec![
                Layer::Dense(Dense::new(Tensor::new(&[0.5, -1.0, 2.0, -0.25], &[2, 2]))),
                Layer::Relu,
                Layer::Dense(Dense::new(Tensor::new(&[1.0, -3.0, 0.1, 0.2], &[2, 2]))),
            ],
        )
        .unwrap()
    }

    fn dense_masks(net: &Sequential) -> Vec<Mask> {
        net.prunable().iter().map(|t| Mask::dense(&t.shape)).collect()
    }

    #[test]
    fn test_magnitude_is_abs_of_masked_weights() {
        let mut net = net();
        let mut masks = dense_masks(&net);
        masks[0] = Mask::from_fn(&[2, 2], |i| i != 2);
        let mut rng = StdRng::seed_from_u64(0);
        let scores = ScoreRule::Magnitude.score(&mut net, &masks, None, &mut rng).unwrap();
        assert_eq!(scores[0].data(), &[0.5, 1.0, 0.0, 0.25]);
        assert_eq!(scores[1].data(), &[1.0, 3.0, 0.1, 0.2]);
    }

    #[test]
    fn test_random_is_seeded() {
        let mut net = net();
        let masks = dense_masks(&net);
        let a = ScoreRule::Random
            .score(&mut net, &masks, None, &mut StdRng::seed_from_u64(9))
            .unwrap();
        let b = ScoreRule::Random
            .score(&mut net, &masks, None, &mut StdRng::seed_from_u64(9))
            .unwrap();
        assert_eq!(a, b);
        assert!(a[0].data().iter().all(|&s| (0.0..1.0).contains(&s)));
    }

    #[test]
    fn test_snip_without_batch_fails() {
        let mut net = net();
        let masks = dense_masks(&net);
        let err = ScoreRule::Snip
            .score(&mut net, &masks, None, &mut StdRng::seed_from_u64(0))
            .unwrap_err();
        assert!(matches!(err, PruningError::DataUnavailable { .. }));
    }

    // ==========================================================================
    // FALSIFICATION: scoring leaves weights bit-for-bit unchanged
    // ==========================================================================
    #[test]
    fn test_scoring_restores_weights() {
        let mut net = net();
        let before = net.snapshot();
        let masks = vec![Mask::from_fn(&[2, 2], |i| i % 2 == 0), Mask::dense(&[2, 2])];
        let batch = Batch::synthetic(&[2], 2, 4, 1);
        let mut rng = StdRng::seed_from_u64(0);
        for rule in [
            ScoreRule::Random,
            ScoreRule::Magnitude,
            ScoreRule::Snip,
            ScoreRule::Synflow,
            ScoreRule::Lamp,
        ] {
            rule.score(&mut net, &masks, Some(&batch), &mut rng).unwrap();
            assert_eq!(net.snapshot(), before, "{rule:?}");
        }
    }

    #[test]
    fn test_scoring_restores_weights_on_error() {
        let mut net = net();
        let before = net.snapshot();
        let masks = dense_masks(&net);
        // Wrong input width makes the loss pass fail after masking.
        let batch = Batch::synthetic(&[3], 2, 4, 1);
        let err = ScoreRule::Snip
            .score(&mut net, &masks, Some(&batch), &mut StdRng::seed_from_u64(0))
            .unwrap_err();
        assert!(matches!(err, PruningError::ShapeMismatch { .. }));
        assert_eq!(net.snapshot(), before);
    }

    #[test]
    fn test_context_restores_on_panic() {
        let mut net = net();
        let before = net.snapshot();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let mut ctx = ScoringContext::new(&mut net);
            *ctx.weight_mut(0) = Tensor::zeros(&[2, 2]);
            panic!("scoring failed");
        }));
        assert!(result.is_err());
        assert_eq!(net.snapshot(), before);
    }

    #[test]
    fn test_mask_count_mismatch() {
        let mut net = net();
        let err = ScoreRule::Magnitude
            .score(&mut net, &[Mask::dense(&[2, 2])], None, &mut StdRng::seed_from_u64(0))
            .unwrap_err();
        assert!(matches!(err, PruningError::ShapeMismatch { .. }));
    }

    #[test]
    fn test_synflow_scores_are_nonnegative_and_zero_when_pruned() {
        let mut net = net();
        let masks = vec![Mask::from_fn(&[2, 2], |i| i != 0), Mask::dense(&[2, 2])];
        let scores = ScoreRule::Synflow
            .score(&mut net, &masks, None, &mut StdRng::seed_from_u64(0))
            .unwrap();
        assert_eq!(scores[0].data()[0], 0.0);
        assert!(scores.iter().all(|s| s.data().iter().all(|&v| v >= 0.0)));
        assert!(scores[1].data().iter().all(|&v| v > 0.0));
    }

    #[test]
    fn test_synflow_conserves_flow_per_layer() {
        // On a linear chain the synflow scores of every layer sum to R.
        let mut net = net();
        let masks = dense_masks(&net);
        let scores = ScoreRule::Synflow
            .score(&mut net, &masks, None, &mut StdRng::seed_from_u64(0))
            .unwrap();
        let s0 = scores[0].sum();
        let s1 = scores[1].sum();
        assert!((s0 - s1).abs() / s1 < 1e-5);
    }

    #[test]
    fn test_lamp_scores() {
        let w = Tensor::new(&[1.0, -2.0, 2.0, 0.0], &[4]);
        let s = lamp_scores(&w);
        // 2^2 ties: 4 / (4 + 4); 1: 1 / 9; 0: 0 / 9.
        assert!((s.data()[1] - 0.5).abs() < 1e-6);
        assert!((s.data()[2] - 0.5).abs() < 1e-6);
        assert!((s.data()[0] - 1.0 / 9.0).abs() < 1e-6);
        assert_eq!(s.data()[3], 0.0);
    }
}
