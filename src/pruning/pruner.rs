//! Mask computation for a whole network.
//!
//! The pruner resolves a policy name once, then runs its rounds: each round
//! allocates a budget for the round's target, scores the surviving weights
//! and keeps the best of them. Round `k` of `R` targets
//! `1 - (1 - s)^(k / R)`, so every round removes the same fraction of the
//! weights that survived the previous one.
//!
//! # References
//! - Han, S., et al. (2015). Learning both weights and connections. `NeurIPS`.
//! - Evci, U., et al. (2020). Rigging the lottery. ICML.
//! - Vysogorets, A., & Kempe, J. (2023). Connectivity matters: neural network
//!   pruning through the lens of effective sparsity. JMLR.

use super::allocator::{check_target, Allocation};
use super::effective::effective_masks_by_flow;
use super::error::{PruningError, Result};
use super::mask::{global_top_k, overall_sparsity, top_k_mask, Mask};
use super::policy::{Distribution, Policy};
use crate::config::{PruningConfig, PruningType};
use crate::nn::{BatchSource, Network};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Cooperative cancellation, checked between rounds.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Masks produced by a pruning run, with diagnostics.
#[derive(Debug, Clone, PartialEq)]
pub struct PruneOutcome {
    /// One mask per prunable tensor, in tensor order.
    pub masks: Vec<Mask>,
    /// Requested sparsity (direct or effective, per the pruning type).
    pub requested: f64,
    /// Direct target the masks were computed for.
    pub direct_target: f64,
    /// Overall direct sparsity of `masks`.
    pub achieved: f64,
    pub rounds_completed: usize,
    /// Cancelled before all rounds ran; `masks` are those of the last
    /// completed round.
    pub interrupted: bool,
    /// Keep floors forced a lower sparsity than requested in some round.
    pub clamped: bool,
}

impl PruneOutcome {
    /// Compression ratio `1 / (1 - achieved)`.
    #[must_use]
    pub fn compression_ratio(&self) -> f64 {
        if self.achieved >= 1.0 {
            return f64::INFINITY;
        }
        1.0 / (1.0 - self.achieved)
    }
}

/// Sparsity targeted by round `k` of `rounds` for a final target `target`.
#[must_use]
pub fn round_target(target: f64, k: usize, rounds: usize) -> f64 {
    if k >= rounds {
        return target;
    }
    1.0 - (1.0 - target).powf(k as f64 / rounds as f64)
}

/// Policy-driven mask generator.
///
/// # Example
///
/// ```
/// use effective_sparsity::config::PruningConfig;
/// use effective_sparsity::nn::{Architecture, NetworkSpec};
/// use effective_sparsity::pruning::Pruner;
///
/// let arch = Architecture::Lenet300100;
/// let mut net = arch
///     .build(&NetworkSpec::for_architecture(arch).with_width_divisor(10))
///     .unwrap();
/// let pruner = Pruner::new("magnitude/uniform", PruningConfig::default()).unwrap();
/// let outcome = pruner.prune(&mut net, 0.9, None).unwrap();
/// assert!((outcome.achieved - 0.9).abs() < 1e-3);
/// ```
#[derive(Debug, Clone)]
pub struct Pruner {
    policy: Policy,
    config: PruningConfig,
}

impl Pruner {
    /// # Errors
    /// `UnknownPolicy` if `policy_name` is not recognized.
    pub fn new(policy_name: &str, config: PruningConfig) -> Result<Self> {
        let policy = Policy::resolve(policy_name, &config)?;
        Ok(Self { policy, config })
    }

    #[must_use]
    pub fn policy(&self) -> &Policy {
        &self.policy
    }

    #[must_use]
    pub fn config(&self) -> &PruningConfig {
        &self.config
    }

    /// Compute masks for `target`, following the configured pruning type.
    ///
    /// The network's weights are left unchanged; apply the masks with a
    /// [`super::MaskEnforcer`].
    ///
    /// # Errors
    /// - `InvalidSparsity` if `target` is outside `[0, 1)`
    /// - `DataUnavailable` if the policy needs data and `data` is `None` or
    ///   runs dry
    /// - `BudgetInfeasible` if clamping occurs and the budget is strict
    /// - `ShapeMismatch`, `NumericalInstability` from scoring
    pub fn prune<N: Network + ?Sized>(
        &self,
        net: &mut N,
        target: f64,
        data: Option<&mut (dyn BatchSource + '_)>,
    ) -> Result<PruneOutcome> {
        self.prune_with_cancel(net, target, data, &CancelToken::new())
    }

    /// [`Pruner::prune`] that stops between rounds once `cancel` fires.
    ///
    /// # Errors
    /// See [`Pruner::prune`].
    pub fn prune_with_cancel<N: Network + ?Sized>(
        &self,
        net: &mut N,
        target: f64,
        data: Option<&mut (dyn BatchSource + '_)>,
        cancel: &CancelToken,
    ) -> Result<PruneOutcome> {
        match self.config.pruning_type {
            PruningType::Direct => self.prune_direct(net, target, data, cancel),
            PruningType::Effective => self.prune_effective(net, target, data, cancel),
        }
    }

    /// Masks whose overall *direct* sparsity is `target`.
    ///
    /// # Errors
    /// See [`Pruner::prune`].
    pub fn prune_direct<N: Network + ?Sized>(
        &self,
        net: &mut N,
        target: f64,
        mut data: Option<&mut (dyn BatchSource + '_)>,
        cancel: &CancelToken,
    ) -> Result<PruneOutcome> {
        let shapes: Vec<Vec<usize>> = net.prunable().into_iter().map(|t| t.shape).collect();
        if shapes.iter().all(|s| s.iter().product::<usize>() == 0) {
            return Err(PruningError::NoParameters {
                network: net.name().to_string(),
            });
        }
        let mut masks: Vec<Mask> = shapes.iter().map(|s| Mask::dense(s)).collect();
        let policy = &self.policy;

        if policy.is_dense() {
            return Ok(PruneOutcome {
                masks,
                requested: 0.0,
                direct_target: 0.0,
                achieved: 0.0,
                rounds_completed: 0,
                interrupted: false,
                clamped: false,
            });
        }
        check_target(target)?;
        if policy.needs_data() && data.is_none() {
            return Err(PruningError::DataUnavailable {
                rule: policy.name.clone(),
            });
        }

        let profile = if policy.distribution == Distribution::Synflow {
            let synflow = Pruner {
                policy: Policy::resolve("synflow", &self.config)?,
                config: self.config.clone(),
            };
            let run = synflow.prune_direct(net, target, None, cancel)?;
            if run.interrupted {
                return Ok(PruneOutcome {
                    masks,
                    requested: target,
                    direct_target: target,
                    achieved: 0.0,
                    rounds_completed: 0,
                    interrupted: true,
                    clamped: run.clamped,
                });
            }
            Some(run.masks.iter().map(Mask::nnz).collect::<Vec<usize>>())
        } else {
            None
        };

        let mut rng = StdRng::seed_from_u64(self.config.seed);
        let mut clamped = false;
        let mut completed = 0;
        for k in 1..=policy.rounds {
            if cancel.is_cancelled() {
                break;
            }
            let goal = round_target(target, k, policy.rounds);
            let allocation = match &profile {
                Some(counts) => Allocation::from_counts(&shapes, counts, goal, self.config.keep_floor)?,
                None => policy
                    .distribution
                    .allocate(&shapes, goal, self.config.keep_floor)?,
            };
            if allocation.clamped {
                if self.config.strict_budget {
                    return Err(PruningError::BudgetInfeasible {
                        requested: goal,
                        achieved: allocation.achieved,
                    });
                }
                clamped = true;
            }

            let batch = match data.as_mut() {
                Some(source) if policy.needs_data() => {
                    Some(source.next_batch().ok_or_else(|| PruningError::DataUnavailable {
                        rule: policy.name.clone(),
                    })?)
                }
                _ => None,
            };
            let scores = policy.rule.score(net, &masks, batch.as_ref(), &mut rng)?;

            masks = if allocation.pooled {
                global_top_k(&scores, &masks, &allocation.floors, allocation.total_keep)?
            } else {
                scores
                    .iter()
                    .zip(&masks)
                    .zip(&allocation.keep)
                    .map(|((s, m), &keep)| top_k_mask(s, m, keep))
                    .collect::<Result<Vec<Mask>>>()?
            };
            completed = k;
            tracing::debug!(
                policy = %policy.name,
                round = k,
                rounds = policy.rounds,
                target = goal,
                sparsity = overall_sparsity(&masks),
                "pruning round complete"
            );
        }

        let interrupted = completed < policy.rounds;
        let achieved = overall_sparsity(&masks);
        if interrupted {
            tracing::warn!(
                policy = %policy.name,
                completed,
                rounds = policy.rounds,
                "pruning cancelled; keeping last completed round"
            );
        }
        tracing::info!(
            policy = %policy.name,
            requested = target,
            achieved,
            rounds = completed,
            "pruning finished"
        );
        Ok(PruneOutcome {
            masks,
            requested: target,
            direct_target: target,
            achieved,
            rounds_completed: completed,
            interrupted,
            clamped,
        })
    }

    /// Masks whose overall *effective* sparsity (flow analysis) reaches
    /// `target`.
    ///
    /// Bisects the direct target over `[0, target]`, keeping the lowest
    /// direct target whose effective sparsity still reaches `target`.
    ///
    /// # Errors
    /// See [`Pruner::prune`].
    pub fn prune_effective<N: Network + ?Sized>(
        &self,
        net: &mut N,
        target: f64,
        mut data: Option<&mut (dyn BatchSource + '_)>,
        cancel: &CancelToken,
    ) -> Result<PruneOutcome> {
        if self.policy.is_dense() {
            return self.prune_direct(net, target, data, cancel);
        }
        check_target(target)?;
        let mut best = self.prune_direct(net, target, data.as_deref_mut(), cancel)?;
        let effective = overall_sparsity(&effective_masks_by_flow(net, &best.masks)?);
        if best.interrupted || effective <= target {
            return Ok(best);
        }

        let (mut lo, mut hi) = (0.0, target);
        for _ in 0..self.config.effective_search_steps {
            if cancel.is_cancelled() {
                best.interrupted = true;
                break;
            }
            let mid = 0.5 * (lo + hi);
            let run = self.prune_direct(net, mid, data.as_deref_mut(), cancel)?;
            if run.interrupted {
                best.interrupted = true;
                break;
            }
            let effective = overall_sparsity(&effective_masks_by_flow(net, &run.masks)?);
            tracing::debug!(direct = mid, effective, "effective target search step");
            if effective >= target {
                hi = mid;
                best = run;
            } else {
                lo = mid;
            }
        }
        best.requested = target;
        best.direct_target = hi;
        tracing::info!(
            policy = %self.policy.name,
            requested = target,
            direct = hi,
            "effective target reached"
        );
        Ok(best)
    }
}

/// One-shot convenience wrapper around [`Pruner`].
///
/// # Errors
/// `UnknownPolicy` for an unrecognized name, otherwise see [`Pruner::prune`].
pub fn prune<N: Network + ?Sized>(
    net: &mut N,
    target: f64,
    policy_name: &str,
    data: Option<&mut (dyn BatchSource + '_)>,
    config: &PruningConfig,
) -> Result<PruneOutcome> {
    Pruner::new(policy_name, config.clone())?.prune(net, target, data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nn::{Batch, BatchCycle, Dense, Layer, Sequential};
    use crate::tensor::Tensor;

    fn mlp() -> Sequential {
        let w1: Vec<f32> = (0..40).map(|i| ((i * 7 % 11) as f32 - 5.0) / 5.0).collect();
        let w2: Vec<f32> = (0..30).map(|i| ((i * 5 % 13) as f32 - 6.0) / 6.0).collect();
        let w3: Vec<f32> = (0..12).map(|i| ((i * 3 % 7) as f32 - 3.0) / 3.0).collect();
        Sequential::new(
            "mlp",
            &[4],
            vec![
                Layer::Dense(Dense::new(Tensor::new(&w1, &[4, 10]))),
                Layer::Relu,
                Layer::Dense(Dense::new(Tensor::new(&w2, &[10, 3]))),
                Layer::Relu,
                Layer::Dense(Dense::new(Tensor::new(&w3, &[3, 4]))),
            ],
        )
        .unwrap()
    }

    #[test]
    fn test_round_target_schedule() {
        assert_eq!(round_target(0.99, 2, 2), 0.99);
        assert!((round_target(0.99, 1, 2) - 0.9).abs() < 1e-12);
        assert!(round_target(0.5, 1, 4) < round_target(0.5, 2, 4));
    }

    #[test]
    fn test_dense_policy_returns_all_ones() {
        let mut net = mlp();
        let outcome = Pruner::new("dense", PruningConfig::default())
            .unwrap()
            .prune(&mut net, 0.9, None)
            .unwrap();
        assert!(outcome.masks.iter().all(|m| m.num_zeros() == 0));
        assert_eq!(outcome.achieved, 0.0);
        assert_eq!(outcome.requested, 0.0);
    }

    #[test]
    fn test_dense_ignores_out_of_range_target() {
        let mut net = mlp();
        for pruning_type in [PruningType::Direct, PruningType::Effective] {
            let config = PruningConfig::default().with_pruning_type(pruning_type);
            let outcome = Pruner::new("dense", config)
                .unwrap()
                .prune(&mut net, 1.0, None)
                .unwrap();
            assert_eq!(outcome.achieved, 0.0);
            assert!(outcome.masks.iter().all(|m| m.num_zeros() == 0));
        }
        let err = Pruner::new("magnitude/uniform", PruningConfig::default())
            .unwrap()
            .prune(&mut net, 1.0, None)
            .unwrap_err();
        assert!(matches!(err, PruningError::InvalidSparsity { .. }));
    }

    #[test]
    fn test_unknown_policy_fails_before_work() {
        assert!(matches!(
            Pruner::new("magnitude/banana", PruningConfig::default()),
            Err(PruningError::UnknownPolicy { .. })
        ));
    }

    #[test]
    fn test_snip_requires_data() {
        let mut net = mlp();
        let pruner = Pruner::new("snip", PruningConfig::default()).unwrap();
        assert!(matches!(
            pruner.prune(&mut net, 0.5, None),
            Err(PruningError::DataUnavailable { .. })
        ));
        let mut empty = BatchCycle::new(Vec::new());
        assert!(matches!(
            pruner.prune(&mut net, 0.5, Some(&mut empty)),
            Err(PruningError::DataUnavailable { .. })
        ));
    }

    #[test]
    fn test_snip_with_data_hits_target() {
        let mut net = mlp();
        let mut data = BatchCycle::new(vec![Batch::synthetic(&[4], 4, 8, 1)]);
        let outcome = Pruner::new("snip", PruningConfig::default())
            .unwrap()
            .prune(&mut net, 0.5, Some(&mut data))
            .unwrap();
        assert_eq!(outcome.masks.iter().map(Mask::nnz).sum::<usize>(), 41);
    }

    #[test]
    fn test_higher_target_keeps_fewer_weights() {
        let mut net = mlp();
        let config = PruningConfig::default().with_rounds(4, 4);
        let pruner = Pruner::new("synflow", config).unwrap();
        let mut previous = usize::MAX;
        for target in [0.3, 0.6, 0.8] {
            let outcome = pruner.prune(&mut net, target, None).unwrap();
            assert_eq!(outcome.rounds_completed, 4);
            let kept: usize = outcome.masks.iter().map(Mask::nnz).sum();
            assert!(kept < previous);
            previous = kept;
        }
    }

    #[test]
    fn test_cancelled_before_first_round_returns_dense() {
        let mut net = mlp();
        let cancel = CancelToken::new();
        cancel.cancel();
        let outcome = Pruner::new("synflow", PruningConfig::default())
            .unwrap()
            .prune_with_cancel(&mut net, 0.9, None, &cancel)
            .unwrap();
        assert!(outcome.interrupted);
        assert_eq!(outcome.rounds_completed, 0);
        assert_eq!(outcome.achieved, 0.0);
    }

    #[test]
    fn test_strict_budget_raises() {
        let mut net = mlp();
        let config = PruningConfig::default()
            .with_keep_floor(crate::pruning::KeepFloor::Unit)
            .strict();
        let err = Pruner::new("magnitude/uniform", config)
            .unwrap()
            .prune(&mut net, 0.95, None)
            .unwrap_err();
        assert!(matches!(err, PruningError::BudgetInfeasible { .. }));
    }

    #[test]
    fn test_clamping_is_recovered_by_default() {
        let mut net = mlp();
        let config = PruningConfig::default().with_keep_floor(crate::pruning::KeepFloor::Unit);
        let outcome = Pruner::new("magnitude/uniform", config)
            .unwrap()
            .prune(&mut net, 0.95, None)
            .unwrap();
        assert!(outcome.clamped);
        assert!(outcome.achieved < 0.95);
        for (m, t) in outcome.masks.iter().zip(net.prunable()) {
            assert!(m.nnz() >= t.shape[1]);
        }
    }

    #[test]
    fn test_pruning_leaves_weights_untouched() {
        let mut net = mlp();
        let before = net.snapshot();
        let mut data = BatchCycle::new(vec![Batch::synthetic(&[4], 4, 8, 1)]);
        for name in ["snip", "synflow", "lamp", "random/erk", "magnitude/global"] {
            let pruner = Pruner::new(name, PruningConfig::default().with_rounds(2, 3)).unwrap();
            pruner.prune(&mut net, 0.7, Some(&mut data)).unwrap();
            assert_eq!(net.snapshot(), before, "{name}");
        }
    }

    #[test]
    fn test_random_synflow_copies_synflow_counts() {
        let mut net = mlp();
        let config = PruningConfig::default().with_rounds(2, 5);
        let synflow = Pruner::new("synflow", config.clone())
            .unwrap()
            .prune(&mut net, 0.8, None)
            .unwrap();
        let random = Pruner::new("random/synflow", config)
            .unwrap()
            .prune(&mut net, 0.8, None)
            .unwrap();
        let counts = |o: &PruneOutcome| o.masks.iter().map(Mask::nnz).collect::<Vec<_>>();
        assert_eq!(counts(&synflow), counts(&random));
    }

    #[test]
    fn test_effective_pruning_reaches_target_with_lower_direct() {
        let mut net = mlp();
        let config = PruningConfig::default().with_pruning_type(PruningType::Effective);
        let pruner = Pruner::new("magnitude/global", config).unwrap();
        let outcome = pruner.prune(&mut net, 0.8, None).unwrap();
        let effective = overall_sparsity(&effective_masks_by_flow(&mut net, &outcome.masks).unwrap());
        assert!(effective >= 0.8 - 1e-9);
        assert!(outcome.direct_target <= 0.8);
        assert!(outcome.achieved <= effective);
    }
}
