//! Binary keep/prune masks and score-ranked mask generation.
//!
//! Masks validate shape compatibility and binary values at construction,
//! so an invalid mask can never reach the enforcer or the analyzers.
//!
//! # Ranking
//! Every mask generator ranks candidates by descending score and breaks
//! ties by ascending `(tensor id, flattened index)`. Positions already pruned
//! in the candidate mask are never selected, so successive masks only shrink.

use super::error::{PruningError, Result};
use crate::tensor::Tensor;
use std::cmp::Ordering;

/// Binary mask over one prunable tensor (1 = keep, 0 = prune).
///
/// # Invariants
/// - All values are exactly 0.0 or 1.0
/// - The kept count is precomputed and cached
/// - Immutable once created; weights are changed to match it, never the reverse
#[derive(Debug, Clone, PartialEq)]
pub struct Mask {
    mask: Tensor,
    kept: usize,
}

impl Mask {
    /// Create a new mask with validation.
    ///
    /// # Errors
    /// `InvalidMask` if any value is not exactly 0.0 or 1.0.
    pub fn new(mask: Tensor) -> Result<Self> {
        let mut kept = 0;
        for &v in mask.data() {
            if v == 1.0 {
                kept += 1;
            } else if v != 0.0 {
                return Err(PruningError::InvalidMask {
                    reason: format!("Mask contains non-binary value: {v}"),
                });
            }
        }
        Ok(Self { mask, kept })
    }

    /// Create an all-ones (dense) mask.
    #[must_use]
    pub fn dense(shape: &[usize]) -> Self {
        let mask = Tensor::ones(shape);
        let kept = mask.numel();
        Self { mask, kept }
    }

    /// Build a mask from a per-position keep predicate.
    #[must_use]
    pub fn from_fn(shape: &[usize], mut keep: impl FnMut(usize) -> bool) -> Self {
        let numel: usize = shape.iter().product();
        let data: Vec<f32> = (0..numel)
            .map(|i| if keep(i) { 1.0 } else { 0.0 })
            .collect();
        let kept = data.iter().filter(|&&v| v == 1.0).count();
        Self {
            mask: Tensor::from_vec(data, shape),
            kept,
        }
    }

    /// Underlying 0/1 tensor.
    #[must_use]
    pub fn tensor(&self) -> &Tensor {
        &self.mask
    }

    #[must_use]
    pub fn shape(&self) -> &[usize] {
        self.mask.shape()
    }

    #[must_use]
    pub fn numel(&self) -> usize {
        self.mask.numel()
    }

    /// Number of kept positions.
    #[must_use]
    pub fn nnz(&self) -> usize {
        self.kept
    }

    /// Number of pruned positions.
    #[must_use]
    pub fn num_zeros(&self) -> usize {
        self.numel() - self.kept
    }

    /// Fraction of pruned positions (0.0 = dense, 1.0 = all pruned).
    #[must_use]
    pub fn sparsity(&self) -> f64 {
        if self.numel() == 0 {
            return 0.0;
        }
        self.num_zeros() as f64 / self.numel() as f64
    }

    #[must_use]
    pub fn is_kept(&self, index: usize) -> bool {
        self.mask.data()[index] == 1.0
    }

    /// Iterate over the flattened indices of kept positions.
    pub fn kept_indices(&self) -> impl Iterator<Item = usize> + '_ {
        self.mask
            .data()
            .iter()
            .enumerate()
            .filter(|(_, &v)| v == 1.0)
            .map(|(i, _)| i)
    }

    /// Fail with `ShapeMismatch` unless `shape` equals this mask's shape.
    pub fn check_shape(&self, shape: &[usize]) -> Result<()> {
        if shape != self.shape() {
            return Err(PruningError::ShapeMismatch {
                expected: self.shape().to_vec(),
                got: shape.to_vec(),
            });
        }
        Ok(())
    }

    /// Write exact `0.0` into every pruned position of `weights`.
    ///
    /// Kept positions are left bit-for-bit untouched.
    ///
    /// # Errors
    /// `ShapeMismatch` if the shapes differ; weights are not modified then.
    pub fn apply(&self, weights: &mut Tensor) -> Result<()> {
        self.check_shape(weights.shape())?;
        for (w, &m) in weights.data_mut().iter_mut().zip(self.mask.data()) {
            if m == 0.0 {
                *w = 0.0;
            }
        }
        Ok(())
    }

    /// `true` if every kept position here is also kept in `other`.
    #[must_use]
    pub fn is_subset_of(&self, other: &Mask) -> bool {
        self.shape() == other.shape()
            && self
                .mask
                .data()
                .iter()
                .zip(other.mask.data())
                .all(|(&a, &b)| a <= b)
    }

    /// Element-wise AND of two masks.
    pub fn intersect(&self, other: &Mask) -> Result<Mask> {
        self.check_shape(other.shape())?;
        Ok(Mask::from_fn(self.shape(), |i| {
            self.is_kept(i) && other.is_kept(i)
        }))
    }
}

/// One rankable candidate position.
#[derive(Debug, Clone, Copy)]
struct Candidate {
    score: f32,
    tensor: usize,
    index: usize,
}

/// Descending score, then ascending `(tensor, index)`.
fn rank(a: &Candidate, b: &Candidate) -> Ordering {
    b.score
        .total_cmp(&a.score)
        .then(a.tensor.cmp(&b.tensor))
        .then(a.index.cmp(&b.index))
}

fn check_scores(scores: &Tensor, candidates: &Mask, tensor: usize) -> Result<()> {
    candidates.check_shape(scores.shape())?;
    let bad = candidates
        .kept_indices()
        .any(|i| !scores.data()[i].is_finite());
    if bad {
        return Err(PruningError::NumericalInstability {
            method: "mask ranking".to_string(),
            details: format!("non-finite score in tensor {tensor}"),
        });
    }
    Ok(())
}

fn ranked_candidates(scores: &Tensor, candidates: &Mask, tensor: usize) -> Vec<Candidate> {
    let mut ranked: Vec<Candidate> = candidates
        .kept_indices()
        .map(|index| Candidate {
            score: scores.data()[index],
            tensor,
            index,
        })
        .collect();
    ranked.sort_by(rank);
    ranked
}

/// Keep the `keep` highest-scoring positions among the kept positions of
/// `candidates`.
///
/// If `keep` exceeds the number of candidates, all candidates are kept.
///
/// # Errors
/// - `ShapeMismatch` if `scores` and `candidates` differ in shape
/// - `NumericalInstability` if a candidate score is NaN or infinite
pub fn top_k_mask(scores: &Tensor, candidates: &Mask, keep: usize) -> Result<Mask> {
    check_scores(scores, candidates, 0)?;
    let ranked = ranked_candidates(scores, candidates, 0);
    let mut data = vec![0.0f32; scores.numel()];
    for c in ranked.iter().take(keep) {
        data[c.index] = 1.0;
    }
    Mask::new(Tensor::from_vec(data, scores.shape()))
}

/// Keep `keep_total` positions across all tensors by one pooled rank cut.
///
/// Each tensor first reserves its own best `floors[t]` candidates, so no
/// tensor can collapse below its floor; the rest of the budget goes to the
/// best remaining candidates of the pool.
///
/// # Errors
/// - `ShapeMismatch` if slice lengths or per-tensor shapes disagree
/// - `NumericalInstability` if a candidate score is NaN or infinite
pub fn global_top_k(
    scores: &[Tensor],
    candidates: &[Mask],
    floors: &[usize],
    keep_total: usize,
) -> Result<Vec<Mask>> {
    if scores.len() != candidates.len() || floors.len() != candidates.len() {
        return Err(PruningError::ShapeMismatch {
            expected: vec![candidates.len()],
            got: vec![scores.len(), floors.len()],
        });
    }

    let mut selected: Vec<Vec<f32>> = scores.iter().map(|s| vec![0.0; s.numel()]).collect();
    let mut pool = Vec::new();
    let mut reserved = 0;

    for (t, (s, c)) in scores.iter().zip(candidates).enumerate() {
        check_scores(s, c, t)?;
        let ranked = ranked_candidates(s, c, t);
        let floor = floors[t].min(ranked.len());
        for cand in &ranked[..floor] {
            selected[t][cand.index] = 1.0;
        }
        reserved += floor;
        pool.extend_from_slice(&ranked[floor..]);
    }

    pool.sort_by(rank);
    for cand in pool.iter().take(keep_total.saturating_sub(reserved)) {
        selected[cand.tensor][cand.index] = 1.0;
    }

    selected
        .into_iter()
        .zip(scores)
        .map(|(data, s)| Mask::new(Tensor::from_vec(data, s.shape())))
        .collect()
}

/// Per-tensor direct sparsity.
#[must_use]
pub fn direct_sparsities(masks: &[Mask]) -> Vec<f64> {
    masks.iter().map(Mask::sparsity).collect()
}

/// Overall sparsity weighted by parameter count: `1 - kept / total`.
#[must_use]
pub fn overall_sparsity(masks: &[Mask]) -> f64 {
    let total: usize = masks.iter().map(Mask::numel).sum();
    if total == 0 {
        return 0.0;
    }
    let kept: usize = masks.iter().map(Mask::nnz).sum();
    1.0 - kept as f64 / total as f64
}
