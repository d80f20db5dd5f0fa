//! Global target sparsity to per-tensor keep budgets.
//!
//! Budgets are integer keep counts. The desired total keep is
//! `round(total * (1 - target))`; ERK and IGQ meet it exactly whenever the
//! keep floors allow, uniform policies within per-tensor rounding.

use super::error::{PruningError, Result};
use super::policy::Distribution;
use serde::{Deserialize, Serialize};

/// Minimum number of weights a tensor keeps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeepFloor {
    /// At least one weight per tensor.
    #[default]
    Tensor,
    /// At least one weight per output unit (row or filter).
    Unit,
}

impl KeepFloor {
    /// Floor for a tensor of `shape`.
    #[must_use]
    pub fn floor(self, shape: &[usize]) -> usize {
        let numel: usize = shape.iter().product();
        let floor = match self {
            KeepFloor::Tensor => 1,
            KeepFloor::Unit => shape.last().copied().unwrap_or(1),
        };
        floor.min(numel)
    }
}

/// Per-tensor keep budget for one round.
#[derive(Debug, Clone, PartialEq)]
pub struct Allocation {
    /// Keep count per tensor. Upper bounds only when `pooled`.
    pub keep: Vec<usize>,
    /// Keep floor per tensor.
    pub floors: Vec<usize>,
    /// Total kept weights.
    pub total_keep: usize,
    /// Requested sparsity.
    pub requested: f64,
    /// Sparsity this allocation actually reaches.
    pub achieved: f64,
    /// Floors or exemptions pushed the budget above the request.
    pub clamped: bool,
    /// Per-tensor counts are decided by one pooled cut.
    pub pooled: bool,
}

impl Allocation {
    fn from_keep(sizes: &[usize], floors: Vec<usize>, keep: Vec<usize>, requested: f64, clamped: bool) -> Self {
        let total: usize = sizes.iter().sum();
        let total_keep = keep.iter().sum();
        Self {
            keep,
            floors,
            total_keep,
            requested,
            achieved: sparsity_of(total_keep, total),
            clamped,
            pooled: false,
        }
    }

    /// Allocation that copies per-tensor keep counts from an existing mask
    /// set (the `synflow` profile of `random/synflow`).
    ///
    /// # Errors
    /// `ShapeMismatch` if `counts` and `shapes` differ in length.
    pub fn from_counts(
        shapes: &[Vec<usize>],
        counts: &[usize],
        requested: f64,
        floor: KeepFloor,
    ) -> Result<Self> {
        if counts.len() != shapes.len() {
            return Err(PruningError::ShapeMismatch {
                expected: vec![shapes.len()],
                got: vec![counts.len()],
            });
        }
        let sizes = sizes(shapes);
        let floors = floors(shapes, floor);
        let keep: Vec<usize> = counts
            .iter()
            .zip(&sizes)
            .zip(&floors)
            .map(|((&c, &n), &f)| c.clamp(f, n))
            .collect();
        let clamped = keep.iter().zip(counts).any(|(k, c)| k > c);
        Ok(Self::from_keep(&sizes, floors, keep, requested, clamped))
    }
}

fn sizes(shapes: &[Vec<usize>]) -> Vec<usize> {
    shapes.iter().map(|s| s.iter().product()).collect()
}

fn floors(shapes: &[Vec<usize>], floor: KeepFloor) -> Vec<usize> {
    shapes.iter().map(|s| floor.floor(s)).collect()
}

fn sparsity_of(keep: usize, total: usize) -> f64 {
    if total == 0 {
        return 0.0;
    }
    1.0 - keep as f64 / total as f64
}

/// Check that `target` is a sparsity in `[0, 1)`.
///
/// # Errors
/// `InvalidSparsity` otherwise.
pub fn check_target(target: f64) -> Result<()> {
    if !target.is_finite() || !(0.0..1.0).contains(&target) {
        return Err(PruningError::InvalidSparsity {
            value: target,
            constraint: "must be in [0, 1)".to_string(),
        });
    }
    Ok(())
}

impl Distribution {
    /// Split `target` across tensors of the given shapes.
    ///
    /// Every tensor keeps at least its floor. If the floors alone exceed the
    /// budget the allocation is clamped: `clamped` is set, `achieved` holds
    /// the largest feasible sparsity and a warning is logged.
    ///
    /// # Errors
    /// - `InvalidSparsity` if `target` is outside `[0, 1)`
    /// - `NoParameters` if there are no weights at all
    /// - `DataUnavailable` for [`Distribution::Synflow`], whose counts come
    ///   from a synflow run (see [`Allocation::from_counts`])
    pub fn allocate(self, shapes: &[Vec<usize>], target: f64, floor: KeepFloor) -> Result<Allocation> {
        check_target(target)?;
        let sizes = sizes(shapes);
        let total: usize = sizes.iter().sum();
        if total == 0 {
            return Err(PruningError::NoParameters {
                network: format!("{} tensors", shapes.len()),
            });
        }
        let floors = floors(shapes, floor);
        let desired = ((total as f64 * (1.0 - target)).round() as usize).min(total);
        let floor_total: usize = floors.iter().sum();

        let allocation = match self {
            Distribution::Uniform => {
                let raw: Vec<usize> = sizes
                    .iter()
                    .map(|&n| (n as f64 * (1.0 - target)).round() as usize)
                    .collect();
                let keep: Vec<usize> = raw.iter().zip(&floors).map(|(&r, &f)| r.max(f)).collect();
                let clamped = keep.iter().zip(&raw).any(|(k, r)| k > r);
                Allocation::from_keep(&sizes, floors, keep, target, clamped)
            }
            Distribution::UniformPlus => uniform_plus(&sizes, floors, desired, target),
            Distribution::Erk => {
                let raw: Vec<f64> = shapes
                    .iter()
                    .map(|s| {
                        let n: usize = s.iter().product();
                        if n == 0 {
                            0.0
                        } else {
                            s.iter().sum::<usize>() as f64 / n as f64
                        }
                    })
                    .collect();
                let hi = raw
                    .iter()
                    .filter(|&&r| r > 0.0)
                    .map(|r| 1.0 / r)
                    .fold(1.0, f64::max);
                let quota = |eps: f64, l: usize| eps * raw[l] * sizes[l] as f64;
                let keep = fit_quota(desired, &sizes, &floors, 0.0, hi, quota);
                Allocation::from_keep(&sizes, floors, keep, target, floor_total > desired)
            }
            Distribution::Igq => {
                // Parametrize the force as F = exp(-x) so quotas grow with x.
                let quota = |x: f64, l: usize| {
                    let n = sizes[l] as f64;
                    n / (1.0 + (-x).exp() * n)
                };
                let keep = fit_quota(desired, &sizes, &floors, -60.0, 60.0, quota);
                Allocation::from_keep(&sizes, floors, keep, target, floor_total > desired)
            }
            Distribution::Global => {
                let total_keep = desired.max(floor_total);
                Allocation {
                    keep: sizes.clone(),
                    floors,
                    total_keep,
                    requested: target,
                    achieved: sparsity_of(total_keep, total),
                    clamped: floor_total > desired,
                    pooled: true,
                }
            }
            Distribution::Synflow => {
                return Err(PruningError::DataUnavailable {
                    rule: "random/synflow (per-tensor counts come from a synflow run)".to_string(),
                })
            }
        };

        if allocation.clamped {
            tracing::warn!(
                distribution = self.as_str(),
                requested = target,
                achieved = allocation.achieved,
                "sparsity budget clamped by keep floors"
            );
        }
        Ok(allocation)
    }
}

fn uniform_plus(sizes: &[usize], floors: Vec<usize>, desired: usize, target: f64) -> Allocation {
    let count = sizes.len();
    let exempt = |l: usize| l == 0 || (count >= 3 && l == count - 1);
    let total: usize = sizes.iter().sum();
    let rest: usize = (0..count).filter(|&l| !exempt(l)).map(|l| sizes[l]).sum();
    let to_prune = total - desired;

    let mut clamped = to_prune > rest;
    let local = if rest == 0 {
        0.0
    } else {
        (to_prune as f64 / rest as f64).min(1.0)
    };
    let keep: Vec<usize> = (0..count)
        .map(|l| {
            if exempt(l) {
                return sizes[l];
            }
            let raw = (sizes[l] as f64 * (1.0 - local)).round() as usize;
            if raw < floors[l] {
                clamped = true;
            }
            raw.max(floors[l])
        })
        .collect();
    let clamped = clamped && to_prune > 0;
    Allocation::from_keep(sizes, floors, keep, target, clamped)
}

/// Integer quotas `keep_l = clamp(quota(x, l), floor_l, n_l)` summing to
/// `desired`, for a quota that is non-decreasing in `x` over `[lo, hi]`.
///
/// `x` is found by bisection on the continuous total; the integer rounding
/// is then fixed by largest remainders so the total matches exactly when the
/// floors allow.
fn fit_quota(
    desired: usize,
    sizes: &[usize],
    floors: &[usize],
    mut lo: f64,
    mut hi: f64,
    quota: impl Fn(f64, usize) -> f64,
) -> Vec<usize> {
    let continuous = |x: f64| -> Vec<f64> {
        (0..sizes.len())
            .map(|l| quota(x, l).clamp(floors[l] as f64, sizes[l] as f64))
            .collect()
    };
    let target = desired as f64;
    for _ in 0..200 {
        let mid = 0.5 * (lo + hi);
        if continuous(mid).iter().sum::<f64>() < target {
            lo = mid;
        } else {
            hi = mid;
        }
    }
    let shares = continuous(hi);

    let mut keep: Vec<usize> = shares
        .iter()
        .enumerate()
        .map(|(l, &c)| (c.floor() as usize).clamp(floors[l], sizes[l]))
        .collect();
    let assigned: usize = keep.iter().sum();
    if assigned < desired {
        let mut order: Vec<usize> = (0..sizes.len()).collect();
        order.sort_by(|&a, &b| {
            let fa = shares[a] - shares[a].floor();
            let fb = shares[b] - shares[b].floor();
            fb.total_cmp(&fa).then(a.cmp(&b))
        });
        let mut missing = desired - assigned;
        while missing > 0 {
            let before = missing;
            for &l in &order {
                if missing == 0 {
                    break;
                }
                if keep[l] < sizes[l] {
                    keep[l] += 1;
                    missing -= 1;
                }
            }
            if missing == before {
                break;
            }
        }
    }
    keep
}
