//! Pruning masks and sparsity accounting.
//!
//! A [`Pruner`] turns a policy name and a target sparsity into one binary
//! [`Mask`] per prunable tensor. The [`MaskEnforcer`] keeps those weights at
//! zero while training, and the effective analyses find the weights that
//! are kept but disconnected from the input or the output.
//!
//! # Example
//!
//! ```
//! use effective_sparsity::config::PruningConfig;
//! use effective_sparsity::nn::{Architecture, NetworkSpec};
//! use effective_sparsity::pruning::{effective_masks_by_rule, report, MaskEnforcer, Pruner};
//!
//! let arch = Architecture::Lenet300100;
//! let spec = NetworkSpec::for_architecture(arch).with_width_divisor(10);
//! let mut net = arch.build(&spec).unwrap();
//!
//! let outcome = Pruner::new("lamp", PruningConfig::default())
//!     .unwrap()
//!     .prune(&mut net, 0.95, None)
//!     .unwrap();
//! MaskEnforcer::new(outcome.masks.clone()).enforce(&mut net).unwrap();
//!
//! let effective = effective_masks_by_rule(arch, &outcome.masks).unwrap();
//! let summary = report(&outcome.masks, &effective).unwrap();
//! assert!(summary.overall_effective >= summary.overall_direct);
//! ```
//!
//! # References
//! - Lee, N., et al. (2019). SNIP: single-shot network pruning. ICLR.
//! - Tanaka, H., et al. (2020). Pruning neural networks without any data by
//!   iteratively conserving synaptic flow. `NeurIPS`.
//! - Lee, J., et al. (2021). Layer-adaptive sparsity for magnitude-based
//!   pruning. ICLR.

mod allocator;
mod effective;
mod enforcer;
mod error;
mod mask;
mod policy;
mod pruner;
mod report;
mod scoring;

pub use allocator::{check_target, Allocation, KeepFloor};
pub use effective::{effective_masks_by_flow, effective_masks_by_rule};
pub use enforcer::MaskEnforcer;
pub use error::{PruningError, Result};
pub use mask::{direct_sparsities, global_top_k, overall_sparsity, top_k_mask, Mask};
pub use policy::{Distribution, Policy, ScoreRule, POLICY_NAMES};
pub use pruner::{prune, round_target, CancelToken, PruneOutcome, Pruner};
pub use report::{report, ArtifactWriter, SparsityReport, TensorSparsity};
pub use scoring::ScoringContext;
