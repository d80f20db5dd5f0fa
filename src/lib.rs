//! Effective-sparsity: pruning masks for neural networks and the accounting
//! of which kept weights still matter.
//!
//! A pruning mask zeroes weights directly. Pruning also disconnects units:
//! a neuron whose incoming weights are all pruned contributes nothing, so
//! its outgoing weights are dead too even though the mask keeps them. The
//! *effective* sparsity counts those weights as pruned.
//!
//! # Quick Start
//!
//! ```
//! use effective_sparsity::prelude::*;
//!
//! let arch = Architecture::Lenet300100;
//! let spec = NetworkSpec::for_architecture(arch).with_width_divisor(10);
//! let mut net = arch.build(&spec).unwrap();
//!
//! let pruner = Pruner::new("magnitude/erk", PruningConfig::default()).unwrap();
//! let outcome = pruner.prune(&mut net, 0.99, None).unwrap();
//!
//! let by_flow = effective_masks_by_flow(&mut net, &outcome.masks).unwrap();
//! let by_rule = effective_masks_by_rule(arch, &outcome.masks).unwrap();
//! assert_eq!(by_flow, by_rule);
//! ```
//!
//! # Modules
//!
//! - [`tensor`]: Row-major `f32` tensors
//! - [`nn`]: The [`nn::Network`] interface, a reference network and training utilities
//! - [`pruning`]: Policies, allocation, scoring, enforcement and effective analysis
//! - [`train`]: Training loop with step hooks
//! - [`config`]: Pruning and experiment settings

pub mod config;
pub mod nn;
pub mod prelude;
pub mod pruning;
pub mod tensor;
pub mod train;

pub use pruning::{PruningError, Result};
pub use tensor::Tensor;
