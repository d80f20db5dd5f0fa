//! Convenience re-exports for common usage.
//!
//! # Usage
//!
//! ```
//! use effective_sparsity::prelude::*;
//! ```

pub use crate::config::{PruningConfig, PruningType};
pub use crate::nn::{Architecture, Batch, BatchSource, Network, NetworkSpec, Sequential};
pub use crate::pruning::{
    effective_masks_by_flow, effective_masks_by_rule, report, Mask, MaskEnforcer, Pruner,
    PruningError, SparsityReport,
};
pub use crate::tensor::Tensor;
pub use crate::train::{LogHook, StepHook, Trainer};
