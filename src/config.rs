//! Run configuration.
//!
//! Configuration values are immutable once built and are passed explicitly
//! to [`crate::pruning::Pruner`] and [`crate::train::Trainer`]. Both types
//! load from JSON; missing fields take their defaults.

use crate::nn::Architecture;
use crate::pruning::{KeepFloor, PruningError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;

/// What the target sparsity constrains.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PruningType {
    /// The fraction of zeroed weights.
    #[default]
    Direct,
    /// The fraction of zeroed or disconnected weights (flow analysis).
    Effective,
}

impl PruningType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            PruningType::Direct => "direct",
            PruningType::Effective => "effective",
        }
    }
}

impl fmt::Display for PruningType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PruningType {
    type Err = PruningError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "direct" => Ok(PruningType::Direct),
            "effective" => Ok(PruningType::Effective),
            other => Err(PruningError::UnknownPolicy {
                name: other.to_string(),
                known: "direct, effective".to_string(),
            }),
        }
    }
}

/// Mask computation settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PruningConfig {
    /// Seed for the `random/*` rules.
    pub seed: u64,
    /// Minimum number of weights each tensor keeps.
    pub keep_floor: KeepFloor,
    /// Rounds for `snip/iterative`.
    pub snip_rounds: usize,
    /// Rounds for `synflow`.
    pub synflow_rounds: usize,
    /// Fail with `BudgetInfeasible` instead of clamping.
    pub strict_budget: bool,
    pub pruning_type: PruningType,
    /// Bisection steps used by effective pruning.
    pub effective_search_steps: usize,
}

impl Default for PruningConfig {
    fn default() -> Self {
        Self {
            seed: 0,
            keep_floor: KeepFloor::Tensor,
            snip_rounds: 20,
            synflow_rounds: 100,
            strict_budget: false,
            pruning_type: PruningType::Direct,
            effective_search_steps: 16,
        }
    }
}

impl PruningConfig {
    #[must_use]
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    #[must_use]
    pub fn with_keep_floor(mut self, floor: KeepFloor) -> Self {
        self.keep_floor = floor;
        self
    }

    #[must_use]
    pub fn with_rounds(mut self, snip: usize, synflow: usize) -> Self {
        self.snip_rounds = snip;
        self.synflow_rounds = synflow;
        self
    }

    #[must_use]
    pub fn strict(mut self) -> Self {
        self.strict_budget = true;
        self
    }

    #[must_use]
    pub fn with_pruning_type(mut self, pruning_type: PruningType) -> Self {
        self.pruning_type = pruning_type;
        self
    }

    /// Load from a JSON file.
    ///
    /// # Errors
    /// `Io` if the file cannot be read, `Serialization` if it is malformed.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }
}

/// Target sparsity from a compression exponent: compression `10^com_exp`,
/// sparsity `1 - 10^(-com_exp)`.
#[must_use]
pub fn sparsity_from_compression_exponent(com_exp: f64) -> f64 {
    1.0 - 10f64.powf(-com_exp)
}

/// Compression ratio `1 / (1 - sparsity)`, rounded for file names.
#[must_use]
pub fn rounded_compression(sparsity: f64) -> u64 {
    if sparsity >= 1.0 {
        return u64::MAX;
    }
    (1.0 / (1.0 - sparsity)).round() as u64
}

/// Training hyper-parameters of one reference experiment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentConfig {
    /// Dataset name.
    pub data: String,
    pub lr: f32,
    pub batch_size_train: usize,
    pub iterations: usize,
    pub weight_decay: f32,
    pub momentum: f32,
    /// Steps at which the learning rate drops tenfold.
    pub lr_decay: Vec<usize>,
    /// Batch size of the SNIP scoring sample.
    pub batch_size_snip: usize,
    /// Record accuracy and loss every this many steps.
    pub log_every: usize,
}

impl ExperimentConfig {
    /// Published settings for `arch`.
    #[must_use]
    pub fn for_architecture(arch: Architecture) -> Self {
        let (lr, batch, iterations, wd, decay, snip): (f32, usize, usize, f32, Vec<usize>, usize) =
            match arch {
                Architecture::Lenet300100 => {
                    (0.1, 100, 96_000, 5e-4, vec![25_000, 50_000, 75_000, 100_000], 100)
                }
                Architecture::Lenet5 => {
                    (0.1, 128, 120_000, 5e-4, vec![30_000, 60_000, 90_000, 120_000], 128)
                }
                Architecture::Vgg16 => (0.1, 128, 62_500, 1e-4, vec![31_250, 46_875], 128),
                Architecture::Vgg19 => (0.1, 128, 62_500, 1e-4, vec![31_250, 46_875], 1_280),
                Architecture::Resnet18 => (0.2, 256, 78_200, 1e-4, vec![39_100, 58_650], 2_560),
            };
        Self {
            data: arch.dataset().name.to_string(),
            lr,
            batch_size_train: batch,
            iterations,
            weight_decay: wd,
            momentum: 0.9,
            lr_decay: decay,
            batch_size_snip: snip,
            log_every: 1_000,
        }
    }

    /// Load from a JSON file.
    ///
    /// # Errors
    /// `Io` if the file cannot be read, `Serialization` if it is malformed.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }
}
