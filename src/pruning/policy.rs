//! Pruning policy names.
//!
//! A policy name such as `magnitude/erk` resolves once, before any
//! computation, into a [`Policy`]: a scoring rule, a distribution and an
//! explicit round count.

use super::error::{PruningError, Result};
use crate::config::PruningConfig;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Every recognized policy name.
pub const POLICY_NAMES: [&str; 15] = [
    "dense",
    "lamp",
    "snip",
    "snip/iterative",
    "synflow",
    "random/uniform",
    "random/erk",
    "random/igq",
    "random/uniform_plus",
    "random/synflow",
    "magnitude/global",
    "magnitude/uniform",
    "magnitude/erk",
    "magnitude/igq",
    "magnitude/uniform_plus",
];

/// Per-weight importance rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScoreRule {
    /// I.i.d. uniform scores from a seeded generator.
    Random,
    /// `|w|`.
    Magnitude,
    /// `|dL/dw * w|` on one batch.
    Snip,
    /// `dR/dw * w` on the linearized absolute-valued network.
    Synflow,
    /// Layer-adaptive magnitude.
    Lamp,
}

/// How a global target is split across tensors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Distribution {
    Uniform,
    /// One pooled rank cut over all tensors.
    Global,
    /// Erdős–Rényi-kernel.
    Erk,
    /// Ideal gas quotas.
    Igq,
    /// Uniform with the first and last tensors kept dense.
    UniformPlus,
    /// Per-tensor counts copied from a `synflow` run.
    Synflow,
}

impl Distribution {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Distribution::Uniform => "uniform",
            Distribution::Global => "global",
            Distribution::Erk => "erk",
            Distribution::Igq => "igq",
            Distribution::UniformPlus => "uniform_plus",
            Distribution::Synflow => "synflow",
        }
    }
}

/// A resolved policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Policy {
    /// Canonical policy name.
    pub name: String,
    pub rule: ScoreRule,
    pub distribution: Distribution,
    /// Scoring rounds; zero means nothing is pruned.
    pub rounds: usize,
}

impl Policy {
    /// Resolve `name`, taking round counts from `config`.
    ///
    /// # Errors
    /// `UnknownPolicy` if `name` is not one of [`POLICY_NAMES`].
    pub fn resolve(name: &str, config: &PruningConfig) -> Result<Self> {
        use Distribution as D;
        use ScoreRule as R;

        let (rule, distribution, rounds) = match name {
            "dense" => (R::Magnitude, D::Uniform, 0),
            "lamp" => (R::Lamp, D::Global, 1),
            "snip" => (R::Snip, D::Global, 1),
            "snip/iterative" => (R::Snip, D::Global, config.snip_rounds.max(1)),
            "synflow" => (R::Synflow, D::Global, config.synflow_rounds.max(1)),
            _ => {
                let (rule, dist) = name.split_once('/').ok_or_else(|| unknown(name))?;
                let rule = match rule {
                    "random" => R::Random,
                    "magnitude" => R::Magnitude,
                    _ => return Err(unknown(name)),
                };
                let dist = match (rule, dist) {
                    (_, "uniform") => D::Uniform,
                    (_, "erk") => D::Erk,
                    (_, "igq") => D::Igq,
                    (_, "uniform_plus") => D::UniformPlus,
                    (R::Random, "synflow") => D::Synflow,
                    (R::Magnitude, "global") => D::Global,
                    _ => return Err(unknown(name)),
                };
                (rule, dist, 1)
            }
        };

        Ok(Self {
            name: name.to_string(),
            rule,
            distribution,
            rounds,
        })
    }

    /// `true` for the `dense` baseline.
    #[must_use]
    pub fn is_dense(&self) -> bool {
        self.rounds == 0
    }

    /// Whether scoring needs a data batch.
    #[must_use]
    pub fn needs_data(&self) -> bool {
        self.rule == ScoreRule::Snip && !self.is_dense()
    }
}

impl fmt::Display for Policy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

fn unknown(name: &str) -> PruningError {
    PruningError::UnknownPolicy {
        name: name.to_string(),
        known: POLICY_NAMES.join(", "),
    }
}
