//! Direct and effective sparsity reports and their persisted artifacts.

use super::error::{PruningError, Result};
use super::mask::{direct_sparsities, overall_sparsity, Mask};
use crate::config::{rounded_compression, PruningType};
use crate::nn::Architecture;
use crate::tensor::Tensor;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Sparsity of one tensor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TensorSparsity {
    pub id: usize,
    /// Parameter count.
    pub params: usize,
    pub direct: f64,
    pub effective: f64,
}

/// Per-tensor and overall sparsity, overall values weighted by parameter
/// count.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SparsityReport {
    pub tensors: Vec<TensorSparsity>,
    pub overall_direct: f64,
    pub overall_effective: f64,
}

impl SparsityReport {
    /// Build a report from direct masks and their effective counterparts.
    ///
    /// # Errors
    /// - `ShapeMismatch` if the two mask sets do not line up
    /// - `InvalidMask` if an effective mask keeps a directly pruned weight
    pub fn new(masks: &[Mask], effective: &[Mask]) -> Result<Self> {
        if masks.len() != effective.len() {
            return Err(PruningError::ShapeMismatch {
                expected: vec![masks.len()],
                got: vec![effective.len()],
            });
        }
        for (id, (m, e)) in masks.iter().zip(effective).enumerate() {
            m.check_shape(e.shape())?;
            if !e.is_subset_of(m) {
                return Err(PruningError::InvalidMask {
                    reason: format!("effective mask {id} keeps a pruned weight"),
                });
            }
        }
        let tensors = masks
            .iter()
            .zip(effective)
            .enumerate()
            .map(|(id, (m, e))| TensorSparsity {
                id,
                params: m.numel(),
                direct: m.sparsity(),
                effective: e.sparsity(),
            })
            .collect();
        Ok(Self {
            tensors,
            overall_direct: overall_sparsity(masks),
            overall_effective: overall_sparsity(effective),
        })
    }

    /// Parameter count per tensor.
    #[must_use]
    pub fn counts(&self) -> Vec<usize> {
        self.tensors.iter().map(|t| t.params).collect()
    }
}

/// Shorthand for [`SparsityReport::new`].
///
/// # Errors
/// See [`SparsityReport::new`].
pub fn report(masks: &[Mask], effective: &[Mask]) -> Result<SparsityReport> {
    SparsityReport::new(masks, effective)
}

/// Writes run artifacts as JSON.
///
/// Files land in `<out>/<architecture>/<pruner>/<pruning_type>/` with the
/// prefix `<seed>_<compression>_`; parameter counts go to
/// `<out>/<architecture>/dense/counts.json`. The dense baseline has no
/// pruning-type directory.
#[derive(Debug, Clone)]
pub struct ArtifactWriter {
    run_dir: PathBuf,
    dense_dir: PathBuf,
    prefix: String,
}

impl ArtifactWriter {
    #[must_use]
    pub fn new(
        out: impl AsRef<Path>,
        architecture: Architecture,
        pruner: &str,
        pruning_type: PruningType,
        seed: u64,
        target_sparsity: f64,
    ) -> Self {
        let arch_dir = out.as_ref().join(architecture.name());
        let dense_dir = arch_dir.join("dense");
        let run_dir = if pruner == "dense" {
            dense_dir.clone()
        } else {
            pruner
                .split('/')
                .fold(arch_dir, |dir, part| dir.join(part))
                .join(pruning_type.as_str())
        };
        Self {
            run_dir,
            dense_dir,
            prefix: format!("{seed}_{}_", rounded_compression(target_sparsity)),
        }
    }

    #[must_use]
    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    #[must_use]
    pub fn dense_dir(&self) -> &Path {
        &self.dense_dir
    }

    /// Path of run artifact `name`.
    #[must_use]
    pub fn path(&self, name: &str) -> PathBuf {
        self.run_dir.join(format!("{}{name}", self.prefix))
    }

    fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<PathBuf> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, serde_json::to_string(value)?)?;
        tracing::debug!(path = %path.display(), "artifact written");
        Ok(path.to_path_buf())
    }

    /// Per-tensor direct sparsities.
    pub fn write_direct(&self, masks: &[Mask]) -> Result<PathBuf> {
        Self::write_json(&self.path("sparsities_direct.json"), &direct_sparsities(masks))
    }

    /// Per-tensor effective sparsities from the flow analysis.
    pub fn write_effective_flow(&self, effective: &[Mask]) -> Result<PathBuf> {
        Self::write_json(
            &self.path("sparsities_effective_synflow.json"),
            &direct_sparsities(effective),
        )
    }

    /// Per-tensor effective sparsities from the rule-based analysis.
    pub fn write_effective_rule(&self, effective: &[Mask]) -> Result<PathBuf> {
        Self::write_json(
            &self.path("sparsities_effective_custom.json"),
            &direct_sparsities(effective),
        )
    }

    /// Parameter count per tensor, shared by every run of the architecture.
    pub fn write_counts(&self, masks: &[Mask]) -> Result<PathBuf> {
        let counts: Vec<usize> = masks.iter().map(Mask::numel).collect();
        Self::write_json(&self.dense_dir.join("counts.json"), &counts)
    }

    /// Full report with overall values.
    pub fn write_report(&self, report: &SparsityReport) -> Result<PathBuf> {
        Self::write_json(&self.path("report.json"), report)
    }

    pub fn write_accuracies(&self, accuracies: &[f32]) -> Result<PathBuf> {
        Self::write_json(&self.path("accuracies.json"), accuracies)
    }

    pub fn write_losses(&self, losses: &[f32]) -> Result<PathBuf> {
        Self::write_json(&self.path("losses.json"), losses)
    }

    /// Initial weights of the dense baseline.
    pub fn write_inits(&self, weights: &[Tensor]) -> Result<PathBuf> {
        Self::write_json(&self.path("inits.json"), weights)
    }

    /// Trained weights of the dense baseline.
    pub fn write_final_weights(&self, weights: &[Tensor]) -> Result<PathBuf> {
        Self::write_json(&self.path("final_weights.json"), weights)
    }
}
