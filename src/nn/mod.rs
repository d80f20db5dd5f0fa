//! Network collaborator interface and a bias-free reference implementation.
//!
//! The pruning core only ever talks to a model through the [`Network`]
//! trait: an ordered list of prunable weight tensors, read/write access to
//! them, and one forward/backward evaluation per [`Pass`]. Anything that can
//! provide those three things can be pruned, enforced and analysed.
//!
//! [`Sequential`] is the in-crate implementation used by the command line
//! driver and the tests. It supports dense, convolutional, pooling, flatten,
//! ReLU and residual blocks, which is enough to express the five reference
//! architectures in [`Architecture`].
//!
//! # Layout
//!
//! - dense weights: `[in_features, out_features]`
//! - conv weights: `[kernel_h, kernel_w, in_channels, out_channels]`
//! - images: NHWC

mod architecture;
mod batch;
mod init;
mod layer;
pub mod optim;
mod sequential;

pub use architecture::{Architecture, DatasetSpec, NetworkSpec, Wiring};
pub use batch::{Batch, BatchCycle, BatchSource};
pub use init::{kaiming_normal, kaiming_uniform, xavier_uniform};
pub use layer::{Conv2d, Dense, Layer, Residual};
pub use sequential::Sequential;

use crate::pruning::Result;
use crate::tensor::Tensor;

/// Identifies one prunable weight tensor by stable index and shape.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrunableTensor {
    /// Position in the network's prunable-tensor order.
    pub id: usize,
    /// Fixed shape of the weight tensor.
    pub shape: Vec<usize>,
}

impl PrunableTensor {
    /// Number of weights in the tensor.
    #[must_use]
    pub fn numel(&self) -> usize {
        self.shape.iter().product()
    }
}

/// Kind of evaluation requested from a network.
#[derive(Debug, Clone, Copy)]
pub enum Pass<'a> {
    /// Softmax cross-entropy against the batch labels, averaged over the batch.
    Loss(&'a Batch),
    /// Linearized pass: nonlinearities act as identity, the input is a single
    /// all-ones sample and the objective is the sum of all outputs.
    Flow,
}

/// Result of one forward/backward evaluation.
#[derive(Debug, Clone)]
pub struct PassOutput {
    /// Objective value (cross-entropy, or the flow sum).
    pub loss: f32,
    /// Correctly classified samples (always 0 for [`Pass::Flow`]).
    pub correct: usize,
    /// Gradient of the objective for each prunable tensor, in tensor order.
    pub gradients: Vec<Tensor>,
}

/// Read/write view over a model's prunable weights plus gradient evaluation.
///
/// Implementations must keep the tensor order and shapes fixed for their
/// lifetime; masks are matched to tensors by position.
pub trait Network {
    /// Human-readable model name.
    fn name(&self) -> &str;

    /// Ordered prunable tensors.
    fn prunable(&self) -> Vec<PrunableTensor>;

    /// Weight tensor `id`.
    ///
    /// # Panics
    /// May panic if `id` is out of range.
    fn weight(&self, id: usize) -> &Tensor;

    /// Mutable weight tensor `id`.
    ///
    /// # Panics
    /// May panic if `id` is out of range.
    fn weight_mut(&mut self, id: usize) -> &mut Tensor;

    /// Run one forward and backward evaluation.
    fn forward_backward(&mut self, pass: Pass<'_>) -> Result<PassOutput>;

    /// Number of prunable tensors.
    fn num_prunable(&self) -> usize {
        self.prunable().len()
    }

    /// Copies of every prunable weight tensor.
    fn snapshot(&self) -> Vec<Tensor> {
        (0..self.num_prunable())
            .map(|id| self.weight(id).clone())
            .collect()
    }

    /// Overwrite every prunable weight tensor from a snapshot.
    fn restore(&mut self, snapshot: &[Tensor]) {
        for (id, t) in snapshot.iter().enumerate() {
            *self.weight_mut(id) = t.clone();
        }
    }
}
