//! Input batches and the data collaborator interface.

use crate::pruning::{PruningError, Result};
use crate::tensor::Tensor;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// A batch of inputs with one-hot labels.
#[derive(Debug, Clone)]
pub struct Batch {
    inputs: Tensor,
    labels: Tensor,
}

impl Batch {
    /// Pair `inputs` `[n, ...]` with one-hot `labels` `[n, classes]`.
    ///
    /// # Errors
    /// `ShapeMismatch` if the leading dimensions differ or labels are not 2-D.
    pub fn new(inputs: Tensor, labels: Tensor) -> Result<Self> {
        let n = inputs.shape().first().copied().unwrap_or(0);
        if labels.ndim() != 2 || labels.shape()[0] != n {
            return Err(PruningError::ShapeMismatch {
                expected: vec![n, labels.last_dim()],
                got: labels.shape().to_vec(),
            });
        }
        Ok(Self { inputs, labels })
    }

    /// Random inputs in `[-1, 1)` with uniformly drawn classes.
    ///
    /// Stands in for a real data pipeline in tests and in the CLI.
    #[must_use]
    pub fn synthetic(input_shape: &[usize], classes: usize, size: usize, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut shape = vec![size];
        shape.extend_from_slice(input_shape);
        let numel: usize = shape.iter().product();
        let inputs: Vec<f32> = (0..numel).map(|_| rng.gen_range(-1.0..1.0)).collect();
        let mut labels = vec![0.0f32; size * classes];
        for row in labels.chunks_mut(classes.max(1)) {
            if classes > 0 {
                row[rng.gen_range(0..classes)] = 1.0;
            }
        }
        Self {
            inputs: Tensor::from_vec(inputs, &shape),
            labels: Tensor::from_vec(labels, &[size, classes]),
        }
    }

    #[must_use]
    pub fn inputs(&self) -> &Tensor {
        &self.inputs
    }

    #[must_use]
    pub fn labels(&self) -> &Tensor {
        &self.labels
    }

    /// Number of samples.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inputs.shape().first().copied().unwrap_or(0)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Class index of each label row.
    #[must_use]
    pub fn classes(&self) -> Vec<usize> {
        self.labels
            .data()
            .chunks(self.labels.last_dim().max(1))
            .map(argmax)
            .collect()
    }
}

pub(crate) fn argmax(row: &[f32]) -> usize {
    row.iter()
        .enumerate()
        .fold((0, f32::NEG_INFINITY), |(bi, bv), (i, &v)| {
            if v > bv {
                (i, v)
            } else {
                (bi, bv)
            }
        })
        .0
}

/// Supplier of data batches.
pub trait BatchSource {
    /// Next batch, or `None` when the source is exhausted or empty.
    fn next_batch(&mut self) -> Option<Batch>;
}

/// Cycles endlessly through a fixed set of batches.
#[derive(Debug, Clone)]
pub struct BatchCycle {
    batches: Vec<Batch>,
    next: usize,
}

impl BatchCycle {
    #[must_use]
    pub fn new(batches: Vec<Batch>) -> Self {
        Self { batches, next: 0 }
    }
}

impl BatchSource for BatchCycle {
    fn next_batch(&mut self) -> Option<Batch> {
        if self.batches.is_empty() {
            return None;
        }
        let batch = self.batches[self.next % self.batches.len()].clone();
        self.next += 1;
        Some(batch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_synthetic_is_seeded() {
        let a = Batch::synthetic(&[4], 3, 5, 11);
        let b = Batch::synthetic(&[4], 3, 5, 11);
        assert_eq!(a.inputs(), b.inputs());
        assert_eq!(a.labels(), b.labels());
        assert_eq!(a.len(), 5);
        assert_eq!(a.inputs().shape(), &[5, 4]);
    }

    #[test]
    fn test_synthetic_labels_are_one_hot() {
        let batch = Batch::synthetic(&[2], 4, 8, 3);
        for row in batch.labels().data().chunks(4) {
            assert!((row.iter().sum::<f32>() - 1.0).abs() < 1e-6);
        }
        assert_eq!(batch.classes().len(), 8);
    }

    #[test]
    fn test_new_rejects_mismatched_labels() {
        let inputs = Tensor::zeros(&[3, 2]);
        let labels = Tensor::zeros(&[2, 2]);
        assert!(matches!(
            Batch::new(inputs, labels),
            Err(PruningError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_cycle_wraps_and_empty_yields_none() {
        let mut cycle = BatchCycle::new(vec![
            Batch::synthetic(&[1], 2, 1, 1),
            Batch::synthetic(&[1], 2, 1, 2),
        ]);
        let first = cycle.next_batch().unwrap();
        let _ = cycle.next_batch().unwrap();
        let third = cycle.next_batch().unwrap();
        assert_eq!(first.inputs(), third.inputs());

        let mut empty = BatchCycle::new(Vec::new());
        assert!(empty.next_batch().is_none());
    }

    #[test]
    fn test_argmax_first_max_wins() {
        assert_eq!(argmax(&[0.1, 0.7, 0.7]), 1);
        assert_eq!(argmax(&[]), 0);
    }
}
