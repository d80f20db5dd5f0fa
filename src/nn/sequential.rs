//! Layer stack implementing [`Network`].

use super::batch::argmax;
use super::layer::{Layer, Mode, Trace};
use super::{Network, Pass, PassOutput, PrunableTensor};
use crate::pruning::{PruningError, Result};
use crate::tensor::Tensor;

/// Ordered stack of bias-free layers.
///
/// Prunable tensors are enumerated in layer order; inside a residual block
/// the branch weights come first, then the projection shortcut.
///
/// # Example
///
/// ```
/// use effective_sparsity::nn::{Dense, Layer, Network, Sequential};
/// use effective_sparsity::tensor::Tensor;
///
/// let net = Sequential::new(
///     "tiny",
///     &[2],
///     vec![
///         Layer::Dense(Dense::new(Tensor::ones(&[2, 3]))),
///         Layer::Relu,
///         Layer::Dense(Dense::new(Tensor::ones(&[3, 2]))),
///     ],
/// )
/// .unwrap();
/// assert_eq!(net.num_prunable(), 2);
/// assert_eq!(net.classes(), 2);
/// ```
#[derive(Debug, Clone)]
pub struct Sequential {
    name: String,
    input_shape: Vec<usize>,
    classes: usize,
    layers: Vec<Layer>,
}

impl Sequential {
    /// Build a network, checking that the layers compose.
    ///
    /// # Errors
    /// `ShapeMismatch` if a layer cannot accept its input or the final output
    /// is not a flat class vector.
    pub fn new(name: impl Into<String>, input_shape: &[usize], layers: Vec<Layer>) -> Result<Self> {
        let mut shape = input_shape.to_vec();
        for layer in &layers {
            shape = layer.output_shape(&shape)?;
        }
        let classes = match shape.as_slice() {
            [c] => *c,
            _ => {
                return Err(PruningError::ShapeMismatch {
                    expected: vec![shape.iter().product()],
                    got: shape,
                })
            }
        };
        Ok(Self {
            name: name.into(),
            input_shape: input_shape.to_vec(),
            classes,
            layers,
        })
    }

    /// Per-sample input shape.
    #[must_use]
    pub fn input_shape(&self) -> &[usize] {
        &self.input_shape
    }

    /// Number of output classes.
    #[must_use]
    pub fn classes(&self) -> usize {
        self.classes
    }

    #[must_use]
    pub fn layers(&self) -> &[Layer] {
        &self.layers
    }

    /// Total number of prunable weights.
    #[must_use]
    pub fn num_parameters(&self) -> usize {
        self.layers
            .iter()
            .flat_map(Layer::weights)
            .map(Tensor::numel)
            .sum()
    }

    fn check_batch(&self, batch: &crate::nn::Batch) -> Result<()> {
        let got = batch.inputs().shape();
        if got.len() != self.input_shape.len() + 1 || got[1..] != self.input_shape[..] {
            let mut expected = vec![batch.len()];
            expected.extend_from_slice(&self.input_shape);
            return Err(PruningError::ShapeMismatch {
                expected,
                got: got.to_vec(),
            });
        }
        if batch.labels().last_dim() != self.classes {
            return Err(PruningError::ShapeMismatch {
                expected: vec![batch.len(), self.classes],
                got: batch.labels().shape().to_vec(),
            });
        }
        Ok(())
    }

    /// Forward through every layer. In flow mode the activations after each
    /// top-level weighted layer are divided by their (detached) maximum; the
    /// divisors are returned so backward can apply the same scaling.
    fn forward(&self, x: Tensor, mode: Mode) -> (Tensor, Vec<Trace>, Vec<f32>) {
        let mut traces = Vec::with_capacity(self.layers.len());
        let mut scales = Vec::with_capacity(self.layers.len());
        let mut h = x;
        for layer in &self.layers {
            let (mut out, trace) = layer.forward(h, mode);
            let mut scale = 1.0;
            if mode == Mode::Flow && layer.is_weighted() {
                let peak = out.max();
                if peak > 0.0 && peak.is_finite() {
                    scale = peak;
                    out = out.map(|v| v / peak);
                }
            }
            traces.push(trace);
            scales.push(scale);
            h = out;
        }
        (h, traces, scales)
    }

    fn backward(&self, traces: &[Trace], scales: &[f32], dy: Tensor, mode: Mode) -> Vec<Tensor> {
        let mut grads = Vec::new();
        let mut g = dy;
        for ((layer, trace), &scale) in self.layers.iter().zip(traces).zip(scales).rev() {
            if scale != 1.0 {
                g = g.map(|v| v / scale);
            }
            g = layer.backward(trace, g, mode, &mut grads);
        }
        grads.reverse();
        grads
    }

    fn loss_pass(&self, batch: &crate::nn::Batch) -> Result<PassOutput> {
        self.check_batch(batch)?;
        let n = batch.len();
        let (logits, traces, scales) = self.forward(batch.inputs().clone(), Mode::Train);
        let classes = self.classes;

        let mut loss = 0.0f32;
        let mut correct = 0;
        let mut dlogits = vec![0.0f32; logits.numel()];
        let inv_n = 1.0 / n.max(1) as f32;
        for ((z, y), dz) in logits
            .data()
            .chunks(classes)
            .zip(batch.labels().data().chunks(classes))
            .zip(dlogits.chunks_mut(classes))
        {
            let peak = z.iter().copied().fold(f32::NEG_INFINITY, f32::max);
            let sum_exp: f32 = z.iter().map(|v| (v - peak).exp()).sum();
            let lse = peak + sum_exp.ln();
            for i in 0..classes {
                let p = (z[i] - lse).exp();
                loss += y[i] * (lse - z[i]);
                dz[i] = (p - y[i]) * inv_n;
            }
            if argmax(z) == argmax(y) {
                correct += 1;
            }
        }
        loss *= inv_n;

        let gradients = self.backward(
            &traces,
            &scales,
            Tensor::from_vec(dlogits, logits.shape()),
            Mode::Train,
        );
        Ok(PassOutput {
            loss,
            correct,
            gradients,
        })
    }

    fn flow_pass(&self) -> PassOutput {
        let mut shape = vec![1];
        shape.extend_from_slice(&self.input_shape);
        let (out, traces, scales) = self.forward(Tensor::ones(&shape), Mode::Flow);
        let gradients = self.backward(&traces, &scales, Tensor::ones(out.shape()), Mode::Flow);
        PassOutput {
            loss: out.sum(),
            correct: 0,
            gradients,
        }
    }
}

impl Network for Sequential {
    fn name(&self) -> &str {
        &self.name
    }

    fn prunable(&self) -> Vec<PrunableTensor> {
        self.layers
            .iter()
            .flat_map(Layer::weights)
            .enumerate()
            .map(|(id, w)| PrunableTensor {
                id,
                shape: w.shape().to_vec(),
            })
            .collect()
    }

    fn weight(&self, id: usize) -> &Tensor {
        self.layers
            .iter()
            .flat_map(Layer::weights)
            .nth(id)
            .unwrap_or_else(|| panic!("no prunable tensor {id} in {}", self.name))
    }

    fn weight_mut(&mut self, id: usize) -> &mut Tensor {
        let name = self.name.clone();
        self.layers
            .iter_mut()
            .flat_map(Layer::weights_mut)
            .nth(id)
            .unwrap_or_else(|| panic!("no prunable tensor {id} in {name}"))
    }

    fn forward_backward(&mut self, pass: Pass<'_>) -> Result<PassOutput> {
        match pass {
            Pass::Loss(batch) => self.loss_pass(batch),
            Pass::Flow => Ok(self.flow_pass()),
        }
    }
}
