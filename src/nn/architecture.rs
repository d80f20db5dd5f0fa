//! The five reference architectures and their datasets.

use super::init::kaiming_normal;
use super::layer::{Conv2d, Dense, Layer, Residual};
use super::sequential::Sequential;
use crate::pruning::{PruningError, Result};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Reference architecture identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Architecture {
    /// 784-300-100-10 perceptron on MNIST.
    Lenet300100,
    /// Two 5x5 conv layers and three dense layers on CIFAR-10.
    Lenet5,
    /// VGG-16 on CIFAR-10.
    Vgg16,
    /// VGG-19 on CIFAR-100.
    Vgg19,
    /// ResNet-18 on Tiny ImageNet.
    Resnet18,
}

/// Input shape and class count of an architecture's dataset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DatasetSpec {
    pub name: &'static str,
    /// Per-sample shape (HWC for images).
    pub input_shape: &'static [usize],
    pub classes: usize,
}

/// How the prunable tensors of an architecture connect, as seen by the
/// rule-based effective-sparsity analysis.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wiring {
    /// Each tensor feeds the next one.
    Chain,
    /// Stem conv, residual blocks `[conv_a, conv_b, optional 1x1 projection]`,
    /// then the classifier.
    Residual,
}

impl Architecture {
    /// All architectures, in CLI help order.
    pub const ALL: [Architecture; 5] = [
        Architecture::Lenet300100,
        Architecture::Lenet5,
        Architecture::Vgg16,
        Architecture::Vgg19,
        Architecture::Resnet18,
    ];

    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Architecture::Lenet300100 => "lenet300100",
            Architecture::Lenet5 => "lenet5",
            Architecture::Vgg16 => "vgg16",
            Architecture::Vgg19 => "vgg19",
            Architecture::Resnet18 => "resnet18",
        }
    }

    #[must_use]
    pub fn dataset(self) -> DatasetSpec {
        match self {
            Architecture::Lenet300100 => DatasetSpec {
                name: "mnist",
                input_shape: &[28, 28, 1],
                classes: 10,
            },
            Architecture::Lenet5 | Architecture::Vgg16 => DatasetSpec {
                name: "cifar10",
                input_shape: &[32, 32, 3],
                classes: 10,
            },
            Architecture::Vgg19 => DatasetSpec {
                name: "cifar100",
                input_shape: &[32, 32, 3],
                classes: 100,
            },
            Architecture::Resnet18 => DatasetSpec {
                name: "tinyimagenet",
                input_shape: &[64, 64, 3],
                classes: 200,
            },
        }
    }

    #[must_use]
    pub fn wiring(self) -> Wiring {
        match self {
            Architecture::Resnet18 => Wiring::Residual,
            _ => Wiring::Chain,
        }
    }

    /// Build a freshly initialized network (Kaiming normal weights).
    ///
    /// # Errors
    /// `ShapeMismatch` if `spec.input_shape` is too small for the
    /// architecture's pooling and striding.
    pub fn build(self, spec: &NetworkSpec) -> Result<Sequential> {
        let mut b = Builder {
            rng: StdRng::seed_from_u64(spec.seed),
            divisor: spec.width_divisor.max(1),
        };
        let channels = spec.input_shape.last().copied().unwrap_or(1);
        let layers = match self {
            Architecture::Lenet300100 => {
                let inputs: usize = spec.input_shape.iter().product();
                let (h1, h2) = (b.width(300), b.width(100));
                vec![
                    Layer::Flatten,
                    b.dense(inputs, h1),
                    Layer::Relu,
                    b.dense(h1, h2),
                    Layer::Relu,
                    b.dense(h2, spec.classes),
                ]
            }
            Architecture::Lenet5 => {
                let (c1, c2) = (b.width(6), b.width(16));
                let (h, w) = spatial(&spec.input_shape);
                let flat = (h / 4) * (w / 4) * c2;
                let (d1, d2) = (b.width(120), b.width(84));
                vec![
                    b.conv(5, channels, c1, 1),
                    Layer::Relu,
                    Layer::AvgPool2d { size: 2 },
                    b.conv(5, c1, c2, 1),
                    Layer::Relu,
                    Layer::AvgPool2d { size: 2 },
                    Layer::Flatten,
                    b.dense(flat, d1),
                    Layer::Relu,
                    b.dense(d1, d2),
                    Layer::Relu,
                    b.dense(d2, spec.classes),
                ]
            }
            Architecture::Vgg16 | Architecture::Vgg19 => {
                let plan: &[usize] = if self == Architecture::Vgg16 {
                    &[2, 2, 3, 3, 3]
                } else {
                    &[2, 2, 4, 4, 4]
                };
                let widths = [64, 128, 256, 512, 512];
                let mut layers = Vec::new();
                let mut cin = channels;
                for (&convs, &width) in plan.iter().zip(&widths) {
                    let cout = b.width(width);
                    for _ in 0..convs {
                        layers.push(b.conv(3, cin, cout, 1));
                        layers.push(Layer::Relu);
                        cin = cout;
                    }
                    layers.push(Layer::AvgPool2d { size: 2 });
                }
                let (h, w) = spatial(&spec.input_shape);
                layers.push(Layer::Flatten);
                layers.push(b.dense((h / 32) * (w / 32) * cin, spec.classes));
                layers
            }
            Architecture::Resnet18 => {
                let mut layers = vec![b.conv(3, channels, b.width(64), 1), Layer::Relu];
                let mut cin = b.width(64);
                for (stage, &width) in [64, 128, 256, 512].iter().enumerate() {
                    let cout = b.width(width);
                    for block in 0..2 {
                        let stride = if stage > 0 && block == 0 { 2 } else { 1 };
                        let branch = vec![
                            b.conv(3, cin, cout, stride),
                            Layer::Relu,
                            b.conv(3, cout, cout, 1),
                        ];
                        let shortcut = (stride != 1 || cin != cout).then(|| b.conv2d(1, cin, cout, stride));
                        layers.push(Layer::Residual(Residual::new(branch, shortcut)));
                        cin = cout;
                    }
                }
                layers.push(Layer::GlobalAvgPool);
                layers.push(b.dense(cin, spec.classes));
                layers
            }
        };
        Sequential::new(self.name(), &spec.input_shape, layers)
    }
}

fn spatial(shape: &[usize]) -> (usize, usize) {
    match shape {
        [h, w, _] => (*h, *w),
        _ => (0, 0),
    }
}

struct Builder {
    rng: StdRng,
    divisor: usize,
}

impl Builder {
    fn width(&self, n: usize) -> usize {
        (n / self.divisor).max(1)
    }

    fn dense(&mut self, n_in: usize, n_out: usize) -> Layer {
        let w = kaiming_normal(&[n_in, n_out], n_in, &mut self.rng);
        Layer::Dense(Dense::new(w))
    }

    fn conv2d(&mut self, k: usize, cin: usize, cout: usize, stride: usize) -> Conv2d {
        let w = kaiming_normal(&[k, k, cin, cout], k * k * cin, &mut self.rng);
        Conv2d::new(w, stride)
    }

    fn conv(&mut self, k: usize, cin: usize, cout: usize, stride: usize) -> Layer {
        Layer::Conv2d(self.conv2d(k, cin, cout, stride))
    }
}

impl fmt::Display for Architecture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Architecture {
    type Err = PruningError;

    fn from_str(s: &str) -> Result<Self> {
        Architecture::ALL
            .into_iter()
            .find(|a| a.name() == s)
            .ok_or_else(|| PruningError::UnknownArchitecture {
                name: s.to_string(),
            })
    }
}

/// Construction parameters for [`Architecture::build`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkSpec {
    /// Per-sample input shape.
    pub input_shape: Vec<usize>,
    pub classes: usize,
    /// Divide every hidden width by this (minimum width 1). 1 = full size.
    pub width_divisor: usize,
    /// Seed for weight initialization.
    pub seed: u64,
}

impl NetworkSpec {
    /// Full-size network on the architecture's own dataset.
    #[must_use]
    pub fn for_architecture(arch: Architecture) -> Self {
        let data = arch.dataset();
        Self {
            input_shape: data.input_shape.to_vec(),
            classes: data.classes,
            width_divisor: 1,
            seed: 0,
        }
    }

    #[must_use]
    pub fn with_width_divisor(mut self, divisor: usize) -> Self {
        self.width_divisor = divisor;
        self
    }

    #[must_use]
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    #[must_use]
    pub fn with_input_shape(mut self, shape: &[usize]) -> Self {
        self.input_shape = shape.to_vec();
        self
    }

    #[must_use]
    pub fn with_classes(mut self, classes: usize) -> Self {
        self.classes = classes;
        self
    }
}
