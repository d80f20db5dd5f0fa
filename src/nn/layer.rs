//! Bias-free layers with explicit forward and backward passes.
//!
//! Each forward call returns a [`Trace`] holding what the matching backward
//! call needs. Backward pushes weight gradients onto a shared list in
//! *reverse* weight order; [`super::Sequential`] reverses the list once at
//! the end.

use crate::pruning::{PruningError, Result};
use crate::tensor::Tensor;

/// Evaluation mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Mode {
    /// Regular network: ReLU active.
    Train,
    /// Linearized network: ReLU acts as identity.
    Flow,
}

/// Saved forward state for one layer.
#[derive(Debug, Clone)]
pub(crate) enum Trace {
    /// The layer input (dense, conv, ReLU).
    Input(Tensor),
    /// Only the input shape is needed (pooling, flatten).
    Shape(Vec<usize>),
    /// Residual block state.
    Residual {
        branch: Vec<Trace>,
        input: Tensor,
        sum: Tensor,
    },
}

fn shape_error(expected: &[usize], got: &[usize]) -> PruningError {
    PruningError::ShapeMismatch {
        expected: expected.to_vec(),
        got: got.to_vec(),
    }
}

/// Fully connected layer: `y = x W`, weight `[in_features, out_features]`.
#[derive(Debug, Clone)]
pub struct Dense {
    pub(crate) weight: Tensor,
}

impl Dense {
    /// # Panics
    /// Panics if `weight` is not 2-D.
    #[must_use]
    pub fn new(weight: Tensor) -> Self {
        assert_eq!(weight.ndim(), 2, "Dense weight must be 2-D");
        Self { weight }
    }

    #[must_use]
    pub fn in_features(&self) -> usize {
        self.weight.shape()[0]
    }

    #[must_use]
    pub fn out_features(&self) -> usize {
        self.weight.shape()[1]
    }

    fn forward(&self, x: &Tensor) -> Tensor {
        let (n_in, n_out) = (self.in_features(), self.out_features());
        let batch = x.numel() / n_in;
        let w = self.weight.data();
        let mut y = vec![0.0f32; batch * n_out];
        for (xr, yr) in x.data().chunks(n_in).zip(y.chunks_mut(n_out)) {
            for (i, &xv) in xr.iter().enumerate() {
                if xv == 0.0 {
                    continue;
                }
                for (yv, &wv) in yr.iter_mut().zip(&w[i * n_out..(i + 1) * n_out]) {
                    *yv += xv * wv;
                }
            }
        }
        Tensor::from_vec(y, &[batch, n_out])
    }

    /// Returns `(dx, dw)`.
    fn backward(&self, x: &Tensor, dy: &Tensor) -> (Tensor, Tensor) {
        let (n_in, n_out) = (self.in_features(), self.out_features());
        let w = self.weight.data();
        let mut dw = vec![0.0f32; n_in * n_out];
        let mut dx = vec![0.0f32; x.numel()];
        for ((xr, dyr), dxr) in x
            .data()
            .chunks(n_in)
            .zip(dy.data().chunks(n_out))
            .zip(dx.chunks_mut(n_in))
        {
            for i in 0..n_in {
                let row = i * n_out..(i + 1) * n_out;
                let xv = xr[i];
                let mut acc = 0.0f32;
                for ((dwv, &wv), &g) in dw[row.clone()].iter_mut().zip(&w[row]).zip(dyr) {
                    *dwv += xv * g;
                    acc += wv * g;
                }
                dxr[i] = acc;
            }
        }
        (
            Tensor::from_vec(dx, x.shape()),
            Tensor::from_vec(dw, self.weight.shape()),
        )
    }
}

/// 2-D convolution over NHWC input with "same"-style padding `(k - 1) / 2`.
///
/// Weight layout `[kernel_h, kernel_w, in_channels, out_channels]`.
#[derive(Debug, Clone)]
pub struct Conv2d {
    pub(crate) weight: Tensor,
    stride: usize,
}

impl Conv2d {
    /// # Panics
    /// Panics if `weight` is not 4-D or `stride` is zero.
    #[must_use]
    pub fn new(weight: Tensor, stride: usize) -> Self {
        assert_eq!(weight.ndim(), 4, "Conv2d weight must be 4-D");
        assert!(stride > 0, "Conv2d stride must be positive");
        Self { weight, stride }
    }

    fn dims(&self) -> (usize, usize, usize, usize) {
        let s = self.weight.shape();
        (s[0], s[1], s[2], s[3])
    }

    #[must_use]
    pub fn in_channels(&self) -> usize {
        self.dims().2
    }

    #[must_use]
    pub fn out_channels(&self) -> usize {
        self.dims().3
    }

    #[must_use]
    pub fn stride(&self) -> usize {
        self.stride
    }

    fn out_size(&self, size: usize, kernel: usize) -> Option<usize> {
        let padded = size + 2 * ((kernel - 1) / 2);
        (padded >= kernel).then(|| (padded - kernel) / self.stride + 1)
    }

    fn output_shape(&self, input: &[usize]) -> Result<Vec<usize>> {
        let (kh, kw, ci, co) = self.dims();
        match input {
            [h, w, c] if *c == ci => match (self.out_size(*h, kh), self.out_size(*w, kw)) {
                (Some(oh), Some(ow)) => Ok(vec![oh, ow, co]),
                _ => Err(shape_error(&[kh, kw, ci], input)),
            },
            _ => Err(shape_error(&[0, 0, ci], input)),
        }
    }

    /// Visit every (input offset, output offset, weight offset) triple of one
    /// kernel application, channel loops excluded.
    fn for_each_tap(&self, x_shape: &[usize], mut f: impl FnMut(usize, usize, usize)) {
        let (kh, kw, ci, co) = self.dims();
        let (batch, h, w) = (x_shape[0], x_shape[1], x_shape[2]);
        let (ph, pw) = ((kh - 1) / 2, (kw - 1) / 2);
        let oh = self.out_size(h, kh).unwrap_or(0);
        let ow = self.out_size(w, kw).unwrap_or(0);
        for b in 0..batch {
            for oy in 0..oh {
                for ox in 0..ow {
                    let y_off = ((b * oh + oy) * ow + ox) * co;
                    for ky in 0..kh {
                        let iy = oy * self.stride + ky;
                        if iy < ph || iy - ph >= h {
                            continue;
                        }
                        for kx in 0..kw {
                            let ix = ox * self.stride + kx;
                            if ix < pw || ix - pw >= w {
                                continue;
                            }
                            let x_off = ((b * h + iy - ph) * w + ix - pw) * ci;
                            let w_off = (ky * kw + kx) * ci * co;
                            f(x_off, y_off, w_off);
                        }
                    }
                }
            }
        }
    }

    fn forward(&self, x: &Tensor) -> Tensor {
        let (kh, kw, ci, co) = self.dims();
        let (h, w) = (x.shape()[1], x.shape()[2]);
        let oh = self.out_size(h, kh).unwrap_or(0);
        let ow = self.out_size(w, kw).unwrap_or(0);
        let mut y = vec![0.0f32; x.shape()[0] * oh * ow * co];
        let (xd, wd) = (x.data(), self.weight.data());
        self.for_each_tap(x.shape(), |x_off, y_off, w_off| {
            for c in 0..ci {
                let xv = xd[x_off + c];
                if xv == 0.0 {
                    continue;
                }
                let wrow = &wd[w_off + c * co..w_off + (c + 1) * co];
                for (yv, &wv) in y[y_off..y_off + co].iter_mut().zip(wrow) {
                    *yv += xv * wv;
                }
            }
        });
        Tensor::from_vec(y, &[x.shape()[0], oh, ow, co])
    }

    /// Returns `(dx, dw)`.
    fn backward(&self, x: &Tensor, dy: &Tensor) -> (Tensor, Tensor) {
        let (_, _, ci, co) = self.dims();
        let mut dx = vec![0.0f32; x.numel()];
        let mut dw = vec![0.0f32; self.weight.numel()];
        let (xd, wd, dyd) = (x.data(), self.weight.data(), dy.data());
        self.for_each_tap(x.shape(), |x_off, y_off, w_off| {
            let g = &dyd[y_off..y_off + co];
            for c in 0..ci {
                let xv = xd[x_off + c];
                let row = w_off + c * co..w_off + (c + 1) * co;
                let mut acc = 0.0f32;
                for ((dwv, &wv), &gv) in dw[row.clone()].iter_mut().zip(&wd[row]).zip(g) {
                    *dwv += xv * gv;
                    acc += wv * gv;
                }
                dx[x_off + c] += acc;
            }
        });
        (
            Tensor::from_vec(dx, x.shape()),
            Tensor::from_vec(dw, self.weight.shape()),
        )
    }
}

/// Residual block: `relu(branch(x) + shortcut(x))`.
///
/// The shortcut is the identity unless a projection convolution is given.
/// Prunable weight order: branch weights in layer order, then the projection.
#[derive(Debug, Clone)]
pub struct Residual {
    pub(crate) branch: Vec<Layer>,
    pub(crate) shortcut: Option<Conv2d>,
}

impl Residual {
    #[must_use]
    pub fn new(branch: Vec<Layer>, shortcut: Option<Conv2d>) -> Self {
        Self { branch, shortcut }
    }
}

/// One network layer.
#[derive(Debug, Clone)]
pub enum Layer {
    Dense(Dense),
    Conv2d(Conv2d),
    /// Non-overlapping average pooling with a square window.
    AvgPool2d {
        size: usize,
    },
    /// Mean over the spatial axes: `[H, W, C] -> [C]`.
    GlobalAvgPool,
    Flatten,
    Relu,
    Residual(Residual),
}

impl Layer {
    /// Whether this layer owns prunable weights.
    #[must_use]
    pub fn is_weighted(&self) -> bool {
        matches!(self, Layer::Dense(_) | Layer::Conv2d(_) | Layer::Residual(_))
    }

    pub(crate) fn weights(&self) -> Vec<&Tensor> {
        match self {
            Layer::Dense(d) => vec![&d.weight],
            Layer::Conv2d(c) => vec![&c.weight],
            Layer::Residual(r) => {
                let mut out: Vec<&Tensor> = r.branch.iter().flat_map(Layer::weights).collect();
                if let Some(c) = &r.shortcut {
                    out.push(&c.weight);
                }
                out
            }
            _ => Vec::new(),
        }
    }

    pub(crate) fn weights_mut(&mut self) -> Vec<&mut Tensor> {
        match self {
            Layer::Dense(d) => vec![&mut d.weight],
            Layer::Conv2d(c) => vec![&mut c.weight],
            Layer::Residual(r) => {
                let mut out: Vec<&mut Tensor> =
                    r.branch.iter_mut().flat_map(Layer::weights_mut).collect();
                if let Some(c) = &mut r.shortcut {
                    out.push(&mut c.weight);
                }
                out
            }
            _ => Vec::new(),
        }
    }

    /// Output shape (without batch axis) for an input of shape `input`.
    pub(crate) fn output_shape(&self, input: &[usize]) -> Result<Vec<usize>> {
        match self {
            Layer::Dense(d) => match input {
                [n] if *n == d.in_features() => Ok(vec![d.out_features()]),
                _ => Err(shape_error(&[d.in_features()], input)),
            },
            Layer::Conv2d(c) => c.output_shape(input),
            Layer::AvgPool2d { size } => match input {
                [h, w, c] if *size > 0 && h >= size && w >= size => {
                    Ok(vec![h / size, w / size, *c])
                }
                _ => Err(shape_error(&[*size, *size, 0], input)),
            },
            Layer::GlobalAvgPool => match input {
                [_, _, c] => Ok(vec![*c]),
                _ => Err(shape_error(&[0, 0, 0], input)),
            },
            Layer::Flatten => Ok(vec![input.iter().product()]),
            Layer::Relu => Ok(input.to_vec()),
            Layer::Residual(r) => {
                let mut shape = input.to_vec();
                for layer in &r.branch {
                    shape = layer.output_shape(&shape)?;
                }
                let short = match &r.shortcut {
                    Some(c) => c.output_shape(input)?,
                    None => input.to_vec(),
                };
                if short != shape {
                    return Err(shape_error(&shape, &short));
                }
                Ok(shape)
            }
        }
    }

    pub(crate) fn forward(&self, x: Tensor, mode: Mode) -> (Tensor, Trace) {
        match self {
            Layer::Dense(d) => (d.forward(&x), Trace::Input(x)),
            Layer::Conv2d(c) => (c.forward(&x), Trace::Input(x)),
            Layer::AvgPool2d { size } => {
                let y = avg_pool(&x, *size);
                (y, Trace::Shape(x.shape().to_vec()))
            }
            Layer::GlobalAvgPool => {
                let s = x.shape();
                let y = avg_pool_window(&x, s[1], s[2]);
                let y = y.reshape(&[s[0], s[3]]);
                (y, Trace::Shape(s.to_vec()))
            }
            Layer::Flatten => {
                let shape = x.shape().to_vec();
                let batch = shape[0];
                let rest: usize = shape[1..].iter().product();
                (x.reshape(&[batch, rest]), Trace::Shape(shape))
            }
            Layer::Relu => match mode {
                Mode::Train => (x.map(|v| v.max(0.0)), Trace::Input(x)),
                Mode::Flow => {
                    let shape = x.shape().to_vec();
                    (x, Trace::Shape(shape))
                }
            },
            Layer::Residual(r) => {
                let mut h = x.clone();
                let mut branch = Vec::with_capacity(r.branch.len());
                for layer in &r.branch {
                    let (out, trace) = layer.forward(h, mode);
                    branch.push(trace);
                    h = out;
                }
                match &r.shortcut {
                    Some(c) => h.add_assign(&c.forward(&x)),
                    None => h.add_assign(&x),
                }
                let out = match mode {
                    Mode::Train => h.map(|v| v.max(0.0)),
                    Mode::Flow => h.clone(),
                };
                (
                    out,
                    Trace::Residual {
                        branch,
                        input: x,
                        sum: h,
                    },
                )
            }
        }
    }

    /// Propagate `dy` back through the layer, pushing weight gradients in
    /// reverse weight order. Returns the input gradient.
    pub(crate) fn backward(
        &self,
        trace: &Trace,
        dy: Tensor,
        mode: Mode,
        grads: &mut Vec<Tensor>,
    ) -> Tensor {
        match (self, trace) {
            (Layer::Dense(d), Trace::Input(x)) => {
                let (dx, dw) = d.backward(x, &dy);
                grads.push(dw);
                dx
            }
            (Layer::Conv2d(c), Trace::Input(x)) => {
                let (dx, dw) = c.backward(x, &dy);
                grads.push(dw);
                dx
            }
            (Layer::AvgPool2d { size }, Trace::Shape(shape)) => {
                avg_pool_backward(&dy, shape, *size, *size)
            }
            (Layer::GlobalAvgPool, Trace::Shape(shape)) => {
                let pooled = dy.reshape(&[shape[0], 1, 1, shape[3]]);
                avg_pool_backward(&pooled, shape, shape[1], shape[2])
            }
            (Layer::Flatten, Trace::Shape(shape)) => dy.reshape(shape),
            (Layer::Relu, Trace::Input(x)) => relu_backward(&dy, x),
            (Layer::Relu, Trace::Shape(_)) => dy,
            (
                Layer::Residual(r),
                Trace::Residual {
                    branch,
                    input,
                    sum,
                },
            ) => {
                let dz = match mode {
                    Mode::Train => relu_backward(&dy, sum),
                    Mode::Flow => dy,
                };
                let mut dx = match &r.shortcut {
                    Some(c) => {
                        let (dxs, dw) = c.backward(input, &dz);
                        grads.push(dw);
                        dxs
                    }
                    None => dz.clone(),
                };
                let mut g = dz;
                for (layer, t) in r.branch.iter().zip(branch).rev() {
                    g = layer.backward(t, g, mode, grads);
                }
                dx.add_assign(&g);
                dx
            }
            (layer, _) => unreachable!("trace does not belong to layer {layer:?}"),
        }
    }
}

fn relu_backward(dy: &Tensor, pre: &Tensor) -> Tensor {
    let data = dy
        .data()
        .iter()
        .zip(pre.data())
        .map(|(&g, &x)| if x > 0.0 { g } else { 0.0 })
        .collect();
    Tensor::from_vec(data, dy.shape())
}

fn avg_pool(x: &Tensor, size: usize) -> Tensor {
    avg_pool_window(x, size, size)
}

/// Non-overlapping `wh x ww` average pooling over NHWC input.
fn avg_pool_window(x: &Tensor, wh: usize, ww: usize) -> Tensor {
    let s = x.shape();
    let (batch, h, w, c) = (s[0], s[1], s[2], s[3]);
    let (oh, ow) = (h / wh, w / ww);
    let scale = 1.0 / (wh * ww) as f32;
    let xd = x.data();
    let mut y = vec![0.0f32; batch * oh * ow * c];
    for b in 0..batch {
        for oy in 0..oh {
            for ox in 0..ow {
                let y_off = ((b * oh + oy) * ow + ox) * c;
                for ky in 0..wh {
                    for kx in 0..ww {
                        let x_off = ((b * h + oy * wh + ky) * w + ox * ww + kx) * c;
                        for ch in 0..c {
                            y[y_off + ch] += xd[x_off + ch] * scale;
                        }
                    }
                }
            }
        }
    }
    Tensor::from_vec(y, &[batch, oh, ow, c])
}

fn avg_pool_backward(dy: &Tensor, input_shape: &[usize], wh: usize, ww: usize) -> Tensor {
    let (batch, h, w, c) = (input_shape[0], input_shape[1], input_shape[2], input_shape[3]);
    let (oh, ow) = (h / wh, w / ww);
    let scale = 1.0 / (wh * ww) as f32;
    let gd = dy.data();
    let mut dx = vec![0.0f32; batch * h * w * c];
    for b in 0..batch {
        for oy in 0..oh {
            for ox in 0..ow {
                let y_off = ((b * oh + oy) * ow + ox) * c;
                for ky in 0..wh {
                    for kx in 0..ww {
                        let x_off = ((b * h + oy * wh + ky) * w + ox * ww + kx) * c;
                        for ch in 0..c {
                            dx[x_off + ch] += gd[y_off + ch] * scale;
                        }
                    }
                }
            }
        }
    }
    Tensor::from_vec(dx, input_shape)
}
