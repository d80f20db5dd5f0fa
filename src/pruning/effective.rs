//! Effective sparsity: kept weights that no input-to-output path uses.
//!
//! A kept weight is *effective* only if its source unit is reachable from the
//! network input and its destination unit reaches the network output through
//! kept weights. Two analyses compute the effective masks:
//!
//! - [`effective_masks_by_rule`] walks a unit-level graph (neurons for dense
//!   tensors, channels for conv tensors) built from the architecture's wiring
//!   and the masks alone.
//! - [`effective_masks_by_flow`] substitutes the mask values for the weights,
//!   runs the linearized flow pass and keeps exactly the weights that carry
//!   nonzero flow.
//!
//! Both return masks that are subsets of the input masks and leave the
//! network untouched.
//!
//! The two agree exactly on dense chains. On conv nets the rule analysis is
//! a channel-level upper bound: it cannot see spatial positions that only
//! ever receive zero padding, so the flow analysis may prune more.

use super::error::{PruningError, Result};
use super::mask::Mask;
use super::scoring::{check_masks, ScoringContext};
use crate::nn::{Architecture, Network, Pass, Wiring};

/// Unit-level view of how prunable tensors connect.
#[derive(Debug, Clone)]
struct UnitGraph {
    /// Unit count of each site. Site 0 is the input, the last is the output.
    sites: Vec<usize>,
    /// Sorted by destination site; every link goes to a later site.
    links: Vec<Link>,
}

#[derive(Debug, Clone, Copy)]
struct Link {
    from: usize,
    to: usize,
    kind: LinkKind,
}

#[derive(Debug, Clone, Copy)]
enum LinkKind {
    Tensor(usize),
    Identity,
}

/// Input and output unit counts of a weight tensor.
fn io_units(shape: &[usize]) -> Result<(usize, usize)> {
    match shape {
        [rows, cols] => Ok((*rows, *cols)),
        [_, _, cin, cout] => Ok((*cin, *cout)),
        _ => Err(PruningError::ShapeMismatch {
            expected: vec![0, 0],
            got: shape.to_vec(),
        }),
    }
}

/// Source and destination unit of flattened weight index `index`.
///
/// Dense rows map onto the `from_units` channels of the previous site by
/// `row % from_units` (NHWC flatten); conv inputs map one to one.
fn endpoints(shape: &[usize], index: usize, from_units: usize) -> (usize, usize) {
    let (inputs, outputs) = match shape {
        [rows, cols] => (*rows, *cols),
        [_, _, cin, cout] => (*cin, *cout),
        _ => (1, 1),
    };
    let src = (index / outputs) % inputs;
    (src % from_units, index % outputs)
}

impl UnitGraph {
    fn new(first_inputs: usize) -> Self {
        Self {
            sites: vec![first_inputs],
            links: Vec::new(),
        }
    }

    fn add_site(&mut self, units: usize) -> usize {
        self.sites.push(units);
        self.sites.len() - 1
    }

    /// Link tensor `id` from site `from` into a site of its output width.
    fn connect(&mut self, shapes: &[Vec<usize>], id: usize, from: usize, to: usize) -> Result<()> {
        let (inputs, outputs) = io_units(&shapes[id])?;
        let from_units = self.sites[from];
        let compatible = match shapes[id].len() {
            2 => from_units > 0 && inputs % from_units == 0,
            _ => inputs == from_units,
        };
        if !compatible || outputs != self.sites[to] {
            return Err(PruningError::ShapeMismatch {
                expected: vec![from_units, self.sites[to]],
                got: shapes[id].clone(),
            });
        }
        self.links.push(Link {
            from,
            to,
            kind: LinkKind::Tensor(id),
        });
        Ok(())
    }

    fn chain(shapes: &[Vec<usize>]) -> Result<Self> {
        let first = shapes.first().ok_or_else(|| PruningError::NoParameters {
            network: "empty mask set".to_string(),
        })?;
        let mut graph = Self::new(io_units(first)?.0);
        let mut cur = 0;
        for id in 0..shapes.len() {
            let next = graph.add_site(io_units(&shapes[id])?.1);
            graph.connect(shapes, id, cur, next)?;
            cur = next;
        }
        Ok(graph)
    }

    /// Stem conv, blocks `[conv_a, conv_b, optional 1x1 projection]`, then
    /// the classifier.
    fn residual(shapes: &[Vec<usize>]) -> Result<Self> {
        let n = shapes.len();
        let malformed = |id: usize| PruningError::ShapeMismatch {
            expected: vec![3, 3, 0, 0],
            got: shapes.get(id).cloned().unwrap_or_default(),
        };
        if n < 2 || shapes[0].len() != 4 || shapes[n - 1].len() != 2 {
            return Err(malformed(0));
        }
        let is_projection = |s: &[usize]| s.len() == 4 && s[0] == 1 && s[1] == 1;

        let mut graph = Self::new(io_units(&shapes[0])?.0);
        let stem = graph.add_site(io_units(&shapes[0])?.1);
        graph.connect(shapes, 0, 0, stem)?;
        let mut cur = stem;
        let mut id = 1;
        while id < n - 1 {
            if id + 1 >= n - 1 || shapes[id].len() != 4 || shapes[id + 1].len() != 4 {
                return Err(malformed(id));
            }
            let mid = graph.add_site(io_units(&shapes[id])?.1);
            graph.connect(shapes, id, cur, mid)?;
            let sum = graph.add_site(io_units(&shapes[id + 1])?.1);
            graph.connect(shapes, id + 1, mid, sum)?;
            if id + 2 < n - 1 && is_projection(shapes[id + 2].as_slice()) {
                graph.connect(shapes, id + 2, cur, sum)?;
                id += 3;
            } else {
                if graph.sites[cur] != graph.sites[sum] {
                    return Err(malformed(id + 1));
                }
                graph.links.push(Link {
                    from: cur,
                    to: sum,
                    kind: LinkKind::Identity,
                });
                id += 2;
            }
            cur = sum;
        }
        let out = graph.add_site(io_units(&shapes[n - 1])?.1);
        graph.connect(shapes, n - 1, cur, out)?;
        Ok(graph)
    }

    /// Forward- and backward-alive flags per site and unit.
    fn liveness(&self, masks: &[Mask]) -> (Vec<Vec<bool>>, Vec<Vec<bool>>) {
        let mut fwd: Vec<Vec<bool>> = self.sites.iter().map(|&u| vec![false; u]).collect();
        let mut bwd = fwd.clone();
        fwd[0].iter_mut().for_each(|a| *a = true);
        if let Some(last) = bwd.last_mut() {
            last.iter_mut().for_each(|a| *a = true);
        }

        for link in &self.links {
            match link.kind {
                LinkKind::Identity => {
                    for u in 0..self.sites[link.to] {
                        if fwd[link.from][u] {
                            fwd[link.to][u] = true;
                        }
                    }
                }
                LinkKind::Tensor(id) => {
                    let mask = &masks[id];
                    let from_units = self.sites[link.from];
                    for index in mask.kept_indices() {
                        let (src, dst) = endpoints(mask.shape(), index, from_units);
                        if fwd[link.from][src] {
                            fwd[link.to][dst] = true;
                        }
                    }
                }
            }
        }

        for link in self.links.iter().rev() {
            match link.kind {
                LinkKind::Identity => {
                    for u in 0..self.sites[link.to] {
                        if bwd[link.to][u] {
                            bwd[link.from][u] = true;
                        }
                    }
                }
                LinkKind::Tensor(id) => {
                    let mask = &masks[id];
                    let from_units = self.sites[link.from];
                    for index in mask.kept_indices() {
                        let (src, dst) = endpoints(mask.shape(), index, from_units);
                        if bwd[link.to][dst] {
                            bwd[link.from][src] = true;
                        }
                    }
                }
            }
        }
        (fwd, bwd)
    }
}

/// Effective masks from the unit wiring of `architecture`.
///
/// # Errors
/// - `NoParameters` for an empty mask set
/// - `ShapeMismatch` if the mask shapes do not fit the architecture's wiring
pub fn effective_masks_by_rule(architecture: Architecture, masks: &[Mask]) -> Result<Vec<Mask>> {
    let shapes: Vec<Vec<usize>> = masks.iter().map(|m| m.shape().to_vec()).collect();
    let graph = match architecture.wiring() {
        Wiring::Chain => UnitGraph::chain(&shapes)?,
        Wiring::Residual => UnitGraph::residual(&shapes)?,
    };
    let (fwd, bwd) = graph.liveness(masks);

    let mut effective: Vec<Option<Mask>> = vec![None; masks.len()];
    for link in &graph.links {
        if let LinkKind::Tensor(id) = link.kind {
            let mask = &masks[id];
            let from_units = graph.sites[link.from];
            effective[id] = Some(Mask::from_fn(mask.shape(), |index| {
                if !mask.is_kept(index) {
                    return false;
                }
                let (src, dst) = endpoints(mask.shape(), index, from_units);
                fwd[link.from][src] && bwd[link.to][dst]
            }));
        }
    }
    let result: Vec<Mask> = effective.into_iter().flatten().collect();
    if result.len() != masks.len() {
        return Err(PruningError::ShapeMismatch {
            expected: vec![masks.len()],
            got: vec![result.len()],
        });
    }
    tracing::debug!(
        architecture = architecture.name(),
        tensors = masks.len(),
        "rule-based effective masks computed"
    );
    Ok(result)
}

/// Effective masks by flow propagation through `net` with mask-valued
/// weights.
///
/// A kept weight survives iff its flow gradient is nonzero. All weights of
/// `net` are restored before returning.
///
/// # Errors
/// - `ShapeMismatch` if the masks do not fit the network
/// - `NumericalInstability` if the flow pass overflows
pub fn effective_masks_by_flow<N: Network + ?Sized>(net: &mut N, masks: &[Mask]) -> Result<Vec<Mask>> {
    check_masks(net, masks)?;
    let mut ctx = ScoringContext::new(net);
    ctx.substitute_masks(masks);
    let out = ctx.forward_backward(Pass::Flow)?;
    drop(ctx);

    masks
        .iter()
        .zip(&out.gradients)
        .enumerate()
        .map(|(id, (mask, grad))| {
            if !grad.is_finite() {
                return Err(PruningError::NumericalInstability {
                    method: "flow propagation".to_string(),
                    details: format!("non-finite gradient in tensor {id}"),
                });
            }
            let g = grad.data();
            Ok(Mask::from_fn(mask.shape(), |i| mask.is_kept(i) && g[i] != 0.0))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nn::{Dense, Layer, Sequential};
    use crate::tensor::Tensor;

    fn mask(values: &[f32], shape: &[usize]) -> Mask {
        Mask::new(Tensor::new(values, shape)).unwrap()
    }

    fn chain_net(shapes: &[[usize; 2]]) -> Sequential {
        let mut layers = Vec::new();
        for (i, s) in shapes.iter().enumerate() {
            if i > 0 {
                layers.push(Layer::Relu);
            }
            layers.push(Layer::Dense(Dense::new(Tensor::ones(s))));
        }
        Sequential::new("chain", &[shapes[0][0]], layers).unwrap()
    }

    // ==========================================================================
    // FALSIFICATION: a unit without inputs disconnects its outgoing weights
    // ==========================================================================
    #[test]
    fn test_dead_input_unit_prunes_downstream() {
        // Hidden unit 1 receives nothing (column 1 of the first tensor is zero).
        let masks = vec![
            mask(&[1.0, 0.0, 1.0, 0.0], &[2, 2]),
            mask(&[1.0, 1.0, 1.0, 1.0], &[2, 2]),
        ];
        let rule = effective_masks_by_rule(Architecture::Lenet300100, &masks).unwrap();
        assert_eq!(rule[0], masks[0]);
        assert_eq!(rule[1].tensor().data(), &[1.0, 1.0, 0.0, 0.0]);

        let mut net = chain_net(&[[2, 2], [2, 2]]);
        let flow = effective_masks_by_flow(&mut net, &masks).unwrap();
        assert_eq!(flow, rule);
    }

    #[test]
    fn test_dead_output_unit_prunes_upstream() {
        // Hidden unit 0 sends nothing (row 0 of the second tensor is zero).
        let masks = vec![
            mask(&[1.0, 1.0, 1.0, 1.0], &[2, 2]),
            mask(&[0.0, 0.0, 1.0, 1.0], &[2, 2]),
        ];
        let rule = effective_masks_by_rule(Architecture::Lenet300100, &masks).unwrap();
        assert_eq!(rule[0].tensor().data(), &[0.0, 1.0, 0.0, 1.0]);
        assert_eq!(rule[1], masks[1]);

        let mut net = chain_net(&[[2, 2], [2, 2]]);
        assert_eq!(effective_masks_by_flow(&mut net, &masks).unwrap(), rule);
    }

    #[test]
    fn test_dense_masks_are_fully_effective() {
        let masks = vec![Mask::dense(&[3, 4]), Mask::dense(&[4, 2])];
        let rule = effective_masks_by_rule(Architecture::Vgg16, &masks).unwrap();
        assert_eq!(rule, masks);
        let mut net = chain_net(&[[3, 4], [4, 2]]);
        assert_eq!(effective_masks_by_flow(&mut net, &masks).unwrap(), masks);
    }

    #[test]
    fn test_flow_analysis_restores_weights() {
        let mut net = chain_net(&[[2, 2], [2, 2]]);
        net.weight_mut(0).data_mut()[0] = 3.5;
        let before = net.snapshot();
        let masks = vec![Mask::from_fn(&[2, 2], |i| i > 0), Mask::dense(&[2, 2])];
        effective_masks_by_flow(&mut net, &masks).unwrap();
        assert_eq!(net.snapshot(), before);
    }

    #[test]
    fn test_flatten_maps_rows_to_channels() {
        // Conv with 2 output channels, channel 1 receives nothing; the dense
        // layer reads a 2x2x2 feature map, so rows 1, 3, 5, 7 are channel 1.
        let conv = Mask::from_fn(&[1, 1, 1, 2], |i| i == 0);
        let dense = Mask::dense(&[8, 3]);
        let rule = effective_masks_by_rule(Architecture::Lenet5, &[conv.clone(), dense]).unwrap();
        assert_eq!(rule[0], conv);
        for row in 0..8 {
            let alive = row % 2 == 0;
            for col in 0..3 {
                assert_eq!(rule[1].is_kept(row * 3 + col), alive, "row {row}");
            }
        }
    }

    #[test]
    fn test_residual_identity_keeps_block_reachable() {
        // stem, block (conv_a fully pruned, identity shortcut), classifier
        let masks = vec![
            Mask::dense(&[3, 3, 1, 2]),
            Mask::from_fn(&[3, 3, 2, 2], |_| false),
            Mask::dense(&[3, 3, 2, 2]),
            Mask::dense(&[2, 4]),
        ];
        let rule = effective_masks_by_rule(Architecture::Resnet18, &masks).unwrap();
        assert_eq!(rule[0], masks[0]);
        assert_eq!(rule[1].nnz(), 0);
        // conv_b is cut off from the input once conv_a is gone.
        assert_eq!(rule[2].nnz(), 0);
        assert_eq!(rule[3], masks[3]);
    }

    #[test]
    fn test_residual_projection_path() {
        // stem 1->2, block 2->4 with projection, classifier 4->3.
        let masks = vec![
            Mask::dense(&[3, 3, 1, 2]),
            Mask::dense(&[3, 3, 2, 4]),
            Mask::from_fn(&[3, 3, 4, 4], |_| false),
            Mask::dense(&[1, 1, 2, 4]),
            Mask::dense(&[4, 3]),
        ];
        let rule = effective_masks_by_rule(Architecture::Resnet18, &masks).unwrap();
        // conv_a only feeds the dead conv_b.
        assert_eq!(rule[1].nnz(), 0);
        assert_eq!(rule[3], masks[3]);
        assert_eq!(rule[4], masks[4]);
    }

    #[test]
    fn test_wiring_mismatch_is_reported() {
        let masks = vec![Mask::dense(&[3, 4]), Mask::dense(&[5, 2])];
        assert!(matches!(
            effective_masks_by_rule(Architecture::Lenet300100, &masks),
            Err(PruningError::ShapeMismatch { .. })
        ));
        assert!(matches!(
            effective_masks_by_rule(Architecture::Resnet18, &masks),
            Err(PruningError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_effective_is_subset() {
        let masks = vec![
            Mask::from_fn(&[4, 3], |i| i % 3 != 1),
            Mask::from_fn(&[3, 2], |i| i < 2),
        ];
        let rule = effective_masks_by_rule(Architecture::Lenet300100, &masks).unwrap();
        for (e, m) in rule.iter().zip(&masks) {
            assert!(e.is_subset_of(m));
        }
    }

    #[test]
    fn test_flow_is_at_least_as_strict_as_rule_on_conv_nets() {
        let arch = Architecture::Lenet5;
        let mut net = arch
            .build(&crate::nn::NetworkSpec::for_architecture(arch).with_width_divisor(4))
            .unwrap();
        // Keep only the top-left kernel tap of every conv: border outputs
        // then see nothing but padding.
        let masks: Vec<Mask> = net
            .prunable()
            .iter()
            .map(|t| match t.shape.as_slice() {
                [_, _, cin, cout] => Mask::from_fn(&t.shape, |i| i < cin * cout),
                _ => Mask::dense(&t.shape),
            })
            .collect();
        let rule = effective_masks_by_rule(arch, &masks).unwrap();
        let flow = effective_masks_by_flow(&mut net, &masks).unwrap();
        for (f, r) in flow.iter().zip(&rule) {
            assert!(f.is_subset_of(r));
        }
        assert!(flow.iter().map(Mask::nnz).sum::<usize>() < rule.iter().map(Mask::nnz).sum::<usize>());
    }
}
