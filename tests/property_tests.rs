//! Property-based tests using proptest.
//!
//! These tests verify the invariants every mask set must satisfy regardless
//! of policy, target or seed.

use effective_sparsity::config::PruningConfig;
use effective_sparsity::nn::optim::{Optimizer, SGD};
use effective_sparsity::nn::{Architecture, Network, NetworkSpec, Sequential};
use effective_sparsity::pruning::{
    effective_masks_by_flow, effective_masks_by_rule, overall_sparsity, round_target, Mask,
    MaskEnforcer, Pruner,
};
use effective_sparsity::tensor::Tensor;
use proptest::prelude::*;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

fn small_mlp(seed: u64) -> Sequential {
    let arch = Architecture::Lenet300100;
    arch.build(
        &NetworkSpec::for_architecture(arch)
            .with_width_divisor(20)
            .with_seed(seed),
    )
    .expect("reference architecture builds")
}

fn random_masks(net: &Sequential, density: f64, seed: u64) -> Vec<Mask> {
    let mut rng = StdRng::seed_from_u64(seed);
    net.prunable()
        .iter()
        .map(|t| Mask::from_fn(&t.shape, |_| rng.gen::<f64>() < density))
        .collect()
}

fn policy_strategy() -> impl Strategy<Value = &'static str> {
    prop::sample::select(vec![
        "random/uniform",
        "random/erk",
        "random/igq",
        "magnitude/uniform",
        "magnitude/erk",
        "magnitude/igq",
        "magnitude/global",
        "lamp",
    ])
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn effective_masks_are_subsets(seed in any::<u64>(), density in 0.005f64..1.0) {
        let mut net = small_mlp(seed);
        let masks = random_masks(&net, density, seed);
        let by_rule = effective_masks_by_rule(Architecture::Lenet300100, &masks).unwrap();
        let by_flow = effective_masks_by_flow(&mut net, &masks).unwrap();
        for ((m, r), f) in masks.iter().zip(&by_rule).zip(&by_flow) {
            prop_assert!(r.is_subset_of(m));
            prop_assert!(f.is_subset_of(m));
        }
        prop_assert!(overall_sparsity(&by_rule) >= overall_sparsity(&masks));
    }

    #[test]
    fn rule_and_flow_agree_on_chains(seed in any::<u64>(), density in 0.005f64..0.5) {
        let mut net = small_mlp(seed);
        let masks = random_masks(&net, density, seed.wrapping_add(1));
        let by_rule = effective_masks_by_rule(Architecture::Lenet300100, &masks).unwrap();
        let by_flow = effective_masks_by_flow(&mut net, &masks).unwrap();
        prop_assert_eq!(by_rule, by_flow);
    }

    #[test]
    fn achieved_sparsity_tracks_target(
        policy in policy_strategy(),
        target in 0.0f64..0.99,
        seed in any::<u64>(),
    ) {
        let mut net = small_mlp(seed);
        let total: usize = net.prunable().iter().map(|t| t.numel()).sum();
        let pruner = Pruner::new(policy, PruningConfig::default().with_seed(seed)).unwrap();
        let outcome = pruner.prune(&mut net, target, None).unwrap();
        prop_assert_eq!(outcome.achieved, overall_sparsity(&outcome.masks));
        if !outcome.clamped {
            prop_assert!((outcome.achieved - target).abs() <= 2.0 / total as f64);
        }
        for m in &outcome.masks {
            prop_assert!(m.nnz() >= 1);
        }
    }

    #[test]
    fn seeded_policies_are_deterministic(
        policy in policy_strategy(),
        target in 0.1f64..0.95,
        seed in any::<u64>(),
    ) {
        let mut net = small_mlp(7);
        let config = PruningConfig::default().with_seed(seed);
        let a = Pruner::new(policy, config.clone()).unwrap().prune(&mut net, target, None).unwrap();
        let b = Pruner::new(policy, config).unwrap().prune(&mut net, target, None).unwrap();
        prop_assert_eq!(a.masks, b.masks);
    }

    #[test]
    fn round_schedule_is_increasing(target in 0.0f64..0.999, rounds in 1usize..200) {
        let mut previous = 0.0;
        for k in 1..=rounds {
            let s = round_target(target, k, rounds);
            prop_assert!(s >= previous - 1e-12);
            prop_assert!(s <= target + 1e-12);
            previous = s;
        }
        prop_assert_eq!(round_target(target, rounds, rounds), target);
    }

    // ==========================================================================
    // FALSIFICATION: no optimizer trajectory revives a pruned weight
    // ==========================================================================
    #[test]
    fn masks_survive_momentum_training(
        seed in any::<u64>(),
        density in 0.05f64..0.9,
        momentum in 0.0f32..0.99,
        wd in 0.0f32..0.01,
        steps in 1usize..8,
    ) {
        let mut net = small_mlp(seed);
        let masks = random_masks(&net, density, seed);
        let enforcer = MaskEnforcer::new(masks);
        enforcer.enforce(&mut net).unwrap();

        let mut rng = StdRng::seed_from_u64(seed ^ 0x5eed);
        let mut sgd = SGD::with_momentum(0.05, momentum).weight_decay(wd);
        for _ in 0..steps {
            let grads: Vec<Tensor> = net
                .prunable()
                .iter()
                .map(|t| {
                    let data = (0..t.numel()).map(|_| rng.gen_range(-1.0f32..1.0)).collect();
                    Tensor::from_vec(data, &t.shape)
                })
                .collect();
            sgd.step(&mut net, &grads);
            enforcer.enforce(&mut net).unwrap();
            prop_assert!(enforcer.holds(&net));
        }
    }
}
