//! effsparse - prune a reference network and account for effective sparsity
//!
//! Usage:
//!   effsparse --architecture lenet5 --pruner synflow --com-exp 2
//!   effsparse --architecture vgg16 --pruner magnitude/erk --target-sparsity 0.99 --save
//!   effsparse --architecture resnet18 --pruner snip --pruning-type effective --com-exp 1.5
//!   effsparse --architecture lenet300100 --pruner dense --train-steps 200 --save

use clap::Parser;
use effective_sparsity::config::{
    sparsity_from_compression_exponent, ExperimentConfig, PruningConfig, PruningType,
};
use effective_sparsity::nn::{Architecture, Batch, BatchCycle, Network, NetworkSpec};
use effective_sparsity::pruning::{
    effective_masks_by_flow, effective_masks_by_rule, ArtifactWriter, MaskEnforcer, PruneOutcome,
    Pruner, SparsityReport,
};
use effective_sparsity::train::{LogHook, StepHook, Trainer};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

mod error;
mod output;

use error::{CliError, Result};

/// effsparse - pruning masks with direct and effective sparsity accounting
///
/// Builds one of the reference architectures, computes masks with the chosen
/// pruner, then reports how much of the network is pruned directly and how
/// much is disconnected.
#[derive(Parser, Debug)]
#[command(name = "effsparse")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// lenet300100, lenet5, vgg16, vgg19 or resnet18
    #[arg(short, long, default_value = "lenet300100")]
    architecture: Architecture,

    /// Pruning policy, e.g. dense, snip, synflow, lamp, magnitude/erk
    #[arg(short, long, default_value = "dense")]
    pruner: String,

    /// Target sparsity in [0, 1)
    #[arg(long, conflicts_with = "com_exp")]
    target_sparsity: Option<f64>,

    /// Compression exponent: target = 1 - 10^(-com_exp)
    #[arg(long)]
    com_exp: Option<f64>,

    /// Whether the target applies to direct or effective sparsity
    #[arg(long, default_value = "direct")]
    pruning_type: PruningType,

    /// Seed for initialization, scoring and data
    #[arg(short, long, default_value = "0")]
    seed: u64,

    /// Root directory for saved artifacts
    #[arg(short, long, default_value = "temp")]
    out_path: PathBuf,

    /// Write artifacts under --out-path
    #[arg(long)]
    save: bool,

    /// Train the pruned network for this many steps on synthetic data
    #[arg(long, default_value = "0")]
    train_steps: usize,

    /// Divide hidden widths by this factor
    #[arg(long, default_value = "1")]
    width_divisor: usize,

    /// Pruning settings as JSON (rounds, keep floor, strict budget)
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Print the report as JSON
    #[arg(long)]
    json: bool,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Quiet mode (errors only)
    #[arg(short, long)]
    quiet: bool,
}

impl Cli {
    /// Requested sparsity; the dense baseline is always 0.
    fn target(&self) -> Result<f64> {
        if self.pruner == "dense" {
            return Ok(0.0);
        }
        match (self.target_sparsity, self.com_exp) {
            (Some(t), _) => Ok(t),
            (None, Some(e)) => Ok(sparsity_from_compression_exponent(e)),
            (None, None) => Err(CliError::InvalidArgument(format!(
                "pruner '{}' needs --target-sparsity or --com-exp",
                self.pruner
            ))),
        }
    }

    fn pruning_config(&self) -> Result<PruningConfig> {
        let base = match &self.config {
            Some(path) => PruningConfig::from_json_file(path)?,
            None => PruningConfig::default(),
        };
        Ok(base
            .with_seed(self.seed)
            .with_pruning_type(self.pruning_type))
    }
}

fn init_tracing(verbose: bool, quiet: bool) {
    let level = if quiet {
        "error"
    } else if verbose {
        "debug"
    } else {
        "info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

/// Synthetic batches shaped like the architecture's dataset.
fn batches(spec: &NetworkSpec, size: usize, seed: u64, count: u64) -> BatchCycle {
    BatchCycle::new(
        (0..count)
            .map(|i| Batch::synthetic(&spec.input_shape, spec.classes, size, seed.wrapping_add(i)))
            .collect(),
    )
}

fn print_report(outcome: &PruneOutcome, report: &SparsityReport, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(report)?);
        return Ok(());
    }
    output::outcome(outcome);
    output::report(report);
    Ok(())
}

fn run(cli: &Cli) -> Result<()> {
    let target = cli.target()?;
    let config = cli.pruning_config()?;
    let arch = cli.architecture;
    let experiment = ExperimentConfig::for_architecture(arch);
    let spec = NetworkSpec::for_architecture(arch)
        .with_width_divisor(cli.width_divisor)
        .with_seed(cli.seed);

    let mut net = arch.build(&spec)?;
    let inits = net.snapshot();
    tracing::info!(
        architecture = %arch,
        pruner = %cli.pruner,
        target,
        parameters = net.num_parameters(),
        "network built"
    );

    let mut scoring_data = batches(&spec, experiment.batch_size_snip, cli.seed, 4);
    let outcome = Pruner::new(&cli.pruner, config)?.prune(&mut net, target, Some(&mut scoring_data))?;
    let mut enforcer = MaskEnforcer::new(outcome.masks.clone());
    enforcer.enforce(&mut net)?;

    let by_flow = effective_masks_by_flow(&mut net, &outcome.masks)?;
    let by_rule = effective_masks_by_rule(arch, &outcome.masks)?;
    let report = SparsityReport::new(&outcome.masks, &by_flow)?;
    if by_flow != by_rule {
        tracing::debug!("flow and rule analyses disagree on some weights");
    }
    if !cli.quiet {
        print_report(&outcome, &report, cli.json)?;
    }

    let writer = ArtifactWriter::new(
        &cli.out_path,
        arch,
        &cli.pruner,
        cli.pruning_type,
        cli.seed,
        target,
    );
    let dense = cli.pruner == "dense";
    if cli.save {
        writer.write_counts(&outcome.masks)?;
        if !dense {
            writer.write_direct(&outcome.masks)?;
            writer.write_effective_flow(&by_flow)?;
            writer.write_effective_rule(&by_rule)?;
            writer.write_report(&report)?;
        }
        tracing::info!(dir = %writer.run_dir().display(), "artifacts saved");
    }

    if cli.train_steps > 0 {
        let mut trainer = Trainer::from_experiment(&experiment);
        let mut train_data = batches(&spec, experiment.batch_size_train, cli.seed.wrapping_add(1_000), 8);
        let eval = Batch::synthetic(
            &spec.input_shape,
            spec.classes,
            experiment.batch_size_train,
            cli.seed.wrapping_add(2_000),
        );
        let every = (cli.train_steps / 10).max(1);
        let mut log = LogHook::new(eval, every);
        let mut hooks: [&mut dyn StepHook; 2] = [&mut enforcer, &mut log];
        trainer.fit(&mut net, &mut train_data, cli.train_steps, &mut hooks)?;

        if cli.save {
            writer.write_accuracies(log.accuracies())?;
            writer.write_losses(log.losses())?;
            if dense {
                writer.write_inits(&inits)?;
                writer.write_final_weights(log.final_weights())?;
            }
        }
    }
    Ok(())
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.quiet);

    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            output::error(&e.to_string());
            e.exit_code()
        }
    }
}
