//! Output formatting utilities

use colored::Colorize;
use effective_sparsity::pruning::{PruneOutcome, SparsityReport};

pub(crate) fn section(title: &str) {
    println!("\n{}", format!("=== {title} ===").cyan().bold());
}

pub(crate) fn kv(key: &str, value: impl std::fmt::Display) {
    println!("  {}: {}", key.white().bold(), value);
}

pub(crate) fn warning(msg: &str) {
    println!("{} {}", "[WARN]".yellow().bold(), msg);
}

pub(crate) fn error(msg: &str) {
    eprintln!("{} {}", "[ERROR]".red().bold(), msg);
}

/// Fixed-width sparsity cell.
pub(crate) fn ratio(value: f64) -> String {
    format!("{value:>10.6}")
}

pub(crate) fn outcome(outcome: &PruneOutcome) {
    section("Pruning");
    kv("requested", outcome.requested);
    kv("direct target", outcome.direct_target);
    kv("rounds", outcome.rounds_completed);
    kv("compression", format!("{:.2}x", outcome.compression_ratio()));
    if outcome.clamped {
        warning("keep floors lowered the achieved sparsity");
    }
    if outcome.interrupted {
        warning("pruning was interrupted");
    }
}

pub(crate) fn report(report: &SparsityReport) {
    section("Sparsity");
    println!(
        "  {:>6} {:>12} {:>10} {:>10}",
        "tensor".bold(),
        "params".bold(),
        "direct".bold(),
        "effective".bold()
    );
    for t in &report.tensors {
        println!(
            "  {:>6} {:>12} {} {}",
            t.id,
            t.params,
            ratio(t.direct),
            ratio(t.effective)
        );
    }
    println!(
        "{}",
        format!(
            "[direct sparsity {:.6}][effective sparsity {:.6}]",
            report.overall_direct, report.overall_effective
        )
        .green()
        .bold()
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ratio_width() {
        assert_eq!(ratio(0.5), "  0.500000");
        assert_eq!(ratio(0.0).len(), 10);
    }
}
