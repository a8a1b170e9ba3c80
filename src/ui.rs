//! Terminal output: a spinner while a run is in progress and coloured summaries.

use std::path::Path;
use std::time::Duration;

use console::Style;
use indicatif::{ProgressBar, ProgressStyle};

use crate::aggregate::AggregateSummary;
use crate::dispatch::QueueCounts;
use crate::pipeline::{PipelineOutcome, SynthesisSource};

/// Spinner shown while a single pipeline run is in progress.
pub struct RunProgress {
    pb: ProgressBar,
    green: Style,
    red: Style,
    yellow: Style,
    dim: Style,
}

impl RunProgress {
    pub fn start(question: &str) -> Self {
        let pb = ProgressBar::new_spinner();
        pb.set_style(
            ProgressStyle::default_spinner()
                .template("{spinner:.cyan} {msg} ({elapsed})")
                .unwrap_or_else(|_| ProgressStyle::default_spinner()),
        );
        pb.set_message(format!("Asking: {}", truncate(question, 60)));
        pb.enable_steady_tick(Duration::from_millis(100));

        Self {
            pb,
            green: Style::new().green().bold(),
            red: Style::new().red().bold(),
            yellow: Style::new().yellow(),
            dim: Style::new().dim(),
        }
    }

    /// Clears the spinner and prints per-stage status followed by the answer.
    pub fn complete(&self, outcome: &PipelineOutcome) {
        self.pb.finish_and_clear();

        for result in &outcome.stage_results {
            let elapsed = self.dim.apply_to(format!("{:.1}s", result.duration.as_secs_f64()));
            if result.success {
                println!("  {} {} {elapsed}", self.green.apply_to("✓"), result.stage_name);
            } else {
                println!(
                    "  {} {} {elapsed}: {}",
                    self.red.apply_to("✗"),
                    result.stage_name,
                    result.error_message()
                );
            }
        }

        match (&outcome.synthesis, outcome.synthesis_source) {
            (Some(text), source) => {
                if source == Some(SynthesisSource::Fallback) {
                    println!(
                        "  {} synthesis unavailable, showing raw stage output",
                        self.yellow.apply_to("!")
                    );
                }
                println!();
                println!("{text}");
            }
            (None, _) => {
                println!(
                    "  {} {}",
                    self.red.apply_to("✗"),
                    outcome
                        .failure_reason()
                        .unwrap_or_else(|| "no answer produced".to_string())
                );
            }
        }

        println!();
        println!(
            "{}",
            self.dim.apply_to(format!(
                "{}/{} stages succeeded in {:.1}s (run {})",
                outcome.successful_stages,
                outcome.total_stages,
                outcome.duration.as_secs_f64(),
                outcome.run_id
            ))
        );
    }
}

/// Prints one line per component and returns whether all of them are healthy.
pub fn print_health(report: &[(String, bool)]) -> bool {
    let green = Style::new().green().bold();
    let red = Style::new().red().bold();
    for (name, ok) in report {
        if *ok {
            println!("  {} {name}", green.apply_to("✓"));
        } else {
            println!("  {} {name}", red.apply_to("✗"));
        }
    }
    report.iter().all(|(_, ok)| *ok)
}

pub fn print_counts(counts: &QueueCounts) {
    let label = Style::new().bold();
    println!("  {:<11}{}", label.apply_to("pending"), counts.pending);
    println!("  {:<11}{}", label.apply_to("processing"), counts.processing);
    println!("  {:<11}{}", label.apply_to("completed"), counts.completed);
    println!("  {:<11}{}", label.apply_to("failed"), counts.failed);
}

pub fn print_aggregate(summary: &AggregateSummary, output: &Path) {
    let label = Style::new().bold();
    println!("  {:<14}{}", label.apply_to("responses"), summary.responses);
    println!("  {:<14}{}", label.apply_to("questions"), summary.questions);
    println!("  {:<14}{}", label.apply_to("consensus"), summary.with_consensus);
    println!("  {:<14}{}", label.apply_to("no consensus"), summary.without_consensus());
    println!("{}", Style::new().dim().apply_to(format!("written to {}", output.display())));
}

fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        text.to_string()
    } else {
        let head: String = text.chars().take(max_chars).collect();
        format!("{head}…")
    }
}
