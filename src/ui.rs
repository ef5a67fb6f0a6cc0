use colored::Colorize;
use declarative::{ProgressCallback, Report};
use indicatif::{ProgressBar, ProgressStyle};

use crate::engine::{PlaybookSummary, ProbeReport, ResultEnvelope};

/// Print an info message
pub fn info(msg: &str) {
    println!("{} {}", "ℹ".blue(), msg);
}

/// Print a success message
pub fn success(msg: &str) {
    println!("{} {}", "✓".green(), msg);
}

/// Print a warning message
pub fn warn(msg: &str) {
    println!("{} {}", "⚠".yellow(), msg);
}

/// Print an error message
pub fn error(msg: &str) {
    eprintln!("{} {}", "✗".red(), msg);
}

/// Print a dim/muted message
pub fn dim(msg: &str) {
    println!("  {}", msg.dimmed());
}

/// Print a header/title
pub fn header(title: &str) {
    println!();
    println!("{}", title.bold());
    println!("{}", "─".repeat(title.chars().count()).dimmed());
}

/// Print a key-value pair
pub fn kv(key: &str, value: &str) {
    println!("  {}: {}", key.dimmed(), value);
}

/// One-line status of an envelope
pub fn status_line(envelope: &ResultEnvelope) -> String {
    let subject = envelope.task.as_deref().unwrap_or("resource");
    if envelope.failed {
        let msg = envelope.msg.as_deref().unwrap_or("failed");
        return format!("{} {subject}: {msg}", "✗".red());
    }
    let action = envelope.decision.as_ref().map(|d| d.action.to_string()).unwrap_or_default();
    if envelope.changed {
        format!("{} {subject}: {}", "✓".green(), action)
    } else {
        format!("{} {subject}: {}", "○".dimmed(), "no change".dimmed())
    }
}

/// Render an envelope as text
pub fn envelope(envelope: &ResultEnvelope) {
    if envelope.failed {
        error(&status_line(envelope));
    } else {
        println!("{}", status_line(envelope));
    }
    if let Some(decision) = &envelope.decision {
        if let Some(from) = &decision.from_name {
            kv("renamed from", from);
        }
        for (key, value) in &decision.modify {
            kv(key, &value.to_string());
        }
    }
    for warning in &envelope.warnings {
        warn(warning);
    }
}

pub fn summary(summary: &PlaybookSummary) {
    println!();
    if summary.is_success() {
        println!("  {} Playbook converged", "✓".green().bold());
    } else {
        println!("  {} Playbook finished with errors", "⚠".yellow().bold());
    }
    if summary.changed > 0 {
        println!("    • {} tasks changed", summary.changed);
    }
    if summary.unchanged > 0 {
        println!("    • {} tasks unchanged", summary.unchanged);
    }
    if summary.failed > 0 {
        println!("    • {} {} failed", summary.failed, "tasks".red());
    }
}

pub fn probe(report: &ProbeReport) {
    header(&format!("ONTAP {}", report.cluster.version));
    kv("host", &report.host);
    kv("protocol", &report.protocol.to_string());
    kv("rest", &report.rest.to_string());
    kv("asa_r2", &report.asa_r2.to_string());
    kv("ontap", &report.ontap.to_string());
    for warning in &report.warnings {
        warn(warning);
    }
}

/// Progress bar over the tasks of a playbook
pub struct TaskProgress {
    bar: ProgressBar,
}

impl TaskProgress {
    pub fn new(total: usize) -> Self {
        let bar = ProgressBar::new(total as u64);
        bar.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{bar:40.cyan/blue}] {pos}/{len} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("=>-"),
        );
        Self { bar }
    }

    pub fn finish(&self) {
        self.bar.finish_and_clear();
    }
}

impl ProgressCallback for TaskProgress {
    fn on_task_start(&self, _index: usize, description: &str) {
        self.bar.set_message(description.to_string());
    }

    fn on_task_complete(&self, _index: usize, description: &str, outcome: Result<&Report, &str>) {
        let symbol = match outcome {
            Ok(report) if report.changed => "✓".green(),
            Ok(_) => "○".dimmed(),
            Err(_) => "✗".red(),
        };
        self.bar.set_message(format!("{symbol} {description}"));
        self.bar.inc(1);
    }
}
