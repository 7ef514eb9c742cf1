//! CLI output formatting

use crate::{
    core::{LogEntry, LogLevel, RunMetadata, RunStatus, RunSummary, StepStatus},
    execution::{StepOutcome, TickReport},
};
use console::Emoji;
use indicatif::{ProgressBar, ProgressStyle};
use std::time::Duration;

// Re-export style
pub use console::style;

// Emojis for output
pub static CHECK: Emoji<'_, '_> = Emoji("✅ ", "✓ ");
pub static CROSS: Emoji<'_, '_> = Emoji("❌ ", "✗ ");
pub static SPINNER: Emoji<'_, '_> = Emoji("⏳ ", "~ ");
pub static INFO: Emoji<'_, '_> = Emoji("ℹ️  ", "i ");
pub static WARN: Emoji<'_, '_> = Emoji("⚠️  ", "!");
pub static ROCKET: Emoji<'_, '_> = Emoji("🚀 ", "> ");

/// Spinner shown while the worker waits on an empty queue
pub fn create_spinner(message: &str) -> ProgressBar {
    let spinner = ProgressBar::new_spinner();
    if let Ok(template) = ProgressStyle::default_spinner().template("{spinner:.green} [{elapsed_precise}] {msg}") {
        spinner.set_style(template);
    }
    spinner.set_message(message.to_string());
    spinner.enable_steady_tick(Duration::from_millis(100));
    spinner
}

/// First eight characters of an id
pub fn short_id(id: &uuid::Uuid) -> String {
    id.to_string()[..8].to_string()
}

/// Format a run status for display
pub fn format_status(status: RunStatus) -> String {
    match status {
        RunStatus::Pending => style("PENDING").dim().to_string(),
        RunStatus::Running => style("RUNNING").yellow().to_string(),
        RunStatus::Completed => style("COMPLETED").green().to_string(),
        RunStatus::Failed => style("FAILED").red().to_string(),
    }
}

/// Format a derived step status for display
pub fn format_step_status(status: &StepStatus) -> String {
    match status {
        StepStatus::Succeeded => style("SUCCEEDED").green().to_string(),
        StepStatus::Queued { attempt: 1 } => style("QUEUED").cyan().to_string(),
        StepStatus::Queued { attempt } => style(format!("QUEUED (attempt {})", attempt)).yellow().to_string(),
        StepStatus::Waiting => style("WAITING").dim().to_string(),
    }
}

/// One-line run listing entry
pub fn format_run_line(metadata: &RunMetadata) -> String {
    let status_icon = match metadata.status {
        RunStatus::Completed => CHECK,
        RunStatus::Failed => CROSS,
        RunStatus::Running => SPINNER,
        RunStatus::Pending => INFO,
    };

    let mut line = format!(
        "{} {} - {} - {} - {}",
        status_icon,
        style(metadata.run_id).dim(),
        style(&metadata.pipeline_id).bold(),
        format_status(metadata.status),
        style(metadata.created_at.format("%Y-%m-%d %H:%M:%S")).dim()
    );
    if let Some(user) = &metadata.user_id {
        line.push_str(&format!(" ({})", style(user).cyan()));
    }
    line
}

/// Multi-line run summary
pub fn format_run_summary(summary: &RunSummary) -> String {
    let metadata = &summary.metadata;
    let mut out = vec![
        format!("{} Run {}", INFO, style(metadata.run_id).cyan()),
        format!("  Pipeline: {}", style(&metadata.pipeline_id).bold()),
        format!("  Status: {}", format_status(metadata.status)),
        format!("  Created: {}", style(metadata.created_at.to_rfc3339()).dim()),
        format!("  Updated: {}", style(metadata.updated_at.to_rfc3339()).dim()),
    ];
    if let Some(user) = &metadata.user_id {
        out.push(format!("  User: {}", style(user).cyan()));
    }
    out.push(format!(
        "  Progress: {} ({}/{})",
        style(format!("{:.0}%", summary.progress() * 100.0)).cyan(),
        summary.completed_steps(),
        summary.steps.len()
    ));
    out.push(String::new());
    for (name, status) in &summary.steps {
        out.push(format!("  {:<24} {}", name, format_step_status(status)));
    }
    out.join("\n")
}

/// Format a log entry for display
pub fn format_log_entry(entry: &LogEntry) -> String {
    let level = match entry.level {
        LogLevel::Info => style("INFO ").dim(),
        LogLevel::Warn => style("WARN ").yellow(),
        LogLevel::Error => style("ERROR").red(),
    };
    format!(
        "{} {} {} {}",
        style(entry.timestamp.format("%H:%M:%S%.3f")).dim(),
        level,
        style(&entry.step_id).cyan(),
        entry.message
    )
}

/// Format the result of a tick
pub fn format_tick_report(report: &TickReport) -> String {
    let item = &report.item;
    let label = format!("{} [{}]", style(&item.step_id).cyan(), style(short_id(&item.run_id)).dim());
    match &report.outcome {
        StepOutcome::Succeeded { enqueued, run_completed } => {
            let mut line = format!("{} {}", CHECK, label);
            if !enqueued.is_empty() {
                line.push_str(&format!(" → {}", style(enqueued.join(", ")).cyan()));
            }
            if *run_completed {
                line.push_str(&format!(" {} run {}", ROCKET, style("completed").green()));
            }
            line
        }
        StepOutcome::Retrying { next_attempt, error } => format!(
            "{} {} failed: {} (retrying, attempt {})",
            WARN,
            label,
            style(error).dim(),
            next_attempt
        ),
        StepOutcome::DeadLettered { attempts, error } => format!(
            "{} {} dead-lettered after {} attempt(s): {}",
            CROSS,
            label,
            attempts,
            style(error).red()
        ),
        StepOutcome::Skipped { reason } => format!("{} {} skipped ({})", INFO, label, style(reason).dim()),
    }
}
