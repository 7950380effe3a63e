// src/utils/log.rs

//! Console output for the CLI with server-style formatting.
//!
//! Diagnostics go through `log`/`tracing`; this module only prints the
//! human-facing summaries (execution status, command results).

use chrono::Local;

use crate::models::{BranchRecord, PipelineExecution, StageRecord, StageState};

/// Format a line with timestamp and level
fn format_line(level: &str, message: &str) -> String {
    let timestamp = Local::now().format("%Y-%m-%d %H:%M:%S");
    format!("[{}] [{}] {}", timestamp, level, message)
}

/// Print an info line
pub fn info(message: &str) {
    println!("{}", format_line("INFO", message));
}

/// Print a success line (always shown as INFO)
pub fn success(message: &str) {
    println!("{}", format_line("INFO", message));
}

/// Print a warning line
pub fn warn(message: &str) {
    eprintln!("{}", format_line("WARN", message));
}

/// Print an error line
pub fn error(message: &str) {
    eprintln!("{}", format_line("ERROR", message));
}

/// Print a header
pub fn header(title: &str) {
    let border = "═".repeat(60);
    println!("{}", format_line("INFO", &border));
    println!("{}", format_line("INFO", &format!("  {}", title)));
    println!("{}", format_line("INFO", &border));
}

/// Print a summary section
pub fn summary(title: &str, items: &[(&str, String)]) {
    println!();
    println!("{}", format_line("INFO", &format!("[SUMMARY] {}", title)));
    for (key, value) in items {
        println!("{}", format_line("INFO", &format!("    {}: {}", key, value)));
    }
}

fn stage_line(name: &str, record: &StageRecord) -> String {
    let mut line = format!("{:<18} {:<10}", name, state_label(record.state));
    if record.attempts > 0 {
        line.push_str(&format!(" attempts={}", record.attempts));
    }
    if let Some(error) = &record.error {
        line.push_str(&format!(" [{}] {}", error.kind, error.reason));
    }
    line
}

fn state_label(state: StageState) -> &'static str {
    match state {
        StageState::Pending => "pending",
        StageState::Running => "running",
        StageState::Succeeded => "succeeded",
        StageState::Skipped => "skipped",
        StageState::Failed => "failed",
    }
}

fn branch_lines(branch: &BranchRecord) -> Vec<String> {
    let mut lines = vec![format!(
        "user {} → {}",
        branch.user_id,
        match &branch.failure {
            Some(f) => format!("failed({})", f.kind),
            None => format!("{:?}", branch.outcome).to_lowercase(),
        }
    )];
    for (stage, record) in &branch.stages {
        lines.push(format!("    {}", stage_line(stage.as_str(), record)));
    }
    if let Some(artifact) = &branch.artifact {
        lines.push(format!("    artifact {}/{}", artifact.bucket, artifact.key));
    }
    lines
}

/// Render an execution as indented status lines.
pub fn execution_report(execution: &PipelineExecution) -> Vec<String> {
    let mut lines = vec![
        format!("execution {}", execution.execution_id),
        format!(
            "trigger   {}/{} @ {}",
            execution.trigger.bucket, execution.trigger.key, execution.trigger.version
        ),
        format!("status    {}", execution.status),
    ];
    if let Some(failure) = &execution.failure {
        lines.push(format!(
            "failure   [{}] {}: {}",
            failure.kind, failure.stage, failure.reason
        ));
    }
    if !execution.branches.is_empty() {
        let finished = execution.branches.values().filter(|b| b.is_finished()).count();
        lines.push(format!(
            "branches  {finished}/{} finished",
            execution.branches.len()
        ));
    }
    for (stage, record) in &execution.stages {
        lines.push(format!("  {}", stage_line(stage.as_str(), record)));
    }
    for branch in execution.branches.values() {
        lines.extend(branch_lines(branch).into_iter().map(|l| format!("  {l}")));
    }
    lines
}

/// Print an execution status report
pub fn execution(execution: &PipelineExecution) {
    for line in execution_report(execution) {
        println!("{}", format_line("INFO", &line));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::models::{BranchOutcome, FailureRecord, Stage, TriggerInput};

    #[test]
    fn test_execution_report() {
        let mut exec =
            PipelineExecution::new(TriggerInput::new("b", "raw/2024-01.csv", Some("v1".into())));
        exec.stage_mut(Stage::Ingest).state = StageState::Succeeded;
        exec.stage_mut(Stage::Ingest).attempts = 1;

        let branch = exec.branch_mut("u2");
        branch.outcome = BranchOutcome::Failed;
        branch.failure = Some(FailureRecord {
            stage: Stage::Deliver,
            user_id: Some("u2".into()),
            kind: ErrorKind::Permission,
            reason: "slack: not_in_channel".into(),
        });

        exec.branch_mut("u1").outcome = BranchOutcome::Running;

        let report = execution_report(&exec).join("\n");
        assert!(report.contains("status    running"));
        assert!(report.contains("branches  1/2 finished"));
        assert!(report.contains("user u1 → running"));
        assert!(report.contains("Ingest"));
        assert!(report.contains("attempts=1"));
        assert!(report.contains("user u2 → failed(PermissionError)"));
    }
}
