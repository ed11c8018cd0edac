//! Text summary builder for CLI output.
//!
//! Formats human-readable lines for text mode after a job finishes.

use crate::model::{JobOutcome, WorkflowKind};

/// Pre-formatted lines for text output.
pub(crate) struct TextSummary {
    pub lines: Vec<String>,
}

/// Build a text summary from a finished job.
pub(crate) fn build_text_summary(outcome: &JobOutcome) -> TextSummary {
    let mut lines = Vec::new();

    lines.push(format!("File: {}", outcome.filename));
    let kind = match outcome.workflow_kind {
        WorkflowKind::Standard => "standard",
        WorkflowKind::ChainedTransform => "chained transform (CAPS)",
    };
    lines.push(format!("Workflow: {}", kind));
    lines.push(format!(
        "Sessions: {} ({})",
        outcome.session_chain.len(),
        outcome.session_chain.join(" -> ")
    ));
    if let Some(task_count) = outcome.task_count {
        lines.push(format!("Translated units: {}", task_count));
    }
    lines.push(format!(
        "Duration: {:.1}s",
        outcome.duration_ms as f64 / 1000.0
    ));
    if let Some(path) = outcome.output_path.as_deref() {
        lines.push(format!("Result: {}", path.display()));
    }

    TextSummary { lines }
}
