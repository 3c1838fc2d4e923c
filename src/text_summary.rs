//! Text summary builder for CLI output.
//!
//! Formats a completed analysis result as human-readable lines for text mode.

use crate::model::AnalysisResult;

/// Pre-formatted lines for text output.
pub(crate) struct TextSummary {
    pub lines: Vec<String>,
}

/// Build a text summary of a completed job. Candidates keep the backend's order.
pub(crate) fn build_text_summary(result: &AnalysisResult) -> TextSummary {
    let mut lines = Vec::new();

    if let Some(job_id) = result.job_id.as_deref() {
        lines.push(format!("Job: {job_id}"));
    }
    lines.push(format!("Model version: {}", result.model_version));
    if let Some(at) = result.received_at.as_deref() {
        lines.push(format!("Received at: {at}"));
    }

    if result.candidates.is_empty() {
        lines.push("No candidates returned.".to_string());
        return TextSummary { lines };
    }

    lines.push(format!("Candidates: {}", result.candidates.len()));
    let width = result
        .candidates
        .iter()
        .map(|c| c.region.chars().count())
        .max()
        .unwrap_or(0);
    for c in &result.candidates {
        lines.push(format!(
            "  {:<width$}  {:>6}  [{}]",
            c.region,
            c.score_percent(),
            c.id
        ));
        if !c.rationale.trim().is_empty() {
            lines.push(format!("    {}", c.rationale));
        }
    }

    TextSummary { lines }
}
