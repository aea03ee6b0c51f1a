//! Card rendering for ensemble results and label mappings.

use intentvote_core::{ClassifyError, EnsembleResult, LabelMapping};

const QUERY_PREVIEW_CHARS: usize = 60;

// ── Public API ──

/// Render one classification as a card: final label, vote tally, then each model's verdict.
pub fn render_result(query: &str, result: &EnsembleResult) -> String {
    let mut lines = vec![format!("=== {} ===", preview(query)), String::new()];

    lines.push("Ensemble".into());
    let label = if result.abstained() {
        format!("{} (abstained)", result.label)
    } else {
        result.label.clone()
    };
    lines.push(row("label", &label));
    lines.push(row("confidence", &format!("{:.4}", result.confidence)));
    let votes: Vec<String> = result
        .votes
        .iter()
        .map(|(label, n)| format!("{label}={n}"))
        .collect();
    lines.push(row("votes", &votes.join(", ")));
    lines.push(String::new());

    lines.push("Models".into());
    for (model, verdict) in &result.verdicts {
        lines.push(row(
            model,
            &format!("{:<16} {:.4}", verdict.label(), verdict.confidence()),
        ));
    }
    lines.push(String::new());

    lines.join("\n")
}

/// Render a failed classification.
pub fn render_error(query: &str, err: &ClassifyError) -> String {
    let mut lines = vec![format!("=== {} ===", preview(query))];
    lines.push(row("stage", err.stage()));
    if let Some(model) = err.model() {
        lines.push(row("model", model));
    }
    lines.push(row("error", &err.to_string()));
    lines.join("\n")
}

/// Render the code → label table in numeric code order.
pub fn render_labels(labels: &LabelMapping) -> String {
    let summary = labels.summary();
    let mut out = format!(
        "{} codes, {} distinct labels\n\n",
        summary.codes, summary.distinct_labels
    );
    for (code, label) in labels.entries() {
        out.push_str(&row(code, label));
        out.push('\n');
    }
    out
}

// ── Helpers ──

fn row(key: &str, value: &str) -> String {
    format!("  {key:<26} {value}")
}

fn preview(query: &str) -> String {
    if query.chars().count() <= QUERY_PREVIEW_CHARS {
        return query.to_string();
    }
    let cut: String = query.chars().take(QUERY_PREVIEW_CHARS).collect();
    format!("{cut}...")
}
