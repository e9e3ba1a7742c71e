//! Job report rendering
//!
//! Turns a finished job's history record into a shareable document.

use std::fmt::Write as _;

use chrono::SecondsFormat;
use clap::ValueEnum;

use reelbatch_lib::core::batch::{ItemResult, JobHistoryRecord};

/// Report output format
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum ReportFormat {
    /// Full record as pretty JSON
    #[default]
    Json,
    /// One row per item
    Csv,
    /// Summary plus item table
    Markdown,
    /// Standalone HTML page
    Html,
}

impl ReportFormat {
    /// Conventional file extension
    pub fn extension(self) -> &'static str {
        match self {
            ReportFormat::Json => "json",
            ReportFormat::Csv => "csv",
            ReportFormat::Markdown => "md",
            ReportFormat::Html => "html",
        }
    }
}

/// Renders `record` in the requested format
pub fn render(record: &JobHistoryRecord, format: ReportFormat) -> anyhow::Result<String> {
    let text = match format {
        ReportFormat::Json => serde_json::to_string_pretty(record)?,
        ReportFormat::Csv => render_csv(record),
        ReportFormat::Markdown => render_markdown(record),
        ReportFormat::Html => render_html(record),
    };
    Ok(text)
}

fn outcome(result: &ItemResult) -> &'static str {
    if result.success {
        "ok"
    } else {
        "failed"
    }
}

fn detail(result: &ItemResult) -> String {
    match (&result.error, &result.payload) {
        (Some(error), _) => error.clone(),
        (None, Some(payload)) => payload.to_string(),
        (None, None) => String::new(),
    }
}

/// Items in submission order
fn sorted_results(record: &JobHistoryRecord) -> Vec<&ItemResult> {
    let mut results: Vec<&ItemResult> = record.results.iter().collect();
    results.sort_by_key(|r| r.index);
    results
}

// =============================================================================
// CSV
// =============================================================================

fn csv_field(value: &str) -> String {
    if value.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

fn render_csv(record: &JobHistoryRecord) -> String {
    let mut out = String::from("index,item_id,status,duration_ms,detail\n");
    for result in sorted_results(record) {
        let _ = writeln!(
            out,
            "{},{},{},{},{}",
            result.index,
            csv_field(&result.item_id),
            outcome(result),
            result.duration_ms,
            csv_field(&detail(result))
        );
    }
    out
}

// =============================================================================
// Markdown
// =============================================================================

fn md_cell(value: &str) -> String {
    value.replace('|', "\\|").replace('\n', " ")
}

fn render_markdown(record: &JobHistoryRecord) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "# Batch job `{}`\n", record.job_id);
    let _ = writeln!(out, "| Field | Value |");
    let _ = writeln!(out, "| --- | --- |");
    let _ = writeln!(out, "| Operation | {} |", record.operation);
    let _ = writeln!(out, "| Status | {} |", record.status);
    let _ = writeln!(
        out,
        "| Items | {} processed of {} ({} ok, {} failed, {} skipped) |",
        record.total_processed,
        record.total_items,
        record.success_count,
        record.failure_count,
        record.skipped_count
    );
    let _ = writeln!(out, "| Duration | {} ms |", record.execution_time_ms);
    let _ = writeln!(
        out,
        "| Finished | {} |",
        record.finished_at.to_rfc3339_opts(SecondsFormat::Secs, true)
    );

    if !record.results.is_empty() {
        let _ = writeln!(out, "\n## Items\n");
        let _ = writeln!(out, "| # | Item | Status | Duration (ms) | Detail |");
        let _ = writeln!(out, "| --- | --- | --- | --- | --- |");
        for result in sorted_results(record) {
            let _ = writeln!(
                out,
                "| {} | {} | {} | {} | {} |",
                result.index,
                md_cell(&result.item_id),
                outcome(result),
                result.duration_ms,
                md_cell(&detail(result))
            );
        }
    }

    if !record.errors.is_empty() {
        let _ = writeln!(out, "\n## Errors\n");
        for error in &record.errors {
            let _ = writeln!(out, "- {}", md_cell(error));
        }
    }
    out
}

// =============================================================================
// HTML
// =============================================================================

fn html_escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for ch in value.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            other => out.push(other),
        }
    }
    out
}

fn render_html(record: &JobHistoryRecord) -> String {
    let mut out = String::new();
    let title = format!("Batch job {}", html_escape(&record.job_id));
    let _ = writeln!(out, "<!DOCTYPE html>");
    let _ = writeln!(out, "<html lang=\"en\">\n<head>\n<meta charset=\"utf-8\">");
    let _ = writeln!(out, "<title>{title}</title>");
    let _ = writeln!(
        out,
        "<style>body{{font-family:sans-serif}}table{{border-collapse:collapse}}\
         td,th{{border:1px solid #ccc;padding:4px 8px}}.failed{{color:#b00020}}</style>"
    );
    let _ = writeln!(out, "</head>\n<body>\n<h1>{title}</h1>");
    let _ = writeln!(
        out,
        "<p>{} &middot; <strong>{}</strong> &middot; {}/{} processed, {} ok, {} failed, {} skipped &middot; {} ms</p>",
        html_escape(record.operation.as_str()),
        record.status,
        record.total_processed,
        record.total_items,
        record.success_count,
        record.failure_count,
        record.skipped_count,
        record.execution_time_ms
    );

    let _ = writeln!(
        out,
        "<table>\n<tr><th>#</th><th>Item</th><th>Status</th><th>Duration (ms)</th><th>Detail</th></tr>"
    );
    for result in sorted_results(record) {
        let _ = writeln!(
            out,
            "<tr class=\"{status}\"><td>{}</td><td>{}</td><td>{status}</td><td>{}</td><td>{}</td></tr>",
            result.index,
            html_escape(&result.item_id),
            result.duration_ms,
            html_escape(&detail(result)),
            status = outcome(result),
        );
    }
    let _ = writeln!(out, "</table>\n</body>\n</html>");
    out
}
