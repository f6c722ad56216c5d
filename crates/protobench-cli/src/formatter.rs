//! Output formatters for comparison reports.

use clap::ValueEnum;
use comfy_table::{Cell, CellAlignment, Table};
use protobench_core::stats::format_latency;
use protobench_core::{ComparisonReport, ReportEntry};

/// Output format for reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// ASCII table format
    Table,
    /// JSON format
    Json,
    /// CSV format
    Csv,
}

impl std::fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OutputFormat::Table => write!(f, "table"),
            OutputFormat::Json => write!(f, "json"),
            OutputFormat::Csv => write!(f, "csv"),
        }
    }
}

/// Trait for formatting output.
pub trait Formatter: Send + Sync {
    /// Format a comparison report.
    fn format_report(&self, report: &ComparisonReport) -> String;

    /// Format an error message.
    fn format_error(&self, error: &str) -> String;
}

/// Create a formatter for the given output format.
pub fn create_formatter(format: OutputFormat) -> Box<dyn Formatter> {
    match format {
        OutputFormat::Table => Box::new(TableFormatter),
        OutputFormat::Json => Box::new(JsonFormatter),
        OutputFormat::Csv => Box::new(CsvFormatter),
    }
}

/// Table formatter using comfy-table.
pub struct TableFormatter;

impl Formatter for TableFormatter {
    fn format_report(&self, report: &ComparisonReport) -> String {
        if report.is_empty() {
            return "No results".to_string();
        }

        let mut table = Table::new();
        table.set_header(vec![
            "label", "driver", "target", "operation", "workers", "state", "samples", "errors",
            "mean", "p50", "p95", "p99", "max", "ops/s", "vs first",
        ]);

        for entry in &report.entries {
            let s = &entry.summary;
            table.add_row(vec![
                Cell::new(&entry.label),
                Cell::new(&entry.driver),
                Cell::new(&entry.target),
                Cell::new(&entry.operation),
                Cell::new(entry.concurrency).set_alignment(CellAlignment::Right),
                Cell::new(entry.state),
                Cell::new(s.samples).set_alignment(CellAlignment::Right),
                Cell::new(format!("{} ({:.2}%)", s.failures, s.error_rate_pct()))
                    .set_alignment(CellAlignment::Right),
                Cell::new(format_latency(s.mean_ns.round() as u64)),
                Cell::new(format_latency(s.p50_ns)),
                Cell::new(format_latency(s.p95_ns)),
                Cell::new(format_latency(s.p99_ns)),
                Cell::new(format_latency(s.max_ns)),
                Cell::new(format!("{:.1}", s.throughput)).set_alignment(CellAlignment::Right),
                Cell::new(format!("{:.2}x", entry.relative_mean)).set_alignment(CellAlignment::Right),
            ]);
        }

        let mut output = table.to_string();
        for entry in report.entries.iter().filter(|e| e.abort_reason.is_some()) {
            output.push_str(&format!(
                "\n{} aborted after {} samples: {}",
                entry.label,
                entry.summary.samples,
                entry.abort_reason.as_deref().unwrap_or_default()
            ));
        }
        output
    }

    fn format_error(&self, error: &str) -> String {
        format!("Error: {}", error)
    }
}

/// JSON formatter.
pub struct JsonFormatter;

impl Formatter for JsonFormatter {
    fn format_report(&self, report: &ComparisonReport) -> String {
        serde_json::to_string_pretty(report).unwrap_or_else(|_| "{}".to_string())
    }

    fn format_error(&self, error: &str) -> String {
        serde_json::json!({
            "error": error
        })
        .to_string()
    }
}

/// CSV formatter.
pub struct CsvFormatter;

const CSV_HEADER: &str = "label,driver,target,operation,concurrency,state,samples,failures,\
error_rate,mean_ns,min_ns,p50_ns,p95_ns,p99_ns,max_ns,std_dev_ns,throughput,relative_mean";

impl Formatter for CsvFormatter {
    fn format_report(&self, report: &ComparisonReport) -> String {
        let mut output = String::from(CSV_HEADER);
        for entry in &report.entries {
            output.push('\n');
            output.push_str(&csv_row(entry));
        }
        output
    }

    fn format_error(&self, error: &str) -> String {
        format!("error\n\"{}\"", escape_csv(error))
    }
}

fn csv_row(entry: &ReportEntry) -> String {
    let s = &entry.summary;
    format!(
        "\"{}\",{},\"{}\",\"{}\",{},{},{},{},{:.6},{:.1},{},{},{},{},{},{:.1},{:.3},{:.4}",
        escape_csv(&entry.label),
        entry.driver,
        escape_csv(&entry.target),
        escape_csv(&entry.operation),
        entry.concurrency,
        entry.state,
        s.samples,
        s.failures,
        s.error_rate,
        s.mean_ns,
        s.min_ns,
        s.p50_ns,
        s.p95_ns,
        s.p99_ns,
        s.max_ns,
        s.std_dev_ns,
        s.throughput,
        entry.relative_mean,
    )
}

/// Escape a string for CSV output.
fn escape_csv(s: &str) -> String {
    s.replace('"', "\"\"")
}
