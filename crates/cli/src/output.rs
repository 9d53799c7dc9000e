// Output formatting for CLI

use anyhow::Result;
use clap::ValueEnum;
use runsync_core::{EntityView, Envelope};
use serde::Serialize;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable tables and fields
    #[default]
    Text,
    Json,
    Yaml,
}

impl OutputFormat {
    pub fn print_value<T: Serialize>(&self, value: &T) -> Result<()> {
        match self {
            OutputFormat::Json => {
                println!("{}", serde_json::to_string_pretty(value)?);
            }
            OutputFormat::Yaml => {
                println!("{}", serde_yaml::to_string(value)?);
            }
            OutputFormat::Text => {
                // Text format is handled by each command
            }
        }
        Ok(())
    }

    /// One JSON document per line, for streaming output
    pub fn print_line<T: Serialize>(&self, value: &T) -> Result<()> {
        match self {
            OutputFormat::Yaml => println!("---\n{}", serde_yaml::to_string(value)?),
            _ => println!("{}", serde_json::to_string(value)?),
        }
        Ok(())
    }

    pub fn is_text(&self) -> bool {
        matches!(self, OutputFormat::Text)
    }
}

/// Print a simple key-value pair for text output
pub fn print_field(label: &str, value: &str) {
    println!("{:<14} {}", format!("{}:", label), value);
}

/// Print a table header
pub fn print_table_header(columns: &[(&str, usize)]) {
    let header: String = columns
        .iter()
        .map(|(name, width)| format!("{:<width$}", name, width = width))
        .collect::<Vec<_>>()
        .join("  ");
    println!("{}", header);
}

/// Print a table row
pub fn print_table_row(values: &[(&str, usize)]) {
    let row: String = values
        .iter()
        .map(|(val, width)| format!("{:<width$}", truncate(val, *width), width = width))
        .collect::<Vec<_>>()
        .join("  ");
    println!("{}", row);
}

pub const EVENT_COLUMNS: [(&str, usize); 3] = [("TIME", 23), ("TYPE", 28), ("ID", 36)];

pub fn print_event_row(event: &Envelope) {
    let time = event.timestamp.format("%Y-%m-%d %H:%M:%S%.3f").to_string();
    print_table_row(&[
        (&time, EVENT_COLUMNS[0].1),
        (&event.event_type, EVENT_COLUMNS[1].1),
        (&event.id, EVENT_COLUMNS[2].1),
    ]);
}

/// Status line of a watched entity
pub fn format_view_summary(view: &EntityView) -> String {
    let mut line = format!("{} [{}] {}", view.entity_id, view.lifecycle, view.status);
    line.push_str(&format!(" · {}", view.connection));
    if view.retry_count > 0 {
        line.push_str(&format!(" (retry {})", view.retry_count));
    }
    if view.stale {
        line.push_str(" · stale");
    }
    if view.not_found {
        line.push_str(" · not found");
    }
    if let Some(message) = view.error_message() {
        line.push_str(&format!(" · {}", message));
    }
    line
}

/// Truncate on a char boundary, marking the cut with "..."
fn truncate(value: &str, width: usize) -> String {
    if value.chars().count() <= width {
        return value.to_string();
    }
    let keep = width.saturating_sub(3);
    let mut out: String = value.chars().take(keep).collect();
    out.push_str("...");
    out
}
