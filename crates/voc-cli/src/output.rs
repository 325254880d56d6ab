//! Output formatting for voc (table, json)

use clap::ValueEnum;
use colored::Colorize;
use serde::Serialize;
use tabled::{Table, Tabled};

/// Output format options
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// ASCII table format (default)
    #[default]
    Table,
    /// JSON format
    Json,
}

/// Context for output rendering
pub struct OutputContext {
    pub format: OutputFormat,
    pub quiet: bool,
}

impl OutputContext {
    pub fn new(format: OutputFormat, no_color: bool, quiet: bool) -> Self {
        if no_color {
            colored::control::set_override(false);
        }
        Self { format, quiet }
    }

    /// Print a success message (unless in quiet mode)
    pub fn success(&self, msg: &str) {
        if !self.quiet {
            println!("{}", msg.green());
        }
    }

    /// Print an info message (unless in quiet mode)
    pub fn info(&self, msg: &str) {
        if !self.quiet {
            println!("{}", msg);
        }
    }

    /// Print a warning message
    pub fn warn(&self, msg: &str) {
        eprintln!("{}", msg.yellow());
    }

    /// Print rows in the configured format
    pub fn print<T: Tabled + Serialize>(&self, data: &[T]) {
        match self.format {
            OutputFormat::Table => {
                if data.is_empty() {
                    if !self.quiet {
                        println!("No data");
                    }
                } else {
                    println!("{}", Table::new(data));
                }
            }
            OutputFormat::Json => {
                println!(
                    "{}",
                    serde_json::to_string_pretty(data).unwrap_or_else(|_| "[]".to_string())
                );
            }
        }
    }

    /// Print a raw value; scalars bare in table mode, everything else as JSON
    pub fn print_value(&self, value: &serde_json::Value) {
        match (self.format, value) {
            (OutputFormat::Table, serde_json::Value::String(s)) => println!("{}", s),
            (OutputFormat::Table, serde_json::Value::Number(_) | serde_json::Value::Bool(_)) => {
                println!("{}", value)
            }
            _ => println!(
                "{}",
                serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
            ),
        }
    }
}

/// Format a JSON value for a table cell
pub fn format_value(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::Null => "-".to_string(),
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Number(n) => n.to_string(),
        serde_json::Value::Bool(b) => b.to_string(),
        serde_json::Value::Array(arr) => {
            let items: Vec<String> = arr.iter().map(format_value).collect();
            items.join(", ")
        }
        serde_json::Value::Object(_) => serde_json::to_string(value).unwrap_or_default(),
    }
}

// =============================================================================
// Display types for various commands
// =============================================================================

/// Vehicle display for list command
#[derive(Debug, Tabled, Serialize)]
pub struct VehicleRow {
    #[tabled(rename = "VIN")]
    pub vin: String,
    #[tabled(rename = "Registration")]
    pub registration: String,
    #[tabled(rename = "Model")]
    pub model: String,
}

/// Instrument display for status command
#[derive(Debug, Tabled, Serialize)]
pub struct InstrumentRow {
    #[tabled(rename = "Instrument")]
    pub name: String,
    #[tabled(rename = "Value")]
    pub value: String,
    #[tabled(rename = "Unit")]
    pub unit: String,
}

/// Trip display for trips command
#[derive(Debug, Tabled, Serialize)]
pub struct TripRow {
    #[tabled(rename = "ID")]
    pub id: String,
    #[tabled(rename = "Start")]
    pub start: String,
    #[tabled(rename = "End")]
    pub end: String,
    #[tabled(rename = "Distance (km)")]
    pub distance_km: String,
    #[tabled(rename = "Fuel")]
    pub fuel: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_format_value() {
        assert_eq!(format_value(&json!(null)), "-");
        assert_eq!(format_value(&json!("Normal")), "Normal");
        assert_eq!(format_value(&json!(42)), "42");
        assert_eq!(format_value(&json!(["left", "right"])), "left, right");
    }
}
