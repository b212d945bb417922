//! Output formatting for CLI commands.

use std::collections::BTreeSet;

use colored::Colorize;
use edge_store::Row;
use serde_json::{Map, Value};
use tabled::builder::Builder;

/// Output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OutputFormat {
    /// Human-readable table format.
    #[default]
    Table,
    /// JSON format.
    Json,
}

impl OutputFormat {
    pub fn parse(raw: &str) -> Self {
        match raw {
            "json" => Self::Json,
            _ => Self::Table,
        }
    }
}

/// Print store rows in the specified format.
pub fn print_rows(rows: &[Row], format: OutputFormat) {
    match format {
        OutputFormat::Table => {
            if rows.is_empty() {
                println!("{}", "No rows found.".dimmed());
            } else {
                println!("{}", render_table(rows));
            }
        }
        OutputFormat::Json => {
            let json = serde_json::to_string_pretty(&rows_json(rows))
                .unwrap_or_else(|_| "[]".to_string());
            println!("{}", json);
        }
    }
}

/// Print a success message.
pub fn print_success(message: &str) {
    println!("{} {}", "Success:".green().bold(), message);
}

/// Rows as a table: `_uuid` first, then every column seen in any row.
pub fn render_table(rows: &[Row]) -> String {
    let columns: BTreeSet<&str> = rows
        .iter()
        .flat_map(|row| row.fields.keys().map(String::as_str))
        .collect();

    let mut builder = Builder::default();
    builder.push_record(
        std::iter::once("_uuid".to_string()).chain(columns.iter().map(|c| c.to_string())),
    );
    for row in rows {
        let cells = columns
            .iter()
            .map(|column| row.get(column).map(cell).unwrap_or_default());
        builder.push_record(std::iter::once(row.id.to_string()).chain(cells));
    }
    builder.build().to_string()
}

fn rows_json(rows: &[Row]) -> Value {
    Value::Array(
        rows.iter()
            .map(|row| {
                let mut object = Map::new();
                object.insert("_uuid".to_string(), Value::String(row.id.to_string()));
                object.extend(row.fields.clone());
                Value::Object(object)
            })
            .collect(),
    )
}

fn cell(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Array(items) => items.iter().map(cell).collect::<Vec<_>>().join(","),
        other => other.to_string(),
    }
}
