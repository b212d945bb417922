//! Error handling and display for the CLI.

use colored::Colorize;
use edge_store::StoreError;
use thiserror::Error;

/// CLI-specific errors.
#[derive(Debug, Error)]
pub enum CliError {
    #[error("unknown {resource} field `{key}`")]
    UnknownField { resource: &'static str, key: String },

    #[error("invalid value for `{key}`: {value:?} ({reason})")]
    InvalidValue {
        key: String,
        value: String,
        reason: String,
    },

    #[error("transaction failed: {0}")]
    Commit(String),
}

impl CliError {
    pub fn invalid(key: &str, value: &str, reason: impl ToString) -> Self {
        Self::InvalidValue {
            key: key.to_string(),
            value: value.to_string(),
            reason: reason.to_string(),
        }
    }
}

/// Print an error in a user-friendly format.
pub fn print_error(err: &anyhow::Error) {
    eprintln!("{} {:#}", "Error:".red().bold(), err);

    if let Some(store_err) = err.downcast_ref::<StoreError>() {
        let hint = match store_err {
            StoreError::Unreachable { .. } => {
                Some("Hint: Check that ovsdb-server is running and --remote points at it.")
            }
            StoreError::SchemaMissing(_) => Some("Hint: Pass the schema file with --schema."),
            StoreError::DatabaseMissing(_) => {
                Some("Hint: Create the database from the schema with `ovsdb-tool create`.")
            }
            StoreError::UnknownTable(_) => Some("Hint: Table names are case-sensitive."),
            _ => None,
        };
        if let Some(hint) = hint {
            eprintln!("\n{}", hint.yellow());
        }
    }
}
