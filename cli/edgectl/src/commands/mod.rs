//! CLI command definitions and dispatch.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use edge_store::{OvsdbCliStore, OvsdbConfig, StoreClient};

use crate::output::OutputFormat;

mod set;
mod show;

/// edgectl - edit and inspect desired host state.
#[derive(Debug, Parser)]
#[command(name = "edgectl", version, about = "Edit and inspect edge host desired state")]
pub struct Cli {
    /// Store remote.
    #[arg(long, global = true, env = "EDGE_STORE_REMOTE", default_value = edge_store::ovsdb::DEFAULT_REMOTE)]
    remote: String,

    /// Database name.
    #[arg(long, global = true, env = "EDGE_STORE_DB", default_value = edge_store::ovsdb::DEFAULT_DATABASE)]
    db: String,

    /// Schema file the database was created from.
    #[arg(long, global = true, env = "EDGE_SCHEMA_PATH", default_value = edge_store::ovsdb::DEFAULT_SCHEMA_PATH)]
    schema: PathBuf,

    /// Output format (table, json).
    #[arg(long, global = true, default_value = "table")]
    format: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Set one field of a desired-state row, creating the row if needed.
    Set(set::SetCommand),

    /// Print every row of a table.
    Show(show::ShowCommand),
}

impl Cli {
    /// Run the CLI command.
    pub async fn run(self) -> Result<()> {
        let ctx = CommandContext {
            store: OvsdbConfig::new(self.remote, self.db).with_schema(self.schema),
            format: OutputFormat::parse(&self.format),
        };

        match self.command {
            Commands::Set(cmd) => cmd.run(ctx).await,
            Commands::Show(cmd) => cmd.run(ctx).await,
        }
    }
}

/// Shared command context.
pub struct CommandContext {
    pub store: OvsdbConfig,
    pub format: OutputFormat,
}

impl CommandContext {
    /// Connect to the store with `table` replicated and loaded.
    pub async fn open(&self, table: &str) -> Result<OvsdbCliStore> {
        let config = self.store.clone().with_tables([table]);
        let mut store = OvsdbCliStore::connect(config)
            .await
            .with_context(|| format!("failed to connect to {}", self.store.remote))?;
        store
            .run()
            .await
            .with_context(|| format!("failed to read table {table}"))?;
        Ok(store)
    }
}
