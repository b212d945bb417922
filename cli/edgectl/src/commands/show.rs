//! `edgectl show` - print every row of a table.

use anyhow::Result;
use clap::Args;
use edge_store::StoreClient;

use super::CommandContext;
use crate::output::print_rows;

#[derive(Debug, Args)]
pub struct ShowCommand {
    /// Table name, e.g. Interface or VirtualMachine.
    table: String,
}

impl ShowCommand {
    pub async fn run(self, ctx: CommandContext) -> Result<()> {
        let store = ctx.open(&self.table).await?;
        let snapshot = store.table(&self.table)?;
        let rows: Vec<_> = snapshot.iter().map(|(_, row)| row.clone()).collect();
        print_rows(&rows, ctx.format);
        Ok(())
    }
}
