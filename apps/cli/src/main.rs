//! catalogsync CLI: incremental Notion catalog sync with cover enrichment.
//!
//! Pulls catalog rows from Notion, looks up missing covers on Bilibili and
//! keeps the merged baseline in the configured cache.

mod commands;

use clap::Parser;
use color_eyre::eyre::Result;

use commands::Cli;

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();
    commands::init_tracing(&cli);
    commands::run(cli).await
}
