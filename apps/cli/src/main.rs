//! PatchScout CLI: topic management, crawl runs, and citation reprocessing.
//!
//! Seeds encyclopedia pages per topic, follows their citations, and saves
//! the cited pages that are relevant to the topic.

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