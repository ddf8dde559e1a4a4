//! CompIntel CLI: resumable, budget-bounded competitor research.
//!
//! Researches every configured competitor, reconciles the claims gathered
//! from many sources, and records spend and checkpoints so an interrupted
//! run picks up where it stopped.

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
