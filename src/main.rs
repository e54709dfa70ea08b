//! Dossier CLI binary.

use clap::Parser;
use tracing_subscriber::EnvFilter;

use dossier::cli::{Cli, execute};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.verbose { "dossier=debug" } else { "dossier=info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .with_writer(std::io::stderr)
        .init();

    execute(cli).await?;
    Ok(())
}
