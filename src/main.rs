mod args;
mod commands;

use args::{Cli, Commands};
use clap::Parser;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run { config, no_proxy } => commands::run::cmd_run(config, no_proxy).await?,
        Commands::Proxy { config } => commands::proxy::cmd_proxy(config).await?,
        Commands::Plan { config } => commands::plan::cmd_plan(config).await?,
    }

    Ok(())
}
