use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "supervisor")]
#[command(version)]
#[command(about = "Process supervisor and authenticating gateway for desktop containers", long_about = None)]
pub(crate) struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub(crate) enum Commands {
    /// Start all services, keep them healthy and serve the gateway
    Run {
        /// Config file (default: $SUPERVISOR_CONFIG or ~/.config/supervisor/config.toml)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Do not start the gateway
        #[arg(long)]
        no_proxy: bool,
    },

    /// Serve only the gateway
    Proxy {
        #[arg(short, long)]
        config: Option<PathBuf>,
    },

    /// Print the resolved start groups and exit
    Plan {
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
}
