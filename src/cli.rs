//! CLI definitions for serviceradar-agent.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[clap(
    name = "serviceradar-agent",
    version,
    about = "ServiceRadar node agent\n\nHosts the checker plane and network sweep behind a secured gRPC endpoint for pollers to query.",
    long_about = None
)]
pub struct Cli {
    /// Path to agent.json config file
    #[clap(long, short, default_value = "/etc/serviceradar/agent.json")]
    pub config: PathBuf,

    #[clap(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the agent (default when no subcommand is given)
    Run,

    /// Print an example agent.json to stdout
    Init,
}
