//! serviceradar-agent — node-resident monitoring agent.
//!
//! Exposes a secured gRPC endpoint pollers query for the health of
//! services on, or reachable from, this node. Run
//! `serviceradar-agent --help` for usage.

use anyhow::Result;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

mod capture;
mod checker;
mod cli;
mod config;
mod dispatcher;
mod error;
mod grpc_checker;
mod icmp_checker;
mod port_checker;
mod process_checker;
mod proto;
mod security;
mod server;
mod snmp_checker;
mod transport;

use cli::{Cli, Commands};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Init => {
            let example = config::ServerConfig::example();
            println!("{}", serde_json::to_string_pretty(&example)?);
        }
        Commands::Run => {
            let config = config::ServerConfig::load(&cli.config)?;
            let server = server::AgentServer::new(config).await?;

            // SIGINT/SIGTERM drive the same shutdown path as stop().
            {
                let server = server.clone();
                tokio::spawn(async move {
                    shutdown_signal().await;
                    info!("shutdown signal received");
                    server.stop().await;
                });
            }

            server.run().await?;
            info!("agent stopped");
        }
    }

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut term =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {}
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
}
