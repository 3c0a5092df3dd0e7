use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use relay_engine::server::handler::RelayServer;
use relay_engine::{telemetry, RelayConfig};

#[derive(Parser)]
#[command(name = "relay-engine")]
#[command(author, version, about = "Parallel range relay and live mux pipe for remote media")]
struct Cli {
    /// Path to config file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the relay HTTP server
    Serve {
        /// Host to bind to (overrides config)
        #[arg(long)]
        host: Option<String>,

        /// Port to listen on (overrides config)
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Validate the configuration file and print the effective settings
    Validate,
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("failed to listen for ctrl-c: {}", e);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!("failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    telemetry::init_tracing(cli.verbose);

    let mut config = RelayConfig::load_or_default(cli.config.as_deref())?;

    match cli.command {
        Commands::Serve { host, port } => {
            if let Some(host) = host {
                config.server.host = host;
            }
            if let Some(port) = port {
                config.server.port = port;
            }
            let server = RelayServer::start(&config).await?;
            tracing::info!(
                "relaying with part_size={} concurrency={} mux={}",
                config.fetch.part_size,
                config.fetch.concurrency,
                config.mux.program
            );
            shutdown_signal().await;
            tracing::info!("shutting down");
            server.shutdown_and_wait().await;
        }
        Commands::Validate => {
            config.validate()?;
            println!("{config:#?}");
        }
    }
    Ok(())
}
