//! tandem-agent: endpoint agent for tandem
//!
//! Binary deployed next to a synchronization root. The transport layer
//! (SSH, container exec, a local pipe) launches it and wires its
//! stdin/stdout to the controller; everything session-specific arrives in
//! the initialization request on the multiplexed control channel.

use clap::{Parser, Subcommand};
use color_eyre::Result;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "tandem-agent")]
#[command(version)]
#[command(about = "Serve one side of a tandem synchronization session over stdio")]
struct Cli {
    /// Enable verbose logging (stderr)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve an endpoint on stdin/stdout
    Serve,
    /// Print version and exit
    Version,
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let cli = Cli::parse();

    // stdout carries the wire protocol; all logging goes to stderr.
    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    match cli.command {
        Commands::Version => {
            eprintln!("tandem-agent {}", env!("CARGO_PKG_VERSION"));
        }
        Commands::Serve => {
            info!("serving endpoint over stdio");
            if let Err(e) = tandem_endpoint::serve(tokio::io::stdin(), tokio::io::stdout()).await
            {
                // Connection teardown also lands here; the controller
                // decides whether it was orderly.
                error!("endpoint terminated: {e:#}");
                return Err(e);
            }
        }
    }

    Ok(())
}
