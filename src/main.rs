//! ormesh - a TCP service mesh over tor hidden services
//!
//! Each node publishes local services on its own hidden service, hands
//! out per-client stealth credentials, and forwards local ports to the
//! services of remote nodes through tor's SOCKS port.
//!
//! # Usage
//!
//! ```bash
//! # Print credentials for a new client
//! ormesh access alice
//!
//! # Validate config and test the tor connection
//! ormesh check --connect
//!
//! # Run the agent
//! ormesh run
//! ```

use anyhow::Result;
use clap::Parser;
use ormesh::cli::{self, Cli, Commands};
use ormesh::logging;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(cli.verbose);

    let config_path = cli.config_path()?;

    match &cli.command {
        Commands::Run(args) => {
            cli::run_agent(&config_path, args).await?;
        },
        Commands::Access(args) => {
            cli::run_access(&config_path, args).await?;
        },
        Commands::Check(args) => {
            cli::run_check(&config_path, args).await?;
        },
    }

    Ok(())
}
