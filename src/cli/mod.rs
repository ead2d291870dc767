//! Command-line interface for ormesh
//!
//! Provides main commands:
//! - `run` - Run the agent: publish services, forward imports
//! - `access` - Print the onion address and auth token for a client
//! - `check` - Validate the configuration, optionally against tor

mod access;
mod check;
mod run;

pub use access::run_access;
pub use check::run_check;
pub use run::run_agent;

use crate::agent::Agent;
use crate::config::{self, Config};
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// ormesh - TCP service mesh over tor hidden services
#[derive(Parser, Debug)]
#[command(name = "ormesh")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Path to configuration file [default: ~/.ormesh/config]
    #[arg(short, long, env = "ORMESH_CONFIG")]
    pub config: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long, default_value_t = false)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

impl Cli {
    /// Config file to use
    pub fn config_path(&self) -> Result<PathBuf> {
        match &self.config {
            Some(path) => Ok(path.clone()),
            None => config::default_path(),
        }
    }
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the agent until interrupted (typically called by systemd)
    Run(RunArgs),

    /// Show the onion address and auth token for a client
    Access(AccessArgs),

    /// Validate the configuration
    Check(CheckArgs),
}

/// Arguments for run command
#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Seconds between checks of the config file for changes
    #[arg(long, default_value_t = 5)]
    pub poll_secs: u64,
}

/// Arguments for access command
#[derive(Parser, Debug)]
pub struct AccessArgs {
    /// Client name
    pub client: String,
}

/// Arguments for check command
#[derive(Parser, Debug)]
pub struct CheckArgs {
    /// Also start the agent and query tor's version
    #[arg(long, default_value_t = false)]
    pub connect: bool,
}

/// Start an agent for `config` and push its services and remotes into tor
pub(crate) async fn start_agent(config: &Config) -> Result<Agent> {
    let mut agent = Agent::new(config)
        .await
        .context("Failed to prepare tor")?;
    agent.start().await.context("Failed to start agent")?;
    apply(&mut agent, config).await?;
    Ok(agent)
}

pub(crate) async fn apply(agent: &mut Agent, config: &Config) -> Result<()> {
    agent
        .update_services(&config.node.service)
        .await
        .context("Failed to update hidden service")?;
    agent
        .update_remotes(&config.node)
        .await
        .context("Failed to update remote client auth")?;
    Ok(())
}
