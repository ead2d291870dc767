//! Check command - validate the configuration

use super::CheckArgs;
use crate::agent::Agent;
use crate::config;
use anyhow::{Context, Result};
use std::path::Path;

/// Run the check command
pub async fn run_check(config_path: &Path, args: &CheckArgs) -> Result<()> {
    // Loading validates
    let config = config::load_from_path(config_path)?;
    let agent = &config.node.agent;

    println!("Config:   {}", config_path.display());
    println!("Mode:     {:?}", agent.mode);
    println!("Tor:      {}", agent.tor_binary_path.display());
    println!("Control:  {}", agent.control_addr);
    println!("SOCKS:    {}", agent.socks_addr);
    println!("Exports:  {}", config.node.service.exports.len());
    println!("Clients:  {}", config.node.service.clients.len());
    println!(
        "Remotes:  {} ({} imports)",
        config.node.remotes.len(),
        config.import_count()
    );

    if args.connect {
        let mut agent = Agent::new(&config)
            .await
            .context("Failed to prepare tor")?;
        agent.start().await.context("Failed to start agent")?;
        let reply = agent
            .control()?
            .get_info("version")
            .await
            .context("Failed to query tor version");
        agent.stop().await.context("Failed to stop agent")?;

        let version = reply?
            .lines
            .iter()
            .find_map(|line| line.text.strip_prefix("version=").map(str::to_string))
            .unwrap_or_else(|| "unknown".to_string());
        println!("Version:  {}", version);
    }

    println!("OK");
    Ok(())
}
