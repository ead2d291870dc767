//! Access command - hand out a client's credentials
//!
//! Tor generates an onion address and auth cookie per authorized client.
//! The client is authorized first if the config does not list it yet, and
//! the credentials are stored back into the config file.

use super::{start_agent, AccessArgs};
use crate::config::{self, is_valid_name, ClientConfig};
use anyhow::{bail, Context, Result};
use std::path::Path;
use tracing::info;

/// Run the access command
pub async fn run_access(config_path: &Path, args: &AccessArgs) -> Result<()> {
    let mut config = config::load_from_path(config_path)?;

    if !is_valid_name(&args.client) {
        bail!("invalid client name {:?}", args.client);
    }
    let clients = &mut config.node.service.clients;
    if !clients.iter().any(|c| c.name == args.client) {
        info!("Authorizing new client {}", args.client);
        clients.push(ClientConfig {
            name: args.client.clone(),
            ..Default::default()
        });
    }

    let mut agent = start_agent(&config).await?;
    let access = agent.client_access(&args.client).await;
    agent.stop().await.context("Failed to stop agent")?;
    let (address, auth) =
        access.with_context(|| format!("Failed to look up access for {}", args.client))?;

    for client in &mut config.node.service.clients {
        if client.name == args.client {
            client.address = address.clone();
            client.auth = auth.clone();
        }
    }
    config::save_to_path(&config, config_path)?;

    println!("{} {}", address, auth);
    Ok(())
}
