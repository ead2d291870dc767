//! Configuration validation
//!
//! Fail-fast validation of configuration invariants.

use super::{split_port, Config, DaemonMode};
use anyhow::{bail, Result};
use std::collections::HashSet;

/// Validate configuration invariants
pub fn validate(config: &Config) -> Result<()> {
    validate_agent(config)?;
    validate_service(config)?;
    validate_remotes(config)?;
    Ok(())
}

/// Names start with a letter, then letters, digits, `_` or `-`
pub fn is_valid_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) if first.is_ascii_alphabetic() => {},
        _ => return false,
    }
    let rest = chars.as_str();
    !rest.is_empty()
        && rest
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

fn validate_agent(config: &Config) -> Result<()> {
    let agent = &config.node.agent;

    for (field, addr) in [
        ("socks_addr", &agent.socks_addr),
        ("control_addr", &agent.control_addr),
    ] {
        if split_port(addr).is_none() {
            bail!("node.agent.{} must be host:port, got {:?}", field, addr);
        }
    }

    if agent.mode == DaemonMode::AttachedCookie && agent.control_cookie.is_none() {
        bail!("node.agent.control_cookie is required in attached-cookie mode");
    }

    if agent.boot_timeout_secs == Some(0) {
        bail!("node.agent.boot_timeout_secs cannot be 0");
    }

    Ok(())
}

fn validate_service(config: &Config) -> Result<()> {
    let service = &config.node.service;

    let mut ports = HashSet::new();
    for export in &service.exports {
        if split_port(&export.local_addr).is_none() {
            bail!(
                "export local_addr must be host:port, got {:?}",
                export.local_addr
            );
        }
        if export.port == Some(0) {
            bail!("export port for {} cannot be 0", export.local_addr);
        }
        if let Some(port) = export.virtual_port() {
            if !ports.insert(port) {
                bail!("export port {} is used more than once", port);
            }
        }
    }

    let mut names = HashSet::new();
    for client in &service.clients {
        if !is_valid_name(&client.name) {
            bail!("invalid client name {:?}", client.name);
        }
        if !names.insert(client.name.as_str()) {
            bail!("duplicate client name {:?}", client.name);
        }
    }

    Ok(())
}

fn validate_remotes(config: &Config) -> Result<()> {
    let mut names = HashSet::new();
    let mut local_ports = HashSet::new();

    for remote in &config.node.remotes {
        if !is_valid_name(&remote.name) {
            bail!("invalid remote name {:?}", remote.name);
        }
        if !names.insert(remote.name.as_str()) {
            bail!("duplicate remote name {:?}", remote.name);
        }
        if remote.address.is_empty() {
            bail!("remote {} has no address", remote.name);
        }

        for import in &remote.imports {
            if import.local_port == 0 || import.remote_port == 0 {
                bail!("remote {}: import ports cannot be 0", remote.name);
            }
            if !local_ports.insert((import.local_addr.as_str(), import.local_port)) {
                bail!(
                    "remote {}: local port {}:{} is already imported",
                    remote.name,
                    import.local_addr,
                    import.local_port
                );
            }
        }
    }

    Ok(())
}
