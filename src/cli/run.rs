//! Run command - the long-lived agent
//!
//! Starts the agent, applies the configuration, then waits. SIGHUP or a
//! change to the config file reloads it; SIGINT/SIGTERM stop tor and exit.

use super::{apply, RunArgs};
use crate::agent::{Agent, AgentState};
use crate::config::{self, Config, DaemonMode, ImportConfig};
use crate::tor::reply::Reply;
use anyhow::{Context, Result};
use std::path::Path;
use std::time::{Duration, SystemTime};
use tracing::{debug, error, info, warn};

/// Asynchronous events logged while running
const STATUS_EVENTS: &[&str] = &["STATUS_CLIENT", "STATUS_GENERAL"];

enum Wake {
    Stop,
    Reload,
    Poll,
}

/// Run the agent until interrupted
pub async fn run_agent(config_path: &Path, args: &RunArgs) -> Result<()> {
    info!("ormesh v{} starting", crate::VERSION);

    let mut config = config::load_from_path(config_path)?;
    let mut agent = start(&config).await?;

    if config.node.agent.mode == DaemonMode::AttachedCookie && config.import_count() == 0 {
        info!("Configuration applied; nothing to forward");
        agent.stop().await?;
        return Ok(());
    }

    let mut signals = Signals::new()?;
    let mut poll = tokio::time::interval(Duration::from_secs(args.poll_secs.max(1)));
    let mut modified = modified_time(config_path);

    loop {
        let wake = tokio::select! {
            wake = signals.recv() => wake,
            _ = poll.tick() => Wake::Poll,
        };

        match wake {
            Wake::Stop => break,
            Wake::Reload => info!("Reload requested"),
            Wake::Poll => {
                let current = modified_time(config_path);
                if current == modified {
                    continue;
                }
                info!("Config file changed, reloading");
            },
        }
        modified = modified_time(config_path);

        reload_or_exit(config_path, &mut config, &mut agent).await?;
    }

    info!("Shutting down");
    agent.stop().await.context("Failed to stop agent")?;
    Ok(())
}

async fn start(config: &Config) -> Result<Agent> {
    let mut agent = Agent::new(config)
        .await
        .context("Failed to prepare tor")?;
    for event in STATUS_EVENTS {
        agent.on_event(event, log_status);
    }
    agent.start().await.context("Failed to start agent")?;
    if let Err(e) = configure(&mut agent, config).await {
        if let Err(stop) = agent.stop().await {
            warn!("Failed to stop agent: {}", stop);
        }
        return Err(e);
    }
    Ok(agent)
}

async fn configure(agent: &mut Agent, config: &Config) -> Result<()> {
    apply(agent, config).await?;
    agent
        .subscribe(STATUS_EVENTS)
        .await
        .context("Failed to subscribe to status events")?;
    Ok(())
}

fn log_status(reply: Reply) {
    info!(target: "tor", "{}", reply.text);
}

/// Reload, riding out bad edits and failed in-place updates. An agent
/// that could not be restarted ends the run.
async fn reload_or_exit(path: &Path, config: &mut Config, agent: &mut Agent) -> Result<()> {
    match reload(path, config, agent).await {
        Ok(()) => Ok(()),
        Err(e) if agent.state() == AgentState::Ready => {
            error!("Reload failed: {:#}", e);
            Ok(())
        },
        Err(e) => Err(e.context("Agent restart failed")),
    }
}

/// Re-read the config; restart the agent if the daemon or imports changed,
/// otherwise re-apply services and remotes in place
async fn reload(path: &Path, config: &mut Config, agent: &mut Agent) -> Result<()> {
    let next = config::load_from_path(path)?;

    if needs_restart(config, &next) {
        info!("Daemon settings or imports changed, restarting agent");
        agent.stop().await.context("Failed to stop agent")?;
        *agent = start(&next).await?;
    } else {
        apply(agent, &next).await?;
    }

    *config = next;
    Ok(())
}

fn needs_restart(current: &Config, next: &Config) -> bool {
    current.node.agent != next.node.agent || imports(current) != imports(next)
}

fn imports(config: &Config) -> Vec<(&str, &ImportConfig)> {
    config
        .node
        .remotes
        .iter()
        .flat_map(|r| r.imports.iter().map(move |i| (r.address.as_str(), i)))
        .collect()
}

fn modified_time(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}

#[cfg(unix)]
struct Signals {
    terminate: tokio::signal::unix::Signal,
    interrupt: tokio::signal::unix::Signal,
    hangup: tokio::signal::unix::Signal,
}

#[cfg(unix)]
impl Signals {
    fn new() -> Result<Self> {
        use tokio::signal::unix::{signal, SignalKind};
        Ok(Self {
            terminate: signal(SignalKind::terminate()).context("Failed to watch SIGTERM")?,
            interrupt: signal(SignalKind::interrupt()).context("Failed to watch SIGINT")?,
            hangup: signal(SignalKind::hangup()).context("Failed to watch SIGHUP")?,
        })
    }

    async fn recv(&mut self) -> Wake {
        tokio::select! {
            _ = self.terminate.recv() => {
                debug!("SIGTERM");
                Wake::Stop
            },
            _ = self.interrupt.recv() => {
                debug!("SIGINT");
                Wake::Stop
            },
            _ = self.hangup.recv() => Wake::Reload,
        }
    }
}

#[cfg(not(unix))]
struct Signals;

#[cfg(not(unix))]
impl Signals {
    fn new() -> Result<Self> {
        Ok(Self)
    }

    async fn recv(&mut self) -> Wake {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to watch Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
        Wake::Stop
    }
}
