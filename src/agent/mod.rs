//! Tor daemon supervision
//!
//! The [`Agent`] owns (or attaches to) a tor daemon, holds the authenticated
//! control connection, pushes hidden-service and client-auth settings into
//! tor, and runs one [`Forwarder`] per imported remote port.
//!
//! Startup connects with a bounded linear back-off: attempt `n` that fails
//! to dial, or finds the cookie file missing, pauses `n` steps before the
//! next attempt. A rejected authentication is never retried.

pub mod error;
pub mod forward;
pub mod socks;

pub use error::AgentError;
pub use forward::{Forwarder, ForwarderHandle};

use crate::config::{Config, DaemonMode, NodeConfig, ServiceConfig};
use crate::tor::control::{quote, ControlConnection};
use crate::tor::events::{Demux, EventHandler};
use crate::tor::process::{self, LaunchAuth, LaunchOptions, TorProcess};
use crate::tor::reply::Reply;
use std::io;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Name of the file tor writes the service and client addresses to
pub const HOSTNAME_FILE: &str = "hostname";

const HIDDEN_SERVICE_PORT: &str = "HiddenServicePort";
const HIDDEN_SERVICE_AUTHORIZE_CLIENT: &str = "HiddenServiceAuthorizeClient";
const HID_SERV_AUTH: &str = "HidServAuth";

/// Lifecycle of an [`Agent`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentState {
    NotStarted,
    /// Launching tor or dialing its control port
    Starting,
    /// Connected, authentication in flight
    AuthPending,
    Ready,
    Stopped,
    Failed,
}

/// Connection attempts during startup
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    /// Pause after failed attempt `n` is `n * step`
    pub step: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 9,
            step: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    pub fn pause(&self, attempt: u32) -> Duration {
        self.step * attempt
    }
}

/// How we prove ourselves to the control port
enum Credential {
    Password(String),
    CookieFile(PathBuf),
}

enum Secret {
    Password(String),
    Cookie(Vec<u8>),
}

/// Supervisor for one tor daemon
pub struct Agent {
    mode: DaemonMode,
    state: AgentState,
    control_addr: String,
    services_dir: PathBuf,
    credential: Credential,
    /// Present when we run tor ourselves
    launch: Option<LaunchOptions>,
    retry: RetryPolicy,
    demux: Demux,
    forwarders: Vec<Forwarder>,

    process: Option<TorProcess>,
    conn: Option<ControlConnection<TcpStream>>,
    dispatcher: Option<JoinHandle<()>>,
    running: Vec<ForwarderHandle>,
}

impl Agent {
    /// Prepare directories and credentials for `config`
    ///
    /// In owned-password mode this runs `tor --hash-password` once.
    pub async fn new(config: &Config) -> Result<Self, AgentError> {
        let agent = &config.node.agent;
        let services_dir = agent.tor_services_dir.clone();

        let (credential, launch) = match agent.mode {
            DaemonMode::AttachedCookie => (Credential::CookieFile(agent.cookie_path()), None),
            DaemonMode::OwnedPassword | DaemonMode::OwnedCookie => {
                process::create_private_dir(&agent.tor_data_dir)?;

                let (credential, auth) = if agent.mode == DaemonMode::OwnedPassword {
                    let password = process::generate_password();
                    let hash = process::hash_password(
                        &agent.tor_binary_path,
                        &agent.tor_data_dir,
                        &password,
                    )
                    .await?;
                    (Credential::Password(password), LaunchAuth::HashedPassword(hash))
                } else {
                    (Credential::CookieFile(agent.cookie_path()), LaunchAuth::Cookie)
                };

                let launch = LaunchOptions {
                    binary: agent.tor_binary_path.clone(),
                    torrc: agent.torrc_path.clone(),
                    data_dir: agent.tor_data_dir.clone(),
                    socks_addr: agent.socks_addr.clone(),
                    control_addr: agent.control_addr.clone(),
                    auth,
                    boot_timeout: agent.boot_timeout_secs.map(Duration::from_secs),
                };
                (credential, Some(launch))
            },
        };
        process::create_private_dir(&services_dir)?;

        let forwarders = config
            .node
            .remotes
            .iter()
            .flat_map(|remote| {
                remote.imports.iter().map(|import| Forwarder {
                    remote_addr: remote.address.clone(),
                    remote_port: import.remote_port,
                    local_addr: import.local_addr.clone(),
                    local_port: import.local_port,
                    socks_addr: agent.socks_addr.clone(),
                })
            })
            .collect();

        Ok(Self {
            mode: agent.mode,
            state: AgentState::NotStarted,
            control_addr: agent.control_addr.clone(),
            services_dir,
            credential,
            launch,
            retry: RetryPolicy::default(),
            demux: Demux::new(),
            forwarders,
            process: None,
            conn: None,
            dispatcher: None,
            running: Vec::new(),
        })
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn state(&self) -> AgentState {
        self.state
    }

    pub fn mode(&self) -> DaemonMode {
        self.mode
    }

    /// Directory tor keeps the hidden service in
    pub fn services_dir(&self) -> &Path {
        &self.services_dir
    }

    /// Register a handler for an asynchronous event type
    ///
    /// Handlers are picked up by the next [`Agent::start`].
    pub fn on_event<F>(&mut self, event: &str, handler: F) -> Option<EventHandler>
    where
        F: Fn(Reply) + Send + Sync + 'static,
    {
        self.demux.handle(event, std::sync::Arc::new(handler))
    }

    /// Addresses the running forwarders listen on
    pub fn forwarder_addrs(&self) -> Vec<SocketAddr> {
        self.running.iter().map(|h| h.local_addr).collect()
    }

    /// The authenticated control connection; only available once ready
    pub fn control(&mut self) -> Result<&mut ControlConnection<TcpStream>, AgentError> {
        if self.state != AgentState::Ready {
            return Err(AgentError::NotConnected);
        }
        self.conn.as_mut().ok_or(AgentError::NotConnected)
    }

    /// Launch or attach to tor, authenticate, and start forwarding
    pub async fn start(&mut self) -> Result<(), AgentError> {
        if self.state == AgentState::Ready {
            return Ok(());
        }
        self.state = AgentState::Starting;

        match self.start_inner().await {
            Ok(()) => {
                self.state = AgentState::Ready;
                info!("Agent ready ({:?})", self.mode);
                Ok(())
            },
            Err(e) => {
                if let Err(teardown) = self.teardown().await {
                    warn!("Cleanup after failed start: {}", teardown);
                }
                self.state = AgentState::Failed;
                Err(e)
            },
        }
    }

    async fn start_inner(&mut self) -> Result<(), AgentError> {
        if let Some(opts) = &self.launch {
            let child = TorProcess::launch(opts).await?;
            self.process = Some(child);
        }

        let (mut conn, events, secret) = self.connect_with_retry().await?;

        self.state = AgentState::AuthPending;
        match secret {
            Secret::Password(password) => conn.authenticate_password(&password).await?,
            Secret::Cookie(cookie) => conn.authenticate_cookie(&cookie).await?,
        }
        debug!("Authenticated to control port {}", self.control_addr);

        self.dispatcher = Some(tokio::spawn(self.demux.clone().serve(events)));
        self.conn = Some(conn);

        for forwarder in self.forwarders.clone() {
            self.running.push(forwarder.start().await?);
        }

        Ok(())
    }

    /// Dial the control port and load the secret, pausing between attempts
    async fn connect_with_retry(
        &self,
    ) -> Result<(ControlConnection<TcpStream>, mpsc::Receiver<Reply>, Secret), AgentError> {
        let mut last_error = io::Error::other("no connection attempts");

        for attempt in 1..=self.retry.attempts {
            match self.try_connect().await {
                Ok(connected) => return Ok(connected),
                Err(e) => {
                    debug!(
                        "Control connect attempt {}/{} to {} failed: {}",
                        attempt, self.retry.attempts, self.control_addr, e
                    );
                    last_error = e;
                },
            }
            if attempt < self.retry.attempts {
                tokio::time::sleep(self.retry.pause(attempt)).await;
            }
        }

        Err(AgentError::ConnectTimeout {
            addr: self.control_addr.clone(),
            attempts: self.retry.attempts,
            source: last_error,
        })
    }

    async fn try_connect(
        &self,
    ) -> io::Result<(ControlConnection<TcpStream>, mpsc::Receiver<Reply>, Secret)> {
        let (conn, events) = ControlConnection::dial(self.control_addr.as_str()).await?;
        // Tor writes the cookie shortly after opening the port
        let secret = match &self.credential {
            Credential::Password(password) => Secret::Password(password.clone()),
            Credential::CookieFile(path) => Secret::Cookie(tokio::fs::read(path).await?),
        };
        Ok((conn, events, secret))
    }

    fn stop_forwarders(&mut self) {
        for handle in self.running.drain(..) {
            handle.stop();
        }
    }

    /// Stop forwarding, drop the control connection, and kill tor if we
    /// launched it
    pub async fn stop(&mut self) -> Result<(), AgentError> {
        let result = self.teardown().await;
        self.state = AgentState::Stopped;
        result
    }

    async fn teardown(&mut self) -> Result<(), AgentError> {
        self.stop_forwarders();
        self.conn = None;
        if let Some(dispatcher) = self.dispatcher.take() {
            dispatcher.abort();
        }

        if let Some(mut child) = self.process.take() {
            child.stop().await?;
        }
        Ok(())
    }

    /// Ask tor to emit the given asynchronous events
    pub async fn subscribe(&mut self, events: &[&str]) -> Result<(), AgentError> {
        self.control()?.set_events(events).await?;
        Ok(())
    }

    /// Publish the exports and authorized clients of `service`
    pub async fn update_services(&mut self, service: &ServiceConfig) -> Result<(), AgentError> {
        let (set, reset) = service_settings(&self.services_dir, service)?;
        let conn = self.control()?;

        if !set.is_empty() {
            conn.set_conf(&set).await?;
        }
        if !reset.is_empty() {
            conn.reset_conf(&reset).await?;
        }
        conn.save_conf().await?;

        info!(
            "Updated hidden service: {} exports, {} clients",
            service.exports.len(),
            service.clients.len()
        );
        Ok(())
    }

    /// Install client authorization for every remote that issued us one
    pub async fn update_remotes(&mut self, node: &NodeConfig) -> Result<(), AgentError> {
        let settings = remote_settings(node);
        let conn = self.control()?;

        if settings.is_empty() {
            conn.reset_conf(&[HID_SERV_AUTH]).await?;
        } else {
            conn.set_conf(&settings).await?;
        }
        conn.save_conf().await?;

        info!("Updated client auth for {} remotes", settings.len());
        Ok(())
    }

    /// Onion address and auth cookie tor generated for `client`
    pub async fn client_access(&self, client: &str) -> Result<(String, String), AgentError> {
        let path = self.services_dir.join(HOSTNAME_FILE);
        let contents = tokio::fs::read_to_string(&path)
            .await
            .map_err(|source| AgentError::Read {
                path: path.clone(),
                source,
            })?;

        find_client_access(&contents, client).ok_or_else(|| AgentError::NotFound {
            client: client.to_string(),
            path,
        })
    }
}

impl Drop for Agent {
    fn drop(&mut self) {
        if self.process.is_some() {
            warn!("Agent dropped without stop; tor will be killed");
        }
        self.stop_forwarders();
    }
}

/// SETCONF settings and RESETCONF keys for a hidden service
///
/// `HiddenServiceDir` leads so that tor attaches the ports and clients
/// that follow to it.
fn service_settings(
    dir: &Path,
    service: &ServiceConfig,
) -> Result<(Vec<String>, Vec<&'static str>), AgentError> {
    let mut set = Vec::new();
    let mut reset = Vec::new();

    if service.exports.is_empty() {
        reset.push(HIDDEN_SERVICE_PORT);
    } else {
        set.push(format!(
            "HiddenServiceDir={}",
            quote(&dir.to_string_lossy())
        ));
        for export in &service.exports {
            let port = export
                .virtual_port()
                .ok_or_else(|| AgentError::InvalidExport {
                    export: export.local_addr.clone(),
                    reason: "expected host:port",
                })?;
            set.push(format!(
                "{}={}",
                HIDDEN_SERVICE_PORT,
                quote(&format!("{} {}", port, export.local_addr))
            ));
        }
    }

    if service.clients.is_empty() {
        reset.push(HIDDEN_SERVICE_AUTHORIZE_CLIENT);
    } else {
        let names: Vec<&str> = service.clients.iter().map(|c| c.name.as_str()).collect();
        set.push(format!(
            "{}={}",
            HIDDEN_SERVICE_AUTHORIZE_CLIENT,
            quote(&format!("stealth {}", names.join(",")))
        ));
    }

    Ok((set, reset))
}

fn remote_settings(node: &NodeConfig) -> Vec<String> {
    node.remotes
        .iter()
        .filter(|remote| !remote.auth.is_empty())
        .map(|remote| {
            format!(
                "{}={}",
                HID_SERV_AUTH,
                quote(&format!("{} {}", remote.address, remote.auth))
            )
        })
        .collect()
}

/// Scan a hostname file for `<address> <auth> # client: <name>`
fn find_client_access(contents: &str, client: &str) -> Option<(String, String)> {
    let suffix = format!("# client: {}", client);
    contents
        .lines()
        .map(str::trim)
        .filter(|line| line.ends_with(&suffix))
        .find_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() < 5 || fields[fields.len() - 1] != client {
                return None;
            }
            Some((fields[0].to_string(), fields[1].to_string()))
        })
}
