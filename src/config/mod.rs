//! Configuration loading and validation
//!
//! Handles the TOML node description: the services this node exports, the
//! clients allowed to reach them, the remotes it imports from, and how the
//! agent reaches its tor daemon.

pub mod file;
mod validation;

pub use file::{default_path, load_from_path, save_to_path};
pub use validation::{is_valid_name, validate};

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Root configuration structure
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub node: NodeConfig,
    /// File this config was loaded from
    #[serde(skip)]
    pub path: PathBuf,
    /// Directory holding `path`; relative defaults resolve against it
    #[serde(skip)]
    pub dir: PathBuf,
}

/// Everything describing this node
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub agent: AgentConfig,
    pub service: ServiceConfig,
    pub remotes: Vec<RemoteConfig>,
}

/// Services exported by this node
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub exports: Vec<ExportConfig>,
    pub clients: Vec<ClientConfig>,
}

/// A local bind point published on the hidden service
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportConfig {
    /// `host:port` the service listens on locally
    pub local_addr: String,
    /// Port on the onion address; defaults to the port of `local_addr`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
}

impl ExportConfig {
    pub fn new(local_addr: impl Into<String>) -> Self {
        Self {
            local_addr: local_addr.into(),
            port: None,
        }
    }

    /// Onion-side port, or `None` if `local_addr` has no usable port
    pub fn virtual_port(&self) -> Option<u16> {
        self.port.or_else(|| split_port(&self.local_addr))
    }
}

/// A client authorized to reach our hidden service
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientConfig {
    pub name: String,
    /// Onion address tor generated for this client
    #[serde(default)]
    pub address: String,
    /// Per-client authorization cookie
    #[serde(default)]
    pub auth: String,
}

/// A remote node whose services we import
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteConfig {
    pub name: String,
    /// Remote's onion address
    pub address: String,
    /// Authorization cookie the remote issued us
    #[serde(default)]
    pub auth: String,
    #[serde(default)]
    pub imports: Vec<ImportConfig>,
}

/// A remote port made available on a local port
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportConfig {
    #[serde(default = "default_import_addr")]
    pub local_addr: String,
    pub local_port: u16,
    pub remote_port: u16,
}

fn default_import_addr() -> String {
    "127.0.0.1".to_string()
}

/// How the agent runs and reaches tor
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DaemonMode {
    /// Launch tor ourselves, authenticate with a generated password
    #[default]
    OwnedPassword,
    /// Launch tor ourselves, authenticate with its cookie file
    OwnedCookie,
    /// Use an already-running tor (e.g. Tor Browser) via its cookie file
    AttachedCookie,
}

impl DaemonMode {
    pub fn owns_process(self) -> bool {
        !matches!(self, Self::AttachedCookie)
    }
}

/// Tor daemon connection
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub mode: DaemonMode,
    pub tor_binary_path: PathBuf,
    pub torrc_path: PathBuf,
    pub tor_data_dir: PathBuf,
    /// Where tor keeps the hidden service keys and `hostname` file
    pub tor_services_dir: PathBuf,
    pub socks_addr: String,
    pub control_addr: String,
    /// Cookie file; defaults to `<tor_data_dir>/control_auth_cookie`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub control_cookie: Option<PathBuf>,
    /// Wait for tor's bootstrap notice before connecting
    #[serde(skip_serializing_if = "Option::is_none")]
    pub boot_timeout_secs: Option<u64>,
}

pub const DEFAULT_SOCKS_ADDR: &str = "127.0.0.1:9250";
pub const DEFAULT_CONTROL_ADDR: &str = "127.0.0.1:9251";

fn default_tor_binary() -> PathBuf {
    if cfg!(unix) {
        PathBuf::from("/usr/bin/tor")
    } else {
        PathBuf::from("tor")
    }
}

impl AgentConfig {
    /// Cookie file to authenticate with in cookie modes
    pub fn cookie_path(&self) -> PathBuf {
        self.control_cookie
            .clone()
            .unwrap_or_else(|| self.tor_data_dir.join(crate::tor::process::COOKIE_FILE_NAME))
    }
}

impl Config {
    /// Empty config that will live at `path`
    pub fn new_at(path: &Path) -> Self {
        let mut config = Self::default();
        config.set_location(path);
        config
    }

    pub(crate) fn set_location(&mut self, path: &Path) {
        self.path = path.to_path_buf();
        self.dir = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default();
        self.apply_defaults();
    }

    /// Fill unset agent settings, resolving paths against `dir`
    pub fn apply_defaults(&mut self) {
        let agent = &mut self.node.agent;
        if agent.tor_binary_path.as_os_str().is_empty() {
            agent.tor_binary_path = default_tor_binary();
        }
        if agent.tor_data_dir.as_os_str().is_empty() {
            agent.tor_data_dir = self.dir.join("tor").join("data");
        }
        if agent.torrc_path.as_os_str().is_empty() {
            agent.torrc_path = agent.tor_data_dir.join("torrc");
        }
        if agent.tor_services_dir.as_os_str().is_empty() {
            agent.tor_services_dir = agent.tor_data_dir.join("services");
        }
        if agent.socks_addr.is_empty() {
            agent.socks_addr = DEFAULT_SOCKS_ADDR.to_string();
        }
        if agent.control_addr.is_empty() {
            agent.control_addr = DEFAULT_CONTROL_ADDR.to_string();
        }
    }

    /// Total number of imported ports across all remotes
    pub fn import_count(&self) -> usize {
        self.node.remotes.iter().map(|r| r.imports.len()).sum()
    }
}

/// Port of a `host:port` string (IPv6 hosts in brackets)
pub(crate) fn split_port(addr: &str) -> Option<u16> {
    let (host, port) = addr.rsplit_once(':')?;
    if host.is_empty() {
        return None;
    }
    port.parse::<u16>().ok().filter(|p| *p != 0)
}
