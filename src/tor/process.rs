//! Tor daemon process
//!
//! Runs tor as a child process owned by the agent. Tor's stdout is
//! re-emitted under the `tor` log target, and can optionally gate startup on
//! the bootstrap notice.

use super::error::ProcessError;
use base64::{engine::general_purpose::URL_SAFE, Engine};
use rand::RngCore;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

/// Notice tor prints once it can build circuits
pub const BOOTSTRAP_MARKER: &str = "Bootstrapped 100%";

/// Name of the cookie file tor writes into its data directory
pub const COOKIE_FILE_NAME: &str = "control_auth_cookie";

const DEFAULT_TORRC: &str = "Log notice stdout\n";

/// How the control port authenticates controllers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LaunchAuth {
    /// `--HashedControlPassword <hash>`
    HashedPassword(String),
    /// `--CookieAuthentication 1`
    Cookie,
}

/// Everything needed to start tor
#[derive(Debug, Clone)]
pub struct LaunchOptions {
    pub binary: PathBuf,
    pub torrc: PathBuf,
    pub data_dir: PathBuf,
    pub socks_addr: String,
    pub control_addr: String,
    pub auth: LaunchAuth,
    /// Wait for [`BOOTSTRAP_MARKER`] on stdout, killing tor if it takes longer
    pub boot_timeout: Option<Duration>,
}

impl LaunchOptions {
    /// Command-line arguments for the tor binary
    pub fn args(&self) -> Vec<OsString> {
        let mut args: Vec<OsString> = vec![
            "-f".into(),
            self.torrc.clone().into(),
            "--SocksPort".into(),
            self.socks_addr.clone().into(),
            "--ControlPort".into(),
            self.control_addr.clone().into(),
            "--DataDirectory".into(),
            self.data_dir.clone().into(),
        ];
        match &self.auth {
            LaunchAuth::HashedPassword(hash) => {
                args.push("--HashedControlPassword".into());
                args.push(hash.clone().into());
            },
            LaunchAuth::Cookie => {
                args.push("--CookieAuthentication".into());
                args.push("1".into());
            },
        }
        args
    }
}

/// A running tor child process
pub struct TorProcess {
    child: Child,
}

impl TorProcess {
    /// Start tor and, if configured, wait for it to bootstrap
    pub async fn launch(opts: &LaunchOptions) -> Result<Self, ProcessError> {
        ensure_torrc(&opts.torrc)?;

        let mut child = Command::new(&opts.binary)
            .args(opts.args())
            .current_dir(&opts.data_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| ProcessError::Launch {
                binary: opts.binary.clone(),
                source,
            })?;

        info!(
            "Started tor (pid {:?}): control {}, socks {}",
            child.id(),
            opts.control_addr,
            opts.socks_addr
        );

        let (booted_tx, booted_rx) = oneshot::channel();
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(async move {
                let mut booted_tx = Some(booted_tx);
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(target: "tor", "{}", line);
                    if line.contains(BOOTSTRAP_MARKER) {
                        if let Some(tx) = booted_tx.take() {
                            let _ = tx.send(());
                        }
                    }
                }
            });
        }

        let mut process = Self { child };
        if let Some(limit) = opts.boot_timeout {
            match tokio::time::timeout(limit, booted_rx).await {
                Ok(Ok(())) => info!("Tor bootstrapped"),
                Ok(Err(_)) => {
                    let _ = process.stop().await;
                    return Err(ProcessError::ExitedDuringBoot);
                },
                Err(_) => {
                    warn!("Tor did not bootstrap within {:?}, killing it", limit);
                    let _ = process.stop().await;
                    return Err(ProcessError::BootTimeout {
                        secs: limit.as_secs(),
                    });
                },
            }
        }

        Ok(process)
    }

    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }

    /// Kill tor and reap it
    pub async fn stop(&mut self) -> Result<ExitStatus, ProcessError> {
        if let Some(status) = self.child.try_wait().map_err(ProcessError::Wait)? {
            return Ok(status);
        }
        self.child.start_kill().map_err(ProcessError::Kill)?;
        let status = self.child.wait().await.map_err(ProcessError::Wait)?;
        info!("Tor exited: {}", status);
        Ok(status)
    }
}

/// Random control password: 32 bytes, URL-safe base64
pub fn generate_password() -> String {
    let mut secret = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut secret);
    URL_SAFE.encode(secret)
}

/// Ask tor to hash a control password for `--HashedControlPassword`
pub async fn hash_password(
    binary: &Path,
    data_dir: &Path,
    password: &str,
) -> Result<String, ProcessError> {
    let output = Command::new(binary)
        .arg("--DataDirectory")
        .arg(data_dir)
        .arg("--hash-password")
        .arg(password)
        .stdin(Stdio::null())
        .output()
        .await
        .map_err(|source| ProcessError::Launch {
            binary: binary.to_path_buf(),
            source,
        })?;

    if !output.status.success() {
        return Err(ProcessError::HashPassword {
            binary: binary.to_path_buf(),
            reason: format!("exited with {}", output.status),
        });
    }

    parse_hashed_password(&String::from_utf8_lossy(&output.stdout)).ok_or_else(|| {
        ProcessError::HashPassword {
            binary: binary.to_path_buf(),
            reason: "no hash in output".to_string(),
        }
    })
}

/// Tor may log notices before the hash; the hash is the `16:` line
fn parse_hashed_password(stdout: &str) -> Option<String> {
    stdout
        .lines()
        .map(str::trim)
        .rev()
        .find(|line| line.starts_with("16:"))
        .map(str::to_string)
}

/// Write a minimal torrc if none exists
pub fn ensure_torrc(path: &Path) -> Result<(), ProcessError> {
    if path.exists() {
        return Ok(());
    }
    std::fs::write(path, DEFAULT_TORRC).map_err(|source| ProcessError::Prepare {
        path: path.to_path_buf(),
        source,
    })?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)).map_err(
            |source| ProcessError::Prepare {
                path: path.to_path_buf(),
                source,
            },
        )?;
    }
    Ok(())
}

/// Create a directory readable only by us, as tor requires for its data
pub fn create_private_dir(path: &Path) -> Result<(), ProcessError> {
    let prepare = |source| ProcessError::Prepare {
        path: path.to_path_buf(),
        source,
    };
    std::fs::create_dir_all(path).map_err(prepare)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o700))
            .map_err(prepare)?;
    }
    Ok(())
}
