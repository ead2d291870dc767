//! Configuration file loading

use super::Config;
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

/// `~/.ormesh/config`
pub fn default_path() -> Result<PathBuf> {
    let home = dirs::home_dir().context("Failed to locate home directory")?;
    Ok(home.join(".ormesh").join("config"))
}

/// Load and parse config from path
///
/// A missing file yields an empty config located at `path`.
pub fn load_from_path(path: &Path) -> Result<Config> {
    let mut config = match std::fs::read_to_string(path) {
        Ok(contents) => toml::from_str::<Config>(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Config::default(),
        Err(e) => {
            return Err(e)
                .with_context(|| format!("Failed to read config file: {}", path.display()));
        },
    };
    config.set_location(path);

    super::validate(&config)?;

    Ok(config)
}

/// Write config to path, readable only by the owner
pub fn save_to_path(config: &Config, path: &Path) -> Result<()> {
    let contents = toml::to_string_pretty(config).context("Failed to encode config")?;

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    std::fs::write(path, contents)
        .with_context(|| format!("Failed to write config file: {}", path.display()))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ClientConfig, ExportConfig, ImportConfig, RemoteConfig};

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config");

        let config = load_from_path(&path).unwrap();
        assert_eq!(config.path, path);
        assert_eq!(config.node.agent.socks_addr, "127.0.0.1:9250");
        assert_eq!(config.node.agent.control_addr, "127.0.0.1:9251");
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config");

        let mut config = Config::new_at(&path);
        config.node.agent.tor_binary_path = PathBuf::from("/usr/local/bin/tor");
        config.node.service.exports.push(ExportConfig::new("127.0.0.1:80"));
        config.node.service.clients.push(ClientConfig {
            name: "bob".to_string(),
            address: "qwertyuiop.onion".to_string(),
            auth: "Zm9vYmFyYmF6".to_string(),
        });
        config.node.remotes.push(RemoteConfig {
            name: "office".to_string(),
            address: "asdfghjkl.onion".to_string(),
            auth: String::new(),
            imports: vec![ImportConfig {
                local_addr: "127.0.0.1".to_string(),
                local_port: 2222,
                remote_port: 22,
            }],
        });

        save_to_path(&config, &path).unwrap();
        let loaded = load_from_path(&path).unwrap();
        assert_eq!(loaded, config);

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }

    #[test]
    fn test_parse_error_names_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config");
        std::fs::write(&path, "[node\n").unwrap();

        let err = load_from_path(&path).unwrap_err();
        assert!(format!("{:#}", err).contains("Failed to parse config file"));
    }
}
