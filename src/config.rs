//! Gateway configuration loaded from TOML.

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 2022;
pub const DEFAULT_IMAGE: &str = "docker.io/library/ubuntu:latest";
pub const DEFAULT_SHELL: &str = "/bin/bash";
pub const DEFAULT_MAX_SESSION_SECS: u64 = 24 * 60 * 60;

/// Effective per-session parameters.
///
/// As a `[user_overrides.<name>]` table this is partial: empty or zero
/// fields inherit from `[defaults]`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Command run for a `shell` request.
    pub argv: Vec<String>,

    /// OCI image reference the session container is provisioned from.
    pub image: String,

    /// Wall-clock limit for the session, in seconds.
    pub max_session_secs: u64,
}

impl SessionConfig {
    pub fn max_session(&self) -> Duration {
        Duration::from_secs(self.max_session_secs)
    }
}

/// Main gateway configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// SSH server listen host (default: "127.0.0.1")
    pub host: String,

    /// SSH server listen port (default: 2022)
    pub port: u16,

    /// Directory whose file names are usernames and whose contents are
    /// OpenSSH authorized_keys files.
    pub authorized_keys_dir: PathBuf,

    /// Path to the SSH host key. Generated on first start if absent.
    pub host_key_path: PathBuf,

    /// Container runtime daemon socket. Local defaults when unset.
    pub docker_socket: Option<String>,

    /// Session parameters applied to every user without an override.
    pub defaults: SessionConfig,

    /// Per-user partial overrides, layered onto `defaults`.
    pub user_overrides: HashMap<String, SessionConfig>,
}

impl GatewayConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        Ok(config)
    }

    /// Load configuration from a file, or return defaults if the file doesn't exist.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Replace empty and zero fields with usable defaults. Idempotent.
    pub fn populate(mut self) -> Self {
        let data_dir = dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("/var/lib"))
            .join("hostel");

        if self.host.is_empty() {
            self.host = DEFAULT_HOST.to_string();
        }
        if self.port == 0 {
            self.port = DEFAULT_PORT;
        }
        if self.authorized_keys_dir.as_os_str().is_empty() {
            self.authorized_keys_dir = data_dir.join("authorized_keys");
        }
        if self.host_key_path.as_os_str().is_empty() {
            self.host_key_path = data_dir.join("host_key");
        }
        if self.defaults.argv.is_empty() {
            self.defaults.argv = vec![DEFAULT_SHELL.to_string()];
        }
        if self.defaults.image.is_empty() {
            self.defaults.image = DEFAULT_IMAGE.to_string();
        }
        if self.defaults.max_session_secs == 0 {
            self.defaults.max_session_secs = DEFAULT_MAX_SESSION_SECS;
        }

        self
    }

    /// Resolve the effective session parameters for a user: `defaults`, with
    /// each field the user's override actually sets layered on top.
    pub fn session_for(&self, username: &str) -> SessionConfig {
        let mut cfg = self.defaults.clone();
        if let Some(user) = self.user_overrides.get(username) {
            if !user.argv.is_empty() {
                cfg.argv = user.argv.clone();
            }
            if !user.image.is_empty() {
                cfg.image = user.image.clone();
            }
            if user.max_session_secs > 0 {
                cfg.max_session_secs = user.max_session_secs;
            }
        }
        cfg
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Apply a `host:port` listen override from the command line.
    pub fn set_listen(&mut self, addr: &str) -> Result<()> {
        let (host, port) = addr
            .rsplit_once(':')
            .ok_or_else(|| anyhow!("Invalid listen address: {addr}"))?;
        self.host = host.to_string();
        self.port = port
            .parse()
            .with_context(|| format!("Invalid port in listen address: {addr}"))?;
        Ok(())
    }

    /// Ensure directories the gateway writes into exist. The authorized-keys
    /// directory is deliberately left alone: its absence is a configuration
    /// error, not something to paper over.
    pub fn ensure_dirs(&self) -> Result<()> {
        if let Some(parent) = self.host_key_path.parent() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create host key directory: {}", parent.display())
            })?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_populate_fills_defaults() {
        let config = GatewayConfig::default().populate();

        assert_eq!(config.host, DEFAULT_HOST);
        assert_eq!(config.port, DEFAULT_PORT);
        assert_eq!(config.defaults.argv, vec![DEFAULT_SHELL.to_string()]);
        assert_eq!(config.defaults.image, DEFAULT_IMAGE);
        assert_eq!(config.defaults.max_session_secs, DEFAULT_MAX_SESSION_SECS);
        assert!(!config.authorized_keys_dir.as_os_str().is_empty());
        assert!(!config.host_key_path.as_os_str().is_empty());
    }

    #[test]
    fn test_populate_is_idempotent() {
        let once = GatewayConfig::default().populate();
        let twice = once.clone().populate();
        assert_eq!(once, twice);
    }

    #[test]
    fn test_populate_keeps_existing_values() {
        let config = GatewayConfig {
            host: "0.0.0.0".to_string(),
            port: 2200,
            ..Default::default()
        }
        .populate();

        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 2200);
        assert_eq!(config.defaults.image, DEFAULT_IMAGE);
    }

    #[test]
    fn test_session_for_without_override_is_defaults() {
        let config = GatewayConfig::default().populate();
        assert_eq!(config.session_for("alice"), config.defaults);
    }

    #[test]
    fn test_session_for_layers_override_fields() {
        let mut config = GatewayConfig::default().populate();
        config.user_overrides.insert(
            "carol".to_string(),
            SessionConfig {
                argv: Vec::new(),
                image: "docker.io/library/alpine:latest".to_string(),
                max_session_secs: 3600,
            },
        );

        let cfg = config.session_for("carol");
        assert_eq!(cfg.image, "docker.io/library/alpine:latest");
        assert_eq!(cfg.max_session(), Duration::from_secs(3600));
        // argv was not overridden and falls through from the defaults.
        assert_eq!(cfg.argv, config.defaults.argv);
    }

    #[test]
    fn test_parse_config_file() {
        let doc = r#"
host = "0.0.0.0"
port = 2200
authorized_keys_dir = "/etc/hostel/authorized_keys"

[defaults]
argv = ["/bin/sh"]
image = "docker.io/library/alpine:latest"
max_session_secs = 7200

[user_overrides.carol]
image = "docker.io/library/debian:bookworm"
"#;
        let config: GatewayConfig = toml::from_str(doc).unwrap();
        let config = config.populate();

        assert_eq!(config.listen_addr(), "0.0.0.0:2200");
        assert_eq!(config.defaults.argv, vec!["/bin/sh".to_string()]);

        let carol = config.session_for("carol");
        assert_eq!(carol.image, "docker.io/library/debian:bookworm");
        assert_eq!(carol.argv, vec!["/bin/sh".to_string()]);
        assert_eq!(carol.max_session_secs, 7200);
    }

    #[test]
    fn test_set_listen() {
        let mut config = GatewayConfig::default().populate();
        config.set_listen("10.0.0.1:2222").unwrap();
        assert_eq!(config.host, "10.0.0.1");
        assert_eq!(config.port, 2222);

        assert!(config.set_listen("no-port").is_err());
        assert!(config.set_listen("host:notaport").is_err());
    }
}
