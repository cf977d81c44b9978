use anyhow::{Context, Result};
use serde::Deserialize;
use std::{env, fs, io::ErrorKind, path::PathBuf, time::Duration};

use crate::security::validate_trusted_proxies;

pub const DEFAULT_CONFIG_FILE: &str = "config.toml";
pub const DEFAULT_PORT: u16 = 8787;

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub listen: ListenConfig,
    #[serde(default)]
    pub relay: RelayConfig,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ListenConfig {
    #[serde(default = "default_ip")]
    pub ip: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub allowed_proxy_ips: Option<Vec<String>>,
    pub tls: Option<TlsConfig>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TlsConfig {
    pub cert_file: String,
    pub key_file: String,
}

/// Per-session limits. Shared read-only by every session.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RelayConfig {
    /// Upstream handshake deadline; unset waits indefinitely.
    pub connect_timeout_ms: Option<u64>,
    /// Frames buffered while connecting; unset is unbounded.
    pub max_pending_frames: Option<usize>,
    #[serde(default = "default_close_grace_ms")]
    pub close_grace_ms: u64,
}

fn default_ip() -> String {
    "0.0.0.0".to_string()
}

const fn default_port() -> u16 {
    DEFAULT_PORT
}

const fn default_close_grace_ms() -> u64 {
    1000
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            ip: default_ip(),
            port: DEFAULT_PORT,
            allowed_proxy_ips: None,
            tls: None,
        }
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: None,
            max_pending_frames: None,
            close_grace_ms: default_close_grace_ms(),
        }
    }
}

impl RelayConfig {
    #[must_use]
    pub fn connect_timeout(&self) -> Option<Duration> {
        self.connect_timeout_ms.map(Duration::from_millis)
    }

    #[must_use]
    pub const fn close_grace(&self) -> Duration {
        Duration::from_millis(self.close_grace_ms)
    }
}

impl Config {
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(content).context("Failed to parse configuration as valid TOML")?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if let Some(allowed) = &self.listen.allowed_proxy_ips {
            validate_trusted_proxies(allowed)?;
        }
        Ok(())
    }

    /// Replaces the listen port with a `PORT`-style override, if one is set.
    pub fn apply_port_override(&mut self, port: Option<&str>) -> Result<()> {
        if let Some(port) = port.map(str::trim).filter(|p| !p.is_empty()) {
            self.listen.port = port
                .parse()
                .with_context(|| format!("Invalid PORT value: {port}"))?;
        }
        Ok(())
    }

    #[must_use]
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.listen.ip, self.listen.port)
    }
}

/// Loads configuration from `RELAY_CONFIG` (or `config.toml`), then applies `PORT`.
///
/// A missing `config.toml` is not an error; an explicitly named file must exist.
pub fn load_config() -> Result<Config> {
    let explicit = env::var_os("RELAY_CONFIG").map(PathBuf::from);
    let path = explicit
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));

    let mut config = match fs::read_to_string(&path) {
        Ok(content) => Config::from_toml_str(&content)
            .with_context(|| format!("Failed to load {}", path.display()))?,
        Err(e) if e.kind() == ErrorKind::NotFound && explicit.is_none() => Config::default(),
        Err(e) => {
            return Err(e).with_context(|| format!("Failed to read {}", path.display()));
        }
    };

    config.apply_port_override(env::var("PORT").ok().as_deref())?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_uses_defaults() {
        let config = Config::from_toml_str("").unwrap();
        assert_eq!(config.listen_addr(), "0.0.0.0:8787");
        assert!(config.listen.tls.is_none());
        assert_eq!(config.relay.connect_timeout(), None);
        assert_eq!(config.relay.max_pending_frames, None);
        assert_eq!(config.relay.close_grace(), Duration::from_secs(1));
    }

    #[test]
    fn parses_full_file() {
        let config = Config::from_toml_str(
            r#"
            [listen]
            ip = "127.0.0.1"
            port = 9000
            allowed_proxy_ips = ["10.0.0.0/8", "192.168.1.1"]

            [listen.tls]
            cert_file = "cert.pem"
            key_file = "key.pem"

            [relay]
            connect_timeout_ms = 2500
            max_pending_frames = 64
            close_grace_ms = 250
            "#,
        )
        .unwrap();

        assert_eq!(config.listen_addr(), "127.0.0.1:9000");
        assert_eq!(config.listen.allowed_proxy_ips.as_ref().map(Vec::len), Some(2));
        assert_eq!(config.listen.tls.as_ref().unwrap().cert_file, "cert.pem");
        assert_eq!(
            config.relay.connect_timeout(),
            Some(Duration::from_millis(2500))
        );
        assert_eq!(config.relay.max_pending_frames, Some(64));
        assert_eq!(config.relay.close_grace(), Duration::from_millis(250));
    }

    #[test]
    fn rejects_invalid_proxy_allowlist() {
        let result = Config::from_toml_str(
            r#"
            [listen]
            allowed_proxy_ips = ["not-an-ip"]
            "#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn rejects_unknown_keys() {
        assert!(Config::from_toml_str("[relay]\nretries = 3\n").is_err());
    }

    #[test]
    fn port_override() {
        let mut config = Config::default();
        config.apply_port_override(Some("9100")).unwrap();
        assert_eq!(config.listen.port, 9100);

        config.apply_port_override(None).unwrap();
        config.apply_port_override(Some("  ")).unwrap();
        assert_eq!(config.listen.port, 9100);

        assert!(config.apply_port_override(Some("eighty")).is_err());
    }
}
