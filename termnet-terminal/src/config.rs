//! Terminal settings from the environment: `HOST_ADDR` (`ws://` URL or `host:port`), `TERMINAL_ID`,
//! `TERMINAL_NAME`, `PRIVATE_KEY` (hex Ed25519 seed).

use std::time::Duration;

use termnet_core::identity::{KeyError, Keypair};

pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct TerminalConfig {
    pub host_addr: String,
    pub terminal_id: String,
    pub name: String,
    pub keypair: Keypair,
    pub reconnect_delay: Duration,
}

impl TerminalConfig {
    pub fn new(host_addr: impl Into<String>, terminal_id: impl Into<String>, keypair: Keypair) -> Self {
        let terminal_id = terminal_id.into();
        Self {
            host_addr: host_addr.into(),
            name: terminal_id.clone(),
            terminal_id,
            keypair,
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
        }
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|k| std::env::var(k).ok())
    }

    /// Same as [`from_env`](Self::from_env) with an explicit variable source.
    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let host_addr = get("HOST_ADDR").ok_or(ConfigError::Missing("HOST_ADDR"))?;
        let secret = get("PRIVATE_KEY").ok_or(ConfigError::Missing("PRIVATE_KEY"))?;
        let keypair = Keypair::from_secret_hex(&secret)?;
        let terminal_id = get("TERMINAL_ID")
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let mut config = Self::new(host_addr, terminal_id, keypair);
        if let Some(name) = get("TERMINAL_NAME") {
            config.name = name;
        }
        Ok(config)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("environment variable {0} is not set")]
    Missing(&'static str),
    #[error("PRIVATE_KEY: {0}")]
    Key(#[from] KeyError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |k: &str| map.get(k).cloned()
    }

    #[test]
    fn reads_all_fields() {
        let kp = Keypair::generate();
        let secret = kp.secret_hex();
        let cfg = TerminalConfig::from_lookup(lookup(&[
            ("HOST_ADDR", "127.0.0.1:8888"),
            ("PRIVATE_KEY", secret.as_str()),
            ("TERMINAL_ID", "vendor-okx"),
            ("TERMINAL_NAME", "OKX"),
        ]))
        .unwrap();
        assert_eq!(cfg.host_addr, "127.0.0.1:8888");
        assert_eq!(cfg.terminal_id, "vendor-okx");
        assert_eq!(cfg.name, "OKX");
        assert_eq!(cfg.keypair.public_key(), kp.public_key());
    }

    #[test]
    fn missing_id_gets_random_one() {
        let secret = Keypair::generate().secret_hex();
        let cfg = TerminalConfig::from_lookup(lookup(&[
            ("HOST_ADDR", "h:1"),
            ("PRIVATE_KEY", secret.as_str()),
        ]))
        .unwrap();
        assert!(!cfg.terminal_id.is_empty());
        assert_eq!(cfg.name, cfg.terminal_id);
    }

    #[test]
    fn missing_key_is_error() {
        let err = TerminalConfig::from_lookup(lookup(&[("HOST_ADDR", "h:1")])).unwrap_err();
        assert!(matches!(err, ConfigError::Missing("PRIVATE_KEY")));
        let err = TerminalConfig::from_lookup(lookup(&[("HOST_ADDR", "h:1"), ("PRIVATE_KEY", "zz")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Key(KeyError::InvalidHex)));
    }
}
