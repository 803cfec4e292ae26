//! Load config from file and environment.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{anyhow, Context};
use serde::Deserialize;

/// Host configuration. File: ~/.config/termnet/host.toml or /etc/termnet/host.toml.
/// Env overrides: TERMNET_HOST_PORT, TERMNET_HOST_BIND, TERMNET_HANDSHAKE_TIMEOUT_MS,
/// TERMNET_DIRECTORY_REFRESH_MS, TERMNET_PHANTOM_SWEEP_MS.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HostConfig {
    /// Listen address (default 0.0.0.0).
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Listen port (default 8888).
    #[serde(default = "default_port")]
    pub port: u16,
    /// Name announced in `Welcome` and as the host terminal's name.
    #[serde(default = "default_host_id")]
    pub host_id: String,
    #[serde(default = "default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,
    /// `ListTerminals` cache refresh (default 1 s).
    #[serde(default = "default_directory_refresh_ms")]
    pub directory_refresh_ms: u64,
    /// Ping sweep over connected terminals (default 10 s).
    #[serde(default = "default_phantom_sweep_ms")]
    pub phantom_sweep_ms: u64,
    #[serde(default = "default_ping_timeout_ms")]
    pub ping_timeout_ms: u64,
}

fn default_bind() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    8888
}
fn default_host_id() -> String {
    "termnet-host".to_string()
}
fn default_handshake_timeout_ms() -> u64 {
    5_000
}
fn default_directory_refresh_ms() -> u64 {
    1_000
}
fn default_phantom_sweep_ms() -> u64 {
    10_000
}
fn default_ping_timeout_ms() -> u64 {
    5_000
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_port(),
            host_id: default_host_id(),
            handshake_timeout_ms: default_handshake_timeout_ms(),
            directory_refresh_ms: default_directory_refresh_ms(),
            phantom_sweep_ms: default_phantom_sweep_ms(),
            ping_timeout_ms: default_ping_timeout_ms(),
        }
    }
}

impl HostConfig {
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn directory_refresh(&self) -> Duration {
        Duration::from_millis(self.directory_refresh_ms)
    }

    pub fn phantom_sweep(&self) -> Duration {
        Duration::from_millis(self.phantom_sweep_ms)
    }

    pub fn ping_timeout(&self) -> Duration {
        Duration::from_millis(self.ping_timeout_ms)
    }

    pub fn from_toml(s: &str) -> anyhow::Result<Self> {
        toml::from_str(s).context("parse host config")
    }

    /// Apply env overrides through `lookup` (normally `std::env::var`).
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<()> {
        if let Some(s) = lookup("TERMNET_HOST_BIND") {
            self.bind = s;
        }
        if let Some(s) = lookup("TERMNET_HOST_PORT") {
            self.port = s
                .parse()
                .map_err(|_| anyhow!("TERMNET_HOST_PORT: invalid port {s:?}"))?;
        }
        let millis = [
            ("TERMNET_HANDSHAKE_TIMEOUT_MS", &mut self.handshake_timeout_ms),
            ("TERMNET_DIRECTORY_REFRESH_MS", &mut self.directory_refresh_ms),
            ("TERMNET_PHANTOM_SWEEP_MS", &mut self.phantom_sweep_ms),
        ];
        for (name, field) in millis {
            if let Some(s) = lookup(name) {
                *field = s
                    .parse()
                    .map_err(|_| anyhow!("{name}: invalid milliseconds {s:?}"))?;
            }
        }
        Ok(())
    }
}

/// Load config: default, then the first config file found, then env vars.
pub fn load() -> anyhow::Result<HostConfig> {
    let mut c = match config_paths().into_iter().find(|p| p.exists()) {
        Some(path) => {
            let s = std::fs::read_to_string(&path)
                .with_context(|| format!("read {}", path.display()))?;
            HostConfig::from_toml(&s).with_context(|| path.display().to_string())?
        }
        None => HostConfig::default(),
    };
    c.apply_env(|name| std::env::var(name).ok())?;
    Ok(c)
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/termnet/host.toml"));
    }
    out.push(PathBuf::from("/etc/termnet/host.toml"));
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn file_then_env() {
        let mut c = HostConfig::from_toml("port = 9000\nphantom_sweep_ms = 2000\n").unwrap();
        assert_eq!(c.port, 9000);
        assert_eq!(c.bind, "0.0.0.0");
        let env: HashMap<&str, &str> = [
            ("TERMNET_HOST_BIND", "127.0.0.1"),
            ("TERMNET_HANDSHAKE_TIMEOUT_MS", "250"),
        ]
        .into_iter()
        .collect();
        c.apply_env(|k| env.get(k).map(|v| v.to_string())).unwrap();
        assert_eq!(c.listen_addr(), "127.0.0.1:9000");
        assert_eq!(c.handshake_timeout(), Duration::from_millis(250));
        assert_eq!(c.phantom_sweep(), Duration::from_secs(2));
    }

    #[test]
    fn unknown_keys_and_bad_env_are_errors() {
        assert!(HostConfig::from_toml("proxy_port = 3128\n").is_err());
        let mut c = HostConfig::default();
        assert!(c.apply_env(|k| (k == "TERMNET_HOST_PORT").then(|| "http".to_string())).is_err());
    }
}
