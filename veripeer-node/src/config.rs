//! Load config from file and environment.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use veripeer_core::Retention;

/// Node configuration. File: ~/.config/veripeer/config.toml or /etc/veripeer/config.toml.
/// Env overrides: VERIPEER_HOST, VERIPEER_PORT, VERIPEER_TRACKER_URL, VERIPEER_IO_TIMEOUT_SECS.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Listen host (default 127.0.0.1).
    #[serde(default = "default_host")]
    pub host: String,
    /// Listen port (default 1060). 0 lets the OS pick.
    #[serde(default = "default_port")]
    pub port: u16,
    /// Tracker base URL, e.g. `http://127.0.0.1:8000`.
    #[serde(default)]
    pub tracker_url: Option<String>,
    /// Deadline for connect, handshake and every framed read/write (default 30).
    #[serde(default = "default_io_timeout_secs")]
    pub io_timeout_secs: u64,
    /// Listen backlog (default 10).
    #[serde(default = "default_backlog")]
    pub backlog: u32,
    /// Activity log retention per stream (default bounded 100).
    #[serde(default)]
    pub retention: Retention,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    1060
}
fn default_io_timeout_secs() -> u64 {
    30
}
fn default_backlog() -> u32 {
    10
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            tracker_url: None,
            io_timeout_secs: default_io_timeout_secs(),
            backlog: default_backlog(),
            retention: Retention::default(),
        }
    }
}

impl Config {
    /// Defaults with a specific listen address.
    pub fn with_addr(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            ..Self::default()
        }
    }

    pub fn io_timeout(&self) -> Duration {
        Duration::from_secs(self.io_timeout_secs.max(1))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

/// Load config: merge default, then config file (if present), then env vars.
pub fn load() -> Config {
    let c = match load_file() {
        Some(Ok(c)) => c,
        Some(Err(e)) => {
            tracing::warn!(error = %e, "ignoring config file");
            Config::default()
        }
        None => Config::default(),
    };
    apply_env(c)
}

/// Load an explicit config file, then apply env vars.
pub fn load_from(path: &Path) -> Result<Config, ConfigError> {
    read_file(path).map(apply_env)
}

fn apply_env(mut c: Config) -> Config {
    if let Ok(s) = std::env::var("VERIPEER_HOST") {
        if !s.is_empty() {
            c.host = s;
        }
    }
    if let Ok(s) = std::env::var("VERIPEER_PORT") {
        if let Ok(p) = s.parse::<u16>() {
            c.port = p;
        }
    }
    if let Ok(s) = std::env::var("VERIPEER_TRACKER_URL") {
        if !s.is_empty() {
            c.tracker_url = Some(s);
        }
    }
    if let Ok(s) = std::env::var("VERIPEER_IO_TIMEOUT_SECS") {
        if let Ok(t) = s.parse::<u64>() {
            c.io_timeout_secs = t;
        }
    }
    c
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/veripeer/config.toml"));
    }
    out.push(PathBuf::from("/etc/veripeer/config.toml"));
    out
}

fn load_file() -> Option<Result<Config, ConfigError>> {
    config_paths()
        .into_iter()
        .find(|p| p.exists())
        .map(|p| read_file(&p))
}

fn read_file(path: &Path) -> Result<Config, ConfigError> {
    let s = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str::<Config>(&s).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}
