//! Load config from file and environment.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chute_core::{DEFAULT_PORT, DEFAULT_REPLY_TIMEOUT, DEFAULT_RETRY_LIMIT};

/// Client configuration. File: ~/.config/chute/client.toml or /etc/chute/client.toml.
/// Env overrides: CHUTE_SERVER, CHUTE_TIMEOUT_MS, CHUTE_RETRY_LIMIT.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Server address as `host:port` (default 127.0.0.1:12345).
    #[serde(default = "default_server")]
    pub server: String,
    /// How long to wait for each reply (default 5000 ms).
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Attempts per protocol step before the upload fails (default 4).
    #[serde(default = "default_retry_limit")]
    pub retry_limit: u32,
}

fn default_server() -> String {
    format!("127.0.0.1:{DEFAULT_PORT}")
}
fn default_timeout_ms() -> u64 {
    DEFAULT_REPLY_TIMEOUT.as_millis() as u64
}
fn default_retry_limit() -> u32 {
    DEFAULT_RETRY_LIMIT
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: default_server(),
            timeout_ms: default_timeout_ms(),
            retry_limit: default_retry_limit(),
        }
    }
}

impl Config {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Apply `CHUTE_*` overrides. Unparseable values are logged and ignored.
    pub fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(s) = var("CHUTE_SERVER") {
            self.server = s;
        }
        if let Some(s) = var("CHUTE_TIMEOUT_MS") {
            match s.parse() {
                Ok(ms) => self.timeout_ms = ms,
                Err(_) => tracing::warn!(value = %s, "ignoring invalid CHUTE_TIMEOUT_MS"),
            }
        }
        if let Some(s) = var("CHUTE_RETRY_LIMIT") {
            match s.parse() {
                Ok(n) => self.retry_limit = n,
                Err(_) => tracing::warn!(value = %s, "ignoring invalid CHUTE_RETRY_LIMIT"),
            }
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.timeout_ms == 0 {
            return Err(ConfigError::Invalid("timeout_ms must be positive"));
        }
        if self.retry_limit == 0 {
            return Err(ConfigError::Invalid("retry_limit must be at least 1"));
        }
        Ok(())
    }
}

/// Load config: defaults, then config file (explicit path or the first one found), then env vars.
pub fn load(explicit: Option<&Path>) -> Result<Config, ConfigError> {
    let mut c = match explicit {
        Some(p) => read_file(p)?,
        None => match config_paths().into_iter().find(|p| p.exists()) {
            Some(p) => read_file(&p)?,
            None => Config::default(),
        },
    };
    c.apply_env(|k| std::env::var(k).ok());
    c.validate()?;
    Ok(c)
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/chute/client.toml"));
    }
    out.push(PathBuf::from("/etc/chute/client.toml"));
    out
}

fn read_file(path: &Path) -> Result<Config, ConfigError> {
    let s = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str(&s).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid config {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("invalid config: {0}")]
    Invalid(&'static str),
}
