//! Load config from file and environment.

use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use chute_core::DEFAULT_PORT;

/// Server configuration. File: ~/.config/chute/server.toml or /etc/chute/server.toml.
/// Env overrides: CHUTE_BIND, CHUTE_STORAGE_DIR, CHUTE_DATA_DIR, CHUTE_MAX_UPLOAD_BYTES.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// UDP listen address (default 0.0.0.0:12345).
    #[serde(default = "default_bind")]
    pub bind: SocketAddr,
    /// Directory uploaded files are written into.
    #[serde(default = "default_storage_dir")]
    pub storage_dir: PathBuf,
    /// Directory for users.json and transfers.jsonl.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// Largest total_size a START may announce (default 4 GiB).
    #[serde(default = "default_max_upload_bytes")]
    pub max_upload_bytes: u64,
    /// Datagrams handled concurrently (default 64).
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,
}

fn default_bind() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT))
}
fn default_storage_dir() -> PathBuf {
    PathBuf::from("storage")
}
fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}
fn default_max_upload_bytes() -> u64 {
    4 << 30
}
fn default_max_in_flight() -> usize {
    64
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            storage_dir: default_storage_dir(),
            data_dir: default_data_dir(),
            max_upload_bytes: default_max_upload_bytes(),
            max_in_flight: default_max_in_flight(),
        }
    }
}

impl Config {
    pub fn users_path(&self) -> PathBuf {
        self.data_dir.join("users.json")
    }

    pub fn ledger_path(&self) -> PathBuf {
        self.data_dir.join("transfers.jsonl")
    }

    /// Apply `CHUTE_*` overrides. Unparseable values are logged and ignored.
    pub fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(s) = var("CHUTE_BIND") {
            match s.parse() {
                Ok(a) => self.bind = a,
                Err(_) => tracing::warn!(value = %s, "ignoring invalid CHUTE_BIND"),
            }
        }
        if let Some(s) = var("CHUTE_STORAGE_DIR") {
            self.storage_dir = PathBuf::from(s);
        }
        if let Some(s) = var("CHUTE_DATA_DIR") {
            self.data_dir = PathBuf::from(s);
        }
        if let Some(s) = var("CHUTE_MAX_UPLOAD_BYTES") {
            match s.parse() {
                Ok(n) => self.max_upload_bytes = n,
                Err(_) => tracing::warn!(value = %s, "ignoring invalid CHUTE_MAX_UPLOAD_BYTES"),
            }
        }
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
    if c.max_in_flight == 0 {
        return Err(ConfigError::Invalid("max_in_flight must be at least 1"));
    }
    Ok(c)
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/chute/server.toml"));
    }
    out.push(PathBuf::from("/etc/chute/server.toml"));
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
