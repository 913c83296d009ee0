//! Project-scoped paths and daemon configuration.
//!
//! Everything the daemon touches lives under `<project>/.procsi/`. Config
//! comes from `config.json`; every value must be a positive integer and
//! invalid values fall back to their default with a warning (a bad config
//! never stops the daemon).

use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::warn;

pub const DEFAULT_MAX_STORED_REQUESTS: u64 = 5000;
pub const DEFAULT_MAX_BODY_SIZE: u64 = 10 * 1024 * 1024;
pub const DEFAULT_MAX_LOG_SIZE: u64 = 10 * 1024 * 1024;
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 1000;

// ---------------------------------------------------------------------------
// Paths
// ---------------------------------------------------------------------------

/// The `.procsi/` directory layout for one project.
#[derive(Debug, Clone)]
pub struct ProjectPaths {
    root: PathBuf,
}

impl ProjectPaths {
    /// `project_dir` is the project root; the daemon works under its
    /// `.procsi/` subdirectory.
    pub fn new(project_dir: &Path) -> Self {
        Self {
            root: project_dir.join(".procsi"),
        }
    }

    /// Use an existing `.procsi/` directory directly (tests).
    pub fn at_root(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn requests_db(&self) -> PathBuf {
        self.root.join("requests.db")
    }

    pub fn ca_cert(&self) -> PathBuf {
        self.root.join("ca.pem")
    }

    pub fn ca_key(&self) -> PathBuf {
        self.root.join("ca-key.pem")
    }

    pub fn proxy_port_file(&self) -> PathBuf {
        self.root.join("proxy.port")
    }

    pub fn control_socket(&self) -> PathBuf {
        self.root.join("control.sock")
    }

    pub fn config_file(&self) -> PathBuf {
        self.root.join("config.json")
    }

    pub fn log_file(&self) -> PathBuf {
        self.root.join("procsi.log")
    }

    pub fn interceptors_dir(&self) -> PathBuf {
        self.root.join("interceptors")
    }

    /// Create the directory tree if missing.
    pub fn ensure(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.root)?;
        std::fs::create_dir_all(self.interceptors_dir())
    }
}

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DaemonConfig {
    pub max_stored_requests: u64,
    pub max_body_size: u64,
    /// Consumed by the external log rotator; carried here so `config.json`
    /// validates as one unit.
    pub max_log_size: u64,
    pub poll_interval_ms: u64,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            max_stored_requests: DEFAULT_MAX_STORED_REQUESTS,
            max_body_size: DEFAULT_MAX_BODY_SIZE,
            max_log_size: DEFAULT_MAX_LOG_SIZE,
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("reading {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
}

impl DaemonConfig {
    /// Load from `config.json`. A missing file means all defaults; a file
    /// that is not a JSON object, or any non-positive-integer value, falls
    /// back per-field with a warning.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Self::default());
            }
            Err(source) => {
                return Err(ConfigError::Io {
                    path: path.display().to_string(),
                    source,
                });
            }
        };
        Ok(Self::from_json_str(&text))
    }

    pub fn from_json_str(text: &str) -> Self {
        let value: serde_json::Value = match serde_json::from_str(text) {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "config.json is not valid JSON, using defaults");
                return Self::default();
            }
        };
        let defaults = Self::default();
        Self {
            max_stored_requests: positive_field(
                &value,
                "maxStoredRequests",
                defaults.max_stored_requests,
            ),
            max_body_size: positive_field(&value, "maxBodySize", defaults.max_body_size),
            max_log_size: positive_field(&value, "maxLogSize", defaults.max_log_size),
            poll_interval_ms: positive_field(&value, "pollInterval", defaults.poll_interval_ms),
        }
    }
}

fn positive_field(value: &serde_json::Value, key: &str, default: u64) -> u64 {
    match value.get(key) {
        None => default,
        Some(v) => match v.as_u64() {
            Some(n) if n > 0 => n,
            _ => {
                warn!(key, value = %v, default, "invalid config value, using default");
                default
            }
        },
    }
}
