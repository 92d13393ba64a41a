use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("failed to read {path}: {err}")]
    Read { path: PathBuf, err: std::io::Error },
    #[error("failed to parse {path}: {err}")]
    Parse {
        path: PathBuf,
        err: serde_json::Error,
    },
}

/// Engine tunables.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    /// Delay between a state's release and its final free.
    pub grace_period_ms: u64,
    /// How long an unused pidlist is kept around.
    pub pidlist_linger_ms: u64,
    /// Workers of the destruction queue. One keeps teardown strictly ordered.
    pub destroy_workers: usize,
    /// Controllers that are registered but never bound to a hierarchy.
    pub disabled: Vec<String>,
    /// Controllers refused on legacy hierarchies.
    pub no_v1: Vec<String>,
    /// Controllers that cannot be enabled on the default hierarchy.
    pub dfl_inhibit: Vec<String>,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            grace_period_ms: 10,
            pidlist_linger_ms: 1000,
            destroy_workers: 1,
            disabled: Vec::new(),
            no_v1: Vec::new(),
            dfl_inhibit: Vec::new(),
        }
    }
}

impl CoreConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|err| ConfigError::Read {
            path: path.to_path_buf(),
            err,
        })?;
        serde_json::from_str(&content).map_err(|err| ConfigError::Parse {
            path: path.to_path_buf(),
            err,
        })
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }

    pub fn pidlist_linger(&self) -> Duration {
        Duration::from_millis(self.pidlist_linger_ms)
    }
}
