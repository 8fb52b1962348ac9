use crate::config::types::{KqueryError, Result, DEFAULT_MAX_CALL, DEFAULT_MAX_RESP};
/// Configuration loading from kquery.json
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Default location of the collector socket
pub const DEFAULT_SOCKET_PATH: &str = "/run/kquery/kquery.sock";

/// Runtime configuration shared by the collector daemon and the client
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct KqueryConfig {
    /// Unix socket the daemon listens on and the client connects to
    pub socket_path: PathBuf,
    /// Root of the proc filesystem walked by the collector
    pub proc_root: PathBuf,
    /// Requests of this many bytes or more are rejected
    pub max_call: usize,
    /// Response buffer size, terminator included
    pub max_resp: usize,
    /// SQLite database file for the staging table (None = in-memory)
    pub db_path: Option<PathBuf>,
    /// Separator placed between columns of a result row
    pub column_separator: String,
}

impl Default for KqueryConfig {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from(DEFAULT_SOCKET_PATH),
            proc_root: PathBuf::from("/proc"),
            max_call: DEFAULT_MAX_CALL,
            max_resp: DEFAULT_MAX_RESP,
            db_path: None,
            column_separator: "|".to_string(),
        }
    }
}

impl KqueryConfig {
    /// Load configuration from a JSON file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            KqueryError::Config(format!(
                "Failed to read config file {}: {}",
                path.as_ref().display(),
                e
            ))
        })?;

        let config: KqueryConfig = serde_json::from_str(&content)
            .map_err(|e| KqueryError::Config(format!("Failed to parse config JSON: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Explicit path if given, else ./kquery.json if present, else defaults
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::load_from_file(path);
        }

        let local = Path::new("kquery.json");
        if local.exists() {
            log::info!("Loading configuration from {}", local.display());
            return Self::load_from_file(local);
        }

        log::debug!("No kquery.json found, using built-in defaults");
        Ok(Self::default())
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_call < 2 {
            return Err(KqueryError::Config(format!(
                "max_call must be at least 2, got {}",
                self.max_call
            )));
        }
        if self.max_resp < 2 {
            return Err(KqueryError::Config(format!(
                "max_resp must be at least 2, got {}",
                self.max_resp
            )));
        }
        if self.column_separator.is_empty() {
            return Err(KqueryError::Config(
                "column_separator must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}
