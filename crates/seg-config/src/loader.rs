//! Configuration loader with file and environment variable support

use crate::{AppConfig, ConfigError};
use std::env;
use std::path::PathBuf;
use tracing::info;

/// Standard config file search paths
const CONFIG_PATHS: &[&str] = &[
    "config.toml",
    "segments.toml",
    "./config/config.toml",
    "/etc/segments/config.toml",
];

/// Configuration loader
pub struct ConfigLoader {
    config_path: Option<PathBuf>,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self { config_path: None }
    }

    /// Create a loader with a specific config file path
    pub fn with_path<P: Into<PathBuf>>(path: P) -> Self {
        Self {
            config_path: Some(path.into()),
        }
    }

    /// Load configuration from file (if found) with environment variable overrides
    pub fn load(&self) -> Result<AppConfig, ConfigError> {
        let mut config = match self.find_config_file() {
            Some(path) => {
                info!(?path, "Loading configuration from file");
                AppConfig::from_file(&path)?
            }
            None => AppConfig::default(),
        };

        self.apply_env_overrides(&mut config);
        config.validate()?;

        Ok(config)
    }

    fn find_config_file(&self) -> Option<PathBuf> {
        if let Some(path) = &self.config_path {
            if path.exists() {
                return Some(path.clone());
            }
        }

        if let Ok(path) = env::var("SEGMENTS_CONFIG") {
            let path = PathBuf::from(path);
            if path.exists() {
                return Some(path);
            }
        }

        CONFIG_PATHS
            .iter()
            .map(PathBuf::from)
            .find(|path| path.exists())
    }

    fn apply_env_overrides(&self, config: &mut AppConfig) {
        // HTTP
        if let Ok(val) = env::var("SEGMENTS_HTTP_HOST") {
            config.http.host = val;
        }
        if let Ok(val) = env::var("SEGMENTS_HTTP_PORT") {
            if let Ok(port) = val.parse() {
                config.http.port = port;
            }
        }

        // Database
        if let Ok(val) = env::var("SEGMENTS_DATABASE_KIND") {
            config.database.kind = val;
        }
        if let Ok(val) = env::var("SEGMENTS_DATABASE_URL") {
            config.database.url = val;
        }
        if let Ok(val) = env::var("SEGMENTS_DATABASE_MAX_CONNECTIONS") {
            if let Ok(max) = val.parse() {
                config.database.max_connections = max;
            }
        }

        // Membership lifecycle
        if let Ok(val) = env::var("SEGMENTS_STORE_TIMEOUT_MS") {
            if let Ok(timeout) = val.parse() {
                config.membership.store_timeout_ms = timeout;
            }
        }
        if let Ok(val) = env::var("SEGMENTS_RECONCILE_ON_STARTUP") {
            config.membership.reconcile_on_startup = val.parse().unwrap_or(true);
        }
        if let Ok(val) = env::var("SEGMENTS_SWEEP_INTERVAL_SECS") {
            if let Ok(interval) = val.parse() {
                config.membership.sweep_interval_secs = interval;
            }
        }
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}
