//! Relay configuration.
//!
//! The configuration is a flat TOML document naming the listen address and
//! the two downstream destinations:
//!
//! ```toml
//! listen_host = "0.0.0.0"
//! listen_port = 1935
//! storage_host = "127.0.0.1"
//! storage_port = 9000
//! media_host = "127.0.0.1"
//! media_port = 1936
//! ```
//!
//! Resolution order:
//! 1. Explicit path (CLI `--config`)
//! 2. `./config.toml`
//! 3. Global config (`<config_dir>/streamfork/config.toml`)
//!
//! Environment variables are applied on top of whichever file was loaded.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::{Error, Result};

/// Connect timeout applied to each outbound destination, in seconds.
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 7;

/// Period of the per-session throughput log line, in seconds.
pub const DEFAULT_STATS_INTERVAL_SECS: u64 = 3;

/// Time teardown gives destinations to take their queued bytes, in seconds.
pub const DEFAULT_DRAIN_TIMEOUT_SECS: u64 = 5;

/// File name looked up in the working directory and the global config dir.
pub const CONFIG_FILE_NAME: &str = "config.toml";

/// A host/port pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// Complete relay configuration. Immutable once loaded.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub listen_host: String,
    pub listen_port: u16,

    pub storage_host: String,
    pub storage_port: u16,

    #[serde(alias = "rtmp_host")]
    pub media_host: String,
    #[serde(alias = "rtmp_port")]
    pub media_port: u16,

    /// Seconds a destination may stay unconnected before the session aborts.
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    /// Seconds between "data received" log lines.
    #[serde(default = "default_stats_interval_secs")]
    pub stats_interval_secs: u64,

    /// Seconds a closing session waits for destinations to drain, on top of
    /// the connect timeout, before cutting them off.
    #[serde(default = "default_drain_timeout_secs")]
    pub drain_timeout_secs: u64,

    /// Upper bound on bytes held for a destination that has not connected
    /// yet. `None` keeps the backlog unbounded.
    #[serde(default)]
    pub max_buffer_bytes: Option<usize>,
}

const fn default_connect_timeout_secs() -> u64 {
    DEFAULT_CONNECT_TIMEOUT_SECS
}

const fn default_stats_interval_secs() -> u64 {
    DEFAULT_STATS_INTERVAL_SECS
}

const fn default_drain_timeout_secs() -> u64 {
    DEFAULT_DRAIN_TIMEOUT_SECS
}

impl Config {
    /// Build a config from the three endpoints with default tunables.
    pub fn new(listen: Endpoint, storage: Endpoint, media: Endpoint) -> Self {
        Self {
            listen_host: listen.host,
            listen_port: listen.port,
            storage_host: storage.host,
            storage_port: storage.port,
            media_host: media.host,
            media_port: media.port,
            connect_timeout_secs: DEFAULT_CONNECT_TIMEOUT_SECS,
            stats_interval_secs: DEFAULT_STATS_INTERVAL_SECS,
            drain_timeout_secs: DEFAULT_DRAIN_TIMEOUT_SECS,
            max_buffer_bytes: None,
        }
    }

    /// Parse and validate a TOML document.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Read and parse a config file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("Failed to read config file {}: {}", path.display(), e))
        })?;
        let config: Self = toml::from_str(&content).map_err(|e| {
            Error::Config(format!("Failed to parse config file {}: {}", path.display(), e))
        })?;
        Ok(config)
    }

    /// Locate, load, apply environment overrides and validate.
    ///
    /// Returns the config together with the path it was loaded from.
    pub fn resolve(explicit: Option<&Path>) -> Result<(Self, PathBuf)> {
        Self::resolve_with(explicit, |key| std::env::var(key).ok())
    }

    fn resolve_with<F>(explicit: Option<&Path>, lookup: F) -> Result<(Self, PathBuf)>
    where
        F: Fn(&str) -> Option<String>,
    {
        let path = match explicit {
            Some(p) => p.to_path_buf(),
            None => candidate_paths()
                .into_iter()
                .find(|p| p.exists())
                .ok_or_else(|| {
                    Error::Config(format!(
                        "No {CONFIG_FILE_NAME} found in the working directory or {}",
                        global_config_path()
                            .map_or_else(|| "<no config dir>".into(), |p| p.display().to_string())
                    ))
                })?,
        };

        let mut config = Self::load(&path)?;
        config.apply_overrides(lookup)?;
        config.validate()?;
        Ok((config, path))
    }

    /// Apply `STREAMFORK_*` overrides using the given variable lookup.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(val) = lookup("STREAMFORK_LISTEN_HOST") {
            self.listen_host = val;
        }
        if let Some(val) = lookup("STREAMFORK_LISTEN_PORT") {
            self.listen_port = parse_port("STREAMFORK_LISTEN_PORT", &val)?;
        }
        if let Some(val) = lookup("STREAMFORK_STORAGE_HOST") {
            self.storage_host = val;
        }
        if let Some(val) = lookup("STREAMFORK_STORAGE_PORT") {
            self.storage_port = parse_port("STREAMFORK_STORAGE_PORT", &val)?;
        }
        if let Some(val) = lookup("STREAMFORK_MEDIA_HOST") {
            self.media_host = val;
        }
        if let Some(val) = lookup("STREAMFORK_MEDIA_PORT") {
            self.media_port = parse_port("STREAMFORK_MEDIA_PORT", &val)?;
        }
        Ok(())
    }

    /// Reject configurations the relay cannot run with.
    pub fn validate(&self) -> Result<()> {
        for (key, host) in [
            ("listen_host", &self.listen_host),
            ("storage_host", &self.storage_host),
            ("media_host", &self.media_host),
        ] {
            if host.trim().is_empty() {
                return Err(Error::Config(format!("{key} must not be empty")));
            }
        }
        if self.storage_port == 0 {
            return Err(Error::Config("storage_port must not be 0".into()));
        }
        if self.media_port == 0 {
            return Err(Error::Config("media_port must not be 0".into()));
        }
        if self.connect_timeout_secs == 0 {
            return Err(Error::Config("connect_timeout_secs must be positive".into()));
        }
        if self.stats_interval_secs == 0 {
            return Err(Error::Config("stats_interval_secs must be positive".into()));
        }
        if self.drain_timeout_secs == 0 {
            return Err(Error::Config("drain_timeout_secs must be positive".into()));
        }
        if self.max_buffer_bytes == Some(0) {
            return Err(Error::Config("max_buffer_bytes must be positive".into()));
        }
        Ok(())
    }

    pub fn listen(&self) -> Endpoint {
        Endpoint::new(self.listen_host.clone(), self.listen_port)
    }

    pub fn storage(&self) -> Endpoint {
        Endpoint::new(self.storage_host.clone(), self.storage_port)
    }

    pub fn media(&self) -> Endpoint {
        Endpoint::new(self.media_host.clone(), self.media_port)
    }

    pub const fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub const fn stats_interval(&self) -> Duration {
        Duration::from_secs(self.stats_interval_secs)
    }

    pub const fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }
}

fn parse_port(key: &str, value: &str) -> Result<u16> {
    value
        .trim()
        .parse()
        .map_err(|e| Error::Config(format!("{key}={value:?} is not a valid port: {e}")))
}

/// Paths searched when no explicit config path is given, in priority order.
pub fn candidate_paths() -> Vec<PathBuf> {
    let mut paths = vec![PathBuf::from(CONFIG_FILE_NAME)];
    if let Some(global) = global_config_path() {
        paths.push(global);
    }
    paths
}

/// Get the global config file path.
pub fn global_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("streamfork").join(CONFIG_FILE_NAME))
}
