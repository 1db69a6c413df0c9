use crate::debugger::Error;
use crate::{lb_warn, muted_error};
use serde::Deserialize;
use std::fs::read_to_string;
use std::path::Path;
use std::time::Duration;

/// Retry policy for breakpoints that failed to install.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Backoff after the first patch failure, in ticks.
    pub base_ticks: u32,
    /// Backoff upper bound, in ticks.
    pub max_ticks: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_ticks: 1,
            max_ticks: 32,
        }
    }
}

/// Limits applied when locals are encoded into a capture payload.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    pub max_depth: usize,
    pub max_string_len: usize,
    pub max_locals: usize,
    pub max_frames: usize,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            max_depth: 4,
            max_string_len: 256,
            max_locals: 64,
            max_frames: 64,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Interval between desired set fetches.
    pub poll_interval_secs: u64,
    pub log_enabled: bool,
    /// Number of module outlines kept by the resolver.
    pub outline_cache_size: usize,
    pub retry: RetryConfig,
    pub capture: CaptureConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            poll_interval_secs: 30,
            log_enabled: true,
            outline_cache_size: 64,
            retry: RetryConfig::default(),
            capture: CaptureConfig::default(),
        }
    }
}

impl Config {
    const DEFAULT_PATH: &'static str = ".config/livebreak/config.toml";

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.max(1))
    }

    pub fn parse(data: &str) -> Result<Self, Error> {
        Ok(toml::de::from_str(data)?)
    }

    /// Load configuration.
    ///
    /// An explicitly given file must exist and be valid. Without a path
    /// `~/.config/livebreak/config.toml` is used if present, defaults otherwise.
    pub fn load(path: Option<&Path>) -> Result<Self, Error> {
        match path {
            Some(path) => Self::parse(&read_to_string(path)?),
            None => Ok(Self::from_default_file().unwrap_or_default()),
        }
    }

    fn from_default_file() -> Option<Self> {
        let path = home::home_dir()?.join(Self::DEFAULT_PATH);
        if !path.exists() {
            return None;
        }
        let data = muted_error!(read_to_string(&path))?;
        match Self::parse(&data) {
            Ok(config) => Some(config),
            Err(err) => {
                lb_warn!("ignore invalid config file {}: {err}", path.display());
                None
            }
        }
    }
}
