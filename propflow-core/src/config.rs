//! Store configuration

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse YAML: {0}")]
    ParseError(#[from] serde_yaml::Error),

    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },
}

/// Settings for one [`PropStore`](crate::PropStore)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Name recorded on log events
    #[serde(default = "default_name")]
    pub name: String,

    /// Run callbacks registered on an already settled change resolution one
    /// tick later instead of inline
    #[serde(default)]
    pub defer_late_callbacks: bool,

    /// Expiry applied to slots that carry no cache policy of their own
    #[serde(default)]
    pub default_expires_in_ms: Option<u64>,

    /// Nesting limit for batch actions; deeper batches are skipped
    #[serde(default = "default_max_batch_depth")]
    pub max_batch_depth: usize,
}

fn default_name() -> String {
    String::from("props")
}

fn default_max_batch_depth() -> usize {
    16
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            defer_late_callbacks: false,
            default_expires_in_ms: None,
            max_batch_depth: default_max_batch_depth(),
        }
    }
}

impl StoreConfig {
    /// Parse configuration from YAML text
    pub fn from_yaml_str(contents: &str) -> Result<Self, ConfigError> {
        let config: StoreConfig = serde_yaml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path.as_ref())?;
        Self::from_yaml_str(&contents)
    }

    pub fn default_expires_in(&self) -> Option<Duration> {
        self.default_expires_in_ms.map(Duration::from_millis)
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_defer_late_callbacks(mut self, defer: bool) -> Self {
        self.defer_late_callbacks = defer;
        self
    }

    pub fn with_default_expires_in(mut self, expires_in: Duration) -> Self {
        let millis = u64::try_from(expires_in.as_millis()).unwrap_or(u64::MAX);
        self.default_expires_in_ms = Some(millis);
        self
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.name.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "name",
                reason: "must not be empty".into(),
            });
        }
        if self.max_batch_depth == 0 {
            return Err(ConfigError::InvalidValue {
                field: "max_batch_depth",
                reason: "must be at least 1".into(),
            });
        }
        Ok(())
    }
}
