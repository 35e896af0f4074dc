//! Session configuration.

use std::collections::HashMap;
use std::env;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ShellError, ShellResult};

/// Default number of documents shown per top-level cursor materialization.
pub const DEFAULT_DISPLAY_BATCH_SIZE: usize = 20;

fn default_display_batch_size() -> usize {
    DEFAULT_DISPLAY_BATCH_SIZE
}

fn default_true() -> bool {
    true
}

/// Stable API settings of the connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiVersionInfo {
    pub version: u32,
    #[serde(default)]
    pub strict: bool,
}

/// Settings read by every object of one session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionConfig {
    #[serde(default = "default_display_batch_size")]
    pub display_batch_size: usize,
    #[serde(default = "default_true")]
    pub telemetry_enabled: bool,
    #[serde(default = "default_true")]
    pub show_warnings: bool,
    #[serde(default)]
    pub api_version: Option<ApiVersionInfo>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            display_batch_size: DEFAULT_DISPLAY_BATCH_SIZE,
            telemetry_enabled: true,
            show_warnings: true,
            api_version: None,
        }
    }
}

impl SessionConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults adjusted by the environment.
    ///
    /// Reads `SHELLCORE_DISPLAY_BATCH_SIZE` and the telemetry opt-out
    /// variables. An unparsable batch size is ignored with a warning.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(raw) = env::var("SHELLCORE_DISPLAY_BATCH_SIZE") {
            match raw.trim().parse::<usize>() {
                Ok(n) if n > 0 => config.display_batch_size = n,
                _ => log::warn!("ignoring invalid SHELLCORE_DISPLAY_BATCH_SIZE={}", raw),
            }
        }
        if crate::telemetry::is_telemetry_disabled() {
            config.telemetry_enabled = false;
        }
        config
    }

    /// Merge a key/value override map on top of this configuration.
    pub fn with_overrides(&self, overrides: &HashMap<String, Value>) -> ShellResult<Self> {
        let mut merged = match serde_json::to_value(self)? {
            Value::Object(map) => map,
            _ => return Err(ShellError::Internal("config did not serialize to a map".into())),
        };
        for (key, value) in overrides {
            if !merged.contains_key(key) {
                return Err(ShellError::invalid_input(format!(
                    "unknown session option: {key}"
                )));
            }
            merged.insert(key.clone(), value.clone());
        }
        let config: SessionConfig = serde_json::from_value(Value::Object(merged))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> ShellResult<()> {
        if self.display_batch_size == 0 {
            return Err(ShellError::invalid_input(
                "display_batch_size must be a positive integer",
            ));
        }
        Ok(())
    }
}
