//! Dispatcher configuration.
//!
//! A [`DispatcherConfig`] is fixed at construction. It can be built in code,
//! deserialized with serde, or loaded from environment variables:
//!
//! | Variable                      | Field                | Default        |
//! |-------------------------------|----------------------|----------------|
//! | `DISPATCH_MODE`               | `mode`               | `sequential`   |
//! | `DISPATCH_BREAK_ON_EXCEPTION` | `break_on_exception` | `false`        |
//! | `DISPATCH_STAGE_TIMEOUT_MS`   | `stage_timeout_ms`   | `5000`         |
//! | `DISPATCH_NAME`               | `name`               | `dispatcher-<uuid>` |

use std::env;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ConfigError;

/// Default stage timeout in milliseconds.
pub const DEFAULT_STAGE_TIMEOUT_MS: u64 = 5_000;

/// How the handlers of a single stage are executed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DispatchMode {
    /// One concurrent task per handler, bounded by the stage timeout.
    Parallel,
    /// One handler at a time, in registration order, on the worker task.
    #[default]
    Sequential,
}

impl fmt::Display for DispatchMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DispatchMode::Parallel => write!(f, "parallel"),
            DispatchMode::Sequential => write!(f, "sequential"),
        }
    }
}

impl FromStr for DispatchMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "parallel" => Ok(DispatchMode::Parallel),
            "sequential" => Ok(DispatchMode::Sequential),
            _ => Err(ConfigError::InvalidMode {
                value: s.to_string(),
            }),
        }
    }
}

/// Configuration for a [`Dispatcher`](crate::Dispatcher).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    /// Execution discipline applied to every stage.
    pub mode: DispatchMode,
    /// Abort the remaining stages of an event when a stage fails.
    pub break_on_exception: bool,
    /// How long a parallel stage waits for its handlers.
    ///
    /// Ignored in sequential mode.
    pub stage_timeout_ms: u64,
    /// Name used in log fields.
    pub name: String,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            mode: DispatchMode::default(),
            break_on_exception: false,
            stage_timeout_ms: DEFAULT_STAGE_TIMEOUT_MS,
            name: format!("dispatcher-{}", Uuid::new_v4()),
        }
    }
}

impl DispatcherConfig {
    /// Sequential configuration with default settings.
    pub fn sequential() -> Self {
        Self::default()
    }

    /// Parallel configuration with the given stage timeout.
    pub fn parallel(stage_timeout_ms: u64) -> Self {
        Self {
            mode: DispatchMode::Parallel,
            stage_timeout_ms,
            ..Default::default()
        }
    }

    pub fn with_mode(mut self, mode: DispatchMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_break_on_exception(mut self, enabled: bool) -> Self {
        self.break_on_exception = enabled;
        self
    }

    pub fn with_stage_timeout_ms(mut self, ms: u64) -> Self {
        self.stage_timeout_ms = ms;
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// The stage timeout as a [`Duration`].
    pub fn stage_timeout(&self) -> Duration {
        Duration::from_millis(self.stage_timeout_ms)
    }

    /// Check the configuration for values the worker cannot honour.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.mode == DispatchMode::Parallel && self.stage_timeout_ms == 0 {
            return Err(ConfigError::ZeroTimeout);
        }
        Ok(())
    }

    /// Load configuration from environment variables.
    ///
    /// Reads a `.env` file first if one is present. Unset variables fall back
    /// to the defaults.
    pub fn from_env() -> Result<Self> {
        let _ = dotenvy::dotenv();
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(mode) = lookup("DISPATCH_MODE") {
            config.mode = mode.parse().context("DISPATCH_MODE is invalid")?;
        }
        if let Some(flag) = lookup("DISPATCH_BREAK_ON_EXCEPTION") {
            config.break_on_exception = flag
                .trim()
                .parse()
                .context("DISPATCH_BREAK_ON_EXCEPTION must be true or false")?;
        }
        if let Some(ms) = lookup("DISPATCH_STAGE_TIMEOUT_MS") {
            config.stage_timeout_ms = ms
                .trim()
                .parse()
                .context("DISPATCH_STAGE_TIMEOUT_MS must be a valid number")?;
        }
        if let Some(name) = lookup("DISPATCH_NAME") {
            config.name = name;
        }

        config.validate()?;
        Ok(config)
    }
}
