//! Session configuration.
//!
//! A [`SessionConfig`] is chosen once when a session is opened and fixes the
//! execution mode for every table in it. It can be built in code or read from
//! JSON; missing keys take their defaults.
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use snafu::prelude::*;

use crate::output::FloatFormat;

/// Errors from loading a configuration.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[snafu(display("Failed to read configuration {}: {source}", path.display()))]
    Read {
        /// Configuration path.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// The configuration is not valid JSON for [`SessionConfig`].
    #[snafu(display("Invalid configuration: {source}"))]
    Parse {
        /// Underlying JSON error.
        source: serde_json::Error,
    },
}

/// When computations run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    /// Compute on the calling thread as soon as work is requested.
    #[default]
    Immediate,
    /// Build a dependency graph and run it with a scheduler.
    Deferred,
}

impl ExecutionMode {
    /// Lowercase name of the mode.
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionMode::Immediate => "immediate",
            ExecutionMode::Deferred => "deferred",
        }
    }
}

impl std::fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Configuration of a [`crate::Session`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Execution mode for every table of the session.
    pub mode: ExecutionMode,
    /// Root of per-table result directories.
    pub result_dir: PathBuf,
    /// Root of the deferred-mode cache.
    pub cache_dir: PathBuf,
    /// Whether deferred nodes read and write the cache.
    pub use_cache: bool,
    /// Scheduler worker slots.
    pub max_workers: usize,
    /// Default float formatting for written tables.
    pub float_format: FloatFormat,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            mode: ExecutionMode::Immediate,
            result_dir: PathBuf::from("results"),
            cache_dir: PathBuf::from("cache"),
            use_cache: true,
            max_workers: std::thread::available_parallelism().map_or(1, |n| n.get()),
            float_format: FloatFormat::default(),
        }
    }
}

impl SessionConfig {
    /// Default configuration for `mode`.
    pub fn new(mode: ExecutionMode) -> Self {
        Self {
            mode,
            ..Self::default()
        }
    }

    /// Same configuration with result and cache directories under `root`.
    pub fn rooted_at(mut self, root: impl AsRef<Path>) -> Self {
        let root = root.as_ref();
        self.result_dir = root.join("results");
        self.cache_dir = root.join("cache");
        self
    }

    /// Parse a JSON configuration.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(json).context(ParseSnafu)
    }

    /// Read a JSON configuration file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).context(ReadSnafu { path })?;
        Self::from_json_str(&text)
    }
}
