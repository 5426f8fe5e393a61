//! Configuration types for sorting, transforms and logging.
//!
//! Every field has a serde default, so partial JSON documents (or an empty
//! `{}`) load cleanly and unknown keys are ignored.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::errors::Result;

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvflowConfig {
    /// External sort settings.
    #[serde(default)]
    pub sort: SortConfig,
    /// Parallel transform settings.
    #[serde(default)]
    pub transform: TransformConfig,
    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl ProvflowConfig {
    /// Creates a configuration with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses a configuration from a JSON string.
    pub fn from_json_str(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Loads a configuration from a JSON file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    /// Sets the sort configuration.
    #[must_use]
    pub fn with_sort(mut self, sort: SortConfig) -> Self {
        self.sort = sort;
        self
    }

    /// Sets the transform configuration.
    #[must_use]
    pub fn with_transform(mut self, transform: TransformConfig) -> Self {
        self.transform = transform;
        self
    }

    /// Sets the logging configuration.
    #[must_use]
    pub fn with_logging(mut self, logging: LoggingConfig) -> Self {
        self.logging = logging;
        self
    }
}

/// Configuration for the out-of-core sorter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SortConfig {
    /// Minimum number of records held in memory before a run is spilled.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    /// Upper bound for the adaptive chunk size.
    #[serde(default = "default_max_chunk_size")]
    pub max_chunk_size: usize,
    /// Directory for spill arenas; the system temp dir when unset.
    #[serde(default)]
    pub temp_dir: Option<PathBuf>,
}

fn default_chunk_size() -> usize {
    16_384
}

fn default_max_chunk_size() -> usize {
    1_048_576
}

impl Default for SortConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            max_chunk_size: default_max_chunk_size(),
            temp_dir: None,
        }
    }
}

impl SortConfig {
    /// Sets the base chunk size.
    #[must_use]
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    /// Sets the maximum chunk size.
    #[must_use]
    pub fn with_max_chunk_size(mut self, max_chunk_size: usize) -> Self {
        self.max_chunk_size = max_chunk_size.max(1);
        self
    }

    /// Sets the spill directory.
    #[must_use]
    pub fn with_temp_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.temp_dir = Some(dir.into());
        self
    }

    /// Chooses a run size for `total` records: an eighth of the input,
    /// clamped to `[chunk_size, max_chunk_size]`.
    #[must_use]
    pub fn chunk_size_for(&self, total: u64) -> usize {
        let eighth = usize::try_from(total / 8).unwrap_or(usize::MAX);
        let floor = self.chunk_size.max(1);
        eighth.max(floor).min(self.max_chunk_size.max(floor))
    }
}

/// Configuration for order-preserving parallel transforms.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransformConfig {
    /// Maximum number of records being transformed or waiting for
    /// re-sequencing at once.
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,
}

fn default_max_in_flight() -> usize {
    std::thread::available_parallelism().map_or(4, |n| n.get() * 4)
}

impl Default for TransformConfig {
    fn default() -> Self {
        Self {
            max_in_flight: default_max_in_flight(),
        }
    }
}

impl TransformConfig {
    /// Sets the in-flight cap.
    #[must_use]
    pub fn with_max_in_flight(mut self, max_in_flight: usize) -> Self {
        self.max_in_flight = max_in_flight.max(1);
        self
    }
}

/// Configuration for log output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// `EnvFilter` directive; `RUST_LOG` takes precedence when set.
    #[serde(default = "default_filter")]
    pub filter: String,
    /// Emit JSON lines instead of human-readable output.
    #[serde(default)]
    pub json: bool,
}

fn default_filter() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: default_filter(),
            json: false,
        }
    }
}

impl LoggingConfig {
    /// Sets the filter directive.
    #[must_use]
    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = filter.into();
        self
    }

    /// Enables or disables JSON output.
    #[must_use]
    pub fn with_json(mut self, json: bool) -> Self {
        self.json = json;
        self
    }
}
