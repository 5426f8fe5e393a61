//! Advisory sink trait and implementations.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::{info, warn};

/// Severity of an advisory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdvisoryLevel {
    /// Informational only.
    Info,
    /// Something an operator should look at; never blocks the run.
    Warning,
}

/// A non-fatal message produced while evaluating an output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Advisory {
    /// Severity.
    pub level: AdvisoryLevel,
    /// The output the advisory concerns.
    pub path: PathBuf,
    /// Step index the advisory concerns, if any.
    pub step_index: Option<usize>,
    /// Message text.
    pub message: String,
}

impl Advisory {
    /// Creates an informational advisory.
    #[must_use]
    pub fn info(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self {
            level: AdvisoryLevel::Info,
            path: path.into(),
            step_index: None,
            message: message.into(),
        }
    }

    /// Creates a warning advisory.
    #[must_use]
    pub fn warning(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self {
            level: AdvisoryLevel::Warning,
            path: path.into(),
            step_index: None,
            message: message.into(),
        }
    }

    /// Attaches a step index.
    #[must_use]
    pub fn at_step(mut self, index: usize) -> Self {
        self.step_index = Some(index);
        self
    }
}

/// Receives advisories.
///
/// Implementations must not fail; anything that goes wrong while recording
/// an advisory is their own business.
pub trait AdvisorySink: Send + Sync {
    /// Emits an advisory.
    fn emit(&self, advisory: &Advisory);
}

/// Discards all advisories.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpAdvisorySink;

impl AdvisorySink for NoOpAdvisorySink {
    fn emit(&self, _advisory: &Advisory) {}
}

/// Logs advisories through `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingAdvisorySink;

impl AdvisorySink for LoggingAdvisorySink {
    fn emit(&self, advisory: &Advisory) {
        match advisory.level {
            AdvisoryLevel::Info => info!(
                path = %advisory.path.display(),
                step_index = ?advisory.step_index,
                "{}", advisory.message
            ),
            AdvisoryLevel::Warning => warn!(
                path = %advisory.path.display(),
                step_index = ?advisory.step_index,
                "{}", advisory.message
            ),
        }
    }
}

/// Stores advisories in memory, for tests and for front ends that render
/// them after the run.
#[derive(Debug, Default)]
pub struct CollectingAdvisorySink {
    advisories: RwLock<Vec<Advisory>>,
}

impl CollectingAdvisorySink {
    /// Creates an empty collector.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a copy of everything collected so far.
    #[must_use]
    pub fn advisories(&self) -> Vec<Advisory> {
        self.advisories.read().clone()
    }

    /// Returns the number of collected warnings.
    #[must_use]
    pub fn warning_count(&self) -> usize {
        self.advisories
            .read()
            .iter()
            .filter(|a| a.level == AdvisoryLevel::Warning)
            .count()
    }

    /// Clears the collector.
    pub fn clear(&self) {
        self.advisories.write().clear();
    }
}

impl AdvisorySink for CollectingAdvisorySink {
    fn emit(&self, advisory: &Advisory) {
        self.advisories.write().push(advisory.clone());
    }
}
