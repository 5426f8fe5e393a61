//! A single recorded pipeline step.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::errors::Result;
use crate::fingerprint::{ConfigurationFingerprint, InputFingerprint, StepConfiguration};

/// Version stamped on every step this build records.
pub const TOOL_VERSION: &str = env!("CARGO_PKG_VERSION");

/// One entry in an artifact's history.
///
/// Created once, right before the action runs and before any output bytes
/// are written; never modified afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineStep {
    /// Name of the action that ran.
    pub action_name: String,
    /// Tool version that ran it.
    pub version: String,
    /// What the action was configured to do.
    pub configuration: ConfigurationFingerprint,
    /// What the action consumed, in argument order.
    #[serde(default)]
    pub input_fingerprints: Vec<InputFingerprint>,
    /// When the step was recorded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recorded_at: Option<DateTime<Utc>>,
}

impl PipelineStep {
    /// Creates a step from already-computed parts.
    #[must_use]
    pub fn new(
        action_name: impl Into<String>,
        version: impl Into<String>,
        configuration: ConfigurationFingerprint,
        input_fingerprints: Vec<InputFingerprint>,
    ) -> Self {
        Self {
            action_name: action_name.into(),
            version: version.into(),
            configuration,
            input_fingerprints,
            recorded_at: None,
        }
    }

    /// Records a step for `configuration` about to consume `inputs`,
    /// stamped with this build's version and the current time.
    pub fn capture<C, P>(configuration: &C, inputs: &[P]) -> Result<Self>
    where
        C: StepConfiguration + ?Sized,
        P: AsRef<Path>,
    {
        let input_fingerprints = inputs
            .iter()
            .map(InputFingerprint::capture)
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            action_name: configuration.action_name(),
            version: TOOL_VERSION.to_string(),
            configuration: configuration.fingerprint()?,
            input_fingerprints,
            recorded_at: Some(Utc::now()),
        })
    }

    /// Sets the version.
    #[must_use]
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    /// Whether the existing output of `other` can stand in for this step.
    ///
    /// Versions and timestamps are deliberately ignored.
    #[must_use]
    pub fn compatible_with(&self, other: &Self) -> bool {
        self.action_name == other.action_name
            && self.configuration == other.configuration
            && self.input_fingerprints == other.input_fingerprints
    }
}
