//! Ordered step histories and their compatibility rules.

use serde::{Deserialize, Serialize};
use std::fmt;

use super::step::PipelineStep;
use crate::errors::{EmptyChainError, InvalidChainError};

/// Everything that happened to produce an artifact, oldest step first.
///
/// Chains are linear and append-only: producing a new artifact from an
/// existing one yields `old + [new_step]`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineChain {
    steps: Vec<PipelineStep>,
}

/// Why two chains are not compatible; the first difference found.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Divergence {
    /// The chains have different lengths.
    Length {
        /// Length of the chain the current invocation would write.
        expected: usize,
        /// Length of the chain found in the existing output.
        existing: usize,
    },
    /// A different action ran at `index`.
    Action {
        /// Step index.
        index: usize,
        /// Expected action.
        expected: String,
        /// Recorded action.
        existing: String,
    },
    /// The same action ran with a different configuration.
    Configuration {
        /// Step index.
        index: usize,
        /// Action name.
        action: String,
        /// Expected configuration digest (short form).
        expected: String,
        /// Recorded configuration digest (short form).
        existing: String,
    },
    /// The same action consumed different inputs.
    Inputs {
        /// Step index.
        index: usize,
        /// Action name.
        action: String,
    },
}

impl Divergence {
    /// Step index of the divergence, if it is tied to one.
    #[must_use]
    pub fn step_index(&self) -> Option<usize> {
        match self {
            Self::Length { .. } => None,
            Self::Action { index, .. }
            | Self::Configuration { index, .. }
            | Self::Inputs { index, .. } => Some(*index),
        }
    }
}

impl fmt::Display for Divergence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Length { expected, existing } => write!(
                f,
                "existing output has {existing} step(s), this invocation would record {expected}"
            ),
            Self::Action { index, expected, existing } => write!(
                f,
                "step {index} ran '{existing}' but this invocation runs '{expected}'"
            ),
            Self::Configuration { index, action, expected, existing } => write!(
                f,
                "step {index} ('{action}') configuration differs: existing {existing}, requested {expected}"
            ),
            Self::Inputs { index, action } => write!(
                f,
                "step {index} ('{action}') consumed different input files"
            ),
        }
    }
}

/// A step whose configuration matches but whose tool version differs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionDrift {
    /// Step index.
    pub index: usize,
    /// Action name.
    pub action: String,
    /// Version recorded in the existing output.
    pub existing: String,
    /// Version the current invocation would record.
    pub expected: String,
}

impl PipelineChain {
    /// Creates an empty chain.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts a chain from its first step.
    #[must_use]
    pub fn initial(step: PipelineStep) -> Self {
        Self { steps: vec![step] }
    }

    /// Builds a chain from steps, validating each append.
    pub fn from_steps(steps: Vec<PipelineStep>) -> Result<Self, InvalidChainError> {
        steps
            .into_iter()
            .try_fold(Self::new(), |chain, step| chain.append(step))
    }

    /// Returns a new chain with `step` at the end.
    ///
    /// A non-initial step must declare the artifact it consumed.
    pub fn append(&self, step: PipelineStep) -> Result<Self, InvalidChainError> {
        let position = self.steps.len();
        if position > 0 && step.input_fingerprints.is_empty() {
            return Err(InvalidChainError::new(
                position,
                format!(
                    "step '{}' follows '{}' but declares no input files",
                    step.action_name, self.steps[position - 1].action_name
                ),
            ));
        }

        let mut steps = self.steps.clone();
        steps.push(step);
        Ok(Self { steps })
    }

    /// The most recent step.
    pub fn last_step(&self) -> Result<&PipelineStep, EmptyChainError> {
        self.steps.last().ok_or(EmptyChainError)
    }

    /// All steps, oldest first.
    #[must_use]
    pub fn steps(&self) -> &[PipelineStep] {
        &self.steps
    }

    /// Number of steps.
    #[must_use]
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// Returns true for a chain with no steps.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Finds the first reason `existing` cannot stand in for `self`.
    #[must_use]
    pub fn first_divergence(&self, existing: &Self) -> Option<Divergence> {
        if self.len() != existing.len() {
            return Some(Divergence::Length {
                expected: self.len(),
                existing: existing.len(),
            });
        }

        self.steps
            .iter()
            .zip(&existing.steps)
            .enumerate()
            .find_map(|(index, (want, have))| {
                if want.action_name != have.action_name {
                    Some(Divergence::Action {
                        index,
                        expected: want.action_name.clone(),
                        existing: have.action_name.clone(),
                    })
                } else if want.configuration != have.configuration {
                    Some(Divergence::Configuration {
                        index,
                        action: want.action_name.clone(),
                        expected: want.configuration.short_digest().to_string(),
                        existing: have.configuration.short_digest().to_string(),
                    })
                } else if want.input_fingerprints != have.input_fingerprints {
                    Some(Divergence::Inputs {
                        index,
                        action: want.action_name.clone(),
                    })
                } else {
                    None
                }
            })
    }

    /// Whether an artifact carrying `other` can be trusted in place of one
    /// this chain would produce.
    #[must_use]
    pub fn compatible_with(&self, other: &Self) -> bool {
        self.first_divergence(other).is_none()
    }

    /// Steps whose versions differ between the two chains, by position.
    #[must_use]
    pub fn version_drift(&self, existing: &Self) -> Vec<VersionDrift> {
        self.steps
            .iter()
            .zip(&existing.steps)
            .enumerate()
            .filter(|(_, (want, have))| want.version != have.version)
            .map(|(index, (want, have))| VersionDrift {
                index,
                action: want.action_name.clone(),
                existing: have.version.clone(),
                expected: want.version.clone(),
            })
            .collect()
    }
}

impl IntoIterator for PipelineChain {
    type Item = PipelineStep;
    type IntoIter = std::vec::IntoIter<PipelineStep>;

    fn into_iter(self) -> Self::IntoIter {
        self.steps.into_iter()
    }
}
