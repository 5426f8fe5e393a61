//! The provenance gate.
//!
//! Decides, once per output target, whether an invocation may reuse the
//! existing output, must (re)write it, or has to stop with a diagnostic. The
//! gate never touches the filesystem beyond reading the existing chain; the
//! caller executes the returned [`Outcome`].

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

use super::chain::{Divergence, PipelineChain};
use crate::errors::{CorruptArtifactError, IncompatibleProvenanceError, ProvflowError};
use crate::events::{Advisory, AdvisorySink, LoggingAdvisorySink};

/// How the caller wants existing outputs treated.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateMode {
    /// Never overwrite and never silently reuse.
    #[default]
    Default,
    /// Skip the step when the existing output is compatible.
    ReuseIfValid,
    /// Always recompute.
    ForceOverwrite,
    /// Skip when compatible, overwrite otherwise.
    OverwriteIfRequired,
}

impl GateMode {
    /// Command-line flag that selects this mode.
    #[must_use]
    pub fn flag(self) -> Option<&'static str> {
        match self {
            Self::Default => None,
            Self::ReuseIfValid => Some("--reuse-if-valid"),
            Self::ForceOverwrite => Some("--force-overwrite"),
            Self::OverwriteIfRequired => Some("--overwrite-if-required"),
        }
    }

    fn overwrites_unusable(self) -> bool {
        matches!(self, Self::ForceOverwrite | Self::OverwriteIfRequired)
    }
}

/// What was found at the output path.
#[derive(Debug, Clone)]
pub enum ExistingOutput {
    /// Nothing there.
    Missing,
    /// A file whose provenance cannot be established.
    Unreadable(CorruptArtifactError),
    /// A file with a readable chain.
    Present(PipelineChain),
}

impl ExistingOutput {
    /// Inspects `path`.
    ///
    /// Never fails: read and parse errors, as well as files without any
    /// chain header, are reported as [`ExistingOutput::Unreadable`].
    pub fn probe(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        if !path.exists() {
            return Self::Missing;
        }
        match PipelineChain::read_from(path) {
            Ok(Some(chain)) => Self::Present(chain),
            Ok(None) => Self::Unreadable(CorruptArtifactError::new(
                path,
                "file exists but carries no provenance header",
            )),
            Err(ProvflowError::CorruptArtifact(e)) => Self::Unreadable(e),
            Err(e) => Self::Unreadable(CorruptArtifactError::new(path, e.to_string())),
        }
    }
}

/// Which situation the gate recognised.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateState {
    /// No output exists yet.
    NoExistingOutput,
    /// The output exists but its chain cannot be read.
    ChainUnreadable,
    /// The output was produced by a different pipeline.
    Incompatible,
    /// The output was produced by an equivalent pipeline.
    Compatible,
}

impl fmt::Display for GateState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::NoExistingOutput => "no_existing_output",
            Self::ChainUnreadable => "chain_unreadable",
            Self::Incompatible => "incompatible",
            Self::Compatible => "compatible",
        };
        f.write_str(name)
    }
}

/// Everything an operator needs to resolve a blocked run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GateFailure {
    /// Situation that blocked the run.
    pub state: GateState,
    /// The output path.
    pub path: PathBuf,
    /// First divergent step, when the chains differ at a specific step.
    pub step_index: Option<usize>,
    /// Action this invocation would record at `step_index`.
    pub expected_action: Option<String>,
    /// Action recorded in the existing output at `step_index`.
    pub existing_action: Option<String>,
    /// Configuration digest this invocation would record at `step_index`.
    pub expected_configuration: Option<String>,
    /// Configuration digest recorded at `step_index`.
    pub existing_configuration: Option<String>,
    /// What is wrong.
    pub detail: String,
    /// How to get past it.
    pub resolution: String,
}

impl GateFailure {
    fn new(state: GateState, path: &Path, detail: String, resolution: String) -> Self {
        Self {
            state,
            path: path.to_path_buf(),
            step_index: None,
            expected_action: None,
            existing_action: None,
            expected_configuration: None,
            existing_configuration: None,
            detail,
            resolution,
        }
    }

    fn at_step(mut self, index: usize, expected: &PipelineChain, existing: &PipelineChain) -> Self {
        let want = expected.steps().get(index);
        let have = existing.steps().get(index);
        self.step_index = Some(index);
        self.expected_action = want.map(|s| s.action_name.clone());
        self.existing_action = have.map(|s| s.action_name.clone());
        self.expected_configuration = want.map(|s| s.configuration.short_digest().to_string());
        self.existing_configuration = have.map(|s| s.configuration.short_digest().to_string());
        self
    }

    /// Converts the failure into the matching error.
    #[must_use]
    pub fn into_error(self) -> ProvflowError {
        match self.state {
            GateState::ChainUnreadable => CorruptArtifactError::new(
                self.path,
                format!("{}. {}", self.detail, self.resolution),
            )
            .into(),
            _ => IncompatibleProvenanceError {
                path: self.path,
                step_index: self.step_index,
                expected_action: self.expected_action,
                existing_action: self.existing_action,
                detail: self.detail,
                resolution: self.resolution,
            }
            .into(),
        }
    }
}

impl fmt::Display for GateFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}): {}. {}", self.path.display(), self.state, self.detail, self.resolution)
    }
}

/// What the caller must do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Run the step and write a fresh output.
    Proceed,
    /// Run the step and replace the existing output.
    ProceedOverwrite,
    /// Keep the existing output; do not run the step.
    Skip,
    /// Stop.
    Fail(GateFailure),
}

impl Outcome {
    /// Whether the step body must run.
    #[must_use]
    pub fn should_run(&self) -> bool {
        matches!(self, Self::Proceed | Self::ProceedOverwrite)
    }

    fn label(&self) -> &'static str {
        match self {
            Self::Proceed => "proceed",
            Self::ProceedOverwrite => "proceed_overwrite",
            Self::Skip => "skip",
            Self::Fail(_) => "fail",
        }
    }
}

/// A gate verdict together with how it was reached.
#[derive(Debug, Clone)]
pub struct Decision {
    /// Recognised situation.
    pub state: GateState,
    /// What to do.
    pub outcome: Outcome,
    /// Advisories emitted while deciding.
    pub advisories: Vec<Advisory>,
}

/// Decides what to do with one output target.
#[derive(Clone)]
pub struct ProvenanceGate {
    path: PathBuf,
    sink: Arc<dyn AdvisorySink>,
}

impl fmt::Debug for ProvenanceGate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProvenanceGate").field("path", &self.path).finish_non_exhaustive()
    }
}

impl ProvenanceGate {
    /// Creates a gate for `path`. Advisories go to the log by default.
    #[must_use]
    pub fn for_output(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            sink: Arc::new(LoggingAdvisorySink),
        }
    }

    /// Sets the advisory sink.
    #[must_use]
    pub fn with_sink(mut self, sink: Arc<dyn AdvisorySink>) -> Self {
        self.sink = sink;
        self
    }

    /// The output path this gate guards.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Decides on an already-probed output.
    pub fn decide(&self, existing: &ExistingOutput, expected: &PipelineChain, mode: GateMode) -> Outcome {
        self.judge(existing, expected, mode).outcome
    }

    /// Probes the output path and decides.
    pub fn evaluate(&self, expected: &PipelineChain, mode: GateMode) -> Decision {
        let existing = ExistingOutput::probe(&self.path);
        self.judge(&existing, expected, mode)
    }

    fn judge(&self, existing: &ExistingOutput, expected: &PipelineChain, mode: GateMode) -> Decision {
        let mut advisories = Vec::new();
        let (state, outcome) = match existing {
            ExistingOutput::Missing => (GateState::NoExistingOutput, Outcome::Proceed),
            ExistingOutput::Unreadable(cause) => {
                let state = GateState::ChainUnreadable;
                if mode.overwrites_unusable() {
                    advisories.push(Advisory::warning(
                        &self.path,
                        format!("Overwriting output with unreadable provenance: {}", cause.reason),
                    ));
                    (state, Outcome::ProceedOverwrite)
                } else {
                    let failure = GateFailure::new(
                        state,
                        &self.path,
                        format!("existing output has unreadable provenance ({})", cause.reason),
                        "Use --force-overwrite to replace it".to_string(),
                    );
                    (state, Outcome::Fail(failure))
                }
            }
            ExistingOutput::Present(recorded) => match expected.first_divergence(recorded) {
                Some(divergence) => {
                    let state = GateState::Incompatible;
                    if mode.overwrites_unusable() {
                        let mut advisory = Advisory::info(
                            &self.path,
                            format!("Overwriting incompatible output: {divergence}"),
                        );
                        if let Some(index) = divergence.step_index() {
                            advisory = advisory.at_step(index);
                        }
                        advisories.push(advisory);
                        (state, Outcome::ProceedOverwrite)
                    } else {
                        (state, Outcome::Fail(self.incompatible(&divergence, expected, recorded)))
                    }
                }
                None => {
                    let state = GateState::Compatible;
                    match mode {
                        GateMode::ForceOverwrite => (state, Outcome::ProceedOverwrite),
                        GateMode::ReuseIfValid | GateMode::OverwriteIfRequired => {
                            advisories.extend(expected.version_drift(recorded).into_iter().map(
                                |drift| {
                                    Advisory::warning(
                                        &self.path,
                                        format!(
                                            "Step '{}' was produced by version {} (current {})",
                                            drift.action, drift.existing, drift.expected
                                        ),
                                    )
                                    .at_step(drift.index)
                                },
                            ));
                            (state, Outcome::Skip)
                        }
                        GateMode::Default => {
                            let failure = GateFailure::new(
                                state,
                                &self.path,
                                "output already exists and matches this invocation".to_string(),
                                "Use --reuse-if-valid to keep it or --force-overwrite to recompute it"
                                    .to_string(),
                            );
                            (state, Outcome::Fail(failure))
                        }
                    }
                }
            },
        };

        for advisory in &advisories {
            self.sink.emit(advisory);
        }
        info!(
            path = %self.path.display(),
            state = %state,
            mode = ?mode,
            outcome = outcome.label(),
            "Provenance gate decided"
        );

        Decision { state, outcome, advisories }
    }

    fn incompatible(
        &self,
        divergence: &Divergence,
        expected: &PipelineChain,
        recorded: &PipelineChain,
    ) -> GateFailure {
        let failure = GateFailure::new(
            GateState::Incompatible,
            &self.path,
            divergence.to_string(),
            "Use --force-overwrite or --overwrite-if-required to recompute it".to_string(),
        );
        match divergence.step_index() {
            Some(index) => failure.at_step(index, expected, recorded),
            None => failure,
        }
    }
}
